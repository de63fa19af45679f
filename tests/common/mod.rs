//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use proxy_discovery::discovery::{
    Backend, BackendError, ChangeEvent, ChangeSource, Connector, EntityRecord, EventStream,
    ExposedPort, ExtraConf, NetworkAttachment, NetworkInfo, NetworkMode, Snapshot,
};
use proxy_discovery::provider::normalize;

/// A running entity on the default bridge network.
pub fn entity(name: &str, address: &str, ports: &[&str], labels: &[(&str, &str)]) -> EntityRecord {
    EntityRecord {
        id: format!("{}-id", name.to_lowercase()),
        service_name: normalize(name),
        name: name.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        network: NetworkInfo {
            mode: NetworkMode::Bridge,
            ports: ports
                .iter()
                .filter_map(|p| ExposedPort::parse(p, vec![]))
                .collect(),
            networks: HashMap::from([(
                "bridge".to_string(),
                NetworkAttachment {
                    id: "bridge-id".to_string(),
                    address: address.to_string(),
                },
            )]),
        },
        extra: ExtraConf {
            enable: true,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Shared state behind a [`FakeConnector`] and the backends it creates.
pub struct FakeEngine {
    entities: Mutex<Vec<EntityRecord>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<Result<ChangeEvent, BackendError>>>>,
    source: ChangeSource,
    failing_connects: AtomicU32,
    pub connects: AtomicU32,
    pub listings: AtomicU32,
}

impl FakeEngine {
    pub fn set_entities(&self, entities: Vec<EntityRecord>) {
        *self.entities.lock().unwrap() = entities;
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }
}

/// A connector that never touches the network.
#[derive(Clone)]
pub struct FakeConnector {
    pub engine: Arc<FakeEngine>,
}

impl FakeConnector {
    /// Event-driven engine. The returned sender feeds the event stream of
    /// the first backend that subscribes.
    pub fn with_events(
        entities: Vec<EntityRecord>,
    ) -> (Self, mpsc::UnboundedSender<Result<ChangeEvent, BackendError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(entities, ChangeSource::Events, Some(rx)), tx)
    }

    /// Polled engine.
    pub fn polled(entities: Vec<EntityRecord>, period: std::time::Duration) -> Self {
        Self::new(entities, ChangeSource::Poll(period), None)
    }

    fn new(
        entities: Vec<EntityRecord>,
        source: ChangeSource,
        events: Option<mpsc::UnboundedReceiver<Result<ChangeEvent, BackendError>>>,
    ) -> Self {
        Self {
            engine: Arc::new(FakeEngine {
                entities: Mutex::new(entities),
                events: Mutex::new(events),
                source,
                failing_connects: AtomicU32::new(0),
                connects: AtomicU32::new(0),
                listings: AtomicU32::new(0),
            }),
        }
    }
}

impl Connector for FakeConnector {
    type Backend = FakeBackend;

    async fn connect(&self) -> Result<FakeBackend, BackendError> {
        self.engine.connects.fetch_add(1, Ordering::SeqCst);
        let failing = self.engine.failing_connects.load(Ordering::SeqCst);
        if failing > 0 {
            self.engine.failing_connects.store(failing - 1, Ordering::SeqCst);
            return Err(BackendError::Connect {
                endpoint: "fake://engine".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            });
        }
        Ok(FakeBackend {
            engine: self.engine.clone(),
        })
    }
}

pub struct FakeBackend {
    engine: Arc<FakeEngine>,
}

impl Backend for FakeBackend {
    async fn list_entities(&self) -> Result<Snapshot, BackendError> {
        self.engine.listings.fetch_add(1, Ordering::SeqCst);
        Ok(Snapshot::new(self.engine.entities.lock().unwrap().clone()))
    }

    fn change_source(&self) -> ChangeSource {
        self.engine.source
    }

    async fn subscribe(&self) -> Result<EventStream, BackendError> {
        let rx = self
            .engine
            .events
            .lock()
            .unwrap()
            .take()
            .ok_or(BackendError::StreamClosed)?;
        let events = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(events.boxed())
    }
}

pub fn start_event(id: &str) -> Result<ChangeEvent, BackendError> {
    Ok(ChangeEvent {
        action: "start".to_string(),
        entity_id: id.to_string(),
    })
}

/// Start a mock engine API answering GET requests from a path → JSON table.
/// Paths are matched after stripping any `/v<api>` prefix and query string.
pub async fn start_mock_engine(routes: HashMap<&'static str, String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let routes = routes.clone();
                    tokio::spawn(async move {
                        let mut buf = vec![0u8; 4096];
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        let request = String::from_utf8_lossy(&buf[..n]);
                        let path = request.split_whitespace().nth(1).unwrap_or("/");
                        let path = path.split('?').next().unwrap_or(path);
                        let path = strip_version(path);

                        let response = match routes.get(path) {
                            Some(body) => format!(
                                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                body.len(),
                                body
                            ),
                            None => {
                                let body = format!(r#"{{"message":"no such path {path}"}}"#);
                                format!(
                                    "HTTP/1.1 404 Not Found\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                                    body.len(),
                                    body
                                )
                            }
                        };
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    format!("tcp://{addr}")
}

fn strip_version(path: &str) -> &str {
    match path.strip_prefix("/v") {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => {
            rest.find('/').map_or(path, |i| &rest[i..])
        }
        _ => path,
    }
}
