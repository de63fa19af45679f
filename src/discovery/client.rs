//! Engine API client.
//!
//! # Responsibilities
//! - Connect over a unix socket or TCP (`unix://`, `tcp://`, `http://`)
//! - Negotiate the API version once per connection run
//! - Issue JSON GET requests with an optional per-request timeout
//! - Stream newline-delimited engine events
//!
//! # Design Decisions
//! - HTTP/1.1 via hyper's connection-level API; one connection per request
//! - The event stream is never subject to the request timeout
//! - TLS endpoints are not supported

use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use hyper::body::{Body as _, Bytes, Incoming};
use hyper::client::conn::http1;
use hyper::header::{HOST, USER_AGENT};
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use url::Url;

use crate::discovery::api::{EventMessage, Version};
use crate::discovery::BackendError;

const DEFAULT_TCP_PORT: u16 = 2375;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    fn parse(raw: &str) -> Result<Self, BackendError> {
        let url = Url::parse(raw).map_err(|_| BackendError::InvalidEndpoint(raw.to_string()))?;
        match url.scheme() {
            "unix" => Ok(Endpoint::Unix(PathBuf::from(url.path()))),
            "tcp" | "http" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| BackendError::InvalidEndpoint(raw.to_string()))?;
                let port = url.port().unwrap_or(DEFAULT_TCP_PORT);
                Ok(Endpoint::Tcp(format!("{host}:{port}")))
            }
            _ => Err(BackendError::InvalidEndpoint(raw.to_string())),
        }
    }
}

/// Client for one engine endpoint.
#[derive(Debug, Clone)]
pub struct DockerClient {
    endpoint: Endpoint,
    raw_endpoint: String,
    api_version: Option<String>,
    timeout: Option<Duration>,
}

impl DockerClient {
    /// Create a client. No connection is made until the first request.
    pub fn new(endpoint: &str, timeout: Option<Duration>) -> Result<Self, BackendError> {
        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
            raw_endpoint: endpoint.to_string(),
            api_version: None,
            timeout,
        })
    }

    /// Query the engine version and pin the API version for later requests.
    pub async fn negotiate(&mut self) -> Result<Version, BackendError> {
        let version: Version = self.get_json("/version").await?;
        self.api_version = Some(version.api_version.clone());
        Ok(version)
    }

    /// GET a JSON document.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let request = async {
            let response = self.send(path).await?;
            let status = response.status();
            let body = read_body(response.into_body()).await?;
            if !status.is_success() {
                return Err(status_error(path, status.as_u16(), &body));
            }
            serde_json::from_slice(&body).map_err(|source| BackendError::Json {
                path: path.to_string(),
                source,
            })
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| BackendError::Timeout(path.to_string()))?,
            None => request.await,
        }
    }

    /// Subscribe to engine events matching the JSON `filters`.
    pub async fn events(
        &self,
        filters: &str,
    ) -> Result<BoxStream<'static, Result<EventMessage, BackendError>>, BackendError> {
        let path = format!("/events?filters={}", url_encode(filters));
        let response = self.send(&path).await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_body(response.into_body()).await?;
            return Err(status_error(&path, status.as_u16(), &body));
        }

        let state = (response.into_body(), Vec::<u8>::new());
        let events = stream::unfold(state, |(mut body, mut buf)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    let line = line.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }
                    let event = serde_json::from_slice::<EventMessage>(line).map_err(|source| {
                        BackendError::Json {
                            path: "/events".to_string(),
                            source,
                        }
                    });
                    return Some((event, (body, buf)));
                }

                match next_chunk(&mut body).await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => return Some((Err(BackendError::from(e)), (body, buf))),
                    None => return None,
                }
            }
        });

        Ok(events.boxed())
    }

    fn versioned(&self, path: &str) -> String {
        match &self.api_version {
            Some(version) => format!("/v{version}{path}"),
            None => path.to_string(),
        }
    }

    async fn send(&self, path: &str) -> Result<Response<Incoming>, BackendError> {
        let request = Request::builder()
            .method("GET")
            .uri(self.versioned(path))
            .header(HOST, "docker")
            .header(USER_AGENT, concat!("proxy-discovery/", env!("CARGO_PKG_VERSION")))
            .body(String::new())?;

        match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(socket) => {
                let stream = tokio::net::UnixStream::connect(socket)
                    .await
                    .map_err(|source| self.connect_error(source))?;
                exchange(stream, request).await
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(BackendError::InvalidEndpoint(self.raw_endpoint.clone())),
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|source| self.connect_error(source))?;
                exchange(stream, request).await
            }
        }
    }

    fn connect_error(&self, source: std::io::Error) -> BackendError {
        BackendError::Connect {
            endpoint: self.raw_endpoint.clone(),
            source,
        }
    }
}

async fn exchange<S>(stream: S, request: Request<String>) -> Result<Response<Incoming>, BackendError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(error = %e, "Engine connection closed with error");
        }
    });
    Ok(sender.send_request(request).await?)
}

async fn next_chunk(body: &mut Incoming) -> Option<Result<Bytes, hyper::Error>> {
    loop {
        let frame = std::future::poll_fn(|cx| Pin::new(&mut *body).poll_frame(cx)).await?;
        match frame {
            Ok(frame) => {
                // Trailers carry no payload.
                if let Ok(data) = frame.into_data() {
                    return Some(Ok(data));
                }
            }
            Err(e) => return Some(Err(e)),
        }
    }
}

async fn read_body(mut body: Incoming) -> Result<Vec<u8>, BackendError> {
    let mut out = Vec::new();
    while let Some(chunk) = next_chunk(&mut body).await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}

fn status_error(path: &str, status: u16, body: &[u8]) -> BackendError {
    #[derive(serde::Deserialize)]
    struct EngineMessage {
        message: String,
    }

    let message = serde_json::from_slice::<EngineMessage>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());

    BackendError::Status {
        path: path.to_string(),
        status,
        message,
    }
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_endpoint_parse() {
        assert_eq!(
            Endpoint::parse("unix:///var/run/docker.sock").unwrap(),
            Endpoint::Unix(PathBuf::from("/var/run/docker.sock"))
        );
        assert_eq!(
            Endpoint::parse("tcp://10.0.0.1:2376").unwrap(),
            Endpoint::Tcp("10.0.0.1:2376".into())
        );
        assert_eq!(
            Endpoint::parse("http://docker").unwrap(),
            Endpoint::Tcp("docker:2375".into())
        );
        assert!(Endpoint::parse("npipe:////./pipe/docker_engine").is_err());
        assert!(Endpoint::parse("not a url").is_err());
    }

    /// Serve one canned HTTP response per accepted connection.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("tcp://{addr}")
    }

    #[tokio::test]
    async fn test_negotiate_and_version_prefix() {
        let body = r#"{"Version":"24.0.7","ApiVersion":"1.43"}"#;
        let response = Box::leak(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let endpoint = serve_once(response).await;

        let mut client = DockerClient::new(&endpoint, Some(Duration::from_secs(5))).unwrap();
        let version = client.negotiate().await.unwrap();
        assert_eq!(version.api_version, "1.43");
        assert_eq!(client.versioned("/containers/json"), "/v1.43/containers/json");
    }

    #[tokio::test]
    async fn test_error_status_carries_engine_message() {
        let body = r#"{"message":"client version too new"}"#;
        let response = Box::leak(
            format!(
                "HTTP/1.1 400 Bad Request\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_boxed_str(),
        );
        let endpoint = serve_once(response).await;

        let client = DockerClient::new(&endpoint, None).unwrap();
        let err = client.get_json::<Version>("/version").await.unwrap_err();
        match err {
            BackendError::Status { status, message, .. } => {
                assert_eq!(status, 400);
                assert_eq!(message, "client version too new");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_event_stream_splits_lines() {
        let response = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n\
            {\"Type\":\"container\",\"Action\":\"start\",\"Actor\":{\"ID\":\"a1\"}}\n\
            {\"Type\":\"container\",\"Action\":\"die\",\"Actor\":{\"ID\":\"b2\"}}\n";
        let endpoint = serve_once(response).await;

        let client = DockerClient::new(&endpoint, None).unwrap();
        let events: Vec<_> = client
            .events(r#"{"type":["container"]}"#)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        let first = events[0].as_ref().unwrap();
        assert_eq!(first.action, "start");
        assert_eq!(first.actor.id, "a1");
        assert_eq!(events[1].as_ref().unwrap().action, "die");
    }

    #[tokio::test]
    async fn test_connection_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = DockerClient::new(&format!("tcp://{addr}"), None).unwrap();
        let err = client.get_json::<Version>("/version").await.unwrap_err();
        assert!(matches!(err, BackendError::Connect { .. }));
    }
}
