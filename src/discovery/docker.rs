//! Standalone container adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use crate::config::ProviderOptions;
use crate::discovery::api::{ContainerInspect, ContainerSummary, PortBindingJson};
use crate::discovery::client::DockerClient;
use crate::discovery::{
    logical_service_name, Backend, BackendError, ChangeEvent, ChangeSource, Connector,
    EntityRecord, EventStream, ExposedPort, ExtraConf, HealthState, NetworkAttachment,
    NetworkInfo, NetworkMode, PortBinding, Snapshot,
};

const EVENT_FILTERS: &str = r#"{"type":["container"]}"#;

/// Creates a connected [`DockerBackend`] per run.
#[derive(Debug, Clone)]
pub struct DockerConnector {
    options: Arc<ProviderOptions>,
}

impl DockerConnector {
    pub fn new(options: Arc<ProviderOptions>) -> Self {
        Self { options }
    }
}

impl Connector for DockerConnector {
    type Backend = DockerBackend;

    async fn connect(&self) -> Result<DockerBackend, BackendError> {
        let timeout = match self.options.http_client_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let mut client = DockerClient::new(&self.options.endpoint, timeout)?;
        let version = client.negotiate().await?;
        tracing::debug!(
            endpoint = %self.options.endpoint,
            version = %version.version,
            api_version = %version.api_version,
            "Connected to container engine"
        );
        Ok(DockerBackend {
            client,
            options: self.options.clone(),
        })
    }
}

/// Lists running containers and follows engine events.
#[derive(Debug)]
pub struct DockerBackend {
    client: DockerClient,
    options: Arc<ProviderOptions>,
}

impl DockerBackend {
    async fn inspect(&self, id: &str) -> Result<ContainerInspect, BackendError> {
        self.client.get_json(&format!("/containers/{id}/json")).await
    }
}

impl Backend for DockerBackend {
    async fn list_entities(&self) -> Result<Snapshot, BackendError> {
        let summaries: Vec<ContainerSummary> = self.client.get_json("/containers/json").await?;

        let mut entities = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let inspect = match self.inspect(&summary.id).await {
                Ok(inspect) => inspect,
                Err(e @ (BackendError::Status { .. } | BackendError::Json { .. })) => {
                    tracing::warn!(container = %summary.id, error = %e, "Skip container: unable to inspect it");
                    continue;
                }
                Err(e) => return Err(e),
            };
            // Only running containers have addresses.
            if !inspect.state.as_ref().is_some_and(|s| s.running) {
                continue;
            }
            if let Some(record) = container_record(inspect, &self.options) {
                entities.push(record);
            }
        }

        let mut peers = Vec::new();
        for entity in &entities {
            let NetworkMode::AttachedTo(reference) = &entity.network.mode else {
                continue;
            };
            let known = entities
                .iter()
                .chain(peers.iter())
                .any(|e: &EntityRecord| &e.id == reference || &e.name == reference);
            if known {
                continue;
            }
            match self.inspect(reference).await {
                Ok(inspect) => {
                    if let Some(peer) = container_record(inspect, &self.options) {
                        peers.push(peer);
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        container = %entity.name,
                        peer = %reference,
                        error = %e,
                        "Unable to inspect network namespace owner"
                    );
                }
            }
        }

        Ok(Snapshot { entities, peers })
    }

    fn change_source(&self) -> ChangeSource {
        ChangeSource::Events
    }

    async fn subscribe(&self) -> Result<EventStream, BackendError> {
        let events = self.client.events(EVENT_FILTERS).await?;
        let relevant = events.filter_map(|event| async move {
            match event {
                Ok(event) if is_relevant(&event.kind, &event.action) => Some(Ok(ChangeEvent {
                    action: event.action,
                    entity_id: event.actor.id,
                })),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            }
        });
        Ok(relevant.boxed())
    }
}

fn is_relevant(kind: &str, action: &str) -> bool {
    kind == "container"
        && (action == "start" || action == "die" || action.starts_with("health_status"))
}

/// Normalize an inspected container. Returns `None` when its control labels
/// cannot be decoded.
pub fn container_record(inspect: ContainerInspect, options: &ProviderOptions) -> Option<EntityRecord> {
    let name = inspect.name.trim_start_matches('/').to_string();
    let labels = inspect
        .config
        .and_then(|c| c.labels)
        .unwrap_or_default();

    let extra = match ExtraConf::from_labels(&labels, options) {
        Ok(extra) => extra,
        Err(e) => {
            tracing::error!(container = %name, error = %e, "Skip container: invalid control labels");
            return None;
        }
    };

    let health = inspect
        .state
        .and_then(|s| s.health)
        .map(|h| HealthState::from_status(&h.status))
        .unwrap_or_default();

    let mode = inspect
        .host_config
        .map(|h| NetworkMode::parse(&h.network_mode))
        .unwrap_or_default();

    let settings = inspect.network_settings.unwrap_or_default();
    let ports = settings
        .ports
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(key, bindings)| {
            let bindings: Vec<PortBindingJson> = serde_json::from_value(bindings).unwrap_or_default();
            let bindings = bindings
                .into_iter()
                .map(|b| PortBinding {
                    host_ip: b.host_ip,
                    host_port: b.host_port,
                })
                .collect();
            ExposedPort::parse(&key, bindings)
        })
        .collect();

    let networks: HashMap<String, NetworkAttachment> = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .map(|(net_name, endpoint)| {
            (
                net_name,
                NetworkAttachment {
                    id: endpoint.network_id,
                    address: endpoint.ip_address,
                },
            )
        })
        .collect();

    let node_address = inspect.node.map(|n| n.ip).filter(|ip| !ip.is_empty());

    Some(EntityRecord {
        id: inspect.id,
        service_name: logical_service_name(&name, &labels),
        name,
        labels,
        network: NetworkInfo {
            mode,
            ports,
            networks,
        },
        health,
        node_address,
        extra,
    })
}
