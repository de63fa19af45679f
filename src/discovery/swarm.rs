//! Cluster service adapter.
//!
//! Services are expanded into their running tasks unless they use a virtual
//! IP and opt into cluster load balancing (`<prefix>.docker.lbswarm=true`),
//! in which case the service itself is a single entity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderOptions;
use crate::discovery::api::{NetworkResource, SwarmNode, SwarmService, Task, strip_cidr};
use crate::discovery::client::DockerClient;
use crate::discovery::{
    logical_service_name, Backend, BackendError, ChangeSource, Connector, EntityRecord,
    EventStream, ExposedPort, ExtraConf, NetworkAttachment, NetworkInfo, NetworkMode,
    PortBinding, Snapshot,
};

#[derive(Debug, Clone)]
pub struct SwarmConnector {
    options: Arc<ProviderOptions>,
    refresh: Duration,
}

impl SwarmConnector {
    pub fn new(options: Arc<ProviderOptions>, refresh: Duration) -> Self {
        Self { options, refresh }
    }
}

impl Connector for SwarmConnector {
    type Backend = SwarmBackend;

    async fn connect(&self) -> Result<SwarmBackend, BackendError> {
        let timeout = match self.options.http_client_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let mut client = DockerClient::new(&self.options.endpoint, timeout)?;
        let version = client.negotiate().await?;
        tracing::debug!(
            endpoint = %self.options.endpoint,
            version = %version.version,
            "Connected to cluster manager"
        );
        Ok(SwarmBackend {
            client,
            options: self.options.clone(),
            refresh: self.refresh,
        })
    }
}

/// Lists cluster services and their tasks. Polled, never streamed.
#[derive(Debug)]
pub struct SwarmBackend {
    client: DockerClient,
    options: Arc<ProviderOptions>,
    refresh: Duration,
}

impl SwarmBackend {
    async fn tasks(&self, service_id: &str) -> Result<Vec<Task>, BackendError> {
        let filters = format!(r#"{{"service":{{"{service_id}":true}},"desired-state":{{"running":true}}}}"#);
        let path = format!(
            "/tasks?filters={}",
            url::form_urlencoded::byte_serialize(filters.as_bytes()).collect::<String>()
        );
        self.client.get_json(&path).await
    }
}

impl Backend for SwarmBackend {
    async fn list_entities(&self) -> Result<Snapshot, BackendError> {
        let services: Vec<SwarmService> = self.client.get_json("/services").await?;
        let networks: Vec<NetworkResource> = self.client.get_json("/networks").await?;
        let nodes: Vec<SwarmNode> = self.client.get_json("/nodes").await?;

        let network_names: HashMap<String, String> =
            networks.into_iter().map(|n| (n.id, n.name)).collect();
        let node_addresses: HashMap<String, String> = nodes
            .into_iter()
            .map(|n| (n.id, n.status.addr))
            .collect();

        let mut entities = Vec::new();
        for service in services {
            let labels = service.spec.labels.clone().unwrap_or_default();
            let extra = match ExtraConf::from_labels(&labels, &self.options) {
                Ok(extra) => extra,
                Err(e) => {
                    tracing::error!(service = %service.spec.name, error = %e, "Skip service: invalid control labels");
                    continue;
                }
            };

            let vip = service
                .spec
                .endpoint_spec
                .as_ref()
                .map_or(true, |spec| spec.mode != "dnsrr");

            if vip && extra.lb_swarm {
                entities.push(service_record(&service, labels, extra, &network_names));
                continue;
            }

            let tasks = self.tasks(&service.id).await?;
            for task in tasks {
                if task.status.state != "running" {
                    continue;
                }
                entities.push(task_record(
                    &service,
                    &task,
                    labels.clone(),
                    extra.clone(),
                    &node_addresses,
                ));
            }
        }

        Ok(Snapshot::new(entities))
    }

    fn change_source(&self) -> ChangeSource {
        ChangeSource::Poll(self.refresh)
    }

    async fn subscribe(&self) -> Result<EventStream, BackendError> {
        Err(BackendError::InvalidEndpoint(format!(
            "{}: cluster managers are polled",
            self.options.endpoint
        )))
    }
}

fn service_ports(service: &SwarmService) -> Vec<ExposedPort> {
    service
        .endpoint
        .as_ref()
        .and_then(|e| e.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| ExposedPort {
                    port: p.target_port,
                    protocol: p.protocol.clone(),
                    bindings: match p.published_port {
                        0 => Vec::new(),
                        published => vec![PortBinding {
                            host_ip: String::new(),
                            host_port: published.to_string(),
                        }],
                    },
                })
                .collect()
        })
        .unwrap_or_default()
}

/// A virtual-IP service load balanced by the cluster itself.
fn service_record(
    service: &SwarmService,
    labels: HashMap<String, String>,
    extra: ExtraConf,
    network_names: &HashMap<String, String>,
) -> EntityRecord {
    let mut networks = HashMap::new();
    let vips = service.endpoint.as_ref().and_then(|e| e.virtual_ips.as_ref());
    for vip in vips.into_iter().flatten() {
        match network_names.get(&vip.network_id) {
            Some(name) => {
                networks.insert(
                    name.clone(),
                    NetworkAttachment {
                        id: vip.network_id.clone(),
                        address: strip_cidr(&vip.addr).to_string(),
                    },
                );
            }
            None => {
                tracing::debug!(
                    service = %service.spec.name,
                    network = %vip.network_id,
                    "Network not found for virtual IP"
                );
            }
        }
    }

    EntityRecord {
        id: service.id.clone(),
        service_name: logical_service_name(&service.spec.name, &labels),
        name: service.spec.name.clone(),
        labels,
        network: NetworkInfo {
            mode: NetworkMode::Overlay,
            ports: service_ports(service),
            networks,
        },
        health: Default::default(),
        node_address: None,
        extra,
    }
}

fn task_record(
    service: &SwarmService,
    task: &Task,
    labels: HashMap<String, String>,
    extra: ExtraConf,
    node_addresses: &HashMap<String, String>,
) -> EntityRecord {
    let suffix = if task.slot > 0 {
        task.slot.to_string()
    } else {
        task.id.clone()
    };

    let mut networks = HashMap::new();
    for attachment in task.networks_attachments.iter().flatten() {
        let Some(address) = attachment.addresses.iter().flatten().next() else {
            continue;
        };
        let name = attachment
            .network
            .spec
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| attachment.network.id.clone());
        networks.insert(
            name,
            NetworkAttachment {
                id: attachment.network.id.clone(),
                address: strip_cidr(address).to_string(),
            },
        );
    }

    EntityRecord {
        id: task.id.clone(),
        service_name: logical_service_name(&service.spec.name, &labels),
        name: format!("{}.{}", service.spec.name, suffix),
        labels,
        network: NetworkInfo {
            mode: NetworkMode::Overlay,
            ports: service_ports(service),
            networks,
        },
        health: Default::default(),
        node_address: node_addresses
            .get(&task.node_id)
            .filter(|addr| !addr.is_empty())
            .cloned(),
        extra,
    }
}
