//! Entity enumeration subsystem.
//!
//! # Data Flow
//! ```text
//! Connector::connect (client + version check)
//!     → Backend::list_entities
//!         - docker.rs: running containers (+ one hop of attached-to peers)
//!         - swarm.rs: services expanded into running tasks
//!     → Snapshot { entities (enumeration order), peers }
//!
//! Change signal:
//!     docker.rs → engine event stream
//!     swarm.rs  → fixed poll interval
//! ```
//!
//! # Design Decisions
//! - Records are rebuilt on every pass; nothing is cached across passes
//! - Adapters are generic implementations of one trait, not a class tree
//! - Provider control labels are decoded here because the cluster adapter
//!   needs them before it knows what to enumerate

pub mod api;
pub mod client;
pub mod docker;
pub mod swarm;

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::config::ProviderOptions;
use crate::labels::{self, DecodeError};
use crate::provider::normalize;

pub use client::DockerClient;
pub use docker::{DockerBackend, DockerConnector};
pub use swarm::{SwarmBackend, SwarmConnector};

pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_COMPOSE_SERVICE: &str = "com.docker.compose.service";

/// Health reported by the engine for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthState {
    /// No health check configured.
    #[default]
    None,
    Healthy,
    Unhealthy,
    Starting,
}

impl HealthState {
    pub fn from_status(status: &str) -> Self {
        match status {
            "healthy" => HealthState::Healthy,
            "unhealthy" => HealthState::Unhealthy,
            "starting" => HealthState::Starting,
            _ => HealthState::None,
        }
    }

    /// True unless a health check exists and does not report healthy.
    pub fn is_serving(&self) -> bool {
        matches!(self, HealthState::None | HealthState::Healthy)
    }
}

/// How an entity is attached to the network.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NetworkMode {
    #[default]
    Bridge,
    Host,
    /// Shares the network namespace of another entity (id or name).
    AttachedTo(String),
    /// Cluster overlay networking.
    Overlay,
    /// A user-defined network used as the default mode.
    Named(String),
}

impl NetworkMode {
    pub fn parse(mode: &str) -> Self {
        match mode {
            "" | "default" | "bridge" => NetworkMode::Bridge,
            "host" => NetworkMode::Host,
            other => match other.strip_prefix("container:") {
                Some(target) => NetworkMode::AttachedTo(target.to_string()),
                None => NetworkMode::Named(other.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

/// A declared container port and its host bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: String,
    pub bindings: Vec<PortBinding>,
}

impl ExposedPort {
    /// Parse an engine port key such as `80/tcp`.
    pub fn parse(key: &str, bindings: Vec<PortBinding>) -> Option<Self> {
        let (port, protocol) = key.split_once('/').unwrap_or((key, "tcp"));
        Some(Self {
            port: port.parse().ok()?,
            protocol: protocol.to_string(),
            bindings,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkAttachment {
    pub id: String,
    pub address: String,
}

/// Per-entity network topology snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetworkInfo {
    pub mode: NetworkMode,
    /// Declared ports. The engine reports them as a JSON object, decoded
    /// into a sorted map, so the order is by key (`53/tcp` before `53/udp`).
    pub ports: Vec<ExposedPort>,
    /// Attached networks by name. Iteration order is unspecified.
    pub networks: HashMap<String, NetworkAttachment>,
}

impl NetworkInfo {
    /// Whether the entity has finished joining its networks.
    pub fn is_ready(&self) -> bool {
        match self.mode {
            NetworkMode::Host | NetworkMode::AttachedTo(_) => true,
            _ => !self.networks.is_empty(),
        }
    }

    /// The declared port with the lowest number, first in `ports` on ties.
    pub fn lowest_port(&self) -> Option<&ExposedPort> {
        self.ports
            .iter()
            .fold(None, |best: Option<&ExposedPort>, port| match best {
                Some(b) if b.port <= port.port => Some(b),
                _ => Some(port),
            })
    }
}

/// Provider control settings resolved for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtraConf {
    pub enable: bool,
    /// Network to take the address from; empty means any.
    pub network: String,
    pub lb_swarm: bool,
}

impl ExtraConf {
    /// Decode the control labels, falling back to provider-wide defaults.
    pub fn from_labels(
        entity_labels: &HashMap<String, String>,
        options: &ProviderOptions,
    ) -> Result<Self, DecodeError> {
        let control = labels::decode_control(entity_labels, &options.label_prefix)?;
        Ok(Self {
            enable: control.enable.unwrap_or(options.exposed_by_default),
            network: control
                .docker
                .network
                .unwrap_or_else(|| options.network.clone()),
            lb_swarm: control.docker.lb_swarm.unwrap_or(false),
        })
    }
}

/// One running workload instance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityRecord {
    pub id: String,
    /// Shared by every replica of the same service.
    pub service_name: String,
    /// Unique per instance.
    pub name: String,
    pub labels: HashMap<String, String>,
    pub network: NetworkInfo,
    pub health: HealthState,
    pub node_address: Option<String>,
    pub extra: ExtraConf,
}

/// Logical service name: `<service>_<project>` for compose workloads,
/// otherwise the entity's own name, normalized either way.
pub fn logical_service_name(name: &str, labels: &HashMap<String, String>) -> String {
    match (
        labels.get(LABEL_COMPOSE_SERVICE),
        labels.get(LABEL_COMPOSE_PROJECT),
    ) {
        (Some(service), Some(project)) => normalize(&format!("{service}_{project}")),
        _ => normalize(name),
    }
}

/// The result of one enumeration.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Eligible candidates, in enumeration order.
    pub entities: Vec<EntityRecord>,
    /// Entities that are only referenced as network namespace owners.
    pub peers: Vec<EntityRecord>,
}

impl Snapshot {
    pub fn new(entities: Vec<EntityRecord>) -> Self {
        Self {
            entities,
            peers: Vec::new(),
        }
    }
}

/// Lookup of entities referenced by `NetworkMode::AttachedTo`.
pub trait PeerLookup {
    fn peer(&self, reference: &str) -> Option<&EntityRecord>;
}

impl PeerLookup for Snapshot {
    fn peer(&self, reference: &str) -> Option<&EntityRecord> {
        self.entities
            .iter()
            .chain(self.peers.iter())
            .find(|e| e.id == reference || e.name == reference || e.id.starts_with(reference))
    }
}

/// A change notification from an event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub action: String,
    pub entity_id: String,
}

pub type EventStream = BoxStream<'static, Result<ChangeEvent, BackendError>>;

/// How a backend signals that its state changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSource {
    Events,
    Poll(Duration),
}

/// Capability interface shared by the standalone and cluster adapters.
pub trait Backend: Send + Sync {
    fn list_entities(&self) -> impl Future<Output = Result<Snapshot, BackendError>> + Send;

    fn change_source(&self) -> ChangeSource;

    /// Subscribe to change events. Only called for `ChangeSource::Events`.
    fn subscribe(&self) -> impl Future<Output = Result<EventStream, BackendError>> + Send;
}

/// Builds a connected backend; one per Connecting → Streaming run.
pub trait Connector: Send + Sync {
    type Backend: Backend;

    fn connect(&self) -> impl Future<Output = Result<Self::Backend, BackendError>> + Send;
}

/// Transport failures. Any of these aborts the pass and triggers a retry.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),

    #[error("cannot connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("{path} returned status {status}: {message}")]
    Status {
        path: String,
        status: u16,
        message: String,
    },

    #[error("invalid JSON from {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("event stream closed")]
    StreamClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_mode_parse() {
        assert_eq!(NetworkMode::parse("default"), NetworkMode::Bridge);
        assert_eq!(NetworkMode::parse("host"), NetworkMode::Host);
        assert_eq!(
            NetworkMode::parse("container:abc123"),
            NetworkMode::AttachedTo("abc123".into())
        );
        assert_eq!(
            NetworkMode::parse("backend_net"),
            NetworkMode::Named("backend_net".into())
        );
    }

    #[test]
    fn test_lowest_port_prefers_first_declared_on_tie() {
        let info = NetworkInfo {
            ports: vec![
                ExposedPort::parse("443/tcp", vec![]).unwrap(),
                ExposedPort::parse("53/udp", vec![]).unwrap(),
                ExposedPort::parse("53/tcp", vec![]).unwrap(),
                ExposedPort::parse("8080/tcp", vec![]).unwrap(),
            ],
            ..Default::default()
        };
        let lowest = info.lowest_port().unwrap();
        assert_eq!(lowest.port, 53);
        assert_eq!(lowest.protocol, "udp");
    }

    #[test]
    fn test_readiness() {
        let mut info = NetworkInfo::default();
        assert!(!info.is_ready());

        info.mode = NetworkMode::Host;
        assert!(info.is_ready());

        info.mode = NetworkMode::Bridge;
        info.networks.insert("bridge".into(), NetworkAttachment::default());
        assert!(info.is_ready());
    }

    #[test]
    fn test_logical_service_name() {
        let mut labels = HashMap::new();
        assert_eq!(logical_service_name("my.app", &labels), "my-app");

        labels.insert(LABEL_COMPOSE_PROJECT.to_string(), "shop".to_string());
        assert_eq!(logical_service_name("my.app", &labels), "my-app");

        labels.insert(LABEL_COMPOSE_SERVICE.to_string(), "web".to_string());
        assert_eq!(logical_service_name("my.app", &labels), "web-shop");
    }

    #[test]
    fn test_extra_conf_defaults() {
        let options = ProviderOptions {
            exposed_by_default: false,
            network: "front".into(),
            ..Default::default()
        };
        let extra = ExtraConf::from_labels(&HashMap::new(), &options).unwrap();
        assert!(!extra.enable);
        assert_eq!(extra.network, "front");

        let labels = HashMap::from([
            ("traefik.enable".to_string(), "true".to_string()),
            ("traefik.docker.network".to_string(), "back".to_string()),
        ]);
        let extra = ExtraConf::from_labels(&labels, &options).unwrap();
        assert!(extra.enable);
        assert_eq!(extra.network, "back");
    }

    #[test]
    fn test_peer_lookup_by_id_prefix_or_name() {
        let snapshot = Snapshot {
            entities: vec![],
            peers: vec![EntityRecord {
                id: "abcdef123456".into(),
                name: "vpn".into(),
                ..Default::default()
            }],
        };
        assert!(snapshot.peer("vpn").is_some());
        assert!(snapshot.peer("abcdef").is_some());
        assert!(snapshot.peer("other").is_none());
    }
}
