//! Endpoint resolution: which address and port a server points at.

use std::net::ToSocketAddrs;

use thiserror::Error;

use crate::config::ProviderOptions;
use crate::discovery::{EntityRecord, NetworkMode, PeerLookup, PortBinding};

/// Aliases engines publish for the host gateway, tried in order.
const HOST_GATEWAY_ALIASES: &[&str] = &["host.docker.internal", "host.containers.internal"];

const LOOPBACK: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("unable to find the IP address for {0:?}")]
    Unresolved(String),
}

/// A resolved target. `port` is empty when the entity declares none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: String,
}

impl Endpoint {
    /// `address:port`, with IPv6 addresses bracketed.
    pub fn host_port(&self) -> String {
        join_host_port(&self.address, &self.port)
    }
}

pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Resolves the host gateway when an entity uses host networking.
pub trait HostResolver {
    fn lookup(&self, host: &str) -> Option<String>;
}

/// Resolver backed by the system's name service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn lookup(&self, host: &str) -> Option<String> {
        (host, 0)
            .to_socket_addrs()
            .ok()?
            .next()
            .map(|addr| addr.ip().to_string())
    }
}

pub struct EndpointResolver<'a, P, R> {
    options: &'a ProviderOptions,
    peers: &'a P,
    hosts: &'a R,
}

impl<'a, P: PeerLookup, R: HostResolver> EndpointResolver<'a, P, R> {
    pub fn new(options: &'a ProviderOptions, peers: &'a P, hosts: &'a R) -> Self {
        Self {
            options,
            peers,
            hosts,
        }
    }

    /// Resolve the address and port for `entity`, honoring an explicit port
    /// from a label-declared server template.
    pub fn resolve(
        &self,
        entity: &EntityRecord,
        port_override: Option<&str>,
    ) -> Result<Endpoint, EndpointError> {
        if self.options.use_bind_port_ip {
            match port_binding(entity, port_override) {
                None => {
                    tracing::debug!(
                        container = %entity.name,
                        "Unable to find a binding, falling back on the internal address"
                    );
                }
                Some(binding) if binding.host_ip.is_empty() || binding.host_ip == "0.0.0.0" => {
                    tracing::debug!(
                        container = %entity.name,
                        host_ip = %binding.host_ip,
                        "Cannot determine the bound address, falling back on the internal address"
                    );
                }
                Some(binding) => {
                    return Ok(Endpoint {
                        address: binding.host_ip.clone(),
                        port: binding.host_port.clone(),
                    });
                }
            }
        }

        let address = self.address(entity, &entity.extra.network);
        if address.is_empty() {
            return Err(EndpointError::Unresolved(entity.name.clone()));
        }

        Ok(Endpoint {
            address,
            port: target_port(entity, port_override),
        })
    }

    /// The entity's address from the point of view of the proxy. Empty when
    /// none can be determined.
    fn address(&self, entity: &EntityRecord, network: &str) -> String {
        if !network.is_empty() && !entity.network.networks.is_empty() {
            match entity.network.networks.get(network) {
                Some(attachment) => return attachment.address.clone(),
                None => {
                    tracing::warn!(
                        container = %entity.name,
                        network = %network,
                        "Could not find network, maybe the project prefix is missing from the label"
                    );
                }
            }
        }

        match &entity.network.mode {
            NetworkMode::Host => {
                if let Some(node) = entity.node_address.as_deref().filter(|a| !a.is_empty()) {
                    return node.to_string();
                }
                HOST_GATEWAY_ALIASES
                    .iter()
                    .find_map(|alias| self.hosts.lookup(alias))
                    .unwrap_or_else(|| LOOPBACK.to_string())
            }
            // Follows the chain without cycle detection.
            NetworkMode::AttachedTo(reference) => match self.peers.peer(reference) {
                Some(peer) => {
                    let network = if peer.extra.network.is_empty() {
                        network
                    } else {
                        peer.extra.network.as_str()
                    };
                    self.address(peer, network)
                }
                None => {
                    tracing::warn!(
                        container = %entity.name,
                        peer = %reference,
                        "Unable to find the container owning the network namespace"
                    );
                    String::new()
                }
            },
            _ => match entity.network.networks.values().next() {
                Some(attachment) => attachment.address.clone(),
                None => {
                    tracing::warn!(container = %entity.name, "Unable to find the IP address");
                    String::new()
                }
            },
        }
    }
}

/// The explicit port, else the lowest declared container port, else empty.
fn target_port(entity: &EntityRecord, port_override: Option<&str>) -> String {
    match port_override.filter(|p| !p.is_empty()) {
        Some(port) => port.to_string(),
        None => entity
            .network
            .lowest_port()
            .map(|p| p.port.to_string())
            .unwrap_or_default(),
    }
}

fn port_binding<'e>(entity: &'e EntityRecord, port_override: Option<&str>) -> Option<&'e PortBinding> {
    let port = target_port(entity, port_override);
    entity
        .network
        .ports
        .iter()
        .filter(|p| p.port.to_string() == port)
        .find_map(|p| p.bindings.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ExposedPort, NetworkAttachment, NetworkInfo, Snapshot};
    use std::collections::HashMap;

    struct NoHosts;

    impl HostResolver for NoHosts {
        fn lookup(&self, _host: &str) -> Option<String> {
            None
        }
    }

    struct Gateway;

    impl HostResolver for Gateway {
        fn lookup(&self, host: &str) -> Option<String> {
            (host == "host.containers.internal").then(|| "10.88.0.1".to_string())
        }
    }

    fn entity(name: &str, mode: NetworkMode, networks: &[(&str, &str)], ports: &[&str]) -> EntityRecord {
        EntityRecord {
            id: format!("{name}-id"),
            name: name.to_string(),
            service_name: name.to_string(),
            network: NetworkInfo {
                mode,
                ports: ports
                    .iter()
                    .filter_map(|p| ExposedPort::parse(p, vec![]))
                    .collect(),
                networks: networks
                    .iter()
                    .map(|(n, a)| {
                        (
                            n.to_string(),
                            NetworkAttachment {
                                id: format!("{n}-id"),
                                address: a.to_string(),
                            },
                        )
                    })
                    .collect::<HashMap<_, _>>(),
            },
            ..Default::default()
        }
    }

    fn resolve(
        options: &ProviderOptions,
        snapshot: &Snapshot,
        entity: &EntityRecord,
        port: Option<&str>,
    ) -> Result<Endpoint, EndpointError> {
        EndpointResolver::new(options, snapshot, &NoHosts).resolve(entity, port)
    }

    #[test]
    fn test_lowest_port_and_override() {
        let options = ProviderOptions::default();
        let snapshot = Snapshot::default();
        let web = entity("web", NetworkMode::Bridge, &[("bridge", "172.17.0.2")], &["8080/tcp", "80/tcp"]);

        let endpoint = resolve(&options, &snapshot, &web, None).unwrap();
        assert_eq!(endpoint.host_port(), "172.17.0.2:80");

        let endpoint = resolve(&options, &snapshot, &web, Some("9000")).unwrap();
        assert_eq!(endpoint.port, "9000");
    }

    #[test]
    fn test_missing_port_is_empty() {
        let options = ProviderOptions::default();
        let web = entity("web", NetworkMode::Bridge, &[("bridge", "172.17.0.2")], &[]);
        let endpoint = resolve(&options, &Snapshot::default(), &web, None).unwrap();
        assert_eq!(endpoint.host_port(), "172.17.0.2:");
    }

    #[test]
    fn test_pinned_network() {
        let options = ProviderOptions::default();
        let mut web = entity(
            "web",
            NetworkMode::Named("front".into()),
            &[("front", "10.0.0.2"), ("back", "10.1.0.2")],
            &["80/tcp"],
        );
        web.extra.network = "back".into();
        let endpoint = resolve(&options, &Snapshot::default(), &web, None).unwrap();
        assert_eq!(endpoint.address, "10.1.0.2");

        // Unknown pinned network falls back to any attached network.
        web.extra.network = "missing".into();
        let endpoint = resolve(&options, &Snapshot::default(), &web, None).unwrap();
        assert!(endpoint.address == "10.0.0.2" || endpoint.address == "10.1.0.2");
    }

    #[test]
    fn test_host_mode() {
        let options = ProviderOptions::default();
        let snapshot = Snapshot::default();
        let mut web = entity("web", NetworkMode::Host, &[], &["80/tcp"]);

        let endpoint = resolve(&options, &snapshot, &web, None).unwrap();
        assert_eq!(endpoint.address, "127.0.0.1");

        let endpoint = EndpointResolver::new(&options, &snapshot, &Gateway)
            .resolve(&web, None)
            .unwrap();
        assert_eq!(endpoint.address, "10.88.0.1");

        web.node_address = Some("192.168.1.5".into());
        let endpoint = resolve(&options, &snapshot, &web, None).unwrap();
        assert_eq!(endpoint.address, "192.168.1.5");
    }

    #[test]
    fn test_attached_to_peer() {
        let options = ProviderOptions::default();
        let mut vpn = entity("vpn", NetworkMode::Bridge, &[("a", "10.0.0.5"), ("b", "10.9.0.5")], &[]);
        vpn.extra.network = "b".into();
        let snapshot = Snapshot {
            entities: vec![],
            peers: vec![vpn],
        };
        let app = entity("app", NetworkMode::AttachedTo("vpn".into()), &[], &["3000/tcp"]);

        let endpoint = resolve(&options, &snapshot, &app, None).unwrap();
        assert_eq!(endpoint.host_port(), "10.9.0.5:3000");

        let orphan = entity("orphan", NetworkMode::AttachedTo("gone".into()), &[], &["3000/tcp"]);
        assert_eq!(
            resolve(&options, &snapshot, &orphan, None),
            Err(EndpointError::Unresolved("orphan".into()))
        );
    }

    #[test]
    fn test_bound_port() {
        let options = ProviderOptions {
            use_bind_port_ip: true,
            ..Default::default()
        };
        let snapshot = Snapshot::default();
        let mut web = entity("web", NetworkMode::Bridge, &[("bridge", "172.17.0.2")], &[]);
        web.network.ports = vec![ExposedPort::parse(
            "80/tcp",
            vec![PortBinding {
                host_ip: "192.168.0.10".into(),
                host_port: "32768".into(),
            }],
        )
        .unwrap()];

        let endpoint = resolve(&options, &snapshot, &web, None).unwrap();
        assert_eq!(endpoint.host_port(), "192.168.0.10:32768");

        // Wildcard bindings fall back on the internal address.
        web.network.ports[0].bindings[0].host_ip = "0.0.0.0".into();
        let endpoint = resolve(&options, &snapshot, &web, None).unwrap();
        assert_eq!(endpoint.host_port(), "172.17.0.2:80");
    }

    #[test]
    fn test_ipv6_is_bracketed() {
        assert_eq!(join_host_port("fd00::2", "80"), "[fd00::2]:80");
    }
}
