//! Per-entity fragment assembly.
//!
//! Turns the labels decoded for one entity into a complete fragment: every
//! service gets a server at the entity's endpoint, a service is synthesized
//! when none is declared, and routers are bound to a service and given the
//! default rule when they lack one.

use thiserror::Error;

use crate::config::ProviderOptions;
use crate::discovery::{EntityRecord, PeerLookup};
use crate::dynamic::{
    Configuration, HttpConfiguration, Router, Server, ServersLoadBalancer, Service,
    TcpConfiguration, TcpServer, TcpServersLoadBalancer, TcpService, UdpConfiguration,
    UdpServer, UdpServersLoadBalancer, UdpService,
};
use crate::provider::endpoint::{join_host_port, EndpointError, EndpointResolver, HostResolver};
use crate::provider::normalize;
use crate::provider::rule::{RuleModel, RuleTemplate};

const DEFAULT_SCHEME: &str = "http";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("service {service:?}: {source}")]
    Endpoint {
        service: String,
        #[source]
        source: EndpointError,
    },

    #[error("service {0:?}: load-balancer is not defined")]
    MissingLoadBalancer(String),

    #[error("service {0:?}: port is missing")]
    MissingPort(String),
}

pub struct FragmentBuilder<'a, P, R> {
    default_rule: &'a RuleTemplate,
    resolver: EndpointResolver<'a, P, R>,
}

impl<'a, P: PeerLookup, R: HostResolver> FragmentBuilder<'a, P, R> {
    pub fn new(
        options: &'a ProviderOptions,
        default_rule: &'a RuleTemplate,
        peers: &'a P,
        hosts: &'a R,
    ) -> Self {
        Self {
            default_rule,
            resolver: EndpointResolver::new(options, peers, hosts),
        }
    }

    /// Complete the decoded `fragment` for `entity`.
    pub fn build(
        &self,
        entity: &EntityRecord,
        mut fragment: Configuration,
    ) -> Result<Configuration, BuildError> {
        let mut tcp_or_udp = false;

        if fragment.tcp.is_declared() {
            tcp_or_udp = true;
            self.build_tcp_services(entity, &mut fragment.tcp)?;
            bind_tcp_routers(entity, &mut fragment.tcp);
        }

        if fragment.udp.is_declared() {
            tcp_or_udp = true;
            self.build_udp_services(entity, &mut fragment.udp)?;
            bind_udp_routers(entity, &mut fragment.udp);
        }

        let http = &fragment.http;
        if tcp_or_udp && http.routers.is_empty() && http.services.is_empty() && http.middlewares.is_empty() {
            return Ok(fragment);
        }

        self.build_http_services(entity, &mut fragment.http)?;
        self.build_http_routers(entity, &mut fragment.http);
        Ok(fragment)
    }

    fn build_http_services(
        &self,
        entity: &EntityRecord,
        http: &mut HttpConfiguration,
    ) -> Result<(), BuildError> {
        if http.services.is_empty() {
            http.services
                .insert(entity.service_name.clone(), Service::with_default_load_balancer());
        }

        for (name, service) in http.services.iter_mut() {
            let lb = service
                .load_balancer
                .as_mut()
                .ok_or_else(|| BuildError::MissingLoadBalancer(name.clone()))?;
            if entity.health.is_serving() {
                self.add_http_server(entity, name, lb)?;
            } else {
                lb.servers.clear();
            }
        }
        Ok(())
    }

    /// Fill the server template (first declared server) with the endpoint.
    fn add_http_server(
        &self,
        entity: &EntityRecord,
        service: &str,
        lb: &mut ServersLoadBalancer,
    ) -> Result<(), BuildError> {
        let mut server = lb.servers.drain(..).next().unwrap_or_else(|| Server {
            scheme: DEFAULT_SCHEME.to_string(),
            ..Default::default()
        });
        let port = std::mem::take(&mut server.port);
        let endpoint = self
            .resolver
            .resolve(entity, Some(port.as_str()))
            .map_err(|source| BuildError::Endpoint {
                service: service.to_string(),
                source,
            })?;

        if server.url.is_empty() {
            let scheme = if server.scheme.is_empty() {
                DEFAULT_SCHEME
            } else {
                server.scheme.as_str()
            };
            server.url = format!("{scheme}://{}", endpoint.host_port());
        }
        server.scheme.clear();

        lb.servers.push(server);
        Ok(())
    }

    fn build_http_routers(&self, entity: &EntityRecord, http: &mut HttpConfiguration) {
        if http.routers.is_empty() {
            if http.services.len() > 1 {
                tracing::error!(
                    container = %entity.name,
                    "Could not create a router for the container: too many services"
                );
            } else {
                http.routers.insert(normalize(&entity.service_name), Router::default());
            }
        }

        let lone_service = lone_key(&http.services);
        let model = RuleModel {
            name: &entity.service_name,
            container_name: &entity.name,
            labels: &entity.labels,
        };

        http.routers.retain(|name, router| {
            if router.rule.is_empty() {
                match self.default_rule.render(&model) {
                    Ok(rule) if rule.is_empty() => {
                        tracing::error!(container = %entity.name, router = %name, "Undefined rule");
                        return false;
                    }
                    Ok(rule) => router.rule = rule,
                    Err(e) => {
                        tracing::error!(
                            container = %entity.name,
                            router = %name,
                            error = %e,
                            "Error while rendering the default rule"
                        );
                        return false;
                    }
                }
            }

            if router.service.is_empty() {
                match &lone_service {
                    Some(service) => router.service = service.clone(),
                    None => {
                        tracing::error!(
                            container = %entity.name,
                            router = %name,
                            "Could not define the service name for the router: too many services"
                        );
                        return false;
                    }
                }
            }
            true
        });
    }

    fn build_tcp_services(
        &self,
        entity: &EntityRecord,
        tcp: &mut TcpConfiguration,
    ) -> Result<(), BuildError> {
        if tcp.services.is_empty() {
            tcp.services
                .insert(entity.service_name.clone(), TcpService::with_default_load_balancer());
        }

        for (name, service) in tcp.services.iter_mut() {
            let lb = service
                .load_balancer
                .as_mut()
                .ok_or_else(|| BuildError::MissingLoadBalancer(name.clone()))?;
            if entity.health.is_serving() {
                self.add_tcp_server(entity, name, lb)?;
            } else {
                lb.servers.clear();
            }
        }
        Ok(())
    }

    fn add_tcp_server(
        &self,
        entity: &EntityRecord,
        service: &str,
        lb: &mut TcpServersLoadBalancer,
    ) -> Result<(), BuildError> {
        let mut server: TcpServer = lb.servers.drain(..).next().unwrap_or_default();
        let port = std::mem::take(&mut server.port);
        server.address = self.resolve_address(entity, service, &port)?;
        lb.servers.push(server);
        Ok(())
    }

    fn build_udp_services(
        &self,
        entity: &EntityRecord,
        udp: &mut UdpConfiguration,
    ) -> Result<(), BuildError> {
        if udp.services.is_empty() {
            udp.services
                .insert(entity.service_name.clone(), UdpService::with_default_load_balancer());
        }

        for (name, service) in udp.services.iter_mut() {
            let lb: &mut UdpServersLoadBalancer = service
                .load_balancer
                .as_mut()
                .ok_or_else(|| BuildError::MissingLoadBalancer(name.clone()))?;
            if entity.health.is_serving() {
                let mut server: UdpServer = lb.servers.drain(..).next().unwrap_or_default();
                let port = std::mem::take(&mut server.port);
                server.address = self.resolve_address(entity, name, &port)?;
                lb.servers.push(server);
            } else {
                lb.servers.clear();
            }
        }
        Ok(())
    }

    /// `address:port` for TCP and UDP servers, which require a port.
    fn resolve_address(&self, entity: &EntityRecord, service: &str, port: &str) -> Result<String, BuildError> {
        let endpoint = self
            .resolver
            .resolve(entity, Some(port))
            .map_err(|source| BuildError::Endpoint {
                service: service.to_string(),
                source,
            })?;
        if endpoint.port.is_empty() {
            return Err(BuildError::MissingPort(service.to_string()));
        }
        Ok(join_host_port(&endpoint.address, &endpoint.port))
    }
}

fn lone_key<V>(map: &std::collections::BTreeMap<String, V>) -> Option<String> {
    match map.len() {
        1 => map.keys().next().cloned(),
        _ => None,
    }
}

fn bind_tcp_routers(entity: &EntityRecord, tcp: &mut TcpConfiguration) {
    let lone_service = lone_key(&tcp.services);
    tcp.routers.retain(|name, router| {
        if router.rule.is_empty() {
            tracing::error!(container = %entity.name, router = %name, "Empty rule");
            return false;
        }
        if router.service.is_empty() {
            match &lone_service {
                Some(service) => router.service = service.clone(),
                None => {
                    tracing::error!(
                        container = %entity.name,
                        router = %name,
                        "Could not define the service name for the router: too many services"
                    );
                    return false;
                }
            }
        }
        true
    });
}

fn bind_udp_routers(entity: &EntityRecord, udp: &mut UdpConfiguration) {
    let lone_service = lone_key(&udp.services);
    udp.routers.retain(|name, router| {
        if router.service.is_empty() {
            match &lone_service {
                Some(service) => router.service = service.clone(),
                None => {
                    tracing::error!(
                        container = %entity.name,
                        router = %name,
                        "Could not define the service name for the router: too many services"
                    );
                    return false;
                }
            }
        }
        true
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ExposedPort, HealthState, NetworkAttachment, NetworkInfo, NetworkMode, Snapshot};
    use crate::labels::decode_configuration;
    use crate::provider::endpoint::SystemResolver;
    use std::collections::HashMap;

    fn entity(name: &str, labels: &[(&str, &str)]) -> EntityRecord {
        EntityRecord {
            id: format!("{name}-id"),
            name: name.to_string(),
            service_name: normalize(name),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            network: NetworkInfo {
                mode: NetworkMode::Bridge,
                ports: vec![ExposedPort::parse("80/tcp", vec![]).unwrap()],
                networks: HashMap::from([(
                    "bridge".to_string(),
                    NetworkAttachment {
                        id: "n1".into(),
                        address: "127.0.0.1".into(),
                    },
                )]),
            },
            ..Default::default()
        }
    }

    fn build(entity: &EntityRecord, rule: &str) -> Result<Configuration, BuildError> {
        let options = ProviderOptions::default();
        let template = RuleTemplate::parse(rule).unwrap();
        let snapshot = Snapshot::default();
        let fragment = decode_configuration(&entity.labels, "traefik").unwrap();
        FragmentBuilder::new(&options, &template, &snapshot, &SystemResolver).build(entity, fragment)
    }

    #[test]
    fn test_synthesized_service_and_router() {
        let test = entity("Test", &[]);
        let conf = build(&test, "Host(`{{ normalize .Name }}.traefik.wtf`)").unwrap();

        let router = &conf.http.routers["Test"];
        assert_eq!(router.rule, "Host(`Test.traefik.wtf`)");
        assert_eq!(router.service, "Test");

        let lb = conf.http.services["Test"].load_balancer.as_ref().unwrap();
        assert_eq!(lb.pass_host_header, Some(true));
        assert_eq!(lb.servers.len(), 1);
        assert_eq!(lb.servers[0].url, "http://127.0.0.1:80");
        assert!(lb.servers[0].scheme.is_empty());
    }

    #[test]
    fn test_declared_server_port_and_scheme() {
        let web = entity(
            "web",
            &[
                ("traefik.http.services.api.loadbalancer.server.port", "8080"),
                ("traefik.http.services.api.loadbalancer.server.scheme", "h2c"),
            ],
        );
        let conf = build(&web, "Host(`x`)").unwrap();
        let lb = conf.http.services["api"].load_balancer.as_ref().unwrap();
        assert_eq!(lb.servers[0].url, "h2c://127.0.0.1:8080");
        assert!(lb.servers[0].port.is_empty());
        assert_eq!(conf.http.routers["web"].service, "api");
    }

    #[test]
    fn test_empty_default_rule_keeps_service() {
        let web = entity("web", &[]);
        let conf = build(&web, "").unwrap();
        assert!(conf.http.routers.is_empty());
        assert_eq!(conf.http.services.len(), 1);
    }

    #[test]
    fn test_unrenderable_default_rule_keeps_service() {
        let web = entity("web", &[]);
        let conf = build(&web, "{{ .Labels }}").unwrap();
        assert!(conf.http.routers.is_empty());
        assert_eq!(conf.http.services.len(), 1);
    }

    #[test]
    fn test_router_with_several_services_is_dropped() {
        let web = entity(
            "web",
            &[
                ("traefik.http.routers.r.rule", "Path(`/`)"),
                ("traefik.http.services.a.loadbalancer.server.port", "80"),
                ("traefik.http.services.b.loadbalancer.server.port", "81"),
            ],
        );
        let conf = build(&web, "Host(`x`)").unwrap();
        assert!(conf.http.routers.is_empty());
        assert_eq!(conf.http.services.len(), 2);
    }

    #[test]
    fn test_unhealthy_entity_has_no_servers() {
        let mut web = entity("web", &[]);
        web.health = HealthState::Unhealthy;
        let conf = build(&web, "Host(`x`)").unwrap();
        let lb = conf.http.services["web"].load_balancer.as_ref().unwrap();
        assert!(lb.servers.is_empty());
        assert_eq!(conf.http.routers.len(), 1);
    }

    #[test]
    fn test_tcp_only_entity() {
        let db = entity(
            "db",
            &[
                ("traefik.tcp.routers.db.rule", "HostSNI(`*`)"),
                ("traefik.tcp.routers.norule.entrypoints", "pg"),
                ("traefik.tcp.services.db.loadbalancer.server.port", "5432"),
            ],
        );
        let conf = build(&db, "Host(`x`)").unwrap();
        assert!(conf.http.is_empty());
        assert_eq!(conf.tcp.routers.len(), 1);
        assert_eq!(conf.tcp.routers["db"].service, "db");
        let lb = conf.tcp.services["db"].load_balancer.as_ref().unwrap();
        assert_eq!(lb.servers[0].address, "127.0.0.1:5432");
    }

    #[test]
    fn test_tcp_router_gets_synthesized_service() {
        let db = entity("db", &[("traefik.tcp.routers.db.rule", "HostSNI(`*`)")]);
        let conf = build(&db, "Host(`x`)").unwrap();
        let lb = conf.tcp.services["db"].load_balancer.as_ref().unwrap();
        assert_eq!(lb.servers[0].address, "127.0.0.1:80");
        assert_eq!(conf.tcp.routers["db"].service, "db");
    }

    #[test]
    fn test_udp_requires_port() {
        let mut dns = entity("dns", &[("traefik.udp.routers.dns.entrypoints", "dns")]);
        dns.network.ports.clear();
        assert_eq!(build(&dns, "").unwrap_err(), BuildError::MissingPort("dns".into()));
    }

    #[test]
    fn test_unresolved_endpoint_fails_fragment() {
        let mut web = entity("web", &[]);
        web.network.networks.clear();
        assert!(matches!(
            build(&web, "Host(`x`)"),
            Err(BuildError::Endpoint { .. })
        ));
    }
}
