//! Cross-entity merge with the identical-or-drop policy.
//!
//! # Rules
//! - A name contributed once is kept as-is
//! - Services sharing a name merge when their load balancer settings are
//!   identical; servers are concatenated in enumeration order
//! - Routers, middlewares, transports and TLS stores sharing a name must be
//!   identical
//! - Any mismatch drops the name entirely, and routers pointing at a dropped
//!   service are dropped with it

use std::collections::{BTreeMap, BTreeSet};

use crate::dynamic::{Configuration, Service, TcpService, UdpService};
use crate::observability::metrics;

/// One entity's fragment, tagged with the entity name for conflict logs.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub origin: String,
    pub configuration: Configuration,
}

/// Accumulates one name → definition table.
struct Table<T> {
    entries: BTreeMap<String, T>,
    origins: BTreeMap<String, Vec<String>>,
    conflicts: BTreeSet<String>,
}

impl<T: PartialEq> Table<T> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            origins: BTreeMap::new(),
            conflicts: BTreeSet::new(),
        }
    }

    fn add(&mut self, name: String, value: T, origin: &str) {
        self.add_with(name, value, origin, |existing, incoming| *existing == incoming);
    }

    /// Insert `value`, or fold it into the existing entry with `merge`,
    /// which reports whether the two were compatible.
    fn add_with(&mut self, name: String, value: T, origin: &str, merge: impl FnOnce(&mut T, T) -> bool) {
        self.origins
            .entry(name.clone())
            .or_default()
            .push(origin.to_string());

        match self.entries.get_mut(&name) {
            None => {
                self.entries.insert(name, value);
            }
            Some(existing) => {
                if !merge(existing, value) {
                    self.conflicts.insert(name);
                }
            }
        }
    }

    /// Remove conflicting names. Returns the table and the dropped names.
    fn finish(mut self, provider: &str, kind: &'static str) -> (BTreeMap<String, T>, BTreeSet<String>) {
        for name in &self.conflicts {
            self.entries.remove(name);
            let origins = self.origins.get(name).map(Vec::as_slice).unwrap_or_default();
            tracing::error!(
                provider = %provider,
                kind = kind,
                name = %name,
                entities = ?origins,
                "Defined multiple times with different configurations, dropping it"
            );
            metrics::record_merge_conflict(provider, kind);
        }
        (self.entries, self.conflicts)
    }
}

fn merge_service(existing: &mut Service, incoming: Service) -> bool {
    match (existing.load_balancer.as_mut(), incoming.load_balancer) {
        (Some(current), Some(next)) if current.same_settings(&next) => {
            current.servers.extend(next.servers);
            true
        }
        (None, None) => true,
        _ => false,
    }
}

fn merge_tcp_service(existing: &mut TcpService, incoming: TcpService) -> bool {
    match (existing.load_balancer.as_mut(), incoming.load_balancer) {
        (Some(current), Some(next)) if current.same_settings(&next) => {
            current.servers.extend(next.servers);
            true
        }
        (None, None) => true,
        _ => false,
    }
}

fn merge_udp_service(existing: &mut UdpService, incoming: UdpService) -> bool {
    match (existing.load_balancer.as_mut(), incoming.load_balancer) {
        (Some(current), Some(next)) => {
            current.servers.extend(next.servers);
            true
        }
        (None, None) => true,
        _ => false,
    }
}

/// Drop routers whose service was dropped, logging each one.
fn prune_routers<R>(
    routers: &mut BTreeMap<String, R>,
    dropped_services: &BTreeSet<String>,
    service_of: impl Fn(&R) -> &str,
    provider: &str,
) {
    if dropped_services.is_empty() {
        return;
    }
    routers.retain(|name, router| {
        let service = service_of(router);
        let keep = !dropped_services.contains(service);
        if !keep {
            tracing::warn!(
                provider = %provider,
                router = %name,
                service = %service,
                "Dropping router whose service was dropped"
            );
        }
        keep
    });
}

/// Merge per-entity fragments, in enumeration order, into one configuration.
pub fn merge(provider: &str, fragments: Vec<Fragment>) -> Configuration {
    let mut http_routers = Table::new();
    let mut http_services = Table::new();
    let mut http_middlewares = Table::new();
    let mut transports = Table::new();
    let mut tcp_routers = Table::new();
    let mut tcp_services = Table::new();
    let mut tcp_middlewares = Table::new();
    let mut udp_routers = Table::new();
    let mut udp_services = Table::new();
    let mut stores = Table::new();

    for Fragment { origin, configuration } in fragments {
        let Configuration { http, tcp, udp, tls } = configuration;

        for (name, service) in http.services {
            http_services.add_with(name, service, &origin, merge_service);
        }
        for (name, router) in http.routers {
            http_routers.add(name, router, &origin);
        }
        for (name, middleware) in http.middlewares {
            http_middlewares.add(name, middleware, &origin);
        }
        for (name, transport) in http.servers_transports {
            transports.add(name, transport, &origin);
        }

        for (name, service) in tcp.services {
            tcp_services.add_with(name, service, &origin, merge_tcp_service);
        }
        for (name, router) in tcp.routers {
            tcp_routers.add(name, router, &origin);
        }
        for (name, middleware) in tcp.middlewares {
            tcp_middlewares.add(name, middleware, &origin);
        }

        for (name, service) in udp.services {
            udp_services.add_with(name, service, &origin, merge_udp_service);
        }
        for (name, router) in udp.routers {
            udp_routers.add(name, router, &origin);
        }

        for (name, store) in tls.stores {
            stores.add(name, store, &origin);
        }
    }

    let mut configuration = Configuration::default();

    let (services, dropped) = http_services.finish(provider, "http_service");
    configuration.http.services = services;
    configuration.http.routers = http_routers.finish(provider, "http_router").0;
    prune_routers(&mut configuration.http.routers, &dropped, |r| r.service.as_str(), provider);
    configuration.http.middlewares = http_middlewares.finish(provider, "http_middleware").0;
    configuration.http.servers_transports = transports.finish(provider, "servers_transport").0;

    let (services, dropped) = tcp_services.finish(provider, "tcp_service");
    configuration.tcp.services = services;
    configuration.tcp.routers = tcp_routers.finish(provider, "tcp_router").0;
    prune_routers(&mut configuration.tcp.routers, &dropped, |r| r.service.as_str(), provider);
    configuration.tcp.middlewares = tcp_middlewares.finish(provider, "tcp_middleware").0;

    let (services, dropped) = udp_services.finish(provider, "udp_service");
    configuration.udp.services = services;
    configuration.udp.routers = udp_routers.finish(provider, "udp_router").0;
    prune_routers(&mut configuration.udp.routers, &dropped, |r| r.service.as_str(), provider);

    configuration.tls.stores = stores.finish(provider, "tls_store").0;

    configuration
}
