//! Canonical routing configuration.
//!
//! # Data Flow
//! ```text
//! entity labels
//!     → labels (decode into a per-entity Configuration fragment)
//!     → provider::builder (servers, default router)
//!     → provider::merge (identical-or-drop across entities)
//!     → Configuration (immutable, published in a Message)
//! ```
//!
//! # Design Decisions
//! - One type family serves both the per-entity fragment and the merged result
//! - All maps are `BTreeMap` so serialization is byte-stable across passes
//! - Empty fields are skipped when serialized to keep the output minimal

pub mod http;
pub mod tcp;
pub mod tls;
pub mod udp;

use serde::{Deserialize, Serialize};

pub use http::{
    HttpConfiguration, Middleware, ResponseForwarding, Router, Server, ServersLoadBalancer,
    ServersTransport, Service,
};
pub use tcp::{TcpConfiguration, TcpRouter, TcpServer, TcpServersLoadBalancer, TcpService};
pub use tls::{Domain, GeneratedCert, Store, TlsConfiguration};
pub use udp::{UdpConfiguration, UdpRouter, UdpServer, UdpServersLoadBalancer, UdpService};

/// Routing configuration for HTTP, TCP, UDP and TLS stores.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Configuration {
    pub http: HttpConfiguration,
    pub tcp: TcpConfiguration,
    pub udp: UdpConfiguration,
    pub tls: TlsConfiguration,
}

impl Configuration {
    /// True when no protocol carries any router, service or middleware.
    pub fn is_empty(&self) -> bool {
        self.http.is_empty() && self.tcp.is_empty() && self.udp.is_empty() && self.tls.is_empty()
    }
}

/// A published reconciliation result.
///
/// Consumers treat each message as a full replacement of everything the
/// named provider contributed before.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub provider_name: String,
    pub configuration: Configuration,
}

pub(crate) fn is_false(value: &bool) -> bool {
    !*value
}
