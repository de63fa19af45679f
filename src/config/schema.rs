//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! discovery service. All types derive Serde traits for deserialization
//! from config files.

use serde::{Deserialize, Serialize};

/// Default routing rule applied to routers that declare none.
pub const DEFAULT_RULE: &str = "Host(`{{ normalize .Name }}`)";

/// Root configuration for the discovery service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Standalone engine provider. Disabled when absent.
    pub docker: Option<DockerProviderConfig>,

    /// Cluster provider. Disabled when absent.
    pub swarm: Option<SwarmProviderConfig>,

    pub admin: AdminConfig,

    pub observability: ObservabilityConfig,
}

/// Options shared by both engine providers.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderOptions {
    /// Engine API endpoint (`unix://`, `tcp://` or `http://`).
    pub endpoint: String,

    /// Expose entities that carry no `<prefix>.enable` label.
    pub exposed_by_default: bool,

    /// Keep unhealthy entities, with empty server lists.
    pub allow_empty_services: bool,

    /// Prefer the host binding of the chosen port over the entity address.
    pub use_bind_port_ip: bool,

    /// Network to take addresses from when an entity does not pin one.
    pub network: String,

    /// Template for the rule of routers that declare none.
    pub default_rule: String,

    /// Constraint expression entities must satisfy.
    pub constraints: String,

    /// Follow changes after the first pass.
    pub watch: bool,

    /// Per-request timeout for engine API calls. 0 disables it.
    pub http_client_timeout_secs: u64,

    /// Label namespace holding routing annotations.
    pub label_prefix: String,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            endpoint: "unix:///var/run/docker.sock".to_string(),
            exposed_by_default: true,
            allow_empty_services: false,
            use_bind_port_ip: false,
            network: String::new(),
            default_rule: DEFAULT_RULE.to_string(),
            constraints: String::new(),
            watch: true,
            http_client_timeout_secs: 0,
            label_prefix: "traefik".to_string(),
        }
    }
}

/// Standalone engine provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct DockerProviderConfig {
    #[serde(flatten)]
    pub options: ProviderOptions,
}

/// Cluster provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SwarmProviderConfig {
    #[serde(flatten)]
    pub options: ProviderOptions,

    /// Polling interval in seconds.
    pub refresh_seconds: u64,
}

impl Default for SwarmProviderConfig {
    fn default() -> Self {
        Self {
            options: ProviderOptions::default(),
            refresh_seconds: 15,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` overrides it.
    pub log_level: String,

    /// `pretty` or `json`.
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// Bearer token. Empty disables authentication.
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
