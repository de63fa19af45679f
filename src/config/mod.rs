//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, template & constraint parsing)
//!     → DiscoveryConfig (validated, immutable)
//!     → one Arc<ProviderOptions> per provider task
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - No global state: each provider task owns its options

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::DiscoveryConfig;
pub use schema::ProviderOptions;
pub use schema::DockerProviderConfig;
pub use schema::SwarmProviderConfig;
pub use schema::{AdminConfig, ObservabilityConfig};
