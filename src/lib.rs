//! Container and cluster service discovery for a reverse proxy.
//!
//! Watches a container engine (standalone or cluster), decodes routing
//! labels from every running workload and publishes one merged routing
//! configuration per provider.

pub mod admin;
pub mod config;
pub mod constraints;
pub mod discovery;
pub mod dynamic;
pub mod labels;
pub mod lifecycle;
pub mod observability;
pub mod provider;
pub mod resilience;

pub use config::DiscoveryConfig;
pub use dynamic::{Configuration, Message};
pub use lifecycle::Shutdown;
pub use provider::{Reconciler, WatchLoop};
