//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     broadcast → every watch loop, the aggregator and the admin server
//!     → each abandons its current pass and returns
//! ```
//!
//! # Design Decisions
//! - One broadcast channel; no per-task cancellation tokens
//! - Tasks never outlive the shutdown signal by more than one suspension point

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
