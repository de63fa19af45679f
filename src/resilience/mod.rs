//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Backend run fails (connect error, stream closed, API error):
//!     → backoff.rs JobBackoff (reset if the run lasted long enough)
//!     → ExponentialBackoff (grow, jitter, cap)
//!     → sleep, racing shutdown
//!     → reconnect
//! ```
//!
//! # Design Decisions
//! - No maximum elapsed time; retries only stop on shutdown
//! - The reset threshold is a decorator, not a flag on the generator
//! - Clock is tokio's, so paused-time tests control it

pub mod backoff;

pub use backoff::{Backoff, ExponentialBackoff, JobBackoff};
