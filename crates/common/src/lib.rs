//! ChatRelay common library
//!
//! This crate contains shared code used by the ChatRelay worker.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::RelayConfig;
pub use error::{ChatRelayError, Result};
pub use metrics::{MetricsRegistry, METRICS};
