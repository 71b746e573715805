//! # Utility Modules
//!
//! Supporting utilities for logging, timing, and observability.
//!
//! ## Components
//! - **Logging**: structured logging configuration over `tracing`
//! - **Timeout**: async timeout wrappers and shared timeout constants
//! - **Metrics**: thread-safe observability counters, one set per manager

pub mod logging;
pub mod metrics;
pub mod timeout;

// Re-export public types for advanced users
pub use metrics::{Metrics, MetricsSnapshot};
