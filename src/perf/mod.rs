//! Optional performance wrappers: connection pooling, outbound batching,
//! and lightweight metrics counters.
//!
//! Nothing in the core depends on these; they wrap the transport layer
//! for deployments that need them.

// Rust guideline compliant 2026-02

pub mod batch;
pub mod metrics;
pub mod pool;

pub use batch::MessageBatcher;
pub use metrics::{Metrics, MetricsSnapshot};
pub use pool::ConnectionPool;
