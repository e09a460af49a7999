//! Crossbar: a service-oriented messaging fabric.
//!
//! A Majordomo-style broker routes request/reply traffic between clients
//! and pools of service workers over a framed, router-style transport;
//! an identity kernel issues, validates, and revokes bearer credentials
//! and enforces role-based permissions on what those credentials may do.

// Library modules
pub mod auth;
pub mod broker;
pub mod config;
pub mod constants;
pub mod endpoint;
pub mod error;
pub mod perf;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use auth::{
    BearerGuard, PasswordPolicy, Permission, RateLimiter, RbacEvaluator, TokenBlacklist,
    TokenManager, TokenPair,
};
pub use broker::cluster::{BrokerNode, ClusterView, NodeStatus};
pub use broker::store::{MemoryRequestStore, PendingRequest, RequestStatus, RequestStore};
pub use broker::Broker;
pub use config::Config;
pub use endpoint::{Client, Worker};
pub use error::{Error, ErrorCode, ErrorContext, Result};
