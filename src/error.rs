//! Error taxonomy for the messaging fabric.
//!
//! One closed [`ErrorCode`] enum covers every failure the core can surface;
//! retryability is a pure function of the code. [`Error`] carries the code,
//! a human-readable message, an optional wrapped cause, and structured
//! context for the well-known cases (service, worker, endpoint, permission,
//! organization) plus a side map for anything else.

// Rust guideline compliant 2026-02

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Closed set of error codes crossing the core boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Frame sequence has the wrong shape (count, tag, or frame content).
    InvalidMessage,
    /// A peer sent a frame sequence that violates its state machine.
    ProtocolViolation,
    /// Service name is unusable (empty, or reserved prefix from a worker).
    InvalidService,
    /// Unknown or out-of-place protocol command byte.
    InvalidCommand,
    /// Credentials could not be verified.
    AuthenticationFailed,
    /// Credentials verified but lack the required permission.
    AuthorizationFailed,
    /// Transport-level connect failure.
    ConnectionFailed,
    /// Transport-level send/receive failure.
    SocketError,
    /// No broker reachable at the configured endpoint.
    BrokerUnavailable,
    /// The worker serving a request went away.
    WorkerDisconnected,
    /// A receive or operation deadline elapsed.
    Timeout,
    /// Message exceeds the configured size limit.
    MessageTooLarge,
    /// Broker shed the request due to load.
    BrokerOverloaded,
    /// Admission or lockout limit tripped.
    RateLimited,
    /// Referenced entity does not exist.
    NotFound,
    /// Referenced entity exists but its TTL elapsed.
    Expired,
    /// Invariant violation inside the core.
    Internal,
}

impl ErrorCode {
    /// Whether an operation failing with this code is worth retrying.
    ///
    /// Pure function of the code: transport faults and timeouts are
    /// transient; protocol and authorization failures are permanent.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::SocketError
                | ErrorCode::BrokerUnavailable
                | ErrorCode::WorkerDisconnected
                | ErrorCode::Timeout
                | ErrorCode::BrokerOverloaded
        )
    }

    /// Inverse of [`ErrorCode::is_retryable`].
    pub fn is_permanent(self) -> bool {
        !self.is_retryable()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidMessage => "invalid_message",
            ErrorCode::ProtocolViolation => "protocol_violation",
            ErrorCode::InvalidService => "invalid_service",
            ErrorCode::InvalidCommand => "invalid_command",
            ErrorCode::AuthenticationFailed => "authentication_failed",
            ErrorCode::AuthorizationFailed => "authorization_failed",
            ErrorCode::ConnectionFailed => "connection_failed",
            ErrorCode::SocketError => "socket_error",
            ErrorCode::BrokerUnavailable => "broker_unavailable",
            ErrorCode::WorkerDisconnected => "worker_disconnected",
            ErrorCode::Timeout => "timeout",
            ErrorCode::MessageTooLarge => "message_too_large",
            ErrorCode::BrokerOverloaded => "broker_overloaded",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Expired => "expired",
            ErrorCode::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Structured context attached to an [`Error`] for the well-known cases.
///
/// The original lineage hung arbitrary key/value maps off every error;
/// here the known shapes are tagged variants and only the remainder goes
/// into the side [`Error::extra`] map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    /// No structured context.
    None,
    /// Failure concerns a named service.
    Service {
        /// Service name as it appeared on the wire.
        name: String,
    },
    /// Failure concerns a specific worker.
    Worker {
        /// Hex form of the worker's routing key.
        identity: String,
        /// Service the worker was bound to, if any.
        service: Option<String>,
    },
    /// Failure concerns a transport endpoint.
    Endpoint {
        /// Endpoint address (transport-specific).
        address: String,
    },
    /// An authorization check failed.
    Permission {
        /// Subject that was denied.
        user: String,
        /// Permission that was required.
        permission: String,
        /// Organization scope of the check, if any.
        organization: Option<i64>,
    },
    /// Failure concerns an organization as a whole.
    Organization {
        /// Organization identifier.
        id: i64,
    },
    /// A rate limit or lockout tripped.
    Blocked {
        /// How long the source/principal stays blocked.
        until: Duration,
    },
}

/// Error type crossing the core boundary.
#[derive(Debug, thiserror::Error)]
#[error("{}", render(.code, .message, .context, .extra))]
pub struct Error {
    code: ErrorCode,
    message: String,
    context: ErrorContext,
    extra: BTreeMap<String, String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Create an error with a code and message, no context.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            context: ErrorContext::None,
            extra: BTreeMap::new(),
            source: None,
        }
    }

    /// Attach structured context.
    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    /// Attach a wrapped cause.
    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach one free-form context entry.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// The closed error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Structured context, if any.
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    /// Free-form context entries.
    pub fn extra(&self) -> &BTreeMap<String, String> {
        &self.extra
    }

    /// Whether the failed operation is worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Inverse of [`Error::is_retryable`].
    pub fn is_permanent(&self) -> bool {
        self.code.is_permanent()
    }

    // ─── Common constructors ───────────────────────────────────────────────

    /// Malformed frame sequence: cite the frame index and what was expected.
    pub fn invalid_message(index: usize, expected: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidMessage,
            format!("frame {index}: expected {expected}"),
        )
        .with_detail("frame", index.to_string())
    }

    /// Receive deadline elapsed; caller should reconnect and retry.
    pub fn timeout(what: impl fmt::Display) -> Self {
        Self::new(ErrorCode::Timeout, format!("{what} timed out; retry advised"))
    }
}

/// Render the full error line: code, message, context, then extras.
fn render(
    code: &ErrorCode,
    message: &str,
    context: &ErrorContext,
    extra: &BTreeMap<String, String>,
) -> String {
    let mut out = format!("[{code}] {message}");
    match context {
        ErrorContext::None => {}
        ErrorContext::Service { name } => out.push_str(&format!(" (service={name})")),
        ErrorContext::Worker { identity, service } => {
            out.push_str(&format!(" (worker={identity}"));
            if let Some(service) = service {
                out.push_str(&format!(" service={service}"));
            }
            out.push(')');
        }
        ErrorContext::Endpoint { address } => out.push_str(&format!(" (endpoint={address})")),
        ErrorContext::Permission {
            user,
            permission,
            organization,
        } => {
            out.push_str(&format!(" (user={user} permission={permission}"));
            if let Some(org) = organization {
                out.push_str(&format!(" org={org}"));
            }
            out.push(')');
        }
        ErrorContext::Organization { id } => out.push_str(&format!(" (org={id})")),
        ErrorContext::Blocked { until } => {
            out.push_str(&format!(" (blocked for {}s)", until.as_secs()));
        }
    }
    for (key, value) in extra {
        out.push_str(&format!(" {key}={value}"));
    }
    out
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_is_pure_on_code() {
        assert!(ErrorCode::Timeout.is_retryable());
        assert!(ErrorCode::SocketError.is_retryable());
        assert!(ErrorCode::BrokerUnavailable.is_retryable());
        assert!(ErrorCode::InvalidMessage.is_permanent());
        assert!(ErrorCode::AuthorizationFailed.is_permanent());
        assert!(ErrorCode::RateLimited.is_permanent());
    }

    #[test]
    fn test_display_includes_code_and_context() {
        let err = Error::new(ErrorCode::AuthorizationFailed, "denied")
            .with_context(ErrorContext::Permission {
                user: "u1".into(),
                permission: "user:update".into(),
                organization: Some(7),
            });
        let text = err.to_string();
        assert!(text.contains("authorization_failed"));
        assert!(text.contains("user:update"));
        assert!(text.contains("org=7"));
    }

    #[test]
    fn test_invalid_message_cites_frame_index() {
        let err = Error::invalid_message(2, "non-empty service name");
        assert_eq!(err.code(), ErrorCode::InvalidMessage);
        assert!(err.to_string().contains("frame 2"));
        assert_eq!(err.extra().get("frame").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_extra_map_round_trip() {
        let err = Error::new(ErrorCode::SocketError, "send failed")
            .with_detail("endpoint", "tcp://127.0.0.1:5555");
        assert!(err.to_string().contains("endpoint=tcp://127.0.0.1:5555"));
    }
}
