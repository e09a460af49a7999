//! Identity and authorization kernel.
//!
//! Password hashing and policy, bearer-token issuance with refresh and
//! revocation, rate limiting with per-principal lockout, and a
//! role/permission evaluator with cached lookups. [`BearerGuard`] ties the
//! pieces to the broker's admission seam.

// Rust guideline compliant 2026-02

pub mod blacklist;
pub mod password;
pub mod rate_limit;
pub mod rbac;
pub mod token;

pub use blacklist::TokenBlacklist;
pub use password::PasswordPolicy;
pub use rate_limit::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use rbac::{
    AccessContext, OrgId, Permission, PermissionCategory, RbacEvaluator, Role, RoleScope, UserId,
};
pub use token::{Claims, TokenConfig, TokenManager, TokenPair, TokenScope, TokenType};

use std::sync::Arc;

use bytes::Bytes;

use crate::broker::RequestGuard;
use crate::error::{Error, ErrorCode, ErrorContext, Result};
use crate::transport::RoutingKey;

/// Broker admission guard: bearer authentication, rate limiting, and
/// resource authorization.
///
/// Expects the first payload frame of a client request to carry an
/// `Authorization`-style value, exactly `Bearer <access-token>`. The
/// request is authorized as `can_access_resource(service, "request")`;
/// services absent from the closed requirement table admit any
/// authenticated caller. The payload travels to the worker unchanged,
/// header frame included.
pub struct BearerGuard {
    tokens: Arc<TokenManager>,
    rbac: Arc<RbacEvaluator>,
    limiter: Option<Arc<RateLimiter>>,
}

impl std::fmt::Debug for BearerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerGuard")
            .field("rate_limited", &self.limiter.is_some())
            .finish()
    }
}

impl BearerGuard {
    /// Guard over a token manager and an RBAC evaluator.
    pub fn new(tokens: Arc<TokenManager>, rbac: Arc<RbacEvaluator>) -> Self {
        Self {
            tokens,
            rbac,
            limiter: None,
        }
    }

    /// Additionally admission-limit requests per source routing key.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }
}

impl RequestGuard for BearerGuard {
    fn authorize(&self, client: &RoutingKey, service: &str, payload: &[Bytes]) -> Result<()> {
        let source = String::from_utf8_lossy(client).into_owned();

        if let Some(limiter) = &self.limiter {
            let (ok, blocked_until) = limiter.allow(&source);
            if !ok {
                let until = blocked_until
                    .map(|t| t.saturating_duration_since(std::time::Instant::now()))
                    .unwrap_or_default();
                return Err(Error::new(ErrorCode::RateLimited, "source rate limited")
                    .with_context(ErrorContext::Blocked { until }));
            }
        }

        let header = payload
            .first()
            .and_then(|frame| std::str::from_utf8(frame).ok())
            .ok_or_else(|| {
                Error::new(
                    ErrorCode::AuthenticationFailed,
                    "request carries no authorization frame",
                )
            })?;
        let token = TokenManager::extract_bearer(header)?;
        let claims = self.tokens.validate(token, TokenType::Access)?;

        let user: UserId = claims.sub.parse().map_err(|_| {
            Error::new(
                ErrorCode::AuthenticationFailed,
                "token subject is not a user id",
            )
            .with_detail("subject", claims.sub.clone())
        })?;
        // Single-org subjects carry their organization context implicitly.
        let organization = match claims.organizations.as_slice() {
            [only] => Some(*only),
            _ => None,
        };

        self.rbac.can_access_resource(&AccessContext {
            user,
            organization,
            resource: service.to_string(),
            action: "request".to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> BearerGuard {
        let tokens = Arc::new(
            TokenManager::new(
                TokenConfig {
                    access_secret: "guard-access-secret".into(),
                    refresh_secret: "guard-refresh-secret".into(),
                    ..TokenConfig::default()
                },
                Arc::new(TokenBlacklist::new()),
            )
            .unwrap(),
        );
        BearerGuard::new(tokens, Arc::new(RbacEvaluator::new()))
    }

    fn bearer_frame(guard: &BearerGuard, subject: &str) -> Bytes {
        let pair = guard.tokens.issue(subject, &TokenScope::default()).unwrap();
        Bytes::from(format!("Bearer {}", pair.access))
    }

    #[test]
    fn test_valid_bearer_admitted_for_ungoverned_service() {
        let guard = guard();
        let frame = bearer_frame(&guard, "42");
        let client = Bytes::from_static(b"peer-1");
        assert!(guard.authorize(&client, "echo", &[frame]).is_ok());
    }

    #[test]
    fn test_missing_header_rejected() {
        let guard = guard();
        let client = Bytes::from_static(b"peer-1");
        let err = guard.authorize(&client, "echo", &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }

    #[test]
    fn test_garbage_token_rejected() {
        let guard = guard();
        let client = Bytes::from_static(b"peer-1");
        let frame = Bytes::from_static(b"Bearer nonsense");
        assert!(guard.authorize(&client, "echo", &[frame]).is_err());
    }

    #[test]
    fn test_non_numeric_subject_rejected() {
        let guard = guard();
        let frame = bearer_frame(&guard, "alice");
        let client = Bytes::from_static(b"peer-1");
        let err = guard.authorize(&client, "echo", &[frame]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }

    #[test]
    fn test_rate_limit_precedes_authentication() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
            burst_size: 1,
            ..RateLimiterConfig::default()
        }));
        let guard = guard().with_rate_limiter(limiter);
        let frame = bearer_frame(&guard, "42");
        let client = Bytes::from_static(b"peer-1");

        assert!(guard.authorize(&client, "echo", &[frame.clone()]).is_ok());
        let err = guard.authorize(&client, "echo", &[frame]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimited);
    }
}
