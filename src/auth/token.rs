//! Bearer-token issuance, validation, rotation, and revocation.
//!
//! Tokens are HS256 JWTs signed with type-specific secrets: an access
//! token never validates under the refresh secret and vice versa. Access
//! tokens are short-lived and carry the subject's organizations, roles,
//! and permissions; refresh tokens are long-lived and carry identity only.
//!
//! A token is valid iff its signature verifies under the secret for the
//! expected type, the `token_type` claim matches the usage site, `now`
//! falls inside `[nbf, exp)`, and its id is not blacklisted.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::auth::blacklist::TokenBlacklist;
use crate::error::{Error, ErrorCode, Result};

/// Usage site a token is minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// Short-lived, carries authorization scope.
    Access,
    /// Long-lived, identity only; exchanged for new pairs.
    Refresh,
}

impl TokenType {
    /// Claim value for this type.
    pub fn as_str(self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

/// JWT claim set for both token types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Unique token id (time + counter; strictly monotonic per process).
    pub jti: String,
    /// Subject (user identifier).
    pub sub: String,
    /// Issuer.
    pub iss: String,
    /// Issued-at, epoch seconds.
    pub iat: i64,
    /// Not-before, epoch seconds; equals `iat`.
    pub nbf: i64,
    /// Expiry, epoch seconds.
    pub exp: i64,
    /// `access` or `refresh`.
    pub token_type: String,
    /// Organization memberships (access tokens only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<i64>,
    /// Role names (access tokens only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    /// Permission strings (access tokens only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    /// Most recent login, epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_login_at: Option<i64>,
}

impl Claims {
    /// Expiry as a UTC timestamp.
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Authorization scope embedded in a freshly issued access token.
#[derive(Debug, Clone, Default)]
pub struct TokenScope {
    /// Organization memberships.
    pub organizations: Vec<i64>,
    /// Role names.
    pub roles: Vec<String>,
    /// Permission strings.
    pub permissions: Vec<String>,
}

/// An issued access/refresh pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    /// Signed access token.
    pub access: String,
    /// Signed refresh token.
    pub refresh: String,
    /// Access-token expiry.
    pub access_expires_at: DateTime<Utc>,
    /// Refresh-token expiry.
    pub refresh_expires_at: DateTime<Utc>,
}

/// Signing configuration for a token manager.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// Secret for access tokens.
    pub access_secret: String,
    /// Secret for refresh tokens (must differ from the access secret).
    pub refresh_secret: String,
    /// `iss` claim stamped on every token.
    pub issuer: String,
    /// Access-token lifetime (minutes scale).
    pub access_ttl: Duration,
    /// Refresh-token lifetime (days scale).
    pub refresh_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            access_secret: String::new(),
            refresh_secret: String::new(),
            issuer: "crossbar".to_string(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Process-wide counter feeding the monotonic jti source.
static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_token_id() -> String {
    let n = TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", Utc::now().timestamp_micros(), n)
}

/// Issues, validates, rotates, and revokes bearer tokens.
pub struct TokenManager {
    config: TokenConfig,
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    blacklist: Arc<TokenBlacklist>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("issuer", &self.config.issuer)
            .field("access_ttl", &self.config.access_ttl)
            .field("refresh_ttl", &self.config.refresh_ttl)
            .finish()
    }
}

impl TokenManager {
    /// Manager over `config`, sharing `blacklist` with whoever sweeps it.
    pub fn new(config: TokenConfig, blacklist: Arc<TokenBlacklist>) -> Result<Self> {
        if config.access_secret.is_empty() || config.refresh_secret.is_empty() {
            return Err(Error::new(
                ErrorCode::Internal,
                "token secrets must be configured",
            ));
        }
        if config.access_secret == config.refresh_secret {
            return Err(Error::new(
                ErrorCode::Internal,
                "access and refresh secrets must differ",
            ));
        }
        Ok(Self {
            access_encoding: EncodingKey::from_secret(config.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_bytes()),
            config,
            blacklist,
        })
    }

    /// The shared blacklist.
    pub fn blacklist(&self) -> &Arc<TokenBlacklist> {
        &self.blacklist
    }

    /// Issue a fresh access/refresh pair for `subject`.
    ///
    /// The access token carries the full scope; the refresh token omits
    /// organizations, roles, and permissions.
    pub fn issue(&self, subject: &str, scope: &TokenScope) -> Result<TokenPair> {
        let now = Utc::now();
        self.issue_at(subject, scope, now, Some(now.timestamp()))
    }

    fn issue_at(
        &self,
        subject: &str,
        scope: &TokenScope,
        now: DateTime<Utc>,
        last_login_at: Option<i64>,
    ) -> Result<TokenPair> {
        let access_exp = now
            + chrono::Duration::from_std(self.config.access_ttl)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let refresh_exp = now
            + chrono::Duration::from_std(self.config.refresh_ttl)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let access_claims = Claims {
            jti: next_token_id(),
            sub: subject.to_string(),
            iss: self.config.issuer.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: access_exp.timestamp(),
            token_type: TokenType::Access.as_str().to_string(),
            organizations: scope.organizations.clone(),
            roles: scope.roles.clone(),
            permissions: scope.permissions.clone(),
            last_login_at,
        };
        let refresh_claims = Claims {
            jti: next_token_id(),
            sub: subject.to_string(),
            iss: self.config.issuer.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: refresh_exp.timestamp(),
            token_type: TokenType::Refresh.as_str().to_string(),
            organizations: Vec::new(),
            roles: Vec::new(),
            permissions: Vec::new(),
            last_login_at,
        };

        Ok(TokenPair {
            access: self.sign(&access_claims, TokenType::Access)?,
            refresh: self.sign(&refresh_claims, TokenType::Refresh)?,
            access_expires_at: access_exp,
            refresh_expires_at: refresh_exp,
        })
    }

    /// Validate `token` for use as `expected` and return its claims.
    pub fn validate(&self, token: &str, expected: TokenType) -> Result<Claims> {
        let key = match expected {
            TokenType::Access => &self.access_decoding,
            TokenType::Refresh => &self.refresh_decoding,
        };
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_issuer(&[&self.config.issuer]);

        let claims = decode::<Claims>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(map_jwt_error)?;

        if claims.token_type != expected.as_str() {
            return Err(token_error("type_mismatch", "token type does not match usage"));
        }
        if self.blacklist.is_blacklisted(&claims.jti) {
            return Err(token_error("revoked", "token has been revoked"));
        }
        Ok(claims)
    }

    /// Rotate a refresh token: validate it, revoke it until its original
    /// expiry, and issue a new pair derived from the validated claims with
    /// `last_login_at` refreshed to now.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.validate(refresh_token, TokenType::Refresh)?;
        self.blacklist.blacklist(&claims.jti, claims.expires_at());

        let scope = TokenScope {
            organizations: claims.organizations.clone(),
            roles: claims.roles.clone(),
            permissions: claims.permissions.clone(),
        };
        let now = Utc::now();
        self.issue_at(&claims.sub, &scope, now, Some(now.timestamp()))
    }

    /// Revoke `token` (of the given type) until its original expiry.
    pub fn revoke(&self, token: &str, token_type: TokenType) -> Result<()> {
        let claims = self.validate(token, token_type)?;
        self.blacklist.blacklist(&claims.jti, claims.expires_at());
        Ok(())
    }

    /// Extract the token from an `Authorization`-style header value.
    ///
    /// Accepts exactly `Bearer <token>`.
    pub fn extract_bearer(header: &str) -> Result<&str> {
        match header.split_once(' ') {
            Some(("Bearer", token)) if !token.is_empty() && !token.contains(' ') => Ok(token),
            _ => Err(token_error("malformed", "expected `Bearer <token>`")),
        }
    }

    fn sign(&self, claims: &Claims, token_type: TokenType) -> Result<String> {
        let key = match token_type {
            TokenType::Access => &self.access_encoding,
            TokenType::Refresh => &self.refresh_encoding,
        };
        encode(&Header::new(Algorithm::HS256), claims, key).map_err(|e| {
            Error::new(ErrorCode::Internal, "token signing failed").with_detail(
                "cause",
                e.to_string(),
            )
        })
    }
}

fn token_error(reason: &str, message: &str) -> Error {
    let code = match reason {
        "expired" => ErrorCode::Expired,
        _ => ErrorCode::AuthenticationFailed,
    };
    Error::new(code, message).with_detail("reason", reason)
}

fn map_jwt_error(error: jsonwebtoken::errors::Error) -> Error {
    use jsonwebtoken::errors::ErrorKind;
    match error.kind() {
        ErrorKind::ExpiredSignature => token_error("expired", "token has expired"),
        ErrorKind::ImmatureSignature => token_error("not_yet_valid", "token is not yet valid"),
        ErrorKind::InvalidSignature => token_error("invalid_signature", "signature mismatch"),
        ErrorKind::InvalidIssuer => token_error("invalid_signature", "issuer mismatch"),
        _ => token_error("malformed", "token could not be decoded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenManager {
        TokenManager::new(
            TokenConfig {
                access_secret: "access-secret-for-tests".into(),
                refresh_secret: "refresh-secret-for-tests".into(),
                ..TokenConfig::default()
            },
            Arc::new(TokenBlacklist::new()),
        )
        .unwrap()
    }

    fn scope() -> TokenScope {
        TokenScope {
            organizations: vec![7],
            roles: vec!["state-admin".into()],
            permissions: vec!["user:read".into(), "user:update".into()],
        }
    }

    #[test]
    fn test_issue_and_validate_access() {
        let manager = manager();
        let pair = manager.issue("user-42", &scope()).unwrap();

        let claims = manager.validate(&pair.access, TokenType::Access).unwrap();
        assert_eq!(claims.sub, "user-42");
        assert_eq!(claims.token_type, "access");
        assert_eq!(claims.organizations, vec![7]);
        assert_eq!(claims.roles, vec!["state-admin"]);
        assert_eq!(claims.nbf, claims.iat);
    }

    #[test]
    fn test_refresh_token_omits_scope() {
        let manager = manager();
        let pair = manager.issue("user-42", &scope()).unwrap();

        let claims = manager.validate(&pair.refresh, TokenType::Refresh).unwrap();
        assert!(claims.organizations.is_empty());
        assert!(claims.roles.is_empty());
        assert!(claims.permissions.is_empty());
    }

    #[test]
    fn test_type_mismatch_rejected_both_ways() {
        let manager = manager();
        let pair = manager.issue("user-42", &scope()).unwrap();

        // Wrong secret ⇒ signature failure before the claim check.
        let err = manager.validate(&pair.access, TokenType::Refresh).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
        let err = manager.validate(&pair.refresh, TokenType::Access).unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
    }

    #[test]
    fn test_token_ids_unique_and_monotonic_source() {
        let manager = manager();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let pair = manager.issue("u", &TokenScope::default()).unwrap();
            let access = manager.validate(&pair.access, TokenType::Access).unwrap();
            let refresh = manager.validate(&pair.refresh, TokenType::Refresh).unwrap();
            assert!(seen.insert(access.jti.clone()));
            assert!(seen.insert(refresh.jti.clone()));
        }
    }

    #[test]
    fn test_refresh_revokes_old_and_issues_new() {
        let manager = manager();
        let p1 = manager.issue("user-42", &scope()).unwrap();

        let p2 = manager.refresh(&p1.refresh).unwrap();

        // Old refresh token is revoked until its original expiry.
        let err = manager.validate(&p1.refresh, TokenType::Refresh).unwrap_err();
        assert_eq!(err.extra().get("reason").map(String::as_str), Some("revoked"));

        // New pair validates; last_login_at was refreshed.
        let claims = manager.validate(&p2.access, TokenType::Access).unwrap();
        assert!(claims.last_login_at.is_some());
        assert!(manager.validate(&p2.refresh, TokenType::Refresh).is_ok());
    }

    #[test]
    fn test_revoke_access_token() {
        let manager = manager();
        let pair = manager.issue("user-42", &scope()).unwrap();

        manager.revoke(&pair.access, TokenType::Access).unwrap();
        let err = manager.validate(&pair.access, TokenType::Access).unwrap_err();
        assert_eq!(err.extra().get("reason").map(String::as_str), Some("revoked"));

        // The refresh token is untouched.
        assert!(manager.validate(&pair.refresh, TokenType::Refresh).is_ok());
    }

    #[test]
    fn test_expired_token_rejected() {
        let manager = TokenManager::new(
            TokenConfig {
                access_secret: "access-secret-for-tests".into(),
                refresh_secret: "refresh-secret-for-tests".into(),
                access_ttl: Duration::from_secs(0),
                ..TokenConfig::default()
            },
            Arc::new(TokenBlacklist::new()),
        )
        .unwrap();

        let pair = manager.issue("user-42", &TokenScope::default()).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        let err = manager.validate(&pair.access, TokenType::Access).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Expired);
    }

    #[test]
    fn test_garbage_token_is_malformed() {
        let manager = manager();
        let err = manager
            .validate("definitely-not-a-jwt", TokenType::Access)
            .unwrap_err();
        assert_eq!(err.extra().get("reason").map(String::as_str), Some("malformed"));
    }

    #[test]
    fn test_extract_bearer() {
        assert_eq!(TokenManager::extract_bearer("Bearer abc.def.ghi").unwrap(), "abc.def.ghi");
        assert!(TokenManager::extract_bearer("bearer abc").is_err());
        assert!(TokenManager::extract_bearer("Bearer").is_err());
        assert!(TokenManager::extract_bearer("Bearer ").is_err());
        assert!(TokenManager::extract_bearer("Bearer two parts").is_err());
        assert!(TokenManager::extract_bearer("Basic abc").is_err());
    }

    #[test]
    fn test_manager_refuses_shared_or_missing_secrets() {
        let shared = TokenConfig {
            access_secret: "same".into(),
            refresh_secret: "same".into(),
            ..TokenConfig::default()
        };
        assert!(TokenManager::new(shared, Arc::new(TokenBlacklist::new())).is_err());

        let missing = TokenConfig::default();
        assert!(TokenManager::new(missing, Arc::new(TokenBlacklist::new())).is_err());
    }
}
