//! Password policy: strength validation and salted slow hashing.
//!
//! Hashing is Argon2id through the `argon2` crate. The policy's `cost`
//! knob (default 12) maps to a memory cost of `2^cost` KiB — 4 MiB at the
//! default — with a fixed iteration count; raising the knob by one doubles
//! the memory bill. Verification delegates to `verify_password`, which is
//! constant-time at the primitive level.

// Rust guideline compliant 2026-02

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2, Params,
};

use crate::error::{Error, ErrorCode, Result};

/// Known keyboard/alphabet runs checked for sequential patterns.
const SEQUENCES: &[&str] = &[
    "abcdefghijklmnopqrstuvwxyz",
    "0123456789",
    "qwertyuiop",
    "asdfghjkl",
    "zxcvbnm",
];

/// Fixed list of passwords rejected outright (compared case-insensitively).
const COMMON_PASSWORDS: &[&str] = &[
    "password", "password1", "123456", "12345678", "123456789", "qwerty", "letmein", "welcome",
    "admin", "iloveyou", "monkey", "dragon", "sunshine", "princess", "football",
];

/// Password strength and hashing policy.
#[derive(Debug, Clone)]
pub struct PasswordPolicy {
    /// Minimum accepted length.
    pub min_length: usize,
    /// Maximum accepted length.
    pub max_length: usize,
    /// Require at least one uppercase letter.
    pub require_upper: bool,
    /// Require at least one lowercase letter.
    pub require_lower: bool,
    /// Require at least one digit.
    pub require_digit: bool,
    /// Require at least one non-alphanumeric character.
    pub require_special: bool,
    /// Hashing cost factor; memory cost is `2^cost` KiB.
    pub cost: u32,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 128,
            require_upper: true,
            require_lower: true,
            require_digit: true,
            require_special: true,
            cost: 12,
        }
    }
}

impl PasswordPolicy {
    /// Validate `password` against the policy.
    ///
    /// Checks length bounds, required character classes, and the weak
    /// pattern set: 3+ character runs from known sequences, three
    /// identical consecutive characters, and the common-password list.
    pub fn validate(&self, password: &str) -> Result<()> {
        let length = password.chars().count();
        if length < self.min_length || length > self.max_length {
            return Err(weak(format!(
                "length must be between {} and {} characters",
                self.min_length, self.max_length
            )));
        }

        if self.require_upper && !password.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(weak("must contain an uppercase letter"));
        }
        if self.require_lower && !password.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(weak("must contain a lowercase letter"));
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(weak("must contain a digit"));
        }
        if self.require_special && password.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(weak("must contain a special character"));
        }

        if COMMON_PASSWORDS.contains(&password.to_ascii_lowercase().as_str()) {
            return Err(weak("matches a commonly used password"));
        }
        if has_triple_repeat(password) {
            return Err(weak("contains three identical consecutive characters"));
        }
        if has_sequential_run(password, 3) {
            return Err(weak("contains a sequential character run"));
        }
        Ok(())
    }

    /// Validate then hash `password` into a PHC-format string.
    pub fn hash(&self, password: &str) -> Result<String> {
        self.validate(password)?;
        let salt = SaltString::generate(&mut OsRng);
        let hashed = self
            .hasher()?
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                Error::new(ErrorCode::Internal, "password hashing failed").with_detail(
                    "cause",
                    e.to_string(),
                )
            })?;
        Ok(hashed.to_string())
    }

    /// Check `password` against a stored hash.
    ///
    /// Returns `Ok(true)` on match, `Ok(false)` on mismatch, and an error
    /// only for an unparseable stored hash.
    pub fn verify(&self, hash: &str, password: &str) -> Result<bool> {
        let parsed = PasswordHash::new(hash).map_err(|e| {
            Error::new(ErrorCode::Internal, "stored password hash is malformed")
                .with_detail("cause", e.to_string())
        })?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    /// Score `password` from 0 (hopeless) to 100.
    ///
    /// Length thresholds and character-class coverage earn points; weak
    /// patterns take them back.
    pub fn strength(&self, password: &str) -> u8 {
        let length = password.chars().count();
        let mut score: i32 = 0;

        if length >= self.min_length {
            score += 25;
        }
        if length >= 12 {
            score += 15;
        }
        if length >= 16 {
            score += 10;
        }

        if password.chars().any(|c| c.is_ascii_uppercase()) {
            score += 10;
        }
        if password.chars().any(|c| c.is_ascii_lowercase()) {
            score += 10;
        }
        if password.chars().any(|c| c.is_ascii_digit()) {
            score += 10;
        }
        if password.chars().any(|c| !c.is_ascii_alphanumeric()) {
            score += 20;
        }

        if COMMON_PASSWORDS.contains(&password.to_ascii_lowercase().as_str()) {
            score -= 60;
        }
        if has_triple_repeat(password) {
            score -= 20;
        }
        if has_sequential_run(password, 3) {
            score -= 20;
        }

        score.clamp(0, 100) as u8
    }

    fn hasher(&self) -> Result<Argon2<'static>> {
        let params = Params::new(1 << self.cost, 3, 1, None).map_err(|e| {
            Error::new(ErrorCode::Internal, "invalid hashing parameters")
                .with_detail("cause", e.to_string())
        })?;
        Ok(Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            params,
        ))
    }
}

fn weak(reason: impl std::fmt::Display) -> Error {
    Error::new(
        ErrorCode::AuthenticationFailed,
        format!("weak password: {reason}"),
    )
}

fn has_triple_repeat(password: &str) -> bool {
    let chars: Vec<char> = password.chars().collect();
    chars.windows(3).any(|w| w[0] == w[1] && w[1] == w[2])
}

/// True if `password` contains a run of `min_run` or more characters taken
/// in order (forward or reverse) from one of the known sequences.
fn has_sequential_run(password: &str, min_run: usize) -> bool {
    let lower = password.to_ascii_lowercase();
    for sequence in SEQUENCES {
        let reversed: String = sequence.chars().rev().collect();
        for candidate in [*sequence, reversed.as_str()] {
            for start in 0..=candidate.len().saturating_sub(min_run) {
                let run = &candidate[start..start + min_run];
                if lower.contains(run) {
                    return true;
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cheap policy so tests do not pay the full 4 MiB Argon2 bill.
    fn fast_policy() -> PasswordPolicy {
        PasswordPolicy {
            cost: 6,
            ..PasswordPolicy::default()
        }
    }

    #[test]
    fn test_validate_accepts_strong_password() {
        let policy = PasswordPolicy::default();
        assert!(policy.validate("Tr4il!mix-9Kpq").is_ok());
    }

    #[test]
    fn test_validate_rejects_short_and_long() {
        let policy = PasswordPolicy::default();
        assert!(policy.validate("Sh0rt!").is_err());
        let long = format!("Aa1!{}", "x".repeat(130));
        assert!(policy.validate(&long).is_err());
    }

    #[test]
    fn test_validate_rejects_missing_classes() {
        let policy = PasswordPolicy::default();
        assert!(policy.validate("lowercase-only-9!").is_err()); // no upper
        assert!(policy.validate("UPPERCASE-ONLY-9!").is_err()); // no lower
        assert!(policy.validate("NoDigitsHere!!").is_err());
        assert!(policy.validate("NoSpecial999x").is_err());
    }

    #[test]
    fn test_validate_rejects_weak_patterns() {
        let policy = PasswordPolicy::default();
        // Sequential run ("abc").
        assert!(policy.validate("Rtyabc-9Q!").is_err());
        // Sequential digits ("456").
        assert!(policy.validate("Kp!456wXz").is_err());
        // Triple repeat.
        assert!(policy.validate("Kaaa9!-wXz").is_err());
        // Common password, case-insensitive.
        assert!(policy.validate("Password1").is_err());
    }

    #[test]
    fn test_hash_verify_round_trip() {
        let policy = fast_policy();
        let hash = policy.hash("Tr4il!mix-9Kpq").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(policy.verify(&hash, "Tr4il!mix-9Kpq").unwrap());
        assert!(!policy.verify(&hash, "Tr4il!mix-9Kpr").unwrap());
    }

    #[test]
    fn test_hash_salts_differ() {
        let policy = fast_policy();
        let a = policy.hash("Tr4il!mix-9Kpq").unwrap();
        let b = policy.hash("Tr4il!mix-9Kpq").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_refuses_weak_password() {
        let policy = fast_policy();
        assert!(policy.hash("password").is_err());
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        let policy = fast_policy();
        assert!(policy.verify("not-a-phc-string", "whatever").is_err());
    }

    #[test]
    fn test_strength_ordering() {
        let policy = PasswordPolicy::default();
        let weak = policy.strength("password");
        let medium = policy.strength("Kpq9wXzu");
        let strong = policy.strength("Tr4il!mix-9Kpq-fjord");
        assert!(weak < medium, "{weak} < {medium}");
        assert!(medium < strong, "{medium} < {strong}");
        assert_eq!(policy.strength(""), 0);
        assert!(strong <= 100);
    }

    #[test]
    fn test_strength_penalizes_patterns() {
        let policy = PasswordPolicy::default();
        let with_run = policy.strength("Xk9!qrabcdWt");
        let without = policy.strength("Xk9!qrZmWtPu");
        assert!(with_run < without);
    }
}
