//! Revoked-token blacklist.
//!
//! Holds revoked token identifiers until their natural expiry. Entries are
//! lazily expired on read and bulk-reaped by [`TokenBlacklist::sweep`], so
//! memory stays bounded by the number of unique live revocations. After a
//! token's own expiry the answer may go either way — safe, because the
//! token itself no longer validates.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Set of revoked token ids with their original expiry instants.
#[derive(Debug, Default)]
pub struct TokenBlacklist {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TokenBlacklist {
    /// Empty blacklist.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `id` as revoked until `expires_at`.
    pub fn blacklist(&self, id: impl Into<String>, expires_at: DateTime<Utc>) {
        self.lock().insert(id.into(), expires_at);
    }

    /// Is `id` currently revoked? Expired entries are removed on read.
    pub fn is_blacklisted(&self, id: &str) -> bool {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(expires_at) if *expires_at > Utc::now() => true,
            Some(_) => {
                entries.remove(id);
                false
            }
            None => false,
        }
    }

    /// Remove every entry whose expiry has passed; returns the count.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    /// Number of tracked revocations (live or awaiting reap).
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
