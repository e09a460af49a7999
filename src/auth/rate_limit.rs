//! Admission rate limiting and principal lockout.
//!
//! Two orthogonal mechanisms share one limiter:
//!
//! 1. **Source admission** — per source key (IP or logical origin), a
//!    token bucket refilled at `requests_per_minute` with `burst_size`
//!    capacity; exhausting it blocks the source for `block_duration`.
//! 2. **Principal lockout** — per identifier (email/username), failed
//!    attempts accumulate; reaching `max_failed_attempts` locks the
//!    principal for `lockout_duration`. A success clears the counter, and
//!    attempts older than the lockout window reset it on the next failure.
//!
//! A background sweeper drops entries idle beyond a safety horizon so the
//! maps stay bounded by recent traffic.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Tuning knobs for the limiter.
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Sustained refill rate per source.
    pub requests_per_minute: u32,
    /// Bucket capacity per source.
    pub burst_size: u32,
    /// How long an exhausted source stays blocked.
    pub block_duration: Duration,
    /// Failed attempts before a principal locks.
    pub max_failed_attempts: u32,
    /// Lockout length; also the staleness window for failure counting.
    pub lockout_duration: Duration,
    /// Idle horizon for the background sweeper.
    pub idle_horizon: Duration,
    /// Sweep cadence.
    pub sweep_interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
            block_duration: Duration::from_secs(60),
            max_failed_attempts: 5,
            lockout_duration: Duration::from_secs(15 * 60),
            idle_horizon: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug)]
struct SourceBucket {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
    last_activity: Instant,
}

#[derive(Debug)]
struct PrincipalRecord {
    failed_attempts: u32,
    last_failure: Instant,
    locked_until: Option<Instant>,
    last_activity: Instant,
}

#[derive(Debug, Default)]
struct LimiterState {
    sources: HashMap<String, SourceBucket>,
    principals: HashMap<String, PrincipalRecord>,
}

/// Point-in-time counters for introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStats {
    /// Sources currently tracked.
    pub tracked_sources: usize,
    /// Sources currently blocked.
    pub blocked_sources: usize,
    /// Principals currently tracked.
    pub tracked_principals: usize,
    /// Principals currently locked.
    pub locked_principals: usize,
}

/// Token-bucket admission plus failed-attempt lockout.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Limiter with the given tuning.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// May `source` proceed right now?
    ///
    /// Returns `(true, None)` and consumes one bucket token, or
    /// `(false, Some(blocked_until))`.
    pub fn allow(&self, source: &str) -> (bool, Option<Instant>) {
        self.allow_at(source, Instant::now())
    }

    /// Record a failed authentication attempt for `principal`.
    pub fn record_fail(&self, principal: &str) {
        self.record_fail_at(principal, Instant::now());
    }

    /// Record a successful authentication for `principal`, clearing its
    /// failure counter and any lock.
    pub fn record_success(&self, principal: &str) {
        let mut state = self.lock();
        state.principals.remove(principal);
    }

    /// Is `principal` locked out, and until when?
    pub fn is_locked(&self, principal: &str) -> (bool, Option<Instant>) {
        self.is_locked_at(principal, Instant::now())
    }

    /// Current counters.
    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let state = self.lock();
        RateLimiterStats {
            tracked_sources: state.sources.len(),
            blocked_sources: state
                .sources
                .values()
                .filter(|s| s.blocked_until.is_some_and(|t| t > now))
                .count(),
            tracked_principals: state.principals.len(),
            locked_principals: state
                .principals
                .values()
                .filter(|p| p.locked_until.is_some_and(|t| t > now))
                .count(),
        }
    }

    /// Drop source and principal entries idle beyond the configured
    /// horizon (blocked/locked entries are kept). Returns entries removed.
    pub fn sweep_idle(&self) -> usize {
        let now = Instant::now();
        let horizon = self.config.idle_horizon;
        let mut state = self.lock();
        let before = state.sources.len() + state.principals.len();
        state.sources.retain(|_, s| {
            s.blocked_until.is_some_and(|t| t > now)
                || now.duration_since(s.last_activity) < horizon
        });
        state.principals.retain(|_, p| {
            p.locked_until.is_some_and(|t| t > now)
                || now.duration_since(p.last_activity) < horizon
        });
        before - (state.sources.len() + state.principals.len())
    }

    /// Spawn the periodic idle sweeper; stops when `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = limiter.sweep_idle();
                        if removed > 0 {
                            log::debug!("rate limiter swept {removed} idle entries");
                        }
                    }
                }
            }
        })
    }

    // ─── Clock-injected internals (testable) ───────────────────────────────

    fn allow_at(&self, source: &str, now: Instant) -> (bool, Option<Instant>) {
        let config = &self.config;
        let mut state = self.lock();
        let bucket = state
            .sources
            .entry(source.to_string())
            .or_insert_with(|| SourceBucket {
                tokens: f64::from(config.burst_size),
                last_refill: now,
                blocked_until: None,
                last_activity: now,
            });
        bucket.last_activity = now;

        if let Some(until) = bucket.blocked_until {
            if until > now {
                return (false, Some(until));
            }
            bucket.blocked_until = None;
        }

        // Refill at the sustained rate, capped at burst capacity.
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        let rate_per_sec = f64::from(config.requests_per_minute) / 60.0;
        bucket.tokens =
            (bucket.tokens + elapsed * rate_per_sec).min(f64::from(config.burst_size));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            (true, None)
        } else {
            let until = now + config.block_duration;
            bucket.blocked_until = Some(until);
            log::warn!("source {source} rate limited until {until:?}");
            (false, Some(until))
        }
    }

    fn record_fail_at(&self, principal: &str, now: Instant) {
        let config = &self.config;
        let mut state = self.lock();
        let record = state
            .principals
            .entry(principal.to_string())
            .or_insert_with(|| PrincipalRecord {
                failed_attempts: 0,
                last_failure: now,
                locked_until: None,
                last_activity: now,
            });

        // Stale failures do not count toward the lockout threshold.
        if now.duration_since(record.last_failure) > config.lockout_duration {
            record.failed_attempts = 0;
        }
        record.failed_attempts += 1;
        record.last_failure = now;
        record.last_activity = now;

        if record.failed_attempts >= config.max_failed_attempts {
            let until = now + config.lockout_duration;
            record.locked_until = Some(until);
            log::warn!(
                "principal {principal} locked out after {} failed attempts",
                record.failed_attempts
            );
        }
    }

    fn is_locked_at(&self, principal: &str, now: Instant) -> (bool, Option<Instant>) {
        let state = self.lock();
        match state.principals.get(principal).and_then(|p| p.locked_until) {
            Some(until) if until > now => (true, Some(until)),
            _ => (false, None),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
