//! Monotonic traffic counters and a bounded latency ring.
//!
//! Counters are lock-free atomics; the latency ring keeps the most recent
//! 1000 request latencies under a mutex and is summarized (min/avg/max)
//! in the snapshot together with uptime-derived throughput.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Latency samples retained for the rolling summary.
const LATENCY_RING_CAPACITY: usize = 1000;

/// Point-in-time metrics summary.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Messages sent.
    pub messages_sent: u64,
    /// Messages received.
    pub messages_received: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Bytes received.
    pub bytes_received: u64,
    /// Errors observed.
    pub errors: u64,
    /// Smallest latency in the ring, if any samples exist.
    pub min_latency: Option<Duration>,
    /// Mean latency over the ring.
    pub avg_latency: Option<Duration>,
    /// Largest latency in the ring.
    pub max_latency: Option<Duration>,
    /// Time since the metrics were created.
    pub uptime: Duration,
    /// Sent messages per second of uptime.
    pub throughput_per_sec: f64,
}

/// Monotonic counters plus a bounded ring of recent request latencies.
#[derive(Debug)]
pub struct Metrics {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    latencies: Mutex<VecDeque<Duration>>,
    started: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Zeroed metrics starting now.
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(LATENCY_RING_CAPACITY)),
            started: Instant::now(),
        }
    }

    /// Count one outbound message of `bytes` length.
    pub fn record_send(&self, bytes: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count one inbound message of `bytes` length.
    pub fn record_receive(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count one error.
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one request latency, evicting the oldest past capacity.
    pub fn record_latency(&self, latency: Duration) {
        let mut ring = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == LATENCY_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(latency);
    }

    /// Current summary.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let ring = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        let (min, max, avg) = if ring.is_empty() {
            (None, None, None)
        } else {
            let min = ring.iter().min().copied();
            let max = ring.iter().max().copied();
            let total: Duration = ring.iter().sum();
            (min, max, Some(total / ring.len() as u32))
        };
        drop(ring);

        let uptime = self.started.elapsed();
        let sent = self.messages_sent.load(Ordering::Relaxed);
        let throughput = if uptime.as_secs_f64() > 0.0 {
            sent as f64 / uptime.as_secs_f64()
        } else {
            0.0
        };

        MetricsSnapshot {
            messages_sent: sent,
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            min_latency: min,
            avg_latency: avg,
            max_latency: max,
            uptime,
            throughput_per_sec: throughput,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = Metrics::new();
        metrics.record_send(100);
        metrics.record_send(50);
        metrics.record_receive(25);
        metrics.record_error();

        let snap = metrics.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 25);
        assert_eq!(snap.errors, 1);
        assert!(snap.throughput_per_sec > 0.0);
    }

    #[test]
    fn test_latency_summary() {
        let metrics = Metrics::new();
        assert!(metrics.snapshot().min_latency.is_none());

        metrics.record_latency(Duration::from_millis(10));
        metrics.record_latency(Duration::from_millis(30));
        metrics.record_latency(Duration::from_millis(20));

        let snap = metrics.snapshot();
        assert_eq!(snap.min_latency, Some(Duration::from_millis(10)));
        assert_eq!(snap.max_latency, Some(Duration::from_millis(30)));
        assert_eq!(snap.avg_latency, Some(Duration::from_millis(20)));
    }

    #[test]
    fn test_latency_ring_bounded() {
        let metrics = Metrics::new();
        for i in 0..1500u64 {
            metrics.record_latency(Duration::from_micros(i));
        }
        let snap = metrics.snapshot();
        // The oldest 500 samples were evicted.
        assert_eq!(snap.min_latency, Some(Duration::from_micros(500)));
        assert_eq!(snap.max_latency, Some(Duration::from_micros(1499)));
    }
}
