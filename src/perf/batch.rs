//! Per-destination outbound message batcher.
//!
//! Messages accumulate per destination and flush when either the batch
//! reaches `max_batch_size` or `flush_interval` elapses since the batch
//! started. The flush callback always runs with the batcher's lock
//! released, so callbacks may re-enter the batcher freely.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One buffered logical message (a frame sequence).
pub type BatchedMessage = Vec<Bytes>;

/// Callback invoked with a destination and its drained batch.
pub type FlushFn = dyn Fn(&str, Vec<BatchedMessage>) + Send + Sync;

struct Batch {
    messages: Vec<BatchedMessage>,
    started: Instant,
}

/// Accumulates outbound messages per destination and flushes by size or
/// age.
pub struct MessageBatcher {
    max_batch_size: usize,
    flush_interval: Duration,
    flush: Arc<FlushFn>,
    batches: Mutex<HashMap<String, Batch>>,
}

impl std::fmt::Debug for MessageBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBatcher")
            .field("max_batch_size", &self.max_batch_size)
            .field("flush_interval", &self.flush_interval)
            .finish()
    }
}

impl MessageBatcher {
    /// Batcher flushing through `flush`.
    pub fn new(
        max_batch_size: usize,
        flush_interval: Duration,
        flush: impl Fn(&str, Vec<BatchedMessage>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            flush_interval,
            flush: Arc::new(flush),
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Queue one message for `destination`, flushing if the batch filled.
    pub fn push(&self, destination: &str, message: BatchedMessage) {
        let full = {
            let mut batches = self.lock();
            let batch = batches
                .entry(destination.to_string())
                .or_insert_with(|| Batch {
                    messages: Vec::new(),
                    started: Instant::now(),
                });
            batch.messages.push(message);
            if batch.messages.len() >= self.max_batch_size {
                batches.remove(destination)
            } else {
                None
            }
        };
        // Lock released before the callback runs.
        if let Some(batch) = full {
            (self.flush)(destination, batch.messages);
        }
    }

    /// Flush batches older than the flush interval. Returns batch count.
    pub fn flush_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<(String, Batch)> = {
            let mut batches = self.lock();
            let keys: Vec<String> = batches
                .iter()
                .filter(|(_, b)| now.duration_since(b.started) >= self.flush_interval)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| batches.remove(&k).map(|b| (k, b)))
                .collect()
        };
        let count = due.len();
        for (destination, batch) in due {
            (self.flush)(&destination, batch.messages);
        }
        count
    }

    /// Flush everything unconditionally. Returns batch count.
    pub fn flush_all(&self) -> usize {
        let drained: Vec<(String, Batch)> = {
            let mut batches = self.lock();
            batches.drain().collect()
        };
        let count = drained.len();
        for (destination, batch) in drained {
            (self.flush)(&destination, batch.messages);
        }
        count
    }

    /// Buffered message count for `destination`.
    pub fn pending(&self, destination: &str) -> usize {
        self.lock()
            .get(destination)
            .map_or(0, |b| b.messages.len())
    }

    /// Spawn a periodic age-based flusher; stops (after one final
    /// `flush_all`) when `cancel` fires.
    pub fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let batcher = Arc::clone(self);
        let tick = batcher.flush_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        batcher.flush_all();
                        break;
                    }
                    _ = interval.tick() => {
                        batcher.flush_due();
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Batch>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner())
    }
}
