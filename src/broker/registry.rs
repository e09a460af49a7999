//! Worker registry and service table.
//!
//! The broker's dispatch loop is the sole owner of this structure, so no
//! locking happens here. Workers are keyed by their transport routing key;
//! the registry is the single owner of worker state, and the two waiting
//! lists (broker-global and per-service) hold non-owning routing-key
//! references into it. Eviction removes a worker from both lists
//! atomically, preserving the at-most-once invariant for each list.
//!
//! Dispatch pairing is strict FIFO on both sides: the oldest queued
//! request goes to the oldest waiting worker.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::Bytes;

use crate::constants::HEARTBEAT_EXPIRY;
use crate::error::{Error, ErrorCode, ErrorContext, Result};
use crate::protocol::is_reserved_service;
use crate::transport::RoutingKey;

/// Worker lifecycle state after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// In both waiting lists, eligible for dispatch.
    Waiting,
    /// Processing a dispatched request.
    Busy,
}

/// Broker-side record of one worker.
#[derive(Debug)]
pub struct WorkerHandle {
    /// Transport routing key (identity).
    pub identity: RoutingKey,
    /// Service binding; set exactly once on READY, never changed.
    pub service: String,
    /// Deadline after which the worker is presumed dead.
    pub expiry: Instant,
    /// Requests dispatched to this worker over its lifetime.
    pub total_requests: u64,
    /// Waiting/busy state.
    pub state: WorkerState,
}

/// A request queued at a service, awaiting a free worker.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    /// Request-store id.
    pub id: String,
    /// Originating client routing key.
    pub client: RoutingKey,
    /// Payload frames.
    pub payload: Vec<Bytes>,
}

/// One named service: FIFO request queue plus FIFO waiting-worker list.
#[derive(Debug, Default)]
pub struct Service {
    requests: VecDeque<QueuedRequest>,
    waiting: VecDeque<RoutingKey>,
}

/// A (worker, request) pair produced by FIFO dispatch.
#[derive(Debug)]
pub struct Dispatch {
    /// Chosen worker's routing key.
    pub worker: RoutingKey,
    /// Request to transmit.
    pub request: QueuedRequest,
}

/// Read-only snapshot of one worker, for introspection surfaces.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    /// Hex-ish display form of the routing key.
    pub identity: String,
    /// Bound service.
    pub service: String,
    /// Waiting/busy state.
    pub state: WorkerState,
    /// Lifetime dispatched-request count.
    pub total_requests: u64,
}

/// Worker registry plus service table, owned by the dispatch loop.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<RoutingKey, WorkerHandle>,
    /// Global waiting list, insertion-ordered (approximates expiry order).
    waiting: VecDeque<RoutingKey>,
    services: HashMap<String, Service>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `identity` is a known (registered) worker.
    pub fn is_known(&self, identity: &RoutingKey) -> bool {
        self.workers.contains_key(identity)
    }

    /// Register a worker on its first READY.
    ///
    /// Rejects reserved service names (`InvalidService`) and re-READY from
    /// an already registered worker (`ProtocolViolation`); in both cases
    /// the caller evicts the offender with DISCONNECT.
    pub fn register(&mut self, identity: RoutingKey, service: &str) -> Result<()> {
        if is_reserved_service(service) {
            return Err(Error::new(
                ErrorCode::InvalidService,
                "reserved service prefix",
            )
            .with_context(ErrorContext::Service {
                name: service.to_string(),
            }));
        }
        if self.workers.contains_key(&identity) {
            return Err(Error::new(
                ErrorCode::ProtocolViolation,
                "READY from an already registered worker",
            )
            .with_context(worker_context(&identity, Some(service))));
        }

        self.workers.insert(
            identity.clone(),
            WorkerHandle {
                identity: identity.clone(),
                service: service.to_string(),
                expiry: Instant::now() + HEARTBEAT_EXPIRY,
                total_requests: 0,
                state: WorkerState::Waiting,
            },
        );
        self.waiting.push_back(identity.clone());
        self.services
            .entry(service.to_string())
            .or_default()
            .waiting
            .push_back(identity);
        Ok(())
    }

    /// Return a busy worker to the waiting lists after its FINAL reply,
    /// refreshing its expiry.
    ///
    /// Fails `ProtocolViolation` if the worker is unknown or was not busy
    /// (a FINAL from a waiting worker means the peer lost the plot).
    pub fn make_waiting(&mut self, identity: &RoutingKey) -> Result<()> {
        let worker = self.workers.get_mut(identity).ok_or_else(|| {
            Error::new(ErrorCode::ProtocolViolation, "reply from unknown worker")
                .with_context(worker_context(identity, None))
        })?;
        if worker.state != WorkerState::Busy {
            return Err(Error::new(
                ErrorCode::ProtocolViolation,
                "FINAL from a worker that was not dispatched",
            )
            .with_context(worker_context(identity, Some(&worker.service))));
        }

        worker.state = WorkerState::Waiting;
        worker.expiry = Instant::now() + HEARTBEAT_EXPIRY;
        let service = worker.service.clone();
        // At-most-once: the worker left both lists when it went busy.
        self.waiting.push_back(identity.clone());
        self.services
            .entry(service)
            .or_default()
            .waiting
            .push_back(identity.clone());
        Ok(())
    }

    /// Refresh a worker's liveness deadline. Returns false for unknown
    /// identities (the caller disconnects those).
    pub fn heartbeat(&mut self, identity: &RoutingKey) -> bool {
        match self.workers.get_mut(identity) {
            Some(worker) => {
                worker.expiry = Instant::now() + HEARTBEAT_EXPIRY;
                true
            }
            None => false,
        }
    }

    /// The service a worker is bound to, if registered.
    pub fn service_of(&self, identity: &RoutingKey) -> Option<&str> {
        self.workers.get(identity).map(|w| w.service.as_str())
    }

    /// Queue a request at its service.
    pub fn queue_request(&mut self, service: &str, request: QueuedRequest) {
        self.services
            .entry(service.to_string())
            .or_default()
            .requests
            .push_back(request);
    }

    /// Pair queued requests with waiting workers, oldest-to-oldest, until
    /// either side of the service runs dry.
    ///
    /// Chosen workers transition to busy and leave both waiting lists;
    /// their dispatch counters are bumped here.
    pub fn dispatch(&mut self, service: &str) -> Vec<Dispatch> {
        let mut out = Vec::new();
        loop {
            let Some(entry) = self.services.get_mut(service) else {
                break;
            };
            if entry.requests.is_empty() || entry.waiting.is_empty() {
                break;
            }
            let request = entry.requests.pop_front().expect("checked non-empty");
            let identity = entry.waiting.pop_front().expect("checked non-empty");

            let worker = self
                .workers
                .get_mut(&identity)
                .expect("service waiting list references live workers");
            worker.state = WorkerState::Busy;
            worker.total_requests += 1;
            self.waiting.retain(|w| w != &identity);

            out.push(Dispatch {
                worker: identity,
                request,
            });
        }
        out
    }

    /// Remove a worker from the registry and both waiting lists.
    ///
    /// Returns the handle if it existed.
    pub fn evict(&mut self, identity: &RoutingKey) -> Option<WorkerHandle> {
        let worker = self.workers.remove(identity)?;
        self.waiting.retain(|w| w != identity);
        if let Some(service) = self.services.get_mut(&worker.service) {
            service.waiting.retain(|w| w != identity);
        }
        Some(worker)
    }

    /// Evict workers whose expiry deadline has passed.
    ///
    /// Scans the global waiting list head-first and stops at the first
    /// live worker; the list is insertion-ordered, which approximates
    /// expiry order. Returns the evicted routing keys.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<RoutingKey> {
        let mut evicted = Vec::new();
        while let Some(identity) = self.waiting.front().cloned() {
            let expired = self
                .workers
                .get(&identity)
                .map_or(true, |w| w.expiry <= now);
            if !expired {
                break;
            }
            log::info!(
                "evicting expired worker {}",
                String::from_utf8_lossy(&identity)
            );
            self.evict(&identity);
            evicted.push(identity);
        }
        evicted
    }

    /// Snapshot of every waiting worker, for heartbeat emission.
    pub fn waiting_workers(&self) -> Vec<RoutingKey> {
        self.waiting.iter().cloned().collect()
    }

    /// Queued-request depth for one service.
    pub fn queued_requests(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, |s| s.requests.len())
    }

    /// Waiting-worker count for one service.
    pub fn waiting_for_service(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, |s| s.waiting.len())
    }

    /// Number of known services (with any queued state or history).
    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Number of registered workers, waiting or busy.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Names of all known services.
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Read-only snapshot of all workers.
    pub fn worker_info(&self) -> Vec<WorkerInfo> {
        self.workers
            .values()
            .map(|w| WorkerInfo {
                identity: String::from_utf8_lossy(&w.identity).into_owned(),
                service: w.service.clone(),
                state: w.state,
                total_requests: w.total_requests,
            })
            .collect()
    }

    /// Direct handle access, for tests and introspection.
    pub fn worker(&self, identity: &RoutingKey) -> Option<&WorkerHandle> {
        self.workers.get(identity)
    }

    /// How many entries reference `identity` across the global waiting list.
    #[cfg(test)]
    fn global_occurrences(&self, identity: &RoutingKey) -> usize {
        self.waiting.iter().filter(|w| *w == identity).count()
    }

    /// How many entries reference `identity` in its service waiting list.
    #[cfg(test)]
    fn service_occurrences(&self, service: &str, identity: &RoutingKey) -> usize {
        self.services
            .get(service)
            .map_or(0, |s| s.waiting.iter().filter(|w| *w == identity).count())
    }
}

fn worker_context(identity: &RoutingKey, service: Option<&str>) -> ErrorContext {
    ErrorContext::Worker {
        identity: String::from_utf8_lossy(identity).into_owned(),
        service: service.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(name: &str) -> RoutingKey {
        Bytes::copy_from_slice(name.as_bytes())
    }

    fn queued(id: &str) -> QueuedRequest {
        QueuedRequest {
            id: id.to_string(),
            client: key("client-1"),
            payload: vec![Bytes::from_static(b"payload")],
        }
    }

    #[test]
    fn test_register_appends_to_both_lists() {
        let mut registry = WorkerRegistry::new();
        registry.register(key("w1"), "echo").unwrap();

        assert_eq!(registry.global_occurrences(&key("w1")), 1);
        assert_eq!(registry.service_occurrences("echo", &key("w1")), 1);
        assert_eq!(registry.worker(&key("w1")).unwrap().state, WorkerState::Waiting);
    }

    #[test]
    fn test_register_rejects_reserved_prefix() {
        let mut registry = WorkerRegistry::new();
        let err = registry.register(key("w1"), "mmi.evil").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidService);
        assert!(!registry.is_known(&key("w1")));
    }

    #[test]
    fn test_double_ready_is_protocol_violation() {
        let mut registry = WorkerRegistry::new();
        registry.register(key("w1"), "echo").unwrap();
        let err = registry.register(key("w1"), "echo").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ProtocolViolation);
    }

    #[test]
    fn test_dispatch_pairs_fifo_both_sides() {
        let mut registry = WorkerRegistry::new();
        registry.register(key("w1"), "echo").unwrap();
        registry.register(key("w2"), "echo").unwrap();
        registry.queue_request("echo", queued("r1"));
        registry.queue_request("echo", queued("r2"));
        registry.queue_request("echo", queued("r3"));

        let dispatches = registry.dispatch("echo");
        assert_eq!(dispatches.len(), 2);
        // Oldest request to oldest worker.
        assert_eq!(dispatches[0].worker, key("w1"));
        assert_eq!(dispatches[0].request.id, "r1");
        assert_eq!(dispatches[1].worker, key("w2"));
        assert_eq!(dispatches[1].request.id, "r2");

        // Third request stays queued; both workers are busy and gone from
        // the waiting lists.
        assert_eq!(registry.queued_requests("echo"), 1);
        assert_eq!(registry.waiting_for_service("echo"), 0);
        assert_eq!(registry.global_occurrences(&key("w1")), 0);
        assert_eq!(registry.worker(&key("w1")).unwrap().total_requests, 1);
    }

    #[test]
    fn test_make_waiting_requeues_once() {
        let mut registry = WorkerRegistry::new();
        registry.register(key("w1"), "echo").unwrap();
        registry.queue_request("echo", queued("r1"));
        registry.dispatch("echo");

        registry.make_waiting(&key("w1")).unwrap();
        assert_eq!(registry.global_occurrences(&key("w1")), 1);
        assert_eq!(registry.service_occurrences("echo", &key("w1")), 1);

        // A second FINAL without a dispatch in between is a violation and
        // must not duplicate the waiting-list entries.
        assert!(registry.make_waiting(&key("w1")).is_err());
        assert_eq!(registry.global_occurrences(&key("w1")), 1);
        assert_eq!(registry.service_occurrences("echo", &key("w1")), 1);
    }

    #[test]
    fn test_heartbeat_refreshes_known_only() {
        let mut registry = WorkerRegistry::new();
        registry.register(key("w1"), "echo").unwrap();
        assert!(registry.heartbeat(&key("w1")));
        assert!(!registry.heartbeat(&key("ghost")));
    }

    #[test]
    fn test_evict_clears_both_lists() {
        let mut registry = WorkerRegistry::new();
        registry.register(key("w1"), "echo").unwrap();
        let handle = registry.evict(&key("w1")).unwrap();
        assert_eq!(handle.service, "echo");
        assert_eq!(registry.global_occurrences(&key("w1")), 0);
        assert_eq!(registry.service_occurrences("echo", &key("w1")), 0);
        assert!(registry.evict(&key("w1")).is_none());
    }

    #[test]
    fn test_purge_expired_stops_at_first_live() {
        let mut registry = WorkerRegistry::new();
        registry.register(key("old"), "echo").unwrap();
        registry.register(key("fresh"), "echo").unwrap();
        registry.register(key("stale-behind"), "echo").unwrap();

        // Age the head and the tail; the middle stays live.
        registry.workers.get_mut(&key("old")).unwrap().expiry =
            Instant::now() - Duration::from_secs(1);
        registry.workers.get_mut(&key("stale-behind")).unwrap().expiry =
            Instant::now() - Duration::from_secs(1);

        let evicted = registry.purge_expired(Instant::now());
        // Head-first scan evicts "old", then stops at live "fresh" even
        // though a stale worker hides behind it.
        assert_eq!(evicted, vec![key("old")]);
        assert!(registry.is_known(&key("stale-behind")));
        assert_eq!(registry.worker_count(), 2);
    }

    #[test]
    fn test_dispatch_after_requeue_keeps_fifo() {
        let mut registry = WorkerRegistry::new();
        registry.register(key("w1"), "echo").unwrap();
        registry.register(key("w2"), "echo").unwrap();

        registry.queue_request("echo", queued("r1"));
        let first = registry.dispatch("echo");
        assert_eq!(first[0].worker, key("w1"));

        registry.make_waiting(&key("w1")).unwrap();
        // w2 has waited longest now; it gets the next request.
        registry.queue_request("echo", queued("r2"));
        let second = registry.dispatch("echo");
        assert_eq!(second[0].worker, key("w2"));
    }

    #[test]
    fn test_counters_and_snapshots() {
        let mut registry = WorkerRegistry::new();
        registry.register(key("w1"), "echo").unwrap();
        registry.register(key("w2"), "translate").unwrap();

        assert_eq!(registry.service_count(), 2);
        assert_eq!(registry.worker_count(), 2);
        assert_eq!(registry.waiting_for_service("echo"), 1);
        assert_eq!(registry.waiting_for_service("missing"), 0);

        let info = registry.worker_info();
        assert_eq!(info.len(), 2);
        assert!(info.iter().any(|w| w.service == "translate"));
    }
}
