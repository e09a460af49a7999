//! Durable in-memory record of accepted client requests.
//!
//! The broker persists every accepted request here before dispatching it,
//! so in-flight work survives worker churn and can be retried or expired.
//! The store sits behind a trait so a disk-backed implementation can be
//! substituted without touching the broker; the in-memory implementation
//! serializes all access through one `RwLock` (the periodic cleaner runs on
//! a different task than the dispatch loop).

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::constants::{REQUEST_MAX_RETRIES, REQUEST_TTL};
use crate::error::{Error, ErrorCode, ErrorContext, Result};
use crate::transport::RoutingKey;

/// Lifecycle status of a pending request.
///
/// Transitions are monotonic within `Pending → Processing → (Completed |
/// Failed)`; a retry moves `Processing` back to `Pending` while burning one
/// retry from the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Accepted, not yet handed to a worker.
    Pending,
    /// Dispatched to a worker, reply outstanding.
    Processing,
    /// Final reply forwarded to the client.
    Completed,
    /// Retries exhausted or TTL elapsed.
    Failed,
}

/// One accepted client request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Unique request identifier.
    pub id: String,
    /// Routing key of the originating client.
    pub client: RoutingKey,
    /// Target service name.
    pub service: String,
    /// Request payload frames (service-opaque).
    pub payload: Vec<Bytes>,
    /// Acceptance instant; `created + ttl` is the expiry deadline.
    pub created: Instant,
    /// Time-to-live from `created`.
    pub ttl: Duration,
    /// Retries consumed so far.
    pub retries: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Current lifecycle status.
    pub status: RequestStatus,
}

impl PendingRequest {
    /// New pending request with default TTL and retry budget.
    pub fn new(
        id: impl Into<String>,
        client: RoutingKey,
        service: impl Into<String>,
        payload: Vec<Bytes>,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            service: service.into(),
            payload,
            created: Instant::now(),
            ttl: REQUEST_TTL,
            retries: 0,
            max_retries: REQUEST_MAX_RETRIES,
            status: RequestStatus::Pending,
        }
    }

    /// True once `created + ttl` has passed.
    pub fn is_expired(&self) -> bool {
        self.created.elapsed() >= self.ttl
    }

    /// True if more retries remain in the budget.
    pub fn can_retry(&self) -> bool {
        self.retries < self.max_retries
    }
}

/// Storage contract for accepted requests.
///
/// All operations are linearizable; implementations protect themselves.
pub trait RequestStore: Send + Sync {
    /// Persist a request. Idempotent on id; rejects requests that are
    /// already expired on arrival.
    fn store(&self, request: PendingRequest) -> Result<()>;

    /// Fetch a copy of the record. Fails `NotFound` or `Expired`.
    fn retrieve(&self, id: &str) -> Result<PendingRequest>;

    /// Remove the record. Fails `NotFound` if absent.
    fn delete(&self, id: &str) -> Result<()>;

    /// Snapshot of ids whose status is pending or processing and whose TTL
    /// has not elapsed.
    fn list_pending(&self) -> Vec<String>;

    /// Remove every expired record; returns the count removed.
    fn cleanup_expired(&self) -> usize;

    /// Transition a request to `Processing` on dispatch.
    fn mark_processing(&self, id: &str) -> Result<()>;

    /// Transition a request to `Failed` (terminal).
    fn mark_failed(&self, id: &str) -> Result<()>;

    /// Reset a dispatched request to `Pending`, consuming one retry.
    ///
    /// Returns the new retry count, or fails `Expired` once the budget is
    /// exhausted (the record is then marked failed).
    fn retry(&self, id: &str) -> Result<u32>;
}

/// Shared handle to a request store.
pub type SharedRequestStore = Arc<dyn RequestStore>;

/// In-memory [`RequestStore`] guarded by one `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryRequestStore {
    requests: RwLock<HashMap<String, PendingRequest>>,
}

impl MemoryRequestStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True if no records are held.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, PendingRequest>> {
        self.requests.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, PendingRequest>> {
        self.requests.write().unwrap_or_else(|e| e.into_inner())
    }

    fn not_found(id: &str) -> Error {
        Error::new(ErrorCode::NotFound, format!("request {id} not found"))
    }

    fn expired(id: &str) -> Error {
        Error::new(ErrorCode::Expired, format!("request {id} expired"))
    }
}

impl RequestStore for MemoryRequestStore {
    fn store(&self, request: PendingRequest) -> Result<()> {
        if request.is_expired() {
            return Err(Self::expired(&request.id).with_context(ErrorContext::Service {
                name: request.service.clone(),
            }));
        }
        let mut requests = self.write();
        // Idempotent on id: a duplicate store never clobbers the record's
        // created timestamp or status.
        requests.entry(request.id.clone()).or_insert(request);
        Ok(())
    }

    fn retrieve(&self, id: &str) -> Result<PendingRequest> {
        let requests = self.read();
        let request = requests.get(id).ok_or_else(|| Self::not_found(id))?;
        if request.is_expired() {
            return Err(Self::expired(id));
        }
        Ok(request.clone())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut requests = self.write();
        requests
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(id))
    }

    fn list_pending(&self) -> Vec<String> {
        self.read()
            .values()
            .filter(|r| {
                matches!(
                    r.status,
                    RequestStatus::Pending | RequestStatus::Processing
                ) && !r.is_expired()
            })
            .map(|r| r.id.clone())
            .collect()
    }

    fn cleanup_expired(&self) -> usize {
        let mut requests = self.write();
        let before = requests.len();
        requests.retain(|_, r| !r.is_expired());
        before - requests.len()
    }

    fn mark_processing(&self, id: &str) -> Result<()> {
        let mut requests = self.write();
        let request = requests.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        match request.status {
            RequestStatus::Pending => {
                request.status = RequestStatus::Processing;
                Ok(())
            }
            other => Err(Error::new(
                ErrorCode::Internal,
                format!("request {id} cannot enter processing from {other:?}"),
            )),
        }
    }

    fn mark_failed(&self, id: &str) -> Result<()> {
        let mut requests = self.write();
        let request = requests.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        request.status = RequestStatus::Failed;
        Ok(())
    }

    fn retry(&self, id: &str) -> Result<u32> {
        let mut requests = self.write();
        let request = requests.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if !request.can_retry() {
            request.status = RequestStatus::Failed;
            return Err(Self::expired(id).with_detail("retries", request.retries.to_string()));
        }
        request.retries += 1;
        request.status = RequestStatus::Pending;
        Ok(request.retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: &str) -> PendingRequest {
        PendingRequest::new(
            id,
            Bytes::from_static(b"client-1"),
            "echo",
            vec![Bytes::from_static(b"hello")],
        )
    }

    #[test]
    fn test_store_and_retrieve() {
        let store = MemoryRequestStore::new();
        store.store(request("r1")).unwrap();

        let got = store.retrieve("r1").unwrap();
        assert_eq!(got.service, "echo");
        assert_eq!(got.status, RequestStatus::Pending);
        assert_eq!(got.max_retries, REQUEST_MAX_RETRIES);
        assert_eq!(got.ttl, REQUEST_TTL);
    }

    #[test]
    fn test_store_is_idempotent_on_id() {
        let store = MemoryRequestStore::new();
        store.store(request("r1")).unwrap();
        store.mark_processing("r1").unwrap();

        // A second store under the same id must not reset the status.
        store.store(request("r1")).unwrap();
        assert_eq!(store.retrieve("r1").unwrap().status, RequestStatus::Processing);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_store_rejects_expired_on_arrival() {
        let store = MemoryRequestStore::new();
        let mut stale = request("r1");
        stale.created = Instant::now() - Duration::from_secs(600);
        let err = store.store(stale).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Expired);
        assert!(store.is_empty());
    }

    #[test]
    fn test_retrieve_missing_and_expired() {
        let store = MemoryRequestStore::new();
        assert_eq!(store.retrieve("nope").unwrap_err().code(), ErrorCode::NotFound);

        let mut r = request("r1");
        r.ttl = Duration::from_millis(0);
        // Bypass the arrival check to plant an already-expired record.
        store.write().insert("r1".into(), r);
        assert_eq!(store.retrieve("r1").unwrap_err().code(), ErrorCode::Expired);
    }

    #[test]
    fn test_delete() {
        let store = MemoryRequestStore::new();
        store.store(request("r1")).unwrap();
        store.delete("r1").unwrap();
        assert_eq!(store.delete("r1").unwrap_err().code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_list_pending_filters_status_and_expiry() {
        let store = MemoryRequestStore::new();
        store.store(request("keep-pending")).unwrap();
        store.store(request("keep-processing")).unwrap();
        store.mark_processing("keep-processing").unwrap();
        store.store(request("failed")).unwrap();
        store.mark_failed("failed").unwrap();

        let mut expired = request("expired");
        expired.ttl = Duration::from_millis(0);
        store.write().insert("expired".into(), expired);

        let mut pending = store.list_pending();
        pending.sort();
        assert_eq!(pending, vec!["keep-pending", "keep-processing"]);
    }

    #[test]
    fn test_cleanup_expired_counts_removed() {
        let store = MemoryRequestStore::new();
        store.store(request("live")).unwrap();
        for id in ["dead-1", "dead-2"] {
            let mut r = request(id);
            r.ttl = Duration::from_millis(0);
            store.write().insert(id.into(), r);
        }

        assert_eq!(store.cleanup_expired(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.cleanup_expired(), 0);
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let store = MemoryRequestStore::new();
        store.store(request("r1")).unwrap();
        store.mark_processing("r1").unwrap();
        // Processing → Processing is a violation.
        assert!(store.mark_processing("r1").is_err());
    }

    #[test]
    fn test_retry_consumes_budget_then_fails() {
        let store = MemoryRequestStore::new();
        store.store(request("r1")).unwrap();

        for expected in 1..=REQUEST_MAX_RETRIES {
            store.mark_processing("r1").unwrap();
            assert_eq!(store.retry("r1").unwrap(), expected);
        }

        store.mark_processing("r1").unwrap();
        assert!(store.retry("r1").is_err());
        assert_eq!(store.retrieve("r1").unwrap().status, RequestStatus::Failed);
    }

    #[test]
    fn test_created_timestamp_never_mutated() {
        let store = MemoryRequestStore::new();
        let original = request("r1");
        let created = original.created;
        store.store(original).unwrap();
        store.mark_processing("r1").unwrap();
        store.retry("r1").unwrap();
        assert_eq!(store.retrieve("r1").unwrap().created, created);
    }
}
