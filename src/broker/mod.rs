//! Majordomo-style broker core.
//!
//! # Architecture
//!
//! ```text
//! Clients ──["", MDPC02, REQUEST, service, …]──► Broker ──► service queue
//!                                                  │            │ FIFO
//! Workers ──["", MDPW02, READY|reply|beat]────►  dispatch ◄─────┘
//!    ▲                                             │
//!    └──[addr, MDPW02, REQUEST, client, …]─────────┘
//! ```
//!
//! The dispatch loop is the sole owner of the router socket, the worker
//! registry, and the pending-request index, so none of them need locks.
//! The receive wait is bounded by `HEARTBEAT_INTERVAL`: every wake the
//! loop purges expired workers and emits heartbeats to the waiting ones.
//! A separate task sweeps the request store once a minute.
//!
//! Fault policy: a worker that violates the protocol is evicted with
//! DISCONNECT; malformed client traffic is logged and dropped. No message
//! can terminate the broker.

// Rust guideline compliant 2026-02

pub mod cluster;
pub mod mmi;
pub mod registry;
pub mod store;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{HEARTBEAT_INTERVAL, REQUEST_CLEANUP_INTERVAL};
use crate::error::{ErrorCode, Result};
use crate::protocol::{
    self, client_command, command_frame, is_reserved_service, WorkerCommand, CLIENT_V2, WORKER_V2,
};
use crate::transport::{RouterSocket, RoutingKey};

use cluster::ClusterView;
use mmi::MmiHandler;
use registry::{QueuedRequest, WorkerRegistry, WorkerState};
use store::{MemoryRequestStore, PendingRequest, SharedRequestStore};

/// Admission hook for authenticated deployments.
///
/// Runs before a client request is accepted. The default broker has no
/// guard; [`crate::auth::BearerGuard`] wires in the token manager and the
/// RBAC evaluator.
pub trait RequestGuard: Send + Sync {
    /// Authorize one request or fail with `AuthenticationFailed` /
    /// `AuthorizationFailed` / `RateLimited`.
    fn authorize(&self, client: &RoutingKey, service: &str, payload: &[Bytes]) -> Result<()>;
}

/// Process-wide source for unique request ids (time plus counter).
static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_request_id() -> String {
    let n = REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}", Utc::now().timestamp_millis(), n)
}

/// The broker: service table, worker liveness, fair dispatch, durable
/// request tracking, and the management interface.
pub struct Broker {
    socket: Box<dyn RouterSocket>,
    registry: WorkerRegistry,
    store: SharedRequestStore,
    mmi: MmiHandler,
    guard: Option<Box<dyn RequestGuard>>,
    cluster: Option<Arc<ClusterView>>,
    /// Request id currently dispatched to each busy worker.
    in_flight: HashMap<RoutingKey, String>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("endpoint", &self.socket.endpoint())
            .field("workers", &self.registry.worker_count())
            .field("services", &self.registry.service_count())
            .finish()
    }
}

impl Broker {
    /// Broker over `socket` with an in-memory request store.
    pub fn new(socket: Box<dyn RouterSocket>) -> Self {
        Self::with_store(socket, Arc::new(MemoryRequestStore::new()))
    }

    /// Broker with a caller-provided request store implementation.
    pub fn with_store(socket: Box<dyn RouterSocket>, store: SharedRequestStore) -> Self {
        Self {
            socket,
            registry: WorkerRegistry::new(),
            store,
            mmi: MmiHandler::new(),
            guard: None,
            cluster: None,
            in_flight: HashMap::new(),
        }
    }

    /// Gate client requests through an admission guard.
    pub fn with_guard(mut self, guard: Box<dyn RequestGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Publish this broker's load and service set into a cluster view on
    /// every heartbeat tick.
    pub fn with_cluster(mut self, cluster: Arc<ClusterView>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Shared handle to the request store (for sweepers and tests).
    pub fn store_handle(&self) -> SharedRequestStore {
        Arc::clone(&self.store)
    }

    /// Run the dispatch loop until `cancel` fires.
    ///
    /// Spawns the minute-interval request-store cleanup task and stops it
    /// on the way out.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        log::info!("broker listening on {}", self.socket.endpoint());
        let cleanup = spawn_store_cleanup(Arc::clone(&self.store), cancel.clone());

        let mut next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
        loop {
            let wait = next_heartbeat.saturating_duration_since(Instant::now());
            let inbound = tokio::select! {
                _ = cancel.cancelled() => break,
                inbound = self.socket.recv_timeout(wait) => inbound?,
            };

            if let Some(frames) = inbound {
                self.handle_message(frames).await;
            }

            if Instant::now() >= next_heartbeat {
                self.tick_heartbeats().await;
                next_heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
            }
        }

        cleanup.abort();
        log::info!("broker dispatch loop exiting");
        Ok(())
    }

    /// Purge expired workers, then heartbeat every waiting worker.
    async fn tick_heartbeats(&mut self) {
        // Eviction on expiry sends no DISCONNECT: the peer is presumed
        // dead. Any request it held goes back to its service queue.
        for identity in self.registry.purge_expired(Instant::now()) {
            self.requeue_in_flight(&identity).await;
        }
        for worker in self.registry.waiting_workers() {
            self.send_to_worker(&worker, WorkerCommand::Heartbeat, vec![])
                .await;
        }
        if let Some(cluster) = &self.cluster {
            cluster.update_local_load(
                self.registry.worker_count() as u64,
                self.registry.service_names(),
            );
        }
    }

    // ─── Inbound routing ───────────────────────────────────────────────────

    async fn handle_message(&mut self, mut frames: Vec<Bytes>) {
        // Frame 0 is the transport's routing key; frame 1 the protocol's
        // empty delimiter; frame 2 the protocol tag.
        if frames.len() < 3 {
            log::warn!("dropping runt message ({} frames)", frames.len());
            return;
        }
        let sender = frames.remove(0);
        let delimiter = frames.remove(0);
        if !delimiter.is_empty() {
            log::warn!(
                "dropping message with non-empty delimiter from {}",
                String::from_utf8_lossy(&sender)
            );
            return;
        }

        match frames[0].as_ref() {
            tag if tag == CLIENT_V2 => self.handle_client(sender, frames).await,
            tag if tag == WORKER_V2 => self.handle_worker(sender, frames).await,
            tag => {
                log::warn!(
                    "dropping message with unknown protocol tag {:?} from {}",
                    String::from_utf8_lossy(tag),
                    String::from_utf8_lossy(&sender)
                );
            }
        }
    }

    // ─── Client side ───────────────────────────────────────────────────────

    async fn handle_client(&mut self, client: RoutingKey, frames: Vec<Bytes>) {
        if let Err(e) = protocol::validate_client_request(&frames) {
            // Malformed client traffic is contained here: log and drop.
            log::warn!(
                "dropping malformed client request from {}: {e}",
                String::from_utf8_lossy(&client)
            );
            return;
        }
        let service = String::from_utf8_lossy(&frames[2]).into_owned();
        let payload: Vec<Bytes> = frames[3..].to_vec();

        if is_reserved_service(&service) {
            let reply = self.mmi.handle(&self.registry, &service, &payload);
            self.send_to_client(&client, client_command::FINAL, &service, reply)
                .await;
            return;
        }

        if let Some(guard) = &self.guard {
            if let Err(e) = guard.authorize(&client, &service, &payload) {
                // Terminal to this request only; the guard's audit line
                // plus this drop notice form the record.
                log::warn!(
                    "rejecting request for {service} from {}: {e}",
                    String::from_utf8_lossy(&client)
                );
                return;
            }
        }

        let id = next_request_id();
        let request = PendingRequest::new(id.clone(), client.clone(), &service, payload.clone());
        if let Err(e) = self.store.store(request) {
            log::error!("failed to persist request {id}: {e}");
            return;
        }
        log::debug!("accepted request {id} for {service}");

        self.registry
            .queue_request(&service, QueuedRequest { id, client, payload });
        self.dispatch_service(&service).await;
    }

    /// Drain the service's FIFO pairing while requests and workers remain.
    async fn dispatch_service(&mut self, service: &str) {
        for dispatch in self.registry.dispatch(service) {
            if let Err(e) = self.store.mark_processing(&dispatch.request.id) {
                log::error!("request {} not marked processing: {e}", dispatch.request.id);
            }
            self.in_flight
                .insert(dispatch.worker.clone(), dispatch.request.id.clone());

            let mut frames = vec![dispatch.request.client.clone()];
            frames.extend(dispatch.request.payload.iter().cloned());
            self.send_to_worker(&dispatch.worker, WorkerCommand::Request, frames)
                .await;
        }
    }

    // ─── Worker side ───────────────────────────────────────────────────────

    async fn handle_worker(&mut self, worker: RoutingKey, frames: Vec<Bytes>) {
        let command = match protocol::validate_worker_inbound(&frames) {
            Ok(command) => command,
            Err(e) => {
                log::warn!(
                    "disconnecting worker {} on malformed frame: {e}",
                    String::from_utf8_lossy(&worker)
                );
                self.evict_with_disconnect(&worker).await;
                return;
            }
        };

        let known = self.registry.is_known(&worker);
        match command {
            WorkerCommand::Ready => self.worker_ready(worker, &frames, known).await,
            WorkerCommand::Partial | WorkerCommand::Final => {
                self.worker_reply(worker, frames, command, known).await;
            }
            WorkerCommand::Heartbeat => {
                if !self.registry.heartbeat(&worker) {
                    // Heartbeat from a stranger: tell it to start over.
                    self.send_to_worker(&worker, WorkerCommand::Disconnect, vec![])
                        .await;
                }
            }
            WorkerCommand::Disconnect => {
                log::info!("worker {} disconnected", String::from_utf8_lossy(&worker));
                self.registry.evict(&worker);
                self.requeue_in_flight(&worker).await;
            }
            WorkerCommand::Request => {
                // REQUEST only flows broker → worker.
                log::warn!(
                    "worker {} sent broker-only REQUEST",
                    String::from_utf8_lossy(&worker)
                );
                self.evict_with_disconnect(&worker).await;
            }
        }
    }

    async fn worker_ready(&mut self, worker: RoutingKey, frames: &[Bytes], known: bool) {
        if known {
            // READY is only legal once per session.
            log::warn!(
                "worker {} sent READY twice",
                String::from_utf8_lossy(&worker)
            );
            self.evict_with_disconnect(&worker).await;
            return;
        }
        let service = match frames.get(2) {
            Some(frame) if !frame.is_empty() => String::from_utf8_lossy(frame).into_owned(),
            _ => {
                log::warn!(
                    "worker {} sent READY without a service name",
                    String::from_utf8_lossy(&worker)
                );
                self.send_to_worker(&worker, WorkerCommand::Disconnect, vec![])
                    .await;
                return;
            }
        };

        match self.registry.register(worker.clone(), &service) {
            Ok(()) => {
                log::info!(
                    "worker {} ready for {service}",
                    String::from_utf8_lossy(&worker)
                );
                self.dispatch_service(&service).await;
            }
            Err(e) => {
                log::warn!("rejecting worker {}: {e}", String::from_utf8_lossy(&worker));
                self.send_to_worker(&worker, WorkerCommand::Disconnect, vec![])
                    .await;
            }
        }
    }

    async fn worker_reply(
        &mut self,
        worker: RoutingKey,
        frames: Vec<Bytes>,
        command: WorkerCommand,
        known: bool,
    ) {
        if !known {
            self.send_to_worker(&worker, WorkerCommand::Disconnect, vec![])
                .await;
            return;
        }
        let busy = self
            .registry
            .worker(&worker)
            .is_some_and(|w| w.state == WorkerState::Busy);
        if !busy || frames.len() < 3 || frames[2].is_empty() {
            log::warn!(
                "protocol violation in reply from {}",
                String::from_utf8_lossy(&worker)
            );
            self.evict_with_disconnect(&worker).await;
            return;
        }

        let client = frames[2].clone();
        let payload: Vec<Bytes> = frames[3..].to_vec();
        let service = self
            .registry
            .service_of(&worker)
            .unwrap_or_default()
            .to_string();

        let client_cmd = match command {
            WorkerCommand::Partial => client_command::PARTIAL,
            _ => client_command::FINAL,
        };
        self.send_to_client(&client, client_cmd, &service, payload)
            .await;

        if command == WorkerCommand::Final {
            if let Some(id) = self.in_flight.remove(&worker) {
                if let Err(e) = self.store.delete(&id) {
                    log::debug!("request {id} already gone from store: {e}");
                }
            }
            match self.registry.make_waiting(&worker) {
                Ok(()) => {
                    self.dispatch_service(&service).await;
                }
                Err(e) => {
                    log::warn!("{e}");
                    self.evict_with_disconnect(&worker).await;
                }
            }
        }
    }

    /// Evict a worker for a protocol violation, notify it, and put any
    /// request it held back in line.
    async fn evict_with_disconnect(&mut self, worker: &RoutingKey) {
        self.registry.evict(worker);
        self.send_to_worker(worker, WorkerCommand::Disconnect, vec![])
            .await;
        self.requeue_in_flight(worker).await;
    }

    /// Return an evicted worker's in-flight request to its service queue,
    /// consuming one retry; exhausted requests are marked failed.
    async fn requeue_in_flight(&mut self, worker: &RoutingKey) {
        let Some(id) = self.in_flight.remove(worker) else {
            return;
        };
        match self.store.retry(&id) {
            Ok(retries) => {
                let request = match self.store.retrieve(&id) {
                    Ok(request) => request,
                    Err(e) => {
                        log::warn!("request {id} lost during requeue: {e}");
                        return;
                    }
                };
                log::info!(
                    "requeueing request {id} (retry {retries}/{})",
                    request.max_retries
                );
                let service = request.service.clone();
                self.registry.queue_request(
                    &service,
                    QueuedRequest {
                        id,
                        client: request.client,
                        payload: request.payload,
                    },
                );
                self.dispatch_service(&service).await;
            }
            Err(e) if e.code() == ErrorCode::NotFound => {
                log::debug!("request {id} vanished before requeue");
            }
            Err(e) => {
                log::warn!("request {id} abandoned: {e}");
            }
        }
    }

    // ─── Outbound framing ──────────────────────────────────────────────────

    async fn send_to_client(
        &mut self,
        client: &RoutingKey,
        command: u8,
        service: &str,
        payload: Vec<Bytes>,
    ) {
        let mut frames = Vec::with_capacity(4 + payload.len());
        frames.push(client.clone());
        frames.push(Bytes::from_static(CLIENT_V2));
        frames.push(command_frame(command));
        frames.push(Bytes::copy_from_slice(service.as_bytes()));
        frames.extend(payload);

        debug_assert!(protocol::validate_broker_to_client(&frames).is_ok());
        if let Err(e) = self.socket.send(frames).await {
            log::warn!(
                "send to client {} failed: {e}",
                String::from_utf8_lossy(client)
            );
        }
    }

    async fn send_to_worker(
        &mut self,
        worker: &RoutingKey,
        command: WorkerCommand,
        rest: Vec<Bytes>,
    ) {
        let mut frames = Vec::with_capacity(3 + rest.len());
        frames.push(worker.clone());
        frames.push(Bytes::from_static(WORKER_V2));
        frames.push(command_frame(command.as_byte()));
        frames.extend(rest);

        if let Err(e) = self.socket.send(frames).await {
            log::warn!(
                "send to worker {} failed: {e}",
                String::from_utf8_lossy(worker)
            );
        }
    }
}

/// Spawn the minute-interval request-store sweeper.
fn spawn_store_cleanup(store: SharedRequestStore, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REQUEST_CLEANUP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first sweep happens one full period in.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let removed = store.cleanup_expired();
                    if removed > 0 {
                        log::info!("request cleanup removed {removed} expired entries");
                    }
                }
            }
        }
    })
}
