//! Worker endpoint: register a service, process requests, stream replies.
//!
//! State machine: `disconnected → registering → ready → busy → ready → …`.
//!
//! The endpoint sends READY on connect, heartbeats the broker on its own
//! deadline, and tracks broker liveness with a countdown of missed
//! intervals. Liveness exhaustion sleeps the reconnect delay and starts a
//! fresh session; an inbound DISCONNECT reconnects immediately.
//!
//! Reply framing note: a reply travels as `["", MDPW02, PARTIAL|FINAL,
//! client_addr, …payload]` with no empty separator between the client
//! address and the body — the v0.2 broker parses the address at frame 3
//! directly.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::constants::{HEARTBEAT_INTERVAL, HEARTBEAT_LIVENESS, RECONNECT_DELAY};
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{self, command_frame, worker_command, WorkerCommand, WORKER_V2};
use crate::transport::{Connector, PeerSocket};

/// Handle for requesting a worker loop shutdown from another task.
#[derive(Debug, Clone, Default)]
pub struct WorkerShutdown {
    terminated: Arc<AtomicBool>,
}

impl WorkerShutdown {
    /// Ask the worker to stop; its loop exits at the next wake.
    pub fn shutdown(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Worker endpoint bound to one service.
pub struct Worker {
    connector: Box<dyn Connector>,
    socket: Box<dyn PeerSocket>,
    service: String,
    heartbeat: Duration,
    reconnect_delay: Duration,
    liveness: u32,
    heartbeat_deadline: Instant,
    /// Client routing envelope of the request currently being processed.
    reply_to: Option<Bytes>,
    shutdown: WorkerShutdown,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("service", &self.service)
            .field("liveness", &self.liveness)
            .finish()
    }
}

impl Worker {
    /// Connect through `connector` and register for `service`.
    pub async fn connect(connector: Box<dyn Connector>, service: &str) -> Result<Self> {
        let socket = connector.connect().await?;
        let mut worker = Self {
            connector,
            socket,
            service: service.to_string(),
            heartbeat: HEARTBEAT_INTERVAL,
            reconnect_delay: RECONNECT_DELAY,
            liveness: HEARTBEAT_LIVENESS,
            heartbeat_deadline: Instant::now() + HEARTBEAT_INTERVAL,
            reply_to: None,
            shutdown: WorkerShutdown::default(),
        };
        worker.send_ready().await?;
        Ok(worker)
    }

    /// Tighten the heartbeat/reconnect timing (tests mostly).
    pub fn set_timing(&mut self, heartbeat: Duration, reconnect_delay: Duration) {
        self.heartbeat = heartbeat;
        self.reconnect_delay = reconnect_delay;
        self.heartbeat_deadline = Instant::now() + heartbeat;
    }

    /// Shutdown handle usable from other tasks.
    pub fn shutdown_handle(&self) -> WorkerShutdown {
        self.shutdown.clone()
    }

    /// Emit an intermediate PARTIAL reply for the in-progress request.
    ///
    /// May be called any number of times between receiving a request and
    /// answering it through [`Worker::recv`].
    pub async fn send_partial(&mut self, payload: Vec<Bytes>) -> Result<()> {
        let reply_to = self.reply_to.clone().ok_or_else(|| {
            Error::new(
                ErrorCode::Internal,
                "send_partial with no request in progress",
            )
        })?;
        self.send_reply(worker_command::PARTIAL, &reply_to, payload)
            .await
    }

    /// Answer the previous request (if `reply` is given) and wait for the
    /// next one.
    ///
    /// Returns `Ok(Some(payload))` with the next request's payload, or
    /// `Ok(None)` once [`WorkerShutdown::shutdown`] has been called. The
    /// reply is sent as FINAL with the remembered client envelope; the
    /// request/reply cadence means callers alternate `recv(None)` once,
    /// then `recv(Some(reply))` forever after.
    pub async fn recv(&mut self, reply: Option<Vec<Bytes>>) -> Result<Option<Vec<Bytes>>> {
        if let Some(payload) = reply {
            let reply_to = self.reply_to.take().ok_or_else(|| {
                Error::new(ErrorCode::Internal, "reply with no request in progress")
            })?;
            self.send_reply(worker_command::FINAL, &reply_to, payload)
                .await?;
        }

        loop {
            if self.shutdown.is_terminated() {
                log::info!("worker for {} shutting down", self.service);
                return Ok(None);
            }

            if Instant::now() >= self.heartbeat_deadline {
                self.send_heartbeat().await?;
                self.heartbeat_deadline = Instant::now() + self.heartbeat;
            }

            let wait = self
                .heartbeat_deadline
                .saturating_duration_since(Instant::now())
                .min(self.heartbeat);
            let Some(frames) = self.socket.recv_timeout(wait).await? else {
                self.liveness = self.liveness.saturating_sub(1);
                if self.liveness == 0 {
                    log::warn!(
                        "broker unreachable; reconnecting in {:?}",
                        self.reconnect_delay
                    );
                    tokio::time::sleep(self.reconnect_delay).await;
                    self.reconnect().await?;
                }
                continue;
            };

            // Any broker traffic proves liveness.
            self.liveness = HEARTBEAT_LIVENESS;
            match protocol::validate_worker_inbound(&frames) {
                Ok(WorkerCommand::Request) => {
                    // [MDPW02, REQUEST, client_addr, …payload]
                    if frames.len() < 3 || frames[2].is_empty() {
                        log::warn!("dropping REQUEST without client envelope");
                        continue;
                    }
                    self.reply_to = Some(frames[2].clone());
                    return Ok(Some(frames[3..].to_vec()));
                }
                Ok(WorkerCommand::Heartbeat) => {}
                Ok(WorkerCommand::Disconnect) => {
                    log::info!("broker sent DISCONNECT; reconnecting");
                    self.reconnect().await?;
                }
                Ok(other) => {
                    log::warn!("dropping unexpected {other:?} from broker");
                }
                Err(e) => {
                    log::warn!("dropping malformed broker frame: {e}");
                }
            }
        }
    }

    /// Start a fresh session: new transport endpoint, READY, full liveness.
    async fn reconnect(&mut self) -> Result<()> {
        match self.connector.connect().await {
            Ok(socket) => self.socket = socket,
            Err(e) => {
                log::warn!("connector failed during reconnect: {e}");
                self.socket.reconnect().await?;
            }
        }
        self.reply_to = None;
        self.send_ready().await?;
        Ok(())
    }

    async fn send_ready(&mut self) -> Result<()> {
        self.liveness = HEARTBEAT_LIVENESS;
        self.heartbeat_deadline = Instant::now() + self.heartbeat;
        let frames = vec![
            Bytes::new(),
            Bytes::from_static(WORKER_V2),
            command_frame(worker_command::READY),
            Bytes::copy_from_slice(self.service.as_bytes()),
        ];
        self.socket.send(frames).await
    }

    async fn send_heartbeat(&mut self) -> Result<()> {
        let frames = vec![
            Bytes::new(),
            Bytes::from_static(WORKER_V2),
            command_frame(worker_command::HEARTBEAT),
        ];
        self.socket.send(frames).await
    }

    async fn send_reply(
        &mut self,
        command: u8,
        reply_to: &Bytes,
        payload: Vec<Bytes>,
    ) -> Result<()> {
        let mut frames = Vec::with_capacity(4 + payload.len());
        frames.push(Bytes::new());
        frames.push(Bytes::from_static(WORKER_V2));
        frames.push(command_frame(command));
        frames.push(reply_to.clone());
        frames.extend(payload);
        self.socket.send(frames).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryFabric;
    use crate::transport::RouterSocket;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    async fn recv_at_router(router: &mut (impl RouterSocket + ?Sized)) -> Vec<Bytes> {
        router
            .recv_timeout(Duration::from_millis(300))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_sends_ready() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let _worker = Worker::connect(Box::new(fabric.connector("inproc://broker")), "echo")
            .await
            .unwrap();

        let frames = recv_at_router(&mut router).await;
        // [key, "", MDPW02, READY, "echo"]
        assert_eq!(frames[1], b(""));
        assert_eq!(frames[2], b("MDPW02"));
        assert_eq!(frames[3], Bytes::copy_from_slice(&[worker_command::READY]));
        assert_eq!(frames[4], b("echo"));
    }

    #[tokio::test]
    async fn test_request_reply_cycle() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let mut worker = Worker::connect(Box::new(fabric.connector("inproc://broker")), "echo")
            .await
            .unwrap();

        let ready = recv_at_router(&mut router).await;
        let worker_key = ready[0].clone();

        // Dispatch a request with the client envelope at frame 3.
        router
            .send(vec![
                worker_key.clone(),
                b("MDPW02"),
                Bytes::copy_from_slice(&[worker_command::REQUEST]),
                b("client-7"),
                b("hello"),
            ])
            .await
            .unwrap();

        let payload = worker.recv(None).await.unwrap().unwrap();
        assert_eq!(payload, vec![b("hello")]);

        // Answer and immediately shut down so recv returns.
        worker.shutdown_handle().shutdown();
        let done = worker.recv(Some(vec![b("HELLO")])).await.unwrap();
        assert!(done.is_none());

        // The reply carries FINAL with the client envelope at frame 4 and
        // no empty separator before the body.
        let frames = recv_at_router(&mut router).await;
        assert_eq!(frames[1], b(""));
        assert_eq!(frames[2], b("MDPW02"));
        assert_eq!(frames[3], Bytes::copy_from_slice(&[worker_command::FINAL]));
        assert_eq!(frames[4], b("client-7"));
        assert_eq!(frames[5], b("HELLO"));
    }

    #[tokio::test]
    async fn test_send_partial_requires_request_in_progress() {
        let fabric = MemoryFabric::new();
        let _router = fabric.bind("inproc://broker").unwrap();
        let mut worker = Worker::connect(Box::new(fabric.connector("inproc://broker")), "echo")
            .await
            .unwrap();

        let err = worker.send_partial(vec![b("oops")]).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
    }

    #[tokio::test]
    async fn test_partials_then_final_preserve_envelope() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let mut worker = Worker::connect(Box::new(fabric.connector("inproc://broker")), "echo")
            .await
            .unwrap();

        let ready = recv_at_router(&mut router).await;
        router
            .send(vec![
                ready[0].clone(),
                b("MDPW02"),
                Bytes::copy_from_slice(&[worker_command::REQUEST]),
                b("client-9"),
                b("work"),
            ])
            .await
            .unwrap();
        worker.recv(None).await.unwrap().unwrap();

        worker.send_partial(vec![b("1/2")]).await.unwrap();
        worker.send_partial(vec![b("2/2")]).await.unwrap();

        for expected in ["1/2", "2/2"] {
            let frames = recv_at_router(&mut router).await;
            assert_eq!(
                frames[3],
                Bytes::copy_from_slice(&[worker_command::PARTIAL])
            );
            assert_eq!(frames[4], b("client-9"));
            assert_eq!(frames[5], b(expected));
        }
    }

    #[tokio::test]
    async fn test_disconnect_triggers_re_ready() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let mut worker = Worker::connect(Box::new(fabric.connector("inproc://broker")), "echo")
            .await
            .unwrap();
        worker.set_timing(Duration::from_millis(50), Duration::from_millis(10));

        let ready = recv_at_router(&mut router).await;
        let old_key = ready[0].clone();

        router
            .send(vec![
                old_key.clone(),
                b("MDPW02"),
                Bytes::copy_from_slice(&[worker_command::DISCONNECT]),
            ])
            .await
            .unwrap();

        // Run the loop briefly; shutdown makes recv return cleanly.
        let shutdown = worker.shutdown_handle();
        let driver = tokio::spawn(async move {
            let _ = worker.recv(None).await;
        });

        let frames = recv_at_router(&mut router).await;
        assert_eq!(frames[3], Bytes::copy_from_slice(&[worker_command::READY]));
        assert_ne!(frames[0], old_key);

        shutdown.shutdown();
        let _ = driver.await;
    }

    #[tokio::test]
    async fn test_heartbeats_emitted_on_deadline() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let mut worker = Worker::connect(Box::new(fabric.connector("inproc://broker")), "echo")
            .await
            .unwrap();
        worker.set_timing(Duration::from_millis(20), Duration::from_millis(10));

        let _ready = recv_at_router(&mut router).await;

        let shutdown = worker.shutdown_handle();
        let driver = tokio::spawn(async move {
            let _ = worker.recv(None).await;
        });

        let frames = recv_at_router(&mut router).await;
        assert_eq!(
            frames[3],
            Bytes::copy_from_slice(&[worker_command::HEARTBEAT])
        );

        shutdown.shutdown();
        let _ = driver.await;
    }
}
