//! In-process transport fabric.
//!
//! A [`MemoryFabric`] is a tiny address space of named router sockets and
//! anonymous peers wired together with unbounded channels. It exists so the
//! broker, client, and worker state machines can be exercised end to end in
//! tests without touching the network, and doubles as the reference
//! implementation of the [`RouterSocket`]/[`PeerSocket`] contract.
//!
//! Routing keys are `peer-N` byte strings minted per connection; a
//! reconnect mints a fresh key and abandons the old inbox, mirroring how a
//! socket recreation looks to a real router.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, ErrorCode, ErrorContext, Result};
use crate::transport::{Connector, PeerSocket, RouterSocket, RoutingKey};

/// Shared state of one fabric: named routers and keyed peer inboxes.
#[derive(Debug, Default)]
struct FabricState {
    /// Router inboxes by endpoint name. Messages already carry the sender
    /// routing key in frame 0.
    routers: HashMap<String, mpsc::UnboundedSender<Vec<Bytes>>>,
    /// Peer inboxes by routing key.
    peers: HashMap<RoutingKey, mpsc::UnboundedSender<Vec<Bytes>>>,
    /// Monotonic source for routing keys.
    next_peer: u64,
}

/// An in-process transport address space.
#[derive(Debug, Clone, Default)]
pub struct MemoryFabric {
    state: Arc<Mutex<FabricState>>,
}

impl MemoryFabric {
    /// Create an empty fabric.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a router socket at `endpoint`.
    ///
    /// Fails with `ConnectionFailed` if the endpoint is already bound.
    pub fn bind(&self, endpoint: &str) -> Result<MemoryRouterSocket> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if state.routers.contains_key(endpoint) {
            return Err(Error::new(
                ErrorCode::ConnectionFailed,
                "endpoint already bound",
            )
            .with_context(ErrorContext::Endpoint {
                address: endpoint.to_string(),
            }));
        }
        state.routers.insert(endpoint.to_string(), tx);
        Ok(MemoryRouterSocket {
            endpoint: endpoint.to_string(),
            rx,
            state: Arc::clone(&self.state),
        })
    }

    /// Connect a peer socket to the router at `endpoint`.
    pub fn connect(&self, endpoint: &str) -> Result<MemoryPeerSocket> {
        let mut state = self.lock();
        if !state.routers.contains_key(endpoint) {
            return Err(Error::new(
                ErrorCode::BrokerUnavailable,
                "no router bound at endpoint",
            )
            .with_context(ErrorContext::Endpoint {
                address: endpoint.to_string(),
            }));
        }
        let key = Self::register_peer(&mut state);
        let (tx, rx) = mpsc::unbounded_channel();
        state.peers.insert(key.clone(), tx);
        Ok(MemoryPeerSocket {
            endpoint: endpoint.to_string(),
            key,
            rx,
            state: Arc::clone(&self.state),
        })
    }

    /// A reusable connector for endpoint state machines that need to
    /// re-create their socket on timeout.
    pub fn connector(&self, endpoint: &str) -> MemoryConnector {
        MemoryConnector {
            fabric: self.clone(),
            endpoint: endpoint.to_string(),
        }
    }

    fn register_peer(state: &mut FabricState) -> RoutingKey {
        state.next_peer += 1;
        Bytes::from(format!("peer-{}", state.next_peer))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FabricState> {
        // Fabric state is plain maps; they stay consistent even if a
        // holder panicked, so poisoning is recovered rather than spread.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Router half of the in-process fabric.
#[derive(Debug)]
pub struct MemoryRouterSocket {
    endpoint: String,
    rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    state: Arc<Mutex<FabricState>>,
}

#[async_trait]
impl RouterSocket for MemoryRouterSocket {
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<Bytes>>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(frames)) => Ok(Some(frames)),
            // All peer senders plus the fabric handle dropped; nothing can
            // ever arrive again.
            Ok(None) => Err(Error::new(
                ErrorCode::SocketError,
                "fabric closed while receiving",
            )),
        }
    }

    async fn send(&mut self, mut frames: Vec<Bytes>) -> Result<()> {
        if frames.is_empty() {
            return Err(Error::invalid_message(0, "destination routing key"));
        }
        let key = frames.remove(0);
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.peers.get(&key) {
            Some(tx) => {
                if tx.send(frames).is_err() {
                    log::debug!(
                        "dropping message for vanished peer {:?}",
                        String::from_utf8_lossy(&key)
                    );
                }
            }
            None => {
                log::debug!(
                    "dropping message for unknown peer {:?}",
                    String::from_utf8_lossy(&key)
                );
            }
        }
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for MemoryRouterSocket {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.routers.remove(&self.endpoint);
    }
}

/// Peer half of the in-process fabric.
#[derive(Debug)]
pub struct MemoryPeerSocket {
    endpoint: String,
    key: RoutingKey,
    rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    state: Arc<Mutex<FabricState>>,
}

impl MemoryPeerSocket {
    /// The routing key the router currently knows this peer by.
    pub fn routing_key(&self) -> &RoutingKey {
        &self.key
    }
}

#[async_trait]
impl PeerSocket for MemoryPeerSocket {
    async fn send(&mut self, frames: Vec<Bytes>) -> Result<()> {
        let router_tx = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.routers.get(&self.endpoint).cloned()
        };
        let Some(tx) = router_tx else {
            return Err(Error::new(
                ErrorCode::BrokerUnavailable,
                "router endpoint gone",
            )
            .with_context(ErrorContext::Endpoint {
                address: self.endpoint.clone(),
            }));
        };
        let mut tagged = Vec::with_capacity(frames.len() + 1);
        tagged.push(self.key.clone());
        tagged.extend(frames);
        tx.send(tagged).map_err(|_| {
            Error::new(ErrorCode::SocketError, "router inbox closed").with_context(
                ErrorContext::Endpoint {
                    address: self.endpoint.clone(),
                },
            )
        })
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<Bytes>>> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(frames)) => Ok(Some(frames)),
            Ok(None) => Err(Error::new(
                ErrorCode::ConnectionFailed,
                "peer inbox closed by fabric",
            )),
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.peers.remove(&self.key);
        let key = MemoryFabric::register_peer(&mut state);
        let (tx, rx) = mpsc::unbounded_channel();
        state.peers.insert(key.clone(), tx);
        self.key = key;
        self.rx = rx;
        Ok(())
    }
}

impl Drop for MemoryPeerSocket {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.peers.remove(&self.key);
    }
}

/// Connector producing fresh [`MemoryPeerSocket`]s for one endpoint.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    fabric: MemoryFabric,
    endpoint: String,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn PeerSocket>> {
        Ok(Box::new(self.fabric.connect(&self.endpoint)?))
    }
}
