//! Transport abstraction required by the broker and endpoints.
//!
//! The core needs a reliable, message-framed, router-style transport:
//!
//! - a logical message is an ordered sequence of opaque byte-string frames;
//! - inbound messages at a router are tagged with a routing key identifying
//!   the sending peer (prepended as frame 0);
//! - outbound messages from a router carry the destination routing key in
//!   frame 0, which the transport consumes;
//! - receives are non-blocking polls with a timeout.
//!
//! Two adapters ship in-tree: [`memory`] (an in-process fabric used by the
//! integration tests) and [`tcp`] (length-prefixed multipart framing over a
//! TCP stream). Anything ZeroMQ-shaped can be slotted in by implementing
//! [`RouterSocket`]/[`PeerSocket`].

// Rust guideline compliant 2026-02

pub mod memory;
pub mod tcp;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Opaque routing key identifying one peer at a router socket.
pub type RoutingKey = Bytes;

/// Server-side socket: receives from many peers, sends by routing key.
#[async_trait]
pub trait RouterSocket: Send {
    /// Wait up to `timeout` for one inbound message.
    ///
    /// Returns `Ok(None)` on timeout. On success, frame 0 is the sender's
    /// routing key as prepended by the transport.
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<Bytes>>>;

    /// Send a message whose frame 0 is the destination routing key.
    ///
    /// The routing frame is consumed by the transport; the peer receives
    /// the remaining frames. Sending to a vanished peer is not an error —
    /// the message is dropped, matching router-socket semantics.
    async fn send(&mut self, frames: Vec<Bytes>) -> Result<()>;

    /// Address peers use to reach this socket.
    fn endpoint(&self) -> &str;
}

/// Client-side socket: one logical stream to a router.
#[async_trait]
pub trait PeerSocket: Send {
    /// Send a message to the router. Frames travel as composed; by protocol
    /// convention the first frame is the empty delimiter.
    async fn send(&mut self, frames: Vec<Bytes>) -> Result<()>;

    /// Wait up to `timeout` for one inbound message. `Ok(None)` on timeout.
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<Bytes>>>;

    /// Tear down and re-establish the underlying connection.
    ///
    /// The peer receives a fresh routing key; any in-flight traffic for the
    /// old key is lost, which is exactly the recovery semantics the
    /// endpoints build their retry advice on.
    async fn reconnect(&mut self) -> Result<()>;
}

/// Factory for peer sockets, used by endpoints to (re)connect.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a fresh peer socket to the configured endpoint.
    async fn connect(&self) -> Result<Box<dyn PeerSocket>>;
}
