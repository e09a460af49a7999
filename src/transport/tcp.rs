//! TCP transport adapter with length-prefixed multipart framing.
//!
//! One logical message on the wire:
//!
//! ```text
//! [u32 LE: body length] [body]
//! body = per frame: [u32 LE: frame length] [frame bytes]
//! ```
//!
//! The router side accepts connections, assigns each a `conn-N` routing
//! key, and runs one reader and one writer task per connection; decoded
//! messages are handed to the dispatch loop over a single channel with the
//! routing key prepended. The peer side is a plain sequential stream with
//! an incremental reassembly decoder.
//!
//! This adapter is deliberately minimal: ordering within one connection
//! comes from TCP, and a dropped connection simply retires its routing key
//! (the broker's liveness machinery handles the rest).

// Rust guideline compliant 2026-02

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::{Error, ErrorCode, ErrorContext, Result};
use crate::transport::{Connector, PeerSocket, RouterSocket, RoutingKey};

// ─── Message codec ─────────────────────────────────────────────────────────

/// Encode a frame sequence into one wire message.
pub fn encode_message(frames: &[Bytes]) -> Vec<u8> {
    let body_len: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    for frame in frames {
        buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(frame);
    }
    buf
}

/// Incremental message decoder that handles partial reads.
///
/// Feed bytes via [`MessageDecoder::feed`] and extract complete messages.
/// Handles TCP-style byte stream reassembly.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
}

impl MessageDecoder {
    /// Create a decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes and extract all complete messages.
    ///
    /// Incomplete data is retained for the next call.
    ///
    /// # Errors
    ///
    /// Returns `MessageTooLarge` for oversized bodies and `InvalidMessage`
    /// for truncated or inconsistent frame tables.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<Bytes>>> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let body_len =
                u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if body_len > MAX_MESSAGE_SIZE {
                return Err(Error::new(
                    ErrorCode::MessageTooLarge,
                    format!("message body {body_len} bytes exceeds {MAX_MESSAGE_SIZE}"),
                ));
            }
            let total = 4 + body_len as usize;
            if self.buf.len() < total {
                break;
            }

            messages.push(Self::split_frames(&self.buf[4..total])?);
            self.buf.drain(..total);
        }

        Ok(messages)
    }

    /// True if the decoder holds a partially received message.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    fn split_frames(mut body: &[u8]) -> Result<Vec<Bytes>> {
        let mut frames = Vec::new();
        while !body.is_empty() {
            if body.len() < 4 {
                return Err(Error::invalid_message(
                    frames.len(),
                    "4-byte frame length header",
                ));
            }
            let len = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
            if body.len() < 4 + len {
                return Err(Error::invalid_message(
                    frames.len(),
                    format!("{len} frame bytes"),
                ));
            }
            frames.push(Bytes::copy_from_slice(&body[4..4 + len]));
            body = &body[4 + len..];
        }
        if frames.is_empty() {
            return Err(Error::invalid_message(0, "at least one frame"));
        }
        Ok(frames)
    }
}

// ─── Router side ───────────────────────────────────────────────────────────

type ConnMap = Arc<Mutex<HashMap<RoutingKey, mpsc::UnboundedSender<Vec<Bytes>>>>>;

/// Router socket over a TCP listener.
#[derive(Debug)]
pub struct TcpRouterSocket {
    endpoint: String,
    inbound_rx: mpsc::UnboundedReceiver<Vec<Bytes>>,
    conns: ConnMap,
    accept_task: JoinHandle<()>,
}

impl TcpRouterSocket {
    /// Bind a listener and start accepting connections.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            Error::new(ErrorCode::ConnectionFailed, "bind failed")
                .with_context(ErrorContext::Endpoint {
                    address: addr.to_string(),
                })
                .with_source(e)
        })?;
        let endpoint = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string());

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let conns: ConnMap = Arc::new(Mutex::new(HashMap::new()));

        let accept_conns = Arc::clone(&conns);
        let accept_task = tokio::spawn(async move {
            let mut next_conn: u64 = 0;
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        continue;
                    }
                };
                next_conn += 1;
                let key = Bytes::from(format!("conn-{next_conn}"));
                log::debug!(
                    "accepted {} as {}",
                    remote,
                    String::from_utf8_lossy(&key)
                );
                spawn_connection(stream, key, inbound_tx.clone(), Arc::clone(&accept_conns));
            }
        });

        Ok(Self {
            endpoint,
            inbound_rx,
            conns,
            accept_task,
        })
    }
}

/// Start the reader/writer task pair for one accepted connection.
fn spawn_connection(
    stream: TcpStream,
    key: RoutingKey,
    inbound_tx: mpsc::UnboundedSender<Vec<Bytes>>,
    conns: ConnMap,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<Bytes>>();
    conns
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(key.clone(), out_tx);

    // Writer: drain the outbound queue until the router drops the entry.
    let writer_key = key.clone();
    tokio::spawn(async move {
        while let Some(frames) = out_rx.recv().await {
            if let Err(e) = write_half.write_all(&encode_message(&frames)).await {
                log::debug!(
                    "write to {} failed: {e}",
                    String::from_utf8_lossy(&writer_key)
                );
                break;
            }
        }
    });

    // Reader: reassemble messages, prepend the routing key, hand off.
    tokio::spawn(async move {
        let mut decoder = MessageDecoder::new();
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let n = match read_half.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let messages = match decoder.feed(&chunk[..n]) {
                Ok(messages) => messages,
                Err(e) => {
                    log::warn!(
                        "dropping connection {}: {e}",
                        String::from_utf8_lossy(&key)
                    );
                    break;
                }
            };
            for frames in messages {
                let mut tagged = Vec::with_capacity(frames.len() + 1);
                tagged.push(key.clone());
                tagged.extend(frames);
                if inbound_tx.send(tagged).is_err() {
                    return; // Router socket gone.
                }
            }
        }
        conns.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
    });
}

#[async_trait]
impl RouterSocket for TcpRouterSocket {
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<Bytes>>> {
        match tokio::time::timeout(timeout, self.inbound_rx.recv()).await {
            Err(_) => Ok(None),
            Ok(Some(frames)) => Ok(Some(frames)),
            Ok(None) => Err(Error::new(
                ErrorCode::SocketError,
                "listener tasks terminated",
            )),
        }
    }

    async fn send(&mut self, mut frames: Vec<Bytes>) -> Result<()> {
        if frames.is_empty() {
            return Err(Error::invalid_message(0, "destination routing key"));
        }
        let key = frames.remove(0);
        let conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        match conns.get(&key) {
            Some(tx) => {
                if tx.send(frames).is_err() {
                    log::debug!(
                        "dropping message for closed connection {}",
                        String::from_utf8_lossy(&key)
                    );
                }
            }
            None => {
                log::debug!(
                    "dropping message for unknown connection {}",
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

impl Drop for TcpRouterSocket {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

// ─── Peer side ─────────────────────────────────────────────────────────────

/// Peer socket over one TCP connection.
#[derive(Debug)]
pub struct TcpPeerSocket {
    addr: String,
    stream: TcpStream,
    decoder: MessageDecoder,
    ready: VecDeque<Vec<Bytes>>,
}

impl TcpPeerSocket {
    /// Connect to a router at `addr`.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            Error::new(ErrorCode::ConnectionFailed, "connect failed")
                .with_context(ErrorContext::Endpoint {
                    address: addr.to_string(),
                })
                .with_source(e)
        })?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            addr: addr.to_string(),
            stream,
            decoder: MessageDecoder::new(),
            ready: VecDeque::new(),
        })
    }
}

#[async_trait]
impl PeerSocket for TcpPeerSocket {
    async fn send(&mut self, frames: Vec<Bytes>) -> Result<()> {
        self.stream
            .write_all(&encode_message(&frames))
            .await
            .map_err(|e| {
                Error::new(ErrorCode::SocketError, "send failed")
                    .with_context(ErrorContext::Endpoint {
                        address: self.addr.clone(),
                    })
                    .with_source(e)
            })
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<Bytes>>> {
        if let Some(frames) = self.ready.pop_front() {
            return Ok(Some(frames));
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut chunk = [0u8; 16 * 1024];
        loop {
            let read = tokio::time::timeout_at(deadline, self.stream.read(&mut chunk)).await;
            let n = match read {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    return Err(Error::new(
                        ErrorCode::ConnectionFailed,
                        "connection closed by peer",
                    )
                    .with_context(ErrorContext::Endpoint {
                        address: self.addr.clone(),
                    }));
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(Error::new(ErrorCode::SocketError, "read failed")
                        .with_source(e));
                }
            };
            self.ready.extend(self.decoder.feed(&chunk[..n])?);
            if let Some(frames) = self.ready.pop_front() {
                return Ok(Some(frames));
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        let fresh = Self::connect(&self.addr).await?;
        self.stream = fresh.stream;
        self.decoder = MessageDecoder::new();
        self.ready.clear();
        Ok(())
    }
}

/// Connector producing fresh [`TcpPeerSocket`]s for one address.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    /// Connector for a router at `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn PeerSocket>> {
        Ok(Box::new(TcpPeerSocket::connect(&self.addr).await?))
    }
}
