//! Client endpoint: send requests, receive streamed replies.
//!
//! State machine: `disconnected → connected → in-flight → connected`.
//!
//! A receive timeout closes and re-creates the underlying transport
//! endpoint and returns a retry-advice error — the client never replays
//! the request itself, because the broker may still deliver the original
//! reply to the old (now dead) identity.

// Rust guideline compliant 2026-02

use std::time::Duration;

use bytes::Bytes;

use crate::constants::CLIENT_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::{self, client_command, command_frame, CLIENT_V2};
use crate::transport::{Connector, PeerSocket};

/// Client endpoint speaking the broker's framed protocol.
pub struct Client {
    connector: Box<dyn Connector>,
    socket: Box<dyn PeerSocket>,
    timeout: Duration,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Client {
    /// Connect through `connector` with the default receive timeout.
    pub async fn connect(connector: Box<dyn Connector>) -> Result<Self> {
        let socket = connector.connect().await?;
        Ok(Self {
            connector,
            socket,
            timeout: CLIENT_TIMEOUT,
        })
    }

    /// Override the per-receive timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send one request: `["", MDPC02, REQUEST, service, …payload]`.
    pub async fn send(&mut self, service: &str, payload: Vec<Bytes>) -> Result<()> {
        let mut frames = Vec::with_capacity(4 + payload.len());
        frames.push(Bytes::new());
        frames.push(Bytes::from_static(CLIENT_V2));
        frames.push(command_frame(client_command::REQUEST));
        frames.push(Bytes::copy_from_slice(service.as_bytes()));
        frames.extend(payload);
        self.socket.send(frames).await
    }

    /// Wait for the FINAL reply, discarding PARTIALs (compatibility mode).
    ///
    /// On timeout the transport endpoint is re-created and a retryable
    /// `Timeout` error is returned; the caller decides whether to resend.
    pub async fn recv(&mut self) -> Result<Vec<Bytes>> {
        loop {
            let (payload, is_final) = self.recv_reply().await?;
            if is_final {
                return Ok(payload);
            }
            log::trace!("dropping PARTIAL in compatibility mode");
        }
    }

    /// Stream replies until a FINAL is observed.
    ///
    /// Yields `(payload, is_final)` per reply frame sequence; after the
    /// FINAL item the stream returns `None`.
    pub fn recv_stream(&mut self) -> ReplyStream<'_> {
        ReplyStream {
            client: self,
            done: false,
        }
    }

    /// Receive one validated reply, reconnecting on timeout.
    async fn recv_reply(&mut self) -> Result<(Vec<Bytes>, bool)> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let Some(frames) = self.socket.recv_timeout(remaining).await? else {
                self.reconnect().await?;
                return Err(Error::timeout("reply receive"));
            };
            match protocol::validate_client_inbound(&frames) {
                Ok(command) => {
                    let payload = frames[3..].to_vec();
                    return Ok((payload, command == client_command::FINAL));
                }
                Err(e) => {
                    // Shape violations are dropped; keep waiting out the
                    // same deadline.
                    log::warn!("dropping malformed reply: {e}");
                }
            }
        }
    }

    /// Re-create the transport endpoint after a timeout.
    async fn reconnect(&mut self) -> Result<()> {
        log::debug!("client reconnecting after timeout");
        match self.connector.connect().await {
            Ok(socket) => {
                self.socket = socket;
                Ok(())
            }
            // Fall back to the socket's own reconnect if the connector
            // cannot produce a fresh one right now.
            Err(e) => {
                log::warn!("connector failed during reconnect: {e}");
                self.socket.reconnect().await
            }
        }
    }
}

/// Streaming reply iterator produced by [`Client::recv_stream`].
#[derive(Debug)]
pub struct ReplyStream<'a> {
    client: &'a mut Client,
    done: bool,
}

impl ReplyStream<'_> {
    /// Next reply item, or `None` after the FINAL has been yielded.
    ///
    /// A timeout reconnects the endpoint and surfaces the retry-advice
    /// error mid-stream.
    pub async fn next(&mut self) -> Result<Option<(Vec<Bytes>, bool)>> {
        if self.done {
            return Ok(None);
        }
        let (payload, is_final) = self.client.recv_reply().await?;
        if is_final {
            self.done = true;
        }
        Ok(Some((payload, is_final)))
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

    async fn reply(
        router: &mut (impl RouterSocket + ?Sized),
        client_key: Bytes,
        command: u8,
        payload: &[&str],
    ) {
        let mut frames = vec![
            client_key,
            b("MDPC02"),
            Bytes::copy_from_slice(&[command]),
            b("echo"),
        ];
        frames.extend(payload.iter().map(|p| b(p)));
        router.send(frames).await.unwrap();
    }

    async fn recv_request(router: &mut (impl RouterSocket + ?Sized)) -> (Bytes, Vec<Bytes>) {
        let frames = router
            .recv_timeout(Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        (frames[0].clone(), frames)
    }

    #[tokio::test]
    async fn test_send_composes_request_frames() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let mut client = Client::connect(Box::new(fabric.connector("inproc://broker")))
            .await
            .unwrap();

        client.send("echo", vec![b("hello")]).await.unwrap();

        let (_, frames) = recv_request(&mut router).await;
        // [routing key, "", MDPC02, REQUEST, "echo", "hello"]
        assert_eq!(frames[1], b(""));
        assert_eq!(frames[2], b("MDPC02"));
        assert_eq!(frames[3], Bytes::copy_from_slice(&[0x01]));
        assert_eq!(frames[4], b("echo"));
        assert_eq!(frames[5], b("hello"));
    }

    #[tokio::test]
    async fn test_recv_drops_partials_returns_final() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let mut client = Client::connect(Box::new(fabric.connector("inproc://broker")))
            .await
            .unwrap();

        client.send("echo", vec![b("hi")]).await.unwrap();
        let (key, _) = recv_request(&mut router).await;

        reply(&mut router, key.clone(), client_command::PARTIAL, &["one"]).await;
        reply(&mut router, key.clone(), client_command::PARTIAL, &["two"]).await;
        reply(&mut router, key, client_command::FINAL, &["done"]).await;

        let payload = client.recv().await.unwrap();
        assert_eq!(payload, vec![b("done")]);
    }

    #[tokio::test]
    async fn test_recv_stream_yields_in_order_with_final_flag() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let mut client = Client::connect(Box::new(fabric.connector("inproc://broker")))
            .await
            .unwrap();

        client.send("echo", vec![b("hi")]).await.unwrap();
        let (key, _) = recv_request(&mut router).await;

        reply(&mut router, key.clone(), client_command::PARTIAL, &["p1"]).await;
        reply(&mut router, key.clone(), client_command::PARTIAL, &["p2"]).await;
        reply(&mut router, key, client_command::FINAL, &["fin"]).await;

        let mut stream = client.recv_stream();
        assert_eq!(
            stream.next().await.unwrap(),
            Some((vec![b("p1")], false))
        );
        assert_eq!(
            stream.next().await.unwrap(),
            Some((vec![b("p2")], false))
        );
        assert_eq!(stream.next().await.unwrap(), Some((vec![b("fin")], true)));
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_timeout_reconnects_and_advises_retry() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let mut client = Client::connect(Box::new(fabric.connector("inproc://broker")))
            .await
            .unwrap();
        client.set_timeout(Duration::from_millis(30));

        client.send("echo", vec![b("hi")]).await.unwrap();
        let (old_key, _) = recv_request(&mut router).await;

        let err = client.recv().await.unwrap_err();
        assert!(err.is_retryable());

        // The endpoint came back under a fresh identity.
        client.send("echo", vec![b("again")]).await.unwrap();
        let (new_key, _) = recv_request(&mut router).await;
        assert_ne!(old_key, new_key);
    }

    #[tokio::test]
    async fn test_malformed_replies_are_skipped() {
        let fabric = MemoryFabric::new();
        let mut router = fabric.bind("inproc://broker").unwrap();
        let mut client = Client::connect(Box::new(fabric.connector("inproc://broker")))
            .await
            .unwrap();

        client.send("echo", vec![b("hi")]).await.unwrap();
        let (key, _) = recv_request(&mut router).await;

        // Garbage first, then a proper FINAL.
        router
            .send(vec![key.clone(), b("garbage")])
            .await
            .unwrap();
        reply(&mut router, key, client_command::FINAL, &["ok"]).await;

        assert_eq!(client.recv().await.unwrap(), vec![b("ok")]);
    }
}
