//! Majordomo v0.2 wire protocol: tags, command bytes, and frame validation.
//!
//! A logical message is an ordered sequence of opaque byte-string frames.
//! The codec is stateless and validates shape only, never semantics.
//!
//! Wire layouts (routing frame included where the transport exposes it):
//!
//! ```text
//! Client → Broker   ["", MDPC02, REQUEST, service, …payload]
//! Broker → Client   [client_addr, MDPC02, PARTIAL|FINAL, service, …payload]
//! Worker → Broker   ["", MDPW02, READY, service]
//!                   ["", MDPW02, PARTIAL|FINAL, client_addr, …payload]
//!                   ["", MDPW02, HEARTBEAT]
//!                   ["", MDPW02, DISCONNECT]
//! Broker → Worker   [worker_addr, MDPW02, REQUEST, client_addr, …payload]
//!                   [worker_addr, MDPW02, HEARTBEAT]
//!                   [worker_addr, MDPW02, DISCONNECT]
//! ```
//!
//! Commands are single bytes; the client and worker command spaces are
//! independent. Service names starting with `mmi.` are reserved for the
//! broker's built-in management interface.

// Rust guideline compliant 2026-02

use bytes::Bytes;

use crate::error::{Error, ErrorCode, Result};

/// Protocol tag identifying client-space traffic (ASCII `MDPC02`).
pub const CLIENT_V2: &[u8] = b"MDPC02";

/// Protocol tag identifying worker-space traffic (ASCII `MDPW02`).
pub const WORKER_V2: &[u8] = b"MDPW02";

/// Reserved service-name prefix for broker-internal services.
pub const MMI_PREFIX: &str = "mmi.";

/// Client command byte constants.
pub mod client_command {
    /// Client → broker request.
    pub const REQUEST: u8 = 0x01;
    /// Broker → client intermediate reply.
    pub const PARTIAL: u8 = 0x02;
    /// Broker → client terminal reply.
    pub const FINAL: u8 = 0x03;
}

/// Worker command byte constants.
pub mod worker_command {
    /// Worker → broker service registration.
    pub const READY: u8 = 0x01;
    /// Broker → worker dispatched request.
    pub const REQUEST: u8 = 0x02;
    /// Worker → broker intermediate reply.
    pub const PARTIAL: u8 = 0x03;
    /// Worker → broker terminal reply.
    pub const FINAL: u8 = 0x04;
    /// Liveness signal, both directions.
    pub const HEARTBEAT: u8 = 0x05;
    /// Session teardown, both directions.
    pub const DISCONNECT: u8 = 0x06;
}

/// A decoded worker-space command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Service registration.
    Ready,
    /// Dispatched request (broker → worker only).
    Request,
    /// Intermediate reply.
    Partial,
    /// Terminal reply.
    Final,
    /// Liveness signal.
    Heartbeat,
    /// Session teardown.
    Disconnect,
}

impl WorkerCommand {
    /// Decode a worker command byte.
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            worker_command::READY => Ok(WorkerCommand::Ready),
            worker_command::REQUEST => Ok(WorkerCommand::Request),
            worker_command::PARTIAL => Ok(WorkerCommand::Partial),
            worker_command::FINAL => Ok(WorkerCommand::Final),
            worker_command::HEARTBEAT => Ok(WorkerCommand::Heartbeat),
            worker_command::DISCONNECT => Ok(WorkerCommand::Disconnect),
            other => Err(Error::new(
                ErrorCode::InvalidCommand,
                format!("unknown worker command 0x{other:02x}"),
            )),
        }
    }

    /// The wire byte for this command.
    pub fn as_byte(self) -> u8 {
        match self {
            WorkerCommand::Ready => worker_command::READY,
            WorkerCommand::Request => worker_command::REQUEST,
            WorkerCommand::Partial => worker_command::PARTIAL,
            WorkerCommand::Final => worker_command::FINAL,
            WorkerCommand::Heartbeat => worker_command::HEARTBEAT,
            WorkerCommand::Disconnect => worker_command::DISCONNECT,
        }
    }
}

/// True if `name` is reserved for the management interface.
pub fn is_reserved_service(name: &str) -> bool {
    name.starts_with(MMI_PREFIX)
}

/// One-byte frame for a command byte.
pub fn command_frame(byte: u8) -> Bytes {
    Bytes::copy_from_slice(&[byte])
}

// ─── Shape validation ──────────────────────────────────────────────────────
//
// Each validator checks one direction's frame layout and fails with
// `InvalidMessage`, citing the offending frame index and the expectation.
// Callers drop the sequence and log; there is no recovery path.

fn expect_min_frames(frames: &[Bytes], min: usize) -> Result<()> {
    if frames.len() < min {
        return Err(Error::invalid_message(
            frames.len(),
            format!("at least {min} frames, got {}", frames.len()),
        ));
    }
    Ok(())
}

fn expect_tag(frames: &[Bytes], index: usize, tag: &[u8]) -> Result<()> {
    if frames[index].as_ref() != tag {
        return Err(Error::invalid_message(
            index,
            format!("protocol tag {}", String::from_utf8_lossy(tag)),
        ));
    }
    Ok(())
}

fn expect_command(frames: &[Bytes], index: usize, allowed: &[u8]) -> Result<u8> {
    let frame = frames[index].as_ref();
    if frame.len() != 1 || !allowed.contains(&frame[0]) {
        let expected = allowed
            .iter()
            .map(|byte| format!("0x{byte:02x}"))
            .collect::<Vec<_>>()
            .join("|");
        return Err(Error::invalid_message(index, format!("command {expected}")));
    }
    Ok(frame[0])
}

fn expect_non_empty(frames: &[Bytes], index: usize, what: &str) -> Result<()> {
    if frames[index].is_empty() {
        return Err(Error::invalid_message(index, format!("non-empty {what}")));
    }
    Ok(())
}

/// Validate a broker→client-direction sequence as seen by a client:
/// `[MDPC02, PARTIAL|FINAL, service, …]`.
pub fn validate_client_inbound(frames: &[Bytes]) -> Result<u8> {
    expect_min_frames(frames, 3)?;
    expect_tag(frames, 0, CLIENT_V2)?;
    let command = expect_command(
        frames,
        1,
        &[client_command::PARTIAL, client_command::FINAL],
    )?;
    expect_non_empty(frames, 2, "service name")?;
    Ok(command)
}

/// Validate a broker→worker-direction sequence as seen by a worker:
/// `[MDPW02, command, …]`.
pub fn validate_worker_inbound(frames: &[Bytes]) -> Result<WorkerCommand> {
    expect_min_frames(frames, 2)?;
    expect_tag(frames, 0, WORKER_V2)?;
    let byte = expect_command(
        frames,
        1,
        &[
            worker_command::READY,
            worker_command::REQUEST,
            worker_command::PARTIAL,
            worker_command::FINAL,
            worker_command::HEARTBEAT,
            worker_command::DISCONNECT,
        ],
    )?;
    WorkerCommand::from_byte(byte)
}

/// Validate an outbound broker→client sequence with its routing frame:
/// `[client_addr, MDPC02, PARTIAL|FINAL, service, …]`.
pub fn validate_broker_to_client(frames: &[Bytes]) -> Result<()> {
    expect_min_frames(frames, 4)?;
    expect_non_empty(frames, 0, "client address")?;
    expect_tag(frames, 1, CLIENT_V2)?;
    expect_command(
        frames,
        2,
        &[client_command::PARTIAL, client_command::FINAL],
    )?;
    expect_non_empty(frames, 3, "service name")?;
    Ok(())
}

/// Validate an outbound broker→worker sequence with its routing frame:
/// `[worker_addr, MDPW02, command, …]`.
pub fn validate_broker_to_worker(frames: &[Bytes]) -> Result<WorkerCommand> {
    expect_min_frames(frames, 3)?;
    expect_non_empty(frames, 0, "worker address")?;
    expect_tag(frames, 1, WORKER_V2)?;
    let byte = expect_command(
        frames,
        2,
        &[
            worker_command::READY,
            worker_command::REQUEST,
            worker_command::HEARTBEAT,
            worker_command::DISCONNECT,
        ],
    )?;
    WorkerCommand::from_byte(byte)
}

/// Validate an inbound client request as seen by the broker (routing frame
/// and delimiter already stripped): `[MDPC02, REQUEST, service, …payload]`.
pub fn validate_client_request(frames: &[Bytes]) -> Result<()> {
    expect_min_frames(frames, 3)?;
    expect_tag(frames, 0, CLIENT_V2)?;
    expect_command(frames, 1, &[client_command::REQUEST])?;
    expect_non_empty(frames, 2, "service name")?;
    Ok(())
}

/// Validate a worker reply as routed inside the broker:
/// `[worker_addr, MDPW02, PARTIAL|FINAL, client_addr, …payload]`.
pub fn validate_worker_reply(frames: &[Bytes]) -> Result<u8> {
    expect_min_frames(frames, 4)?;
    expect_non_empty(frames, 0, "worker address")?;
    expect_tag(frames, 1, WORKER_V2)?;
    let command = expect_command(
        frames,
        2,
        &[worker_command::PARTIAL, worker_command::FINAL],
    )?;
    expect_non_empty(frames, 3, "client address")?;
    Ok(command)
}

// ─── Encode/decode ─────────────────────────────────────────────────────────

/// Encode a frame sequence for the transport. Identity on the list: the
/// transport accepts ordered opaque frames as-is.
pub fn encode(frames: Vec<Bytes>) -> Vec<Bytes> {
    frames
}

/// Decode a frame sequence from the transport. Identity on the list.
pub fn decode(frames: Vec<Bytes>) -> Vec<Bytes> {
    frames
}
