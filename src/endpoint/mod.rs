//! Client and worker endpoint state machines.
//!
//! Both endpoints own one [`crate::transport::PeerSocket`] plus the
//! [`crate::transport::Connector`] that created it, so timeout recovery can
//! tear the socket down and re-attach without caller involvement. Neither
//! endpoint replays application traffic on its own: a timeout surfaces as a
//! retry-advice error and the caller decides.

// Rust guideline compliant 2026-02

pub mod client;
pub mod worker;

pub use client::{Client, ReplyStream};
pub use worker::{Worker, WorkerShutdown};
