//! Management interface: built-in services under the reserved `mmi.` prefix.
//!
//! MMI requests are answered inline by the dispatch loop from registry
//! snapshots. They never create a pending request and never mutate worker
//! state, so introspection stays side-effect free no matter what a client
//! sends.
//!
//! Each reply starts with an HTTP-style three-digit status string:
//! `200` success, `404` not found, `501` not implemented.

// Rust guideline compliant 2026-02

use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;

use crate::broker::registry::WorkerRegistry;

/// `mmi.service`: is at least one worker waiting for the named service?
pub const MMI_SERVICE: &str = "mmi.service";
/// `mmi.workers`: waiting-worker count for the named service.
pub const MMI_WORKERS: &str = "mmi.workers";
/// `mmi.heartbeat`: liveness echo.
pub const MMI_HEARTBEAT: &str = "mmi.heartbeat";
/// `mmi.broker`: broker identity and aggregate counters.
pub const MMI_BROKER: &str = "mmi.broker";

/// Status string constants shared with authorization responses.
pub mod status {
    /// Success.
    pub const OK: &str = "200";
    /// Not found / unavailable.
    pub const NOT_FOUND: &str = "404";
    /// Internal error.
    pub const INTERNAL: &str = "500";
    /// Not implemented.
    pub const NOT_IMPLEMENTED: &str = "501";
}

/// Answers `mmi.*` requests from registry snapshots.
#[derive(Debug)]
pub struct MmiHandler {
    version: String,
    started: Instant,
}

impl Default for MmiHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MmiHandler {
    /// Handler stamped with this crate's version and a fresh start instant.
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            started: Instant::now(),
        }
    }

    /// Answer one MMI request. Returns the reply payload `[status, …]`.
    pub fn handle(
        &self,
        registry: &WorkerRegistry,
        service: &str,
        payload: &[Bytes],
    ) -> Vec<Bytes> {
        match service {
            MMI_SERVICE => self.service_query(registry, payload),
            MMI_WORKERS => self.workers_query(registry, payload),
            MMI_HEARTBEAT => self.heartbeat_echo(payload),
            MMI_BROKER => self.broker_info(registry),
            other => {
                log::debug!("unimplemented MMI service {other}");
                vec![Bytes::from_static(status::NOT_IMPLEMENTED.as_bytes())]
            }
        }
    }

    fn service_query(&self, registry: &WorkerRegistry, payload: &[Bytes]) -> Vec<Bytes> {
        let name = first_frame_utf8(payload);
        let code = if registry.waiting_for_service(&name) > 0 {
            status::OK
        } else {
            status::NOT_FOUND
        };
        vec![Bytes::copy_from_slice(code.as_bytes())]
    }

    fn workers_query(&self, registry: &WorkerRegistry, payload: &[Bytes]) -> Vec<Bytes> {
        let name = first_frame_utf8(payload);
        let count = registry.waiting_for_service(&name);
        if count > 0 {
            vec![
                Bytes::from_static(status::OK.as_bytes()),
                Bytes::from(count.to_string()),
            ]
        } else {
            vec![
                Bytes::from_static(status::NOT_FOUND.as_bytes()),
                Bytes::from_static(b"0"),
            ]
        }
    }

    fn heartbeat_echo(&self, payload: &[Bytes]) -> Vec<Bytes> {
        let mut reply = Vec::with_capacity(2 + payload.len());
        reply.push(Bytes::from_static(status::OK.as_bytes()));
        reply.push(Bytes::from(format!(
            "heartbeat-echo-{}",
            Utc::now().timestamp()
        )));
        reply.extend(payload.iter().cloned());
        reply
    }

    fn broker_info(&self, registry: &WorkerRegistry) -> Vec<Bytes> {
        vec![
            Bytes::from_static(status::OK.as_bytes()),
            Bytes::from(format!("version={}", self.version)),
            Bytes::from(format!("uptime={}s", self.started.elapsed().as_secs())),
            Bytes::from(format!("services={}", registry.service_count())),
            Bytes::from(format!("workers={}", registry.worker_count())),
        ]
    }
}

fn first_frame_utf8(payload: &[Bytes]) -> String {
    payload
        .first()
        .map(|f| String::from_utf8_lossy(f).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_echo_worker() -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        registry
            .register(Bytes::from_static(b"w1"), "echo")
            .unwrap();
        registry
    }

    #[test]
    fn test_service_query_present_and_absent() {
        let registry = registry_with_echo_worker();
        let handler = MmiHandler::new();

        let reply = handler.handle(&registry, MMI_SERVICE, &[Bytes::from_static(b"echo")]);
        assert_eq!(reply, vec![Bytes::from_static(b"200")]);

        let reply = handler.handle(&registry, MMI_SERVICE, &[Bytes::from_static(b"nope")]);
        assert_eq!(reply, vec![Bytes::from_static(b"404")]);
    }

    #[test]
    fn test_service_query_busy_workers_do_not_count() {
        let mut registry = registry_with_echo_worker();
        registry.queue_request(
            "echo",
            crate::broker::registry::QueuedRequest {
                id: "r1".into(),
                client: Bytes::from_static(b"c1"),
                payload: vec![],
            },
        );
        registry.dispatch("echo");

        let handler = MmiHandler::new();
        let reply = handler.handle(&registry, MMI_SERVICE, &[Bytes::from_static(b"echo")]);
        assert_eq!(reply, vec![Bytes::from_static(b"404")]);
    }

    #[test]
    fn test_workers_query_counts() {
        let mut registry = registry_with_echo_worker();
        registry
            .register(Bytes::from_static(b"w2"), "echo")
            .unwrap();
        let handler = MmiHandler::new();

        let reply = handler.handle(&registry, MMI_WORKERS, &[Bytes::from_static(b"echo")]);
        assert_eq!(reply[0], Bytes::from_static(b"200"));
        assert_eq!(reply[1], Bytes::from_static(b"2"));

        let reply = handler.handle(&registry, MMI_WORKERS, &[Bytes::from_static(b"nope")]);
        assert_eq!(reply[0], Bytes::from_static(b"404"));
        assert_eq!(reply[1], Bytes::from_static(b"0"));
    }

    #[test]
    fn test_heartbeat_echoes_input() {
        let registry = WorkerRegistry::new();
        let handler = MmiHandler::new();
        let input = [Bytes::from_static(b"a"), Bytes::from_static(b"b")];

        let reply = handler.handle(&registry, MMI_HEARTBEAT, &input);
        assert_eq!(reply[0], Bytes::from_static(b"200"));
        assert!(reply[1].starts_with(b"heartbeat-echo-"));
        assert_eq!(&reply[2..], &input);
    }

    #[test]
    fn test_broker_info_tuples() {
        let registry = registry_with_echo_worker();
        let handler = MmiHandler::new();

        let reply = handler.handle(&registry, MMI_BROKER, &[]);
        assert_eq!(reply[0], Bytes::from_static(b"200"));
        let tuples: Vec<String> = reply[1..]
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect();
        assert!(tuples.iter().any(|t| t.starts_with("version=")));
        assert!(tuples.iter().any(|t| t.starts_with("uptime=")));
        assert!(tuples.contains(&"services=1".to_string()));
        assert!(tuples.contains(&"workers=1".to_string()));
    }

    #[test]
    fn test_unknown_mmi_service_is_501() {
        let registry = WorkerRegistry::new();
        let handler = MmiHandler::new();
        let reply = handler.handle(&registry, "mmi.unknown", &[]);
        assert_eq!(reply, vec![Bytes::from_static(b"501")]);
    }
}
