//! In-process cluster view: a local directory of peer broker nodes.
//!
//! The view is advisory load distribution, not replication: an external
//! load balancer consults it to pick a broker, and some heartbeat source
//! (gossip, UDP, HTTP — deliberately pluggable) keeps `last_seen` fresh via
//! [`ClusterView::touch`]. The failure detector runs on its own task and
//! only consumes `last_seen`.
//!
//! Failure notifications travel over a broadcast channel and subscriber
//! callbacks run in fresh tasks, never under the view's lock; they must be
//! idempotent because further state changes race with them.

// Rust guideline compliant 2026-02

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{FAILURE_DETECT_INTERVAL, FAILURE_THRESHOLD};

/// Health status of a peer broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Heartbeating and eligible for selection.
    Active,
    /// Silent past the failure threshold.
    Failed,
    /// Administratively out of rotation.
    Inactive,
}

/// Directory entry for one broker node.
#[derive(Debug, Clone)]
pub struct BrokerNode {
    /// Unique node identifier.
    pub id: String,
    /// Transport endpoint clients would connect to.
    pub endpoint: String,
    /// Last heartbeat (or registration) instant.
    pub last_seen: Instant,
    /// Current health status.
    pub status: NodeStatus,
    /// Advisory load figure (worker count).
    pub load: u64,
    /// Services the node claims to host.
    pub services: HashSet<String>,
    /// Times the detector has marked this node failed.
    pub failure_count: u32,
}

impl BrokerNode {
    /// Fresh active node.
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            last_seen: Instant::now(),
            status: NodeStatus::Active,
            load: 0,
            services: HashSet::new(),
            failure_count: 0,
        }
    }
}

/// Event published when the failure detector transitions a node.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A node crossed the silence threshold; snapshot taken at transition.
    NodeFailed(BrokerNode),
}

/// Aggregate statistics for introspection surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStats {
    /// All known nodes.
    pub total: usize,
    /// Nodes currently active.
    pub active: usize,
    /// Nodes currently failed.
    pub failed: usize,
}

/// Local directory of peer brokers with health and load.
///
/// Self-protecting: one `RwLock`, shared between the detector task and any
/// reader.
#[derive(Debug)]
pub struct ClusterView {
    local_id: String,
    nodes: Arc<RwLock<BTreeMap<String, BrokerNode>>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl ClusterView {
    /// View seeded with the local node.
    pub fn new(local: BrokerNode) -> Self {
        let local_id = local.id.clone();
        let mut nodes = BTreeMap::new();
        nodes.insert(local_id.clone(), local);
        let (events, _) = broadcast::channel(64);
        Self {
            local_id,
            nodes: Arc::new(RwLock::new(nodes)),
            events,
        }
    }

    /// Insert or replace a node.
    pub fn add_node(&self, node: BrokerNode) {
        self.write().insert(node.id.clone(), node);
    }

    /// Remove a node. Returns the entry if it existed.
    pub fn remove_node(&self, id: &str) -> Option<BrokerNode> {
        self.write().remove(id)
    }

    /// Record a heartbeat from `id`; reactivates a failed node.
    ///
    /// This is the pluggable liveness input — whatever transmits cluster
    /// heartbeats only has to call this on receipt.
    pub fn touch(&self, id: &str) -> bool {
        let mut nodes = self.write();
        match nodes.get_mut(id) {
            Some(node) => {
                node.last_seen = Instant::now();
                if node.status == NodeStatus::Failed {
                    node.status = NodeStatus::Active;
                }
                true
            }
            None => false,
        }
    }

    /// Update the local node's advisory load and service set.
    pub fn update_local_load(&self, worker_count: u64, services: impl IntoIterator<Item = String>) {
        let mut nodes = self.write();
        if let Some(local) = nodes.get_mut(&self.local_id) {
            local.load = worker_count;
            local.services = services.into_iter().collect();
            local.last_seen = Instant::now();
        }
    }

    /// Snapshot of all active nodes, id-ordered.
    pub fn get_active_nodes(&self) -> Vec<BrokerNode> {
        self.read()
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .cloned()
            .collect()
    }

    /// Snapshot of every node, id-ordered.
    pub fn get_all_nodes(&self) -> Vec<BrokerNode> {
        self.read().values().cloned().collect()
    }

    /// Active node with the smallest load.
    ///
    /// Ties break deterministically on id order (first encountered) —
    /// acceptable because the view is advisory.
    pub fn get_best_broker(&self) -> Option<BrokerNode> {
        self.read()
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .min_by_key(|n| n.load)
            .cloned()
    }

    /// Least-loaded active node hosting `service`, falling back to
    /// [`ClusterView::get_best_broker`] when nobody claims it.
    pub fn get_broker_for_service(&self, service: &str) -> Option<BrokerNode> {
        let hosting = self
            .read()
            .values()
            .filter(|n| n.status == NodeStatus::Active && n.services.contains(service))
            .min_by_key(|n| n.load)
            .cloned();
        hosting.or_else(|| self.get_best_broker())
    }

    /// Aggregate counters.
    pub fn stats(&self) -> ClusterStats {
        let nodes = self.read();
        ClusterStats {
            total: nodes.len(),
            active: nodes
                .values()
                .filter(|n| n.status == NodeStatus::Active)
                .count(),
            failed: nodes
                .values()
                .filter(|n| n.status == NodeStatus::Failed)
                .count(),
        }
    }

    /// Subscribe to cluster events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }

    /// Register a callback invoked on a fresh task whenever the detector
    /// marks a node failed.
    ///
    /// The callback runs concurrently with further state changes and must
    /// be idempotent.
    pub fn on_node_update<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(BrokerNode) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        let callback = Arc::new(callback);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ClusterEvent::NodeFailed(node)) => {
                        let callback = Arc::clone(&callback);
                        tokio::spawn(async move { callback(node) });
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::warn!("cluster event subscriber lagged by {missed}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// One failure-detection pass at `now` with the given silence
    /// threshold. Returns the nodes transitioned to failed.
    ///
    /// The local node is never marked failed. Events are published after
    /// the lock is released.
    pub fn detect_failures_at(&self, now: Instant, threshold: Duration) -> Vec<BrokerNode> {
        let mut failed = Vec::new();
        {
            let mut nodes = self.write();
            for node in nodes.values_mut() {
                if node.id == self.local_id || node.status != NodeStatus::Active {
                    continue;
                }
                if now.duration_since(node.last_seen) > threshold {
                    node.status = NodeStatus::Failed;
                    node.failure_count += 1;
                    failed.push(node.clone());
                }
            }
        }
        for node in &failed {
            log::warn!("cluster node {} marked failed", node.id);
            // Ignore the error: no subscribers is fine.
            let _ = self.events.send(ClusterEvent::NodeFailed(node.clone()));
        }
        failed
    }

    /// Spawn the periodic failure detector. Stops when `cancel` fires.
    pub fn spawn_failure_detector(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let view = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(FAILURE_DETECT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        view.detect_failures_at(Instant::now(), FAILURE_THRESHOLD);
                    }
                }
            }
        })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, BrokerNode>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, BrokerNode>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ClusterView {
        ClusterView::new(BrokerNode::new("local", "tcp://127.0.0.1:5555"))
    }

    fn aged(mut node: BrokerNode, by: Duration) -> BrokerNode {
        node.last_seen = Instant::now() - by;
        node
    }

    #[test]
    fn test_best_broker_prefers_lowest_load() {
        let view = view();
        let mut heavy = BrokerNode::new("heavy", "tcp://a");
        heavy.load = 10;
        let mut light = BrokerNode::new("light", "tcp://b");
        light.load = 2;
        view.add_node(heavy);
        view.add_node(light);
        view.update_local_load(5, std::iter::empty());

        assert_eq!(view.get_best_broker().unwrap().id, "light");
    }

    #[test]
    fn test_best_broker_tie_breaks_on_id_order() {
        let view = view();
        view.add_node(BrokerNode::new("bravo", "tcp://b"));
        view.add_node(BrokerNode::new("alpha", "tcp://a"));
        view.update_local_load(9, std::iter::empty());

        // Both peers carry load 0; BTreeMap order makes "alpha" first.
        assert_eq!(view.get_best_broker().unwrap().id, "alpha");
    }

    #[test]
    fn test_broker_for_service_filters_then_falls_back() {
        let view = view();
        let mut echo_node = BrokerNode::new("echo-host", "tcp://a");
        echo_node.services.insert("echo".into());
        echo_node.load = 50;
        view.add_node(echo_node);
        let mut idle = BrokerNode::new("idle", "tcp://b");
        idle.load = 0;
        view.add_node(idle);
        view.update_local_load(9, std::iter::empty());

        // The only host of "echo" wins despite higher load.
        assert_eq!(view.get_broker_for_service("echo").unwrap().id, "echo-host");
        // Nobody hosts "nope": fall back to the global best.
        assert_eq!(view.get_broker_for_service("nope").unwrap().id, "idle");
    }

    #[test]
    fn test_detector_marks_silent_peers_failed() {
        let view = view();
        view.add_node(aged(BrokerNode::new("silent", "tcp://a"), Duration::from_secs(120)));
        view.add_node(BrokerNode::new("chatty", "tcp://b"));

        let failed = view.detect_failures_at(Instant::now(), FAILURE_THRESHOLD);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "silent");
        assert_eq!(failed[0].failure_count, 1);

        let stats = view.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn test_detector_never_fails_local_node() {
        let view = view();
        // Age the local node far past the threshold.
        {
            let mut nodes = view.write();
            let local = nodes.get_mut("local").unwrap();
            local.last_seen = Instant::now() - Duration::from_secs(600);
        }
        assert!(view
            .detect_failures_at(Instant::now(), FAILURE_THRESHOLD)
            .is_empty());
        assert_eq!(view.stats().failed, 0);
    }

    #[test]
    fn test_touch_reactivates_failed_node() {
        let view = view();
        view.add_node(aged(BrokerNode::new("flaky", "tcp://a"), Duration::from_secs(120)));
        view.detect_failures_at(Instant::now(), FAILURE_THRESHOLD);
        assert_eq!(view.stats().failed, 1);

        assert!(view.touch("flaky"));
        assert_eq!(view.stats().failed, 0);
        assert!(!view.touch("ghost"));
    }

    #[test]
    fn test_failed_nodes_excluded_from_selection() {
        let view = view();
        view.add_node(aged(BrokerNode::new("down", "tcp://a"), Duration::from_secs(120)));
        view.detect_failures_at(Instant::now(), FAILURE_THRESHOLD);
        view.update_local_load(3, std::iter::empty());

        assert!(view.get_active_nodes().iter().all(|n| n.id != "down"));
        assert_eq!(view.get_best_broker().unwrap().id, "local");
    }

    #[tokio::test]
    async fn test_subscriber_receives_failure_events() {
        let view = Arc::new(view());
        let mut rx = view.subscribe();
        view.add_node(aged(BrokerNode::new("silent", "tcp://a"), Duration::from_secs(120)));

        view.detect_failures_at(Instant::now(), FAILURE_THRESHOLD);
        let ClusterEvent::NodeFailed(node) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(node.id, "silent");
    }

    #[tokio::test]
    async fn test_on_node_update_runs_callback_in_fresh_task() {
        let view = Arc::new(view());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = view.on_node_update(move |node| {
            let _ = tx.send(node.id);
        });

        view.add_node(aged(BrokerNode::new("silent", "tcp://a"), Duration::from_secs(120)));
        view.detect_failures_at(Instant::now(), FAILURE_THRESHOLD);

        let id = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, "silent");
        handle.abort();
    }

    #[test]
    fn test_remove_node() {
        let view = view();
        view.add_node(BrokerNode::new("gone", "tcp://a"));
        assert!(view.remove_node("gone").is_some());
        assert!(view.remove_node("gone").is_none());
    }
}
