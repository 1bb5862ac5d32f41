//! Discovery driver: classify candidate nodes and keep the node table.

pub mod nodeset;
pub mod source;
pub mod store;

pub use nodeset::NodeSet;
pub use source::{
    parse_bootnodes, start_discv4, Discv4Enr, Discv4Nodes, EnrResolver, NoEnr, NodeIterator,
    StaticNodes, DEFAULT_DISCOVERY_PORT, ENR_TIMEOUT,
};
pub use store::{NodeEntry, NodeStore};

use crate::p2p::rlpx::{node_id_hex, DIAL_TIMEOUT};
use crate::p2p::{AdmitOutcome, PeerManager, Session, SessionConfig};
use chrono::Utc;
use reth_network_peers::NodeRecord;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

pub const DEFAULT_PARALLEL: usize = 16;
pub const DEFAULT_REVALIDATION_INTERVAL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_CRAWL_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(8);

/// What the driver did with one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Added,
    Updated,
    Removed,
    SkipRecent,
    SkipIncompatible,
}

/// Running totals, shared by every worker.
#[derive(Debug, Default)]
pub struct DriverStats {
    added: AtomicU64,
    updated: AtomicU64,
    removed: AtomicU64,
    skipped_recent: AtomicU64,
    skipped_incompatible: AtomicU64,
}

impl DriverStats {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Added => &self.added,
            Outcome::Updated => &self.updated,
            Outcome::Removed => &self.removed,
            Outcome::SkipRecent => &self.skipped_recent,
            Outcome::SkipIncompatible => &self.skipped_incompatible,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn added(&self) -> u64 {
        self.added.load(Ordering::Relaxed)
    }

    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.removed.load(Ordering::Relaxed)
    }

    pub fn skipped_recent(&self) -> u64 {
        self.skipped_recent.load(Ordering::Relaxed)
    }

    pub fn skipped_incompatible(&self) -> u64 {
        self.skipped_incompatible.load(Ordering::Relaxed)
    }
}

/// How candidates are contacted.
#[derive(Clone)]
pub enum Mode {
    /// Dial, exchange status, hang up.
    Crawl(SessionConfig),
    /// Hand candidates to the session manager.
    Sensor(Arc<PeerManager>),
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub parallel: usize,
    pub revalidation_interval: Duration,
    /// Total run time; `None` runs until stopped.
    pub timeout: Option<Duration>,
    /// Rewritten after every accepted update when set.
    pub nodes_file: Option<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLEL,
            revalidation_interval: DEFAULT_REVALIDATION_INTERVAL,
            timeout: None,
            nodes_file: None,
        }
    }
}

pub struct Driver {
    mode: Mode,
    config: DriverConfig,
    store: Arc<NodeStore>,
    resolver: Arc<dyn EnrResolver>,
    stats: DriverStats,
    /// Serializes nodes file rewrites.
    file_lock: Arc<Mutex<()>>,
}

impl Driver {
    pub fn new(
        mode: Mode,
        config: DriverConfig,
        store: Arc<NodeStore>,
        resolver: Arc<dyn EnrResolver>,
    ) -> Self {
        Self {
            mode,
            config,
            store,
            resolver,
            stats: DriverStats::default(),
            file_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    /// Feed every iterator into the worker pool until the timeout passes or
    /// `stop` fires. A crawl also ends once every iterator is exhausted; a
    /// sensor keeps its sessions until stopped. Returns the final node table.
    pub async fn run(
        self: Arc<Self>,
        iterators: Vec<Box<dyn NodeIterator>>,
        mut stop: watch::Receiver<bool>,
    ) -> NodeSet {
        let (halt_tx, halt_rx) = watch::channel(false);
        let (node_tx, node_rx) = mpsc::unbounded_channel::<NodeRecord>();
        let node_rx = Arc::new(Mutex::new(node_rx));

        for mut iterator in iterators {
            let node_tx = node_tx.clone();
            let mut halt = halt_rx.clone();
            tokio::spawn(async move {
                let name = iterator.name();
                let mut fed = 0u64;
                loop {
                    let next = tokio::select! {
                        _ = halt.changed() => break,
                        next = iterator.next_node() => next,
                    };
                    let Some(node) = next else { break };
                    if node_tx.send(node).is_err() {
                        break;
                    }
                    fed += 1;
                }
                debug!(source = name, fed, "node source finished");
            });
        }
        drop(node_tx);

        let mut workers = JoinSet::new();
        for _ in 0..self.config.parallel.max(1) {
            let driver = Arc::clone(&self);
            let node_rx = Arc::clone(&node_rx);
            let mut halt = halt_rx.clone();
            workers.spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = halt.changed() => None,
                        next = async { node_rx.lock().await.recv().await } => next,
                    };
                    let Some(node) = next else { break };
                    driver.update_node(node).await;
                }
            });
        }

        let progress = {
            let driver = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = interval(PROGRESS_INTERVAL);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    driver.log_progress();
                }
            })
        };

        let deadline = async {
            match self.config.timeout {
                Some(limit) => sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        let holds_sessions = matches!(self.mode, Mode::Sensor(_));
        tokio::select! {
            _ = async {
                while workers.join_next().await.is_some() {}
                if holds_sessions {
                    info!("node sources exhausted, holding peer sessions");
                    std::future::pending::<()>().await;
                }
            } => {
                info!("node sources exhausted");
            }
            _ = deadline => info!("discovery timeout reached"),
            _ = wait_stop(&mut stop) => info!("discovery stopped"),
        }

        let _ = halt_tx.send(true);
        let drained = timeout(DIAL_TIMEOUT + ENR_TIMEOUT, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            workers.abort_all();
        }
        progress.abort();
        self.log_progress();
        self.store.snapshot()
    }

    /// Classify one candidate and update the node table.
    pub async fn update_node(&self, node: NodeRecord) -> Outcome {
        let outcome = self.classify(node).await;
        self.stats.record(outcome);
        outcome
    }

    async fn classify(&self, node: NodeRecord) -> Outcome {
        let id = node_id_hex(&node.id);
        let now = Utc::now();
        let existing = self.store.get(&id);
        if let Some(checked) = existing.as_ref().and_then(|entry| entry.last_check) {
            let recent = (now - checked)
                .to_std()
                .map(|age| age < self.config.revalidation_interval)
                .unwrap_or(true);
            if recent {
                return Outcome::SkipRecent;
            }
        }

        if !self.contact(node).await {
            return Outcome::SkipIncompatible;
        }

        let known = existing.is_some();
        let mut entry = existing.unwrap_or_else(|| NodeEntry::new(&node));
        entry.url = node.to_string();
        entry.last_check = Some(now);
        let mut outcome = match timeout(ENR_TIMEOUT, self.resolver.resolve(&node)).await {
            Ok(Ok(record)) => {
                entry.record = Some(record);
                entry.score += 1;
                entry.last_response = Some(now);
                if entry.first_response.is_none() {
                    entry.first_response = Some(now);
                    Outcome::Added
                } else {
                    Outcome::Updated
                }
            }
            failure => {
                if let Ok(Err(err)) = failure {
                    debug!(node = %id, error = %err, "ENR request failed");
                }
                if entry.score == 0 {
                    return Outcome::SkipIncompatible;
                }
                entry.score /= 2;
                Outcome::Updated
            }
        };

        if entry.score <= 0 {
            if let Err(err) = self.store.remove(&id) {
                warn!(node = %id, error = %err, "failed to evict node");
            }
            if !known {
                return Outcome::SkipIncompatible;
            }
            outcome = Outcome::Removed;
        } else {
            entry.seq += 1;
            if let Err(err) = self.store.upsert(&id, entry) {
                warn!(node = %id, error = %err, "failed to store node");
            }
        }
        self.write_nodes_file().await;
        outcome
    }

    /// Returns true when the node spoke a compatible `eth` status.
    async fn contact(&self, node: NodeRecord) -> bool {
        match &self.mode {
            Mode::Crawl(config) => match Session::dial(node, config).await {
                Ok(session) => {
                    session.disconnect().await;
                    true
                }
                Err(err) => {
                    debug!(url = %node, error = %err, "crawl dial rejected");
                    false
                }
            },
            Mode::Sensor(manager) => match manager.try_admit(node).await {
                AdmitOutcome::Admitted(_) | AdmitOutcome::DuplicateUrl | AdmitOutcome::PoolFull => {
                    true
                }
                AdmitOutcome::NetworkIdMismatch | AdmitOutcome::Failed(_) => false,
            },
        }
    }

    /// Rewrite the nodes file off the async runtime. Writers queue on the
    /// lock so the file always ends with the latest snapshot.
    async fn write_nodes_file(&self) {
        let Some(path) = self.config.nodes_file.clone() else {
            return;
        };
        let guard = Arc::clone(&self.file_lock).lock_owned().await;
        let store = Arc::clone(&self.store);
        let written = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            store.snapshot().save(&path).map_err(|err| (path, err))
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err((path, err))) => {
                warn!(path = %path.display(), error = %err, "failed to write nodes file")
            }
            Err(err) => warn!(error = %err, "nodes file writer task failed"),
        }
    }

    fn log_progress(&self) {
        let peers = match &self.mode {
            Mode::Sensor(manager) => manager.peer_count(),
            Mode::Crawl(_) => 0,
        };
        info!(
            added = self.stats.added(),
            updated = self.stats.updated(),
            removed = self.stats.removed(),
            skipped_recent = self.stats.skipped_recent(),
            skipped_incompatible = self.stats.skipped_incompatible(),
            nodes = self.store.len(),
            peers,
            "discovery progress"
        );
    }
}

async fn wait_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::{HandlerOptions, LocalNode, SessionState};
    use crate::sink::Sink;
    use crate::test_utils::{temp_dir, test_status, test_status_config, MockPeer, MockScript};
    use async_trait::async_trait;
    use eyre::Result;

    struct FixedEnr;

    #[async_trait]
    impl EnrResolver for FixedEnr {
        async fn resolve(&self, _node: &NodeRecord) -> Result<String> {
            Ok("eth:0xdeadbeef/0".into())
        }
    }

    fn crawl_driver(network_id: u64, resolver: Arc<dyn EnrResolver>, nodes_file: Option<PathBuf>) -> Driver {
        let config = SessionConfig {
            local: Arc::new(LocalNode::random("crawler")),
            status: test_status_config(network_id),
            pooled_transactions_limit: 4096,
        };
        Driver::new(
            Mode::Crawl(config),
            DriverConfig {
                parallel: 2,
                nodes_file,
                ..DriverConfig::default()
            },
            Arc::new(NodeStore::in_memory(NodeSet::default())),
            resolver,
        )
    }

    #[tokio::test]
    async fn responsive_peer_is_added_then_skipped_as_recent() {
        let peer = MockPeer::spawn(test_status(1), MockScript::default()).await;
        let dir = temp_dir("driver-added");
        let path = dir.join("nodes.json");
        let driver = crawl_driver(1, Arc::new(FixedEnr), Some(path.clone()));

        assert_eq!(driver.update_node(peer.record()).await, Outcome::Added);
        assert_eq!(driver.update_node(peer.record()).await, Outcome::SkipRecent);

        let saved = NodeSet::load(&path).expect("load nodes file");
        let stored = driver.store().snapshot();
        assert_eq!(saved.0.keys().collect::<Vec<_>>(), stored.0.keys().collect::<Vec<_>>());
        let entry = saved.0.values().next().expect("entry");
        assert_eq!(entry.score, 1);
        assert_eq!(entry.seq, 1);
        assert_eq!(entry.record.as_deref(), Some("eth:0xdeadbeef/0"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_rewrites_leave_the_latest_snapshot() {
        let dir = temp_dir("driver-rewrites");
        let path = dir.join("nodes.json");
        let driver = crawl_driver(1, Arc::new(FixedEnr), Some(path.clone()));
        for port in 0..8u16 {
            let entry = NodeEntry::new(&LocalNode::random("t").record(([10, 0, 0, 2], 30303 + port).into()));
            driver.store().upsert(&entry.id(), entry).expect("upsert");
            driver.write_nodes_file().await;
        }
        futures::future::join_all((0..4).map(|_| driver.write_nodes_file())).await;

        let saved = NodeSet::load(&path).expect("load nodes file");
        assert_eq!(saved, driver.store().snapshot());
        assert_eq!(saved.len(), 8);
        assert!(!path.with_extension("tmp").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn mismatched_network_counts_one_incompatible() {
        let peer = MockPeer::spawn(test_status(5), MockScript::default()).await;
        let driver = crawl_driver(1, Arc::new(FixedEnr), None);

        assert_eq!(driver.update_node(peer.record()).await, Outcome::SkipIncompatible);
        assert_eq!(driver.stats().skipped_incompatible(), 1);
        assert_eq!(driver.stats().added(), 0);
        assert!(driver.store().is_empty());
    }

    #[tokio::test]
    async fn failed_enr_halves_score_until_eviction() {
        let peer = MockPeer::spawn(test_status(1), MockScript::default()).await;
        let dir = temp_dir("driver-evict");
        let path = dir.join("nodes.json");
        let driver = crawl_driver(1, Arc::new(NoEnr), Some(path.clone()));
        let node = peer.record();
        let id = node_id_hex(&node.id);
        let mut entry = NodeEntry::new(&node);
        entry.score = 2;
        entry.first_response = Some(Utc::now());
        driver.store().upsert(&id, entry).expect("seed");

        assert_eq!(driver.update_node(node).await, Outcome::Updated);
        let mut entry = driver.store().get(&id).expect("still stored");
        assert_eq!(entry.score, 1);
        entry.last_check = None;
        driver.store().upsert(&id, entry).expect("reset check");

        assert_eq!(driver.update_node(node).await, Outcome::Removed);
        assert!(driver.store().get(&id).is_none());
        assert!(NodeSet::load(&path).expect("load").is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unknown_node_without_enr_is_incompatible() {
        let peer = MockPeer::spawn(test_status(1), MockScript::default()).await;
        let driver = crawl_driver(1, Arc::new(NoEnr), None);
        assert_eq!(driver.update_node(peer.record()).await, Outcome::SkipIncompatible);
        assert!(driver.store().is_empty());
    }

    #[tokio::test]
    async fn crawl_ends_when_sources_are_exhausted() {
        let first = MockPeer::spawn(test_status(1), MockScript::default()).await;
        let second = MockPeer::spawn(test_status(1), MockScript::default()).await;
        let driver = Arc::new(crawl_driver(1, Arc::new(FixedEnr), None));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let sources: Vec<Box<dyn NodeIterator>> =
            vec![Box::new(StaticNodes::new([first.record(), second.record()]))];

        let nodes = timeout(Duration::from_secs(30), Arc::clone(&driver).run(sources, stop_rx))
            .await
            .expect("driver finished");
        assert_eq!(nodes.len(), 2);
        assert_eq!(driver.stats().added(), 2);
    }

    fn sensor_manager(max_peers: usize) -> Arc<PeerManager> {
        let config = SessionConfig {
            local: Arc::new(LocalNode::random("sensor")),
            status: test_status_config(1),
            pooled_transactions_limit: 4096,
        };
        Arc::new(PeerManager::new(config, max_peers, Sink::noop(), HandlerOptions::default()))
    }

    fn sensor_driver(manager: &Arc<PeerManager>) -> Driver {
        Driver::new(
            Mode::Sensor(Arc::clone(manager)),
            DriverConfig::default(),
            Arc::new(NodeStore::in_memory(NodeSet::default())),
            Arc::new(FixedEnr),
        )
    }

    #[tokio::test]
    async fn sensor_mode_with_zero_peers_still_revalidates() {
        let peer = MockPeer::spawn(test_status(1), MockScript::default()).await;
        let manager = sensor_manager(0);
        let driver = sensor_driver(&manager);
        assert_eq!(driver.update_node(peer.record()).await, Outcome::Added);
        assert_eq!(manager.pool_full_count(), 1);
        assert_eq!(manager.peer_count(), 0);
    }

    #[tokio::test]
    async fn sensor_holds_sessions_after_sources_run_dry() {
        let peer = MockPeer::spawn(test_status(1), MockScript::default()).await;
        let manager = sensor_manager(4);
        let driver = Arc::new(sensor_driver(&manager));
        let (stop_tx, stop_rx) = watch::channel(false);
        let sources: Vec<Box<dyn NodeIterator>> = vec![Box::new(StaticNodes::new([peer.record()]))];
        let run = tokio::spawn(Arc::clone(&driver).run(sources, stop_rx));

        timeout(Duration::from_secs(30), async {
            while driver.stats().added() == 0 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("peer added");
        sleep(Duration::from_millis(300)).await;

        assert!(!run.is_finished(), "sensor stopped once its sources ran out");
        let (_, handle) = manager.registry().active().into_iter().next().expect("session");
        assert_eq!(handle.state(), SessionState::Active);

        stop_tx.send(true).expect("stop");
        let nodes = timeout(Duration::from_secs(30), run)
            .await
            .expect("driver stopped")
            .expect("driver task");
        assert_eq!(nodes.len(), 1);
        manager.close_all().await;
    }
}
