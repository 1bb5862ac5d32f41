//! Peer session manager: admission ceiling, slot table and fan-out.

use super::handler::{HandlerContext, HandlerOptions};
use super::session::{PeerSnapshot, Session, SessionConfig, SessionError, SessionHandle, SessionState, CLOSE_GRACE};
use crate::sink::Sink;
use alloy_primitives::B256;
use eyre::{eyre, Result};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use reth_eth_wire_types::NewBlock;
use reth_ethereum_primitives::{Block, TransactionSigned};
use reth_network_peers::NodeRecord;
use reth_primitives_traits::Header;
use serde::Serialize;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};

pub const DEFAULT_MAX_PEERS: usize = 200;
/// Size of the process-wide known transaction and block windows.
const KNOWN_WINDOW: usize = 4096;

/// A block identified by hash and height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockRef {
    pub hash: B256,
    pub number: u64,
}

/// State shared by every session's handler.
#[derive(Debug)]
pub struct SharedState {
    known_txs: Mutex<LruCache<B256, ()>>,
    known_blocks: Mutex<LruCache<B256, ()>>,
    head: RwLock<Option<BlockRef>>,
    oldest: RwLock<Option<BlockRef>>,
}

impl Default for SharedState {
    fn default() -> Self {
        let window = NonZeroUsize::new(KNOWN_WINDOW).unwrap_or(NonZeroUsize::MIN);
        Self {
            known_txs: Mutex::new(LruCache::new(window)),
            known_blocks: Mutex::new(LruCache::new(window)),
            head: RwLock::new(None),
            oldest: RwLock::new(None),
        }
    }
}

impl SharedState {
    /// Remember a transaction hash; true when it was not in the window.
    pub fn mark_tx(&self, hash: B256) -> bool {
        self.known_txs.lock().put(hash, ()).is_none()
    }

    pub fn knows_tx(&self, hash: &B256) -> bool {
        self.known_txs.lock().contains(hash)
    }

    /// Remember a block hash; true when it was not in the window.
    pub fn mark_block(&self, hash: B256) -> bool {
        self.known_blocks.lock().put(hash, ()).is_none()
    }

    pub fn knows_block(&self, hash: &B256) -> bool {
        self.known_blocks.lock().contains(hash)
    }

    /// Track the highest block seen and pin the first one as the oldest.
    pub fn observe_block(&self, hash: B256, number: u64) {
        let block = BlockRef { hash, number };
        {
            let mut head = self.head.write();
            if head.is_none_or(|head| number > head.number) {
                *head = Some(block);
            }
        }
        let mut oldest = self.oldest.write();
        if oldest.is_none() {
            *oldest = Some(block);
        }
    }

    pub fn head(&self) -> Option<BlockRef> {
        *self.head.read()
    }

    pub fn oldest(&self) -> Option<BlockRef> {
        *self.oldest.read()
    }
}

/// Index of an occupied slot in the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerSlot(usize);

impl PeerSlot {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
enum SlotEntry {
    /// Reserved while dialing so the ceiling holds during handshakes.
    Pending { url: String },
    Active(SessionHandle),
}

impl SlotEntry {
    fn url(&self) -> &str {
        match self {
            Self::Pending { url } => url,
            Self::Active(handle) => handle.url(),
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<Option<SlotEntry>>,
    by_url: HashMap<String, usize>,
}

#[derive(Debug, PartialEq, Eq)]
enum Reservation {
    Slot(usize),
    Duplicate,
    Full,
}

/// The slot table, shared with handlers for fan-out.
#[derive(Debug)]
pub struct Registry {
    max_peers: usize,
    slots: RwLock<Slots>,
}

impl Registry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers,
            slots: RwLock::new(Slots::default()),
        }
    }

    fn reserve(&self, url: &str) -> Reservation {
        let mut slots = self.slots.write();
        if slots.by_url.contains_key(url) {
            return Reservation::Duplicate;
        }
        if slots.by_url.len() >= self.max_peers {
            return Reservation::Full;
        }
        let index = match slots.entries.iter().position(Option::is_none) {
            Some(index) => index,
            None => {
                slots.entries.push(None);
                slots.entries.len() - 1
            }
        };
        slots.entries[index] = Some(SlotEntry::Pending {
            url: url.to_string(),
        });
        slots.by_url.insert(url.to_string(), index);
        Reservation::Slot(index)
    }

    fn activate(&self, slot: usize, handle: SessionHandle) {
        if let Some(entry) = self.slots.write().entries.get_mut(slot) {
            *entry = Some(SlotEntry::Active(handle));
        }
    }

    fn release(&self, slot: usize) {
        let mut slots = self.slots.write();
        if let Some(entry) = slots.entries.get_mut(slot).and_then(Option::take) {
            slots.by_url.remove(entry.url());
        }
    }

    /// Occupied slots, pending ones included.
    pub fn len(&self) -> usize {
        self.slots.read().by_url.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, slot: PeerSlot) -> Option<SessionHandle> {
        match self.slots.read().entries.get(slot.0) {
            Some(Some(SlotEntry::Active(handle))) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Slots holding a session, closing ones included.
    fn serving(&self) -> usize {
        self.slots
            .read()
            .entries
            .iter()
            .filter(|entry| matches!(entry, Some(SlotEntry::Active(_))))
            .count()
    }

    /// Live sessions with their slot index.
    pub fn active(&self) -> Vec<(usize, SessionHandle)> {
        self.slots
            .read()
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Some(SlotEntry::Active(handle)) if handle.state() != SessionState::Closed => {
                    Some((index, handle.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Queue transactions on every active session except `origin`.
    pub fn broadcast_tx(&self, txs: &[TransactionSigned], origin: Option<&str>) -> usize {
        if txs.is_empty() {
            return 0;
        }
        self.active()
            .into_iter()
            .filter(|(_, handle)| origin != Some(handle.node_id()))
            .filter(|(_, handle)| handle.broadcast_tx(txs.to_vec()))
            .count()
    }

    /// Send a block to ⌈√N⌉ random active sessions other than `origin`.
    pub fn broadcast_block(&self, block: &NewBlock<Block>, origin: &str) -> usize {
        let mut peers: Vec<SessionHandle> = self
            .active()
            .into_iter()
            .map(|(_, handle)| handle)
            .filter(|handle| handle.node_id() != origin)
            .collect();
        if peers.is_empty() {
            return 0;
        }
        let fanout = (peers.len() as f64).sqrt().ceil() as usize;
        peers.shuffle(&mut rand::thread_rng());
        peers
            .into_iter()
            .take(fanout)
            .filter(|peer| {
                peer.send(super::codec::EthMessage::NewBlock(Box::new(block.clone())))
            })
            .count()
    }
}

/// Result of [`PeerManager::try_admit`].
#[derive(Debug)]
pub enum AdmitOutcome {
    Admitted(PeerSlot),
    DuplicateUrl,
    PoolFull,
    NetworkIdMismatch,
    Failed(SessionError),
}

/// Bounds concurrent sessions and supervises their lifetime.
#[derive(Debug)]
pub struct PeerManager {
    config: SessionConfig,
    registry: Arc<Registry>,
    ctx: Arc<HandlerContext>,
    pool_full: AtomicU64,
    closing: AtomicBool,
}

impl PeerManager {
    pub fn new(config: SessionConfig, max_peers: usize, sink: Sink, options: HandlerOptions) -> Self {
        let registry = Arc::new(Registry::new(max_peers));
        let ctx = Arc::new(HandlerContext {
            sink,
            shared: Arc::new(SharedState::default()),
            registry: Arc::clone(&registry),
            options,
        });
        Self {
            config,
            registry,
            ctx,
            pool_full: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn shared(&self) -> &SharedState {
        &self.ctx.shared
    }

    pub fn sink(&self) -> &Sink {
        &self.ctx.sink
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool_full_count(&self) -> u64 {
        self.pool_full.load(Ordering::Relaxed)
    }

    pub fn peer_count(&self) -> usize {
        self.registry.active().len()
    }

    /// Reserve a slot, dial, exchange status and start serving.
    pub async fn try_admit(&self, node: NodeRecord) -> AdmitOutcome {
        if self.closing.load(Ordering::Acquire) {
            return AdmitOutcome::Failed(shutting_down());
        }
        let url = super::rlpx::enode_url(&node);
        let slot = match self.registry.reserve(&url) {
            Reservation::Slot(slot) => slot,
            Reservation::Duplicate => return AdmitOutcome::DuplicateUrl,
            Reservation::Full => {
                self.pool_full.fetch_add(1, Ordering::Relaxed);
                return AdmitOutcome::PoolFull;
            }
        };

        let session = match Session::dial(node, &self.config).await {
            Ok(session) => session,
            Err(err) => {
                self.registry.release(slot);
                return match err {
                    SessionError::Mismatch { .. } => {
                        debug!(url = %url, error = %err, "peer on another network");
                        AdmitOutcome::NetworkIdMismatch
                    }
                    err => {
                        debug!(url = %url, error = %err, "peer dial failed");
                        AdmitOutcome::Failed(err)
                    }
                };
            }
        };
        if self.closing.load(Ordering::Acquire) {
            session.disconnect().await;
            self.registry.release(slot);
            return AdmitOutcome::Failed(shutting_down());
        }

        let handle = session.handle();
        self.registry.activate(slot, handle.clone());
        let registry = Arc::clone(&self.registry);
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            let reason = session.read_and_serve(ctx).await;
            registry.release(slot);
            debug!(slot, ?reason, "peer slot released");
        });
        info!(
            slot,
            peer = %handle.node_id(),
            client = %handle.hello().client_version,
            peers = self.registry.len(),
            "peer admitted"
        );
        AdmitOutcome::Admitted(PeerSlot(slot))
    }

    /// Fan transactions out to every active session; returns how many queued them.
    pub fn broadcast_tx(&self, txs: &[TransactionSigned]) -> usize {
        self.registry.broadcast_tx(txs, None)
    }

    pub fn active_peers(&self) -> Vec<PeerSnapshot> {
        self.registry
            .active()
            .into_iter()
            .map(|(slot, handle)| handle.snapshot(slot))
            .collect()
    }

    pub async fn query_headers(&self, slot: PeerSlot, start: u64, amount: u64) -> Result<Vec<Header>> {
        let handle = self
            .registry
            .get(slot)
            .ok_or_else(|| eyre!("no active session in slot {}", slot.0))?;
        handle.query_headers(start, amount).await
    }

    /// Close every session and wait briefly for their slots to clear.
    pub async fn close_all(&self) {
        self.closing.store(true, Ordering::Release);
        let handles = self.registry.active();
        for (_, handle) in &handles {
            handle.close();
        }
        let deadline = Instant::now() + CLOSE_GRACE + Duration::from_millis(500);
        while self.registry.serving() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(20)).await;
        }
        info!(closed = handles.len(), "peer sessions closed");
    }
}

fn shutting_down() -> SessionError {
    SessionError::HandshakeFailed("session manager is shutting down".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::rlpx::LocalNode;
    use crate::test_utils::{test_status, test_status_config, MockPeer, MockScript};

    fn manager(max_peers: usize) -> PeerManager {
        let config = SessionConfig {
            local: Arc::new(LocalNode::random("sensor-test/v1")),
            status: test_status_config(1),
            pooled_transactions_limit: crate::p2p::codec::DEFAULT_POOLED_TRANSACTIONS_LIMIT,
        };
        PeerManager::new(config, max_peers, Sink::noop(), HandlerOptions::default())
    }

    #[test]
    fn registry_reuses_released_slots_and_dedupes_urls() {
        let registry = Registry::new(2);
        assert_eq!(registry.reserve("enode://a"), Reservation::Slot(0));
        assert_eq!(registry.reserve("enode://a"), Reservation::Duplicate);
        assert_eq!(registry.reserve("enode://b"), Reservation::Slot(1));
        assert_eq!(registry.reserve("enode://c"), Reservation::Full);
        registry.release(0);
        assert_eq!(registry.reserve("enode://c"), Reservation::Slot(0));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn shared_state_tracks_head_and_first_block() {
        let shared = SharedState::default();
        assert!(shared.mark_tx(B256::repeat_byte(1)));
        assert!(!shared.mark_tx(B256::repeat_byte(1)));
        assert!(shared.knows_tx(&B256::repeat_byte(1)));

        shared.observe_block(B256::repeat_byte(10), 10);
        shared.observe_block(B256::repeat_byte(12), 12);
        shared.observe_block(B256::repeat_byte(11), 11);
        assert_eq!(shared.head().map(|b| b.number), Some(12));
        assert_eq!(shared.oldest().map(|b| b.number), Some(10));
    }

    #[tokio::test]
    async fn zero_max_peers_refuses_everything() {
        let manager = manager(0);
        let peer = MockPeer::spawn(test_status(1), MockScript::default()).await;
        assert!(matches!(
            manager.try_admit(peer.record()).await,
            AdmitOutcome::PoolFull
        ));
        assert_eq!(manager.pool_full_count(), 1);
        assert!(manager.active_peers().is_empty());
    }

    #[tokio::test]
    async fn ceiling_and_url_dedupe_hold() {
        let manager = manager(1);
        let first = MockPeer::spawn(test_status(1), MockScript::default()).await;
        let second = MockPeer::spawn(test_status(1), MockScript::default()).await;

        let slot = match manager.try_admit(first.record()).await {
            AdmitOutcome::Admitted(slot) => slot,
            other => panic!("expected admission, got {other:?}"),
        };
        assert!(matches!(
            manager.try_admit(first.record()).await,
            AdmitOutcome::DuplicateUrl
        ));
        assert!(matches!(
            manager.try_admit(second.record()).await,
            AdmitOutcome::PoolFull
        ));
        let peers = manager.active_peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].slot, slot.index());
        assert_eq!(peers[0].status.network_id, 1);

        manager.close_all().await;
        assert!(manager.registry().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_respect_the_ceiling() {
        let manager = Arc::new(manager(2));
        let mut peers = Vec::new();
        for _ in 0..3 {
            peers.push(MockPeer::spawn(test_status(1), MockScript::default()).await);
        }
        let attempts = peers.iter().map(|peer| {
            let manager = Arc::clone(&manager);
            let record = peer.record();
            tokio::spawn(async move { manager.try_admit(record).await })
        });
        let outcomes: Vec<AdmitOutcome> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.expect("admission task"))
            .collect();

        let admitted = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, AdmitOutcome::Admitted(_)))
            .count();
        let refused = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, AdmitOutcome::PoolFull))
            .count();
        assert_eq!((admitted, refused), (2, 1), "{outcomes:?}");
        assert_eq!(manager.pool_full_count(), 1);
        assert_eq!(manager.peer_count(), 2);

        manager.close_all().await;
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn other_network_is_not_admitted() {
        let manager = manager(4);
        let peer = MockPeer::spawn(test_status(5), MockScript::default()).await;
        assert!(matches!(
            manager.try_admit(peer.record()).await,
            AdmitOutcome::NetworkIdMismatch
        ));
        assert!(manager.registry().is_empty());
    }

    #[tokio::test]
    async fn query_headers_returns_requested_range() {
        let manager = manager(4);
        let peer = MockPeer::spawn(test_status(1), MockScript::serving_headers()).await;
        let AdmitOutcome::Admitted(slot) = manager.try_admit(peer.record()).await else {
            panic!("peer should be admitted");
        };
        let headers = manager
            .query_headers(slot, 100, 5)
            .await
            .expect("headers returned");
        let numbers: Vec<u64> = headers.iter().map(|header| header.number).collect();
        assert_eq!(numbers, vec![100, 101, 102, 103, 104]);

        assert!(manager.query_headers(slot, 100, 0).await.is_err());
        manager.close_all().await;
    }

    #[tokio::test]
    async fn closing_the_manager_ends_sessions_promptly() {
        let manager = manager(4);
        let peer = MockPeer::spawn(test_status(1), MockScript::default()).await;
        assert!(matches!(
            manager.try_admit(peer.record()).await,
            AdmitOutcome::Admitted(_)
        ));
        let started = Instant::now();
        manager.close_all().await;
        assert!(started.elapsed() < CLOSE_GRACE + Duration::from_secs(1));
        assert!(manager.active_peers().is_empty());
        assert!(matches!(
            manager.try_admit(peer.record()).await,
            AdmitOutcome::Failed(_)
        ));
    }
}
