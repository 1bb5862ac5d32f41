//! Candidate sources and ENR lookups.

use alloy_primitives::hex;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use futures::stream::BoxStream;
use futures::StreamExt;
use lru::LruCache;
use parking_lot::Mutex;
use reth_discv4::{DiscoveryUpdate, Discv4, Discv4Config};
use reth_ethereum_forks::ForkId;
use reth_network_peers::{AnyNode, NodeRecord, PeerId};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::p2p::LocalNode;

/// How long an ENR lookup may take.
pub const ENR_TIMEOUT: Duration = Duration::from_secs(5);
const FORK_ID_CACHE: usize = 4096;
pub const DEFAULT_DISCOVERY_PORT: u16 = 30303;
const LOOKUP_INTERVAL: Duration = Duration::from_secs(10);

/// A lazy sequence of node records.
#[async_trait]
pub trait NodeIterator: Send {
    /// Next candidate, or `None` once the source is exhausted.
    async fn next_node(&mut self) -> Option<NodeRecord>;

    fn name(&self) -> &'static str;
}

/// Fixed list of nodes: bootnodes plus whatever the nodes file held.
#[derive(Debug, Default)]
pub struct StaticNodes {
    nodes: VecDeque<NodeRecord>,
}

impl StaticNodes {
    pub fn new(nodes: impl IntoIterator<Item = NodeRecord>) -> Self {
        let mut seen = std::collections::HashSet::new();
        Self {
            nodes: nodes.into_iter().filter(|node| seen.insert(node.id)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[async_trait]
impl NodeIterator for StaticNodes {
    async fn next_node(&mut self) -> Option<NodeRecord> {
        self.nodes.pop_front()
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Fork ids seen in ENR responses, keyed by peer. Least recently seen peers
/// fall out once the cache is full.
#[derive(Debug)]
struct ForkIdObservations {
    seen: Mutex<LruCache<PeerId, ForkId>>,
    notify: Notify,
}

impl Default for ForkIdObservations {
    fn default() -> Self {
        Self::with_capacity(FORK_ID_CACHE)
    }
}

impl ForkIdObservations {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            notify: Notify::new(),
        }
    }

    fn record(&self, peer: PeerId, fork_id: ForkId) {
        self.seen.lock().put(peer, fork_id);
        self.notify.notify_waiters();
    }

    fn get(&self, peer: &PeerId) -> Option<ForkId> {
        self.seen.lock().get(peer).copied()
    }

    /// Drop what we know about `peer` so only a newer response satisfies
    /// [`Self::wait_for`].
    fn forget(&self, peer: &PeerId) {
        self.seen.lock().pop(peer);
    }

    async fn wait_for(&self, peer: &PeerId, within: Duration) -> Option<ForkId> {
        timeout(within, async {
            loop {
                let notified = self.notify.notified();
                if let Some(fork_id) = self.get(peer) {
                    return fork_id;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    fn len(&self) -> usize {
        self.seen.lock().len()
    }
}

/// Nodes surfaced by the discv4 table, never exhausted while the service runs.
pub struct Discv4Nodes {
    updates: BoxStream<'static, DiscoveryUpdate>,
    pending: VecDeque<DiscoveryUpdate>,
    observations: Arc<ForkIdObservations>,
}

impl std::fmt::Debug for Discv4Nodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discv4Nodes")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl NodeIterator for Discv4Nodes {
    async fn next_node(&mut self) -> Option<NodeRecord> {
        loop {
            let update = match self.pending.pop_front() {
                Some(update) => update,
                None => self.updates.next().await?,
            };
            match update {
                DiscoveryUpdate::Added(node) | DiscoveryUpdate::DiscoveredAtCapacity(node) => {
                    return Some(node)
                }
                DiscoveryUpdate::EnrForkId(node, fork_id) => {
                    self.observations.record(node.id, fork_id);
                }
                DiscoveryUpdate::Batch(updates) => self.pending.extend(updates),
                DiscoveryUpdate::Removed(_) => {}
            }
        }
    }

    fn name(&self) -> &'static str {
        "discv4"
    }
}

/// Fetches a node's signed record.
#[async_trait]
pub trait EnrResolver: Send + Sync {
    /// Textual form of what the node's record advertises.
    async fn resolve(&self, node: &NodeRecord) -> Result<String>;
}

/// Resolves through the discv4 service: ping the node and wait for its
/// EIP-868 fork id to come back.
#[derive(Clone)]
pub struct Discv4Enr {
    discv4: Discv4,
    observations: Arc<ForkIdObservations>,
}

impl std::fmt::Debug for Discv4Enr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Discv4Enr").finish_non_exhaustive()
    }
}

#[async_trait]
impl EnrResolver for Discv4Enr {
    async fn resolve(&self, node: &NodeRecord) -> Result<String> {
        // Every lookup asks the node again; re-adding it makes discv4 ping it
        // and request the record after the pong.
        self.observations.forget(&node.id);
        self.discv4.remove_peer(node.id);
        self.discv4.add_node(*node);
        self.observations
            .wait_for(&node.id, ENR_TIMEOUT)
            .await
            .map(|fork_id| fork_id_text(&fork_id))
            .ok_or_else(|| eyre!("no ENR from {} within {:?}", node.address, ENR_TIMEOUT))
    }
}

/// Offline resolver: every lookup fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnr;

#[async_trait]
impl EnrResolver for NoEnr {
    async fn resolve(&self, _node: &NodeRecord) -> Result<String> {
        Err(eyre!("ENR lookups are disabled"))
    }
}

fn fork_id_text(fork_id: &ForkId) -> String {
    format!("eth:0x{}/{}", hex::encode(fork_id.hash.0), fork_id.next)
}

/// Bind discv4 on `port` and start its service.
pub async fn start_discv4(
    local: &LocalNode,
    port: u16,
    bootnodes: &[NodeRecord],
) -> Result<(Discv4Nodes, Discv4Enr)> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let config: Discv4Config = Discv4Config::builder()
        .add_boot_nodes(bootnodes.iter().copied())
        .lookup_interval(LOOKUP_INTERVAL)
        .build();
    let (discv4, service) = Discv4::bind(addr, local.record(addr), local.secret_key(), config)
        .await
        .wrap_err_with(|| format!("failed to bind discv4 on {addr}"))?;
    let updates = discv4
        .update_stream()
        .await
        .map_err(|err| eyre!("discv4 update stream unavailable: {err}"))?;
    service.spawn();
    info!(port, bootnodes = bootnodes.len(), "discv4 started");

    let observations = Arc::new(ForkIdObservations::default());
    Ok((
        Discv4Nodes {
            updates: updates.boxed(),
            pending: VecDeque::new(),
            observations: Arc::clone(&observations),
        },
        Discv4Enr {
            discv4,
            observations,
        },
    ))
}

/// Parse a comma separated list of enode or ENR strings.
pub fn parse_bootnodes(list: &str) -> Result<Vec<NodeRecord>> {
    let mut nodes = Vec::new();
    for raw in list.split(',').map(str::trim).filter(|raw| !raw.is_empty()) {
        let any = AnyNode::from_str(raw).map_err(|err| eyre!("invalid bootnode {raw}: {err}"))?;
        match any.node_record() {
            Some(node) => nodes.push(node),
            None => warn!(bootnode = raw, "bootnode has no usable endpoint"),
        }
    }
    if nodes.is_empty() {
        return Err(eyre!("no usable bootnodes in {list:?}"));
    }
    debug!(count = nodes.len(), "parsed bootnodes");
    Ok(nodes)
}
