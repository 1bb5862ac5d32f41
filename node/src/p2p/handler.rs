//! `eth` message handling for one session.

use super::codec::{EthMessage, OpaqueList};
use super::manager::{Registry, SharedState};
use super::session::{PendingKind, SessionHandle};
use crate::sink::Sink;
use alloy_eips::BlockHashOrNumber;
use alloy_primitives::{B256, U256};
use lru::LruCache;
use reth_eth_wire_types::{
    BlockBodies, BlockHeaders, GetBlockBodies, GetBlockHeaders, GetPooledTransactions,
    HeadersDirection, NewBlock, PooledTransactions, RequestPair,
};
use reth_ethereum_primitives::{Block, BlockBody};
use reth_primitives_traits::{Header, SignedTransaction};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace};

/// Most hashes asked for in one `GetPooledTransactions`.
pub const MAX_POOLED_REQUEST: usize = 256;
/// Per-session window of block hashes already announced by this peer.
const SEEN_BLOCKS_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Relay full blocks to ⌈√N⌉ other peers.
    pub rebroadcast_blocks: bool,
    /// Relay first-seen transactions to every other peer.
    pub broadcast_txs: bool,
}

/// What every session's handler shares.
#[derive(Debug)]
pub struct HandlerContext {
    pub sink: Sink,
    pub shared: Arc<SharedState>,
    pub registry: Arc<Registry>,
    pub options: HandlerOptions,
}

pub struct Handler {
    ctx: Arc<HandlerContext>,
    session: SessionHandle,
    seen_blocks: LruCache<B256, ()>,
}

impl Handler {
    pub fn new(ctx: Arc<HandlerContext>, session: SessionHandle) -> Self {
        Self {
            ctx,
            session,
            seen_blocks: LruCache::new(
                NonZeroUsize::new(SEEN_BLOCKS_WINDOW).unwrap_or(NonZeroUsize::MIN),
            ),
        }
    }

    fn peer(&self) -> &str {
        self.session.node_id()
    }

    pub async fn handle(&mut self, message: EthMessage) {
        let at = SystemTime::now();
        trace!(peer = %self.peer(), kind = message.kind().name(), "handling message");
        match message {
            EthMessage::Status(_) => {
                self.session.report_invalid("status after handshake");
            }
            EthMessage::NewBlockHashes(msg) => {
                let hashes = msg.0.into_iter().map(|announced| announced.hash).collect();
                self.on_block_hashes(hashes, at).await;
            }
            EthMessage::NewBlock(msg) => self.on_new_block(*msg, at).await,
            EthMessage::Transactions(msg) => {
                let fresh = self.record_transactions(msg.0, at).await;
                if self.ctx.options.broadcast_txs && !fresh.is_empty() {
                    let relayed = self.ctx.registry.broadcast_tx(&fresh, Some(self.peer()));
                    trace!(txs = fresh.len(), peers = relayed, "relayed transactions");
                }
            }
            EthMessage::PooledTransactions(pair) => {
                self.session.take_pending(pair.request_id);
                self.record_transactions(pair.message.0, at).await;
            }
            EthMessage::NewPooledTransactionHashes66(msg) => self.on_tx_hashes(msg.0),
            EthMessage::NewPooledTransactionHashes68(msg) => self.on_tx_hashes(msg.hashes),
            EthMessage::GetBlockHeaders(request) => {
                self.reply(EthMessage::BlockHeaders(RequestPair {
                    request_id: request.request_id,
                    message: BlockHeaders(Vec::new()),
                }));
            }
            EthMessage::GetBlockBodies(request) => {
                self.reply(EthMessage::BlockBodies(RequestPair {
                    request_id: request.request_id,
                    message: BlockBodies(Vec::new()),
                }));
            }
            EthMessage::GetPooledTransactions(request) => {
                self.reply(EthMessage::PooledTransactions(RequestPair {
                    request_id: request.request_id,
                    message: PooledTransactions(Vec::new()),
                }));
            }
            EthMessage::GetReceipts(request) => {
                self.reply(EthMessage::Receipts(RequestPair {
                    request_id: request.request_id,
                    message: OpaqueList::empty(),
                }));
            }
            EthMessage::GetNodeData(request) => {
                self.reply(EthMessage::NodeData(RequestPair {
                    request_id: request.request_id,
                    message: OpaqueList::empty(),
                }));
            }
            EthMessage::BlockHeaders(pair) => self.on_headers(pair, at).await,
            EthMessage::BlockBodies(pair) => self.on_bodies(pair, at).await,
            EthMessage::NodeData(pair) | EthMessage::Receipts(pair) => {
                self.session.take_pending(pair.request_id);
            }
        }
    }

    fn reply(&self, message: EthMessage) {
        let kind = message.kind();
        if !self.session.send(message) {
            debug!(peer = %self.peer(), kind = kind.name(), "reply dropped");
        }
    }

    async fn on_block_hashes(&mut self, hashes: Vec<B256>, at: SystemTime) {
        let fresh: Vec<B256> = hashes
            .into_iter()
            .filter(|hash| self.seen_blocks.put(*hash, ()).is_none())
            .collect();
        if fresh.is_empty() {
            return;
        }
        let sink = &self.ctx.sink;
        sink.write_block_hashes(self.peer(), &fresh, at).await;

        let first_seen: Vec<B256> = fresh
            .into_iter()
            .filter(|hash| self.ctx.shared.mark_block(*hash))
            .collect();
        if first_seen.is_empty() {
            return;
        }
        sink.write_block_hash_first_seen(self.peer(), &first_seen, at)
            .await;
        for hash in first_seen {
            if !sink.has_block(&hash) {
                self.fetch_block(hash, false);
            }
        }
    }

    async fn on_new_block(&mut self, new_block: NewBlock<Block>, at: SystemTime) {
        let header = &new_block.block.header;
        let hash = header.hash_slow();
        self.seen_blocks.put(hash, ());
        let first_seen = self.ctx.shared.mark_block(hash);

        self.ctx
            .sink
            .write_block(self.peer(), &new_block.block, Some(U256::from(new_block.td)), at)
            .await;
        self.ctx.shared.observe_block(hash, header.number);
        self.backfill_parent(header);

        if self.ctx.options.rebroadcast_blocks && first_seen {
            let relayed = self.ctx.registry.broadcast_block(&new_block, self.peer());
            trace!(number = header.number, peers = relayed, "relayed block");
        }
    }

    /// Persist transactions and return those not seen before by any session.
    async fn record_transactions<T: SignedTransaction>(&self, txs: Vec<T>, at: SystemTime) -> Vec<T> {
        if txs.is_empty() {
            return txs;
        }
        let (fresh, known): (Vec<T>, Vec<T>) = txs
            .into_iter()
            .partition(|tx| self.ctx.shared.mark_tx(*tx.tx_hash()));
        let sink = &self.ctx.sink;
        if !fresh.is_empty() {
            sink.write_transactions(self.peer(), &fresh, at).await;
        }
        if !known.is_empty() {
            let hashes: Vec<B256> = known.iter().map(|tx| *tx.tx_hash()).collect();
            sink.write_transaction_events(self.peer(), &hashes, at).await;
        }
        fresh
    }

    fn on_tx_hashes(&self, hashes: Vec<B256>) {
        let wanted: Vec<B256> = hashes
            .into_iter()
            .filter(|hash| !self.ctx.shared.knows_tx(hash))
            .take(MAX_POOLED_REQUEST)
            .collect();
        if wanted.is_empty() {
            return;
        }
        let requested = self
            .session
            .request(PendingKind::PooledTransactions, |request_id| {
                EthMessage::GetPooledTransactions(RequestPair {
                    request_id,
                    message: GetPooledTransactions(wanted),
                })
            });
        if requested.is_none() {
            debug!(peer = %self.peer(), "pooled transaction request dropped");
        }
    }

    async fn on_headers(&mut self, pair: RequestPair<BlockHeaders<Header>>, at: SystemTime) {
        let headers = pair.message.0;
        let is_parent = match self.session.take_pending(pair.request_id) {
            Some(PendingKind::Headers(waiter)) => {
                let _ = waiter.send(headers);
                return;
            }
            Some(PendingKind::HeaderFetch { is_parent }) => is_parent,
            Some(other) => {
                debug!(peer = %self.peer(), id = pair.request_id, ?other, "headers answer a different request");
                false
            }
            None => false,
        };
        if headers.is_empty() {
            return;
        }
        self.ctx
            .sink
            .write_block_headers(&headers, at, is_parent)
            .await;
        for header in &headers {
            let hash = header.hash_slow();
            self.ctx.shared.mark_block(hash);
            self.ctx.shared.observe_block(hash, header.number);
            self.backfill_parent(header);
        }
    }

    async fn on_bodies(&mut self, pair: RequestPair<BlockBodies<BlockBody>>, at: SystemTime) {
        let bodies = pair.message.0;
        match self.session.take_pending(pair.request_id) {
            Some(PendingKind::BodyFetch { hashes }) => {
                for (hash, body) in hashes.into_iter().zip(bodies.iter()) {
                    self.ctx.sink.write_block_body(body, hash, at).await;
                }
            }
            _ => {
                debug!(peer = %self.peer(), id = pair.request_id, bodies = bodies.len(), "unmatched block bodies dropped");
            }
        }
    }

    /// Fetch the parent when it is unknown and newer than the oldest block seen.
    fn backfill_parent(&self, header: &Header) {
        let Some(oldest) = self.ctx.shared.oldest() else {
            return;
        };
        if header.number == 0 || header.number - 1 <= oldest.number {
            return;
        }
        let parent = header.parent_hash;
        if self.ctx.shared.knows_block(&parent) || self.ctx.sink.has_block(&parent) {
            return;
        }
        self.ctx.shared.mark_block(parent);
        self.fetch_block(parent, true);
    }

    fn fetch_block(&self, hash: B256, is_parent: bool) {
        let headers = self
            .session
            .request(PendingKind::HeaderFetch { is_parent }, |request_id| {
                EthMessage::GetBlockHeaders(RequestPair {
                    request_id,
                    message: GetBlockHeaders {
                        start_block: BlockHashOrNumber::Hash(hash),
                        limit: 1,
                        skip: 0,
                        direction: HeadersDirection::Rising,
                    },
                })
            });
        let bodies = self.session.request(
            PendingKind::BodyFetch { hashes: vec![hash] },
            |request_id| {
                EthMessage::GetBlockBodies(RequestPair {
                    request_id,
                    message: GetBlockBodies(vec![hash]),
                })
            },
        );
        if headers.is_none() || bodies.is_none() {
            debug!(peer = %self.peer(), hash = %hash, "block fetch dropped");
        }
    }
}
