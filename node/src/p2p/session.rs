//! One RLPx + `eth` connection: dial, status exchange, read/write loops.

use super::codec::{Codec, CodecError, EthMessage, MessageKind, Status};
use super::counters::{CounterSnapshot, PeerCounters};
use super::handler::{Handler, HandlerContext};
use super::rlpx::{self, Connection, Hello, LocalNode, Transport, TransportError};
use alloy_eips::BlockHashOrNumber;
use alloy_primitives::{B256, U256};
use bytes::Bytes;
use eyre::{eyre, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reth_chainspec::ChainSpec;
use reth_eth_wire::{DisconnectReason, EthVersion};
use reth_eth_wire_types::{GetBlockHeaders, HeadersDirection, RequestPair, Transactions};
use reth_ethereum_forks::ForkId;
use reth_ethereum_primitives::TransactionSigned;
use reth_network_peers::NodeRecord;
use reth_primitives_traits::Header;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

/// Budget for one Status sent and one received.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(5);
/// Outstanding requests older than this are dropped.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Capacity of the reader to handler queue.
pub const INBOUND_QUEUE: usize = 1024;
const OUTBOUND_QUEUE: usize = 1024;
const ERROR_WINDOW: Duration = Duration::from_secs(60);
const MAX_ERRORS_IN_WINDOW: usize = 3;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);
const EVICT_INTERVAL: Duration = Duration::from_secs(5);
/// Time the reader and writer get to stop after close.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("dial failed: {0}")]
    DialFailed(#[source] TransportError),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("{field} mismatch: local {local}, remote {remote}")]
    Mismatch {
        field: &'static str,
        local: String,
        remote: String,
    },
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        if err.is_dial() {
            Self::DialFailed(err)
        } else {
            Self::HandshakeFailed(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Dialing = 0,
    Handshaking = 1,
    StatusExchanged = 2,
    Active = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Dialing,
            1 => Self::Handshaking,
            2 => Self::StatusExchanged,
            3 => Self::Active,
            _ => Self::Closed,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dialing => "dialing",
            Self::Handshaking => "handshaking",
            Self::StatusExchanged => "status_exchanged",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

/// Why a serving session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Remote,
    Cancelled,
    InboundOverflow,
    TooManyErrors,
    Transport,
}

/// Local chain identity used in the status exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusConfig {
    /// Zero accepts any network by mirroring the remote status.
    pub network_id: u64,
    pub genesis: B256,
    pub head: B256,
    pub total_difficulty: U256,
    pub fork_id: ForkId,
    /// Echo the remote status back instead of announcing our own chain; only
    /// the network id is checked.
    pub mirror: bool,
    /// Check the genesis hash even when the status is mirrored.
    pub genesis_pinned: bool,
}

impl StatusConfig {
    pub fn for_chain(chain: &ChainSpec, network_id: u64) -> Self {
        let genesis = chain.genesis_hash();
        Self {
            network_id,
            genesis,
            head: genesis,
            total_difficulty: chain
                .get_final_paris_total_difficulty()
                .unwrap_or(chain.genesis_header().difficulty),
            fork_id: chain.latest_fork_id(),
            mirror: false,
            genesis_pinned: false,
        }
    }

    pub fn mirroring(mut self) -> Self {
        self.mirror = true;
        self
    }

    /// Require peers to share our genesis whatever the network id policy.
    pub fn pin_genesis(mut self) -> Self {
        self.genesis_pinned = true;
        self
    }

    /// Replace the preset genesis and pin it.
    pub fn with_genesis(mut self, genesis: B256) -> Self {
        self.genesis = genesis;
        self.head = genesis;
        self.pin_genesis()
    }

    pub fn accepts_any_network(&self) -> bool {
        self.network_id == 0
    }

    pub fn local_status(&self, version: EthVersion) -> Status {
        Status {
            version: version as u8,
            network_id: self.network_id,
            total_difficulty: self.total_difficulty,
            head: self.head,
            genesis: self.genesis,
            fork_id: Some(self.fork_id),
        }
    }

    pub fn check(&self, remote: &Status) -> Result<(), SessionError> {
        if !self.accepts_any_network() && remote.network_id != self.network_id {
            return Err(SessionError::Mismatch {
                field: "network id",
                local: self.network_id.to_string(),
                remote: remote.network_id.to_string(),
            });
        }
        let mirrored = self.accepts_any_network() || self.mirror;
        if (!mirrored || self.genesis_pinned) && remote.genesis != self.genesis {
            return Err(SessionError::Mismatch {
                field: "genesis",
                local: format!("{:#x}", self.genesis),
                remote: format!("{:#x}", remote.genesis),
            });
        }
        Ok(())
    }
}

/// Everything a dial needs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub local: Arc<LocalNode>,
    pub status: StatusConfig,
    pub pooled_transactions_limit: usize,
}

/// What an outstanding request is for.
#[derive(Debug)]
pub enum PendingKind {
    /// A `query_headers` caller waiting on the response.
    Headers(oneshot::Sender<Vec<Header>>),
    HeaderFetch { is_parent: bool },
    BodyFetch { hashes: Vec<B256> },
    PooledTransactions,
}

#[derive(Debug)]
struct PendingRequest {
    kind: PendingKind,
    sent_at: Instant,
}

#[derive(Debug, Default)]
struct ErrorWindow {
    errors: VecDeque<Instant>,
}

impl ErrorWindow {
    /// Record one error; true once the window holds too many.
    fn record(&mut self, now: Instant) -> bool {
        while let Some(front) = self.errors.front() {
            if now.duration_since(*front) > ERROR_WINDOW {
                self.errors.pop_front();
            } else {
                break;
            }
        }
        self.errors.push_back(now);
        self.errors.len() >= MAX_ERRORS_IN_WINDOW
    }
}

/// Point-in-time view of one session.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub slot: usize,
    pub url: String,
    pub node_id: String,
    pub hello: Hello,
    pub status: Status,
    pub version: EthVersion,
    pub state: SessionState,
    pub connected_at: SystemTime,
    pub counters: CounterSnapshot,
}

#[derive(Debug)]
struct SessionShared {
    node: NodeRecord,
    url: String,
    node_id: String,
    hello: Hello,
    status: Status,
    version: EthVersion,
    connected_at: SystemTime,
    state: AtomicU8,
    counters: PeerCounters,
    outbound: mpsc::Sender<EthMessage>,
    close_tx: watch::Sender<bool>,
    close_reason: Mutex<Option<CloseReason>>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    next_request_id: AtomicU64,
    errors: Mutex<ErrorWindow>,
}

/// Cloneable handle to a live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

impl SessionHandle {
    fn new(
        node: NodeRecord,
        hello: Hello,
        status: Status,
        version: EthVersion,
        counters: PeerCounters,
    ) -> (Self, mpsc::Receiver<EthMessage>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (close_tx, _) = watch::channel(false);
        let handle = Self {
            inner: Arc::new(SessionShared {
                url: rlpx::enode_url(&node),
                node_id: rlpx::node_id_hex(&node.id),
                node,
                hello,
                status,
                version,
                connected_at: SystemTime::now(),
                state: AtomicU8::new(SessionState::Handshaking as u8),
                counters,
                outbound,
                close_tx,
                close_reason: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_request_id: AtomicU64::new(u64::from(rand::random::<u32>())),
                errors: Mutex::new(ErrorWindow::default()),
            }),
        };
        (handle, outbound_rx)
    }

    /// An active handle with no connection; queued messages land in the receiver.
    #[cfg(test)]
    pub(crate) fn detached(node: NodeRecord, status: Status) -> (Self, mpsc::Receiver<EthMessage>) {
        let hello = Hello {
            protocol_version: 5,
            client_version: "detached/v1".to_string(),
            capabilities: vec!["eth/68".to_string()],
            port: node.tcp_port,
            id: node.id,
        };
        let (handle, outbound_rx) =
            Self::new(node, hello, status, EthVersion::Eth68, PeerCounters::default());
        handle.set_state(SessionState::Active);
        (handle, outbound_rx)
    }

    pub fn node(&self) -> &NodeRecord {
        &self.inner.node
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn hello(&self) -> &Hello {
        &self.inner.hello
    }

    pub fn status(&self) -> &Status {
        &self.inner.status
    }

    pub fn version(&self) -> EthVersion {
        self.inner.version
    }

    pub fn counters(&self) -> &PeerCounters {
        &self.inner.counters
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SessionState) {
        self.inner.state.store(state as u8, Ordering::Release);
        trace!(peer = %self.inner.node_id, state = state.as_str(), "session state");
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.close_tx.borrow()
    }

    pub fn close(&self) {
        self.close_with(CloseReason::Cancelled);
    }

    fn close_with(&self, reason: CloseReason) {
        {
            let mut slot = self.inner.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.close_tx.send_replace(true);
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.close_reason.lock()
    }

    /// Queue a message without waiting; false when the queue is full or closed.
    pub fn send(&self, message: EthMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        self.inner.outbound.try_send(message).is_ok()
    }

    /// Queue one `Transactions` message; a full queue counts as a dropped broadcast.
    pub fn broadcast_tx(&self, txs: Vec<TransactionSigned>) -> bool {
        if txs.is_empty() {
            return true;
        }
        let queued = self.send(EthMessage::Transactions(Transactions(txs)));
        if !queued {
            self.inner.counters.record_dropped_broadcast();
        }
        queued
    }

    /// Register a request and queue the message built for its id.
    pub fn request(&self, kind: PendingKind, build: impl FnOnce(u64) -> EthMessage) -> Option<u64> {
        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().insert(
            id,
            PendingRequest {
                kind,
                sent_at: Instant::now(),
            },
        );
        if self.send(build(id)) {
            Some(id)
        } else {
            self.inner.pending.lock().remove(&id);
            None
        }
    }

    /// Remove and return the request registered under `id`.
    pub fn take_pending(&self, id: u64) -> Option<PendingKind> {
        self.inner.pending.lock().remove(&id).map(|pending| pending.kind)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    fn evict_expired(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut pending = self.inner.pending.lock();
        let before = pending.len();
        pending.retain(|_, request| now.duration_since(request.sent_at) < max_age);
        before - pending.len()
    }

    /// Count an invalid message; closes the session once the window fills.
    pub fn report_invalid(&self, reason: &str) -> bool {
        let exceeded = self.inner.errors.lock().record(Instant::now());
        debug!(peer = %self.inner.node_id, reason, "invalid message");
        if exceeded {
            debug!(peer = %self.inner.node_id, "too many invalid messages, closing");
            self.close_with(CloseReason::TooManyErrors);
        }
        exceeded
    }

    /// Ascending `GetBlockHeaders` from `start`, awaiting the matching response.
    pub async fn query_headers(&self, start: u64, amount: u64) -> Result<Vec<Header>> {
        if amount == 0 || amount > super::codec::MAX_HEADERS_RESPONSE as u64 {
            return Err(eyre!(
                "header amount must be within 1..={}, got {amount}",
                super::codec::MAX_HEADERS_RESPONSE
            ));
        }
        let (tx, rx) = oneshot::channel();
        let id = self
            .request(PendingKind::Headers(tx), |request_id| {
                EthMessage::GetBlockHeaders(RequestPair {
                    request_id,
                    message: GetBlockHeaders {
                        start_block: BlockHashOrNumber::Number(start),
                        limit: amount,
                        skip: 0,
                        direction: HeadersDirection::Rising,
                    },
                })
            })
            .ok_or_else(|| eyre!("session {} is not accepting requests", self.node_id()))?;
        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(headers)) => Ok(headers),
            Ok(Err(_)) => Err(eyre!("request {id} dropped before a response")),
            Err(_) => {
                self.take_pending(id);
                Err(eyre!("request {id} timed out after {REQUEST_TIMEOUT:?}"))
            }
        }
    }

    pub fn snapshot(&self, slot: usize) -> PeerSnapshot {
        PeerSnapshot {
            slot,
            url: self.inner.url.clone(),
            node_id: self.inner.node_id.clone(),
            hello: self.inner.hello.clone(),
            status: self.inner.status,
            version: self.inner.version,
            state: self.state(),
            connected_at: self.inner.connected_at,
            counters: self.inner.counters.snapshot(),
        }
    }
}

/// A session past the status exchange, ready to serve.
pub struct Session {
    handle: SessionHandle,
    transport: Transport,
    codec: Codec,
    outbound_rx: mpsc::Receiver<EthMessage>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Dial `node`, complete the handshakes and exchange status.
    pub async fn dial(node: NodeRecord, config: &SessionConfig) -> Result<Self, SessionError> {
        trace!(node = %node, state = SessionState::Dialing.as_str(), "session state");
        let connection = rlpx::connect(&node, &config.local).await?;
        Self::establish(node, connection, config).await
    }

    /// Run the status exchange over an already authenticated connection.
    pub async fn establish(
        node: NodeRecord,
        connection: Connection,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        trace!(node = %node, state = SessionState::Handshaking.as_str(), "session state");
        let Connection {
            mut transport,
            hello,
            version,
        } = connection;
        let codec = Codec::new(version).with_pooled_transactions_limit(config.pooled_transactions_limit);
        let counters = PeerCounters::default();

        let exchanged = timeout(
            STATUS_TIMEOUT,
            exchange_status(&mut transport, &codec, &config.status, version, &counters),
        )
        .await
        .unwrap_or_else(|_| Err(SessionError::HandshakeFailed("status exchange timed out".into())));
        let status = match exchanged {
            Ok(status) => status,
            Err(err) => {
                let reason = match err {
                    SessionError::Mismatch { .. } => DisconnectReason::UselessPeer,
                    _ => DisconnectReason::ProtocolBreach,
                };
                let _ = timeout(Duration::from_secs(1), transport.disconnect(reason)).await;
                return Err(err);
            }
        };

        let (handle, outbound_rx) = SessionHandle::new(node, hello, status, version, counters);
        handle.set_state(SessionState::StatusExchanged);
        debug!(
            peer = %handle.node_id(),
            client = %handle.hello().client_version,
            eth = version as u8,
            network_id = status.network_id,
            "status exchanged"
        );
        Ok(Self {
            handle,
            transport,
            codec,
            outbound_rx,
        })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Remote hello and status captured during the handshake.
    pub fn peer(&self) -> (&Hello, &Status) {
        (self.handle.hello(), self.handle.status())
    }

    /// Send a disconnect and drop the connection.
    pub async fn disconnect(mut self) {
        self.handle.set_state(SessionState::Closed);
        self.handle.close();
        let _ = timeout(
            CLOSE_GRACE,
            self.transport.disconnect(DisconnectReason::ClientQuitting),
        )
        .await;
    }

    /// Serve the connection until it closes, then report why.
    pub async fn read_and_serve(self, ctx: Arc<HandlerContext>) -> CloseReason {
        let Self {
            handle,
            transport,
            codec,
            outbound_rx,
        } = self;
        handle.set_state(SessionState::Active);
        let (sink, stream) = transport.split();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE);

        let mut reader = tokio::spawn(read_loop(handle.clone(), stream, codec, inbound_tx));
        let mut writer = tokio::spawn(write_loop(handle.clone(), sink, outbound_rx));

        let mut handler = Handler::new(ctx, handle.clone());
        let mut close_rx = handle.inner.close_tx.subscribe();
        let mut evict = interval(EVICT_INTERVAL);
        evict.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = wait_closed(&mut close_rx) => {
                    // The reader only stops on EOF or a transport error after
                    // queueing everything it decoded; serve that backlog.
                    if matches!(handle.close_reason(), Some(CloseReason::Remote | CloseReason::Transport)) {
                        while let Ok(message) = inbound_rx.try_recv() {
                            handler.handle(message).await;
                        }
                    }
                    break;
                }
                message = inbound_rx.recv() => match message {
                    Some(message) => handler.handle(message).await,
                    None => break,
                },
                _ = evict.tick() => {
                    let evicted = handle.evict_expired(REQUEST_TIMEOUT);
                    if evicted > 0 {
                        debug!(peer = %handle.node_id(), evicted, "expired outstanding requests");
                    }
                }
            }
        }

        handle.close_with(CloseReason::Remote);
        handle.set_state(SessionState::Closed);
        for task in [&mut reader, &mut writer] {
            if timeout(CLOSE_GRACE, &mut *task).await.is_err() {
                task.abort();
            }
        }
        let reason = handle.close_reason().unwrap_or(CloseReason::Remote);
        debug!(peer = %handle.node_id(), ?reason, "session closed");
        reason
    }
}

/// Resolve once the close signal is raised.
async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

async fn exchange_status(
    transport: &mut Transport,
    codec: &Codec,
    config: &StatusConfig,
    version: EthVersion,
    counters: &PeerCounters,
) -> Result<Status, SessionError> {
    if config.accepts_any_network() || config.mirror {
        let remote = read_status(transport, codec, counters).await?;
        check_version(&remote, version)?;
        config.check(&remote)?;
        let mirrored = Status {
            version: version as u8,
            ..remote
        };
        send_status(transport, mirrored, counters).await?;
        return Ok(remote);
    }
    send_status(transport, config.local_status(version), counters).await?;
    let remote = read_status(transport, codec, counters).await?;
    check_version(&remote, version)?;
    config.check(&remote)?;
    Ok(remote)
}

fn check_version(remote: &Status, version: EthVersion) -> Result<(), SessionError> {
    if remote.version != version as u8 {
        return Err(SessionError::HandshakeFailed(format!(
            "status version {} differs from negotiated eth/{}",
            remote.version, version as u8
        )));
    }
    Ok(())
}

async fn send_status(
    transport: &mut Transport,
    status: Status,
    counters: &PeerCounters,
) -> Result<(), SessionError> {
    transport
        .send(EthMessage::Status(status).encode().into())
        .await
        .map_err(|err| SessionError::HandshakeFailed(format!("failed to send status: {err}")))?;
    counters.record_sent(MessageKind::Status, 1);
    Ok(())
}

async fn read_status(
    transport: &mut Transport,
    codec: &Codec,
    counters: &PeerCounters,
) -> Result<Status, SessionError> {
    let frame = match transport.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(err)) => return Err(SessionError::HandshakeFailed(err.to_string())),
        None => {
            return Err(SessionError::HandshakeFailed(
                "connection closed during status exchange".into(),
            ))
        }
    };
    match codec.decode(&frame) {
        Ok(EthMessage::Status(status)) => {
            counters.record_received(MessageKind::Status, 1);
            Ok(status)
        }
        Ok(other) => Err(SessionError::HandshakeFailed(format!(
            "expected status, got {}",
            other.kind().name()
        ))),
        Err(err) => Err(SessionError::HandshakeFailed(err.to_string())),
    }
}

async fn read_loop(
    handle: SessionHandle,
    mut stream: futures::stream::SplitStream<Transport>,
    codec: Codec,
    inbound: mpsc::Sender<EthMessage>,
) {
    let mut close_rx = handle.inner.close_tx.subscribe();
    loop {
        let frame = tokio::select! {
            _ = wait_closed(&mut close_rx) => return,
            frame = stream.next() => frame,
        };
        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                debug!(peer = %handle.node_id(), error = %err, "read failed");
                handle.close_with(CloseReason::Transport);
                return;
            }
            None => {
                handle.close_with(CloseReason::Remote);
                return;
            }
        };
        let message = match codec.decode(&frame) {
            Ok(message) => message,
            Err(err) => {
                log_codec_error(&handle, &err);
                handle.report_invalid(&err.to_string());
                continue;
            }
        };
        handle
            .counters()
            .record_received(message.kind(), message.item_count());
        if inbound.try_send(message).is_err() {
            warn!(peer = %handle.node_id(), capacity = INBOUND_QUEUE, "inbound queue overflow, closing");
            handle.close_with(CloseReason::InboundOverflow);
            return;
        }
    }
}

fn log_codec_error(handle: &SessionHandle, err: &CodecError) {
    match err {
        CodecError::UnknownMessage { id, .. } => {
            debug!(peer = %handle.node_id(), id, "unknown message")
        }
        _ => debug!(peer = %handle.node_id(), error = %err, "undecodable message"),
    }
}

async fn write_loop(
    handle: SessionHandle,
    mut sink: futures::stream::SplitSink<Transport, Bytes>,
    mut outbound: mpsc::Receiver<EthMessage>,
) {
    let mut close_rx = handle.inner.close_tx.subscribe();
    let mut flush = interval(FLUSH_INTERVAL);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut healthy = true;
    loop {
        tokio::select! {
            _ = wait_closed(&mut close_rx) => break,
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if !write_message(&handle, &mut sink, message).await {
                    healthy = false;
                    break;
                }
            }
            _ = flush.tick() => {
                if let Err(err) = sink.flush().await {
                    debug!(peer = %handle.node_id(), error = %err, "flush failed");
                    handle.close_with(CloseReason::Transport);
                    healthy = false;
                    break;
                }
            }
        }
    }
    // Whatever was queued before the close still goes out.
    if healthy {
        outbound.close();
        while let Ok(message) = outbound.try_recv() {
            if !write_message(&handle, &mut sink, message).await {
                break;
            }
        }
    }
    let _ = timeout(CLOSE_GRACE, sink.close()).await;
}

async fn write_message(
    handle: &SessionHandle,
    sink: &mut futures::stream::SplitSink<Transport, Bytes>,
    message: EthMessage,
) -> bool {
    let (kind, items) = (message.kind(), message.item_count());
    if let Err(err) = sink.send(message.encode().into()).await {
        debug!(peer = %handle.node_id(), error = %err, "write failed");
        handle.close_with(CloseReason::Transport);
        return false;
    }
    handle.counters().record_sent(kind, items);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::manager::{Registry, SharedState};
    use crate::sink::{Backend, JsonLines, Sink, WriteFlags};
    use crate::test_utils::{
        burst_hash, test_status, test_status_config, MockPeer, MockScript, SharedBuffer,
    };

    fn config(network_id: u64) -> SessionConfig {
        SessionConfig {
            local: Arc::new(LocalNode::random("sensor-test/v1")),
            status: test_status_config(network_id),
            pooled_transactions_limit: super::super::codec::DEFAULT_POOLED_TRANSACTIONS_LIMIT,
        }
    }

    #[test]
    fn error_window_closes_on_third_error_within_a_minute() {
        let mut window = ErrorWindow::default();
        let start = Instant::now();
        assert!(!window.record(start));
        assert!(!window.record(start + Duration::from_secs(61)));
        assert!(!window.record(start + Duration::from_secs(62)));
        assert!(window.record(start + Duration::from_secs(63)));
    }

    #[test]
    fn status_check_rejects_other_network_and_genesis() {
        let config = test_status_config(1);
        let mut remote = config.local_status(EthVersion::Eth68);
        assert!(config.check(&remote).is_ok());

        remote.network_id = 5;
        assert!(matches!(
            config.check(&remote),
            Err(SessionError::Mismatch { field: "network id", .. })
        ));

        remote.network_id = 1;
        remote.genesis = B256::repeat_byte(9);
        assert!(matches!(
            config.check(&remote),
            Err(SessionError::Mismatch { field: "genesis", .. })
        ));

        assert!(test_status_config(0).check(&remote).is_ok());
        assert!(test_status_config(1).mirroring().check(&remote).is_ok());
    }

    #[test]
    fn pinned_genesis_is_checked_on_any_network() {
        let mut remote = test_status(11_155_111);
        remote.genesis = B256::repeat_byte(7);
        assert!(test_status_config(0).check(&remote).is_ok());
        assert!(matches!(
            test_status_config(0).pin_genesis().check(&remote),
            Err(SessionError::Mismatch { field: "genesis", .. })
        ));
        assert!(test_status_config(0)
            .with_genesis(B256::repeat_byte(7))
            .check(&remote)
            .is_ok());
    }

    #[tokio::test]
    async fn pinned_genesis_rejects_foreign_chain_before_mirroring() {
        let mut foreign = test_status(1);
        foreign.genesis = B256::repeat_byte(3);
        let peer = MockPeer::spawn(foreign, MockScript::default()).await;
        let mut pinned = config(0);
        pinned.status = pinned.status.pin_genesis();
        let err = Session::dial(peer.record(), &pinned)
            .await
            .expect_err("genesis differs");
        assert!(matches!(err, SessionError::Mismatch { field: "genesis", .. }), "{err}");
    }

    #[tokio::test]
    async fn dial_matching_peer_reaches_status_exchanged() {
        let peer = MockPeer::spawn(test_status(1), MockScript::default()).await;
        let session = Session::dial(peer.record(), &config(1))
            .await
            .expect("dial succeeds");
        let (hello, status) = session.peer();
        assert_eq!(hello.client_version, "mock-peer/v1");
        assert_eq!(status.network_id, 1);
        assert_eq!(session.handle().state(), SessionState::StatusExchanged);
        assert_eq!(
            session.handle().counters().received_packets(MessageKind::Status),
            1
        );
        session.disconnect().await;
    }

    #[tokio::test]
    async fn dial_other_network_is_a_mismatch() {
        let peer = MockPeer::spawn(test_status(5), MockScript::default()).await;
        let err = Session::dial(peer.record(), &config(1))
            .await
            .expect_err("network differs");
        assert!(matches!(err, SessionError::Mismatch { field: "network id", .. }), "{err}");
    }

    #[tokio::test]
    async fn network_id_zero_mirrors_remote_status() {
        let peer = MockPeer::spawn(test_status(11_155_111), MockScript::default()).await;
        let session = Session::dial(peer.record(), &config(0))
            .await
            .expect("any network accepted");
        assert_eq!(session.peer().1.network_id, 11_155_111);
        let sent = peer.received_status().await.expect("mock saw our status");
        assert_eq!(sent.network_id, 11_155_111);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn full_inbound_queue_closes_the_session() {
        let peer = MockPeer::spawn(test_status(1), MockScript::bursting(8)).await;
        let Session {
            handle,
            transport,
            codec,
            ..
        } = Session::dial(peer.record(), &config(1))
            .await
            .expect("dial succeeds");
        let (_sink, stream) = transport.split();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(1);

        timeout(Duration::from_secs(5), read_loop(handle.clone(), stream, codec, inbound_tx))
            .await
            .expect("reader stops on overflow");
        assert_eq!(handle.close_reason(), Some(CloseReason::InboundOverflow));
        assert!(handle.is_closed());
        assert!(matches!(inbound_rx.try_recv(), Ok(EthMessage::NewBlockHashes(_))));
    }

    #[tokio::test]
    async fn messages_queued_before_remote_close_are_served() {
        const BURST: usize = 20;
        let peer = MockPeer::spawn(test_status(1), MockScript::bursting(BURST)).await;
        let session = Session::dial(peer.record(), &config(1))
            .await
            .expect("dial succeeds");
        let buffer = SharedBuffer::default();
        let ctx = Arc::new(HandlerContext {
            sink: Sink::new(
                Backend::Json(JsonLines::new(Box::new(buffer.clone()))),
                "sensor-1",
                WriteFlags::default(),
                8,
            ),
            shared: Arc::new(SharedState::default()),
            registry: Arc::new(Registry::new(1)),
            options: Default::default(),
        });
        // Already known hashes are recorded without being fetched back.
        for index in 0..BURST {
            ctx.shared.mark_block(burst_hash(index));
        }

        let reason = timeout(Duration::from_secs(10), session.read_and_serve(Arc::clone(&ctx)))
            .await
            .expect("session ends when the peer hangs up");
        assert!(matches!(reason, CloseReason::Remote | CloseReason::Transport), "{reason:?}");
        assert!(ctx.sink.drain(Duration::from_secs(5)).await);
        let recorded = buffer
            .lines()
            .iter()
            .filter(|line| line.contains(r#""type":"block_hash""#))
            .count();
        assert_eq!(recorded, BURST);
    }
}
