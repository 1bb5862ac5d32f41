//! Persistence sink: typed records over a pluggable backend.

mod json;
pub mod records;
mod store;

pub use json::JsonLines;
pub use records::Record;
pub use store::{RecordStore, StoredBlock};

use crate::p2p::PeerSnapshot;
use crate::storage::Storage;
use alloy_primitives::{B256, U256};
use eyre::Result;
use records::{BlockRecord, BodyRecord, EventRecord, PeerRecord, TransactionRecord};
use reth_ethereum_primitives::{Block, BlockBody};
use reth_primitives_traits::{Header, SignedTransaction};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

pub const DEFAULT_MAX_CONCURRENT_WRITES: usize = 100;

/// Storage capability every backend implements.
pub trait RecordSink: Send + Sync {
    /// Persist a batch in order.
    fn write(&self, records: &[Record]) -> Result<()>;

    /// Whether the block is already persisted.
    fn has_block(&self, hash: &B256) -> Result<bool>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// The closed set of sink backends.
#[derive(Debug)]
pub enum Backend {
    Json(JsonLines),
    Store(RecordStore),
    Noop,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Store(_) => "store",
            Self::Noop => "noop",
        }
    }
}

impl RecordSink for Backend {
    fn write(&self, records: &[Record]) -> Result<()> {
        match self {
            Self::Json(sink) => sink.write(records),
            Self::Store(sink) => sink.write(records),
            Self::Noop => Ok(()),
        }
    }

    fn has_block(&self, hash: &B256) -> Result<bool> {
        match self {
            Self::Json(sink) => sink.has_block(hash),
            Self::Store(sink) => sink.has_block(hash),
            // Claiming every block suppresses parent fetching.
            Self::Noop => Ok(true),
        }
    }

    fn flush(&self) -> Result<()> {
        match self {
            Self::Json(sink) => sink.flush(),
            Self::Store(sink) => sink.flush(),
            Self::Noop => Ok(()),
        }
    }
}

/// Which record families are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFlags {
    pub blocks: bool,
    pub block_events: bool,
    pub transactions: bool,
    pub transaction_events: bool,
    pub peers: bool,
}

impl Default for WriteFlags {
    fn default() -> Self {
        Self {
            blocks: true,
            block_events: true,
            transactions: true,
            transaction_events: true,
            peers: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct SinkStats {
    pub records_written: AtomicU64,
    pub failed_writes: AtomicU64,
    pub abandoned_writes: AtomicU64,
}

/// Front of the sink: builds records, applies flags and bounds in-flight writes.
#[derive(Debug, Clone)]
pub struct Sink {
    backend: Arc<Backend>,
    flags: WriteFlags,
    sensor_id: Arc<str>,
    permits: Arc<Semaphore>,
    max_writes: usize,
    stats: Arc<SinkStats>,
}

impl Sink {
    pub fn new(backend: Backend, sensor_id: &str, flags: WriteFlags, max_writes: usize) -> Self {
        let max_writes = max_writes.max(1);
        Self {
            backend: Arc::new(backend),
            flags,
            sensor_id: Arc::from(sensor_id),
            permits: Arc::new(Semaphore::new(max_writes)),
            max_writes,
            stats: Arc::new(SinkStats::default()),
        }
    }

    /// Record store under `data_dir/project_id`, or JSON lines on stdout when
    /// no project is given.
    pub fn open(
        project_id: &str,
        data_dir: &Path,
        sensor_id: &str,
        flags: WriteFlags,
        max_writes: usize,
    ) -> Result<Self> {
        let backend = if project_id.is_empty() {
            Backend::Json(JsonLines::stdout())
        } else {
            let storage = Storage::open(&data_dir.join(project_id))?;
            Backend::Store(RecordStore::new(storage))
        };
        Ok(Self::new(backend, sensor_id, flags, max_writes))
    }

    pub fn noop() -> Self {
        Self::new(
            Backend::Noop,
            "",
            WriteFlags::default(),
            DEFAULT_MAX_CONCURRENT_WRITES,
        )
    }

    pub fn flags(&self) -> WriteFlags {
        self.flags
    }

    pub fn sensor_id(&self) -> &str {
        &self.sensor_id
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.max_writes - self.permits.available_permits()
    }

    pub fn has_block(&self, hash: &B256) -> bool {
        match self.backend.has_block(hash) {
            Ok(found) => found,
            Err(err) => {
                error!(error = %err, hash = %hash, "sink block lookup failed");
                false
            }
        }
    }

    /// Block event followed by the block, written as one ordered batch.
    pub async fn write_block(&self, peer_id: &str, block: &Block, td: Option<U256>, at: SystemTime) {
        let record = BlockRecord::from_block(&self.sensor_id, block, td, at);
        let mut records = Vec::with_capacity(2);
        if self.flags.block_events {
            records.push(Record::BlockEvent(EventRecord::new(
                &self.sensor_id,
                peer_id,
                record.hash,
                at,
            )));
        }
        if self.flags.blocks {
            records.push(Record::Block(record));
        }
        self.submit(records).await;
    }

    pub async fn write_block_headers(&self, headers: &[Header], at: SystemTime, is_parent: bool) {
        if !self.flags.blocks {
            return;
        }
        let records = headers
            .iter()
            .map(|header| {
                Record::BlockHeader(BlockRecord::from_header(
                    &self.sensor_id,
                    header,
                    at,
                    is_parent,
                ))
            })
            .collect();
        self.submit(records).await;
    }

    pub async fn write_block_hashes(&self, peer_id: &str, hashes: &[B256], at: SystemTime) {
        if !self.flags.block_events {
            return;
        }
        let records = hashes
            .iter()
            .map(|hash| Record::BlockHash(EventRecord::new(&self.sensor_id, peer_id, *hash, at)))
            .collect();
        self.submit(records).await;
    }

    pub async fn write_block_hash_first_seen(&self, peer_id: &str, hashes: &[B256], at: SystemTime) {
        if !self.flags.block_events {
            return;
        }
        let records = hashes
            .iter()
            .map(|hash| {
                Record::BlockHashFirstSeen(EventRecord::new(&self.sensor_id, peer_id, *hash, at))
            })
            .collect();
        self.submit(records).await;
    }

    pub async fn write_block_body(&self, body: &BlockBody, hash: B256, at: SystemTime) {
        if !self.flags.blocks {
            return;
        }
        let record = BodyRecord::from_body(&self.sensor_id, hash, body, at);
        self.submit(vec![Record::BlockBody(record)]).await;
    }

    /// Event plus body for each transaction.
    pub async fn write_transactions<T: SignedTransaction>(&self, peer_id: &str, txs: &[T], at: SystemTime) {
        let mut records = Vec::new();
        for tx in txs {
            if self.flags.transaction_events {
                records.push(Record::TransactionEvent(EventRecord::new(
                    &self.sensor_id,
                    peer_id,
                    *tx.tx_hash(),
                    at,
                )));
            }
            if self.flags.transactions {
                records.push(Record::Transaction(TransactionRecord::from_tx(
                    &self.sensor_id,
                    tx,
                    at,
                )));
            }
        }
        self.submit(records).await;
    }

    /// Events only, for transactions whose bodies were already written.
    pub async fn write_transaction_events(&self, peer_id: &str, hashes: &[B256], at: SystemTime) {
        if !self.flags.transaction_events {
            return;
        }
        let records = hashes
            .iter()
            .map(|hash| {
                Record::TransactionEvent(EventRecord::new(&self.sensor_id, peer_id, *hash, at))
            })
            .collect();
        self.submit(records).await;
    }

    pub async fn write_peers(&self, peers: &[PeerSnapshot], at: SystemTime) {
        if !self.flags.peers {
            return;
        }
        let records = peers
            .iter()
            .map(|peer| Record::Peer(PeerRecord::from_snapshot(&self.sensor_id, peer, at)))
            .collect();
        self.submit(records).await;
    }

    /// Commit one batch. Returns once the backend has it, so batches from one
    /// caller land in submission order.
    async fn submit(&self, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            self.stats
                .abandoned_writes
                .fetch_add(records.len() as u64, Ordering::Relaxed);
            debug!(records = records.len(), "sink closed, dropping write");
            return;
        };
        let backend = Arc::clone(&self.backend);
        let stats = Arc::clone(&self.stats);
        let committed = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            match backend.write(&records) {
                Ok(()) => {
                    stats
                        .records_written
                        .fetch_add(records.len() as u64, Ordering::Relaxed);
                }
                Err(err) => {
                    stats.failed_writes.fetch_add(1, Ordering::Relaxed);
                    error!(
                        error = %err,
                        backend = backend.name(),
                        kind = records[0].type_name(),
                        records = records.len(),
                        "sink write failed"
                    );
                }
            }
        })
        .await;
        if let Err(err) = committed {
            self.stats.failed_writes.fetch_add(1, Ordering::Relaxed);
            error!(error = %err, "sink write task failed");
        }
    }

    /// Wait for in-flight writes up to `budget`, then refuse new ones.
    ///
    /// Returns false when writes were still running at the deadline.
    pub async fn drain(&self, budget: Duration) -> bool {
        let drained =
            match tokio::time::timeout(budget, self.permits.acquire_many(self.max_writes as u32))
                .await
            {
                Ok(Ok(permits)) => {
                    permits.forget();
                    true
                }
                Ok(Err(_)) => true,
                Err(_) => {
                    warn!(in_flight = self.in_flight(), "sink drain budget exceeded");
                    false
                }
            };
        self.permits.close();
        if let Err(err) = self.backend.flush() {
            error!(error = %err, "sink flush failed");
        }
        drained
    }
}
