//! Record-store backend over the MDBX [`Storage`].

use super::records::{BlockRecord, BodyRecord, EventRecord, Record};
use super::RecordSink;
use crate::storage::{Entity, Storage};
use alloy_primitives::B256;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A block row, filled in as headers, bodies and full blocks arrive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub hash: B256,
    pub sensor_id: String,
    pub parent_hash: Option<B256>,
    pub number: Option<u64>,
    pub timestamp: Option<u64>,
    pub gas_limit: Option<u64>,
    pub gas_used: Option<u64>,
    pub difficulty: Option<String>,
    pub total_difficulty: Option<String>,
    pub base_fee: Option<u64>,
    pub tx_hashes: Option<Vec<B256>>,
    pub uncle_hashes: Option<Vec<B256>>,
    pub time_first_seen: String,
    pub is_parent: bool,
}

impl StoredBlock {
    fn new(hash: B256, sensor_id: &str, time_first_seen: &str, is_parent: bool) -> Self {
        Self {
            hash,
            sensor_id: sensor_id.to_string(),
            time_first_seen: time_first_seen.to_string(),
            is_parent,
            ..Default::default()
        }
    }

    fn merge_header(&mut self, record: &BlockRecord) {
        if self.number.is_none() {
            self.parent_hash = Some(record.parent_hash);
            self.number = Some(record.number);
            self.timestamp = Some(record.timestamp);
            self.gas_limit = Some(record.gas_limit);
            self.gas_used = Some(record.gas_used);
            self.difficulty = Some(record.difficulty.clone());
            self.base_fee = record.base_fee;
        }
        if self.total_difficulty.is_none() {
            self.total_difficulty = record.total_difficulty.clone();
        }
        if self.tx_hashes.is_none() {
            self.tx_hashes = record.tx_hashes.clone();
        }
        if self.uncle_hashes.is_none() {
            self.uncle_hashes = record.uncle_hashes.clone();
        }
    }

    fn merge_body(&mut self, record: &BodyRecord) {
        if self.tx_hashes.is_none() {
            self.tx_hashes = Some(record.tx_hashes.clone());
        }
        if self.uncle_hashes.is_none() {
            self.uncle_hashes = Some(record.uncle_hashes.clone());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEvent {
    kind: String,
    #[serde(flatten)]
    event: EventRecord,
}

/// Writes records into MDBX tables grouped by entity.
#[derive(Debug)]
pub struct RecordStore {
    storage: Storage,
    event_seq: AtomicU64,
}

impl RecordStore {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            event_seq: AtomicU64::new(0),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn block(&self, hash: &B256) -> Result<Option<StoredBlock>> {
        self.storage.get(Entity::Blocks, &block_key(hash))
    }

    fn upsert_header(&self, record: &BlockRecord) -> Result<()> {
        self.storage
            .update(Entity::Blocks, &block_key(&record.hash), |existing| {
                let mut block = existing.unwrap_or_else(|| {
                    StoredBlock::new(
                        record.hash,
                        &record.sensor_id,
                        &record.time_first_seen,
                        record.is_parent,
                    )
                });
                block.merge_header(record);
                block
            })
            .map(|_| ())
    }

    fn upsert_body(&self, record: &BodyRecord) -> Result<()> {
        self.storage
            .update(Entity::Blocks, &block_key(&record.hash), |existing| {
                let mut block = existing.unwrap_or_else(|| {
                    StoredBlock::new(record.hash, &record.sensor_id, &record.time_first_seen, false)
                });
                block.merge_body(record);
                block
            })
            .map(|_| ())
    }

    fn event_key(&self, event: &EventRecord) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        format!("{:#x}/{}/{nanos:020}/{seq}", event.hash, event.peer_id)
    }

    fn append_events(&self, entity: Entity, events: Vec<(String, StoredEvent)>) -> Result<()> {
        self.storage.put_all(entity, &events)
    }
}

impl RecordSink for RecordStore {
    fn write(&self, records: &[Record]) -> Result<()> {
        let mut block_events = Vec::new();
        let mut tx_events = Vec::new();
        for record in records {
            match record {
                Record::Block(block) | Record::BlockHeader(block) => self.upsert_header(block)?,
                Record::BlockBody(body) => self.upsert_body(body)?,
                Record::BlockHash(event)
                | Record::BlockEvent(event)
                | Record::BlockHashFirstSeen(event) => {
                    block_events.push((
                        self.event_key(event),
                        StoredEvent {
                            kind: record.type_name().to_string(),
                            event: event.clone(),
                        },
                    ));
                }
                Record::TransactionEvent(event) => {
                    tx_events.push((
                        self.event_key(event),
                        StoredEvent {
                            kind: record.type_name().to_string(),
                            event: event.clone(),
                        },
                    ));
                }
                Record::Transaction(tx) => {
                    self.storage
                        .update(Entity::Transactions, &format!("{:#x}", tx.hash), |existing| {
                            existing.unwrap_or_else(|| tx.clone())
                        })?;
                }
                Record::Peer(peer) => self.storage.put(Entity::Peers, &peer.url, peer)?,
            }
        }
        self.append_events(Entity::BlockEvents, block_events)?;
        self.append_events(Entity::TransactionEvents, tx_events)?;
        Ok(())
    }

    /// A row created from a body alone does not count until its header lands.
    fn has_block(&self, hash: &B256) -> Result<bool> {
        Ok(self.block(hash)?.is_some_and(|block| block.number.is_some()))
    }
}

fn block_key(hash: &B256) -> String {
    format!("{hash:#x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::records::TransactionRecord;
    use crate::test_utils::{signed_legacy_tx, temp_dir, test_block};

    fn open(prefix: &str) -> (RecordStore, std::path::PathBuf) {
        let dir = temp_dir(prefix);
        let storage = Storage::open(&dir).expect("open storage");
        (RecordStore::new(storage), dir)
    }

    #[test]
    fn same_block_twice_leaves_one_row() {
        let (store, dir) = open("store-block");
        let block = test_block(10);
        let record = BlockRecord::from_block("s", &block, None, SystemTime::now());
        store.write(&[Record::Block(record.clone())]).expect("first write");
        store.write(&[Record::Block(record.clone())]).expect("second write");

        assert_eq!(store.storage().count(Entity::Blocks).expect("count"), 1);
        assert!(store.has_block(&record.hash).expect("has block"));
        assert!(!store.has_block(&B256::repeat_byte(0xee)).expect("has block"));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn body_then_header_merge_into_one_block() {
        let (store, dir) = open("store-merge");
        let block = test_block(11);
        let now = SystemTime::now();
        let full = BlockRecord::from_block("s", &block, None, now);
        let body = BodyRecord::from_body("s", full.hash, &block.body, now);
        store.write(&[Record::BlockBody(body)]).expect("body");

        let stored = store.block(&full.hash).expect("read").expect("row");
        assert_eq!(stored.number, None);
        assert_eq!(stored.tx_hashes.as_ref().map(Vec::len), Some(1));
        assert!(!store.has_block(&full.hash).expect("has block"), "body alone claims the block");

        let header = BlockRecord::from_header("s", &block.header, now, true);
        store.write(&[Record::BlockHeader(header)]).expect("header");
        let stored = store.block(&full.hash).expect("read").expect("row");
        assert_eq!(stored.number, Some(11));
        assert_eq!(stored.parent_hash, Some(block.header.parent_hash));
        assert!(!stored.is_parent);
        assert!(store.has_block(&full.hash).expect("has block"));
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn events_append_and_transactions_dedupe() {
        let (store, dir) = open("store-events");
        let tx = signed_legacy_tx(1, 0);
        let record = TransactionRecord::from_tx("s", &tx, SystemTime::now());
        let event = EventRecord::new("s", "peer-a", record.hash, SystemTime::now());
        for _ in 0..2 {
            store
                .write(&[
                    Record::TransactionEvent(event.clone()),
                    Record::Transaction(record.clone()),
                ])
                .expect("write");
        }
        assert_eq!(store.storage().count(Entity::Transactions).expect("count"), 1);
        assert_eq!(store.storage().count(Entity::TransactionEvents).expect("count"), 2);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
