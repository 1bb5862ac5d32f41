//! Records emitted by the sink, one JSON object each.

use crate::clock::rfc3339_millis;
use crate::p2p::PeerSnapshot;
use alloy_primitives::{Address, B256, U256};
use reth_ethereum_primitives::{Block, BlockBody};
use reth_primitives_traits::{Header, SignedTransaction};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Sink record, tagged with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Block(BlockRecord),
    BlockHeader(BlockRecord),
    BlockHash(EventRecord),
    BlockEvent(EventRecord),
    BlockBody(BodyRecord),
    Transaction(TransactionRecord),
    TransactionEvent(EventRecord),
    Peer(PeerRecord),
    BlockHashFirstSeen(EventRecord),
}

impl Record {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Block(_) => "block",
            Self::BlockHeader(_) => "block_header",
            Self::BlockHash(_) => "block_hash",
            Self::BlockEvent(_) => "block_event",
            Self::BlockBody(_) => "block_body",
            Self::Transaction(_) => "transaction",
            Self::TransactionEvent(_) => "transaction_event",
            Self::Peer(_) => "peer",
            Self::BlockHashFirstSeen(_) => "block_hash_first_seen",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub sensor_id: String,
    pub hash: B256,
    pub parent_hash: B256,
    pub number: u64,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub difficulty: String,
    pub total_difficulty: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_fee: Option<u64>,
    pub tx_count: Option<usize>,
    pub uncle_count: Option<usize>,
    pub time_first_seen: String,
    pub is_parent: bool,
    #[serde(skip)]
    pub tx_hashes: Option<Vec<B256>>,
    #[serde(skip)]
    pub uncle_hashes: Option<Vec<B256>>,
}

impl BlockRecord {
    pub fn from_header(sensor_id: &str, header: &Header, at: SystemTime, is_parent: bool) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            hash: header.hash_slow(),
            parent_hash: header.parent_hash,
            number: header.number,
            timestamp: header.timestamp,
            gas_limit: header.gas_limit,
            gas_used: header.gas_used,
            difficulty: header.difficulty.to_string(),
            total_difficulty: None,
            base_fee: header.base_fee_per_gas,
            tx_count: None,
            uncle_count: None,
            time_first_seen: rfc3339_millis(at),
            is_parent,
            tx_hashes: None,
            uncle_hashes: None,
        }
    }

    pub fn from_block(sensor_id: &str, block: &Block, td: Option<U256>, at: SystemTime) -> Self {
        let body = BodyRecord::from_body(sensor_id, B256::ZERO, &block.body, at);
        Self {
            total_difficulty: td.map(|td| td.to_string()),
            tx_count: Some(body.tx_hashes.len()),
            uncle_count: Some(body.uncle_hashes.len()),
            tx_hashes: Some(body.tx_hashes),
            uncle_hashes: Some(body.uncle_hashes),
            ..Self::from_header(sensor_id, &block.header, at, false)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyRecord {
    pub sensor_id: String,
    pub hash: B256,
    pub tx_hashes: Vec<B256>,
    pub uncle_hashes: Vec<B256>,
    pub time_first_seen: String,
}

impl BodyRecord {
    pub fn from_body(sensor_id: &str, hash: B256, body: &BlockBody, at: SystemTime) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            hash,
            tx_hashes: body.transactions.iter().map(|tx| *tx.tx_hash()).collect(),
            uncle_hashes: body.ommers.iter().map(|uncle| uncle.hash_slow()).collect(),
            time_first_seen: rfc3339_millis(at),
        }
    }
}

/// A sighting of a block or transaction hash from one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sensor_id: String,
    pub peer_id: String,
    pub hash: B256,
    pub timestamp: String,
}

impl EventRecord {
    pub fn new(sensor_id: &str, peer_id: &str, hash: B256, at: SystemTime) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            peer_id: peer_id.to_string(),
            hash,
            timestamp: rfc3339_millis(at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub sensor_id: String,
    pub hash: B256,
    pub from: Option<Address>,
    pub to: Option<Address>,
    pub value: String,
    pub gas: u64,
    pub gas_price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_fee_cap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_tip_cap: Option<String>,
    pub nonce: u64,
    pub tx_type: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    pub time_first_seen: String,
}

impl TransactionRecord {
    pub fn from_tx<T: SignedTransaction>(sensor_id: &str, tx: &T, at: SystemTime) -> Self {
        let gas_price = tx.gas_price().unwrap_or_else(|| tx.max_fee_per_gas());
        Self {
            sensor_id: sensor_id.to_string(),
            hash: *tx.tx_hash(),
            from: tx.recover_signer().ok(),
            to: tx.to(),
            value: tx.value().to_string(),
            gas: tx.gas_limit(),
            gas_price: gas_price.to_string(),
            gas_fee_cap: tx
                .is_dynamic_fee()
                .then(|| tx.max_fee_per_gas().to_string()),
            gas_tip_cap: tx.max_priority_fee_per_gas().map(|tip| tip.to_string()),
            nonce: tx.nonce(),
            tx_type: tx.ty(),
            chain_id: tx.chain_id(),
            time_first_seen: rfc3339_millis(at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub sensor_id: String,
    pub id: String,
    pub name: String,
    pub url: String,
    pub caps: Vec<String>,
    pub network_id: u64,
    pub eth_version: u8,
    pub connected_at: String,
    pub time_last_seen: String,
}

impl PeerRecord {
    pub fn from_snapshot(sensor_id: &str, peer: &PeerSnapshot, at: SystemTime) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            id: peer.node_id.clone(),
            name: peer.hello.client_version.clone(),
            url: peer.url.clone(),
            caps: peer.hello.capabilities.clone(),
            network_id: peer.status.network_id,
            eth_version: peer.status.version,
            connected_at: rfc3339_millis(peer.connected_at),
            time_last_seen: rfc3339_millis(at),
        }
    }
}
