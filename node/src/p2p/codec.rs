//! `eth` subprotocol message codec.
//!
//! Frames handed to and received from the RLPx transport start with the
//! subprotocol-relative message id, followed by the RLP payload. The
//! transport applies the capability offset, Snappy compression and framing.

use alloy_primitives::{Bytes, B256, U256};
use alloy_rlp::{Buf, BufMut, Decodable, Encodable, RlpDecodable, RlpEncodable};
use bytes::BytesMut;
use reth_eth_wire::EthVersion;
use reth_eth_wire_types::{
    BlockBodies, BlockHeaders, GetBlockBodies, GetBlockHeaders, GetNodeData,
    GetPooledTransactions, GetReceipts, NewBlock, NewBlockHashes, NewPooledTransactionHashes66,
    NewPooledTransactionHashes68, PooledTransactions, RequestPair, Transactions,
};
use reth_ethereum_forks::ForkId;
use reth_ethereum_primitives::{Block, BlockBody, PooledTransactionVariant, TransactionSigned};
use reth_primitives_traits::Header;

/// Maximum headers accepted in one `BlockHeaders` response.
pub const MAX_HEADERS_RESPONSE: usize = 192;
/// Maximum bodies accepted in one `BlockBodies` response.
pub const MAX_BODIES_RESPONSE: usize = 128;
/// Maximum receipt lists accepted in one `Receipts` response.
pub const MAX_RECEIPTS_RESPONSE: usize = 256;
/// Maximum entries accepted in one `NodeData` response.
pub const MAX_NODE_DATA_RESPONSE: usize = 384;
/// Default soft cap on transactions in one `PooledTransactions` response.
pub const DEFAULT_POOLED_TRANSACTIONS_LIMIT: usize = 4096;

/// Decoding failures, classified for the session's error window.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed {kind} frame: {source}")]
    MalformedFrame {
        kind: &'static str,
        #[source]
        source: alloy_rlp::Error,
    },
    #[error("unknown message id {id:#04x} for eth/{version}")]
    UnknownMessage { id: u8, version: u8 },
    #[error("{kind} response carries {count} items, limit is {limit}")]
    OversizedFrame {
        kind: &'static str,
        count: usize,
        limit: usize,
    },
}

/// `eth` message kinds, keyed by their subprotocol message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MessageKind {
    Status = 0x00,
    NewBlockHashes = 0x01,
    Transactions = 0x02,
    GetBlockHeaders = 0x03,
    BlockHeaders = 0x04,
    GetBlockBodies = 0x05,
    BlockBodies = 0x06,
    NewBlock = 0x07,
    NewPooledTransactionHashes = 0x08,
    GetPooledTransactions = 0x09,
    PooledTransactions = 0x0a,
    GetNodeData = 0x0d,
    NodeData = 0x0e,
    GetReceipts = 0x0f,
    Receipts = 0x10,
}

impl MessageKind {
    pub const ALL: [MessageKind; 15] = [
        MessageKind::Status,
        MessageKind::NewBlockHashes,
        MessageKind::Transactions,
        MessageKind::GetBlockHeaders,
        MessageKind::BlockHeaders,
        MessageKind::GetBlockBodies,
        MessageKind::BlockBodies,
        MessageKind::NewBlock,
        MessageKind::NewPooledTransactionHashes,
        MessageKind::GetPooledTransactions,
        MessageKind::PooledTransactions,
        MessageKind::GetNodeData,
        MessageKind::NodeData,
        MessageKind::GetReceipts,
        MessageKind::Receipts,
    ];

    /// Resolve a message id for the negotiated version.
    pub fn from_id(id: u8, version: EthVersion) -> Option<Self> {
        let kind = Self::ALL.into_iter().find(|kind| *kind as u8 == id)?;
        match kind {
            Self::GetNodeData | Self::NodeData if version != EthVersion::Eth66 => None,
            _ => Some(kind),
        }
    }

    pub const fn id(self) -> u8 {
        self as u8
    }

    pub const fn index(self) -> usize {
        match self {
            Self::Status => 0,
            Self::NewBlockHashes => 1,
            Self::Transactions => 2,
            Self::GetBlockHeaders => 3,
            Self::BlockHeaders => 4,
            Self::GetBlockBodies => 5,
            Self::BlockBodies => 6,
            Self::NewBlock => 7,
            Self::NewPooledTransactionHashes => 8,
            Self::GetPooledTransactions => 9,
            Self::PooledTransactions => 10,
            Self::GetNodeData => 11,
            Self::NodeData => 12,
            Self::GetReceipts => 13,
            Self::Receipts => 14,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::NewBlockHashes => "new_block_hashes",
            Self::Transactions => "transactions",
            Self::GetBlockHeaders => "get_block_headers",
            Self::BlockHeaders => "block_headers",
            Self::GetBlockBodies => "get_block_bodies",
            Self::BlockBodies => "block_bodies",
            Self::NewBlock => "new_block",
            Self::NewPooledTransactionHashes => "new_pooled_transaction_hashes",
            Self::GetPooledTransactions => "get_pooled_transactions",
            Self::PooledTransactions => "pooled_transactions",
            Self::GetNodeData => "get_node_data",
            Self::NodeData => "node_data",
            Self::GetReceipts => "get_receipts",
            Self::Receipts => "receipts",
        }
    }
}

/// The `eth` handshake message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
#[rlp(trailing)]
pub struct Status {
    pub version: u8,
    pub network_id: u64,
    pub total_difficulty: U256,
    pub head: B256,
    pub genesis: B256,
    pub fork_id: Option<ForkId>,
}

/// An RLP list kept as raw bytes, with its item count.
///
/// Receipts and node data are never inspected, only validated and counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueList {
    raw: Bytes,
    count: usize,
}

impl OpaqueList {
    pub fn empty() -> Self {
        Self {
            raw: Bytes::from_static(&[alloy_rlp::EMPTY_LIST_CODE]),
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl Encodable for OpaqueList {
    fn encode(&self, out: &mut dyn BufMut) {
        out.put_slice(&self.raw);
    }

    fn length(&self) -> usize {
        self.raw.len()
    }
}

impl Decodable for OpaqueList {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let start = *buf;
        let header = alloy_rlp::Header::decode(buf)?;
        if !header.list {
            return Err(alloy_rlp::Error::UnexpectedString);
        }
        if buf.len() < header.payload_length {
            return Err(alloy_rlp::Error::InputTooShort);
        }
        let mut payload = &buf[..header.payload_length];
        let mut count = 0;
        while !payload.is_empty() {
            let item = alloy_rlp::Header::decode(&mut payload)?;
            if payload.len() < item.payload_length {
                return Err(alloy_rlp::Error::InputTooShort);
            }
            payload.advance(item.payload_length);
            count += 1;
        }
        buf.advance(header.payload_length);
        let consumed = start.len() - buf.len();
        Ok(Self {
            raw: Bytes::copy_from_slice(&start[..consumed]),
            count,
        })
    }
}

/// A decoded `eth` message.
#[derive(Debug, Clone, PartialEq)]
pub enum EthMessage {
    Status(Status),
    NewBlockHashes(NewBlockHashes),
    Transactions(Transactions<TransactionSigned>),
    GetBlockHeaders(RequestPair<GetBlockHeaders>),
    BlockHeaders(RequestPair<BlockHeaders<Header>>),
    GetBlockBodies(RequestPair<GetBlockBodies>),
    BlockBodies(RequestPair<BlockBodies<BlockBody>>),
    NewBlock(Box<NewBlock<Block>>),
    NewPooledTransactionHashes66(NewPooledTransactionHashes66),
    NewPooledTransactionHashes68(NewPooledTransactionHashes68),
    GetPooledTransactions(RequestPair<GetPooledTransactions>),
    PooledTransactions(RequestPair<PooledTransactions<PooledTransactionVariant>>),
    GetNodeData(RequestPair<GetNodeData>),
    NodeData(RequestPair<OpaqueList>),
    GetReceipts(RequestPair<GetReceipts>),
    Receipts(RequestPair<OpaqueList>),
}

impl EthMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Status(_) => MessageKind::Status,
            Self::NewBlockHashes(_) => MessageKind::NewBlockHashes,
            Self::Transactions(_) => MessageKind::Transactions,
            Self::GetBlockHeaders(_) => MessageKind::GetBlockHeaders,
            Self::BlockHeaders(_) => MessageKind::BlockHeaders,
            Self::GetBlockBodies(_) => MessageKind::GetBlockBodies,
            Self::BlockBodies(_) => MessageKind::BlockBodies,
            Self::NewBlock(_) => MessageKind::NewBlock,
            Self::NewPooledTransactionHashes66(_) | Self::NewPooledTransactionHashes68(_) => {
                MessageKind::NewPooledTransactionHashes
            }
            Self::GetPooledTransactions(_) => MessageKind::GetPooledTransactions,
            Self::PooledTransactions(_) => MessageKind::PooledTransactions,
            Self::GetNodeData(_) => MessageKind::GetNodeData,
            Self::NodeData(_) => MessageKind::NodeData,
            Self::GetReceipts(_) => MessageKind::GetReceipts,
            Self::Receipts(_) => MessageKind::Receipts,
        }
    }

    /// Number of items carried, used by the per-kind item counters.
    pub fn item_count(&self) -> usize {
        match self {
            Self::Status(_) | Self::NewBlock(_) | Self::GetBlockHeaders(_) => 1,
            Self::NewBlockHashes(msg) => msg.0.len(),
            Self::Transactions(msg) => msg.0.len(),
            Self::BlockHeaders(msg) => msg.message.0.len(),
            Self::GetBlockBodies(msg) => msg.message.0.len(),
            Self::BlockBodies(msg) => msg.message.0.len(),
            Self::NewPooledTransactionHashes66(msg) => msg.0.len(),
            Self::NewPooledTransactionHashes68(msg) => msg.hashes.len(),
            Self::GetPooledTransactions(msg) => msg.message.0.len(),
            Self::PooledTransactions(msg) => msg.message.0.len(),
            Self::GetNodeData(msg) => msg.message.0.len(),
            Self::NodeData(msg) => msg.message.len(),
            Self::GetReceipts(msg) => msg.message.0.len(),
            Self::Receipts(msg) => msg.message.len(),
        }
    }

    /// Message id byte followed by the RLP payload.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_u8(self.kind().id());
        match self {
            Self::Status(msg) => msg.encode(&mut out),
            Self::NewBlockHashes(msg) => msg.encode(&mut out),
            Self::Transactions(msg) => msg.encode(&mut out),
            Self::GetBlockHeaders(msg) => msg.encode(&mut out),
            Self::BlockHeaders(msg) => msg.encode(&mut out),
            Self::GetBlockBodies(msg) => msg.encode(&mut out),
            Self::BlockBodies(msg) => msg.encode(&mut out),
            Self::NewBlock(msg) => msg.encode(&mut out),
            Self::NewPooledTransactionHashes66(msg) => msg.encode(&mut out),
            Self::NewPooledTransactionHashes68(msg) => msg.encode(&mut out),
            Self::GetPooledTransactions(msg) => msg.encode(&mut out),
            Self::PooledTransactions(msg) => msg.encode(&mut out),
            Self::GetNodeData(msg) => msg.encode(&mut out),
            Self::NodeData(msg) => msg.encode(&mut out),
            Self::GetReceipts(msg) => msg.encode(&mut out),
            Self::Receipts(msg) => msg.encode(&mut out),
        }
        out.freeze().into()
    }
}

/// Decoder bound to one session's negotiated version.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    version: EthVersion,
    pooled_transactions_limit: usize,
}

impl Codec {
    pub fn new(version: EthVersion) -> Self {
        Self {
            version,
            pooled_transactions_limit: DEFAULT_POOLED_TRANSACTIONS_LIMIT,
        }
    }

    pub fn with_pooled_transactions_limit(mut self, limit: usize) -> Self {
        self.pooled_transactions_limit = limit;
        self
    }

    pub fn version(&self) -> EthVersion {
        self.version
    }

    pub fn decode(&self, frame: &[u8]) -> Result<EthMessage, CodecError> {
        let Some((&id, mut payload)) = frame.split_first() else {
            return Err(CodecError::MalformedFrame {
                kind: "empty",
                source: alloy_rlp::Error::InputTooShort,
            });
        };
        let kind = MessageKind::from_id(id, self.version).ok_or(CodecError::UnknownMessage {
            id,
            version: self.version as u8,
        })?;
        let buf = &mut payload;
        let message = match kind {
            MessageKind::Status => EthMessage::Status(decode_payload(kind, buf)?),
            MessageKind::NewBlockHashes => EthMessage::NewBlockHashes(decode_payload(kind, buf)?),
            MessageKind::Transactions => EthMessage::Transactions(decode_payload(kind, buf)?),
            MessageKind::GetBlockHeaders => EthMessage::GetBlockHeaders(decode_payload(kind, buf)?),
            MessageKind::BlockHeaders => {
                let msg: RequestPair<BlockHeaders<Header>> = decode_payload(kind, buf)?;
                check_limit(kind, msg.message.0.len(), MAX_HEADERS_RESPONSE)?;
                EthMessage::BlockHeaders(msg)
            }
            MessageKind::GetBlockBodies => EthMessage::GetBlockBodies(decode_payload(kind, buf)?),
            MessageKind::BlockBodies => {
                let msg: RequestPair<BlockBodies<BlockBody>> = decode_payload(kind, buf)?;
                check_limit(kind, msg.message.0.len(), MAX_BODIES_RESPONSE)?;
                EthMessage::BlockBodies(msg)
            }
            MessageKind::NewBlock => EthMessage::NewBlock(Box::new(decode_payload(kind, buf)?)),
            MessageKind::NewPooledTransactionHashes if self.version == EthVersion::Eth68 => {
                EthMessage::NewPooledTransactionHashes68(decode_payload(kind, buf)?)
            }
            MessageKind::NewPooledTransactionHashes => {
                EthMessage::NewPooledTransactionHashes66(decode_payload(kind, buf)?)
            }
            MessageKind::GetPooledTransactions => {
                EthMessage::GetPooledTransactions(decode_payload(kind, buf)?)
            }
            MessageKind::PooledTransactions => {
                let msg: RequestPair<PooledTransactions<PooledTransactionVariant>> =
                    decode_payload(kind, buf)?;
                check_limit(kind, msg.message.0.len(), self.pooled_transactions_limit)?;
                EthMessage::PooledTransactions(msg)
            }
            MessageKind::GetNodeData => EthMessage::GetNodeData(decode_payload(kind, buf)?),
            MessageKind::NodeData => {
                let msg: RequestPair<OpaqueList> = decode_payload(kind, buf)?;
                check_limit(kind, msg.message.len(), MAX_NODE_DATA_RESPONSE)?;
                EthMessage::NodeData(msg)
            }
            MessageKind::GetReceipts => EthMessage::GetReceipts(decode_payload(kind, buf)?),
            MessageKind::Receipts => {
                let msg: RequestPair<OpaqueList> = decode_payload(kind, buf)?;
                check_limit(kind, msg.message.len(), MAX_RECEIPTS_RESPONSE)?;
                EthMessage::Receipts(msg)
            }
        };
        if !buf.is_empty() {
            return Err(CodecError::MalformedFrame {
                kind: kind.name(),
                source: alloy_rlp::Error::UnexpectedLength,
            });
        }
        Ok(message)
    }
}

fn decode_payload<T: Decodable>(kind: MessageKind, buf: &mut &[u8]) -> Result<T, CodecError> {
    T::decode(buf).map_err(|source| CodecError::MalformedFrame {
        kind: kind.name(),
        source,
    })
}

fn check_limit(kind: MessageKind, count: usize, limit: usize) -> Result<(), CodecError> {
    if count > limit {
        return Err(CodecError::OversizedFrame {
            kind: kind.name(),
            count,
            limit,
        });
    }
    Ok(())
}
