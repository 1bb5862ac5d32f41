//! Shared fixtures: temp dirs, chain objects and an in-process `eth` peer.

use crate::p2p::codec::{Codec, EthMessage, Status};
use crate::p2p::rlpx::{self, LocalNode};
use crate::p2p::StatusConfig;
use alloy_consensus::{SignableTransaction, TxLegacy};
use alloy_eips::BlockHashOrNumber;
use alloy_primitives::{Address, Bytes, Signature, TxKind, B256, U256};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use reth_chainspec::MAINNET;
use reth_eth_wire::{DisconnectReason, EthVersion};
use reth_eth_wire_types::{BlockHashNumber, BlockHeaders, NewBlockHashes, RequestPair};
use reth_ethereum_primitives::{Block, BlockBody, TransactionSigned};
use reth_network_peers::NodeRecord;
use reth_primitives_traits::Header;
use secp256k1::{Message, SecretKey, SECP256K1};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub fn temp_dir(prefix: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time moves forward")
        .as_nanos();
    let suffix = COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "devp2p-sensor-{prefix}-test-{now}-{}-{suffix}",
        std::process::id()
    ));
    std::fs::create_dir_all(&path).expect("create temp dir");
    path
}

/// In-memory writer whose contents stay readable after it is boxed.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.0.lock())
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Legacy transfer signed with a fixed key.
pub fn signed_legacy_tx(chain_id: u64, nonce: u64) -> TransactionSigned {
    let tx = TxLegacy {
        chain_id: Some(chain_id),
        nonce,
        gas_price: 1_000_000_000,
        gas_limit: 21_000,
        to: TxKind::Call(Address::repeat_byte(0x11)),
        value: U256::from(1_000u64),
        input: Bytes::new(),
    };
    let secret = SecretKey::from_slice(&[0x42; 32]).expect("valid key");
    let digest = Message::from_digest(tx.signature_hash().0);
    let (recovery_id, compact) = SECP256K1
        .sign_ecdsa_recoverable(&digest, &secret)
        .serialize_compact();
    let signature = Signature::new(
        U256::from_be_slice(&compact[..32]),
        U256::from_be_slice(&compact[32..]),
        i32::from(recovery_id) != 0,
    );
    TransactionSigned::Legacy(tx.into_signed(signature))
}

/// Pre-London header at `number`.
pub fn header_at(number: u64) -> Header {
    Header {
        parent_hash: B256::left_padding_from(&number.saturating_sub(1).to_be_bytes()),
        number,
        gas_limit: 30_000_000,
        gas_used: 21_000,
        timestamp: 1_600_000_000 + number * 12,
        difficulty: U256::from(1_000u64),
        ..Default::default()
    }
}

/// Block at `number` carrying one legacy transaction.
pub fn test_block(number: u64) -> Block {
    Block {
        header: header_at(number),
        body: BlockBody {
            transactions: vec![signed_legacy_tx(1, number)],
            ommers: Vec::new(),
            withdrawals: None,
        },
    }
}

pub fn test_status_config(network_id: u64) -> StatusConfig {
    StatusConfig::for_chain(&MAINNET, network_id)
}

/// Mainnet-shaped eth/68 status on `network_id`.
pub fn test_status(network_id: u64) -> Status {
    Status {
        network_id,
        ..test_status_config(1).local_status(EthVersion::Eth68)
    }
}

/// How a [`MockPeer`] answers requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockScript {
    /// Answer GetBlockHeaders by number with [`header_at`].
    pub serve_headers: bool,
    /// Once the dialer's status arrives, send this many single-hash
    /// NewBlockHashes and hang up.
    pub burst: usize,
}

impl MockScript {
    pub fn serving_headers() -> Self {
        Self {
            serve_headers: true,
            ..Self::default()
        }
    }

    pub fn bursting(burst: usize) -> Self {
        Self {
            burst,
            ..Self::default()
        }
    }
}

/// Hash announced by the `index`th message of a [`MockScript::bursting`] peer.
pub fn burst_hash(index: usize) -> B256 {
    B256::left_padding_from(&(index as u64 + 1).to_be_bytes())
}

#[derive(Debug, Default)]
struct Observed {
    status: Mutex<Option<Status>>,
    notify: Notify,
}

/// A local peer that completes RLPx, sends its status first and then follows a
/// [`MockScript`]. Accepts any number of connections until dropped.
#[derive(Debug)]
pub struct MockPeer {
    record: NodeRecord,
    observed: Arc<Observed>,
    task: JoinHandle<()>,
}

impl MockPeer {
    pub async fn spawn(status: Status, script: MockScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock peer");
        let addr = listener.local_addr().expect("mock peer addr");
        let local = Arc::new(LocalNode::random("mock-peer/v1").with_listen_port(addr.port()));
        let record = local.record(addr);
        let observed = Arc::new(Observed::default());
        let task = {
            let observed = Arc::clone(&observed);
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        tcp,
                        Arc::clone(&local),
                        status,
                        script,
                        Arc::clone(&observed),
                    ));
                }
            })
        };
        Self {
            record,
            observed,
            task,
        }
    }

    pub fn record(&self) -> NodeRecord {
        self.record
    }

    /// The status we were sent, waiting up to five seconds for it.
    pub async fn received_status(&self) -> Option<Status> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let notified = self.observed.notify.notified();
                if let Some(status) = *self.observed.status.lock() {
                    return status;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    tcp: TcpStream,
    local: Arc<LocalNode>,
    status: Status,
    script: MockScript,
    observed: Arc<Observed>,
) {
    let Ok(connection) = rlpx::accept(tcp, &local).await else {
        return;
    };
    let mut transport = connection.transport;
    let codec = Codec::new(connection.version);
    let status = Status {
        version: connection.version as u8,
        ..status
    };
    if transport
        .send(EthMessage::Status(status).encode().into())
        .await
        .is_err()
    {
        return;
    }
    while let Some(Ok(frame)) = transport.next().await {
        let Ok(message) = codec.decode(&frame) else {
            continue;
        };
        match message {
            EthMessage::Status(theirs) => {
                *observed.status.lock() = Some(theirs);
                observed.notify.notify_waiters();
                if script.burst > 0 {
                    for index in 0..script.burst {
                        let announce = EthMessage::NewBlockHashes(NewBlockHashes(vec![BlockHashNumber {
                            hash: burst_hash(index),
                            number: index as u64,
                        }]));
                        if transport.send(announce.encode().into()).await.is_err() {
                            return;
                        }
                    }
                    let _ = transport.disconnect(DisconnectReason::ClientQuitting).await;
                    return;
                }
            }
            EthMessage::GetBlockHeaders(request) if script.serve_headers => {
                let headers = match request.message.start_block {
                    BlockHashOrNumber::Number(start) => {
                        (start..start + request.message.limit).map(header_at).collect()
                    }
                    BlockHashOrNumber::Hash(_) => Vec::new(),
                };
                let reply = EthMessage::BlockHeaders(RequestPair {
                    request_id: request.request_id,
                    message: BlockHeaders(headers),
                });
                if transport.send(reply.encode().into()).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}
