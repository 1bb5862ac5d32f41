//! RLPx transport: TCP dial, ECIES handshake and `p2p` hello.

use alloy_primitives::{hex, keccak256, B256};
use eyre::{Result, WrapErr};
use reth_ecies::{stream::ECIESStream, ECIESError};
use reth_eth_wire::{
    errors::P2PStreamError, protocol::Protocol, EthVersion, HelloMessage,
    HelloMessageWithProtocols, P2PStream, UnauthedP2PStream,
};
use reth_network::config::rng_secret_key;
use reth_network_peers::{pk2id, NodeRecord, PeerId};
use secp256k1::SecretKey;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

/// Budget for TCP connect, ECIES and the `p2p` hello together.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_CLIENT_NAME: &str = concat!("devp2p-sensor/v", env!("CARGO_PKG_VERSION"));

/// Authenticated, framed connection carrying `eth` messages.
pub type Transport = P2PStream<ECIESStream<TcpStream>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("tcp connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("ecies handshake failed: {0}")]
    Ecies(#[source] ECIESError),
    #[error("p2p hello failed: {0}")]
    Hello(#[source] P2PStreamError),
    #[error("no shared eth capability")]
    NoSharedEth,
}

impl TransportError {
    /// Whether the failure happened before the remote spoke `p2p`.
    pub fn is_dial(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_) | Self::Ecies(_))
    }
}

/// Our identity on the network.
#[derive(Debug, Clone)]
pub struct LocalNode {
    secret_key: SecretKey,
    peer_id: PeerId,
    client_version: String,
    listen_port: u16,
}

impl LocalNode {
    pub fn new(secret_key: SecretKey, client_version: impl Into<String>) -> Self {
        Self {
            secret_key,
            peer_id: pk2id(&secret_key.public_key(secp256k1::SECP256K1)),
            client_version: client_version.into(),
            listen_port: 0,
        }
    }

    pub fn random(client_version: impl Into<String>) -> Self {
        Self::new(rng_secret_key(), client_version)
    }

    /// Load a hex secret key, generating and saving one when the file is missing.
    pub fn from_key_file(path: &Path, client_version: impl Into<String>) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read key file {}", path.display()))?;
            let secret_key = SecretKey::from_str(text.trim().trim_start_matches("0x"))
                .wrap_err_with(|| format!("invalid secret key in {}", path.display()))?;
            return Ok(Self::new(secret_key, client_version));
        }
        let secret_key = rng_secret_key();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, hex::encode(secret_key.secret_bytes()))
            .wrap_err_with(|| format!("failed to write key file {}", path.display()))?;
        info!(path = %path.display(), "generated node key");
        Ok(Self::new(secret_key, client_version))
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn secret_key(&self) -> SecretKey {
        self.secret_key
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn node_id(&self) -> B256 {
        keccak256(self.peer_id)
    }

    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port
    }

    pub fn record(&self, addr: SocketAddr) -> NodeRecord {
        NodeRecord::new(addr, self.peer_id)
    }

    /// Hello advertising eth/66, eth/67 and eth/68.
    pub fn hello(&self) -> HelloMessageWithProtocols {
        HelloMessage::builder(self.peer_id)
            .client_version(self.client_version.clone())
            .port(self.listen_port)
            .protocols([
                Protocol::eth(EthVersion::Eth66),
                Protocol::eth(EthVersion::Eth67),
                Protocol::eth(EthVersion::Eth68),
            ])
            .build()
    }
}

/// The remote `p2p` hello, flattened for snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u8,
    pub client_version: String,
    pub capabilities: Vec<String>,
    pub port: u16,
    pub id: PeerId,
}

impl From<&HelloMessage> for Hello {
    fn from(hello: &HelloMessage) -> Self {
        Self {
            protocol_version: hello.protocol_version as u8,
            client_version: hello.client_version.clone(),
            capabilities: hello
                .capabilities
                .iter()
                .map(|cap| format!("{}/{}", cap.name, cap.version))
                .collect(),
            port: hello.port,
            id: hello.id,
        }
    }
}

/// A connection past the `p2p` hello, with the negotiated `eth` version.
pub struct Connection {
    pub transport: Transport,
    pub hello: Hello,
    pub version: EthVersion,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("hello", &self.hello)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Dial `node` and run ECIES plus the `p2p` hello within [`DIAL_TIMEOUT`].
pub async fn connect(node: &NodeRecord, local: &LocalNode) -> Result<Connection, TransportError> {
    timeout(DIAL_TIMEOUT, async {
        let tcp = TcpStream::connect(node.tcp_addr())
            .await
            .map_err(TransportError::Connect)?;
        let ecies = ECIESStream::connect(tcp, local.secret_key(), node.id)
            .await
            .map_err(TransportError::Ecies)?;
        hello(ecies, local).await
    })
    .await
    .map_err(|_| TransportError::Timeout(DIAL_TIMEOUT))?
}

/// Accept an inbound connection and run the responder side of the handshakes.
pub async fn accept(tcp: TcpStream, local: &LocalNode) -> Result<Connection, TransportError> {
    timeout(DIAL_TIMEOUT, async {
        let ecies = ECIESStream::incoming(tcp, local.secret_key())
            .await
            .map_err(TransportError::Ecies)?;
        hello(ecies, local).await
    })
    .await
    .map_err(|_| TransportError::Timeout(DIAL_TIMEOUT))?
}

async fn hello(
    ecies: ECIESStream<TcpStream>,
    local: &LocalNode,
) -> Result<Connection, TransportError> {
    let (transport, their_hello) = UnauthedP2PStream::new(ecies)
        .handshake(local.hello())
        .await
        .map_err(TransportError::Hello)?;
    let version = negotiated_version(&transport)?;
    let hello = Hello::from(&their_hello);
    debug!(
        client = %hello.client_version,
        eth = version as u8,
        "p2p hello complete"
    );
    Ok(Connection {
        transport,
        hello,
        version,
    })
}

fn negotiated_version(transport: &Transport) -> Result<EthVersion, TransportError> {
    let shared = transport
        .shared_capabilities()
        .eth()
        .map_err(|_| TransportError::NoSharedEth)?;
    match EthVersion::try_from(shared.version()) {
        Ok(version @ (EthVersion::Eth66 | EthVersion::Eth67 | EthVersion::Eth68)) => Ok(version),
        _ => Err(TransportError::NoSharedEth),
    }
}

/// Enode URL for a record, the form used as the session dedupe key.
pub fn enode_url(node: &NodeRecord) -> String {
    node.to_string()
}

/// Hex node id, `keccak256(public key)`.
pub fn node_id_hex(id: &PeerId) -> String {
    hex::encode(keccak256(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;

    #[test]
    fn key_file_is_created_then_reused() {
        let dir = temp_dir("rlpx-key");
        let path = dir.join("node.key");
        let first = LocalNode::from_key_file(&path, "test/v1").expect("generate");
        let second = LocalNode::from_key_file(&path, "test/v1").expect("reload");
        assert_eq!(first.peer_id(), second.peer_id());
        assert_eq!(first.node_id(), keccak256(first.peer_id()));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn hello_advertises_three_eth_versions() {
        let local = LocalNode::random("test/v1").with_listen_port(30303);
        let hello = local.hello();
        assert_eq!(hello.port, 30303);
        assert_eq!(hello.client_version, "test/v1");
        let versions: Vec<usize> = hello
            .protocols
            .iter()
            .map(|protocol| protocol.cap.version)
            .collect();
        assert_eq!(versions, vec![66, 67, 68]);
    }

    #[tokio::test]
    async fn dial_to_closed_port_is_a_dial_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let local = LocalNode::random("test/v1");
        let remote = LocalNode::random("remote/v1");
        let err = connect(&remote.record(addr), &local)
            .await
            .expect_err("nothing listens");
        assert!(err.is_dial(), "{err}");
    }
}
