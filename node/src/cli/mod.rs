//! Command line parsing.

use alloy_primitives::B256;
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use reth_chainspec::{ChainSpec, HOLESKY, MAINNET, SEPOLIA};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::discovery::{DEFAULT_DISCOVERY_PORT, DEFAULT_PARALLEL};
use crate::p2p::codec::DEFAULT_POOLED_TRANSACTIONS_LIMIT;
use crate::p2p::manager::DEFAULT_MAX_PEERS;
use crate::p2p::DEFAULT_CLIENT_NAME;
use crate::sink::DEFAULT_MAX_CONCURRENT_WRITES;

pub const DEFAULT_PPROF_PORT: u16 = 6060;

#[derive(Parser, Debug, Clone)]
#[command(name = "devp2p-sensor", version, about = "Ethereum devp2p crawler and peer-network sensor")]
pub struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn from_args() -> Self {
        Self::parse()
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Crawl the network and write the nodes that answered.
    Crawl(CrawlArgs),
    /// Hold peer sessions and record what they announce.
    Sensor(SensorArgs),
}

/// Chain presets for the status exchange.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Chain {
    #[default]
    Mainnet,
    Sepolia,
    Holesky,
}

impl Chain {
    pub fn spec(self) -> Arc<ChainSpec> {
        match self {
            Self::Mainnet => MAINNET.clone(),
            Self::Sepolia => SEPOLIA.clone(),
            Self::Holesky => HOLESKY.clone(),
        }
    }
}

/// Flags shared by `crawl` and `sensor`.
#[derive(Args, Debug, Clone)]
pub struct DiscoveryArgs {
    /// Nodes file read at start and rewritten as nodes are revalidated.
    pub nodes_file: PathBuf,
    /// Comma separated enode or ENR bootnodes.
    #[arg(short = 'b', long, required = true)]
    pub bootnodes: String,
    /// Total run time (crawl defaults to 30m0s; sensor runs until interrupted).
    #[arg(short = 't', long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,
    /// Concurrent candidate workers.
    #[arg(short = 'p', long, default_value_t = DEFAULT_PARALLEL)]
    pub parallel: usize,
    /// Only keep peers on this network; 0 accepts any.
    #[arg(short = 'n', long, default_value_t = 0)]
    pub network_id: u64,
    /// MDBX node-record store directory.
    #[arg(short = 'd', long)]
    pub database: Option<PathBuf>,
    /// Minimum time between checks of the same node.
    #[arg(short = 'r', long, default_value = "10m", value_parser = humantime::parse_duration)]
    pub revalidation_interval: Duration,
    /// Write bare enode URLs instead of full node entries at the end of a crawl.
    #[arg(short = 'u', long, default_value_t = true, action = ArgAction::Set)]
    pub only_urls: bool,
    /// UDP port for discv4, also advertised as the TCP port.
    #[arg(long, default_value_t = DEFAULT_DISCOVERY_PORT)]
    pub discovery_port: u16,
    /// Hex secp256k1 key file; generated when missing.
    #[arg(short = 'k', long)]
    pub key_file: Option<PathBuf>,
    /// Skip discv4 and only contact bootnodes and nodes-file entries.
    #[arg(long, default_value_t = false)]
    pub no_discovery: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CrawlArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,
}

#[derive(Args, Debug, Clone)]
pub struct SensorArgs {
    #[command(flatten)]
    pub discovery: DiscoveryArgs,
    /// Identifier stamped on every record.
    #[arg(short = 's', long, required = true)]
    pub sensor_id: String,
    /// Peer session ceiling.
    #[arg(short = 'm', long, default_value_t = DEFAULT_MAX_PEERS)]
    pub max_peers: usize,
    /// Concurrent sink writes.
    #[arg(short = 'D', long, default_value_t = DEFAULT_MAX_CONCURRENT_WRITES)]
    pub max_db_writes: usize,
    #[arg(short = 'B', long, default_value_t = true, action = ArgAction::Set)]
    pub write_blocks: bool,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub write_block_events: bool,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub write_txs: bool,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub write_tx_events: bool,
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub write_peers: bool,
    /// Record-store name under the data directory; empty writes JSON lines to stdout.
    #[arg(short = 'P', long, default_value = "")]
    pub project_id: String,
    /// Base directory for record stores.
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,
    /// Serve the JSON-RPC surface on the pprof port.
    #[arg(long, default_value_t = false)]
    pub pprof: bool,
    #[arg(long, default_value_t = DEFAULT_PPROF_PORT)]
    pub pprof_port: u16,
    /// Serve the JSON-RPC surface on this port.
    #[arg(long)]
    pub api_port: Option<u16>,
    /// Chain preset; naming one pins its genesis even with `--network-id 0`.
    #[arg(long, value_enum)]
    pub chain: Option<Chain>,
    /// Override the chain preset's genesis hash and pin it.
    #[arg(long)]
    pub genesis_hash: Option<B256>,
    /// Relay full blocks to a square root share of peers.
    #[arg(long, default_value_t = false)]
    pub rebroadcast_blocks: bool,
    /// Relay first-seen transactions to every other peer.
    #[arg(long, default_value_t = false)]
    pub broadcast_txs: bool,
    /// Largest PooledTransactions response accepted.
    #[arg(long, default_value_t = DEFAULT_POOLED_TRANSACTIONS_LIMIT)]
    pub max_pooled_txs: usize,
    /// Client name sent in the hello.
    #[arg(long, default_value = DEFAULT_CLIENT_NAME)]
    pub client_name: String,
}

impl SensorArgs {
    pub fn chain(&self) -> Chain {
        self.chain.unwrap_or_default()
    }

    /// Where the JSON-RPC server binds, if enabled.
    pub fn rpc_bind(&self) -> Option<SocketAddr> {
        let port = match (self.api_port, self.pprof) {
            (Some(port), _) => port,
            (None, true) => self.pprof_port,
            (None, false) => return None,
        };
        Some(SocketAddr::from(([127, 0, 0, 1], port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_accept_unit_suffixes() {
        let cli = Cli::try_parse_from([
            "devp2p-sensor",
            "crawl",
            "nodes.json",
            "-b",
            "enode://x",
            "--timeout",
            "1h30m",
            "--revalidation-interval",
            "30m0s",
        ])
        .expect("parse");
        let Command::Crawl(args) = cli.command else {
            panic!("expected crawl");
        };
        assert_eq!(args.discovery.timeout, Some(Duration::from_secs(5400)));
        assert_eq!(args.discovery.revalidation_interval, Duration::from_secs(1800));

        for bad in ["soon", "3 fortnights", ""] {
            assert!(
                Cli::try_parse_from(["devp2p-sensor", "crawl", "n.json", "-b", "enode://x", "-t", bad]).is_err(),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn crawl_defaults() {
        let cli = Cli::try_parse_from(["devp2p-sensor", "crawl", "nodes.json", "--bootnodes", "enode://x"])
            .expect("parse");
        let Command::Crawl(args) = cli.command else {
            panic!("expected crawl");
        };
        assert_eq!(args.discovery.parallel, 16);
        assert_eq!(args.discovery.network_id, 0);
        assert_eq!(args.discovery.revalidation_interval, Duration::from_secs(600));
        assert!(args.discovery.only_urls);
        assert_eq!(args.discovery.timeout, None);
    }

    #[test]
    fn sensor_requires_id_and_parses_flags() {
        assert!(Cli::try_parse_from(["devp2p-sensor", "sensor", "n.json", "-b", "enode://x"]).is_err());

        let cli = Cli::try_parse_from([
            "devp2p-sensor",
            "-vv",
            "sensor",
            "n.json",
            "-b",
            "enode://x",
            "--sensor-id",
            "s1",
            "--write-txs",
            "false",
            "--chain",
            "sepolia",
            "--pprof",
        ])
        .expect("parse");
        assert_eq!(cli.verbose, 2);
        let Command::Sensor(args) = cli.command else {
            panic!("expected sensor");
        };
        assert_eq!(args.sensor_id, "s1");
        assert!(!args.write_txs);
        assert!(args.write_blocks);
        assert_eq!(args.chain, Some(Chain::Sepolia));
        assert_eq!(args.chain(), Chain::Sepolia);
        assert_eq!(args.max_peers, 200);
        assert_eq!(args.rpc_bind(), Some(SocketAddr::from(([127, 0, 0, 1], 6060))));
    }
}
