//! `sensor`: hold peer sessions and stream what they announce into the sink.

use super::{
    discovery_inputs, driver_config, local_node, stop_on_ctrl_c, write_nodes_file, DRAIN_BUDGET,
};
use crate::cli::SensorArgs;
use crate::discovery::{Driver, Mode};
use crate::p2p::{HandlerOptions, PeerManager, SessionConfig, StatusConfig};
use crate::rpc::{self, RpcContext};
use crate::sink::{Sink, WriteFlags};
use eyre::Result;
use reth_chainspec::ChainSpec;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

const PEER_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_sensor(args: SensorArgs) -> Result<()> {
    let chain = args.chain().spec();
    let status = status_config(&args, &chain);
    let local = Arc::new(local_node(&args.discovery, &args.client_name)?);

    let flags = WriteFlags {
        blocks: args.write_blocks,
        block_events: args.write_block_events,
        transactions: args.write_txs,
        transaction_events: args.write_tx_events,
        peers: args.write_peers,
    };
    let sink = Sink::open(
        &args.project_id,
        &args.data_dir,
        &args.sensor_id,
        flags,
        args.max_db_writes,
    )?;
    info!(
        sensor_id = %args.sensor_id,
        node_id = %local.node_id(),
        chain = ?args.chain(),
        network_id = status.network_id,
        genesis = %status.genesis,
        sink = sink.backend().name(),
        max_peers = args.max_peers,
        "starting sensor"
    );

    let manager = Arc::new(PeerManager::new(
        SessionConfig {
            local: Arc::clone(&local),
            status,
            pooled_transactions_limit: args.max_pooled_txs,
        },
        args.max_peers,
        sink.clone(),
        HandlerOptions {
            rebroadcast_blocks: args.rebroadcast_blocks,
            broadcast_txs: args.broadcast_txs,
        },
    ));
    let inputs = discovery_inputs(&args.discovery, &local).await?;

    let rpc_handle = match args.rpc_bind() {
        Some(bind) => {
            let ctx = RpcContext {
                manager: Arc::clone(&manager),
                local: Arc::clone(&local),
                chain_id: chain.chain.id(),
                listen_addr: SocketAddr::from(([0, 0, 0, 0], args.discovery.discovery_port)),
            };
            Some(rpc::start(bind, ctx).await?)
        }
        None => None,
    };

    let (_stop_tx, stop_rx) = stop_on_ctrl_c();
    let snapshots = flags
        .peers
        .then(|| spawn_peer_snapshots(Arc::clone(&manager), sink.clone(), stop_rx.clone()));

    let driver = Arc::new(Driver::new(
        Mode::Sensor(Arc::clone(&manager)),
        driver_config(&args.discovery, args.discovery.timeout),
        inputs.store,
        inputs.resolver,
    ));
    let nodes = driver.run(inputs.sources, stop_rx).await;

    if let Some(task) = snapshots {
        task.abort();
    }
    close_sessions(&manager, &sink).await;
    if !sink.drain(DRAIN_BUDGET).await {
        warn!(budget = ?DRAIN_BUDGET, "abandoning sink writes still in flight");
    }
    if let Err(err) = write_nodes_file(&args.discovery, &nodes) {
        warn!(error = %err, "final nodes file write failed");
    }
    if let Some(handle) = rpc_handle {
        if handle.stop().is_ok() {
            handle.stopped().await;
        }
    }

    let stats = sink.stats();
    info!(
        records = stats.records_written.load(Ordering::Relaxed),
        failed = stats.failed_writes.load(Ordering::Relaxed),
        abandoned = stats.abandoned_writes.load(Ordering::Relaxed),
        pool_full = manager.pool_full_count(),
        nodes = nodes.len(),
        "sensor stopped"
    );
    Ok(())
}

/// Status announced to peers. Naming a chain or a genesis hash pins the genesis
/// check even when any network id is accepted.
fn status_config(args: &SensorArgs, chain: &ChainSpec) -> StatusConfig {
    let status = StatusConfig::for_chain(chain, args.discovery.network_id);
    match (args.genesis_hash, args.chain) {
        (Some(genesis), _) => status.with_genesis(genesis),
        (None, Some(_)) => status.pin_genesis(),
        (None, None) => status,
    }
}

/// Close every session, then record the peers they held as the last snapshot.
async fn close_sessions(manager: &PeerManager, sink: &Sink) {
    let final_peers = manager.active_peers();
    manager.close_all().await;
    sink.write_peers(&final_peers, SystemTime::now()).await;
}

fn spawn_peer_snapshots(
    manager: Arc<PeerManager>,
    sink: Sink,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(PEER_SNAPSHOT_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let peers = manager.active_peers();
                    if !peers.is_empty() {
                        sink.write_peers(&peers, SystemTime::now()).await;
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
