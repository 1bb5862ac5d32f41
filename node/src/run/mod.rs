//! Run orchestration for the `crawl` and `sensor` subcommands.
//!
//! - `crawl`: dial candidates, keep the ones that answer, write the nodes file
//! - `sensor`: hold sessions through the session manager and record traffic

mod crawl;
mod sensor;

pub use crawl::run_crawl;
pub use sensor::run_sensor;

use crate::cli::DiscoveryArgs;
use crate::discovery::{
    parse_bootnodes, start_discv4, DriverConfig, EnrResolver, NoEnr, NodeIterator, NodeSet,
    NodeStore, StaticNodes,
};
use crate::p2p::LocalNode;
use eyre::{Result, WrapErr};
use reth_network_peers::NodeRecord;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Budget for in-flight sink writes at shutdown.
pub const DRAIN_BUDGET: Duration = Duration::from_secs(30);

/// Stop signal flipped by ctrl-c.
pub(crate) fn stop_on_ctrl_c() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    let (stop_tx, stop_rx) = watch::channel(false);
    let signal_tx = stop_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("shutdown signal received");
                let _ = signal_tx.send(true);
            }
            Err(err) => warn!(error = %err, "failed to listen for ctrl-c"),
        }
    });
    (stop_tx, stop_rx)
}

pub(crate) fn local_node(args: &DiscoveryArgs, client_name: &str) -> Result<LocalNode> {
    let node = match &args.key_file {
        Some(path) => LocalNode::from_key_file(path, client_name)?,
        None => LocalNode::random(client_name),
    };
    Ok(node.with_listen_port(args.discovery_port))
}

/// What the driver reads from: the seeded node table plus its candidate sources.
pub(crate) struct Inputs {
    pub store: Arc<NodeStore>,
    pub sources: Vec<Box<dyn NodeIterator>>,
    pub resolver: Arc<dyn EnrResolver>,
}

pub(crate) async fn discovery_inputs(args: &DiscoveryArgs, local: &LocalNode) -> Result<Inputs> {
    let bootnodes = parse_bootnodes(&args.bootnodes)?;
    let seed = NodeSet::load(&args.nodes_file)?;
    info!(
        bootnodes = bootnodes.len(),
        known = seed.len(),
        nodes_file = %args.nodes_file.display(),
        "loaded discovery inputs"
    );

    let store = match &args.database {
        Some(path) => NodeStore::open(path, seed.clone())
            .wrap_err_with(|| format!("failed to open node store {}", path.display()))?,
        None => NodeStore::in_memory(seed.clone()),
    };

    let known: Vec<NodeRecord> = bootnodes.iter().copied().chain(seed.nodes()).collect();
    let mut sources: Vec<Box<dyn NodeIterator>> = vec![Box::new(StaticNodes::new(known))];
    let resolver: Arc<dyn EnrResolver> = if args.no_discovery {
        Arc::new(NoEnr)
    } else {
        let (nodes, resolver) = start_discv4(local, args.discovery_port, &bootnodes).await?;
        sources.push(Box::new(nodes));
        Arc::new(resolver)
    };

    Ok(Inputs {
        store: Arc::new(store),
        sources,
        resolver,
    })
}

/// Driver settings from the shared flags. Incremental nodes-file writes are
/// full entries, so they are skipped when only URLs are wanted.
pub(crate) fn driver_config(args: &DiscoveryArgs, timeout: Option<Duration>) -> DriverConfig {
    DriverConfig {
        parallel: args.parallel,
        revalidation_interval: args.revalidation_interval,
        timeout,
        nodes_file: (!args.only_urls).then(|| args.nodes_file.clone()),
    }
}

/// Final nodes-file write, as URLs or full entries.
pub(crate) fn write_nodes_file(args: &DiscoveryArgs, nodes: &NodeSet) -> Result<()> {
    let result = if args.only_urls {
        nodes.save_urls(&args.nodes_file)
    } else {
        nodes.save(&args.nodes_file)
    };
    result.wrap_err_with(|| format!("failed to write nodes file {}", args.nodes_file.display()))?;
    info!(
        nodes = nodes.len(),
        only_urls = args.only_urls,
        path = %args.nodes_file.display(),
        "nodes file written"
    );
    Ok(())
}
