//! `crawl`: find nodes that speak `eth` and write them out.

use super::{discovery_inputs, driver_config, local_node, stop_on_ctrl_c, write_nodes_file};
use crate::cli::{Chain, CrawlArgs};
use crate::discovery::{Driver, Mode, DEFAULT_CRAWL_TIMEOUT};
use crate::p2p::codec::DEFAULT_POOLED_TRANSACTIONS_LIMIT;
use crate::p2p::{SessionConfig, StatusConfig, DEFAULT_CLIENT_NAME};
use eyre::Result;
use std::sync::Arc;
use tracing::info;

pub async fn run_crawl(args: CrawlArgs) -> Result<()> {
    let discovery = &args.discovery;
    let local = Arc::new(local_node(discovery, DEFAULT_CLIENT_NAME)?);
    let inputs = discovery_inputs(discovery, &local).await?;
    let timeout = discovery.timeout.unwrap_or(DEFAULT_CRAWL_TIMEOUT);
    info!(
        node_id = %local.node_id(),
        network_id = discovery.network_id,
        parallel = discovery.parallel,
        ?timeout,
        "starting crawl"
    );

    // The crawler never serves a chain, so it echoes whatever the remote announces.
    let status = StatusConfig::for_chain(&Chain::Mainnet.spec(), discovery.network_id).mirroring();
    let config = SessionConfig {
        local,
        status,
        pooled_transactions_limit: DEFAULT_POOLED_TRANSACTIONS_LIMIT,
    };
    let driver = Arc::new(Driver::new(
        Mode::Crawl(config),
        driver_config(discovery, Some(timeout)),
        inputs.store,
        inputs.resolver,
    ));

    let (_stop_tx, stop_rx) = stop_on_ctrl_c();
    let nodes = Arc::clone(&driver).run(inputs.sources, stop_rx).await;
    write_nodes_file(discovery, &nodes)?;

    let stats = driver.stats();
    info!(
        added = stats.added(),
        updated = stats.updated(),
        removed = stats.removed(),
        skipped_incompatible = stats.skipped_incompatible(),
        nodes = nodes.len(),
        "crawl finished"
    );
    Ok(())
}
