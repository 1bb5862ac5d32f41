//! JSON-RPC server exposing the sensor's peer view.

use crate::clock::rfc3339;
use crate::p2p::{BlockRef, LocalNode, PeerManager};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{Bytes, B256};
use eyre::{Result, WrapErr};
use jsonrpsee::{
    server::{ServerBuilder, ServerHandle},
    types::ErrorObjectOwned,
    RpcModule,
};
use reth_ethereum_primitives::TransactionSigned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

/// Everything the RPC methods read.
#[derive(Debug, Clone)]
pub struct RpcContext {
    pub manager: Arc<PeerManager>,
    pub local: Arc<LocalNode>,
    pub chain_id: u64,
    /// Address peers can reach us on, for the node info.
    pub listen_addr: SocketAddr,
}

impl RpcContext {
    fn enode(&self) -> String {
        self.local.record(self.listen_addr).to_string()
    }
}

#[derive(Debug, Serialize)]
pub struct PeerEntry {
    pub name: String,
    pub received: BTreeMap<String, u64>,
    pub sent: BTreeMap<String, u64>,
    pub packets_received: BTreeMap<String, u64>,
    pub packets_sent: BTreeMap<String, u64>,
    pub connected_at: String,
    pub duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct PeersReport {
    /// Not available from the discv4 service; always null.
    pub enr: Option<String>,
    pub enode: String,
    pub peer_count: usize,
    pub peers: BTreeMap<String, PeerEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_block: Option<BlockRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_block: Option<BlockRef>,
}

#[derive(Debug, Serialize)]
pub struct NodeInfo {
    pub enode: String,
    pub id: String,
    pub listen_addr: String,
}

/// Start the JSON-RPC server and return its handle.
pub async fn start(bind: SocketAddr, ctx: RpcContext) -> Result<ServerHandle> {
    let server = ServerBuilder::default()
        .build(bind)
        .await
        .wrap_err("failed to bind RPC server")?;
    let addr = server.local_addr().wrap_err("RPC server has no local address")?;
    info!(%addr, "RPC server listening");
    Ok(server.start(module(ctx)?))
}

pub fn peers_report(ctx: &RpcContext) -> PeersReport {
    let now = SystemTime::now();
    let peers: BTreeMap<String, PeerEntry> = ctx
        .manager
        .active_peers()
        .into_iter()
        .map(|peer| {
            let duration_seconds = now
                .duration_since(peer.connected_at)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0);
            let entry = PeerEntry {
                name: peer.hello.client_version,
                received: peer.counters.received,
                sent: peer.counters.sent,
                packets_received: peer.counters.packets_received,
                packets_sent: peer.counters.packets_sent,
                connected_at: rfc3339(peer.connected_at),
                duration_seconds,
            };
            (peer.url, entry)
        })
        .collect();
    PeersReport {
        enr: None,
        enode: ctx.enode(),
        peer_count: peers.len(),
        peers,
        head_block: ctx.manager.shared().head(),
        oldest_block: ctx.manager.shared().oldest(),
    }
}

fn invalid_params(message: impl Into<String>) -> ErrorObjectOwned {
    ErrorObjectOwned::owned(-32602, message.into(), None::<()>)
}

fn expect_no_params(params: Option<Value>, method: &str) -> Result<(), ErrorObjectOwned> {
    let empty = match params {
        None | Some(Value::Null) => true,
        Some(Value::Array(values)) => values.is_empty(),
        Some(Value::Object(values)) => values.is_empty(),
        Some(_) => false,
    };
    if empty {
        Ok(())
    } else {
        Err(invalid_params(format!("{method} expects no params")))
    }
}

pub fn module(ctx: RpcContext) -> Result<RpcModule<RpcContext>> {
    let mut module = RpcModule::new(ctx);
    module
        .register_method("eth_chainId", |params, ctx, _| {
            expect_no_params(params.parse()?, "eth_chainId")?;
            Ok::<_, ErrorObjectOwned>(format!("0x{:x}", ctx.chain_id))
        })
        .wrap_err("failed to register eth_chainId")?;

    module
        .register_method("sensor_peers", |params, ctx, _| {
            expect_no_params(params.parse()?, "sensor_peers")?;
            Ok::<_, ErrorObjectOwned>(peers_report(ctx))
        })
        .wrap_err("failed to register sensor_peers")?;

    module
        .register_method("sensor_nodeInfo", |params, ctx, _| {
            expect_no_params(params.parse()?, "sensor_nodeInfo")?;
            Ok::<_, ErrorObjectOwned>(NodeInfo {
                enode: ctx.enode(),
                id: format!("{:x}", ctx.local.node_id()),
                listen_addr: ctx.listen_addr.to_string(),
            })
        })
        .wrap_err("failed to register sensor_nodeInfo")?;

    module
        .register_method("eth_sendRawTransaction", |params, ctx, _| {
            let raw: Bytes = params.one()?;
            let tx = TransactionSigned::decode_2718(&mut raw.as_ref())
                .map_err(|err| invalid_params(format!("invalid transaction: {err}")))?;
            let hash: B256 = *tx.tx_hash();
            ctx.manager.shared().mark_tx(hash);
            let peers = ctx.manager.broadcast_tx(&[tx]);
            info!(%hash, peers, "broadcast raw transaction");
            Ok::<_, ErrorObjectOwned>(hash)
        })
        .wrap_err("failed to register eth_sendRawTransaction")?;

    Ok(module)
}
