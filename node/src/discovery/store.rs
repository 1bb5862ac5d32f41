//! Node record store: score and liveness per node id.

use super::nodeset::NodeSet;
use crate::p2p::rlpx::node_id_hex;
use crate::storage::{Entity, Storage};
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use parking_lot::RwLock;
use reth_network_peers::NodeRecord;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// What we know about one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeEntry {
    /// Bumped every time the driver updates the entry.
    pub seq: u64,
    pub url: String,
    /// The `eth` fork id advertised in the node's ENR, once seen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    #[serde(default)]
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_response: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

impl NodeEntry {
    pub fn new(node: &NodeRecord) -> Self {
        Self {
            seq: 0,
            url: node.to_string(),
            record: None,
            score: 0,
            first_response: None,
            last_response: None,
            last_check: None,
        }
    }

    pub fn node(&self) -> Result<NodeRecord> {
        NodeRecord::from_str(&self.url).wrap_err_with(|| format!("invalid enode url {}", self.url))
    }

    /// Hex node id, or the URL when it no longer parses.
    pub fn id(&self) -> String {
        self.node()
            .map(|node| node_id_hex(&node.id))
            .unwrap_or_else(|_| self.url.clone())
    }
}

/// In-memory node table, optionally mirrored into MDBX.
#[derive(Debug)]
pub struct NodeStore {
    entries: RwLock<HashMap<String, NodeEntry>>,
    storage: Option<Storage>,
}

impl NodeStore {
    pub fn in_memory(seed: NodeSet) -> Self {
        Self {
            entries: RwLock::new(seed.0.into_iter().collect()),
            storage: None,
        }
    }

    /// Open the MDBX-backed store, seeding it with `seed` where it has no entry.
    pub fn open(path: &Path, seed: NodeSet) -> Result<Self> {
        let storage = Storage::open(path)?;
        let mut entries: HashMap<String, NodeEntry> = storage.entries(Entity::Nodes)?.into_iter().collect();
        let persisted = entries.len();
        for (id, entry) in seed.0 {
            entries.entry(id).or_insert(entry);
        }
        info!(path = %path.display(), persisted, total = entries.len(), "node store opened");
        Ok(Self {
            entries: RwLock::new(entries),
            storage: Some(storage),
        })
    }

    pub fn get(&self, id: &str) -> Option<NodeEntry> {
        self.entries.read().get(id).cloned()
    }

    pub fn upsert(&self, id: &str, entry: NodeEntry) -> Result<()> {
        if let Some(storage) = &self.storage {
            storage.put(Entity::Nodes, id, &entry)?;
        }
        self.entries.write().insert(id.to_string(), entry);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        if let Some(storage) = &self.storage {
            storage.delete(Entity::Nodes, id)?;
        }
        Ok(self.entries.write().remove(id).is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> NodeSet {
        NodeSet(
            self.entries
                .read()
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::LocalNode;
    use crate::test_utils::temp_dir;

    fn entry(port: u16) -> NodeEntry {
        NodeEntry::new(&LocalNode::random("t").record(([127, 0, 0, 1], port).into()))
    }

    #[test]
    fn snapshot_keys_match_entry_ids() {
        let store = NodeStore::in_memory(NodeSet::default());
        let first = entry(1000);
        let second = entry(1001);
        store.upsert(&first.id(), first.clone()).expect("upsert");
        store.upsert(&second.id(), second.clone()).expect("upsert");
        assert!(store.remove(&second.id()).expect("remove"));
        assert!(!store.remove(&second.id()).expect("remove again"));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        for (id, entry) in &snapshot.0 {
            assert_eq!(id, &entry.id());
        }
    }

    #[test]
    fn mdbx_store_survives_reopen() {
        let dir = temp_dir("node-store");
        let kept = entry(2000);
        {
            let store = NodeStore::open(&dir, NodeSet::default()).expect("open");
            let mut updated = kept.clone();
            updated.score = 4;
            store.upsert(&kept.id(), updated).expect("upsert");
        }
        let mut seed = NodeSet::default();
        seed.0.insert(kept.id(), kept.clone());
        let seed_only = entry(2001);
        seed.0.insert(seed_only.id(), seed_only.clone());

        let store = NodeStore::open(&dir, seed).expect("reopen");
        assert_eq!(store.get(&kept.id()).map(|e| e.score), Some(4));
        assert!(store.get(&seed_only.id()).is_some());
        assert_eq!(store.len(), 2);
        drop(store);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
