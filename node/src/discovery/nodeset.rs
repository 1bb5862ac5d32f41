//! The persisted nodes file.

use super::store::NodeEntry;
use eyre::{eyre, Result, WrapErr};
use reth_network_peers::NodeRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Node entries keyed by hex node id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeSet(pub BTreeMap<String, NodeEntry>);

impl NodeSet {
    /// Read a nodes file. A missing file is an empty set; a JSON array is read
    /// as a list of enode URLs.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read nodes file {}", path.display()))?;
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: serde_json::Value = serde_json::from_str(&text)
            .wrap_err_with(|| format!("nodes file {} is not JSON", path.display()))?;
        match value {
            serde_json::Value::Array(urls) => Ok(Self::from_urls(
                urls.iter().filter_map(serde_json::Value::as_str),
            )),
            value @ serde_json::Value::Object(_) => serde_json::from_value(value)
                .wrap_err_with(|| format!("invalid nodes file {}", path.display())),
            _ => Err(eyre!(
                "nodes file {} must hold an object or an array",
                path.display()
            )),
        }
    }

    pub fn from_urls<'a>(urls: impl IntoIterator<Item = &'a str>) -> Self {
        let mut set = Self::default();
        for url in urls {
            if url.is_empty() {
                continue;
            }
            match NodeRecord::from_str(url) {
                Ok(node) => {
                    let entry = NodeEntry::new(&node);
                    set.0.insert(entry.id(), entry);
                }
                Err(err) => warn!(url, error = %err, "skipping unparsable enode"),
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Records in node id order.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        self.0
            .values()
            .filter_map(|entry| entry.node().ok())
            .collect()
    }

    pub fn urls(&self) -> Vec<String> {
        self.0.values().map(|entry| entry.url.clone()).collect()
    }

    /// Write the full set; `-` writes to stdout.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)
    }

    /// Write only the enode URLs, as a JSON array.
    pub fn save_urls(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.urls())?;
        write_atomic(path, &bytes)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if path.as_os_str() == "-" {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(bytes)?;
        stdout.write_all(b"\n")?;
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes)
        .wrap_err_with(|| format!("failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .wrap_err_with(|| format!("failed to move nodes file into {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::LocalNode;
    use crate::test_utils::temp_dir;
    use chrono::DateTime;

    fn sample_entry(port: u16) -> NodeEntry {
        let node = LocalNode::random("t").record(([10, 0, 0, 1], port).into());
        let mut entry = NodeEntry::new(&node);
        entry.seq = 3;
        entry.score = 2;
        entry.first_response = DateTime::from_timestamp(1_700_000_000, 0);
        entry.last_check = entry.first_response;
        entry
    }

    #[test]
    fn saved_set_loads_back_with_rfc3339_times() {
        let dir = temp_dir("nodeset-roundtrip");
        let path = dir.join("nodes.json");
        let entry = sample_entry(30303);
        let mut set = NodeSet::default();
        set.0.insert(entry.id(), entry.clone());
        set.save(&path).expect("save");

        let text = fs::read_to_string(&path).expect("read");
        assert!(text.contains(r#""firstResponse": "2023-11-14T22:13:20Z""#), "{text}");
        assert!(!text.contains("lastResponse"));
        assert!(!path.with_extension("tmp").exists());

        let loaded = NodeSet::load(&path).expect("load");
        assert_eq!(loaded.0.get(&entry.id()), Some(&entry));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn url_array_is_accepted_as_input() {
        let dir = temp_dir("nodeset-urls");
        let path = dir.join("static.json");
        let entry = sample_entry(30304);
        fs::write(&path, serde_json::to_vec(&vec![entry.url.clone(), "garbage".into()]).expect("json"))
            .expect("write");

        let loaded = NodeSet::load(&path).expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.urls(), vec![entry.url.clone()]);
        assert_eq!(loaded.nodes().len(), 1);

        loaded.save_urls(&path).expect("save urls");
        let urls: Vec<String> = serde_json::from_slice(&fs::read(&path).expect("read")).expect("array");
        assert_eq!(urls, vec![entry.url]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = temp_dir("nodeset-missing");
        assert!(NodeSet::load(&dir.join("absent.json")).expect("load").is_empty());
        let _ = fs::remove_dir_all(&dir);
    }
}
