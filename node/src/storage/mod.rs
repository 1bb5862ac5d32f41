//! MDBX-backed record store.

use eyre::{eyre, Result, WrapErr};
use reth_db::{
    mdbx::{init_db_for, DatabaseArguments, DatabaseEnv},
    ClientVersion, Database,
};
use reth_db_api::{
    cursor::DbCursorRO,
    transaction::{DbTx, DbTxMut},
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::Path;
use tracing::info;

mod tables {
    use reth_db_api::{table::TableInfo, tables, TableSet, TableType, TableViewer};
    use std::fmt;

    tables! {
        /// Store metadata.
        table Meta {
            type Key = String;
            type Value = Vec<u8>;
        }

        /// Blocks keyed by hash, merged on every write.
        table Blocks {
            type Key = String;
            type Value = Vec<u8>;
        }

        /// Append-only block announcements and first-seen markers.
        table BlockEvents {
            type Key = String;
            type Value = Vec<u8>;
        }

        /// Transactions keyed by hash.
        table Transactions {
            type Key = String;
            type Value = Vec<u8>;
        }

        /// Append-only transaction sightings.
        table TransactionEvents {
            type Key = String;
            type Value = Vec<u8>;
        }

        /// Latest snapshot per connected peer URL.
        table Peers {
            type Key = String;
            type Value = Vec<u8>;
        }

        /// Discovery node records keyed by node id.
        table Nodes {
            type Key = String;
            type Value = Vec<u8>;
        }
    }
}

const SCHEMA_VERSION: u64 = 1;
const META_SCHEMA_VERSION_KEY: &str = "schema_version";

/// Logical groups of rows in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Blocks,
    BlockEvents,
    Transactions,
    TransactionEvents,
    Peers,
    Nodes,
}

macro_rules! with_table {
    ($entity:expr, $table:ident => $body:expr) => {
        match $entity {
            Entity::Blocks => {
                type $table = tables::Blocks;
                $body
            }
            Entity::BlockEvents => {
                type $table = tables::BlockEvents;
                $body
            }
            Entity::Transactions => {
                type $table = tables::Transactions;
                $body
            }
            Entity::TransactionEvents => {
                type $table = tables::TransactionEvents;
                $body
            }
            Entity::Peers => {
                type $table = tables::Peers;
                $body
            }
            Entity::Nodes => {
                type $table = tables::Nodes;
                $body
            }
        }
    };
}

#[derive(Debug)]
pub struct Storage {
    db: DatabaseEnv,
}

impl Storage {
    /// Open the MDBX environment at `path` and bootstrap metadata if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let args = DatabaseArguments::new(ClientVersion::default());
        let db = init_db_for::<_, tables::Tables>(path, args)
            .wrap_err_with(|| format!("failed to open MDBX environment at {}", path.display()))?;
        let storage = Self { db };
        storage.bootstrap(path)?;
        Ok(storage)
    }

    fn bootstrap(&self, path: &Path) -> Result<()> {
        let tx = self.db.tx()?;
        let schema_bytes = tx.get::<tables::Meta>(META_SCHEMA_VERSION_KEY.to_string())?;
        tx.commit()?;

        match schema_bytes {
            None => {
                let tx = self.db.tx_mut()?;
                tx.put::<tables::Meta>(
                    META_SCHEMA_VERSION_KEY.to_string(),
                    encode_json(&SCHEMA_VERSION)?,
                )?;
                tx.commit()?;
                info!(db_path = %path.display(), "initialized record store");
                Ok(())
            }
            Some(bytes) => {
                let schema_version: u64 = decode_json(bytes)?;
                if schema_version != SCHEMA_VERSION {
                    return Err(eyre!(
                        "unsupported schema version {schema_version} (expected {SCHEMA_VERSION})"
                    ));
                }
                Ok(())
            }
        }
    }

    pub fn get<V: DeserializeOwned>(&self, entity: Entity, key: &str) -> Result<Option<V>> {
        let tx = self.db.tx()?;
        let bytes = with_table!(entity, T => tx.get::<T>(key.to_string())?);
        tx.commit()?;
        bytes.map(decode_json).transpose()
    }

    pub fn put<V: Serialize>(&self, entity: Entity, key: &str, value: &V) -> Result<()> {
        let bytes = encode_json(value)?;
        let tx = self.db.tx_mut()?;
        with_table!(entity, T => tx.put::<T>(key.to_string(), bytes)?);
        tx.commit()?;
        Ok(())
    }

    /// Write many rows of one entity in a single transaction.
    pub fn put_all<V: Serialize>(&self, entity: Entity, rows: &[(String, V)]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let tx = self.db.tx_mut()?;
        for (key, value) in rows {
            let bytes = encode_json(value)?;
            with_table!(entity, T => tx.put::<T>(key.clone(), bytes)?);
        }
        tx.commit()?;
        Ok(())
    }

    /// Read-modify-write of one row inside a single write transaction.
    pub fn update<V, F>(&self, entity: Entity, key: &str, update: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce(Option<V>) -> V,
    {
        let tx = self.db.tx_mut()?;
        let existing = with_table!(entity, T => tx.get::<T>(key.to_string())?);
        let current = existing.map(decode_json).transpose()?;
        let next = update(current);
        let bytes = encode_json(&next)?;
        with_table!(entity, T => tx.put::<T>(key.to_string(), bytes)?);
        tx.commit()?;
        Ok(next)
    }

    pub fn delete(&self, entity: Entity, key: &str) -> Result<bool> {
        let tx = self.db.tx_mut()?;
        let removed = with_table!(entity, T => tx.delete::<T>(key.to_string(), None)?);
        tx.commit()?;
        Ok(removed)
    }

    pub fn entries<V: DeserializeOwned>(&self, entity: Entity) -> Result<Vec<(String, V)>> {
        let tx = self.db.tx()?;
        let mut rows = Vec::new();
        with_table!(entity, T => {
            let mut cursor = tx.cursor_read::<T>()?;
            for row in cursor.walk(None)? {
                let (key, bytes) = row?;
                rows.push((key, decode_json(bytes)?));
            }
        });
        tx.commit()?;
        Ok(rows)
    }

    pub fn count(&self, entity: Entity) -> Result<usize> {
        let tx = self.db.tx()?;
        let count = with_table!(entity, T => tx.entries::<T>()?);
        tx.commit()?;
        Ok(count)
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).wrap_err("failed to serialize record")
}

fn decode_json<T: DeserializeOwned>(bytes: Vec<u8>) -> Result<T> {
    serde_json::from_slice(&bytes).wrap_err("failed to deserialize record")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::temp_dir;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct Row {
        value: u64,
    }

    #[test]
    fn put_get_delete_and_reopen() {
        let dir = temp_dir("storage");
        let storage = Storage::open(&dir).expect("open storage");
        storage
            .put(Entity::Peers, "enode://a", &Row { value: 1 })
            .expect("put");
        assert_eq!(
            storage.get::<Row>(Entity::Peers, "enode://a").expect("get"),
            Some(Row { value: 1 })
        );
        assert_eq!(storage.get::<Row>(Entity::Blocks, "enode://a").expect("get"), None);
        drop(storage);

        let storage = Storage::open(&dir).expect("reopen storage");
        assert_eq!(storage.count(Entity::Peers).expect("count"), 1);
        assert!(storage.delete(Entity::Peers, "enode://a").expect("delete"));
        assert_eq!(storage.count(Entity::Peers).expect("count"), 0);
        drop(storage);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn update_merges_in_one_row() {
        let dir = temp_dir("storage-update");
        let storage = Storage::open(&dir).expect("open storage");
        for _ in 0..3 {
            storage
                .update(Entity::Blocks, "0xabc", |row: Option<Row>| Row {
                    value: row.map_or(1, |row| row.value + 1),
                })
                .expect("update");
        }
        assert_eq!(storage.count(Entity::Blocks).expect("count"), 1);
        assert_eq!(
            storage.get::<Row>(Entity::Blocks, "0xabc").expect("get"),
            Some(Row { value: 3 })
        );

        storage
            .put_all(
                Entity::Nodes,
                &[
                    ("b".to_string(), Row { value: 2 }),
                    ("a".to_string(), Row { value: 1 }),
                ],
            )
            .expect("put all");
        let rows = storage.entries::<Row>(Entity::Nodes).expect("entries");
        assert_eq!(
            rows,
            vec![
                ("a".to_string(), Row { value: 1 }),
                ("b".to_string(), Row { value: 2 }),
            ]
        );
        drop(storage);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
