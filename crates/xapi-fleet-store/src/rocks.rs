//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use xapi_fleet_core::ServerId;

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::PoolRecord;
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

impl Store for RocksStore {
    fn put_server(&self, record: &PoolRecord) -> Result<()> {
        let cf_servers = self.cf(cf::SERVERS)?;
        let cf_by_host = self.cf(cf::SERVERS_BY_HOST)?;

        let server_key = keys::server_key(&record.id);
        let value = Self::serialize(record)?;

        // The host may have changed; drop the stale index entry.
        let old_host = self.get_server(&record.id)?.map(|r| r.host);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_servers, &server_key, &value);

        if let Some(old) = old_host {
            if old != record.host {
                batch.delete_cf(&cf_by_host, keys::host_server_key(&old, &record.id));
            }
        }
        batch.put_cf(&cf_by_host, keys::host_server_key(&record.host, &record.id), []);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(server_id = %record.id, host = %record.host, "Stored pool record");

        Ok(())
    }

    fn get_server(&self, server_id: &ServerId) -> Result<Option<PoolRecord>> {
        let cf = self.cf(cf::SERVERS)?;
        let key = keys::server_key(server_id);

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn delete_server(&self, server_id: &ServerId) -> Result<()> {
        let cf_servers = self.cf(cf::SERVERS)?;
        let cf_by_host = self.cf(cf::SERVERS_BY_HOST)?;

        let record = self.get_server(server_id)?.ok_or(StoreError::NotFound)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_servers, keys::server_key(server_id));
        batch.delete_cf(&cf_by_host, keys::host_server_key(&record.host, server_id));

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn list_servers(&self) -> Result<Vec<PoolRecord>> {
        let cf = self.cf(cf::SERVERS)?;

        let mut records = Vec::new();
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);

        for item in iter {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            records.push(Self::deserialize(&value)?);
        }

        Ok(records)
    }

    fn find_servers_by_host(&self, host: &str) -> Result<Vec<PoolRecord>> {
        let cf_by_host = self.cf(cf::SERVERS_BY_HOST)?;
        let prefix = keys::host_prefix(host);

        let mut records = Vec::new();
        let iter = self.db.iterator_cf(
            &cf_by_host,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;

            // Stop if we're past the prefix
            if !key.starts_with(&prefix) {
                break;
            }

            let Some(server_id) = keys::extract_server_id_from_host_key(&key) else {
                continue;
            };
            if let Some(record) = self.get_server(&server_id)? {
                records.push(record);
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn server_crud() {
        let (store, _dir) = create_test_store();
        let mut record = PoolRecord::new("h1", "u", "p", false);

        // Create
        store.put_server(&record).unwrap();

        // Read
        let retrieved = store.get_server(&record.id).unwrap().unwrap();
        assert_eq!(retrieved, record);

        // Update
        record.read_only = true;
        record.enabled = false;
        store.put_server(&record).unwrap();
        let updated = store.get_server(&record.id).unwrap().unwrap();
        assert!(updated.read_only);
        assert!(!updated.enabled);

        // Delete
        store.delete_server(&record.id).unwrap();
        assert!(store.get_server(&record.id).unwrap().is_none());
    }

    #[test]
    fn delete_missing_server() {
        let (store, _dir) = create_test_store();
        let result = store.delete_server(&ServerId::generate());
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[test]
    fn list_servers() {
        let (store, _dir) = create_test_store();
        store.put_server(&PoolRecord::new("h1", "u", "p", false)).unwrap();
        store.put_server(&PoolRecord::new("h2", "u", "p", true)).unwrap();

        assert_eq!(store.list_servers().unwrap().len(), 2);
    }

    #[test]
    fn host_index_follows_updates() {
        let (store, _dir) = create_test_store();
        let mut record = PoolRecord::new("h1", "u", "p", false);
        store.put_server(&record).unwrap();
        store.put_server(&PoolRecord::new("h10", "u", "p", false)).unwrap();

        assert_eq!(store.find_servers_by_host("h1").unwrap().len(), 1);

        record.host = "h2".to_string();
        store.put_server(&record).unwrap();

        assert!(store.find_servers_by_host("h1").unwrap().is_empty());
        let found = store.find_servers_by_host("h2").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, record.id);

        store.delete_server(&record.id).unwrap();
        assert!(store.find_servers_by_host("h2").unwrap().is_empty());
    }
}
