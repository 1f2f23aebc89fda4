//! `RocksDB` storage layer for xapi-fleet.
//!
//! This crate persists pool registrations (`PoolRecord`) using `RocksDB`
//! with column families for indexing.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `servers`: Primary pool records, keyed by `server_id`
//! - `servers_by_host`: Index for finding registrations by host
//!
//! # Example
//!
//! ```no_run
//! use xapi_fleet_store::{PoolRecord, RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/xapi-fleet-db").unwrap();
//!
//! let record = PoolRecord::new("xen1.example.org", "root", "secret", false);
//! store.put_server(&record).unwrap();
//!
//! let servers = store.list_servers().unwrap();
//! assert_eq!(servers.len(), 1);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::PoolRecord;

use xapi_fleet_core::ServerId;

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (e.g., `RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    /// Insert or update a pool record.
    ///
    /// This also maintains the host index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_server(&self, record: &PoolRecord) -> Result<()>;

    /// Get a pool record by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_server(&self, server_id: &ServerId) -> Result<Option<PoolRecord>>;

    /// Delete a pool record by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the record doesn't exist.
    fn delete_server(&self, server_id: &ServerId) -> Result<()>;

    /// List all pool records.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_servers(&self) -> Result<Vec<PoolRecord>>;

    /// List the pool records registered for a host.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_servers_by_host(&self, host: &str) -> Result<Vec<PoolRecord>>;
}
