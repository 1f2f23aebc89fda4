//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary pool records, keyed by `server_id`.
    pub const SERVERS: &str = "servers";

    /// Index: servers by host, keyed by `host || 0x00 || server_id`.
    pub const SERVERS_BY_HOST: &str = "servers_by_host";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::SERVERS, cf::SERVERS_BY_HOST]
}
