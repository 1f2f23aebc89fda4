//! Domain types stored in the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xapi_fleet_core::ServerId;

/// A registered pool endpoint.
///
/// The password is stored as given. There is no token-based alternative on
/// the remote side, so the record must carry what the login call needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolRecord {
    /// Unique identifier for the registration.
    pub id: ServerId,
    /// Address of the pool master (`host` or `host:port`, or a full URL).
    pub host: String,
    /// Login name.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Whether the connection must refuse state-changing calls.
    #[serde(default)]
    pub read_only: bool,
    /// Whether the server is connected automatically on start.
    #[serde(default)]
    pub enabled: bool,
    /// Registration timestamp.
    pub created_at: DateTime<Utc>,
    /// Last modification timestamp.
    pub updated_at: DateTime<Utc>,
}

impl PoolRecord {
    /// Create a new enabled record with a fresh ID.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        read_only: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ServerId::generate(),
            host: host.into(),
            username: username.into(),
            password: password.into(),
            read_only,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_enabled() {
        let record = PoolRecord::new("h1", "u", "p", false);
        assert!(record.enabled);
        assert!(!record.read_only);
        assert_eq!(record.created_at, record.updated_at);
    }
}
