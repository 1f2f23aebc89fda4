//! Key encoding utilities for `RocksDB`.
//!
//! Host index keys are `host || 0x00 || server_id` so that a prefix scan on
//! `host || 0x00` never matches a longer host sharing the same leading bytes.

use xapi_fleet_core::ServerId;

const SEPARATOR: u8 = 0x00;

/// Encode a server key (just the server ID bytes).
#[must_use]
pub fn server_key(server_id: &ServerId) -> Vec<u8> {
    server_id.as_bytes().to_vec()
}

/// Encode a host-server index key: `host || 0x00 || server_id`.
#[must_use]
pub fn host_server_key(host: &str, server_id: &ServerId) -> Vec<u8> {
    let mut key = host_prefix(host);
    key.extend_from_slice(server_id.as_bytes());
    key
}

/// Encode a host prefix for scanning all servers registered for a host.
#[must_use]
pub fn host_prefix(host: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(host.len() + 17);
    key.extend_from_slice(host.as_bytes());
    key.push(SEPARATOR);
    key
}

/// Extract the server ID from a host-server key.
///
/// Returns `None` if the key is shorter than a server ID.
#[must_use]
pub fn extract_server_id_from_host_key(key: &[u8]) -> Option<ServerId> {
    let start = key.len().checked_sub(16)?;
    let bytes: [u8; 16] = key[start..].try_into().ok()?;
    Some(ServerId::from_uuid(uuid::Uuid::from_bytes(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_server_key_roundtrip() {
        let server_id = ServerId::generate();
        let key = host_server_key("192.168.1.10", &server_id);
        assert_eq!(key.len(), "192.168.1.10".len() + 1 + 16);

        let extracted = extract_server_id_from_host_key(&key).unwrap();
        assert_eq!(extracted, server_id);
    }

    #[test]
    fn host_prefix_does_not_match_longer_host() {
        let server_id = ServerId::generate();
        let key = host_server_key("xen10", &server_id);

        assert!(key.starts_with(&host_prefix("xen10")));
        assert!(!key.starts_with(&host_prefix("xen1")));
    }

    #[test]
    fn short_key_has_no_server_id() {
        assert!(extract_server_id_from_host_key(&[1, 2, 3]).is_none());
    }
}
