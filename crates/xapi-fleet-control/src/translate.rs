//! Translation of remote records into domain objects.
//!
//! A translator is a pure function of the raw record. It may decline a
//! record (the class is not modeled) or fail (the record is not usable yet);
//! failures are retried by the reconciler and never surfaced.

use serde_json::{Map, Value};
use thiserror::Error;
use xapi_fleet_core::{ObjectId, RawId};

use crate::types::{ObjectKind, RawObject};

/// A record that could not be translated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot translate {raw_id}: {reason}")]
pub struct TranslationFailure {
    /// Remote reference of the record.
    pub raw_id: RawId,
    /// What was wrong with it.
    pub reason: String,
}

impl TranslationFailure {
    /// Create a failure for `raw`.
    #[must_use]
    pub fn new(raw: &RawObject, reason: impl Into<String>) -> Self {
        Self {
            raw_id: raw.raw_id.clone(),
            reason: reason.into(),
        }
    }
}

/// Translator output, before the reconciler stamps origin and remote reference.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedObject {
    /// Domain id.
    pub id: ObjectId,
    /// Object kind.
    pub kind: ObjectKind,
    /// Derived attributes.
    pub attributes: Map<String, Value>,
    /// Domain id of the owning pool, if any.
    pub pool_id: Option<ObjectId>,
}

/// Turns raw records into domain objects.
pub trait Translator: Send + Sync {
    /// Translate one record.
    ///
    /// Returns `Ok(None)` for classes that are not modeled.
    ///
    /// # Errors
    ///
    /// Returns a failure if the record cannot be translated yet.
    fn translate(&self, raw: &RawObject) -> Result<Option<TranslatedObject>, TranslationFailure>;
}

/// Translator for the common XAPI classes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardTranslator;

const COMMON_FIELDS: &[&str] = &["name_label", "name_description", "tags"];

fn kind_fields(kind: ObjectKind) -> &'static [&'static str] {
    match kind {
        ObjectKind::Pool => &["master", "default_SR", "HA_enabled"],
        ObjectKind::Host => &[
            "hostname",
            "address",
            "enabled",
            "API_version_major",
            "API_version_minor",
            "resident_VMs",
            "PIFs",
        ],
        ObjectKind::Vm
        | ObjectKind::VmController
        | ObjectKind::VmSnapshot
        | ObjectKind::VmTemplate => &[
            "power_state",
            "resident_on",
            "VCPUs_max",
            "memory_dynamic_max",
            "memory_static_max",
            "VIFs",
            "VBDs",
            "snapshot_of",
            "snapshot_time",
        ],
        ObjectKind::Network => &["bridge", "MTU", "PIFs", "VIFs"],
        ObjectKind::Pif => &[
            "device",
            "IP",
            "MAC",
            "network",
            "host",
            "physical",
            "currently_attached",
            "VLAN",
        ],
        ObjectKind::Sr => &[
            "type",
            "content_type",
            "shared",
            "physical_size",
            "physical_utilisation",
            "virtual_allocation",
            "VDIs",
        ],
        ObjectKind::Vdi => &[
            "SR",
            "type",
            "virtual_size",
            "physical_utilisation",
            "read_only",
            "VBDs",
        ],
        ObjectKind::Vbd => &[
            "VM",
            "VDI",
            "device",
            "userdevice",
            "bootable",
            "mode",
            "type",
            "currently_attached",
        ],
        ObjectKind::Vif => &[
            "VM",
            "network",
            "device",
            "MAC",
            "MTU",
            "currently_attached",
            "locking_mode",
            "ipv4_allowed",
            "ipv6_allowed",
        ],
    }
}

fn flag(raw: &RawObject, name: &str) -> bool {
    raw.fields.get(name).and_then(Value::as_bool).unwrap_or(false)
}

fn kind_of(raw: &RawObject) -> Option<ObjectKind> {
    let kind = match raw.class.to_ascii_lowercase().as_str() {
        "pool" => ObjectKind::Pool,
        "host" => ObjectKind::Host,
        "vm" if flag(raw, "is_control_domain") => ObjectKind::VmController,
        "vm" if flag(raw, "is_a_snapshot") => ObjectKind::VmSnapshot,
        "vm" if flag(raw, "is_a_template") => ObjectKind::VmTemplate,
        "vm" => ObjectKind::Vm,
        "network" => ObjectKind::Network,
        "pif" => ObjectKind::Pif,
        "sr" => ObjectKind::Sr,
        "vdi" => ObjectKind::Vdi,
        "vbd" => ObjectKind::Vbd,
        "vif" => ObjectKind::Vif,
        _ => return None,
    };
    Some(kind)
}

impl Translator for StandardTranslator {
    fn translate(&self, raw: &RawObject) -> Result<Option<TranslatedObject>, TranslationFailure> {
        let Some(kind) = kind_of(raw) else {
            return Ok(None);
        };

        let uuid = raw
            .uuid()
            .ok_or_else(|| TranslationFailure::new(raw, "record has no uuid"))?;
        let id = ObjectId::new(uuid).map_err(|e| TranslationFailure::new(raw, e.to_string()))?;

        // A pool belongs to itself.
        let pool_uuid = if kind == ObjectKind::Pool {
            Some(uuid)
        } else {
            raw.pool_uuid.as_deref()
        };
        let pool_id = pool_uuid.and_then(|uuid| ObjectId::new(uuid).ok());

        let mut attributes = Map::new();
        attributes.insert("type".to_string(), Value::from(kind.as_str()));
        for name in COMMON_FIELDS.iter().chain(kind_fields(kind)) {
            if let Some(value) = raw.fields.get(*name) {
                attributes.insert((*name).to_string(), value.clone());
            }
        }

        Ok(Some(TranslatedObject {
            id,
            kind,
            attributes,
            pool_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(class: &str, record: Value) -> RawObject {
        let Value::Object(fields) = record else {
            panic!("record must be an object");
        };
        RawObject::new("OpaqueRef:1", class, fields).with_pool("pool-1")
    }

    #[test]
    fn translates_vif() {
        let object = StandardTranslator
            .translate(&raw(
                "VIF",
                json!({
                    "uuid": "vif-1",
                    "MAC": "aa:bb:cc:dd:ee:ff",
                    "VM": "OpaqueRef:vm",
                    "ipv4_allowed": ["10.0.0.1"],
                    "other_config": {}
                }),
            ))
            .unwrap()
            .unwrap();

        assert_eq!(object.id.as_str(), "vif-1");
        assert_eq!(object.kind, ObjectKind::Vif);
        assert_eq!(object.pool_id.unwrap().as_str(), "pool-1");
        assert_eq!(object.attributes["MAC"], json!("aa:bb:cc:dd:ee:ff"));
        assert_eq!(object.attributes["ipv4_allowed"], json!(["10.0.0.1"]));
        assert_eq!(object.attributes["type"], json!("VIF"));
        assert!(!object.attributes.contains_key("other_config"));
    }

    #[test]
    fn classifies_vms() {
        let kind = |record| StandardTranslator.translate(&raw("vm", record)).unwrap().unwrap().kind;

        assert_eq!(kind(json!({"uuid": "a"})), ObjectKind::Vm);
        assert_eq!(kind(json!({"uuid": "a", "is_a_template": true})), ObjectKind::VmTemplate);
        assert_eq!(kind(json!({"uuid": "a", "is_a_snapshot": true})), ObjectKind::VmSnapshot);
        assert_eq!(
            kind(json!({"uuid": "a", "is_control_domain": true})),
            ObjectKind::VmController
        );
    }

    #[test]
    fn pool_belongs_to_itself() {
        let mut record = raw("pool", json!({"uuid": "pool-9", "name_label": "lab"}));
        record.pool_uuid = None;

        let object = StandardTranslator.translate(&record).unwrap().unwrap();
        assert_eq!(object.pool_id.unwrap().as_str(), "pool-9");
    }

    #[test]
    fn object_without_pool_has_no_pool_id() {
        let mut record = raw("network", json!({"uuid": "net-1"}));
        record.pool_uuid = None;

        let object = StandardTranslator.translate(&record).unwrap().unwrap();
        assert!(object.pool_id.is_none());
    }

    #[test]
    fn unmodeled_class_is_declined() {
        assert_eq!(
            StandardTranslator
                .translate(&raw("message", json!({"uuid": "m"})))
                .unwrap(),
            None
        );
    }

    #[test]
    fn missing_uuid_fails() {
        let err = StandardTranslator
            .translate(&raw("VIF", json!({"MAC": "x"})))
            .unwrap_err();
        assert_eq!(err.raw_id.as_str(), "OpaqueRef:1");
    }
}
