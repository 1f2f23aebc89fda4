//! Request, response, and object types for pool management.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use xapi_fleet_core::{ObjectId, RawId, ServerId};
use xapi_fleet_session::{PoolInfo, SessionConfig};
use xapi_fleet_store::PoolRecord;

use crate::lifecycle::ConnectionStatus;

/// An object as reported by a pool, before translation.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    /// Remote reference.
    pub raw_id: RawId,
    /// Remote class name (`VM`, `VIF`, `pool`, ...).
    pub class: String,
    /// UUID of the pool that reported it, when known.
    pub pool_uuid: Option<String>,
    /// The remote record.
    pub fields: Map<String, Value>,
}

impl RawObject {
    /// Create a raw object.
    #[must_use]
    pub fn new(raw_id: impl Into<RawId>, class: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            raw_id: raw_id.into(),
            class: class.into(),
            pool_uuid: None,
            fields,
        }
    }

    /// Set the owning pool.
    #[must_use]
    pub fn with_pool(mut self, pool_uuid: impl Into<String>) -> Self {
        self.pool_uuid = Some(pool_uuid.into());
        self
    }

    /// A string field of the record.
    #[must_use]
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// The record's UUID, if present and non-empty.
    #[must_use]
    pub fn uuid(&self) -> Option<&str> {
        self.field_str("uuid").filter(|uuid| !uuid.is_empty())
    }
}

/// Kinds of domain objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectKind {
    /// A resource pool.
    Pool,
    /// A physical host.
    Host,
    /// A virtual machine.
    Vm,
    /// A host's control domain.
    VmController,
    /// A VM snapshot.
    VmSnapshot,
    /// A VM template.
    VmTemplate,
    /// A virtual network.
    Network,
    /// A physical network interface.
    Pif,
    /// A storage repository.
    Sr,
    /// A virtual disk.
    Vdi,
    /// A virtual block device (disk attachment).
    Vbd,
    /// A virtual network interface.
    Vif,
}

impl ObjectKind {
    /// Display name of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pool => "pool",
            Self::Host => "host",
            Self::Vm => "VM",
            Self::VmController => "VM-controller",
            Self::VmSnapshot => "VM-snapshot",
            Self::VmTemplate => "VM-template",
            Self::Network => "network",
            Self::Pif => "PIF",
            Self::Sr => "SR",
            Self::Vdi => "VDI",
            Self::Vbd => "VBD",
            Self::Vif => "VIF",
        }
    }

    /// Remote class that owns objects of this kind.
    #[must_use]
    pub const fn remote_class(&self) -> &'static str {
        match self {
            Self::Vm | Self::VmController | Self::VmSnapshot | Self::VmTemplate => "VM",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A translated object, as held in the object store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainObject {
    /// Domain id (the remote UUID).
    pub id: ObjectId,
    /// Object kind.
    pub kind: ObjectKind,
    /// Derived attributes.
    pub attributes: Map<String, Value>,
    /// Domain id of the owning pool, if any.
    pub pool_id: Option<ObjectId>,
    /// Remote reference on the origin connection.
    pub raw_id: RawId,
    /// Connection that produced this value.
    pub origin: ServerId,
}

/// Request to register a pool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterServerRequest {
    /// Pool master address.
    pub host: String,
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Refuse state-changing calls.
    #[serde(default)]
    pub read_only: bool,
}

impl RegisterServerRequest {
    /// Create a read-write registration request.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            read_only: false,
        }
    }
}

/// Partial update of a registration. Empty strings are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateServerRequest {
    /// New master address.
    #[serde(default)]
    pub host: Option<String>,
    /// New login name.
    #[serde(default)]
    pub username: Option<String>,
    /// New password.
    #[serde(default)]
    pub password: Option<String>,
    /// Connect on start.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Refuse state-changing calls.
    #[serde(default)]
    pub read_only: Option<bool>,
}

/// A registration with its live state. Never carries the password.
#[derive(Debug, Clone, Serialize)]
pub struct ServerView {
    /// Registration id.
    pub id: ServerId,
    /// Pool master address.
    pub host: String,
    /// Login name.
    pub username: String,
    /// Read-only flag.
    pub read_only: bool,
    /// Connect-on-start flag.
    pub enabled: bool,
    /// Connection state.
    pub status: ConnectionStatus,
    /// The connected pool, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolInfo>,
}

impl ServerView {
    /// Build a view of a record.
    #[must_use]
    pub fn new(record: &PoolRecord, status: ConnectionStatus, pool: Option<PoolInfo>) -> Self {
        Self {
            id: record.id,
            host: record.host.clone(),
            username: record.username.clone(),
            read_only: record.read_only,
            enabled: record.enabled,
            status,
            pool,
        }
    }
}

/// Configuration for the pool manager.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlConfig {
    /// Session tuning shared by every connection.
    #[serde(default)]
    pub session: SessionConfig,
    /// Classes watched through `event.from`.
    #[serde(default = "ControlConfig::default_event_classes")]
    pub event_classes: Vec<String>,
    /// Connect enabled servers on start.
    #[serde(default = "ControlConfig::default_connect_on_start")]
    pub connect_on_start: bool,
}

impl ControlConfig {
    fn default_event_classes() -> Vec<String> {
        vec!["*".to_string()]
    }

    const fn default_connect_on_start() -> bool {
        true
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            event_classes: Self::default_event_classes(),
            connect_on_start: Self::default_connect_on_start(),
        }
    }
}
