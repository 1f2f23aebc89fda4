//! Pool connection manager for xapi-fleet.
//!
//! This crate keeps one live connection per registered pool and merges the
//! objects every pool reports into a single object store. It also provides
//! the commands that act on those objects and the admin HTTP API.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Admin API (axum)                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        PoolManager                          │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │ Registration│ │ Connections │ │  VIF / metadata     │    │
//! │  │   (Store)   │ │ (lifecycle) │ │     commands        │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!          │                  │                     ▲
//!          ▼                  ▼                     │
//!    ┌──────────┐   ┌──────────────────┐   ┌────────────────┐
//!    │  Store   │   │ RemoteSession +  │──▶│   Reconciler   │──▶ ObjectStore
//!    │ (RocksDB)│   │   EventSource    │   │ (per pool idx, │
//!    └──────────┘   └──────────────────┘   │  conflicts)    │
//!                                          └────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use xapi_fleet_control::{
//!     ControlConfig, Connector, MemoryObjectStore, PoolControl, PoolManager,
//!     RegisterServerRequest, XapiConnector,
//! };
//! use xapi_fleet_session::{HttpTransportFactory, TransportFactory};
//! use xapi_fleet_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControlConfig::default();
//! let store = Arc::new(RocksStore::open("/tmp/xapi-fleet")?);
//! let factory: Arc<dyn TransportFactory> = Arc::new(HttpTransportFactory::new(&config.session)?);
//! let connector: Arc<dyn Connector> = Arc::new(XapiConnector::new(
//!     factory,
//!     config.session.clone(),
//!     config.event_classes.clone(),
//! ));
//! let manager = PoolManager::new(store, connector, Arc::new(MemoryObjectStore::new()), config);
//!
//! let server = manager
//!     .register_server(RegisterServerRequest::new("xen1.example.com", "root", "secret"))
//!     .await?;
//! manager.connect_server(&server.id).await?;
//!
//! for object in manager.list_objects().await? {
//!     println!("{} {}", object.kind, object.id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Conflicts
//!
//! Two connections may report the same object, e.g. while a host moves
//! between pools. The first reporter's value stays in the object store and
//! later ones wait in a conflict set; see the [`reconcile`] module.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod api;
pub mod connector;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod metadata;
pub mod objects;
pub mod reconcile;
pub mod service;
pub mod translate;
pub mod types;
mod vif;

pub use api::{create_router, ApiError};
pub use connector::{Connection, Connector, XapiConnector};
pub use error::{ControlError, Result};
pub use events::{EventHub, EventSource, SourceEvent, Subscription, XapiEventSource};
pub use lifecycle::ConnectionStatus;
pub use metadata::{camel_to_snake, data_key};
pub use objects::{MemoryObjectStore, ObjectChange, ObjectStore};
pub use reconcile::Reconciler;
pub use service::{PoolControl, PoolManager};
pub use translate::{StandardTranslator, TranslatedObject, TranslationFailure, Translator};
pub use types::{
    ControlConfig, DomainObject, ObjectKind, RawObject, RegisterServerRequest, ServerView,
    UpdateServerRequest,
};

#[cfg(any(test, feature = "test-utils"))]
pub use connector::MockConnector;
#[cfg(any(test, feature = "test-utils"))]
pub use events::{raw_object, ManualEventSource};
