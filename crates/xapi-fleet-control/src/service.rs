//! Pool manager service implementation.
//!
//! This module provides the `PoolControl` trait and the `PoolManager`
//! implementation that registers pool servers, runs their connections, and
//! feeds their objects through the reconciler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use xapi_fleet_core::{ObjectId, ServerId};
use xapi_fleet_session::{codes, RemoteSession, SessionError, TransportCode};
use xapi_fleet_store::{PoolRecord, Store, StoreError};

use crate::connector::Connector;
use crate::error::{ControlError, Result};
use crate::events::{EventSource, Subscription};
use crate::lifecycle::{self, ConnectionStatus};
use crate::objects::ObjectStore;
use crate::reconcile::Reconciler;
use crate::translate::{StandardTranslator, Translator};
use crate::types::{
    ControlConfig, DomainObject, RegisterServerRequest, ServerView, UpdateServerRequest,
};

/// Trait defining the pool manager operations.
///
/// This trait provides the registration and connection API used by the
/// admin HTTP surface.
#[async_trait]
pub trait PoolControl: Send + Sync {
    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a pool server. New registrations are enabled.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Configuration` if the host is empty and
    /// `ControlError::AlreadyRegistered` if another registration uses it.
    async fn register_server(&self, request: RegisterServerRequest) -> Result<ServerView>;

    /// Update a registration. A new read-only flag applies to a live
    /// session immediately.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoSuchPool` if the server is not registered
    /// and `ControlError::AlreadyRegistered` if the new host is taken.
    async fn update_server(
        &self,
        server_id: &ServerId,
        request: UpdateServerRequest,
    ) -> Result<ServerView>;

    /// Disconnect (best effort) and forget a server.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoSuchPool` if the server is not registered.
    async fn unregister_server(&self, server_id: &ServerId) -> Result<()>;

    /// All registrations with their connection state.
    async fn list_servers(&self) -> Result<Vec<ServerView>>;

    /// One registration with its connection state.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoSuchPool` if the server is not registered.
    async fn server_status(&self, server_id: &ServerId) -> Result<ServerView>;

    // =========================================================================
    // Connections
    // =========================================================================

    /// Connect to a registered server.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AuthenticationFailed` or
    /// `ControlError::HostUnreachable` for the corresponding handshake
    /// failures, `ControlError::InvalidState` if the server is already
    /// connecting or connected, and any other session failure unchanged.
    async fn connect_server(&self, server_id: &ServerId) -> Result<ServerView>;

    /// Disconnect a connected server and withdraw its objects.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoSuchPool` if the server is not connected.
    async fn disconnect_server(&self, server_id: &ServerId) -> Result<()>;

    /// Join the pool of `source` into the pool of `target`, then forget
    /// `source`.
    ///
    /// # Errors
    ///
    /// Returns the join failure, in which case `source` keeps running.
    async fn merge_pools(&self, source: &ServerId, target: &ServerId, force: bool) -> Result<()>;

    // =========================================================================
    // Objects
    // =========================================================================

    /// All reconciled objects, ordered by id.
    async fn list_objects(&self) -> Result<Vec<DomainObject>>;
}

/// A live connection to a pool.
struct LiveConnection {
    session: RemoteSession,
    events: Arc<dyn EventSource>,
    /// Taken while the connection is detached from the reconciler.
    pump: Option<JoinHandle<()>>,
    pool_id: Option<ObjectId>,
}

/// The pool manager implementation.
pub struct PoolManager<S: Store> {
    store: Arc<S>,
    connector: Arc<dyn Connector>,
    reconciler: Arc<Reconciler>,
    connections: RwLock<HashMap<ServerId, LiveConnection>>,
    statuses: RwLock<HashMap<ServerId, ConnectionStatus>>,
    /// Pool id to the server connected to its master.
    pools: RwLock<HashMap<ObjectId, ServerId>>,
    config: ControlConfig,
}

impl<S: Store + 'static> PoolManager<S> {
    /// Create a pool manager translating with the standard translator.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        connector: Arc<dyn Connector>,
        objects: Arc<dyn ObjectStore>,
        config: ControlConfig,
    ) -> Self {
        Self::with_translator(store, connector, objects, Arc::new(StandardTranslator), config)
    }

    /// Create a pool manager with a custom translator.
    #[must_use]
    pub fn with_translator(
        store: Arc<S>,
        connector: Arc<dyn Connector>,
        objects: Arc<dyn ObjectStore>,
        translator: Arc<dyn Translator>,
        config: ControlConfig,
    ) -> Self {
        Self {
            store,
            connector,
            reconciler: Arc::new(Reconciler::new(translator, objects)),
            connections: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            pools: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// The reconciler feeding the object store.
    #[must_use]
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// The reconciled object store.
    #[must_use]
    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        self.reconciler.objects()
    }

    /// Connection state of a server.
    #[must_use]
    pub fn status(&self, server_id: &ServerId) -> ConnectionStatus {
        self.statuses
            .read()
            .get(server_id)
            .copied()
            .unwrap_or_default()
    }

    /// Connect every enabled server. Failures are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error only if the registrations cannot be read.
    pub async fn start(&self) -> Result<()> {
        if !self.config.connect_on_start {
            return Ok(());
        }

        let records = self.store.list_servers()?;
        for record in records.into_iter().filter(|record| record.enabled) {
            if let Err(error) = self.connect_server(&record.id).await {
                tracing::warn!(
                    server_id = %record.id,
                    host = %record.host,
                    error = %error,
                    "Failed to connect server on start"
                );
            }
        }
        Ok(())
    }

    /// Disconnect every live connection.
    pub async fn shutdown(&self) {
        let server_ids: Vec<ServerId> = self.connections.read().keys().copied().collect();
        for server_id in server_ids {
            if let Err(error) = self.disconnect_server(&server_id).await {
                tracing::debug!(server_id = %server_id, error = %error, "Disconnect on shutdown failed");
            }
        }
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    /// Get a reconciled object by id.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoSuchObject` if the id is unknown.
    pub fn object(&self, id: &ObjectId) -> Result<DomainObject> {
        self.objects()
            .get(id)
            .ok_or_else(|| ControlError::NoSuchObject(id.clone()))
    }

    /// The session of a connected server.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoSuchPool` if the server is not connected.
    pub fn session_for_server(&self, server_id: &ServerId) -> Result<RemoteSession> {
        self.connections
            .read()
            .get(server_id)
            .map(|connection| connection.session.clone())
            .ok_or(ControlError::NoSuchPool(*server_id))
    }

    /// The session of the connection to a pool's master.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Configuration` if no connection serves the pool.
    pub fn session_for_pool(&self, pool_id: &ObjectId) -> Result<RemoteSession> {
        let server_id = self.pools.read().get(pool_id).copied();
        server_id
            .and_then(|server_id| self.session_for_server(&server_id).ok())
            .ok_or_else(|| ControlError::Configuration(format!("no connection to pool {pool_id}")))
    }

    /// The session that can act on an object.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Configuration` if the object has no pool or the
    /// pool is not connected.
    pub fn session_for_object(&self, object: &DomainObject) -> Result<RemoteSession> {
        let pool_id = object.pool_id.as_ref().ok_or_else(|| {
            ControlError::Configuration(format!("{} {} belongs to no pool", object.kind, object.id))
        })?;
        self.session_for_pool(pool_id)
    }

    /// The session that can act on the object with the given id.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NoSuchObject` if the id is unknown, otherwise as
    /// [`session_for_object`](Self::session_for_object).
    pub fn session_for_id(&self, id: &ObjectId) -> Result<RemoteSession> {
        let object = self.object(id)?;
        self.session_for_object(&object)
    }

    /// The event source of a connected server.
    pub(crate) fn events_for_server(&self, server_id: &ServerId) -> Result<Arc<dyn EventSource>> {
        self.connections
            .read()
            .get(server_id)
            .map(|connection| Arc::clone(&connection.events))
            .ok_or(ControlError::NoSuchPool(*server_id))
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn record(&self, server_id: &ServerId) -> Result<PoolRecord> {
        self.store
            .get_server(server_id)?
            .ok_or(ControlError::NoSuchPool(*server_id))
    }

    fn view(&self, record: &PoolRecord) -> ServerView {
        let pool = self
            .connections
            .read()
            .get(&record.id)
            .and_then(|connection| connection.session.pool());
        ServerView::new(record, self.status(&record.id), pool)
    }

    /// Perform a validated state transition.
    fn transition(&self, server_id: &ServerId, target: ConnectionStatus) -> Result<()> {
        let mut statuses = self.statuses.write();
        let current = statuses.get(server_id).copied().unwrap_or_default();
        lifecycle::validate_transition(server_id, current, target)?;
        statuses.insert(*server_id, target);
        Ok(())
    }

    fn mark_failed(&self, server_id: &ServerId) {
        self.statuses
            .write()
            .insert(*server_id, ConnectionStatus::Failed);
    }

    /// Attach a connection to the reconciler and pump its events.
    fn install(&self, server_id: ServerId, events: &dyn EventSource) -> JoinHandle<()> {
        self.reconciler.attach(server_id);
        let Subscription {
            snapshot,
            events: mut receiver,
        } = events.subscribe();
        self.reconciler.apply_snapshot(&server_id, &snapshot);

        let reconciler = Arc::clone(&self.reconciler);
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                reconciler.apply(&server_id, &event);
            }
        })
    }

    /// Stop the pump and withdraw every object of the connection.
    fn uninstall(&self, server_id: &ServerId, pump: &JoinHandle<()>) {
        pump.abort();
        self.reconciler.detach(server_id);
    }

    /// Fail if a registration other than `own` already uses `host`.
    fn ensure_host_free(&self, host: &str, own: Option<&ServerId>) -> Result<()> {
        let existing = self.store.find_servers_by_host(host)?;
        match existing.iter().find(|record| Some(&record.id) != own) {
            Some(record) => Err(ControlError::AlreadyRegistered {
                host: host.to_string(),
                server_id: record.id,
            }),
            None => Ok(()),
        }
    }

    fn classify_connect_error(error: SessionError) -> ControlError {
        match error.code() {
            Some(codes::SESSION_AUTHENTICATION_FAILED) => ControlError::AuthenticationFailed,
            Some(code) if code == TransportCode::HostUnreachable.as_str() => {
                ControlError::HostUnreachable
            }
            _ => ControlError::Session(error),
        }
    }
}

#[async_trait]
impl<S: Store + 'static> PoolControl for PoolManager<S> {
    // =========================================================================
    // Registration
    // =========================================================================

    async fn register_server(&self, request: RegisterServerRequest) -> Result<ServerView> {
        if request.host.trim().is_empty() {
            return Err(ControlError::Configuration("host must not be empty".to_string()));
        }
        self.ensure_host_free(&request.host, None)?;

        let record = PoolRecord::new(
            request.host,
            request.username,
            request.password,
            request.read_only,
        );
        self.store.put_server(&record)?;

        tracing::info!(
            server_id = %record.id,
            host = %record.host,
            read_only = record.read_only,
            "Registered server"
        );

        Ok(self.view(&record))
    }

    async fn update_server(
        &self,
        server_id: &ServerId,
        request: UpdateServerRequest,
    ) -> Result<ServerView> {
        let mut record = self.record(server_id)?;

        if let Some(host) = request.host.filter(|host| !host.is_empty()) {
            self.ensure_host_free(&host, Some(server_id))?;
            record.host = host;
        }
        if let Some(username) = request.username.filter(|username| !username.is_empty()) {
            record.username = username;
        }
        if let Some(password) = request.password.filter(|password| !password.is_empty()) {
            record.password = password;
        }
        if let Some(enabled) = request.enabled {
            record.enabled = enabled;
        }
        if let Some(read_only) = request.read_only {
            record.read_only = read_only;
            if let Ok(session) = self.session_for_server(server_id) {
                session.set_read_only(read_only);
            }
        }
        record.updated_at = Utc::now();
        self.store.put_server(&record)?;

        tracing::info!(server_id = %server_id, "Updated server");

        Ok(self.view(&record))
    }

    async fn unregister_server(&self, server_id: &ServerId) -> Result<()> {
        let connected = self.connections.read().contains_key(server_id);
        if connected {
            if let Err(error) = self.disconnect_server(server_id).await {
                tracing::warn!(server_id = %server_id, error = %error, "Disconnect before unregister failed");
            }
        }

        match self.store.delete_server(server_id) {
            Err(StoreError::NotFound) => return Err(ControlError::NoSuchPool(*server_id)),
            other => other?,
        }
        self.statuses.write().remove(server_id);

        tracing::info!(server_id = %server_id, "Unregistered server");

        Ok(())
    }

    async fn list_servers(&self) -> Result<Vec<ServerView>> {
        let records = self.store.list_servers()?;
        Ok(records.iter().map(|record| self.view(record)).collect())
    }

    async fn server_status(&self, server_id: &ServerId) -> Result<ServerView> {
        let record = self.record(server_id)?;
        Ok(self.view(&record))
    }

    // =========================================================================
    // Connections
    // =========================================================================

    async fn connect_server(&self, server_id: &ServerId) -> Result<ServerView> {
        let record = self.record(server_id)?;
        self.transition(server_id, ConnectionStatus::Connecting)?;

        tracing::info!(server_id = %server_id, host = %record.host, "Connecting server");

        let connection = match self.connector.open(&record) {
            Ok(connection) => connection,
            Err(error) => {
                self.mark_failed(server_id);
                return Err(error);
            }
        };
        let pump = self.install(*server_id, connection.events.as_ref());

        let pool = match connection.session.connect().await {
            Ok(pool) => pool,
            Err(error) => {
                self.uninstall(server_id, &pump);
                connection.session.disconnect().await;
                self.mark_failed(server_id);
                let error = Self::classify_connect_error(error);
                tracing::warn!(server_id = %server_id, host = %record.host, error = %error, "Connection failed");
                return Err(error);
            }
        };

        if let Err(error) = connection.events.start().await {
            self.uninstall(server_id, &pump);
            connection.session.disconnect().await;
            self.mark_failed(server_id);
            tracing::warn!(server_id = %server_id, error = %error, "Event source failed to start");
            return Err(error);
        }

        let pool_id = ObjectId::new(pool.pool_uuid.as_str()).ok();
        if let Some(pool_id) = &pool_id {
            self.pools.write().insert(pool_id.clone(), *server_id);
        }
        self.connections.write().insert(
            *server_id,
            LiveConnection {
                session: connection.session,
                events: connection.events,
                pump: Some(pump),
                pool_id,
            },
        );
        self.transition(server_id, ConnectionStatus::Connected)?;

        tracing::info!(
            server_id = %server_id,
            pool_uuid = %pool.pool_uuid,
            "Server connected"
        );

        Ok(self.view(&record))
    }

    async fn disconnect_server(&self, server_id: &ServerId) -> Result<()> {
        let connection = self
            .connections
            .write()
            .remove(server_id)
            .ok_or(ControlError::NoSuchPool(*server_id))?;

        if let Some(pool_id) = &connection.pool_id {
            let mut pools = self.pools.write();
            if pools.get(pool_id) == Some(server_id) {
                pools.remove(pool_id);
            }
        }
        match &connection.pump {
            Some(pump) => self.uninstall(server_id, pump),
            None => self.reconciler.detach(server_id),
        }
        connection.events.stop().await;
        connection.session.disconnect().await;
        self.transition(server_id, ConnectionStatus::Disconnected)?;

        tracing::info!(server_id = %server_id, "Server disconnected");

        Ok(())
    }

    async fn merge_pools(&self, source: &ServerId, target: &ServerId, force: bool) -> Result<()> {
        if source == target {
            return Err(ControlError::Configuration(
                "cannot merge a pool into itself".to_string(),
            ));
        }
        let target_record = self.record(target)?;
        let target_host = self
            .session_for_server(target)
            .map_or_else(|_| target_record.host.clone(), |session| session.host());

        let (session, events, pump) = {
            let mut connections = self.connections.write();
            let connection = connections
                .get_mut(source)
                .ok_or(ControlError::NoSuchPool(*source))?;
            (
                connection.session.clone(),
                Arc::clone(&connection.events),
                connection.pump.take(),
            )
        };
        if let Some(pump) = &pump {
            self.uninstall(source, pump);
        }

        let method = if force { "pool.join_force" } else { "pool.join" };
        let params = vec![
            Value::String(target_host.clone()),
            Value::String(target_record.username.clone()),
            Value::String(target_record.password.clone()),
        ];

        if let Err(error) = session.call(method, params).await {
            tracing::warn!(source = %source, target = %target, error = %error, "Pool join failed");
            let pump = self.install(*source, events.as_ref());
            let mut connections = self.connections.write();
            match connections.get_mut(source) {
                Some(connection) => connection.pump = Some(pump),
                None => self.uninstall(source, &pump),
            }
            return Err(error.into());
        }

        tracing::info!(source = %source, target = %target, master = %target_host, "Pools merged");

        self.unregister_server(source).await
    }

    // =========================================================================
    // Objects
    // =========================================================================

    async fn list_objects(&self) -> Result<Vec<DomainObject>> {
        let mut objects = self.objects().all();
        objects.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(objects)
    }
}
