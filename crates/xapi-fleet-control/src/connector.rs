//! Construction of per-pool sessions and event sources.

use std::sync::Arc;

use xapi_fleet_session::{Credentials, RemoteSession, SessionConfig, TransportFactory};
use xapi_fleet_store::PoolRecord;

use crate::error::Result;
use crate::events::{EventSource, XapiEventSource};

/// A session and its event source, not yet connected.
pub struct Connection {
    /// Session to the pool master.
    pub session: RemoteSession,
    /// Object changes of the pool.
    pub events: Arc<dyn EventSource>,
}

/// Opens connections for registered servers.
pub trait Connector: Send + Sync {
    /// Build the session and event source for a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record's host cannot be used.
    fn open(&self, record: &PoolRecord) -> Result<Connection>;
}

/// Connector speaking XML-RPC to real pools.
pub struct XapiConnector {
    factory: Arc<dyn TransportFactory>,
    config: SessionConfig,
    event_classes: Vec<String>,
}

impl XapiConnector {
    /// Create a connector.
    #[must_use]
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        config: SessionConfig,
        event_classes: Vec<String>,
    ) -> Self {
        Self {
            factory,
            config,
            event_classes,
        }
    }
}

impl Connector for XapiConnector {
    fn open(&self, record: &PoolRecord) -> Result<Connection> {
        let session = RemoteSession::new(
            &record.host,
            Credentials::new(&record.username, &record.password),
            record.read_only,
            self.config.clone(),
            Arc::clone(&self.factory),
        )?;
        let events = Arc::new(XapiEventSource::new(
            session.clone(),
            self.event_classes.clone(),
        ));
        Ok(Connection { session, events })
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockConnector;

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use std::collections::HashMap;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use xapi_fleet_core::ServerId;
    use xapi_fleet_session::{
        Credentials, MockTransport, MockTransportFactory, RemoteSession, SessionConfig,
        TransportFactory,
    };
    use xapi_fleet_store::PoolRecord;

    use super::{Connection, Connector};
    use crate::error::Result;
    use crate::events::ManualEventSource;

    /// Connector over mock transports and hand-fed event sources.
    ///
    /// Each `open` hands out a fresh [`ManualEventSource`], reachable through
    /// [`source`](Self::source) until the next `open` for the same server.
    pub struct MockConnector {
        factory: Arc<MockTransportFactory>,
        config: SessionConfig,
        sources: Mutex<HashMap<ServerId, Arc<ManualEventSource>>>,
        sessions: Mutex<HashMap<ServerId, RemoteSession>>,
    }

    impl MockConnector {
        /// Create a connector with zero retry delay.
        #[must_use]
        pub fn new() -> Self {
            let config = SessionConfig {
                retry_delay_ms: 0,
                ..SessionConfig::default()
            };
            Self {
                factory: Arc::new(MockTransportFactory::new()),
                config,
                sources: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
            }
        }

        /// The mock transport for `host`.
        #[must_use]
        pub fn transport(&self, host: &str) -> Arc<MockTransport> {
            self.factory.transport(host)
        }

        /// The event source last opened for a server.
        #[must_use]
        pub fn source(&self, server_id: &ServerId) -> Option<Arc<ManualEventSource>> {
            self.sources.lock().get(server_id).cloned()
        }

        /// The session last opened for a server.
        #[must_use]
        pub fn session(&self, server_id: &ServerId) -> Option<RemoteSession> {
            self.sessions.lock().get(server_id).cloned()
        }
    }

    impl Default for MockConnector {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Connector for MockConnector {
        fn open(&self, record: &PoolRecord) -> Result<Connection> {
            let session = RemoteSession::new(
                &record.host,
                Credentials::new(&record.username, &record.password),
                record.read_only,
                self.config.clone(),
                Arc::clone(&self.factory) as Arc<dyn TransportFactory>,
            )?;
            let source = Arc::new(ManualEventSource::new());
            self.sources.lock().insert(record.id, Arc::clone(&source));
            self.sessions.lock().insert(record.id, session.clone());
            Ok(Connection {
                session,
                events: source,
            })
        }
    }
}
