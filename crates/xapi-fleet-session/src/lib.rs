//! Resilient XAPI sessions for xapi-fleet.
//!
//! This crate talks to pool masters over XML-RPC:
//!
//! - XML-RPC body encoding and decoding ([`xmlrpc`])
//! - An HTTP transport with network error classification ([`transport`])
//! - Retry classification for failed calls ([`policy`])
//! - [`RemoteSession`]: single-flight login, token renewal, master redirects
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────────┐
//! │   PoolManager    │────▶│  RemoteSession   │
//! │   (control)      │     │  (login, retry)  │
//! └──────────────────┘     └────────┬─────────┘
//!                                   │
//!                          ┌────────▼─────────┐
//!                          │    Transport     │
//!                          │    (trait)       │
//!                          └────────┬─────────┘
//!                                   │ HTTPS, XML-RPC
//!                          ┌────────▼─────────┐
//!                          │   Pool master    │
//!                          └──────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use xapi_fleet_session::{Credentials, HttpTransportFactory, RemoteSession, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::default();
//! let factory = Arc::new(HttpTransportFactory::new(&config)?);
//!
//! let session = RemoteSession::new(
//!     "xen1.example.org",
//!     Credentials::new("root", "secret"),
//!     false,
//!     config,
//!     factory,
//! )?;
//!
//! let pool = session.connect().await?;
//! println!("Pool {} ({})", pool.name_label, pool.pool_uuid);
//!
//! let vms = session.call("VM.get_all", vec![]).await?;
//! println!("{vms}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod policy;
pub mod session;
pub mod transport;
pub mod xmlrpc;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use std::time::Duration;

use serde::Deserialize;

pub use error::{codes, Result, SessionError, TransportCode};
pub use session::{is_read_only_method, Credentials, PoolInfo, RemoteSession};
pub use transport::{HttpTransport, HttpTransportFactory, Transport, TransportFactory};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockTransport, MockTransportFactory, RecordedCall};

/// Session tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Delay before retrying a transient failure, in milliseconds.
    #[serde(default = "SessionConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// HTTP request timeout, in seconds. Must exceed the event poll timeout.
    #[serde(default = "SessionConfig::default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Long-poll timeout passed to `event.from`, in seconds.
    #[serde(default = "SessionConfig::default_event_timeout_seconds")]
    pub event_timeout_seconds: u64,
    /// Skip TLS certificate validation. Pool masters ship self-signed
    /// certificates by default.
    #[serde(default = "SessionConfig::default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,
}

impl SessionConfig {
    const fn default_retry_delay_ms() -> u64 {
        2000
    }

    const fn default_request_timeout_seconds() -> u64 {
        120
    }

    const fn default_event_timeout_seconds() -> u64 {
        60
    }

    const fn default_accept_invalid_certs() -> bool {
        true
    }

    /// Delay before retrying a transient failure.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// HTTP request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    /// Long-poll timeout for event polling.
    #[must_use]
    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_seconds)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: Self::default_retry_delay_ms(),
            request_timeout_seconds: Self::default_request_timeout_seconds(),
            event_timeout_seconds: Self::default_event_timeout_seconds(),
            accept_invalid_certs: Self::default_accept_invalid_certs(),
        }
    }
}
