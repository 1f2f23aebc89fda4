//! Error types for the pool manager.
//!
//! This module defines all errors that can occur while registering,
//! connecting, and commanding pools.

use thiserror::Error;
use xapi_fleet_core::{ObjectId, ServerId};
use xapi_fleet_session::SessionError;

use crate::lifecycle::ConnectionStatus;
use crate::types::ObjectKind;

/// A result type using `ControlError`.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors that can occur in pool manager operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The pool rejected the registered credentials.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// The pool master could not be reached.
    #[error("host unreachable")]
    HostUnreachable,

    /// No such registered (or connected) server.
    #[error("no such pool server: {0}")]
    NoSuchPool(ServerId),

    /// The requested object is not known.
    #[error("no such object: {0}")]
    NoSuchObject(ObjectId),

    /// The object is of a different kind than the command expects.
    #[error("object {id} is a {found}, expected a {expected}")]
    WrongKind {
        /// The object.
        id: ObjectId,
        /// Kind the command works on.
        expected: ObjectKind,
        /// Kind of the object.
        found: ObjectKind,
    },

    /// Another registration already points at the host.
    #[error("host {host} is already registered as {server_id}")]
    AlreadyRegistered {
        /// The host.
        host: String,
        /// The existing registration.
        server_id: ServerId,
    },

    /// No live session can serve the request.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The requested connection state transition is not valid.
    #[error(
        "invalid state transition for server {server_id}: cannot transition from {from:?} to {to:?}"
    )]
    InvalidState {
        /// The server being transitioned.
        server_id: ServerId,
        /// The current state.
        from: ConnectionStatus,
        /// The requested target state.
        to: ConnectionStatus,
    },

    /// Remote session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] xapi_fleet_store::StoreError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::NoSuchPool(_) | Self::NoSuchObject(_) => 404,
            Self::WrongKind { .. } => 400,
            Self::AuthenticationFailed => 401,
            Self::Session(SessionError::ReadOnly(_)) => 403,
            Self::InvalidState { .. } | Self::AlreadyRegistered { .. } => 409,
            Self::Configuration(_) => 422,
            Self::HostUnreachable | Self::Session(_) => 502,
            Self::Store(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::HostUnreachable | Self::Store(_) | Self::Internal(_) => true,
            Self::Session(error) => error.is_retriable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xapi_fleet_session::TransportCode;

    #[test]
    fn error_status_codes() {
        let server_id = ServerId::generate();
        let object_id = ObjectId::new("vif-1").unwrap();

        assert_eq!(ControlError::NoSuchPool(server_id).http_status_code(), 404);
        assert_eq!(ControlError::NoSuchObject(object_id).http_status_code(), 404);
        assert_eq!(ControlError::AuthenticationFailed.http_status_code(), 401);
        assert_eq!(
            ControlError::Configuration("no pool".into()).http_status_code(),
            422
        );
        assert_eq!(
            ControlError::InvalidState {
                server_id,
                from: ConnectionStatus::Connected,
                to: ConnectionStatus::Connecting,
            }
            .http_status_code(),
            409
        );
        assert_eq!(
            ControlError::AlreadyRegistered {
                host: "h1".into(),
                server_id,
            }
            .http_status_code(),
            409
        );
        assert_eq!(
            ControlError::Session(SessionError::ReadOnly("VIF.plug".into())).http_status_code(),
            403
        );
        assert_eq!(
            ControlError::Session(SessionError::Disconnected).http_status_code(),
            502
        );
    }

    #[test]
    fn retriable_errors() {
        assert!(ControlError::HostUnreachable.is_retriable());
        assert!(ControlError::Session(SessionError::transport(
            TransportCode::ConnectionReset,
            "reset"
        ))
        .is_retriable());
        assert!(!ControlError::AuthenticationFailed.is_retriable());
        assert!(!ControlError::Configuration("x".into()).is_retriable());
    }
}
