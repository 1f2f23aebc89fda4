//! Session error types.

use std::fmt;

use thiserror::Error;

/// A result type using `SessionError`.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Error codes reported by the remote API that the session reacts to.
pub mod codes {
    /// The session token is no longer valid (e.g. the toolstack restarted).
    pub const SESSION_INVALID: &str = "SESSION_INVALID";
    /// The contacted host is not the pool master; the first parameter is the master address.
    pub const HOST_IS_SLAVE: &str = "HOST_IS_SLAVE";
    /// The host is up but its toolstack has not finished starting.
    pub const HOST_STILL_BOOTING: &str = "HOST_STILL_BOOTING";
    /// The credentials were rejected.
    pub const SESSION_AUTHENTICATION_FAILED: &str = "SESSION_AUTHENTICATION_FAILED";
}

/// Classified network-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportCode {
    /// The peer reset or closed the connection mid-request.
    ConnectionReset,
    /// No route to the host.
    HostUnreachable,
    /// Nothing is listening on the remote port.
    ConnectionRefused,
    /// The request did not complete in time.
    TimedOut,
    /// Any other I/O failure.
    Other,
}

impl TransportCode {
    /// The conventional error code string for this failure.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionReset => "ECONNRESET",
            Self::HostUnreachable => "EHOSTUNREACH",
            Self::ConnectionRefused => "ECONNREFUSED",
            Self::TimedOut => "ETIMEDOUT",
            Self::Other => "EIO",
        }
    }
}

impl fmt::Display for TransportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur on a remote session.
///
/// `Clone` so that a single login result can be handed to every caller
/// awaiting it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    /// Network-level failure.
    #[error("transport error ({code}): {message}")]
    Transport {
        /// Classified failure code.
        code: TransportCode,
        /// Underlying error message.
        message: String,
    },

    /// The response could not be understood.
    #[error("malformed response: {0}")]
    Protocol(String),

    /// The remote API reported a failure.
    #[error("remote error {code}: {params:?}")]
    Api {
        /// Error code (first element of the error description).
        code: String,
        /// Remaining elements of the error description.
        params: Vec<String>,
    },

    /// A state-changing method was called on a read-only session.
    #[error("session is read-only, refusing {0}")]
    ReadOnly(String),

    /// The session has been disconnected.
    #[error("session is disconnected")]
    Disconnected,
}

impl SessionError {
    /// Build an API error from a code and parameters.
    #[must_use]
    pub fn api(code: impl Into<String>, params: Vec<String>) -> Self {
        Self::Api {
            code: code.into(),
            params,
        }
    }

    /// Build a transport error.
    #[must_use]
    pub fn transport(code: TransportCode, message: impl Into<String>) -> Self {
        Self::Transport {
            code,
            message: message.into(),
        }
    }

    /// The error code used for retry classification, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Transport { code, .. } => Some(code.as_str()),
            Self::Api { code, .. } => Some(code),
            Self::Protocol(_) | Self::ReadOnly(_) | Self::Disconnected => None,
        }
    }

    /// Returns `true` if a later attempt might succeed.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Transport { code, .. } => !matches!(code, TransportCode::Other),
            Self::Api { code, .. } => {
                code == codes::HOST_STILL_BOOTING || code == codes::SESSION_INVALID
            }
            Self::Protocol(_) | Self::ReadOnly(_) | Self::Disconnected => false,
        }
    }
}
