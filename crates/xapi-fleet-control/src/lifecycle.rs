//! Pool connection state machine.
//!
//! # State Machine
//!
//! ```text
//!     ┌──────────────┐  connect   ┌──────────────┐  error   ┌──────────┐
//!     │ Disconnected │───────────▶│  Connecting  │─────────▶│  Failed  │
//!     └──────────────┘            └──────┬───────┘          └────┬─────┘
//!            ▲                           │ handshake ok          │
//!            │ disconnect                ▼                       │
//!            │                    ┌──────────────┐               │
//!            └────────────────────│  Connected   │               │
//!                                 └──────────────┘               │
//!                    connect (retry) ◀───────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use xapi_fleet_core::ServerId;

use crate::error::{ControlError, Result};

/// Connection state of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// No session.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Session live and events flowing.
    Connected,
    /// The last connection attempt failed.
    Failed,
}

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `ControlError::InvalidState` if the transition is not allowed.
pub fn validate_transition(
    server_id: &ServerId,
    from: ConnectionStatus,
    to: ConnectionStatus,
) -> Result<ConnectionStatus> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(ControlError::InvalidState {
            server_id: *server_id,
            from,
            to,
        })
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: ConnectionStatus, to: ConnectionStatus) -> bool {
    use ConnectionStatus::{Connected, Connecting, Disconnected, Failed};

    matches!(
        (from, to),
        (Disconnected | Failed, Connecting)
            | (Connecting, Connected | Failed | Disconnected)
            | (Connected, Disconnected | Failed)
    )
}

/// Returns the list of valid target states from the given state.
#[must_use]
pub fn valid_transitions_from(state: ConnectionStatus) -> Vec<ConnectionStatus> {
    use ConnectionStatus::{Connected, Connecting, Disconnected, Failed};

    match state {
        Disconnected | Failed => vec![Connecting],
        Connecting => vec![Connected, Failed, Disconnected],
        Connected => vec![Disconnected, Failed],
    }
}

/// Returns true if a session exists or is being set up.
#[must_use]
pub const fn is_live(state: ConnectionStatus) -> bool {
    matches!(state, ConnectionStatus::Connecting | ConnectionStatus::Connected)
}
