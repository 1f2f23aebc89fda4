//! Retry classification for failed calls.

use crate::error::{codes, SessionError, TransportCode};

/// What to do after a call failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait for the configured delay and try again.
    RetryAfterDelay,
    /// Obtain a new session token and try again.
    Relogin,
    /// Switch to the given master host and try again.
    Redirect(String),
    /// Give up and return the error to the caller.
    Propagate,
}

/// Classify a failure.
///
/// `previous` is the code of the preceding failure of the same call, if
/// any. A connection reset is retried once, then only again after a
/// different failure has been seen in between. A booting host is retried
/// without limit.
#[must_use]
pub fn classify(error: &SessionError, previous: Option<&str>) -> RetryDecision {
    match error {
        SessionError::Transport {
            code: TransportCode::ConnectionReset,
            ..
        } => {
            if previous == Some(TransportCode::ConnectionReset.as_str()) {
                RetryDecision::Propagate
            } else {
                RetryDecision::RetryAfterDelay
            }
        }
        SessionError::Api { code, params } => match code.as_str() {
            codes::HOST_STILL_BOOTING => RetryDecision::RetryAfterDelay,
            codes::SESSION_INVALID => RetryDecision::Relogin,
            codes::HOST_IS_SLAVE => params
                .first()
                .filter(|master| !master.is_empty())
                .map_or(RetryDecision::Propagate, |master| {
                    RetryDecision::Redirect(master.clone())
                }),
            _ => RetryDecision::Propagate,
        },
        _ => RetryDecision::Propagate,
    }
}
