//! Scriptable in-memory transport for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Result, SessionError};
use crate::session::LOGIN_METHOD;
use crate::transport::{Transport, TransportFactory};

/// A call observed by a [`MockTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Method name.
    pub method: String,
    /// Parameters, session token first for authenticated calls.
    pub params: Vec<Value>,
}

#[derive(Default)]
struct MockState {
    queued: HashMap<String, VecDeque<Result<Value>>>,
    responses: HashMap<String, Value>,
    calls: Vec<RecordedCall>,
    delays: HashMap<String, Duration>,
    logins: usize,
}

/// Transport answering from scripted results.
///
/// Queued results are consumed first, then fixed responses. Without either,
/// logins return a fresh token, logouts succeed, and anything else fails
/// with `MESSAGE_METHOD_UNKNOWN`.
pub struct MockTransport {
    host: String,
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Create a transport for `host`.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// The host this transport stands for.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Always answer `method` with `value`.
    pub fn respond(&self, method: &str, value: Value) {
        self.state.lock().responses.insert(method.to_string(), value);
    }

    /// Answer the next unanswered call of `method` with `result`.
    pub fn enqueue(&self, method: &str, result: Result<Value>) {
        self.state
            .lock()
            .queued
            .entry(method.to_string())
            .or_default()
            .push_back(result);
    }

    /// Fail the next unanswered call of `method`.
    pub fn fail_next(&self, method: &str, error: SessionError) {
        self.enqueue(method, Err(error));
    }

    /// Delay every login by `delay`.
    pub fn set_login_delay(&self, delay: Duration) {
        self.set_delay(LOGIN_METHOD, delay);
    }

    /// Delay every call of `method` by `delay` before answering.
    pub fn set_delay(&self, method: &str, delay: Duration) {
        self.state.lock().delays.insert(method.to_string(), delay);
    }

    /// All calls seen so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    /// Calls of `method` seen so far.
    #[must_use]
    pub fn calls_to(&self, method: &str) -> Vec<RecordedCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .cloned()
            .collect()
    }

    /// Number of calls of `method` seen so far.
    #[must_use]
    pub fn call_count(&self, method: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.method == method)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let (queued, fixed, delay, login_number) = {
            let mut state = self.state.lock();
            state.calls.push(RecordedCall {
                method: method.to_string(),
                params,
            });
            let is_login = method == LOGIN_METHOD;
            if is_login {
                state.logins += 1;
            }
            let queued = state.queued.get_mut(method).and_then(VecDeque::pop_front);
            let fixed = state.responses.get(method).cloned();
            let delay = state.delays.get(method).copied().unwrap_or_default();
            (queued, fixed, delay, state.logins)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(result) = queued {
            return result;
        }
        if let Some(value) = fixed {
            return Ok(value);
        }

        match method {
            LOGIN_METHOD => Ok(Value::String(format!(
                "OpaqueRef:{}-session-{login_number}",
                self.host
            ))),
            "session.logout" => Ok(Value::String(String::new())),
            _ => Err(SessionError::api(
                "MESSAGE_METHOD_UNKNOWN",
                vec![method.to_string()],
            )),
        }
    }
}

/// Factory handing out one [`MockTransport`] per host.
#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
    connects: Mutex<Vec<String>>,
}

impl MockTransportFactory {
    /// Create an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport for `host`, created on first use.
    #[must_use]
    pub fn transport(&self, host: &str) -> Arc<MockTransport> {
        Arc::clone(
            self.transports
                .lock()
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(MockTransport::new(host))),
        )
    }

    /// Hosts passed to `connect`, in order.
    #[must_use]
    pub fn connected_hosts(&self) -> Vec<String> {
        self.connects.lock().clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn connect(&self, host: &str) -> Result<Arc<dyn Transport>> {
        if host.trim().is_empty() {
            return Err(SessionError::Protocol("empty host address".to_string()));
        }
        self.connects.lock().push(host.to_string());
        Ok(self.transport(host))
    }
}
