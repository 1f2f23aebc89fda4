//! Authenticated session to one pool endpoint.
//!
//! A [`RemoteSession`] owns the login token and the transport target. Calls
//! go through [`RemoteSession::call`], which attaches the token and applies
//! the retry rules of [`crate::policy`]. Logins are single-flight: every
//! caller waiting for a token awaits the same shared future.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use xapi_fleet_core::RawId;

use crate::error::{Result, SessionError};
use crate::policy::{self, RetryDecision};
use crate::transport::{Transport, TransportFactory};
use crate::SessionConfig;

/// Login method name.
pub const LOGIN_METHOD: &str = "session.login_with_password";
/// Logout method name.
pub const LOGOUT_METHOD: &str = "session.logout";

type LoginFuture = Shared<BoxFuture<'static, Result<String>>>;

/// Login credentials for a pool.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Create credentials.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The pool an endpoint is master of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    /// Remote reference of the pool object.
    pub pool_ref: RawId,
    /// Pool UUID, also its domain id.
    pub pool_uuid: String,
    /// Remote reference of the master host.
    pub master_ref: RawId,
    /// Human-readable pool name.
    pub name_label: String,
}

impl PoolInfo {
    fn from_record(pool_ref: &str, record: &Value) -> Result<Self> {
        let field = |name: &str| record.get(name).and_then(Value::as_str);
        let pool_uuid = field("uuid")
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| SessionError::Protocol(format!("pool {pool_ref} has no uuid")))?;

        Ok(Self {
            pool_ref: RawId::new(pool_ref),
            pool_uuid: pool_uuid.to_string(),
            master_ref: RawId::new(field("master").unwrap_or(RawId::NULL_REF)),
            name_label: field("name_label").unwrap_or_default().to_string(),
        })
    }
}

/// Whether `method` leaves remote state untouched.
#[must_use]
pub fn is_read_only_method(method: &str) -> bool {
    let Some((class, action)) = method.split_once('.') else {
        return false;
    };
    class == "session" || (class == "event" && action == "from") || action.starts_with("get_")
}

struct Target {
    host: String,
    transport: Arc<dyn Transport>,
}

struct Inner {
    credentials: Credentials,
    config: SessionConfig,
    factory: Arc<dyn TransportFactory>,
    target: RwLock<Target>,
    login: Mutex<Option<LoginFuture>>,
    read_only: AtomicBool,
    disconnected: AtomicBool,
    pool: RwLock<Option<PoolInfo>>,
}

/// A self-healing session to one pool endpoint.
///
/// Cheap to clone; clones share the token and transport.
#[derive(Clone)]
pub struct RemoteSession {
    inner: Arc<Inner>,
}

impl fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSession")
            .field("host", &self.host())
            .field("read_only", &self.is_read_only())
            .finish_non_exhaustive()
    }
}

impl RemoteSession {
    /// Create a session for `host`. No request is made until the first
    /// login or call.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory rejects the host.
    pub fn new(
        host: impl Into<String>,
        credentials: Credentials,
        read_only: bool,
        config: SessionConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let host = host.into();
        let transport = factory.connect(&host)?;

        Ok(Self {
            inner: Arc::new(Inner {
                credentials,
                config,
                factory,
                target: RwLock::new(Target { host, transport }),
                login: Mutex::new(None),
                read_only: AtomicBool::new(read_only),
                disconnected: AtomicBool::new(false),
                pool: RwLock::new(None),
            }),
        })
    }

    /// The host calls are currently sent to.
    #[must_use]
    pub fn host(&self) -> String {
        self.inner.host()
    }

    /// The credentials this session logs in with.
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    /// Returns `true` if state-changing calls are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.inner.read_only.load(Ordering::Acquire)
    }

    /// Allow or refuse state-changing calls from now on.
    pub fn set_read_only(&self, read_only: bool) {
        self.inner.read_only.store(read_only, Ordering::Release);
    }

    /// The pool discovered by [`connect`](Self::connect), if any.
    #[must_use]
    pub fn pool(&self) -> Option<PoolInfo> {
        self.inner.pool.read().clone()
    }

    /// The session's configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Log in and return the session token.
    ///
    /// A login already in progress is joined instead of starting another.
    ///
    /// # Errors
    ///
    /// Returns the login failure, e.g. `SESSION_AUTHENTICATION_FAILED`.
    pub async fn login(&self) -> Result<String> {
        let login = {
            let mut slot = self.inner.login.lock();
            let pending = slot
                .as_ref()
                .filter(|login| login.peek().is_none())
                .cloned();
            match pending {
                Some(login) => login,
                None => {
                    let fresh = self.inner.start_login();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };
        login.await
    }

    /// Call `method` with the session token prepended to `params`.
    ///
    /// # Errors
    ///
    /// Returns `Disconnected` after [`disconnect`](Self::disconnect),
    /// `ReadOnly` for a state-changing method on a read-only session, and
    /// otherwise the first failure the retry rules do not absorb.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.inner.ensure_connected()?;
        if self.is_read_only() && !is_read_only_method(method) {
            return Err(SessionError::ReadOnly(method.to_string()));
        }
        self.inner.invoke(method, params, true).await
    }

    /// Point the session at another host and log in again there.
    ///
    /// Does nothing if `host` is already the target.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory rejects the host.
    pub fn change_host(&self, host: &str) -> Result<()> {
        self.inner.change_host(host)
    }

    /// Log in and discover the pool this endpoint is master of.
    ///
    /// # Errors
    ///
    /// Returns the login failure or any failure of the pool lookup.
    pub async fn connect(&self) -> Result<PoolInfo> {
        self.inner.disconnected.store(false, Ordering::Release);
        self.login().await?;

        let pools = self.call("pool.get_all", Vec::new()).await?;
        let pool_ref = pools
            .as_array()
            .and_then(|refs| refs.first())
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Protocol("endpoint reports no pool".to_string()))?
            .to_string();

        let record = self
            .call("pool.get_record", vec![Value::String(pool_ref.clone())])
            .await?;
        let info = PoolInfo::from_record(&pool_ref, &record)?;

        tracing::info!(
            host = %self.host(),
            pool_uuid = %info.pool_uuid,
            pool_name = %info.name_label,
            "Connected to pool"
        );

        *self.inner.pool.write() = Some(info.clone());
        Ok(info)
    }

    /// Log out and refuse further calls.
    ///
    /// Logout is best-effort; its failure is logged and ignored.
    pub async fn disconnect(&self) {
        self.inner.disconnected.store(true, Ordering::Release);

        let login = self.inner.login.lock().take();
        let token = login.and_then(|login| login.peek().and_then(|r| r.as_ref().ok()).cloned());

        if let Some(token) = token {
            let transport = Arc::clone(&self.inner.target.read().transport);
            if let Err(error) = transport
                .call(LOGOUT_METHOD, vec![Value::String(token)])
                .await
            {
                tracing::debug!(host = %self.host(), error = %error, "Logout failed");
            }
        }

        tracing::info!(host = %self.host(), "Session disconnected");
    }
}

impl Inner {
    fn host(&self) -> String {
        self.target.read().host.clone()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.disconnected.load(Ordering::Acquire) {
            Err(SessionError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Start a login without installing it.
    fn start_login(self: &Arc<Self>) -> LoginFuture {
        let weak: Weak<Self> = Arc::downgrade(self);
        async move {
            match weak.upgrade() {
                Some(inner) => inner.log_in().await,
                None => Err(SessionError::Disconnected),
            }
        }
        .boxed()
        .shared()
    }

    async fn log_in(self: &Arc<Self>) -> Result<String> {
        let params = vec![
            Value::String(self.credentials.username.clone()),
            Value::String(self.credentials.password.clone()),
        ];
        match self.invoke(LOGIN_METHOD, params, false).await? {
            Value::String(token) if self.disconnected.load(Ordering::Acquire) => {
                // Disconnected mid-login; nothing else will log this token out.
                let transport = Arc::clone(&self.target.read().transport);
                if let Err(error) = transport
                    .call(LOGOUT_METHOD, vec![Value::String(token)])
                    .await
                {
                    tracing::debug!(host = %self.host(), error = %error, "Logout failed");
                }
                Err(SessionError::Disconnected)
            }
            Value::String(token) => {
                tracing::debug!(host = %self.host(), "Logged in");
                Ok(token)
            }
            other => Err(SessionError::Protocol(format!(
                "login returned a non-string token: {other}"
            ))),
        }
    }

    /// The current token, logging in if there is none or the last login
    /// failed.
    async fn token(self: &Arc<Self>) -> Result<String> {
        self.ensure_connected()?;
        let login = {
            let mut slot = self.login.lock();
            let usable = slot
                .as_ref()
                .filter(|login| !matches!(login.peek(), Some(Err(_))))
                .cloned();
            match usable {
                Some(login) => login,
                None => {
                    let fresh = self.start_login();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };
        login.await
    }

    /// Replace the token unless someone already has since `stale` failed.
    fn renew_login(self: &Arc<Self>, stale: &str) {
        if self.ensure_connected().is_err() {
            return;
        }
        let mut slot = self.login.lock();
        let already_renewed = match slot.as_ref().map(Shared::peek) {
            Some(None) => true,
            Some(Some(Ok(current))) => current != stale,
            Some(Some(Err(_))) | None => false,
        };
        if !already_renewed {
            tracing::debug!(host = %self.host(), "Session token invalid, logging in again");
            *slot = Some(self.start_login());
        }
    }

    /// Retarget the transport. Returns `false` if `host` is already the target.
    fn switch_target(&self, host: &str) -> Result<bool> {
        let mut target = self.target.write();
        if target.host == host {
            return Ok(false);
        }
        let transport = self.factory.connect(host)?;
        tracing::info!(from = %target.host, to = %host, "Switching pool master");
        *target = Target {
            host: host.to_string(),
            transport,
        };
        Ok(true)
    }

    fn change_host(self: &Arc<Self>, host: &str) -> Result<()> {
        if self.switch_target(host)? && self.ensure_connected().is_ok() {
            *self.login.lock() = Some(self.start_login());
        }
        Ok(())
    }

    /// Call with retries. The login call itself is unauthenticated and only
    /// follows redirects by retargeting, since it is the login.
    async fn invoke(
        self: &Arc<Self>,
        method: &str,
        params: Vec<Value>,
        authenticated: bool,
    ) -> Result<Value> {
        let mut previous: Option<String> = None;

        loop {
            self.ensure_connected()?;
            let token = if authenticated {
                Some(self.token().await?)
            } else {
                None
            };

            let mut args = Vec::with_capacity(params.len() + 1);
            if let Some(token) = &token {
                args.push(Value::String(token.clone()));
            }
            args.extend(params.iter().cloned());

            let (sent_to, transport) = {
                let target = self.target.read();
                (target.host.clone(), Arc::clone(&target.transport))
            };

            let result = transport.call(method, args).await;
            if authenticated {
                self.ensure_connected()?;
            }
            let error = match result {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            match policy::classify(&error, previous.as_deref()) {
                RetryDecision::RetryAfterDelay => {
                    tracing::debug!(
                        host = %sent_to,
                        method,
                        code = error.code().unwrap_or_default(),
                        "Call failed, retrying after delay"
                    );
                    tokio::time::sleep(self.config.retry_delay()).await;
                }
                RetryDecision::Relogin if authenticated => {
                    if let Some(stale) = &token {
                        self.renew_login(stale);
                    }
                }
                RetryDecision::Redirect(master) if master != sent_to => {
                    if authenticated {
                        self.change_host(&master)?;
                    } else {
                        self.switch_target(&master)?;
                    }
                }
                _ => return Err(error),
            }

            previous = error.code().map(str::to_owned);
        }
    }
}
