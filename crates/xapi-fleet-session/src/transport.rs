//! RPC transports.
//!
//! A [`Transport`] carries one call to one host and returns the interpreted
//! result: the `Value` of a `Success` response, or [`SessionError::Api`] for
//! a `Failure`. Retry and session handling live above this layer.

use std::error::Error as _;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Result, SessionError, TransportCode};
use crate::xmlrpc;
use crate::SessionConfig;

/// A channel to a single remote host.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one call.
    ///
    /// # Errors
    ///
    /// Returns a transport, protocol, or API error.
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value>;
}

/// Creates transports bound to a host.
pub trait TransportFactory: Send + Sync {
    /// Create a transport for `host`.
    ///
    /// # Errors
    ///
    /// Returns an error if the host address is unusable.
    fn connect(&self, host: &str) -> Result<Arc<dyn Transport>>;
}

/// Interpret a decoded XAPI response envelope.
///
/// # Errors
///
/// Returns [`SessionError::Api`] for a `Failure` status and
/// [`SessionError::Protocol`] for anything that is not an envelope.
pub fn interpret_response(response: Value) -> Result<Value> {
    let Value::Object(mut envelope) = response else {
        return Err(SessionError::Protocol(format!(
            "response is not a struct: {response}"
        )));
    };

    match envelope.get("Status").and_then(Value::as_str) {
        Some("Success") => Ok(envelope.remove("Value").unwrap_or(Value::Null)),
        Some("Failure") => {
            let description = match envelope.remove("ErrorDescription") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            };
            let mut parts = description.into_iter().map(|item| match item {
                Value::String(s) => s,
                other => other.to_string(),
            });
            let code = parts.next().unwrap_or_else(|| "UNKNOWN_ERROR".to_string());
            Err(SessionError::api(code, parts.collect()))
        }
        _ => Err(SessionError::Protocol(format!(
            "response has no status: {}",
            Value::Object(envelope)
        ))),
    }
}

/// Build the endpoint URL for a host.
///
/// Bare hosts use HTTPS on the default port. Addresses that already carry a
/// scheme are used as-is.
#[must_use]
pub fn endpoint_url(host: &str) -> String {
    if host.contains("://") {
        format!("{}/", host.trim_end_matches('/'))
    } else {
        format!("https://{host}/")
    }
}

/// Map a reqwest error to a transport code.
fn classify_http_error(error: &reqwest::Error) -> TransportCode {
    if error.is_timeout() {
        return TransportCode::TimedOut;
    }

    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            return match io_error.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => TransportCode::ConnectionReset,
                io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                    TransportCode::HostUnreachable
                }
                io::ErrorKind::ConnectionRefused => TransportCode::ConnectionRefused,
                io::ErrorKind::TimedOut => TransportCode::TimedOut,
                _ => TransportCode::Other,
            };
        }
        source = cause.source();
    }

    // hyper reports a peer closing mid-response without an io::Error.
    if error.to_string().contains("connection closed")
        || format!("{error:?}").contains("IncompleteMessage")
    {
        return TransportCode::ConnectionReset;
    }

    TransportCode::Other
}

/// XML-RPC over HTTP(S).
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// Create a transport for `host` sharing an existing client.
    #[must_use]
    pub fn new(client: reqwest::Client, host: &str) -> Self {
        Self {
            client,
            url: endpoint_url(host),
        }
    }

    /// The endpoint this transport posts to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let body = xmlrpc::encode_call(method, &params);

        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| SessionError::transport(classify_http_error(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Protocol(format!("HTTP {status}")));
        }

        let text = response
            .text()
            .await
            .map_err(|e| SessionError::transport(classify_http_error(&e), e.to_string()))?;

        interpret_response(xmlrpc::decode_response(&text)?)
    }
}

/// Factory for [`HttpTransport`]s sharing one connection pool.
pub struct HttpTransportFactory {
    client: reqwest::Client,
}

impl HttpTransportFactory {
    /// Build the HTTP client from the session configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(config: &SessionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| {
                SessionError::transport(TransportCode::Other, format!("HTTP client: {e}"))
            })?;

        Ok(Self { client })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn connect(&self, host: &str) -> Result<Arc<dyn Transport>> {
        if host.trim().is_empty() {
            return Err(SessionError::Protocol("empty host address".to_string()));
        }
        Ok(Arc::new(HttpTransport::new(self.client.clone(), host)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn success_body(value: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?><methodResponse><params><param><value><struct>\
             <member><name>Status</name><value>Success</value></member>\
             <member><name>Value</name><value>{value}</value></member>\
             </struct></value></param></params></methodResponse>"
        )
    }

    #[test]
    fn endpoint_urls() {
        assert_eq!(endpoint_url("xen1"), "https://xen1/");
        assert_eq!(endpoint_url("10.0.0.1:8443"), "https://10.0.0.1:8443/");
        assert_eq!(endpoint_url("http://127.0.0.1:9000/"), "http://127.0.0.1:9000/");
    }

    #[test]
    fn interprets_envelopes() {
        assert_eq!(
            interpret_response(json!({"Status": "Success", "Value": "OpaqueRef:s"})).unwrap(),
            json!("OpaqueRef:s")
        );

        let err = interpret_response(json!({
            "Status": "Failure",
            "ErrorDescription": ["HOST_IS_SLAVE", "10.0.0.2"]
        }))
        .unwrap_err();
        assert_eq!(err, SessionError::api("HOST_IS_SLAVE", vec!["10.0.0.2".into()]));

        assert!(matches!(
            interpret_response(json!({"Value": 1})),
            Err(SessionError::Protocol(_))
        ));
        assert!(matches!(
            interpret_response(json!("bare")),
            Err(SessionError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn http_call_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("content-type", "text/xml"))
            .and(body_string_contains("session.login_with_password"))
            .respond_with(ResponseTemplate::new(200).set_body_string(success_body("OpaqueRef:token")))
            .expect(1)
            .mount(&server)
            .await;

        let factory = HttpTransportFactory::new(&SessionConfig::default()).unwrap();
        let transport = factory.connect(&server.uri()).unwrap();
        let value = transport
            .call("session.login_with_password", vec![json!("root"), json!("pw")])
            .await
            .unwrap();

        assert_eq!(value, json!("OpaqueRef:token"));
    }

    #[tokio::test]
    async fn http_call_failure_envelope() {
        let server = MockServer::start().await;
        let body = "<methodResponse><params><param><value><struct>\
                    <member><name>Status</name><value>Failure</value></member>\
                    <member><name>ErrorDescription</name><value><array><data>\
                    <value>SESSION_INVALID</value><value>OpaqueRef:old</value>\
                    </data></array></value></member>\
                    </struct></value></param></params></methodResponse>";
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let factory = HttpTransportFactory::new(&SessionConfig::default()).unwrap();
        let transport = factory.connect(&server.uri()).unwrap();
        let err = transport.call("VM.get_all", vec![]).await.unwrap_err();

        assert_eq!(err.code(), Some("SESSION_INVALID"));
    }

    #[tokio::test]
    async fn http_error_status_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let factory = HttpTransportFactory::new(&SessionConfig::default()).unwrap();
        let transport = factory.connect(&server.uri()).unwrap();
        let err = transport.call("pool.get_all", vec![]).await.unwrap_err();

        assert!(matches!(err, SessionError::Protocol(_)));
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        // Bind then drop to get a port with no listener.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let factory = HttpTransportFactory::new(&SessionConfig::default()).unwrap();
        let transport = factory
            .connect(&format!("http://127.0.0.1:{port}"))
            .unwrap();
        let err = transport.call("pool.get_all", vec![]).await.unwrap_err();

        assert!(matches!(err, SessionError::Transport { .. }));
    }

    #[test]
    fn empty_host_is_rejected() {
        let factory = HttpTransportFactory::new(&SessionConfig::default()).unwrap();
        assert!(factory.connect("  ").is_err());
    }
}
