//! Transport abstraction
//!
//! The dispatcher never speaks a wire protocol itself. A [`Transport`] opens
//! connections for the pool, sends single requests over a borrowed
//! connection, and optionally knows a batch endpoint that serves several
//! requests in one call.

use crate::error::TransportError;
use crate::request::{NetworkRequest, NetworkResponse};
use async_trait::async_trait;
use netshape_core_resilience::{ConnectionFactory, ConnectionTarget, ResilienceError};
use std::sync::Arc;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Connection handle kept in the pool
    ///
    /// Health checks borrow the handle across an await, so it must be `Sync`
    /// for the pool's futures to stay `Send`.
    type Connection: Send + Sync + 'static;

    /// Open a connection to `target`
    async fn connect(&self, target: &ConnectionTarget) -> Result<Self::Connection, TransportError>;

    /// Cheap liveness check for an idle connection
    async fn probe(&self, _conn: &Self::Connection) -> bool {
        true
    }

    /// Send one request
    async fn send(
        &self,
        conn: &mut Self::Connection,
        request: &NetworkRequest,
    ) -> Result<NetworkResponse, TransportError>;

    /// Batch endpoint able to serve `request`, if any
    fn batch_route(&self, _request: &NetworkRequest) -> Option<String> {
        None
    }

    /// Send several requests to `route` in one call.
    ///
    /// Responses are matched to requests by position.
    async fn send_batch(
        &self,
        _conn: &mut Self::Connection,
        route: &str,
        _requests: &[Arc<NetworkRequest>],
    ) -> Result<Vec<NetworkResponse>, TransportError> {
        Err(TransportError::protocol(format!(
            "batch route '{route}' is not supported"
        )))
    }
}

/// Adapts a [`Transport`] to the pool's [`ConnectionFactory`]
pub struct TransportConnector<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> TransportConnector<T> {
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: Transport> ConnectionFactory<T::Connection> for TransportConnector<T> {
    async fn create(&self, target: &ConnectionTarget) -> Result<T::Connection, ResilienceError> {
        self.transport
            .connect(target)
            .await
            .map_err(|e| ResilienceError::ConnectionFailed {
                target: target.to_string(),
                reason: e.to_string(),
            })
    }

    async fn is_healthy(&self, conn: &T::Connection) -> bool {
        self.transport.probe(conn).await
    }
}

#[cfg(feature = "http")]
pub use http::{HttpConnection, HttpTransport};

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::request::HttpMethod;
    use std::collections::HashMap;
    use std::time::{Duration, Instant};

    /// HTTP transport on top of `reqwest`
    ///
    /// Each pooled connection owns a `reqwest::Client` limited to one idle
    /// socket, so the pool (not reqwest) decides how many connections exist.
    /// Server errors (5xx) come back as [`TransportErrorKind::Status`]
    /// errors; everything else is a response.
    ///
    /// [`TransportErrorKind::Status`]: crate::error::TransportErrorKind::Status
    #[derive(Debug, Clone)]
    pub struct HttpTransport {
        user_agent: String,
        connect_timeout: Duration,
        default_headers: HashMap<String, String>,
    }

    impl Default for HttpTransport {
        fn default() -> Self {
            Self {
                user_agent: format!("netshape/{}", env!("CARGO_PKG_VERSION")),
                connect_timeout: Duration::from_secs(10),
                default_headers: HashMap::new(),
            }
        }
    }

    impl HttpTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
            self.user_agent = agent.into();
            self
        }

        pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
            self.connect_timeout = timeout;
            self
        }

        /// Header sent with every request (e.g. an authorization token)
        pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
            self.default_headers.insert(name.into(), value.into());
            self
        }
    }

    /// A `reqwest` client bound to one target
    #[derive(Debug)]
    pub struct HttpConnection {
        client: reqwest::Client,
        target: ConnectionTarget,
    }

    impl HttpConnection {
        pub fn target(&self) -> &ConnectionTarget {
            &self.target
        }
    }

    fn method(m: HttpMethod) -> reqwest::Method {
        match m {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::timeout(err.to_string())
        } else if err.is_connect() {
            TransportError::connect(err.to_string())
        } else if err.is_decode() || err.is_body() {
            TransportError::protocol(err.to_string())
        } else {
            TransportError::other(err.to_string())
        }
    }

    #[async_trait]
    impl Transport for HttpTransport {
        type Connection = HttpConnection;

        async fn connect(&self, target: &ConnectionTarget) -> Result<HttpConnection, TransportError> {
            let client = reqwest::Client::builder()
                .user_agent(self.user_agent.clone())
                .connect_timeout(self.connect_timeout)
                .pool_max_idle_per_host(1)
                .https_only(target.secure)
                .build()
                .map_err(|e| TransportError::connect(e.to_string()))?;
            tracing::debug!(target_addr = %target, "http client created");
            Ok(HttpConnection {
                client,
                target: target.clone(),
            })
        }

        async fn send(
            &self,
            conn: &mut HttpConnection,
            request: &NetworkRequest,
        ) -> Result<NetworkResponse, TransportError> {
            let mut builder = conn.client.request(method(request.method), &request.url);
            for (name, value) in self.default_headers.iter().chain(request.headers.iter()) {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let started = Instant::now();
            let response = builder.send().await.map_err(classify)?;
            let status = response.status();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect();
            let body = response.bytes().await.map_err(classify)?;

            if status.is_server_error() {
                return Err(TransportError::status(
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("server error"),
                ));
            }

            let mut out = NetworkResponse::new(request.id.clone(), status.as_u16())
                .with_body(body)
                .with_response_time(started.elapsed());
            out.headers = headers;
            Ok(out)
        }
    }
}
