//! Request and response model
//!
//! A [`NetworkRequest`] is built by the caller, handed to the dispatcher by
//! value and never mutated afterwards; internally it is shared as an
//! `Arc<NetworkRequest>` between the retry loop, the batcher and the
//! transport.

use crate::error::{NetworkError, Result};
use bytes::Bytes;
use netshape_core_resilience::ConnectionTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// HTTP method of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            other => Err(NetworkError::Config(format!("unknown HTTP method '{other}'"))),
        }
    }
}

/// Default request priority (higher = more urgent)
pub const DEFAULT_PRIORITY: i32 = 5;

/// An outbound request
#[derive(Debug, Clone)]
pub struct NetworkRequest {
    pub id: String,
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub body: Option<Bytes>,
    /// Bound on the transport call; `None` uses the dispatcher default
    pub timeout: Option<Duration>,
    /// Whether the dispatcher may retry this request
    pub retryable: bool,
    pub priority: i32,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NetworkRequest {
    /// Create a request with a generated id
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            method,
            headers: HashMap::new(),
            body: None,
            timeout: None,
            retryable: true,
            priority: DEFAULT_PRIORITY,
            metadata: HashMap::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(HttpMethod::Post, url).with_body(body)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Path component of the URL, without query or fragment
    pub fn path(&self) -> String {
        match Url::parse(&self.url) {
            Ok(url) => url.path().to_string(),
            Err(_) => self
                .url
                .split(['?', '#'])
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Non-empty path segments
    pub fn path_segments(&self) -> Vec<String> {
        self.path()
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Size of the body in bytes
    pub fn body_len(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }

    /// Connection pool key for this request's URL
    pub fn target(&self) -> Result<ConnectionTarget> {
        let url = Url::parse(&self.url).map_err(|e| NetworkError::InvalidRequest {
            endpoint: self.url.clone(),
            reason: e.to_string(),
        })?;
        let host = url.host_str().ok_or_else(|| NetworkError::InvalidRequest {
            endpoint: self.url.clone(),
            reason: "URL has no host".to_string(),
        })?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| NetworkError::InvalidRequest {
                endpoint: self.url.clone(),
                reason: format!("no known port for scheme '{}'", url.scheme()),
            })?;
        Ok(ConnectionTarget::new(host, port, url.scheme() == "https"))
    }
}

/// Response to exactly one [`NetworkRequest`]
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkResponse {
    /// Echoes the request id
    pub id: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
    /// Measured time of the transport call that produced this response
    pub response_time: Duration,
    /// Number of retries before this response (0 on first-try success)
    pub retry_count: u32,
}

impl NetworkResponse {
    pub fn new(id: impl Into<String>, status: u16) -> Self {
        Self {
            id: id.into(),
            status,
            headers: HashMap::new(),
            body: Bytes::new(),
            response_time: Duration::ZERO,
            retry_count: 0,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time = elapsed;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Grouping identifier: `"{METHOD}:/{first N path segments}"`
///
/// Derived from a request on demand; the dispatcher keys circuit breakers by
/// it and `execute_batch` groups by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey(String);

impl EndpointKey {
    /// Number of path segments kept by default
    pub const DEFAULT_DEPTH: usize = 2;

    pub fn from_request(request: &NetworkRequest, depth: usize) -> Self {
        let segments = request.path_segments();
        let prefix: Vec<&str> = segments.iter().take(depth).map(String::as_str).collect();
        EndpointKey(format!("{}:/{}", request.method, prefix.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EndpointKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
