use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use std::fmt;
use std::time::Duration;

pub const ETIMEDOUT: &str = "ETIMEDOUT";
pub const ECONNREFUSED: &str = "ECONNREFUSED";
pub const ECONNRESET: &str = "ECONNRESET";

#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
}

impl BackendRequest {
    pub fn get(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self { status, headers: HeaderMap::new(), body: body.into() }
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }
}

/// A failed backend attempt, classified by `code` for retry decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    pub code: String,
    pub message: String,
    /// Set when the backend answered with an error status.
    pub status: Option<u16>,
}

impl BackendFailure {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self { code: code.to_string(), message: message.into(), status: None }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(ETIMEDOUT, format!("no response within {}ms", after.as_millis()))
    }

    pub fn from_status(status: u16) -> Self {
        Self {
            code: format!("HTTP_{}", status),
            message: format!("backend answered {}", status),
            status: Some(status),
        }
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for BackendFailure {}

/// Transport to backend services. Implementations must not retry on their own.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn send(&self, req: BackendRequest) -> Result<BackendResponse, BackendFailure>;
}

/// Runs one attempt with a hard deadline. A fired deadline is an `ETIMEDOUT` failure.
pub async fn send_with_timeout(
    backend: &dyn Backend,
    req: BackendRequest,
) -> Result<BackendResponse, BackendFailure> {
    let limit = req.timeout;
    match tokio::time::timeout(limit, backend.send(req)).await {
        Ok(res) => res,
        Err(_) => Err(BackendFailure::timeout(limit)),
    }
}
