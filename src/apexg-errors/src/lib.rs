use http::StatusCode;
use thiserror::Error;

/// Everything the dispatch pipeline can fail with.
///
/// Admission failures (`NotFound` .. `RateLimited`) are terminal and never
/// touch a backend or a circuit breaker. `ServiceUnavailable` and
/// `BackendError` are produced after the breaker gate or after retries.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("endpoint not found")]
    NotFound,
    #[error("endpoint {0} is disabled")]
    EndpointDisabled(String),
    #[error("authentication failed")]
    Unauthenticated,
    #[error("rate limit exceeded")]
    RateLimited {
        limit: u64,
        remaining: u64,
        /// Unix seconds at which the current window resets.
        reset_at: i64,
    },
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("backend error: {message}")]
    BackendError {
        status: Option<u16>,
        message: String,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::EndpointDisabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BackendError { status, .. } => status
                .and_then(|s| StatusCode::from_u16(s).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message exposed to callers. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Internal(_) => "Internal server error".to_string(),
            GatewayError::ServiceUnavailable(_) => "Service unavailable".to_string(),
            other => other.to_string(),
        }
    }

    pub fn to_json(&self, request_id: &str) -> serde_json::Value {
        serde_json::json!({
            "error": self.public_message(),
            "requestId": request_id,
        })
    }

    pub fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::NotFound
                | GatewayError::EndpointDisabled(_)
                | GatewayError::Unauthenticated
                | GatewayError::RateLimited { .. }
        )
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::EndpointDisabled("ep".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(GatewayError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::RateLimited { limit: 1, remaining: 0, reset_at: 0 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::BackendError { status: None, message: "reset".into() }.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::BackendError { status: Some(500), message: "boom".into() }.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_details_are_hidden() {
        let err = GatewayError::Internal("db handle poisoned".into());
        let body = err.to_json("req-1");
        assert_eq!(body["error"], "Internal server error");
        assert_eq!(body["requestId"], "req-1");
    }
}
