use crate::models::endpoints::def_true;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

fn def_timeout_ms() -> u64 {
    10_000
}
fn def_max_attempts() -> u32 {
    3
}
fn def_initial_delay_ms() -> u64 {
    1_000
}
fn def_max_delay_ms() -> u64 {
    10_000
}
fn def_retryable_errors() -> Vec<String> {
    vec!["ECONNRESET".into(), "ETIMEDOUT".into()]
}
fn def_health_path() -> String {
    "/health".into()
}
fn def_health_interval() -> u64 {
    30
}
fn def_health_timeout() -> u64 {
    5
}
fn def_expected_status() -> u16 {
    200
}
fn def_healthy_threshold() -> u32 {
    2
}
fn def_unhealthy_threshold() -> u32 {
    3
}
fn def_failure_threshold() -> u32 {
    5
}
fn def_open_duration_ms() -> u64 {
    60_000
}
fn def_api_key_header() -> String {
    "x-api-key".into()
}

pub fn new_service_id() -> String {
    format!("svc_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ServiceType {
    #[serde(alias = "exchange")]
    Exchange,
    #[serde(alias = "payment")]
    Payment,
    #[serde(alias = "analytics")]
    Analytics,
    #[serde(alias = "notification")]
    Notification,
    #[serde(alias = "crm")]
    Crm,
    #[default]
    #[serde(alias = "custom")]
    Custom,
}

// ---------- services ----------
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: ServiceType,
    pub base_url: String,
    #[serde(default)]
    pub authentication: ServiceAuth,
    /// Per-attempt timeout in milliseconds.
    #[serde(default = "def_timeout_ms", rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub health_check: HealthCheckSpec,
    #[serde(default)]
    pub circuit_breaker: BreakerSpec,
    #[serde(default = "def_true")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Service {
    pub fn new(id: &str, base_url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind: ServiceType::Custom,
            base_url: base_url.to_string(),
            authentication: ServiceAuth::None,
            timeout_ms: def_timeout_ms(),
            retry_policy: RetryPolicy::default(),
            health_check: HealthCheckSpec::default(),
            circuit_breaker: BreakerSpec::default(),
            enabled: true,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn url_for(&self, path: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        if path.is_empty() {
            base.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", base, path)
        } else {
            format!("{}/{}", base, path)
        }
    }
}

/// Credentials the gateway presents to a backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServiceAuth {
    #[default]
    None,
    ApiKey {
        #[serde(default = "def_api_key_header")]
        header: String,
        #[serde(alias = "apiKey")]
        key: String,
    },
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

impl ServiceAuth {
    pub fn apply(&self, headers: &mut HeaderMap) {
        let (name, value) = match self {
            ServiceAuth::None => return,
            ServiceAuth::ApiKey { header, key } => (header.as_str(), key.clone()),
            ServiceAuth::Bearer { token } => ("authorization", format!("Bearer {}", token)),
            ServiceAuth::Basic { username, password } => (
                "authorization",
                format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password))),
            ),
        };
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(&value)) {
            (Ok(n), Ok(v)) => {
                headers.insert(n, v);
            }
            _ => tracing::warn!(header = name, "skipping invalid service credential header"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "def_true")]
    pub enabled: bool,
    #[serde(default = "def_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    #[serde(default = "def_initial_delay_ms", rename = "initialDelay")]
    pub initial_delay_ms: u64,
    #[serde(default = "def_max_delay_ms", rename = "maxDelay")]
    pub max_delay_ms: u64,
    /// Failure codes worth another attempt: `ETIMEDOUT`, `ECONNRESET`,
    /// `ECONNREFUSED` or `HTTP_<status>`.
    #[serde(default = "def_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: def_max_attempts(),
            backoff_strategy: BackoffStrategy::default(),
            initial_delay_ms: def_initial_delay_ms(),
            max_delay_ms: def_max_delay_ms(),
            retryable_errors: def_retryable_errors(),
        }
    }
}

impl RetryPolicy {
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Total attempts including the first one.
    pub fn attempts(&self) -> u32 {
        if self.enabled { self.max_attempts.max(1) } else { 1 }
    }

    pub fn is_retryable(&self, code: &str) -> bool {
        self.retryable_errors.iter().any(|c| c.eq_ignore_ascii_case(code))
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let n = attempt.max(1) as u64;
        let ms = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Linear => self.initial_delay_ms.saturating_mul(n),
            BackoffStrategy::Exponential => {
                let shift = (n - 1).min(32) as u32;
                self.initial_delay_ms.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "def_health_path")]
    pub endpoint: String,
    /// Seconds
    #[serde(default = "def_health_interval", rename = "interval")]
    pub interval_secs: u64,
    /// Seconds
    #[serde(default = "def_health_timeout", rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(default = "def_expected_status")]
    pub expected_status: u16,
    #[serde(default = "def_healthy_threshold")]
    pub healthy_threshold: u32,
    #[serde(default = "def_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: def_health_path(),
            interval_secs: def_health_interval(),
            timeout_secs: def_health_timeout(),
            expected_status: def_expected_status(),
            healthy_threshold: def_healthy_threshold(),
            unhealthy_threshold: def_unhealthy_threshold(),
        }
    }
}

impl HealthCheckSpec {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// When a failed backend call is reported to the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakerReporting {
    /// Once, after retries are exhausted.
    #[default]
    PerRequest,
    /// Every failed attempt.
    PerAttempt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSpec {
    #[serde(default = "def_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "def_open_duration_ms", rename = "openDuration")]
    pub open_duration_ms: u64,
    #[serde(default)]
    pub reporting: BreakerReporting,
}

impl Default for BreakerSpec {
    fn default() -> Self {
        Self {
            failure_threshold: def_failure_threshold(),
            open_duration_ms: def_open_duration_ms(),
            reporting: BreakerReporting::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_strategies() {
        let mut policy = RetryPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            ..RetryPolicy::default()
        };

        policy.backoff_strategy = BackoffStrategy::Fixed;
        assert_eq!(policy.delay_after(3), Duration::from_millis(100));

        policy.backoff_strategy = BackoffStrategy::Linear;
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));

        policy.backoff_strategy = BackoffStrategy::Exponential;
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(10), Duration::from_millis(1_000));
    }

    #[test]
    fn disabled_retry_policy_makes_one_attempt() {
        assert_eq!(RetryPolicy::disabled().attempts(), 1);
        assert_eq!(RetryPolicy::default().attempts(), 3);
        assert!(RetryPolicy::default().is_retryable("etimedout"));
        assert!(!RetryPolicy::default().is_retryable("HTTP_500"));
    }

    #[test]
    fn service_auth_headers() {
        let mut headers = HeaderMap::new();
        ServiceAuth::Basic { username: "gw".into(), password: "pw".into() }.apply(&mut headers);
        assert_eq!(headers["authorization"], "Basic Z3c6cHc=");

        let mut headers = HeaderMap::new();
        ServiceAuth::ApiKey { header: "x-api-key".into(), key: "secret_key".into() }
            .apply(&mut headers);
        assert_eq!(headers["x-api-key"], "secret_key");
    }

    #[test]
    fn url_joining() {
        let svc = Service::new("user_service", "http://localhost:3001/");
        assert_eq!(svc.url_for("/profile"), "http://localhost:3001/profile");
        assert_eq!(svc.url_for("health"), "http://localhost:3001/health");
        assert_eq!(svc.url_for(""), "http://localhost:3001");
    }
}
