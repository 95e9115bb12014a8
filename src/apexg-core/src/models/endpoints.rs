use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub(crate) fn def_true() -> bool {
    true
}

fn def_version() -> String {
    "v1".into()
}

fn def_api_key_header() -> String {
    "x-api-key".into()
}

pub fn new_endpoint_id() -> String {
    format!("ep_{}", Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(alias = "get")]
    GET,
    #[serde(alias = "post")]
    POST,
    #[serde(alias = "put")]
    PUT,
    #[serde(alias = "delete")]
    DELETE,
    #[serde(alias = "patch")]
    PATCH,
    #[serde(alias = "head")]
    HEAD,
    #[serde(alias = "options")]
    OPTIONS,
}

impl HttpMethod {
    pub fn from_http(method: &http::Method) -> Option<Self> {
        match *method {
            http::Method::GET => Some(HttpMethod::GET),
            http::Method::POST => Some(HttpMethod::POST),
            http::Method::PUT => Some(HttpMethod::PUT),
            http::Method::DELETE => Some(HttpMethod::DELETE),
            http::Method::PATCH => Some(HttpMethod::PATCH),
            http::Method::HEAD => Some(HttpMethod::HEAD),
            http::Method::OPTIONS => Some(HttpMethod::OPTIONS),
            _ => None,
        }
    }

    pub fn as_http(&self) -> http::Method {
        match self {
            HttpMethod::GET => http::Method::GET,
            HttpMethod::POST => http::Method::POST,
            HttpMethod::PUT => http::Method::PUT,
            HttpMethod::DELETE => http::Method::DELETE,
            HttpMethod::PATCH => http::Method::PATCH,
            HttpMethod::HEAD => http::Method::HEAD,
            HttpMethod::OPTIONS => http::Method::OPTIONS,
        }
    }
}

// ---------- endpoints ----------
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Empty ids are replaced by a generated one at registration.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub method: HttpMethod,
    /// Route pattern, `:name` segments are parameters.
    pub path: String,
    pub target_service: String,
    /// Path appended to the service base url. Parameters from `path` are substituted.
    #[serde(default, alias = "targetUrl")]
    pub target_path: String,
    #[serde(default = "def_true")]
    pub enabled: bool,
    #[serde(default = "def_version")]
    pub version: String,
    #[serde(default)]
    pub authentication: AuthPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    #[serde(default)]
    pub caching: CachePolicy,
    #[serde(default)]
    pub transformation: Transformation,
    #[serde(default)]
    pub documentation: Option<String>,
}

impl Endpoint {
    pub fn new(method: HttpMethod, path: &str, target_service: &str) -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            method,
            path: path.to_string(),
            target_service: target_service.to_string(),
            target_path: String::new(),
            enabled: true,
            version: def_version(),
            authentication: AuthPolicy::None,
            rate_limit: RateLimitPolicy::default(),
            caching: CachePolicy::default(),
            transformation: Transformation::default(),
            documentation: None,
        }
    }

    pub fn is_cacheable(&self, method: &http::Method) -> bool {
        self.caching.enabled && *method == http::Method::GET
    }

    /// Target path with `:name` placeholders filled from the matched parameters.
    pub fn resolve_target_path(&self, params: &HashMap<String, String>) -> String {
        if self.target_path.is_empty() {
            return String::new();
        }
        self.target_path
            .split('/')
            .map(|seg| match seg.strip_prefix(':') {
                Some(name) if !name.is_empty() => params
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| seg.to_string()),
                _ => seg.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Inbound caller authentication.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AuthPolicy {
    #[default]
    None,
    ApiKey {
        #[serde(default = "def_api_key_header")]
        header_name: String,
        #[serde(default)]
        query_param: Option<String>,
        /// api key -> caller id
        #[serde(default)]
        keys: HashMap<String, String>,
    },
    #[serde(alias = "jwt")]
    Bearer {
        /// static token -> caller id
        #[serde(default)]
        tokens: HashMap<String, String>,
        /// HS256 secret for JWT verification
        #[serde(default)]
        secret: Option<String>,
        #[serde(default)]
        issuer: Option<String>,
    },
    Basic {
        /// username -> password
        #[serde(default)]
        users: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowStrategy {
    #[default]
    Fixed,
    Sliding,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Request ceiling per window.
    #[serde(default)]
    pub requests: u64,
    /// Window length in seconds.
    #[serde(default, rename = "window")]
    pub window_secs: u64,
    #[serde(default)]
    pub strategy: WindowStrategy,
}

impl RateLimitPolicy {
    pub fn fixed(requests: u64, window_secs: u64) -> Self {
        Self { enabled: true, requests, window_secs, strategy: WindowStrategy::Fixed }
    }

    pub fn sliding(requests: u64, window_secs: u64) -> Self {
        Self { enabled: true, requests, window_secs, strategy: WindowStrategy::Sliding }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CachePolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds
    #[serde(default, rename = "ttl")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Transformation {
    #[serde(default)]
    pub request: Vec<TransformRule>,
    #[serde(default)]
    pub response: Vec<TransformRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformOp {
    Add,
    Remove,
    Modify,
    Rename,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransformTarget {
    #[default]
    Header,
    Body,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformRule {
    #[serde(rename = "type")]
    pub op: TransformOp,
    #[serde(default)]
    pub target: TransformTarget,
    /// Header name, or dot-separated key path into a JSON body.
    pub path: String,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// New name for `rename`.
    #[serde(default)]
    pub to: Option<String>,
}
