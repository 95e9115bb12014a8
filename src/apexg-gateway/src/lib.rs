pub mod auth;
pub mod dispatcher;
pub mod http_backend;
pub mod maintenance;
pub mod transform;

pub use dispatcher::*;
pub use http_backend::HttpBackend;
pub use maintenance::{Maintenance, SweepReport, sweep};

use anyhow::Result;
use apexg_errors::GatewayError;
use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header::HeaderValue};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::tokio::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const APP_NAME: &str = "ApexG";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub name: String,
    /// Admin routes live under this prefix, e.g. `/_gateway/stats`.
    pub admin_prefix: String,
    pub trust_forwarded_for: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "apexg".into(),
            admin_prefix: "/_gateway".into(),
            trust_forwarded_for: false,
        }
    }
}

/// HTTP/1 front-end feeding the dispatcher.
#[derive(Clone)]
pub struct Gateway {
    dispatcher: Arc<Dispatcher>,
    settings: Arc<ServerSettings>,
}

impl Gateway {
    pub fn new(dispatcher: Arc<Dispatcher>, settings: ServerSettings) -> Self {
        Self { dispatcher, settings: Arc::new(settings) }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("{} ({}) listening on {}", APP_NAME, self.settings.name, listener.local_addr()?);
        loop {
            let (stream, remote) = listener.accept().await?;
            let me = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let conn = http1::Builder::new().serve_connection(
                    io,
                    service_fn(move |req| {
                        let me = me.clone();
                        async move { me.handle(req, remote).await }
                    }),
                );
                if let Err(e) = conn.await {
                    debug!("conn error: {e}");
                }
            });
        }
    }

    fn client_id(&self, req: &Request<Incoming>, remote: SocketAddr) -> String {
        if self.settings.trust_forwarded_for {
            let forwarded = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(ip) = forwarded {
                return ip.to_string();
            }
        }
        remote.ip().to_string()
    }

    fn is_admin_path(&self, path: &str) -> bool {
        match path.strip_prefix(self.settings.admin_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    async fn handle(&self, req: Request<Incoming>, remote: SocketAddr) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let start = Instant::now();
        let client_id = self.client_id(&req, remote);
        let (parts, body) = req.into_parts();

        if self.is_admin_path(parts.uri.path()) {
            let request_id = uuid::Uuid::new_v4().to_string();
            let resp = self.admin(&parts.method, parts.uri.path(), parts.uri.query(), &request_id);
            return Ok(self.default_headers(resp, &request_id, start));
        }

        let body_bytes = body.collect().await?.to_bytes();
        let inbound = InboundRequest {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().map(str::to_string),
            headers: parts.headers,
            body: body_bytes,
            client_id,
        };

        let dispatched = self.dispatcher.dispatch(inbound).await;
        info!(
            request_id = %dispatched.request_id,
            method = %parts.method,
            path = %parts.uri.path(),
            status = dispatched.status(),
            latency_ms = dispatched.latency.as_millis() as u64,
            "request handled"
        );

        let mut resp = match &dispatched.result {
            Ok(r) => {
                let mut resp = Response::new(Full::new(r.body.clone()));
                *resp.status_mut() = StatusCode::from_u16(r.status).unwrap_or(StatusCode::BAD_GATEWAY);
                resp.headers_mut().extend(r.headers.clone());
                match r.cache {
                    CacheStatus::Hit => {
                        resp.headers_mut().insert("X-Cache", HeaderValue::from_static("HIT"));
                    }
                    CacheStatus::Miss => {
                        resp.headers_mut().insert("X-Cache", HeaderValue::from_static("MISS"));
                    }
                    CacheStatus::Bypass => {}
                }
                resp
            }
            Err(e) => error_response(e, &dispatched.request_id),
        };

        if let Some(decision) = &dispatched.rate_limit {
            let h = resp.headers_mut();
            h.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
            h.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining));
            h.insert("X-RateLimit-Reset", HeaderValue::from(decision.reset_at_unix()));
        }

        Ok(self.default_headers(resp, &dispatched.request_id, start))
    }

    fn admin(&self, method: &Method, path: &str, query: Option<&str>, request_id: &str) -> Response<Full<Bytes>> {
        if method != Method::GET {
            return simple(StatusCode::METHOD_NOT_ALLOWED, Bytes::from_static(b"method not allowed"));
        }
        let sub = &path[self.settings.admin_prefix.len()..];
        let value = match sub.trim_end_matches('/') {
            "/stats" => {
                let range = query
                    .and_then(|q| {
                        form_urlencoded::parse(q.as_bytes())
                            .find(|(k, _)| k == "range")
                            .map(|(_, v)| v.into_owned())
                    })
                    .unwrap_or_else(|| "1h".to_string());
                serde_json::to_value(self.dispatcher.stats(&range))
            }
            "/health" => serde_json::to_value(self.dispatcher.services_health()),
            "/endpoints" => {
                let list: Vec<_> = self.dispatcher.endpoints().list();
                serde_json::to_value(list.iter().map(|e| e.as_ref()).collect::<Vec<_>>())
            }
            _ => return error_response(&GatewayError::NotFound, request_id),
        };
        match value {
            Ok(v) => json_response(StatusCode::OK, &v),
            Err(e) => {
                error!("admin serialization failed: {e}");
                error_response(&GatewayError::Internal(e.to_string()), request_id)
            }
        }
    }

    fn default_headers(&self, mut resp: Response<Full<Bytes>>, request_id: &str, start: Instant) -> Response<Full<Bytes>> {
        let latency_ms = start.elapsed().as_millis().to_string();
        let server = format!("{}/{}", APP_NAME, APP_VERSION);
        let h = resp.headers_mut();
        h.insert("Via", HeaderValue::from_static(APP_NAME));
        if let Ok(v) = HeaderValue::from_str(&server) {
            h.insert("Server", v);
        }
        if let Ok(v) = HeaderValue::from_str(&latency_ms) {
            h.insert("X-Latency", v);
        }
        if let Ok(v) = HeaderValue::from_str(request_id) {
            h.insert("X-Request-Id", v);
        }
        resp
    }
}

fn simple(status: StatusCode, body: Bytes) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body));
    *resp.status_mut() = status;
    resp
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut resp = simple(status, Bytes::from(value.to_string()));
    resp.headers_mut()
        .insert("Content-Type", HeaderValue::from_static("application/json"));
    resp
}

fn error_response(err: &GatewayError, request_id: &str) -> Response<Full<Bytes>> {
    json_response(err.status(), &err.to_json(request_id))
}
