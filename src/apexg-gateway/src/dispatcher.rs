use crate::{auth, transform};
use apexg_core::{
    Backend, BackendFailure, BackendRequest, BackendResponse, BreakerPermit, BreakerReporting,
    CachedResponse, Endpoint, EndpointRegistry, FanoutSink, GatewayStats, HealthMonitor, HttpMethod,
    MetricsSink, RateLimitDecision, RateLimiter, RequestLog, RequestLogBuffer, ResponseCache,
    Service, ServiceEntry, ServiceRegistry, ServicesHealth, parse_time_range, request_signature,
    send_with_timeout,
};
use apexg_errors::{GatewayError, GatewayResult};
use apexg_memory::{ENDPOINTS_DB, Memory, SERVICES_DB, StoredEndpoint};
use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Headers that describe one connection and are never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "content-length",
];

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Rate-limit key and fallback caller id, usually the client address.
    pub client_id: String,
}

impl InboundRequest {
    pub fn new(method: Method, path_and_query: &str, client_id: &str) -> Self {
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_id: client_id.to_string(),
        }
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(v) = HeaderValue::from_str(value) {
            self.headers.insert(name, v);
        }
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Bypass,
}

#[derive(Debug, Clone)]
pub struct GatewayResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub cache: CacheStatus,
}

impl GatewayResponse {
    fn from_cached(cached: CachedResponse) -> Self {
        let mut headers = HeaderMap::new();
        for (k, v) in &cached.headers {
            if let (Ok(k), Ok(v)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                headers.append(k, v);
            }
        }
        Self { status: cached.status, headers, body: cached.body, cache: CacheStatus::Hit }
    }

    fn to_cached(&self) -> CachedResponse {
        CachedResponse {
            status: self.status,
            headers: self
                .headers
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
                .collect(),
            body: self.body.clone(),
        }
    }
}

/// Result of one dispatch, with what the HTTP layer needs for headers.
#[derive(Debug)]
pub struct Dispatched {
    pub request_id: String,
    pub endpoint_id: Option<String>,
    /// Present whenever the endpoint has rate limiting enabled.
    pub rate_limit: Option<RateLimitDecision>,
    pub result: GatewayResult<GatewayResponse>,
    pub latency: Duration,
}

impl Dispatched {
    pub fn status(&self) -> u16 {
        match &self.result {
            Ok(resp) => resp.status,
            Err(e) => e.status().as_u16(),
        }
    }
}

/// What the pipeline learnt before it finished or failed.
#[derive(Debug, Default)]
struct Trace {
    endpoint_id: Option<String>,
    service_id: Option<String>,
    caller_id: Option<String>,
    rate_limit: Option<RateLimitDecision>,
}

#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    pub log_capacity: usize,
    /// Answer 503 for services the health monitor marks unhealthy.
    pub reject_unhealthy: bool,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self { log_capacity: 10_000, reject_unhealthy: false }
    }
}

/// The request pipeline and the state it shares across requests.
pub struct Dispatcher {
    endpoints: EndpointRegistry,
    services: ServiceRegistry,
    limiter: RateLimiter,
    cache: ResponseCache,
    backend: Arc<dyn Backend>,
    monitor: Arc<HealthMonitor>,
    logs: Arc<RequestLogBuffer>,
    sinks: FanoutSink,
    memory: Option<Arc<Memory>>,
    options: DispatcherOptions,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, options: DispatcherOptions) -> Self {
        let monitor = HealthMonitor::new(backend.clone());
        let logs = Arc::new(RequestLogBuffer::new(options.log_capacity));
        Self {
            endpoints: EndpointRegistry::new(),
            services: ServiceRegistry::with_monitor(monitor.clone()),
            limiter: RateLimiter::new(),
            cache: ResponseCache::new(),
            backend,
            monitor,
            sinks: FanoutSink::new().with(logs.clone()),
            logs,
            memory: None,
            options,
        }
    }

    /// Extra metrics sink, after the in-memory log buffer.
    pub fn with_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Registrations are written through to `memory`.
    pub fn with_memory(mut self, memory: Arc<Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    pub fn logs(&self) -> &Arc<RequestLogBuffer> {
        &self.logs
    }

    fn persist<T: serde::Serialize>(&self, db: &str, key: &str, value: &T) {
        if let Some(memory) = &self.memory {
            if let Err(e) = memory.put(db, key, value) {
                warn!(db, key, error = %e, "failed to persist registration");
            }
        }
    }

    /// Adds or replaces an endpoint and drops its cached responses.
    pub async fn register_endpoint(&self, endpoint: Endpoint) -> String {
        let id = self.endpoints.register(endpoint);
        let dropped = self.cache.invalidate_endpoint(&id).await;
        if let Some(ep) = self.endpoints.get(&id) {
            let seq = self.endpoints.position(&id).unwrap_or_default() as u64;
            self.persist(ENDPOINTS_DB, &id, &StoredEndpoint { seq, endpoint: ep.as_ref().clone() });
            info!(endpoint = %id, method = ?ep.method, path = %ep.path, service = %ep.target_service, dropped, "endpoint registered");
        }
        id
    }

    pub fn register_service(&self, service: Service) -> String {
        let id = self.services.register(service);
        if let Some(entry) = self.services.get(&id) {
            self.persist(SERVICES_DB, &id, entry.service.as_ref());
        }
        id
    }

    /// Returns false for an unknown service.
    pub fn set_service_enabled(&self, id: &str, enabled: bool) -> bool {
        if !self.services.set_enabled(id, enabled) {
            return false;
        }
        if let Some(entry) = self.services.get(id) {
            let mut stored = entry.service.as_ref().clone();
            stored.enabled = enabled;
            self.persist(SERVICES_DB, id, &stored);
        }
        true
    }

    /// Re-registers everything persisted in `memory`, endpoints in their
    /// original registration order. Returns (endpoints, services).
    pub async fn restore(&self) -> anyhow::Result<(usize, usize)> {
        let Some(memory) = self.memory.clone() else {
            return Ok((0, 0));
        };
        let services = memory.list::<Service>(SERVICES_DB)?;
        let mut endpoints = memory.list::<StoredEndpoint>(ENDPOINTS_DB)?;
        endpoints.sort_by_key(|(_, stored)| stored.seq);
        let counts = (endpoints.len(), services.len());
        for (_, svc) in services {
            self.register_service(svc);
        }
        for (_, stored) in endpoints {
            self.register_endpoint(stored.endpoint).await;
        }
        Ok(counts)
    }

    pub fn stats(&self, range: &str) -> GatewayStats {
        self.logs.stats(parse_time_range(range))
    }

    pub fn services_health(&self) -> ServicesHealth {
        self.services.health_report()
    }

    /// Runs the pipeline for one request in its own task, so a panic in
    /// one request turns into a 500 instead of taking others down.
    pub async fn dispatch(self: &Arc<Self>, req: InboundRequest) -> Dispatched {
        let start = Instant::now();
        let request_id = uuid::Uuid::new_v4().to_string();
        let method = req.method.to_string();
        let path = req.path.clone();
        let client_id = req.client_id.clone();

        let me = self.clone();
        let rid = request_id.clone();
        let (trace, result) = match tokio::spawn(async move {
            let mut trace = Trace::default();
            let result = me.process(req, &rid, &mut trace).await;
            (trace, result)
        })
        .await
        {
            Ok(done) => done,
            Err(join_err) => {
                error!(request_id = %request_id, path = %path, error = %join_err, "dispatch task failed");
                (Trace::default(), Err(GatewayError::Internal(join_err.to_string())))
            }
        };

        let latency = start.elapsed();
        let dispatched = Dispatched {
            request_id,
            endpoint_id: trace.endpoint_id.clone(),
            rate_limit: trace.rate_limit,
            result,
            latency,
        };
        if let Err(e) = &dispatched.result {
            if matches!(e, GatewayError::Internal(_)) {
                error!(request_id = %dispatched.request_id, error = %e, "request failed");
            } else {
                debug!(request_id = %dispatched.request_id, error = %e, "request rejected");
            }
        }

        self.sinks.record(&RequestLog {
            request_id: dispatched.request_id.clone(),
            timestamp: Utc::now(),
            endpoint_id: trace.endpoint_id.unwrap_or_default(),
            method,
            path,
            status: dispatched.status(),
            duration_ms: latency.as_millis() as u64,
            caller_id: trace.caller_id.unwrap_or(client_id),
            service_id: trace.service_id,
        });
        dispatched
    }

    async fn process(&self, req: InboundRequest, request_id: &str, trace: &mut Trace) -> GatewayResult<GatewayResponse> {
        // 1. resolve
        let method = HttpMethod::from_http(&req.method).ok_or(GatewayError::NotFound)?;
        let matched = self.endpoints.find(method, &req.path).ok_or(GatewayError::NotFound)?;
        let endpoint = matched.endpoint;
        trace.endpoint_id = Some(endpoint.id.clone());

        // 2. enabled
        if !endpoint.enabled {
            return Err(GatewayError::EndpointDisabled(endpoint.id.clone()));
        }

        // 3. rate limit
        if endpoint.rate_limit.enabled {
            let decision = self.limiter.allow(&endpoint.id, &req.client_id, &endpoint.rate_limit);
            trace.rate_limit = Some(decision);
            if !decision.allowed {
                return Err(GatewayError::RateLimited {
                    limit: decision.limit,
                    remaining: decision.remaining,
                    reset_at: decision.reset_at_unix(),
                });
            }
        }

        // 4. authenticate
        trace.caller_id = auth::authenticate(&endpoint.authentication, &req.headers, req.query.as_deref())?;

        // 5. cache lookup
        let signature = endpoint
            .is_cacheable(&req.method)
            .then(|| request_signature(req.method.as_str(), &req.path, req.query.as_deref()));
        if let Some(sig) = &signature {
            if let Some(hit) = self.cache.get(&endpoint.id, sig).await {
                debug!(endpoint = %endpoint.id, "cache hit");
                return Ok(GatewayResponse::from_cached(hit));
            }
        }

        // 6. service gate
        let entry = self
            .services
            .get(&endpoint.target_service)
            .ok_or_else(|| GatewayError::ServiceUnavailable(format!("unknown service {}", endpoint.target_service)))?;
        trace.service_id = Some(entry.service.id.clone());
        if !entry.is_enabled() {
            return Err(GatewayError::ServiceUnavailable(format!("service {} is disabled", entry.service.id)));
        }
        if self.options.reject_unhealthy && !entry.health.is_healthy() {
            return Err(GatewayError::ServiceUnavailable(format!("service {} is unhealthy", entry.service.id)));
        }
        let permit = entry
            .breaker
            .try_acquire()
            .map_err(|_| GatewayError::ServiceUnavailable(format!("circuit open for {}", entry.service.id)))?;

        // 7. request transformations
        let backend_req = self.backend_request(&endpoint, &matched.params, &entry.service, req, request_id);

        // 8 + 9. call with retries, report to the breaker
        let upstream = self.call_with_retry(&entry, permit, backend_req).await?;

        let mut headers = upstream.headers;
        strip_hop_by_hop(&mut headers);
        let mut body = upstream.body;
        transform::apply(&endpoint.transformation.response, &mut headers, &mut body);
        let response = GatewayResponse { status: upstream.status, headers, body, cache: CacheStatus::Miss };

        match signature {
            Some(sig) if (200..300).contains(&response.status) => {
                self.cache
                    .put(&endpoint.id, &sig, response.to_cached(), Duration::from_secs(endpoint.caching.ttl_secs))
                    .await;
                Ok(response)
            }
            Some(_) => Ok(response),
            None => Ok(GatewayResponse { cache: CacheStatus::Bypass, ..response }),
        }
    }

    fn backend_request(
        &self,
        endpoint: &Endpoint,
        params: &HashMap<String, String>,
        service: &Service,
        req: InboundRequest,
        request_id: &str,
    ) -> BackendRequest {
        let target = match endpoint.resolve_target_path(params) {
            p if p.is_empty() => req.path.clone(),
            p => p,
        };
        let mut url = service.url_for(&target);
        if let Some(q) = req.query.as_deref().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(q);
        }

        let mut headers = req.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(http::header::HOST);
        if let Ok(v) = HeaderValue::from_str(&req.client_id) {
            headers.append("x-forwarded-for", v);
        }
        if let Ok(v) = HeaderValue::from_str(request_id) {
            headers.insert("x-request-id", v);
        }
        let mut body = req.body;
        transform::apply(&endpoint.transformation.request, &mut headers, &mut body);
        service.authentication.apply(&mut headers);

        BackendRequest { method: req.method, url, headers, body, timeout: service.timeout() }
    }

    /// Retries per the service policy. 4xx answers pass through; 5xx and
    /// transport errors are failures.
    async fn call_with_retry(
        &self,
        entry: &ServiceEntry,
        mut permit: BreakerPermit,
        req: BackendRequest,
    ) -> GatewayResult<BackendResponse> {
        let service = &entry.service;
        let policy = &service.retry_policy;
        let per_attempt = service.circuit_breaker.reporting == BreakerReporting::PerAttempt;
        let attempts = policy.attempts();

        let mut attempt = 0;
        let (failure, retryable, breaker_opened) = loop {
            attempt += 1;
            let failure = match send_with_timeout(self.backend.as_ref(), req.clone()).await {
                Ok(resp) if !resp.is_server_error() => {
                    permit.success();
                    return Ok(resp);
                }
                Ok(resp) => BackendFailure::from_status(resp.status),
                Err(f) => f,
            };
            let retryable = policy.is_retryable(&failure.code);
            warn!(
                service = %service.id,
                attempt,
                attempts,
                code = %failure.code,
                retryable,
                "backend attempt failed"
            );
            if per_attempt && !permit.attempt_failed() {
                break (failure, retryable, true);
            }
            if !retryable || attempt >= attempts {
                break (failure, retryable, false);
            }
            tokio::time::sleep(policy.delay_after(attempt)).await;
        };

        if per_attempt {
            drop(permit);
        } else {
            permit.failure();
        }

        if breaker_opened || retryable {
            Err(GatewayError::ServiceUnavailable(format!(
                "{} failed after {} attempt(s): {}",
                service.id, attempt, failure
            )))
        } else {
            Err(GatewayError::BackendError { status: failure.status, message: failure.to_string() })
        }
    }
}
