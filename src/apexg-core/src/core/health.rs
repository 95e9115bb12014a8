use crate::core::backend::{Backend, BackendRequest, send_with_timeout};
use crate::models::{HealthCheckSpec, Service};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Default for HealthRecord {
    // services start out healthy until probes say otherwise
    fn default() -> Self {
        Self { healthy: true, last_check: None, consecutive_successes: 0, consecutive_failures: 0 }
    }
}

/// Live health of one service. Written only by the monitor.
#[derive(Debug, Default)]
pub struct HealthStatus {
    record: RwLock<HealthRecord>,
}

impl HealthStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> HealthRecord {
        *self.record.read()
    }

    pub fn is_healthy(&self) -> bool {
        self.record.read().healthy
    }

    /// Folds one probe result in. Returns true when `healthy` flipped.
    pub fn observe(&self, ok: bool, spec: &HealthCheckSpec) -> bool {
        let mut record = self.record.write();
        let was_healthy = record.healthy;
        record.last_check = Some(Utc::now());
        if ok {
            record.consecutive_successes = record.consecutive_successes.saturating_add(1);
            record.consecutive_failures = 0;
            if record.consecutive_successes >= spec.healthy_threshold.max(1) {
                record.healthy = true;
            }
        } else {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.consecutive_successes = 0;
            if record.consecutive_failures >= spec.unhealthy_threshold.max(1) {
                record.healthy = false;
            }
        }
        record.healthy != was_healthy
    }
}

/// Issues one probe and records it. Returns the probe result.
pub async fn probe_once(backend: &dyn Backend, service: &Service, status: &HealthStatus) -> bool {
    let spec = &service.health_check;
    let mut req = BackendRequest::get(service.url_for(&spec.endpoint), spec.timeout());
    service.authentication.apply(&mut req.headers);

    let ok = match send_with_timeout(backend, req).await {
        Ok(resp) => resp.status == spec.expected_status,
        Err(e) => {
            debug!(service = %service.id, error = %e, "health probe failed");
            false
        }
    };
    if status.observe(ok, spec) {
        if ok {
            info!(service = %service.id, "service marked healthy");
        } else {
            warn!(service = %service.id, "service marked unhealthy");
        }
    }
    ok
}

struct Target {
    service: Arc<Service>,
    status: Arc<HealthStatus>,
}

struct Running {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// Background prober, one task per watched service.
///
/// Targets can be registered at any time; probe tasks only run between
/// `start` and `stop`.
pub struct HealthMonitor {
    backend: Arc<dyn Backend>,
    targets: Mutex<HashMap<String, Target>>,
    running: Mutex<HashMap<String, Running>>,
    started: Mutex<bool>,
}

impl HealthMonitor {
    pub fn new(backend: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            targets: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            started: Mutex::new(false),
        })
    }

    /// Register (or replace) a service to probe.
    pub fn watch(&self, service: Arc<Service>, status: Arc<HealthStatus>) {
        let id = service.id.clone();
        if !service.health_check.enabled {
            self.unwatch(&id);
            return;
        }
        self.targets.lock().insert(id.clone(), Target { service: service.clone(), status: status.clone() });
        if *self.started.lock() {
            self.spawn(service, status);
        }
    }

    pub fn unwatch(&self, service_id: &str) {
        self.targets.lock().remove(service_id);
        if let Some(r) = self.running.lock().remove(service_id) {
            let _ = r.stop.send(true);
        }
    }

    pub fn start(&self) {
        let mut started = self.started.lock();
        if *started {
            return;
        }
        *started = true;
        drop(started);
        let targets: Vec<(Arc<Service>, Arc<HealthStatus>)> = self
            .targets
            .lock()
            .values()
            .map(|t| (t.service.clone(), t.status.clone()))
            .collect();
        info!(services = targets.len(), "health monitor started");
        for (service, status) in targets {
            self.spawn(service, status);
        }
    }

    pub async fn stop(&self) {
        *self.started.lock() = false;
        let running: Vec<Running> = self.running.lock().drain().map(|(_, r)| r).collect();
        for r in running {
            let _ = r.stop.send(true);
            let _ = r.handle.await;
        }
        info!("health monitor stopped");
    }

    pub fn is_watching(&self, service_id: &str) -> bool {
        self.targets.lock().contains_key(service_id)
    }

    fn spawn(&self, service: Arc<Service>, status: Arc<HealthStatus>) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let backend = self.backend.clone();
        let id = service.id.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(service.health_check.interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        probe_once(backend.as_ref(), &service, &status).await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!(service = %service.id, "health probe loop exited");
        });
        if let Some(old) = self.running.lock().insert(id, Running { handle, stop: stop_tx }) {
            let _ = old.stop.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::backend::{BackendFailure, BackendResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicU16, Ordering};
    use std::time::Duration;

    struct Probe {
        status: AtomicU16,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Backend for Probe {
        async fn send(&self, req: BackendRequest) -> Result<BackendResponse, BackendFailure> {
            assert!(req.url.ends_with("/health"));
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.status.load(Ordering::SeqCst) {
                0 => Err(BackendFailure::new("ECONNREFUSED", "down")),
                s => Ok(BackendResponse::new(s, "ok")),
            }
        }
    }

    fn service() -> Service {
        let mut svc = Service::new("user_service", "http://localhost:3001");
        svc.health_check.enabled = true;
        svc
    }

    #[test]
    fn thresholds_gate_transitions() {
        let spec = HealthCheckSpec::default();
        let status = HealthStatus::new();
        assert!(status.is_healthy());
        assert!(!status.observe(false, &spec));
        assert!(!status.observe(false, &spec));
        assert!(status.observe(false, &spec));
        assert!(!status.is_healthy());

        assert!(!status.observe(true, &spec));
        assert!(!status.is_healthy());
        assert!(status.observe(true, &spec));
        assert!(status.is_healthy());
        assert_eq!(status.snapshot().consecutive_successes, 2);
    }

    #[tokio::test]
    async fn probe_compares_expected_status() {
        let backend = Probe { status: AtomicU16::new(503), calls: AtomicU32::new(0) };
        let svc = service();
        let status = HealthStatus::new();
        assert!(!probe_once(&backend, &svc, &status).await);
        backend.status.store(200, Ordering::SeqCst);
        assert!(probe_once(&backend, &svc, &status).await);
        assert_eq!(status.snapshot().consecutive_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_probes_on_interval_until_stopped() {
        let backend = Arc::new(Probe { status: AtomicU16::new(0), calls: AtomicU32::new(0) });
        let monitor = HealthMonitor::new(backend.clone());
        let status = HealthStatus::new();
        monitor.watch(Arc::new(service()), status.clone());

        // nothing runs before start
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        monitor.start();
        // probes at t=0, 30, 60, 90
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
        assert!(!status.is_healthy());

        monitor.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn disabled_health_check_is_not_watched() {
        let backend = Arc::new(Probe { status: AtomicU16::new(200), calls: AtomicU32::new(0) });
        let monitor = HealthMonitor::new(backend);
        let mut svc = service();
        svc.health_check.enabled = false;
        monitor.watch(Arc::new(svc), HealthStatus::new());
        assert!(!monitor.is_watching("user_service"));
    }
}
