use crate::dispatcher::Dispatcher;
use apexg_core::BreakerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub expired_windows: usize,
    pub expired_cache_entries: usize,
    pub active_endpoints: usize,
    pub active_services: usize,
    pub open_breakers: usize,
    pub buffered_logs: usize,
}

/// One maintenance pass: drop elapsed rate-limit windows and expired
/// cache entries, then log a gauge snapshot.
pub async fn sweep(dispatcher: &Dispatcher) -> SweepReport {
    let endpoints = dispatcher.endpoints();
    let expired_windows = dispatcher.limiter().sweep(|endpoint_id| {
        endpoints
            .get(endpoint_id)
            .filter(|ep| ep.rate_limit.enabled)
            .map(|ep| Duration::from_secs(ep.rate_limit.window_secs.max(1)))
    });
    let expired_cache_entries = dispatcher.cache().purge_expired().await;

    let services = dispatcher.services().list();
    let report = SweepReport {
        expired_windows,
        expired_cache_entries,
        active_endpoints: endpoints.list().iter().filter(|ep| ep.enabled).count(),
        active_services: services.iter().filter(|s| s.is_enabled()).count(),
        open_breakers: services
            .iter()
            .filter(|s| s.breaker.state() != BreakerState::Closed)
            .count(),
        buffered_logs: dispatcher.logs().len(),
    };
    info!(
        active_endpoints = report.active_endpoints,
        active_services = report.active_services,
        open_breakers = report.open_breakers,
        buffered_logs = report.buffered_logs,
        expired_windows = report.expired_windows,
        expired_cache_entries = report.expired_cache_entries,
        "gateway gauges"
    );
    report
}

/// Periodic `sweep`, stopped explicitly.
pub struct Maintenance {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl Maintenance {
    pub fn start(dispatcher: Arc<Dispatcher>, every: Duration) -> Self {
        let (stop, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick is immediate, nothing to sweep yet
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&dispatcher).await;
                    }
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("maintenance loop exited");
        });
        Self { handle, stop }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{DispatcherOptions, InboundRequest};
    use apexg_core::{
        Backend, BackendFailure, BackendRequest, BackendResponse, CachePolicy, Endpoint, HttpMethod,
        RateLimitPolicy, Service,
    };
    use async_trait::async_trait;
    use http::Method;

    struct Echo;

    #[async_trait]
    impl Backend for Echo {
        async fn send(&self, _req: BackendRequest) -> Result<BackendResponse, BackendFailure> {
            Ok(BackendResponse::new(200, "ok"))
        }
    }

    async fn warmed() -> Arc<Dispatcher> {
        let d = Arc::new(Dispatcher::new(Arc::new(Echo), DispatcherOptions::default()));
        d.register_service(Service::new("user_service", "http://users.local"));
        let mut ep = Endpoint::new(HttpMethod::GET, "/api/user/profile", "user_service");
        ep.id = "ep_001".into();
        ep.rate_limit = RateLimitPolicy::fixed(100, 60);
        ep.caching = CachePolicy { enabled: true, ttl_secs: 30 };
        d.register_endpoint(ep).await;
        let res = d
            .dispatch(InboundRequest::new(Method::GET, "/api/user/profile", "10.0.0.1"))
            .await;
        assert!(res.result.is_ok());
        d
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_elapsed_state() {
        let d = warmed().await;
        let report = sweep(&d).await;
        assert_eq!(report.expired_windows, 0);
        assert_eq!(report.expired_cache_entries, 0);
        assert_eq!(report.active_endpoints, 1);
        assert_eq!(report.active_services, 1);
        assert_eq!(report.open_breakers, 0);
        assert_eq!(report.buffered_logs, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        let report = sweep(&d).await;
        assert_eq!(report.expired_windows, 1);
        assert_eq!(report.expired_cache_entries, 1);
        assert_eq!(d.limiter().len(), 0);
        assert_eq!(d.cache().len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_runs_until_stopped() {
        let d = warmed().await;
        let maintenance = Maintenance::start(d.clone(), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(d.limiter().len(), 0);
        assert_eq!(d.cache().len().await, 0);
        maintenance.stop().await;
    }
}
