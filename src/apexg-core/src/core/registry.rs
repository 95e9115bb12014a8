use crate::core::breaker::{BreakerState, CircuitBreaker};
use crate::core::health::{HealthMonitor, HealthStatus};
use crate::models::{Service, new_service_id};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// A registered service with the state it owns.
#[derive(Debug)]
pub struct ServiceEntry {
    pub service: Arc<Service>,
    pub breaker: Arc<CircuitBreaker>,
    pub health: Arc<HealthStatus>,
    enabled: AtomicBool,
}

impl ServiceEntry {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    entries: DashMap<String, Arc<ServiceEntry>>,
    /// Registration order, for listing.
    order: parking_lot::Mutex<Vec<String>>,
    monitor: Option<Arc<HealthMonitor>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered services with health checking enabled get probed by `monitor`.
    pub fn with_monitor(monitor: Arc<HealthMonitor>) -> Self {
        Self { monitor: Some(monitor), ..Self::default() }
    }

    pub fn monitor(&self) -> Option<&Arc<HealthMonitor>> {
        self.monitor.as_ref()
    }

    /// Adds or replaces a service. The breaker and health record always
    /// start fresh.
    pub fn register(&self, mut service: Service) -> String {
        if service.id.is_empty() {
            service.id = new_service_id();
        }
        let id = service.id.clone();
        let service = Arc::new(service);
        let entry = Arc::new(ServiceEntry {
            breaker: CircuitBreaker::new(&id, &service.circuit_breaker),
            health: HealthStatus::new(),
            enabled: AtomicBool::new(service.enabled),
            service: service.clone(),
        });
        if let Some(monitor) = &self.monitor {
            monitor.watch(service.clone(), entry.health.clone());
        }
        if self.entries.insert(id.clone(), entry).is_none() {
            self.order.lock().push(id.clone());
        }
        info!(service = %id, base_url = %service.base_url, "service registered");
        id
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServiceEntry>> {
        self.entries.get(id).map(|e| e.value().clone())
    }

    /// Returns false for an unknown id. Breaker and health state are kept.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        match self.entries.get(id) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Release);
                info!(service = %id, enabled, "service toggled");
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<Arc<ServiceEntry>> {
        self.order.lock().iter().filter_map(|id| self.get(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn health_report(&self) -> ServicesHealth {
        let services: BTreeMap<String, ServiceHealth> = self
            .list()
            .into_iter()
            .map(|entry| {
                let record = entry.health.snapshot();
                let breaker = entry.breaker.snapshot();
                let report = ServiceHealth {
                    name: entry.service.name.clone(),
                    enabled: entry.is_enabled(),
                    healthy: record.healthy,
                    last_check: record.last_check,
                    consecutive_successes: record.consecutive_successes,
                    consecutive_failures: record.consecutive_failures,
                    breaker_state: breaker.state,
                    failure_count: breaker.failure_count,
                };
                (entry.service.id.clone(), report)
            })
            .collect();
        let healthy = services.values().filter(|s| s.healthy).count();
        ServicesHealth { overall: OverallHealth::from_counts(healthy, services.len()), services }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub name: String,
    pub enabled: bool,
    pub healthy: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub breaker_state: BreakerState,
    pub failure_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallHealth {
    /// All healthy, more than half healthy, or worse.
    pub fn from_counts(healthy: usize, total: usize) -> Self {
        if healthy == total {
            OverallHealth::Healthy
        } else if healthy * 2 > total {
            OverallHealth::Degraded
        } else {
            OverallHealth::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServicesHealth {
    pub overall: OverallHealth,
    pub services: BTreeMap<String, ServiceHealth>,
}
