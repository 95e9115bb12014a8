use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One dispatched request, as handed to metrics sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLog {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// Empty when no endpoint matched.
    pub endpoint_id: String,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub duration_ms: u64,
    pub caller_id: String,
    pub service_id: Option<String>,
}

/// Receives one record per dispatched request. Must not block the caller
/// on slow I/O.
pub trait MetricsSink: Send + Sync {
    fn record(&self, log: &RequestLog);
}

/// Forwards every record to each inner sink, in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn push(&mut self, sink: Arc<dyn MetricsSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn record(&self, log: &RequestLog) {
        for sink in &self.sinks {
            sink.record(log);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountEntry {
    pub id: String,
    pub count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStats {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub avg_latency_ms: f64,
    pub top_endpoints: Vec<CountEntry>,
    pub top_services: Vec<CountEntry>,
    /// "2xx", "4xx", ...
    pub status_codes: BTreeMap<String, u64>,
    pub unique_callers: usize,
    /// Endpoints with the most responses >= 400.
    pub top_errors: Vec<CountEntry>,
}

fn top_n(counts: HashMap<String, u64>, n: usize) -> Vec<CountEntry> {
    let mut entries: Vec<CountEntry> = counts
        .into_iter()
        .map(|(id, count)| CountEntry { id, count })
        .collect();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.id.cmp(&b.id)));
    entries.truncate(n);
    entries
}

/// Bounded in-memory log of the most recent requests.
#[derive(Debug)]
pub struct RequestLogBuffer {
    capacity: usize,
    logs: Mutex<VecDeque<RequestLog>>,
}

impl RequestLogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), logs: Mutex::new(VecDeque::new()) }
    }

    pub fn len(&self) -> usize {
        self.logs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.lock().is_empty()
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<RequestLog> {
        self.logs.lock().iter().rev().take(limit).cloned().collect()
    }

    /// Aggregates the records newer than `now - range`.
    pub fn stats(&self, range: Duration) -> GatewayStats {
        let since = chrono::Duration::from_std(range)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let logs = self.logs.lock();
        let mut stats = GatewayStats::default();
        let mut latency_total: u64 = 0;
        let mut endpoints: HashMap<String, u64> = HashMap::new();
        let mut services: HashMap<String, u64> = HashMap::new();
        let mut errors: HashMap<String, u64> = HashMap::new();
        let mut callers: HashSet<&str> = HashSet::new();

        for log in logs.iter().filter(|l| l.timestamp >= since) {
            stats.total_requests += 1;
            latency_total += log.duration_ms;
            if log.status < 400 {
                stats.success_count += 1;
            } else {
                stats.error_count += 1;
                if !log.endpoint_id.is_empty() {
                    *errors.entry(log.endpoint_id.clone()).or_default() += 1;
                }
            }
            if !log.endpoint_id.is_empty() {
                *endpoints.entry(log.endpoint_id.clone()).or_default() += 1;
            }
            if let Some(service) = &log.service_id {
                *services.entry(service.clone()).or_default() += 1;
            }
            *stats
                .status_codes
                .entry(format!("{}xx", log.status / 100))
                .or_default() += 1;
            callers.insert(log.caller_id.as_str());
        }

        if stats.total_requests > 0 {
            stats.avg_latency_ms = latency_total as f64 / stats.total_requests as f64;
        }
        stats.unique_callers = callers.len();
        stats.top_endpoints = top_n(endpoints, 10);
        stats.top_services = top_n(services, 10);
        stats.top_errors = top_n(errors, 5);
        stats
    }
}

impl MetricsSink for RequestLogBuffer {
    fn record(&self, log: &RequestLog) {
        let mut logs = self.logs.lock();
        logs.push_back(log.clone());
        while logs.len() > self.capacity {
            logs.pop_front();
        }
    }
}

/// Parses "30s", "15m", "1h" or "7d". Anything else falls back to one hour.
pub fn parse_time_range(range: &str) -> Duration {
    const DEFAULT: Duration = Duration::from_secs(3600);
    let range = range.trim();
    let Some((last, _)) = range.char_indices().last() else {
        return DEFAULT;
    };
    let (num, unit) = range.split_at(last);
    let Ok(n) = num.parse::<u64>() else {
        return DEFAULT;
    };
    let secs = match unit {
        "s" => n,
        "m" => n.saturating_mul(60),
        "h" => n.saturating_mul(3600),
        "d" => n.saturating_mul(86_400),
        _ => return DEFAULT,
    };
    Duration::from_secs(secs)
}
