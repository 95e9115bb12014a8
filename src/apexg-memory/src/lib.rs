use anyhow::Result;
use apexg_core::{Endpoint, MetricsSink, RequestLog};
use dashmap::DashMap;
use heed::types::Bytes;
use heed::{Env, EnvOpenOptions};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const ENDPOINTS_DB: &str = "endpoints";
pub const SERVICES_DB: &str = "services";
pub const REQUEST_LOGS_DB: &str = "request_logs";

/// Trim the request log database once per this many writes.
const TRIM_EVERY: u64 = 100;
/// Most logs written in one transaction.
const BATCH: usize = 256;

/// An endpoint as persisted. `seq` is its registration position, so a
/// restore can replay registrations in their original order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEndpoint {
    pub seq: u64,
    pub endpoint: Endpoint,
}

/// Named key/value databases, values encoded with MessagePack.
pub struct Memory {
    kind: MemoryKind,
}

enum MemoryKind {
    LMDB {
        env: Env,
        dbs: DashMap<String, heed::Database<Bytes, Bytes>>,
    },
    Memory {
        map: DashMap<String, Vec<u8>>,
    },
}

impl Memory {
    /// Open LMDB storage at given path
    pub fn open_lmdb<P: AsRef<Path>>(path: P) -> Result<Self> {
        std::fs::create_dir_all(path.as_ref())?;
        let env = unsafe {
            EnvOpenOptions::new()
                .max_dbs(16)
                .map_size(1024 * 1024 * 1024)
                .open(path)?
        };
        Ok(Self {
            kind: MemoryKind::LMDB {
                env,
                dbs: DashMap::new(),
            },
        })
    }

    /// Open in-memory storage
    pub fn memory() -> Self {
        Self {
            kind: MemoryKind::Memory {
                map: DashMap::new(),
            },
        }
    }

    /// `engine` is "lmdb" or "memory".
    pub fn open(engine: &str, path: &str) -> Result<Self> {
        match engine {
            "lmdb" => {
                let path = if path.is_empty() { "./data/apexg" } else { path };
                Self::open_lmdb(path)
            }
            "memory" | "" => Ok(Self::memory()),
            other => anyhow::bail!("unknown memory engine: {}", other),
        }
    }

    fn make_key(db: &str, key: &str) -> String {
        format!("{}/{}", db, key)
    }

    fn get_db(
        env: &Env,
        dbs: &DashMap<String, heed::Database<Bytes, Bytes>>,
        db_name: &str,
    ) -> Result<heed::Database<Bytes, Bytes>> {
        if let Some(dbi) = dbs.get(db_name) {
            Ok(*dbi)
        } else {
            let mut wtxn = env.write_txn()?;
            let dbi: heed::Database<Bytes, Bytes> =
                env.create_database::<Bytes, Bytes>(&mut wtxn, Some(db_name))?;
            wtxn.commit()?;
            dbs.insert(db_name.to_string(), dbi);
            Ok(dbi)
        }
    }

    /// Insert or update (upsert)
    pub fn put<T: Serialize>(&self, db: &str, key: &str, value: &T) -> Result<()> {
        // named fields, so tagged enums and defaults survive the round trip
        let bytes = rmp_serde::to_vec_named(value)?;
        match &self.kind {
            MemoryKind::LMDB { env, dbs } => {
                let dbi = Self::get_db(env, dbs, db)?;
                let mut wtxn = env.write_txn()?;
                dbi.put(&mut wtxn, key.as_bytes(), &bytes)?;
                wtxn.commit()?;
                Ok(())
            }
            MemoryKind::Memory { map } => {
                map.insert(Self::make_key(db, key), bytes);
                Ok(())
            }
        }
    }

    /// Upserts many pairs in one write transaction.
    pub fn put_all<T: Serialize>(&self, db: &str, entries: &[(String, T)]) -> Result<()> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            encoded.push((key.as_str(), rmp_serde::to_vec_named(value)?));
        }
        match &self.kind {
            MemoryKind::LMDB { env, dbs } => {
                let dbi = Self::get_db(env, dbs, db)?;
                let mut wtxn = env.write_txn()?;
                for (key, bytes) in &encoded {
                    dbi.put(&mut wtxn, key.as_bytes(), bytes)?;
                }
                wtxn.commit()?;
            }
            MemoryKind::Memory { map } => {
                for (key, bytes) in encoded {
                    map.insert(Self::make_key(db, key), bytes);
                }
            }
        }
        Ok(())
    }

    /// Get by key
    pub fn get<T: DeserializeOwned>(&self, db: &str, key: &str) -> Result<Option<T>> {
        match &self.kind {
            MemoryKind::LMDB { env, dbs } => {
                let dbi = Self::get_db(env, dbs, db)?;
                let rtxn = env.read_txn()?;
                match dbi.get(&rtxn, key.as_bytes())? {
                    Some(bytes) => Ok(Some(rmp_serde::from_slice(bytes)?)),
                    None => Ok(None),
                }
            }
            MemoryKind::Memory { map } => match map.get(&Self::make_key(db, key)) {
                Some(bytes) => Ok(Some(rmp_serde::from_slice(bytes.value())?)),
                None => Ok(None),
            },
        }
    }

    /// Delete by key. Returns whether it existed.
    pub fn delete(&self, db: &str, key: &str) -> Result<bool> {
        match &self.kind {
            MemoryKind::LMDB { env, dbs } => {
                let dbi = Self::get_db(env, dbs, db)?;
                let mut wtxn = env.write_txn()?;
                let existed = dbi.delete(&mut wtxn, key.as_bytes())?;
                wtxn.commit()?;
                Ok(existed)
            }
            MemoryKind::Memory { map } => Ok(map.remove(&Self::make_key(db, key)).is_some()),
        }
    }

    fn keys(&self, db: &str) -> Result<Vec<String>> {
        match &self.kind {
            MemoryKind::LMDB { env, dbs } => {
                let dbi = Self::get_db(env, dbs, db)?;
                let rtxn = env.read_txn()?;
                let mut keys = Vec::new();
                for item in dbi.iter(&rtxn)? {
                    let (k, _) = item?;
                    keys.push(String::from_utf8_lossy(k).to_string());
                }
                Ok(keys)
            }
            MemoryKind::Memory { map } => {
                let prefix = format!("{}/", db);
                let mut keys: Vec<String> = map
                    .iter()
                    .filter_map(|e| e.key().strip_prefix(&prefix).map(str::to_string))
                    .collect();
                keys.sort();
                Ok(keys)
            }
        }
    }

    /// All (key, value) pairs in key order.
    pub fn list<T: DeserializeOwned>(&self, db: &str) -> Result<Vec<(String, T)>> {
        let mut out = Vec::new();
        for key in self.keys(db)? {
            if let Some(v) = self.get(db, &key)? {
                out.push((key, v));
            }
        }
        Ok(out)
    }

    pub fn len(&self, db: &str) -> Result<usize> {
        match &self.kind {
            MemoryKind::LMDB { env, dbs } => {
                let dbi = Self::get_db(env, dbs, db)?;
                let rtxn = env.read_txn()?;
                Ok(dbi.len(&rtxn)? as usize)
            }
            MemoryKind::Memory { .. } => Ok(self.keys(db)?.len()),
        }
    }

    /// Deletes the lowest keys until at most `keep` remain.
    pub fn trim(&self, db: &str, keep: usize) -> Result<usize> {
        let keys = self.keys(db)?;
        if keys.len() <= keep {
            return Ok(0);
        }
        let excess = keys.len() - keep;
        match &self.kind {
            MemoryKind::LMDB { env, dbs } => {
                let dbi = Self::get_db(env, dbs, db)?;
                let mut wtxn = env.write_txn()?;
                for key in &keys[..excess] {
                    dbi.delete(&mut wtxn, key.as_bytes())?;
                }
                wtxn.commit()?;
            }
            MemoryKind::Memory { map } => {
                for key in &keys[..excess] {
                    map.remove(&Self::make_key(db, key));
                }
            }
        }
        Ok(excess)
    }
}

/// Persists request logs, keyed so that key order is arrival order.
///
/// `record` only enqueues. A background task writes batches and trims the
/// database on the blocking pool. Logs are dropped (and counted) when the
/// queue is full.
pub struct StoreSink {
    tx: mpsc::Sender<RequestLog>,
    dropped: AtomicU64,
}

impl StoreSink {
    /// Spawns the writer. It ends once the sink is dropped and the queue
    /// is drained.
    pub fn spawn(memory: Arc<Memory>, capacity: usize, queue: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<RequestLog>(queue.max(1));
        let capacity = capacity.max(1);
        let handle = tokio::spawn(async move {
            let mut written: u64 = 0;
            let mut batch = Vec::with_capacity(BATCH);
            while rx.recv_many(&mut batch, BATCH).await > 0 {
                let logs = std::mem::take(&mut batch);
                let before = written;
                written += logs.len() as u64;
                let trim = written / TRIM_EVERY > before / TRIM_EVERY;
                let memory = memory.clone();
                let trim_to = trim.then_some(capacity);
                if let Err(e) = tokio::task::spawn_blocking(move || write_batch(&memory, &logs, trim_to)).await {
                    warn!(error = %e, "request log writer failed");
                }
            }
        });
        (Self { tx, dropped: AtomicU64::new(0) }, handle)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn key(log: &RequestLog) -> String {
        let micros = log.timestamp.timestamp_micros().max(0);
        format!("{:020}-{}", micros, log.request_id)
    }

    /// Persisted logs, oldest first.
    pub fn load(memory: &Memory) -> Result<Vec<RequestLog>> {
        Ok(memory
            .list::<RequestLog>(REQUEST_LOGS_DB)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }
}

fn write_batch(memory: &Memory, logs: &[RequestLog], trim_to: Option<usize>) {
    let entries: Vec<(String, &RequestLog)> = logs.iter().map(|l| (StoreSink::key(l), l)).collect();
    if let Err(e) = memory.put_all(REQUEST_LOGS_DB, &entries) {
        warn!(error = %e, count = logs.len(), "failed to persist request logs");
    }
    if let Some(keep) = trim_to {
        match memory.trim(REQUEST_LOGS_DB, keep) {
            Ok(removed) if removed > 0 => debug!(removed, "trimmed persisted request logs"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to trim request logs"),
        }
    }
}

impl MetricsSink for StoreSink {
    fn record(&self, log: &RequestLog) {
        if self.tx.try_send(log.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apexg_core::{AuthPolicy, Endpoint, HttpMethod, RateLimitPolicy, Service, ServiceAuth};
    use chrono::{TimeZone, Utc};

    fn stores() -> (tempfile::TempDir, Vec<Memory>) {
        let dir = tempfile::tempdir().unwrap();
        let lmdb = Memory::open_lmdb(dir.path()).unwrap();
        (dir, vec![lmdb, Memory::memory()])
    }

    #[test]
    fn registrations_round_trip() {
        let (_dir, stores) = stores();
        for mem in stores {
            let mut ep = Endpoint::new(HttpMethod::GET, "/api/user/profile", "user_service");
            ep.id = "ep_001".into();
            ep.rate_limit = RateLimitPolicy::fixed(100, 60);
            ep.authentication = AuthPolicy::Basic { users: [("u".to_string(), "p".to_string())].into() };
            mem.put(ENDPOINTS_DB, &ep.id, &ep).unwrap();

            let mut svc = Service::new("user_service", "http://localhost:3001");
            svc.authentication = ServiceAuth::Bearer { token: "t".into() };
            mem.put(SERVICES_DB, &svc.id, &svc).unwrap();

            let back: Endpoint = mem.get(ENDPOINTS_DB, "ep_001").unwrap().unwrap();
            assert_eq!(back.path, ep.path);
            assert_eq!(back.rate_limit, ep.rate_limit);
            assert_eq!(back.authentication, ep.authentication);

            let back: Service = mem.get(SERVICES_DB, "user_service").unwrap().unwrap();
            assert_eq!(back.authentication, svc.authentication);
            assert_eq!(back.retry_policy, svc.retry_policy);

            assert!(mem.delete(ENDPOINTS_DB, "ep_001").unwrap());
            assert!(!mem.delete(ENDPOINTS_DB, "ep_001").unwrap());
            assert!(mem.get::<Endpoint>(ENDPOINTS_DB, "ep_001").unwrap().is_none());
        }
    }

    #[test]
    fn list_and_trim_follow_key_order() {
        let (_dir, stores) = stores();
        for mem in stores {
            for k in ["b", "a", "d", "c"] {
                mem.put("db", k, &k.to_uppercase()).unwrap();
            }
            mem.put("other", "a", &"x").unwrap();
            let listed: Vec<String> = mem.list::<String>("db").unwrap().into_iter().map(|(k, _)| k).collect();
            assert_eq!(listed, ["a", "b", "c", "d"]);
            assert_eq!(mem.trim("db", 1).unwrap(), 3);
            assert_eq!(mem.list::<String>("db").unwrap(), vec![("d".to_string(), "D".to_string())]);
            assert_eq!(mem.len("other").unwrap(), 1);
        }
    }

    fn log(id: &str, secs: i64) -> RequestLog {
        RequestLog {
            request_id: id.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
            endpoint_id: "ep_001".into(),
            method: "GET".into(),
            path: "/api/user/profile".into(),
            status: 200,
            duration_ms: 3,
            caller_id: "10.0.0.1".into(),
            service_id: Some("user_service".into()),
        }
    }

    #[tokio::test]
    async fn store_sink_writes_off_the_caller() {
        let memory = Arc::new(Memory::memory());
        let (sink, writer) = StoreSink::spawn(memory.clone(), 10, 16);
        sink.record(&log("r2", 0));
        sink.record(&log("r1", 1));
        // the writer has not run yet on this runtime, so nothing touched the store
        assert_eq!(memory.len(REQUEST_LOGS_DB).unwrap(), 0);

        drop(sink);
        writer.await.unwrap();
        let logs = StoreSink::load(&memory).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].request_id, "r2");
        assert_eq!(logs[1].request_id, "r1");
    }

    #[tokio::test]
    async fn store_sink_drops_when_full() {
        let memory = Arc::new(Memory::memory());
        let (sink, writer) = StoreSink::spawn(memory.clone(), 10, 1);
        for i in 0..5 {
            sink.record(&log(&format!("r{}", i), i));
        }
        assert_eq!(sink.dropped(), 4);
        drop(sink);
        writer.await.unwrap();
        assert_eq!(memory.len(REQUEST_LOGS_DB).unwrap(), 1);
    }

    #[tokio::test]
    async fn store_sink_trims_to_capacity() {
        let (_dir, stores) = stores();
        for mem in stores {
            let memory = Arc::new(mem);
            let (sink, writer) = StoreSink::spawn(memory.clone(), 20, 256);
            for i in 0..150 {
                sink.record(&log(&format!("r{:03}", i), i));
            }
            drop(sink);
            writer.await.unwrap();
            let logs = StoreSink::load(&memory).unwrap();
            assert_eq!(logs.len(), 20);
            assert_eq!(logs[0].request_id, "r130");
        }
    }

    #[test]
    fn stored_endpoints_keep_their_position() {
        let (_dir, stores) = stores();
        for mem in stores {
            for (seq, id) in [(1, "aa_second"), (0, "zz_first")] {
                let mut endpoint = Endpoint::new(HttpMethod::GET, "/api/:a/x", "svc");
                endpoint.id = id.into();
                mem.put(ENDPOINTS_DB, id, &StoredEndpoint { seq, endpoint }).unwrap();
            }
            let mut stored: Vec<StoredEndpoint> =
                mem.list(ENDPOINTS_DB).unwrap().into_iter().map(|(_, v)| v).collect();
            assert_eq!(stored[0].endpoint.id, "aa_second");
            stored.sort_by_key(|s| s.seq);
            assert_eq!(stored[0].endpoint.id, "zz_first");
        }
    }

    #[test]
    fn unknown_engine_is_an_error() {
        assert!(Memory::open("redis", "").is_err());
        assert!(Memory::open("memory", "").is_ok());
    }
}
