use anyhow::{Context, Result, anyhow, bail};
use apexg_core::{Endpoint, Service};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCfg {
    #[serde(default = "def_host")]
    pub host: String,
    #[serde(default = "def_port")]
    pub port: u16,
    #[serde(default = "def_name")]
    pub name: String,
    #[serde(default = "def_logging")]
    pub logging_mode: String,
    /// Answer 503 for services the health monitor marks unhealthy.
    #[serde(default)]
    pub reject_unhealthy: bool,
    #[serde(default = "def_admin_prefix")]
    pub admin_prefix: String,
    /// Take the client id from X-Forwarded-For.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}
fn def_host() -> String { "0.0.0.0".into() }
fn def_port() -> u16 { 8000 }
fn def_name() -> String { "apexg".into() }
fn def_logging() -> String { "default".into() }
fn def_admin_prefix() -> String { "/_gateway".into() }

impl Default for GatewayCfg {
    fn default() -> Self {
        Self {
            host: def_host(),
            port: def_port(),
            name: def_name(),
            logging_mode: def_logging(),
            reject_unhealthy: false,
            admin_prefix: def_admin_prefix(),
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TracingCfg {
    #[serde(default)]
    pub otlp_endpoint: String,
    #[serde(default)]
    pub service_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCfg {
    #[serde(default = "def_engine")]
    pub engine: String, // lmdb | memory
    #[serde(default)]
    pub path: String,
}
fn def_engine() -> String { "memory".into() }

impl Default for MemoryCfg {
    fn default() -> Self {
        Self { engine: def_engine(), path: String::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsCfg {
    /// Request logs kept in memory for stats queries.
    #[serde(default = "def_log_capacity")]
    pub log_capacity: usize,
    /// Optional HTTP collector receiving every request log.
    #[serde(default)]
    pub collector_url: String,
    #[serde(default = "def_sweep")]
    pub sweep_interval_secs: u64,
}
fn def_log_capacity() -> usize { 10_000 }
fn def_sweep() -> u64 { 60 }

impl Default for MetricsCfg {
    fn default() -> Self {
        Self {
            log_capacity: def_log_capacity(),
            collector_url: String::new(),
            sweep_interval_secs: def_sweep(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub gateway: GatewayCfg,
    #[serde(default)]
    pub tracing: TracingCfg,
    #[serde(default)]
    pub memory: MemoryCfg,
    #[serde(default)]
    pub metrics: MetricsCfg,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl FileConfig {
    /// Rejects configs the gateway cannot run with. Endpoints pointing at
    /// unknown services are only warned about, they answer 503 at runtime.
    pub fn validate(&self) -> Result<()> {
        if !self.gateway.admin_prefix.starts_with('/') {
            bail!("gateway.admin_prefix must start with '/': {}", self.gateway.admin_prefix);
        }
        let mut ids = HashSet::new();
        for svc in &self.services {
            url::Url::parse(&svc.base_url)
                .with_context(|| format!("service {} has an invalid baseUrl", svc.id))?;
            if !svc.id.is_empty() && !ids.insert(svc.id.as_str()) {
                bail!("duplicate service id {}", svc.id);
            }
        }
        for ep in &self.endpoints {
            if !ep.path.starts_with('/') {
                bail!("endpoint {} path must start with '/': {}", ep.id, ep.path);
            }
            if !ids.contains(ep.target_service.as_str()) {
                warn!(endpoint = %ep.id, service = %ep.target_service, "endpoint targets an unknown service");
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<FileConfig> {
    let content = fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    let cfg: FileConfig = if path.ends_with(".yaml") || path.ends_with(".yml") {
        serde_yml::from_str(&content).with_context(|| format!("parse yaml {}", path))?
    } else if path.ends_with(".json") {
        serde_json::from_str(&content).with_context(|| format!("parse json {}", path))?
    } else if path.ends_with(".toml") {
        toml::from_str(&content).with_context(|| format!("parse toml {}", path))?
    } else {
        return Err(anyhow!("Unknown config extension: {}", path));
    };
    cfg.validate()?;
    Ok(cfg)
}
