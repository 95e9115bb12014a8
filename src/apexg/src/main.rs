use anyhow::{Context, Result};
use apexg_config::load_config;
use apexg_gateway::{Dispatcher, DispatcherOptions, Gateway, HttpBackend, Maintenance, ServerSettings};
use apexg_logger::HttpLogSink;
use apexg_memory::{Memory, StoreSink};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(version, about = "ApexG - API gateway for the ApexRebate platform")]
struct Args {
    /// Path to config file (yaml/json/toml)
    #[arg(short, long, default_value = "./config.yaml")]
    config: String,
    /// Overrides gateway.host
    #[arg(long)]
    host: Option<String>,
    /// Overrides gateway.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    if let Some(host) = args.host {
        config.gateway.host = host;
    }
    if let Some(port) = args.port {
        config.gateway.port = port;
    }

    let service_name = match config.tracing.service_name.as_str() {
        "" => config.gateway.name.clone(),
        name => name.to_string(),
    };
    let otlp = Some(config.tracing.otlp_endpoint.as_str()).filter(|e| !e.is_empty());
    let tracer = apexg_tracing::init(&service_name, otlp, &config.gateway.logging_mode)?;

    let memory = Arc::new(Memory::open(&config.memory.engine, &config.memory.path)?);
    let options = DispatcherOptions {
        log_capacity: config.metrics.log_capacity,
        reject_unhealthy: config.gateway.reject_unhealthy,
    };
    let (store_sink, store_writer) = StoreSink::spawn(memory.clone(), config.metrics.log_capacity, 4096);
    let mut dispatcher = Dispatcher::new(Arc::new(HttpBackend::new()?), options)
        .with_memory(memory)
        .with_sink(Arc::new(store_sink));
    let mut shipper = None;
    if !config.metrics.collector_url.is_empty() {
        let (sink, handle) = HttpLogSink::spawn(&config.metrics.collector_url, 1024);
        dispatcher = dispatcher.with_sink(Arc::new(sink));
        shipper = Some(handle);
    }
    let dispatcher = Arc::new(dispatcher);

    let (restored_endpoints, restored_services) = dispatcher.restore().await?;
    if restored_endpoints + restored_services > 0 {
        info!(endpoints = restored_endpoints, services = restored_services, "restored registrations");
    }
    for service in config.services {
        dispatcher.register_service(service);
    }
    for endpoint in config.endpoints {
        dispatcher.register_endpoint(endpoint).await;
    }

    dispatcher.monitor().start();
    let maintenance = Maintenance::start(
        dispatcher.clone(),
        Duration::from_secs(config.metrics.sweep_interval_secs),
    );

    let addr: SocketAddr = format!("{}:{}", config.gateway.host, config.gateway.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.gateway.host, config.gateway.port))?;
    let gateway = Arc::new(Gateway::new(
        dispatcher.clone(),
        ServerSettings {
            name: config.gateway.name.clone(),
            admin_prefix: config.gateway.admin_prefix.clone(),
            trust_forwarded_for: config.gateway.trust_forwarded_for,
        },
    ));

    let served = tokio::select! {
        res = gateway.serve(addr) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    };

    maintenance.stop().await;
    dispatcher.monitor().stop().await;
    store_writer.abort();
    if let Some(handle) = shipper {
        handle.abort();
    }
    if let Err(e) = tracer.shutdown() {
        warn!("tracer shutdown failed: {e}");
    }
    served
}
