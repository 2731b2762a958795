//! gproxy: a configurable edge reverse proxy
//!
//! Clients address origins through `/proxy/{protocol}/{host}/{path...}`;
//! gproxy resolves registered targets, applies policies and rules, caches
//! responses and audit-logs every request. Built on Cloudflare's Pingora
//! framework.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pingora::prelude::*;
use pingora_proxy::http_proxy_service;
use proxy::{
    CacheEngine, GproxyIngress, JsonLogSink, ProxyHandler, ProxyHandlerOptions, RequestLogger,
};
use proxy::request_log::TracingLogSink;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::{FsBlobStore, GproxyConfig, LogSink, MemoryStore};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "gproxy")]
#[command(author, version, about = "A configurable edge reverse proxy")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "gproxy.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Test configuration and exit
    #[arg(short, long)]
    test: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server
    Run {
        #[arg(short, long, default_value = "gproxy.toml")]
        config: PathBuf,
    },
    /// Validate configuration
    Validate {
        #[arg(short, long, default_value = "gproxy.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Some(Commands::Validate { config }) => validate_config(config),
        Some(Commands::Run { config }) => run_server(config),
        None => {
            if cli.test {
                validate_config(cli.config)
            } else {
                run_server(cli.config)
            }
        }
    }
}

fn run_server(config_path: PathBuf) -> Result<()> {
    info!("Starting gproxy");
    info!(config = ?config_path, "Loading configuration");

    let config = GproxyConfig::load(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    for warning in config.pattern_warnings() {
        warn!(warning = %warning, "Configuration pattern will be skipped at runtime");
    }
    info!(
        targets = config.targets.len(),
        policies = config.policies.len(),
        header_rules = config.header_rules.len(),
        response_rules = config.response_rules.len(),
        cache_settings = config.cache_settings.len(),
        "Configuration loaded"
    );

    let memory = Arc::new(MemoryStore::from_config(&config));

    // Blob storage for oversized cached bodies
    let blobs: Option<Arc<dyn store::BlobStore>> = match &config.cache.blob_dir {
        Some(dir) => {
            let rt = tokio::runtime::Runtime::new()?;
            let blob_store = rt
                .block_on(FsBlobStore::new(dir))
                .context("Failed to initialize blob storage")?;
            Some(Arc::new(blob_store))
        }
        None => {
            info!("No blob directory configured, oversized bodies will not be cached");
            None
        }
    };

    // Request log sink: JSONL file when configured, tracing otherwise
    let sink: Arc<dyn LogSink> = match &config.log.path {
        Some(path) => {
            let sink = JsonLogSink::new(path)
                .with_context(|| format!("Failed to open request log {:?}", path))?;
            info!(path = ?path, "Request logging to file enabled");
            Arc::new(sink)
        }
        None => Arc::new(TracingLogSink),
    };
    let logger = Arc::new(RequestLogger::new(sink, config.log.channel_capacity));

    let cache = CacheEngine::new(
        memory.clone(),
        memory.clone(),
        blobs,
        config.cache.inline_max_bytes,
    );

    let handler = Arc::new(
        ProxyHandler::new(
            memory.clone(),
            cache,
            logger.clone(),
            ProxyHandlerOptions {
                upstream_timeout: Duration::from_secs(config.server.upstream_timeout_secs),
            },
        )
        .context("Failed to create proxy handler")?,
    );

    let ingress = GproxyIngress::new(handler.clone(), config.server.route_prefix.clone());

    // Create Pingora server
    let mut server = Server::new(None).context("Failed to create Pingora server")?;
    server.bootstrap();

    for listen_addr in &config.server.listen {
        let mut service = http_proxy_service(&server.configuration, ingress.clone());

        let addr = if listen_addr.starts_with(':') {
            format!("0.0.0.0{}", listen_addr)
        } else {
            listen_addr.clone()
        };

        service.add_tcp(&addr);
        info!(address = %addr, "Listening (HTTP)");

        server.add_service(service);
    }

    // Periodically sweep expired cache entries off the hot path
    if config.cache.sweep_interval_secs > 0 {
        let sweep_handler = handler.clone();
        let interval = Duration::from_secs(config.cache.sweep_interval_secs);
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create tokio runtime for cache sweep");
                    return;
                }
            };
            rt.block_on(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match sweep_handler.cache().invalidate_expired().await {
                        Ok(0) => {}
                        Ok(removed) => info!(removed = removed, "Swept expired cache entries"),
                        Err(e) => warn!(error = %e, "Cache sweep failed"),
                    }
                }
            });
        });
    }

    // Drain outstanding request log writes before exiting
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, draining request log...");
        logger.shutdown();
        info!("Shutdown complete");
        std::process::exit(0);
    })
    .ok();

    server.run_forever();
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    let config = GproxyConfig::load(&config_path)
        .with_context(|| format!("Invalid configuration in {:?}", config_path))?;

    for warning in config.pattern_warnings() {
        println!("warning: {}", warning);
    }
    println!(
        "Configuration OK: {} target(s), {} policy(ies), {} header rule(s), {} response rule(s), {} cache setting(s)",
        config.targets.len(),
        config.policies.len(),
        config.header_rules.len(),
        config.response_rules.len(),
        config.cache_settings.len()
    );
    Ok(())
}
