// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! WolfPulse — Proxmox inventory and backup-health collector
//!
//! A Wolf suite component that:
//! - Detects cluster membership across configured PVE endpoints
//! - Collects node, VM, and container inventory with failover and dedup
//! - Collects PBS datastores, snapshots, and verification health
//! - Reconstructs per-day backup runs from snapshot ground truth
//! - Serves the aggregate over a small read-only HTTP API

mod api;
mod cache;
mod config;
mod discovery;
mod pbs;
mod proxmox;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// WolfPulse — Proxmox VE & Backup Server monitoring
#[derive(Parser)]
#[command(name = "wolfpulse", version, about = "Proxmox monitoring for the Wolf software suite")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8554)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Path to the endpoints config (default: /etc/wolfpulse/endpoints.json)
    #[arg(short, long)]
    config: Option<String>,

    /// Seconds between discovery cycles
    #[arg(long, default_value_t = 60)]
    discovery_interval_secs: u64,

    /// Seconds between metrics cycles
    #[arg(long, default_value_t = 10)]
    metrics_interval_secs: u64,

    /// TLS certificate path (PEM)
    #[arg(long)]
    tls_cert: Option<String>,

    /// TLS private key path (PEM)
    #[arg(long)]
    tls_key: Option<String>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("wolfpulse=info".parse().unwrap())
                .add_directive("actix_web=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let config = Arc::new(config::PulseConfig::load(cli.config.as_deref()));
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    info!("");
    info!("  🐺 WolfPulse v{}", env!("CARGO_PKG_VERSION"));
    info!("  ──────────────────────────────────");
    info!("  Hostname:   {}", hostname);
    info!("  Endpoints:  {} PVE, {} PBS", config.pve.len(), config.pbs.len());
    info!("  History:    {} days", config.backup_history_days);
    info!("  API:        http://{}:{}", cli.bind, cli.port);
    info!("");

    if config.pve.is_empty() && config.pbs.is_empty() {
        warn!("No endpoints configured — edit /etc/wolfpulse/endpoints.json");
    }

    // Startup connectivity self-test, purely informational
    for endpoint in &config.pve {
        let client = proxmox::PveClient::new(endpoint);
        match client.test_connection(proxmox::DISCOVERY_TIMEOUT).await {
            Ok(version) => info!("  PVE {}: {}", endpoint.id, version),
            Err(e) => warn!("  PVE {}: unreachable ({})", endpoint.id, e),
        }
    }
    for endpoint in &config.pbs {
        let client = pbs::PbsClient::new(endpoint);
        match client.version().await {
            Ok(version) => info!("  PBS {}: Proxmox Backup Server {}", endpoint.id, version),
            Err(e) => warn!("  PBS {}: unreachable ({})", endpoint.id, e),
        }
    }

    let discovery_state = Arc::new(discovery::DiscoveryState::new());
    let app_state = web::Data::new(api::AppState::new(config.clone(), discovery_state.clone()));

    // Background: discovery cycle
    let discovery_app_state = app_state.clone();
    let discovery_config = config.clone();
    let discovery_interval = Duration::from_secs(cli.discovery_interval_secs.max(10));
    tokio::spawn(async move {
        loop {
            let started = std::time::Instant::now();
            let snapshot = discovery::fetch_discovery_data(
                &discovery_config,
                &discovery_app_state.discovery,
            ).await;
            {
                let mut current = discovery_app_state.snapshot.write().unwrap();
                *current = Some(snapshot);
            }
            {
                let mut last = discovery_app_state.last_cycle_secs.write().unwrap();
                *last = Some(started.elapsed().as_secs_f32());
            }
            tokio::time::sleep(discovery_interval).await;
        }
    });

    // Background: metrics cycle for running guests
    let metrics_app_state = app_state.clone();
    let metrics_config = config.clone();
    let metrics_interval = Duration::from_secs(cli.metrics_interval_secs.max(5));
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(metrics_interval).await;
            // Clone the guest lists out — the lock must not be held across awaits
            let (vms, containers) = {
                let snapshot = metrics_app_state.snapshot.read().unwrap();
                match snapshot.as_ref() {
                    Some(s) => (s.vms.clone(), s.containers.clone()),
                    None => continue,
                }
            };
            let metrics = discovery::fetch_metrics_data(
                &metrics_config,
                &vms,
                &containers,
                &metrics_app_state.discovery,
            ).await;
            let mut current = metrics_app_state.metrics.write().unwrap();
            *current = metrics;
        }
    });

    // Try to load TLS using OpenSSL — fall back to HTTP if anything goes wrong
    let ssl_builder = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

            let mut builder = match SslAcceptor::mozilla_intermediate(SslMethod::tls()) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Failed to create SSL acceptor: {} — falling back to HTTP", e);
                    return run_http(&cli, app_state).await;
                }
            };
            if let Err(e) = builder.set_certificate_chain_file(cert_path) {
                warn!("Cannot load TLS cert '{}': {} — falling back to HTTP", cert_path, e);
                return run_http(&cli, app_state).await;
            }
            if let Err(e) = builder.set_private_key_file(key_path, SslFiletype::PEM) {
                warn!("Cannot load TLS key '{}': {} — falling back to HTTP", key_path, e);
                return run_http(&cli, app_state).await;
            }
            Some(builder)
        }
        _ => None,
    };

    if let Some(ssl_builder) = ssl_builder {
        let https_bind = format!("{}:{}", cli.bind, cli.port);
        info!("  🔒 TLS enabled — https://{}", https_bind);
        info!("");
        HttpServer::new(move || {
            App::new()
                .app_data(app_state.clone())
                .configure(api::configure)
        })
        .bind_openssl(&https_bind, ssl_builder)
        .map_err(|e| {
            tracing::error!("Failed to bind HTTPS on {}: {}", https_bind, e);
            e
        })?
        .run()
        .await
    } else {
        run_http(&cli, app_state).await
    }
}

/// Start the plain-HTTP server
async fn run_http(cli: &Cli, app_state: web::Data<api::AppState>) -> std::io::Result<()> {
    info!("  ⚡ HTTP mode — http://{}:{}", cli.bind, cli.port);
    info!("");
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .configure(api::configure)
    })
    .bind(format!("{}:{}", cli.bind, cli.port))?
    .run()
    .await
}
