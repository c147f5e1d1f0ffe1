//! # EDL Server - Entity Data Layer for PostgreSQL
//!
//! Serves configured PostgreSQL tables as entity-graph datasets: streaming
//! reads with continuation tokens over a monotonic since column, and
//! streaming writes batched into chunked upsert transactions.
//!
//! ## Usage
//!
//! ```bash
//! # Run against a local configuration file
//! edl-server --config file://resources/config.json
//!
//! # Point at a config service; CONFIG_LOCATION overrides the flag
//! CONFIG_LOCATION=https://config.example.io/layers/pgsql edl-server
//!
//! # Enable debug logging
//! RUST_LOG=debug edl-server --config file://resources/config.json
//! ```
//!
//! Database credentials can be supplied or overridden through `PGSQL_USER`,
//! `PGSQL_PASSWORD`, `PGSQL_DATABASE`, `PGSQL_HOST` and `PGSQL_PORT`.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edl_core::registry::Registry;
use edl_pg::PoolManager;

mod env;
mod loader;
mod web;

/// Command-line arguments for the dataset server
#[derive(Parser, Debug)]
#[command(name = "edl-server")]
#[command(about = "Entity data layer server for PostgreSQL")]
struct Args {
    /// Configuration location (`file://…` or `http(s)://…`); the
    /// CONFIG_LOCATION environment variable takes precedence
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let env = env::Env::load();
    let config_location = if env.config_location.is_empty() {
        args.config.unwrap_or_default()
    } else {
        env.config_location.clone()
    };
    if config_location.is_empty() {
        anyhow::bail!("no configuration location given; use --config or CONFIG_LOCATION");
    }

    let metrics = PrometheusBuilder::new().install_recorder()?;

    let registry = Arc::new(Registry::new());
    let pools = Arc::new(PoolManager::new());

    match loader::reload(&registry, &config_location).await {
        Ok(_) => info!(location = %config_location, "configuration loaded"),
        Err(e) => warn!(error = %e, location = %config_location, "could not load configuration"),
    }
    loader::spawn_refresh(
        registry.clone(),
        config_location.clone(),
        env.refresh_interval_secs,
    );

    let state = web::AppState {
        registry,
        pools: pools.clone(),
        service_name: env.service_name.clone(),
        authorization: env.authorization_middleware.clone(),
        metrics,
    };
    let app = web::router(state);

    let addr = format!("0.0.0.0:{}", env.port);
    info!(service = %env.service_name, profile = %env.profile, %addr, "starting server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            println!("\nReceived Ctrl-C, shutting down...");
        })
        .await?;

    pools.close_all().await;
    Ok(())
}
