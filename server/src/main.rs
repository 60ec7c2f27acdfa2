#![allow(dead_code)]

mod analysis;
mod backfill;
mod db_core;
mod error;
mod model;
mod observability;
mod rate_limiters;
mod routes;
mod server_config;
#[cfg(test)]
mod testing;

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use analysis::MistralAnalyzer;
use axum::{extract::FromRef, Router};
use backfill::BackfillRegistry;
use mimalloc::MiMalloc;
use model::item::SeaOrmItemStore;
use rate_limiters::RateLimiters;
use routes::AppRouter;
use sea_orm::{ConnectOptions, Database};
use server_config::cfg;
use tokio::{signal, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

pub type HttpClient = reqwest::Client;

/// How long shutdown waits for stopped jobs to finish their in-flight calls.
const SHUTDOWN_DRAIN_SECS: u64 = 30;

#[derive(Clone, FromRef)]
struct ServerState {
    registry: BackfillRegistry,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(false))
        .init();

    let db_url = env::var("DATABASE_URL").expect("DATABASE_URL is not set in .env file");
    let mut db_options = ConnectOptions::new(db_url);
    db_options.sqlx_logging(false);

    let conn = Database::connect(db_options)
        .await
        .expect("Database connection failed");

    let http_client = reqwest::ClientBuilder::new()
        .use_rustls_tls()
        .timeout(Duration::from_secs(cfg.api.request_timeout_secs))
        .build()?;

    let rate_limiters = RateLimiters::from_limits(&cfg.api.prompt_limits);
    let analyzer = MistralAnalyzer::from_config(http_client, rate_limiters.clone());
    let registry = BackfillRegistry::new(
        Arc::new(SeaOrmItemStore::new(conn)),
        Arc::new(analyzer),
        cfg.backfill.clone(),
    );

    let state = ServerState {
        registry: registry.clone(),
    };

    let shutdown = CancellationToken::new();
    let watch_handle = observability::spawn_progress_watcher(
        registry.clone(),
        rate_limiters,
        Duration::from_secs(cfg.backfill.watch_interval_secs.max(1)),
        shutdown.clone(),
    );

    let router = AppRouter::create(state);
    let server_handle = run_server(router, registry, shutdown.clone());

    tokio::select! {
        _ = server_handle => {
            tracing::info!("Server shut down, exiting");
        }
        _ = watch_handle => {
            tracing::info!("Progress watch ended");
        }
    }

    Ok(())
}

async fn shutdown_signal(registry: BackfillRegistry, shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    let stopped = registry.stop_all().await;
    tracing::info!("Shutdown requested, stopped {} backfill jobs", stopped);

    if !registry
        .wait_all(Duration::from_secs(SHUTDOWN_DRAIN_SECS))
        .await
    {
        tracing::warn!("Backfill jobs still draining after {}s", SHUTDOWN_DRAIN_SECS);
    }
    shutdown.cancel();
}

fn run_server(
    router: Router,
    registry: BackfillRegistry,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let port = env::var("PORT").unwrap_or("5006".to_string());
        tracing::info!("Analysis backfill server running on http://0.0.0.0:{}", port);
        tracing::info!("{}", *cfg);

        let port = match port.parse::<u16>() {
            Ok(port) => port,
            Err(e) => {
                tracing::error!("Invalid PORT {}: {:?}", port, e);
                return;
            }
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("Could not bind {}: {:?}", addr, e);
                return;
            }
        };

        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(registry, shutdown))
            .await
        {
            tracing::error!("Server error: {:?}", e);
        }
    })
}
