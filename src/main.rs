mod auth;
mod config;
mod middleware;

mod db;
mod engine;
mod error;
mod import;
mod lifecycle;
mod models;
mod outbound;
mod routes;
mod slug;
mod templates;

use std::sync::Arc;
use std::time::Duration;

use crate::{
    config::Config,
    engine::{store::PgEngineStore, Engine, EngineSettings},
    models::AppState,
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cfg = Config::from_env()?;
    let pool = db::connect_pg(&cfg.database_url, cfg.db_max_connections).await?;

    let engine = Arc::new(Engine::new(
        Arc::new(PgEngineStore::new(pool.clone())),
        outbound::build_sender(&cfg),
        EngineSettings {
            batch_size: cfg.engine_batch_size,
            public_base_url: cfg.public_base_url.clone(),
            booking_url: cfg.booking_url.clone(),
            sender_name: cfg.sender_name.clone(),
        },
    ));

    if cfg.engine_autostart {
        let state = engine.start().await?;
        if state.is_paused {
            tracing::warn!(reason = ?state.pause_reason, "engine autostarted but is paused");
        }
    }
    let ticker = engine
        .clone()
        .spawn_ticker(Duration::from_secs(cfg.engine_tick_secs.max(1)));

    let state = AppState {
        db: pool,
        engine,
        operator_token_sha256: cfg.operator_token_sha256.clone(),
    };

    // The operator console and public booking pages are served from other origins.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ticker.abort();
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
