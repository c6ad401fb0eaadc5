mod attachments;
mod classify;
mod config;
mod context;
mod db;
mod deals;
mod error;
mod handlers;
mod mail;
mod models;
mod notify;
mod schema;
mod sync;
mod workers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::classify::{oracle::LlmOracle, Classifier};
use crate::config::AppConfig;
use crate::context::AppContext;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = AppConfig::from_env();

    tracing::info!("Starting inbox triage backend");

    let pool = db::establish_connection_pool()?;
    tracing::info!("Database connection pool initialized");

    let oracle = Arc::new(LlmOracle::new(&config));
    let classifier = Classifier::new(oracle);
    let ctx = AppContext::new(pool, config, classifier);

    let _scheduler = workers::start_sync_scheduler(ctx.clone());
    let _backlog = workers::start_backlog_workers(ctx.clone());
    let _dispatcher = workers::start_notification_loop(ctx.clone());

    let app = create_app(ctx);

    let addr = SocketAddr::from(([0, 0, 0, 0], 3000));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn create_app(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", handlers::api_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(ctx)
}
