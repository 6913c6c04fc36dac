//! Live heart counter for dining court foods.
//!
//! # Flow
//! - Users heart a food, the counter store bumps the count and appends the new value to a change log
//! - The change log is split into partitions, one poller per partition tails it
//! - Discovery looks for new partitions on an interval and starts pollers for them
//! - Every poller feeds one unified channel, the router decodes each record and fans it out
//! - Subscribers only see the foods they asked for, over server sent events
//!
//!
//!
//! # Notes
//!
//! ## Redis Streams
//! The counts live in one hash, the change log is a handful of streams picked by hashing the food name.
//! The hash and the stream append happen in one script, so a count is never visible without its change record.
//!
//! Pollers start at the latest entry. Anything appended before a partition is discovered is skipped, clients
//! are expected to fetch current counts with `GET /hearts` first and then follow the stream.
//!
//! ## Slow subscribers
//! Fan-out never blocks on one subscriber. A subscriber whose buffer is full is disconnected by default,
//! the client reconnects and fetches current counts again.
//!
//!
//!
//! # Setup
//!
//! Run against Redis.
//! ```sh
//! REDIS_URL=redis://localhost:6379 cargo run
//! ```
//!
//! Run without Redis, counts are lost on restart.
//! ```sh
//! STORE_BACKEND=memory cargo run
//! ```
//!
//! Log every polled record and every published count.
//! ```sh
//! RUST_LOG=info cargo run --features verbose
//! ```
use std::time::Duration;

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::get,
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod client;
pub mod config;
pub mod database;
pub mod decode;
pub mod discovery;
pub mod error;
pub mod memory;
pub mod model;
pub mod pipeline;
pub mod poller;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
pub mod utils;
pub mod writer;

use config::Config;
use error::AppError;
use pipeline::Pipeline;
use routes::{add_hearts_handler, get_hearts_handler, put_hearts_handler, stream_hearts_handler};
use state::State;

pub async fn start_server() -> Result<(), AppError> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = State::new(Config::load()?).await?;

    info!("Starting change stream...");
    let pipeline = Pipeline::start(
        state.change_log.clone(),
        state.registry.clone(),
        state.config.pipeline.clone(),
    );

    info!("Starting server...");

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    let app = Router::new()
        .route(
            "/hearts",
            get(get_hearts_handler)
                .post(add_hearts_handler)
                .put(put_hearts_handler),
        )
        .route("/hearts/stream", get(stream_hearts_handler))
        .layer(cors)
        .with_state(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .map_err(|e| AppError::InternalError(Box::new(e)))?;
    info!("Server running on {address}");

    let registry = state.registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;

            // Open streams would otherwise hold the server up forever
            registry.close_all();
        })
        .await
        .map_err(|e| AppError::InternalError(Box::new(e)))?;

    let stats = pipeline.shutdown().await;
    info!(
        "Server shutting down, {} counts published in {} deliveries",
        stats.decoded, stats.deliveries
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
