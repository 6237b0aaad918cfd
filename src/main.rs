mod cache;
mod config;
mod db;
mod engine;
mod errors;
mod events;
mod executor;
mod market;
mod orchestrator;
mod predictor;
mod retry;
mod safety;
mod server;
mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::db::DbCommand;
use crate::events::EventBus;
use crate::market::api_client::HttpPoolApiClient;
use crate::orchestrator::BotOrchestrator;
use crate::predictor::PredictorClient;
use crate::state::AppState;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    eprintln!("[dlmm-bot-orchestrator] binary started, setting up logging...");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("orchestrator starting");

    let cfg = match config::AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("config error: {e}");
            std::process::exit(1);
        }
    };

    let db_pool = match db::init_db(std::path::Path::new("data")) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("database init error: {e}");
            std::process::exit(1);
        }
    };

    let (db_tx, db_rx) = mpsc::channel::<DbCommand>(1024);
    let db_handle = db::DbHandle::new(db_pool.clone(), db_tx);

    // 1. DB writer task -- the only task that ever mutates the connection.
    tokio::spawn(async move {
        db::run_db_writer(db_pool, db_rx).await;
    });

    let events = EventBus::new();
    let pool_api_client = Arc::new(HttpPoolApiClient::new(cfg.pool_api_url.clone()));
    let predictor = Some(Arc::new(PredictorClient::new(cfg.predictor_url.clone(), cfg.predictor_api_key.clone())));

    let orchestrator = BotOrchestrator::new(db_handle.clone(), events.clone(), pool_api_client, predictor.clone());

    match orchestrator.recover_running_bots().await {
        Ok(recovered) => tracing::info!(recovered, "bot recovery pass complete"),
        Err(e) => tracing::error!(error = %e, "failed to recover running bots at startup"),
    }

    let app_state = AppState::new(cfg.clone(), db_handle, events, orchestrator.clone(), predictor);

    let cors = build_cors(&cfg.cors_origins);

    let app = axum::Router::new()
        .route("/health", axum::routing::get(server::routes::health))
        .route("/bots", axum::routing::post(server::routes::create_bot).get(server::routes::list_bots))
        .route(
            "/bots/{id}",
            axum::routing::get(server::routes::get_bot).put(server::routes::update_bot_config).delete(server::routes::delete_bot),
        )
        .route("/bots/{id}/start", axum::routing::post(server::routes::start_bot))
        .route("/bots/{id}/stop", axum::routing::post(server::routes::stop_bot))
        .route("/bots/{id}/emergency-stop", axum::routing::post(server::routes::emergency_stop_bot))
        .route("/bots/{id}/positions", axum::routing::get(server::routes::get_positions))
        .route("/positions/active", axum::routing::get(server::routes::list_active_positions))
        .route("/positions/history", axum::routing::get(server::routes::list_position_history))
        .route("/positions/{positionId}", axum::routing::get(server::routes::get_position))
        .route("/positions/{positionId}/close", axum::routing::post(server::routes::close_position))
        .route("/ml/health", axum::routing::get(server::routes::ml_health))
        .route("/ml/predict", axum::routing::post(server::routes::ml_predict))
        .route("/ml/reload", axum::routing::post(server::routes::ml_reload))
        .route("/ml/feedback", axum::routing::get(server::routes::ml_feedback))
        .route("/presets", axum::routing::get(server::routes::list_presets).post(server::routes::create_preset))
        .route("/counters", axum::routing::get(server::routes::get_counters))
        .route("/events/stream", axum::routing::get(server::sse::stream_events))
        .layer(cors)
        .with_state(app_state);

    let addr = format!("0.0.0.0:{}", cfg.port);
    tracing::info!("server listening on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        tracing::error!("bind error: {e}");
        std::process::exit(1);
    });

    let serve_result = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;
    if let Err(e) = serve_result {
        tracing::error!("server error: {e}");
    }

    tracing::info!("server stopped accepting connections, stopping bots");
    orchestrator.stop_all(SHUTDOWN_DEADLINE).await;
    tracing::info!("shutdown complete");
}

fn build_cors(origins: &[String]) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{AllowOrigin, CorsLayer};

    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any);
    }

    let parsed: Vec<axum::http::HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
