use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::Json,
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::database;
use crate::AppState;

pub mod automation;

pub use automation::automation_routes;

pub fn app_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "NDIS Automation Engine v0.1.0" }))
        .route("/health", get(health_check))
        .nest("/api/v1/automation", automation_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let database_ok = database::health_check(&state.db_pool).await;
    let scheduler_running = !state.scheduler.is_shut_down();

    let status = if database_ok && scheduler_running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if status == StatusCode::OK { "healthy" } else { "degraded" },
            "service": "ndis-automation",
            "database": database_ok,
            "scheduler": if scheduler_running { "running" } else { "stopped" },
            "pool": database::get_pool_stats(&state.db_pool),
        })),
    )
}
