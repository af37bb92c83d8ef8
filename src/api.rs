use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::aggregator::load_snapshot;
use crate::models::{CheckOutcome, Snapshot};

type ApiError = (StatusCode, Json<Value>);

async fn read_results(path: &std::path::Path) -> Result<Snapshot, ApiError> {
    load_snapshot(path).await.map_err(|e| {
        error!("Snapshot {:?} unavailable: {}", path, e);
        (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "Results not available yet" })))
    })
}

pub async fn get_results(State(path): State<Arc<PathBuf>>) -> Result<Json<Snapshot>, ApiError> {
    Ok(Json(read_results(&path).await?))
}

pub async fn get_server_results(
    State(path): State<Arc<PathBuf>>,
    Path(server_name): Path<String>,
) -> Result<Json<Vec<CheckOutcome>>, ApiError> {
    let mut snapshot = read_results(&path).await?;
    match snapshot.servers.remove(&server_name) {
        Some(outcomes) if !outcomes.is_empty() => Ok(Json(outcomes)),
        _ => Err((StatusCode::NOT_FOUND, Json(json!({ "error": "Server not found" })))),
    }
}

pub fn create_router(snapshot_path: PathBuf) -> Router {
    Router::new()
        .route("/results", get(get_results))
        .route("/results/{server_name}", get(get_server_results))
        .with_state(Arc::new(snapshot_path))
}

pub async fn start_server(port: u16, snapshot_path: PathBuf) -> std::io::Result<()> {
    let app = create_router(snapshot_path);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Results API: http://localhost:{}/results", addr.port());
    axum::serve(listener, app).await
}
