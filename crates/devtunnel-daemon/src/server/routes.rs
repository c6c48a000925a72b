use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::address::{AddressTable, Endpoint};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub table: AddressTable,
    pub shutdown: CancellationToken,
}

/// Build the control router.
pub fn build_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", get(tunnels))
        .route("/shutdown", get(shutdown))
        .with_state(state)
}

/// `GET /`: `{udid: [ip, port]}` for every running tunnel.
pub async fn tunnels(State(state): State<AppState>) -> Json<BTreeMap<String, Endpoint>> {
    Json(state.table.snapshot())
}

/// `GET /shutdown`: stop all supervisors and the server. Responds before
/// teardown completes.
pub async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    info!("Shutdown requested via control interface");
    state.shutdown.cancel();
    (StatusCode::OK, "Server shutting down...")
}
