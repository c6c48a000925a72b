//! HTTP query/control surface for the daemon.
//!
//! Serves the current endpoint table and a shutdown trigger. Handlers only
//! read the address table; they never modify it.

pub mod routes;

pub use routes::{AppState, build_router};

use tokio::net::TcpListener;
use tracing::info;

/// Serve the control surface until the shutdown token in `state` fires.
///
/// The listener is closed as soon as shutdown begins; in-flight requests are
/// allowed to finish.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Control interface listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}
