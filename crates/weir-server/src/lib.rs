//! Weir orchestration server.
//!
//! Wires one WebRTC client to an engine session, bridges that session to
//! an external filter pipeline over plain RTP, and supervises recorder
//! processes fed from the same session.

pub mod bridge;
pub mod config;
pub mod recorder;
pub mod session;
pub mod signal;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::signal::AppState;

/// The HTTP surface: signaling socket, health probe, static demo page.
pub fn app(state: AppState, public_dir: &std::path::Path) -> Router {
    Router::new()
        .route("/ws", get(signal::ws_handler))
        .route("/health", get(|| async { "ok" }))
        .fallback_service(ServeDir::new(public_dir))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
