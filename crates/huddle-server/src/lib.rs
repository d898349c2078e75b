//! Huddle Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod error;
pub mod registry;
pub mod relay;
pub mod sfu;
pub mod state;
pub mod ws;

use anyhow::Result;
use relay::{LoopbackEngine, RelayEngine};

/// Create and configure the server application
///
/// Starts a relay worker and a router with the configured codecs. The
/// returned state is needed to drain sessions at shutdown.
pub async fn create_app(config: state::Config) -> Result<(axum::Router, state::AppState)> {
    let engine = LoopbackEngine::new();
    let worker = engine.create_worker().await?;
    let router = worker.create_router(&config.media_codecs).await?;
    tracing::info!("Relay router {} ready", router.id());

    let app_state = state::AppState::new(config, router);
    let app = api::create_router(app_state.clone());
    Ok((app, app_state))
}
