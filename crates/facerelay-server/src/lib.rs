//! Facerelay Server Library
//!
//! This module exposes the relay components for testing and embedding.

pub mod api;
pub mod auth;
pub mod directory;
pub mod error;
pub mod relay;
pub mod rtc;
pub mod state;
pub mod ws;

use anyhow::Result;
use std::sync::Arc;

use directory::{Directory, PgDirectory};
use relay::HttpRecognitionBackend;
use rtc::WebRtcSessionFactory;

/// Create and configure the relay application
pub async fn create_app(config: state::Config) -> Result<(axum::Router, state::AppState)> {
    let directory: Arc<dyn Directory> = match &config.database_url {
        Some(url) => Arc::new(PgDirectory::connect(url, config.database_max_connections).await?),
        None => {
            tracing::info!(
                "Using static directory ({} devices, {} persons)",
                config.devices.len(),
                config.persons.len()
            );
            Arc::new(config.static_directory())
        }
    };

    let sessions = Arc::new(WebRtcSessionFactory::new(
        config.stun_servers.clone(),
        Arc::from(facerelay_media::default_decoder_factory()),
    )?
    .with_gather_timeout(config.ice_gather_timeout()));
    let backend = Arc::new(HttpRecognitionBackend::new(config.recognition_timeout())?);

    let app_state = state::AppState::new(config, directory, sessions, backend);
    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
