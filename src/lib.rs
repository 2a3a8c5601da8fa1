pub mod encoder;
pub mod error;
pub mod generation;
pub mod palette;
pub mod pipeline;
pub mod server;
pub mod settings;
pub mod upload;
pub mod utils;
pub mod vision;
pub mod wizard;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use crate::error::ServiceError;
pub use crate::pipeline::Pipeline;
pub use crate::settings::Settings;

use crate::settings::mask_key;
use crate::utils::ensure_dir;

/// Validate the configuration, start the upload sweeper and serve the HTTP API
/// until ctrl-c.
pub async fn serve(settings: Settings) -> Result<()> {
    settings.validate()?;
    ensure_dir(&settings.upload_dir)?;

    let pipeline = Arc::new(Pipeline::new(settings.clone())?);
    let token = CancellationToken::new();
    let sweeper = match settings.upload_ttl() {
        Some(ttl) => {
            info!(ttl_secs = ttl.as_secs(), "upload sweeper enabled");
            Some(
                pipeline
                    .store()
                    .clone()
                    .spawn_sweeper(settings.sweep_interval(), token.clone()),
            )
        }
        None => {
            warn!("UPLOAD_TTL_SECS is 0, uploads are never removed");
            None
        }
    };

    let app = server::router(pipeline.clone());
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        addr = %addr,
        upload_dir = %settings.upload_dir.display(),
        vision_model = %settings.vision_model,
        vision_key = %settings.vision_api_key.as_deref().map(mask_key).unwrap_or_default(),
        generation_model = %settings.generation_model,
        "server listening"
    );

    let shutdown = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
                // Never resolve: without a signal handler the server runs until killed.
                std::future::pending::<()>().await;
            }
            info!("shutting down");
            shutdown.cancel();
        })
        .await
        .context("server error")?;

    token.cancel();
    if let Some(handle) = sweeper {
        let _ = handle.await;
    }
    Ok(())
}
