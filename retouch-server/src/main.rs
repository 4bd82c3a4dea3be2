use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use retouch_core::{InstructEditLoader, ModelResource, ModelSource};
use retouch_server::{router, settings::Settings, AppState};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::parse();
    settings.validate()?;
    info!(
        device = %settings.device(),
        model = %settings.model_name,
        local_path = %settings.local_model_path.display(),
        "Starting image edit server"
    );

    let resource = Arc::new(ModelResource::new(
        settings.device(),
        settings.inference_defaults(),
    ));
    let source = ModelSource::resolve(
        &settings.local_model_path,
        &settings.model_name,
        settings.hf_token.as_deref(),
    )?;
    resource
        .load::<InstructEditLoader>(source, settings.load_options())
        .await
        .context("failed to load model")?;

    let app = router(Arc::new(AppState::new(resource)));

    let bind_address = settings.bind_address();
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {e}");
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
