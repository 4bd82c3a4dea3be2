//! Stages a model repository into a local diffusers-layout directory so the
//! server can start without network access.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use retouch_core::{
    hub_api, ModelSource, FALLBACK_TOKENIZER_REPO, MODEL_FILES, MODEL_INDEX_FILE, TOKENIZER_FILE,
};
use retouch_server::settings::{DEFAULT_LOCAL_MODEL_PATH, DEFAULT_MODEL_ID};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Download model weights for retouch-server")]
struct Args {
    /// Hugging Face model to download
    #[arg(long, env = "MODEL_NAME", default_value = DEFAULT_MODEL_ID)]
    model: String,

    /// Destination directory
    #[arg(long, env = "LOCAL_MODEL_PATH", default_value = DEFAULT_LOCAL_MODEL_PATH)]
    dest: PathBuf,

    /// Hugging Face access token
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

async fn stage(from: &Path, dest: &Path, file: &str) -> Result<()> {
    let target = dest.join(file);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::copy(from, &target)
        .await
        .with_context(|| format!("failed to write {}", target.display()))?;
    info!(file = %file, "Staged");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.dest.join(MODEL_INDEX_FILE).is_file() {
        info!(path = %args.dest.display(), "Model already present, nothing to do");
        return Ok(());
    }

    info!(model = %args.model, dest = %args.dest.display(), "Downloading model");
    let api = hub_api(args.token.as_deref())?;
    let source = ModelSource::Hub {
        api: api.clone(),
        id: args.model.clone(),
    };

    // The index goes last so a partial download is retried on the next run.
    let index = source.get(MODEL_INDEX_FILE).await?;

    for alternatives in MODEL_FILES {
        let mut staged = false;
        for file in alternatives.iter() {
            if let Some(path) = source.get_optional(file).await {
                stage(&path, &args.dest, file).await?;
                staged = true;
                break;
            }
        }
        anyhow::ensure!(
            staged,
            "none of {alternatives:?} found in {}",
            args.model
        );
    }

    let tokenizer = match source.get_optional(TOKENIZER_FILE).await {
        Some(path) => path,
        None => api
            .model(FALLBACK_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?,
    };
    stage(&tokenizer, &args.dest, TOKENIZER_FILE).await?;

    stage(&index, &args.dest, MODEL_INDEX_FILE).await?;
    info!(path = %args.dest.display(), "Model ready");
    Ok(())
}
