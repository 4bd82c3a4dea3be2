use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder};
use tracing::{debug, info};

/// Where model files come from.
#[derive(Debug, Clone)]
pub enum ModelSource {
    /// A pre-staged directory in the diffusers layout.
    Local(PathBuf),
    /// A Hugging Face model repository.
    Hub { api: Api, id: String },
}

/// Builds a hub client, authenticated when a token is supplied.
pub fn hub_api(token: Option<&str>) -> Result<Api> {
    ApiBuilder::new()
        .with_token(token.map(str::to_string))
        .with_progress(false)
        .build()
        .context("failed to create hf hub API")
}

impl ModelSource {
    /// Prefers `local_dir` when it exists, otherwise falls back to the hub
    /// repository `model_id`.
    pub fn resolve(local_dir: &Path, model_id: &str, token: Option<&str>) -> Result<Self> {
        if local_dir.is_dir() {
            info!(path = %local_dir.display(), "Loading model from local path");
            return Ok(Self::Local(local_dir.to_path_buf()));
        }
        if model_id.trim().is_empty() {
            bail!(
                "no model at {} and no model identifier configured",
                local_dir.display()
            );
        }
        info!(model = %model_id, "Loading model from Hugging Face");
        let api = hub_api(token)?;
        Ok(Self::Hub {
            api,
            id: model_id.to_string(),
        })
    }

    /// Display name used in logs.
    pub fn name(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::Hub { id, .. } => id.clone(),
        }
    }

    /// Path to `file` (relative to the repository root), downloading it when
    /// the source is remote.
    pub async fn get(&self, file: &str) -> Result<PathBuf> {
        match self {
            Self::Local(root) => {
                let path = root.join(file);
                if !path.is_file() {
                    bail!("missing model file {}", path.display());
                }
                Ok(path)
            }
            Self::Hub { api, id } => api
                .model(id.clone())
                .get(file)
                .await
                .with_context(|| format!("failed to fetch {file} from {id}")),
        }
    }

    /// Like [`ModelSource::get`] but returns `None` when the file cannot be
    /// obtained. The cause is logged at debug level.
    pub async fn get_optional(&self, file: &str) -> Option<PathBuf> {
        match self.get(file).await {
            Ok(path) => Some(path),
            Err(err) => {
                debug!(
                    file = %file,
                    model = %self.name(),
                    error = format!("{err:#}"),
                    "Optional file unavailable"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_directory_wins_over_remote_identifier() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("unet")).unwrap();
        std::fs::write(dir.path().join("unet/config.json"), "{}").unwrap();

        let source = ModelSource::resolve(dir.path(), "some/remote-model", None).unwrap();
        assert!(matches!(source, ModelSource::Local(_)));
        assert_eq!(source.name(), dir.path().display().to_string());

        let path = source.get("unet/config.json").await.unwrap();
        assert!(path.ends_with("unet/config.json"));

        let err = source.get("vae/config.json").await.unwrap_err();
        assert!(err.to_string().contains("missing model file"));
        assert!(source.get_optional("vae/config.json").await.is_none());
    }

    #[test]
    fn missing_local_directory_without_identifier_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("model");
        let err = ModelSource::resolve(&missing, "  ", None).unwrap_err();
        assert!(err.to_string().contains("no model identifier"));
    }
}
