//! The single shared editing pipeline and its load/edit lifecycle.

use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Instant;

use anyhow::Context;
use image::DynamicImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    normalize_rgb, DeviceKind, EditRequest, ImageEditor, InferenceDefaults, LoadOptions, Loader,
    ModelSource,
};

#[derive(Debug, Error)]
pub enum EditError {
    /// `edit` was called before a successful `load`.
    #[error("model not loaded")]
    NotReady,

    #[error("prompt must not be empty")]
    EmptyPrompt,

    /// The pipeline itself failed; the source is passed through untouched.
    #[error("inference failed")]
    Inference(#[source] anyhow::Error),
}

/// Owner of the one device-resident pipeline.
///
/// The handle is written at most once. Edits are serialized through a
/// single-slot lock so concurrent requests never drive the device at the same
/// time; waiting callers simply block.
pub struct ModelResource {
    device: DeviceKind,
    defaults: InferenceDefaults,
    handle: OnceLock<Box<dyn ImageEditor>>,
    slot: Mutex<()>,
}

impl ModelResource {
    pub fn new(device: DeviceKind, defaults: InferenceDefaults) -> Self {
        Self {
            device,
            defaults,
            handle: OnceLock::new(),
            slot: Mutex::new(()),
        }
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    pub fn defaults(&self) -> &InferenceDefaults {
        &self.defaults
    }

    pub fn is_loaded(&self) -> bool {
        self.handle.get().is_some()
    }

    /// Builds the pipeline with `L` and installs it. On failure the resource
    /// stays unloaded and the error is returned to the caller.
    pub async fn load<L: Loader>(
        &self,
        source: ModelSource,
        options: LoadOptions,
    ) -> anyhow::Result<()> {
        if self.is_loaded() {
            warn!("Model already loaded, ignoring repeated load");
            return Ok(());
        }

        let name = source.name();
        let start = Instant::now();
        info!(model = %name, device = %options.device, "Loading model");

        let model = L::load(source, options)
            .await
            .with_context(|| format!("failed to load model {name}"))?;
        self.install(Box::new(model))?;

        info!(
            model = %name,
            device = %self.device,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Model loaded successfully"
        );
        Ok(())
    }

    /// Installs an already constructed pipeline.
    pub fn install(&self, editor: Box<dyn ImageEditor>) -> anyhow::Result<()> {
        self.handle
            .set(editor)
            .map_err(|_| anyhow::anyhow!("model resource already initialized"))
    }

    /// Runs one edit against the loaded pipeline. Blocks for the whole
    /// inference.
    pub fn edit(&self, request: EditRequest) -> Result<DynamicImage, EditError> {
        let editor = self.handle.get().ok_or(EditError::NotReady)?;
        if request.prompt.trim().is_empty() {
            return Err(EditError::EmptyPrompt);
        }

        let params = self.defaults.resolve(&request);
        let image = normalize_rgb(request.image);

        let _slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(
            width = image.width(),
            height = image.height(),
            steps = params.steps,
            guidance_scale = params.guidance_scale,
            seed = ?params.seed,
            "Running edit"
        );
        let start = Instant::now();
        let edited = editor
            .edit(&image, &request.prompt, &params)
            .map_err(EditError::Inference)?;
        info!(
            steps = params.steps,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Edit complete"
        );

        Ok(normalize_rgb(edited))
    }
}
