use std::future::Future;

use anyhow::Result;

use crate::{DeviceKind, ImageEditor, ModelSource};

/// Default file name looked up inside an overlay repository or directory.
pub const DEFAULT_OVERLAY_WEIGHT_NAME: &str = "pytorch_lora_weights.safetensors";

/// Optional low-rank weight delta merged into the denoiser at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayOptions {
    /// Local file, local directory, or hub repository id.
    pub path: String,
    pub weight_name: Option<String>,
    /// Largest rank accepted from the overlay file.
    pub max_rank: usize,
}

impl OverlayOptions {
    pub fn weight_name(&self) -> &str {
        self.weight_name
            .as_deref()
            .unwrap_or(DEFAULT_OVERLAY_WEIGHT_NAME)
    }
}

#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub device: DeviceKind,
    pub overlay: Option<OverlayOptions>,
    /// Hub access token, used for the overlay and the base model.
    pub token: Option<String>,
    /// Run a one-step pass on accelerators so kernel setup happens at load.
    pub warmup: bool,
}

impl LoadOptions {
    pub fn new(device: DeviceKind) -> Self {
        Self {
            device,
            overlay: None,
            token: None,
            warmup: true,
        }
    }
}

pub trait Loader {
    type Model: ImageEditor + 'static;

    fn load(
        source: ModelSource,
        options: LoadOptions,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}
