pub mod device;
pub mod loader;
pub mod lora;
pub mod resource;
mod source;
mod util;

mod pipeline;

pub use device::*;
pub use loader::*;
pub use pipeline::{
    InstructEditLoader, InstructEditModel, FALLBACK_TOKENIZER_REPO, MODEL_FILES,
    MODEL_INDEX_FILE, TOKENIZER_FILE,
};
pub use resource::*;
pub use source::*;
pub use util::*;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// A single edit call. Unset numeric knobs fall back to [`InferenceDefaults`].
#[derive(Debug, Clone)]
pub struct EditRequest {
    pub image: DynamicImage,
    pub prompt: String,
    pub seed: Option<u64>,
    pub guidance_scale: Option<f64>,
    pub steps: Option<usize>,
    pub negative_prompt: Option<String>,
}

impl EditRequest {
    pub fn new(image: DynamicImage, prompt: impl Into<String>) -> Self {
        Self {
            image,
            prompt: prompt.into(),
            seed: None,
            guidance_scale: None,
            steps: None,
            negative_prompt: None,
        }
    }
}

/// Process-wide inference settings used when a request leaves a knob unset.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct InferenceDefaults {
    pub guidance_scale: f64,
    pub steps: usize,
    pub negative_prompt: String,
}

impl Default for InferenceDefaults {
    fn default() -> Self {
        Self {
            guidance_scale: 4.0,
            steps: 50,
            negative_prompt: " ".to_string(),
        }
    }
}

/// Effective parameters handed to the pipeline.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct EditParams {
    pub guidance_scale: f64,
    pub steps: usize,
    pub negative_prompt: String,
    pub seed: Option<u64>,
}

impl InferenceDefaults {
    pub fn resolve(&self, request: &EditRequest) -> EditParams {
        EditParams {
            guidance_scale: request.guidance_scale.unwrap_or(self.guidance_scale),
            steps: request.steps.unwrap_or(self.steps),
            negative_prompt: request
                .negative_prompt
                .clone()
                .unwrap_or_else(|| self.negative_prompt.clone()),
            seed: request.seed,
        }
    }
}

/// A loaded, device-resident editing pipeline.
///
/// Implementations may assume `image` is already RGB and must return exactly
/// one image. Calls are serialized by [`ModelResource`], so an implementation
/// never sees two concurrent invocations.
pub trait ImageEditor: Send + Sync {
    fn edit(
        &self,
        image: &DynamicImage,
        prompt: &str,
        params: &EditParams,
    ) -> anyhow::Result<DynamicImage>;
}
