use std::path::PathBuf;

use anyhow::{ensure, Result};
use clap::Parser;
use retouch_core::{DeviceKind, InferenceDefaults, LoadOptions, OverlayOptions};

pub const DEFAULT_MODEL_ID: &str = "timbrooks/instruct-pix2pix";
pub const DEFAULT_LOCAL_MODEL_PATH: &str = "/app/model";

/// Process settings. Every flag can also be set through the environment
/// variable named next to it, including via a `.env` file.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "OpenAI-compatible image editing server")]
pub struct Settings {
    /// Host address to bind the server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Hugging Face model to load when no local copy is staged
    #[arg(long = "model", env = "MODEL_NAME", default_value = DEFAULT_MODEL_ID)]
    pub model_name: String,

    /// Pre-staged model directory, preferred over the hub when present
    #[arg(long, env = "LOCAL_MODEL_PATH", default_value = DEFAULT_LOCAL_MODEL_PATH)]
    pub local_model_path: PathBuf,

    /// cpu, cuda (or gpu) or metal; defaults to the best available device
    #[arg(long, env = "DEVICE")]
    pub device: Option<DeviceKind>,

    /// Guidance scale used when a request does not set one
    #[arg(long, env = "TRUE_CFG_SCALE", default_value_t = 4.0)]
    pub true_cfg_scale: f64,

    /// Denoising steps used when a request does not set them
    #[arg(long, env = "NUM_INFERENCE_STEPS", default_value_t = 50)]
    pub num_inference_steps: usize,

    /// Negative prompt used when a request does not set one
    #[arg(long, env = "NEGATIVE_PROMPT", default_value = " ")]
    pub negative_prompt: String,

    /// Overlay weights: local file, local directory or hub repository
    #[arg(long, env = "LORA_PATH")]
    pub lora_path: Option<String>,

    /// Overlay file name inside LORA_PATH
    #[arg(long, env = "LORA_WEIGHT_NAME")]
    pub lora_weight_name: Option<String>,

    /// Hugging Face access token
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Largest overlay rank accepted
    #[arg(long, env = "LORA_RANK", default_value_t = 16)]
    pub lora_rank: usize,

    /// Skip the accelerator warmup pass at load
    #[arg(long, env = "SKIP_WARMUP")]
    pub skip_warmup: bool,
}

impl Settings {
    /// Resolved compute device.
    pub fn device(&self) -> DeviceKind {
        self.device.unwrap_or_default()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn inference_defaults(&self) -> InferenceDefaults {
        InferenceDefaults {
            guidance_scale: self.true_cfg_scale,
            steps: self.num_inference_steps,
            negative_prompt: self.negative_prompt.clone(),
        }
    }

    pub fn overlay(&self) -> Option<OverlayOptions> {
        self.lora_path
            .as_ref()
            .filter(|path| !path.trim().is_empty())
            .map(|path| OverlayOptions {
                path: path.clone(),
                weight_name: self.lora_weight_name.clone(),
                max_rank: self.lora_rank,
            })
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            device: self.device(),
            overlay: self.overlay(),
            token: self.hf_token.clone(),
            warmup: !self.skip_warmup,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.port != 0, "PORT cannot be 0");
        ensure!(
            self.num_inference_steps > 0,
            "NUM_INFERENCE_STEPS must be positive"
        );
        ensure!(
            self.true_cfg_scale.is_finite() && self.true_cfg_scale >= 0.0,
            "TRUE_CFG_SCALE must be a non-negative number"
        );
        ensure!(self.lora_rank > 0, "LORA_RANK must be positive");
        Ok(())
    }
}
