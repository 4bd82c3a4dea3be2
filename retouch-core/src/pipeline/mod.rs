use std::path::PathBuf;
use std::time::Instant;

use anyhow::{ensure, Context, Error, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    ddim::DDIMSchedulerConfig,
    schedulers::{PredictionType, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::{DynamicImage, RgbImage};
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

mod encoder;
mod sampling;

use crate::{
    gaussian_noise, hub_api, image_to_tensor, lora, resize_rgb, select_device, snap_dimensions,
    tensor_to_image, DeviceKind, EditParams, ImageEditor, LoadOptions, Loader, ModelSource,
};
use encoder::{EncoderConfig, PosteriorEncoder};
use sampling::{LATENT_FACTOR, PIXEL_MULTIPLE, VAE_SCALE};

/// The edit denoiser takes the noisy latents and the source image latents
/// concatenated along the channel axis.
const EDIT_IN_CHANNELS: usize = 8;
const LATENT_CHANNELS: usize = 4;
const SUPPORTED_PIPELINE: &str = "StableDiffusionInstructPix2PixPipeline";

/// Tokenizer used when the model repository ships only the slow vocab files.
pub const FALLBACK_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
pub const MODEL_INDEX_FILE: &str = "model_index.json";
pub const TOKENIZER_FILE: &str = "tokenizer/tokenizer.json";
const UNET_CONFIG_FILE: &str = "unet/config.json";
const VAE_CONFIG_FILE: &str = "vae/config.json";

const TEXT_ENCODER_FILES: &[&str] = &[
    "text_encoder/model.safetensors",
    "text_encoder/model.fp16.safetensors",
];
const UNET_FILES: &[&str] = &[
    "unet/diffusion_pytorch_model.safetensors",
    "unet/diffusion_pytorch_model.fp16.safetensors",
];
const VAE_FILES: &[&str] = &[
    "vae/diffusion_pytorch_model.safetensors",
    "vae/diffusion_pytorch_model.fp16.safetensors",
];

/// Files read from the diffusers layout, each entry listing alternatives in
/// order of preference. The tokenizer and model index are handled separately.
pub const MODEL_FILES: &[&[&str]] = &[
    &[UNET_CONFIG_FILE],
    &[VAE_CONFIG_FILE],
    TEXT_ENCODER_FILES,
    UNET_FILES,
    VAE_FILES,
];

/// Subset of `model_index.json`.
#[derive(Debug, Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    class_name: Option<String>,
}

/// Subset of `unet/config.json` used to pick the architecture.
#[derive(Debug, Deserialize)]
struct UnetConfigFile {
    in_channels: usize,
    #[serde(default)]
    cross_attention_dim: Option<usize>,
}

/// Instruction-guided latent diffusion editor: CLIP text encoder, an
/// 8-channel UNet conditioned on the source image latents, a KL autoencoder
/// and a DDIM schedule.
pub struct InstructEditModel {
    device: Device,
    device_kind: DeviceKind,
    dtype: DType,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    encoder: PosteriorEncoder,
    scheduler: DDIMSchedulerConfig,
}

impl InstructEditModel {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_tokens {
            warn!(
                tokens = tokens.len(),
                max = self.max_tokens,
                "Prompt truncated to the text encoder context"
            );
            tokens.truncate(self.max_tokens);
        }
        tokens.resize(self.max_tokens, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?.to_dtype(self.dtype)?)
    }

    fn run(&self, image: &RgbImage, prompt: &str, params: &EditParams) -> Result<DynamicImage> {
        ensure!(params.steps > 0, "number of inference steps must be positive");
        let (orig_width, orig_height) = image.dimensions();
        let (width, height) = snap_dimensions(orig_width, orig_height, PIXEL_MULTIPLE);

        // The CPU backend has no seedable RNG; the only random draw is the
        // initial noise, which is seeded on the host.
        if let Some(seed) = params.seed {
            if self.device_kind.is_accelerator() {
                self.device.set_seed(seed)?;
            }
        }

        // --- Text conditioning, with the negative prompt as the unconditional branch ---
        let use_guidance = params.guidance_scale > 1.0;
        let cond = self.encode_prompt(prompt)?;
        let text_embeddings = if use_guidance {
            let uncond = self.encode_prompt(&params.negative_prompt)?;
            Tensor::cat(&[cond, uncond], 0)?
        } else {
            cond
        };
        let batch = if use_guidance { 2 } else { 1 };

        // --- Source image latents ---
        let resized = resize_rgb(image.clone(), width, height);
        let pixels = image_to_tensor(&resized, &self.device, self.dtype)?;
        let image_latents = self.encoder.encode_mean(&pixels)?;
        let image_latents = sampling::repeat_batch(&image_latents, batch)?;

        // --- Denoising ---
        let mut scheduler = self.scheduler.build(params.steps)?;
        let latent_shape = [
            1,
            LATENT_CHANNELS,
            height as usize / LATENT_FACTOR,
            width as usize / LATENT_FACTOR,
        ];
        let noise = gaussian_noise(&latent_shape, params.seed, &self.device)?.to_dtype(self.dtype)?;
        let mut latents = (noise * scheduler.init_noise_sigma())?;

        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let step_start = Instant::now();
            let input = sampling::repeat_batch(&latents, batch)?;
            let input = scheduler.scale_model_input(input, timestep)?;
            let input = Tensor::cat(&[&input, &image_latents], 1)?;

            let noise_pred = self.unet.forward(&input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                sampling::apply_guidance(&noise_pred, params.guidance_scale)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(
                step = index + 1,
                total = timesteps.len(),
                elapsed_ms = step_start.elapsed().as_millis() as u64,
                "Denoising step"
            );
        }

        // --- Decode and restore the caller's dimensions ---
        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let pixels = sampling::to_pixels(&decoded)?;
        let edited = tensor_to_image(&pixels)?.to_rgb8();
        Ok(DynamicImage::ImageRgb8(resize_rgb(
            edited,
            orig_width,
            orig_height,
        )))
    }

    /// One-step pass on a tiny image so kernel compilation and allocator
    /// growth happen before the first request.
    fn warmup(&self) -> Result<()> {
        let start = Instant::now();
        info!("Warming up pipeline");
        let image = RgbImage::new(PIXEL_MULTIPLE, PIXEL_MULTIPLE);
        let params = EditParams {
            guidance_scale: 1.0,
            steps: 1,
            negative_prompt: String::new(),
            seed: Some(0),
        };
        self.run(&image, "warmup", &params)
            .context("warmup pass failed")?;
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Warmup complete"
        );
        Ok(())
    }
}

impl ImageEditor for InstructEditModel {
    fn edit(
        &self,
        image: &DynamicImage,
        prompt: &str,
        params: &EditParams,
    ) -> anyhow::Result<DynamicImage> {
        let rgb = match image {
            DynamicImage::ImageRgb8(rgb) => rgb.clone(),
            other => other.to_rgb8(),
        };
        self.run(&rgb, prompt, params)
    }
}

async fn first_available(source: &ModelSource, candidates: &[&str]) -> Result<PathBuf> {
    let mut last_error = None;
    for file in candidates {
        match source.get(file).await {
            Ok(path) => return Ok(path),
            Err(err) => {
                debug!(file = %file, error = %err, "Candidate unavailable");
                last_error = Some(err);
            }
        }
    }
    let message = format!("none of {} found in {}", candidates.join(", "), source.name());
    Err(match last_error {
        Some(err) => err.context(message),
        None => Error::msg(message),
    })
}

async fn read_json<T: for<'de> Deserialize<'de>>(source: &ModelSource, file: &str) -> Result<T> {
    let path = source.get(file).await?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {file}"))
}

pub struct InstructEditLoader;

impl Loader for InstructEditLoader {
    type Model = InstructEditModel;

    async fn load(source: ModelSource, options: LoadOptions) -> Result<Self::Model> {
        // Configure device, reduced precision on accelerators.
        let device = select_device(options.device).context("failed to set up device")?;
        let dtype = device.bf16_default_to_f32();
        info!(device = %options.device, dtype = ?dtype, "Selected device");

        // --- Architecture ---
        match read_json::<ModelIndex>(&source, MODEL_INDEX_FILE).await {
            Ok(ModelIndex {
                class_name: Some(class),
            }) if class != SUPPORTED_PIPELINE => {
                warn!(
                    pipeline = %class,
                    expected = SUPPORTED_PIPELINE,
                    "Unexpected pipeline class"
                );
            }
            Ok(_) => {}
            Err(err) => debug!(error = %err, "No readable model_index.json"),
        }
        let unet_config: UnetConfigFile = read_json(&source, UNET_CONFIG_FILE)
            .await
            .context("failed to read denoiser config")?;
        ensure!(
            unet_config.in_channels == EDIT_IN_CHANNELS,
            "denoiser takes {} input channels, an instruction-edit checkpoint needs {}",
            unet_config.in_channels,
            EDIT_IN_CHANNELS
        );
        let (sd_config, prediction_type) = match unet_config.cross_attention_dim {
            Some(1024) => (
                StableDiffusionConfig::v2_1(None, None, None),
                PredictionType::VPrediction,
            ),
            _ => (
                StableDiffusionConfig::v1_5(None, None, None),
                PredictionType::Epsilon,
            ),
        };

        // --- Tokenizer and text encoder ---
        let tokenizer_file = match source.get_optional(TOKENIZER_FILE).await {
            Some(path) => path,
            None => hub_api(options.token.as_deref())?
                .model(FALLBACK_TOKENIZER_REPO.to_string())
                .get("tokenizer.json")
                .await
                .context("failed to get CLIP tokenizer")?,
        };
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no pad token {pad_token:?}"))?;

        let text_file = first_available(&source, TEXT_ENCODER_FILES).await?;
        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, text_file, &device, dtype)
                .context("failed to load text encoder")?;

        // --- Denoiser, with the optional overlay merged in ---
        let unet_file = first_available(&source, UNET_FILES).await?;
        let use_flash_attn = cfg!(feature = "flash-attn");
        let unet = match &options.overlay {
            Some(overlay) => {
                info!(
                    path = %overlay.path,
                    weight = %overlay.weight_name(),
                    "Loading overlay weights"
                );
                let overlay_file = lora::resolve_overlay(overlay, options.token.as_deref()).await?;
                let mut weights = candle_core::safetensors::load(&unet_file, &Device::Cpu)
                    .context("failed to read denoiser weights")?;
                let merged = lora::merge_overlay(
                    &mut weights,
                    lora::load_overlay(&overlay_file)?,
                    overlay.max_rank,
                )
                .context("failed to merge overlay weights")?;
                info!(modules = merged, "Overlay loaded successfully");

                // Merged weights are staged as a file the denoiser builder can map.
                let staging = tempfile::tempdir().context("failed to create staging dir")?;
                let merged_file = staging.path().join("unet.safetensors");
                candle_core::safetensors::save(&weights, &merged_file)
                    .context("failed to stage merged denoiser weights")?;
                drop(weights);
                sd_config.build_unet(
                    &merged_file,
                    &device,
                    EDIT_IN_CHANNELS,
                    use_flash_attn,
                    dtype,
                )
            }
            None => sd_config.build_unet(
                &unet_file,
                &device,
                EDIT_IN_CHANNELS,
                use_flash_attn,
                dtype,
            ),
        }
        .context("failed to load denoiser")?;

        // --- Autoencoder ---
        let vae_file = first_available(&source, VAE_FILES).await?;
        let vae_config: EncoderConfig = read_json(&source, VAE_CONFIG_FILE)
            .await
            .context("failed to read autoencoder config")?;
        let encoder = PosteriorEncoder::load(&vae_file, &vae_config, &device, dtype)?;
        let vae = sd_config
            .build_vae(&vae_file, &device, dtype)
            .context("failed to load autoencoder")?;

        let model = InstructEditModel {
            device,
            device_kind: options.device,
            dtype,
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            text_model,
            unet,
            vae,
            encoder,
            scheduler: DDIMSchedulerConfig {
                prediction_type,
                ..Default::default()
            },
        };

        if options.device.is_accelerator() && options.warmup {
            model.warmup()?;
        }

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_available_prefers_earlier_candidates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("vae")).unwrap();
        for file in VAE_FILES {
            std::fs::write(dir.path().join(file), b"").unwrap();
        }
        let source = ModelSource::Local(dir.path().to_path_buf());
        let path = first_available(&source, VAE_FILES).await.unwrap();
        assert!(path.ends_with(VAE_FILES[0]));

        std::fs::remove_file(dir.path().join(VAE_FILES[0])).unwrap();
        let path = first_available(&source, VAE_FILES).await.unwrap();
        assert!(path.ends_with(VAE_FILES[1]));
    }

    #[tokio::test]
    async fn first_available_keeps_the_underlying_cause() {
        let dir = tempfile::tempdir().unwrap();
        let source = ModelSource::Local(dir.path().to_path_buf());
        let err = first_available(&source, UNET_FILES).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("none of unet/diffusion_pytorch_model.safetensors"));
        assert!(message.contains("missing model file"), "{message}");
    }

    #[test]
    fn vae_config_is_staged_by_the_fetcher() {
        assert!(MODEL_FILES.iter().any(|group| group.contains(&VAE_CONFIG_FILE)));
    }
}
