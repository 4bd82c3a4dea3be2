use anyhow::Result;
use candle_core::{DType, IndexOp, Tensor};

/// Latent scaling factor of the SD 1.x / 2.x autoencoder.
pub const VAE_SCALE: f64 = 0.18215;

/// Spatial downsampling between pixels and latents.
pub const LATENT_FACTOR: usize = 8;

/// The denoiser downsamples latents three times, so pixel sides must be
/// multiples of 64.
pub const PIXEL_MULTIPLE: u32 = 64;

/// Classifier-free guidance over a `[cond, uncond]` batch.
pub fn apply_guidance(noise_pred: &Tensor, scale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (cond, uncond) = (&chunks[0], &chunks[1]);
    Ok((uncond + ((cond - uncond)? * scale)?)?)
}

/// Stacks `t` `batch` times along the first dimension.
pub fn repeat_batch(t: &Tensor, batch: usize) -> Result<Tensor> {
    if batch == 1 {
        return Ok(t.clone());
    }
    let copies = vec![t; batch];
    Ok(Tensor::cat(&copies, 0)?)
}

/// Maps decoded autoencoder output in `[-1, 1]` to a `(3, h, w)` tensor of
/// rounded pixel values for the first image in the batch.
pub fn to_pixels(decoded: &Tensor) -> Result<Tensor> {
    let img = decoded.to_dtype(DType::F32)?;
    let img = ((img / 2.)? + 0.5)?.clamp(0f32, 1f32)?;
    Ok((img * 255.)?.round()?.i(0)?)
}
