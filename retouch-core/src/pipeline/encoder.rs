use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, VarBuilder};
use candle_transformers::models::stable_diffusion::unet_2d_blocks::{
    DownEncoderBlock2D, DownEncoderBlock2DConfig, UNetMidBlock2D, UNetMidBlock2DConfig,
};
use serde::Deserialize;

/// Subset of `vae/config.json` describing the encoder half.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    pub block_out_channels: Vec<usize>,
    #[serde(default = "default_layers_per_block")]
    pub layers_per_block: usize,
    #[serde(default = "default_latent_channels")]
    pub latent_channels: usize,
    #[serde(default = "default_norm_num_groups")]
    pub norm_num_groups: usize,
    #[serde(default = "default_true")]
    pub use_quant_conv: bool,
}

fn default_in_channels() -> usize {
    3
}

fn default_layers_per_block() -> usize {
    2
}

fn default_latent_channels() -> usize {
    4
}

fn default_norm_num_groups() -> usize {
    32
}

fn default_true() -> bool {
    true
}

/// Encoder half of the KL autoencoder, returning the posterior mean.
///
/// Conditioning latents use the mode of the posterior rather than a sample, so
/// they are identical for identical inputs on every device.
pub struct PosteriorEncoder {
    conv_in: Conv2d,
    down_blocks: Vec<DownEncoderBlock2D>,
    mid_block: UNetMidBlock2D,
    conv_norm_out: GroupNorm,
    conv_out: Conv2d,
    quant_conv: Option<Conv2d>,
}

impl PosteriorEncoder {
    /// Builds the encoder from the `encoder.*` and `quant_conv.*` weights of a
    /// full autoencoder checkpoint.
    pub fn new(vb: VarBuilder, config: &EncoderConfig) -> Result<Self> {
        let first = *config
            .block_out_channels
            .first()
            .context("autoencoder config has no block_out_channels")?;
        let last = *config
            .block_out_channels
            .last()
            .context("autoencoder config has no block_out_channels")?;
        let padded = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };

        let enc = vb.pp("encoder");
        let conv_in = candle_nn::conv2d(config.in_channels, first, 3, padded, enc.pp("conv_in"))?;

        let vb_down = enc.pp("down_blocks");
        let mut down_blocks = Vec::with_capacity(config.block_out_channels.len());
        let mut in_channels = first;
        for (index, &out_channels) in config.block_out_channels.iter().enumerate() {
            let block_config = DownEncoderBlock2DConfig {
                num_layers: config.layers_per_block,
                resnet_eps: 1e-6,
                resnet_groups: config.norm_num_groups,
                add_downsample: index + 1 < config.block_out_channels.len(),
                downsample_padding: 0,
                ..Default::default()
            };
            down_blocks.push(DownEncoderBlock2D::new(
                vb_down.pp(index.to_string()),
                in_channels,
                out_channels,
                block_config,
            )?);
            in_channels = out_channels;
        }

        let mid_config = UNetMidBlock2DConfig {
            resnet_eps: 1e-6,
            output_scale_factor: 1.,
            attn_num_head_channels: None,
            resnet_groups: Some(config.norm_num_groups),
            ..Default::default()
        };
        let mid_block = UNetMidBlock2D::new(enc.pp("mid_block"), last, None, mid_config)?;
        let conv_norm_out =
            candle_nn::group_norm(config.norm_num_groups, last, 1e-6, enc.pp("conv_norm_out"))?;
        let moments = 2 * config.latent_channels;
        let conv_out = candle_nn::conv2d(last, moments, 3, padded, enc.pp("conv_out"))?;
        let quant_conv = if config.use_quant_conv {
            Some(candle_nn::conv2d(
                moments,
                moments,
                1,
                Default::default(),
                vb.pp("quant_conv"),
            )?)
        } else {
            None
        };

        Ok(Self {
            conv_in,
            down_blocks,
            mid_block,
            conv_norm_out,
            conv_out,
            quant_conv,
        })
    }

    /// Maps the autoencoder file and builds the encoder from it.
    pub fn load(
        weights: &Path,
        config: &EncoderConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], dtype, device)? };
        Self::new(vb, config).context("failed to build autoencoder encoder")
    }

    /// Mean of the latent posterior for `pixels` in `[-1, 1]`, shape
    /// `(batch, latent_channels, h / 2^(blocks-1), w / 2^(blocks-1))`.
    pub fn encode_mean(&self, pixels: &Tensor) -> Result<Tensor> {
        let mut xs = pixels.apply(&self.conv_in)?;
        for block in &self.down_blocks {
            xs = xs.apply(block)?;
        }
        let xs = self.mid_block.forward(&xs, None)?.apply(&self.conv_norm_out)?;
        let mut moments = candle_nn::ops::silu(&xs)?.apply(&self.conv_out)?;
        if let Some(quant_conv) = &self.quant_conv {
            moments = moments.apply(quant_conv)?;
        }
        // First half of the channels is the mean, second half the log-variance.
        Ok(moments.chunk(2, 1)?.swap_remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn tiny_config() -> EncoderConfig {
        serde_json::from_str(
            r#"{"block_out_channels": [32, 32], "layers_per_block": 1,
                "latent_channels": 4, "norm_num_groups": 8}"#,
        )
        .unwrap()
    }

    #[test]
    fn config_defaults_match_diffusers() {
        let config: EncoderConfig =
            serde_json::from_str(r#"{"block_out_channels": [128, 256, 512, 512]}"#).unwrap();
        assert_eq!(config.in_channels, 3);
        assert_eq!(config.layers_per_block, 2);
        assert_eq!(config.latent_channels, 4);
        assert_eq!(config.norm_num_groups, 32);
        assert!(config.use_quant_conv);
    }

    #[test]
    fn posterior_mean_is_repeatable_on_cpu() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = PosteriorEncoder::new(vb, &tiny_config()).unwrap();

        let pixels = Tensor::rand(-1f32, 1f32, (1, 3, 16, 16), &Device::Cpu).unwrap();
        let a = encoder.encode_mean(&pixels).unwrap();
        let b = encoder.encode_mean(&pixels).unwrap();
        assert_eq!(a.dims(), &[1, 4, 8, 8]);

        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn missing_blocks_are_rejected() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config: EncoderConfig = serde_json::from_str(r#"{"block_out_channels": []}"#).unwrap();
        assert!(PosteriorEncoder::new(vb, &config).is_err());
    }
}
