//! Low-rank overlay weights merged into the denoiser before it is built.
//!
//! Two key layouts are understood:
//! - PEFT: `<module>.lora_A.weight`, `<module>.lora_B.weight`
//! - diffusers: `<module>.lora.down.weight`, `<module>.lora.up.weight`, including
//!   the older attention-processor form `<attn>.processor.to_q_lora.down.weight`
//!
//! Either may carry a `<module>.alpha` scalar and a leading `unet.` prefix. The
//! merged delta for a module is `up · down × alpha / rank`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info, warn};

use crate::{hub_api, OverlayOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    Down,
    Up,
    Alpha,
}

#[derive(Debug, Default)]
struct OverlayModule {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

/// Finds the overlay file: a local file, a file inside a local directory, or
/// a file in a hub repository.
pub async fn resolve_overlay(options: &OverlayOptions, token: Option<&str>) -> Result<PathBuf> {
    let path = Path::new(&options.path);
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        let file = path.join(options.weight_name());
        if !file.is_file() {
            bail!("overlay file {} not found", file.display());
        }
        return Ok(file);
    }
    hub_api(token)?
        .model(options.path.clone())
        .get(options.weight_name())
        .await
        .with_context(|| {
            format!(
                "failed to fetch overlay {} from {}",
                options.weight_name(),
                options.path
            )
        })
}

/// Reads an overlay file onto the CPU.
pub fn load_overlay(path: &Path) -> Result<HashMap<String, Tensor>> {
    candle_core::safetensors::load(path, &Device::Cpu)
        .with_context(|| format!("failed to read overlay {}", path.display()))
}

/// Maps an overlay tensor name to the base module it targets.
fn split_key(key: &str) -> Option<(String, Part)> {
    let key = key.strip_prefix("unet.").unwrap_or(key);
    let (module, part) = if let Some(m) = key.strip_suffix(".lora_A.weight") {
        (m, Part::Down)
    } else if let Some(m) = key.strip_suffix(".lora_B.weight") {
        (m, Part::Up)
    } else if let Some(m) = key.strip_suffix(".lora.down.weight") {
        (m, Part::Down)
    } else if let Some(m) = key.strip_suffix(".lora.up.weight") {
        (m, Part::Up)
    } else if let Some(m) = key.strip_suffix("_lora.down.weight") {
        (m, Part::Down)
    } else if let Some(m) = key.strip_suffix("_lora.up.weight") {
        (m, Part::Up)
    } else if let Some(m) = key.strip_suffix(".alpha") {
        (m, Part::Alpha)
    } else {
        return None;
    };

    let module = module.replace(".processor.", ".");
    let module = match module.strip_suffix(".to_out") {
        Some(attn) => format!("{attn}.to_out.0"),
        None => module,
    };
    Some((module, part))
}

fn group_modules(overlay: HashMap<String, Tensor>) -> Result<BTreeMap<String, OverlayModule>> {
    let mut modules: BTreeMap<String, OverlayModule> = BTreeMap::new();
    for (key, tensor) in overlay {
        if key.starts_with("text_encoder") {
            warn!(key = %key, "Skipping text encoder overlay weight");
            continue;
        }
        let Some((module, part)) = split_key(&key) else {
            debug!(key = %key, "Ignoring unrecognized overlay tensor");
            continue;
        };
        let entry = modules.entry(module).or_default();
        match part {
            Part::Down => entry.down = Some(tensor),
            Part::Up => entry.up = Some(tensor),
            Part::Alpha => {
                let alpha = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
                entry.alpha = alpha.first().copied();
            }
        }
    }
    Ok(modules)
}

/// Computes `up · down × scale` reshaped to `target`'s shape.
fn module_delta(
    name: &str,
    down: &Tensor,
    up: &Tensor,
    alpha: Option<f64>,
    max_rank: usize,
    target: &Tensor,
) -> Result<Tensor> {
    let rank = down.dim(0)?;
    if rank == 0 || rank > max_rank {
        bail!("overlay module {name} has rank {rank}, configured maximum is {max_rank}");
    }
    let down = down.to_dtype(DType::F32)?.flatten_from(1)?;
    let up = up.to_dtype(DType::F32)?.flatten_from(1)?;
    if up.dim(1)? != rank {
        bail!(
            "overlay module {name}: up projection {:?} does not match rank {rank}",
            up.dims()
        );
    }
    let scale = alpha.map_or(1.0, |alpha| alpha / rank as f64);
    let delta = (up.matmul(&down)? * scale)?;
    if delta.elem_count() != target.elem_count() {
        bail!(
            "overlay module {name}: delta {:?} does not fit weight {:?}",
            delta.dims(),
            target.dims()
        );
    }
    Ok(delta.reshape(target.dims())?)
}

/// Adds every overlay module into `base` in place and returns how many
/// weights were touched.
pub fn merge_overlay(
    base: &mut HashMap<String, Tensor>,
    overlay: HashMap<String, Tensor>,
    max_rank: usize,
) -> Result<usize> {
    let modules = group_modules(overlay)?;
    let mut merged = 0;
    for (module, parts) in modules {
        let (down, up) = match (&parts.down, &parts.up) {
            (Some(down), Some(up)) => (down, up),
            (None, None) => continue,
            _ => bail!("overlay module {module} is missing its up or down projection"),
        };
        let target_key = format!("{module}.weight");
        let target = base
            .get(&target_key)
            .with_context(|| format!("overlay targets unknown weight {target_key}"))?;
        let delta = module_delta(&module, down, up, parts.alpha, max_rank, target)?;
        let delta = delta.to_device(target.device())?;
        let updated = (target.to_dtype(DType::F32)? + delta)?.to_dtype(target.dtype())?;
        base.insert(target_key, updated);
        merged += 1;
    }
    info!(modules = merged, "Merged overlay weights");
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(data.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    fn values(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn maps_key_layouts_to_modules() {
        assert_eq!(
            split_key("unet.mid_block.attentions.0.proj_in.lora_A.weight"),
            Some(("mid_block.attentions.0.proj_in".to_string(), Part::Down))
        );
        assert_eq!(
            split_key("down_blocks.0.attn1.to_k.lora.up.weight"),
            Some(("down_blocks.0.attn1.to_k".to_string(), Part::Up))
        );
        assert_eq!(
            split_key("unet.up_blocks.1.attn2.processor.to_out_lora.down.weight"),
            Some(("up_blocks.1.attn2.to_out.0".to_string(), Part::Down))
        );
        assert_eq!(
            split_key("unet.up_blocks.1.attn2.processor.to_q_lora.up.weight"),
            Some(("up_blocks.1.attn2.to_q".to_string(), Part::Up))
        );
        assert_eq!(
            split_key("conv_in.alpha"),
            Some(("conv_in".to_string(), Part::Alpha))
        );
        assert_eq!(split_key("conv_in.weight"), None);
    }

    #[test]
    fn merges_linear_delta_with_alpha_scaling() {
        let mut base = HashMap::new();
        base.insert("proj.weight".to_string(), zeros(&[2, 3]));
        base.insert("other.weight".to_string(), t(&[5.0], &[1, 1]));

        let mut overlay = HashMap::new();
        // rank 1: down (1, 3), up (2, 1)
        overlay.insert(
            "unet.proj.lora_A.weight".to_string(),
            t(&[1.0, 2.0, 3.0], &[1, 3]),
        );
        overlay.insert(
            "unet.proj.lora_B.weight".to_string(),
            t(&[1.0, -1.0], &[2, 1]),
        );
        overlay.insert("unet.proj.alpha".to_string(), t(&[0.5], &[]));

        let merged = merge_overlay(&mut base, overlay, 16).unwrap();
        assert_eq!(merged, 1);
        assert_eq!(values(&base["proj.weight"]), vec![0.5, 1.0, 1.5, -0.5, -1.0, -1.5]);
        assert_eq!(values(&base["other.weight"]), vec![5.0]);
    }

    #[test]
    fn merges_conv_delta_in_base_shape() {
        let mut base = HashMap::new();
        base.insert(
            "conv.weight".to_string(),
            Tensor::ones((2, 1, 2, 2), DType::F32, &Device::Cpu).unwrap(),
        );
        let mut overlay = HashMap::new();
        overlay.insert(
            "conv.lora.down.weight".to_string(),
            t(&[1.0, 0.0, 0.0, 1.0], &[1, 1, 2, 2]),
        );
        overlay.insert("conv.lora.up.weight".to_string(), t(&[2.0, 3.0], &[2, 1, 1, 1]));

        merge_overlay(&mut base, overlay, 4).unwrap();
        let merged = &base["conv.weight"];
        assert_eq!(merged.dims(), &[2, 1, 2, 2]);
        assert_eq!(values(merged), vec![3.0, 1.0, 1.0, 3.0, 4.0, 1.0, 1.0, 4.0]);
    }

    #[test]
    fn rejects_rank_above_limit() {
        let mut base = HashMap::new();
        base.insert("proj.weight".to_string(), zeros(&[2, 2]));
        let mut overlay = HashMap::new();
        overlay.insert("proj.lora_A.weight".to_string(), zeros(&[2, 2]));
        overlay.insert("proj.lora_B.weight".to_string(), zeros(&[2, 2]));

        let err = merge_overlay(&mut base, overlay, 1).unwrap_err();
        assert!(err.to_string().contains("rank 2"));
    }

    #[test]
    fn rejects_half_pairs_and_unknown_targets() {
        let mut base = HashMap::new();
        base.insert("proj.weight".to_string(), zeros(&[2, 2]));

        let mut overlay = HashMap::new();
        overlay.insert("proj.lora_A.weight".to_string(), zeros(&[1, 2]));
        assert!(merge_overlay(&mut base, overlay, 4)
            .unwrap_err()
            .to_string()
            .contains("missing its up or down"));

        let mut overlay = HashMap::new();
        overlay.insert("ghost.lora_A.weight".to_string(), zeros(&[1, 2]));
        overlay.insert("ghost.lora_B.weight".to_string(), zeros(&[2, 1]));
        assert!(merge_overlay(&mut base, overlay, 4)
            .unwrap_err()
            .to_string()
            .contains("unknown weight ghost.weight"));
    }

    #[tokio::test]
    async fn resolves_local_file_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("style.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert("proj.lora_A.weight".to_string(), t(&[1.0, 1.0], &[1, 2]));
        candle_core::safetensors::save(&tensors, &file).unwrap();

        let by_file = OverlayOptions {
            path: file.display().to_string(),
            weight_name: None,
            max_rank: 16,
        };
        assert_eq!(resolve_overlay(&by_file, None).await.unwrap(), file);

        let by_dir = OverlayOptions {
            path: dir.path().display().to_string(),
            weight_name: Some("style.safetensors".to_string()),
            max_rank: 16,
        };
        let resolved = resolve_overlay(&by_dir, None).await.unwrap();
        assert_eq!(resolved, file);
        assert_eq!(load_overlay(&resolved).unwrap().len(), 1);

        let missing = OverlayOptions {
            weight_name: None,
            ..by_dir
        };
        assert!(resolve_overlay(&missing, None)
            .await
            .unwrap_err()
            .to_string()
            .contains("pytorch_lora_weights.safetensors"));
    }
}
