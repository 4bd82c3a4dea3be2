use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::DeviceKind;

/// Creates the candle device for `kind`. Requesting an accelerator that this
/// build cannot drive is an error rather than a silent CPU fallback.
pub fn select_device(kind: DeviceKind) -> Result<Device> {
    match kind {
        DeviceKind::Cpu => Ok(Device::Cpu),
        DeviceKind::Cuda => Device::new_cuda(0).context(
            "failed to open CUDA device 0, build with `--features cuda` or set DEVICE=cpu",
        ),
        DeviceKind::Metal => Device::new_metal(0).context(
            "failed to open Metal device 0, build with `--features metal` or set DEVICE=cpu",
        ),
    }
}

/// Collapses grayscale, alpha and 16-bit layouts into plain 8-bit RGB.
pub fn normalize_rgb(image: DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageRgb8(_) => image,
        other => DynamicImage::ImageRgb8(other.to_rgb8()),
    }
}

/// Rounds both sides to the nearest multiple of `multiple`, never below it.
pub fn snap_dimensions(width: u32, height: u32, multiple: u32) -> (u32, u32) {
    let snap = |v: u32| (((v + multiple / 2) / multiple) * multiple).max(multiple);
    (snap(width), snap(height))
}

/// Converts an RGB image into a `(1, 3, height, width)` tensor scaled to `[-1, 1]`.
pub fn image_to_tensor(image: &RgbImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let (width, height) = image.dimensions();
    let pixels = image.as_raw().clone();
    let tensor = Tensor::from_vec(pixels, (height as usize, width as usize, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(1.0 / 127.5, -1.0)?
        .unsqueeze(0)?;
    Ok(tensor.to_device(device)?.to_dtype(dtype)?)
}

/// Resizes `image` to `width` x `height` unless it already has that size.
pub fn resize_rgb(image: RgbImage, width: u32, height: u32) -> RgbImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        image::imageops::resize(&image, width, height, FilterType::CatmullRom)
    }
}

/// Converts a tensor with shape (3, height, width) into an image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.to_dtype(DType::U8)?.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Standard normal noise of `shape`. With a seed the values are drawn from a
/// host RNG so the same seed yields the same tensor on every device.
pub fn gaussian_noise(shape: &[usize], seed: Option<u64>, device: &Device) -> Result<Tensor> {
    let Some(seed) = seed else {
        return Ok(Tensor::randn(0f32, 1f32, shape, device)?);
    };
    let mut rng = StdRng::seed_from_u64(seed);
    let len: usize = shape.iter().product();
    let values: Vec<f32> = (0..len).map(|_| rng.sample(StandardNormal)).collect();
    Ok(Tensor::from_vec(values, shape, &Device::Cpu)?.to_device(device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, LumaA, Rgba, RgbaImage};

    #[test]
    fn normalizes_alpha_and_gray_to_rgb() {
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 3, Rgba([10, 20, 30, 40])));
        let rgb = normalize_rgb(rgba);
        assert!(matches!(rgb, DynamicImage::ImageRgb8(_)));
        assert_eq!(rgb.to_rgb8().get_pixel(0, 0).0, [10, 20, 30]);

        let gray = DynamicImage::ImageLumaA8(GrayAlphaImage::from_pixel(2, 2, LumaA([200, 255])));
        let rgb = normalize_rgb(gray);
        assert!(matches!(rgb, DynamicImage::ImageRgb8(_)));
        assert_eq!(rgb.to_rgb8().get_pixel(1, 1).0, [200, 200, 200]);
    }

    #[test]
    fn snaps_to_multiples() {
        assert_eq!(snap_dimensions(512, 512, 64), (512, 512));
        assert_eq!(snap_dimensions(500, 700, 64), (512, 704));
        assert_eq!(snap_dimensions(10, 10, 64), (64, 64));
    }

    #[test]
    fn image_tensor_round_trip_keeps_pixels() {
        let mut img = RgbImage::new(3, 2);
        img.put_pixel(2, 1, image::Rgb([255, 0, 128]));
        let tensor = image_to_tensor(&img, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 2, 3]);

        let restored = ((tensor.squeeze(0).unwrap() + 1.0).unwrap() * 127.5)
            .unwrap()
            .round()
            .unwrap();
        let out = tensor_to_image(&restored).unwrap().to_rgb8();
        assert_eq!(out.dimensions(), (3, 2));
        assert_eq!(out.get_pixel(2, 1).0, [255, 0, 128]);
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0]);
    }

    #[test]
    fn rejects_non_rgb_tensors() {
        let t = Tensor::zeros((4, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&t).is_err());
    }

    #[test]
    fn seeded_noise_is_reproducible() {
        let a = gaussian_noise(&[1, 4, 8, 8], Some(42), &Device::Cpu).unwrap();
        let b = gaussian_noise(&[1, 4, 8, 8], Some(42), &Device::Cpu).unwrap();
        let c = gaussian_noise(&[1, 4, 8, 8], Some(43), &Device::Cpu).unwrap();
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let c = c.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a.len(), 256);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mean = a.iter().sum::<f32>() / a.len() as f32;
        assert!(mean.abs() < 0.3, "mean {mean} too far from zero");
    }
}
