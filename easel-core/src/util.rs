use std::io::Cursor;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use image::DynamicImage;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "Running on CPU, to run on GPU(metal), build this crate with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!(
                    "Running on CPU, to run on GPU, build this crate with `--features cuda`"
                );
            }
            Ok(Device::Cpu)
        }
    }
}

/// Seeds the device RNG where the backend supports it. The CPU backend has
/// no seedable RNG and rejects `set_seed`, so there generation proceeds
/// without seed reproducibility.
pub(crate) fn seed_device(device: &Device, seed: u64) -> Result<()> {
    if matches!(device, Device::Cpu) {
        tracing::warn!("CPU device has no seedable RNG, output is not seed-reproducible");
        return Ok(());
    }
    device.set_seed(seed)?;
    Ok(())
}

/// Takes a mutex guard, recovering from poisoning so a panic in one request
/// cannot wedge every later one.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Converts a tensor with shape (3, height, width) into a `DynamicImage`.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Encodes an image into an in-memory PNG container.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn encode_png_writes_png_container() {
        let buffer = ImageBuffer::from_fn(4, 4, |x, y| Rgb([x as u8, y as u8, 0]));
        let bytes = encode_png(&DynamicImage::ImageRgb8(buffer)).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn tensor_to_image_requires_three_channels() {
        let tensor = Tensor::zeros((1, 4, 4), candle_core::DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }

    #[test]
    fn seeding_the_cpu_device_is_best_effort() {
        // The CPU backend rejects set_seed; generation must still proceed.
        seed_device(&Device::Cpu, 0).unwrap();
        seed_device(&Device::Cpu, 42).unwrap();
    }

    #[test]
    fn lock_recovers_from_poisoning() {
        let mutex = Mutex::new(5u32);
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = mutex.lock().unwrap();
            panic!("poisoning the lock");
        }));
        assert!(mutex.is_poisoned());
        assert_eq!(*lock_unpoisoned(&mutex), 5);
    }

    #[test]
    fn tensor_to_image_preserves_dimensions() {
        let tensor = Tensor::zeros((3, 6, 8), candle_core::DType::U8, &Device::Cpu).unwrap();
        let img = tensor_to_image(&tensor).unwrap();
        assert_eq!(img.width(), 8);
        assert_eq!(img.height(), 6);
    }
}
