//! Conversion of generator outputs back to image files.

use std::path::{Path, PathBuf};

use candle::{DType, Tensor};
use image::RgbImage;

use crate::error::{Error, Result};

/// Converts a `(C, H, W)` or `(1, C, H, W)` tensor in `[-1, 1]` to an RGB
/// image. Single-channel tensors are tiled to three channels.
pub fn tensor_to_image(tensor: &Tensor) -> Result<RgbImage> {
    let tensor = match tensor.rank() {
        4 => tensor.get(0)?,
        3 => tensor.clone(),
        rank => {
            return Err(Error::Config(format!(
                "expected a (C, H, W) image tensor, got rank {rank}"
            )))
        }
    };
    let (channels, height, width) = tensor.dims3()?;
    let tensor = match channels {
        1 => tensor.repeat((3, 1, 1))?,
        3 => tensor,
        _ => {
            return Err(Error::Config(format!(
                "cannot convert {channels} channels to an RGB image"
            )))
        }
    };
    let pixels = tensor
        .to_dtype(DType::F32)?
        .affine(127.5, 127.5)?
        .clamp(0f32, 255f32)?
        .round()?
        .to_dtype(DType::U8)?
        .permute((1, 2, 0))?
        .flatten_all()?
        .to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::Config("pixel buffer does not match image size".to_string()))
}

pub fn save_image(tensor: &Tensor, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tensor_to_image(tensor)?.save(path)?;
    Ok(())
}

/// Writes each visual as `{stem}_{name}.png` under `dir` and returns the paths.
///
/// Only the first image of a batch is written.
pub fn save_visuals(dir: impl AsRef<Path>, stem: &str, visuals: &[(&str, Tensor)]) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    let mut paths = Vec::with_capacity(visuals.len());
    for (name, tensor) in visuals {
        let path = dir.join(format!("{stem}_{name}.png"));
        save_image(tensor, &path)?;
        paths.push(path);
    }
    Ok(paths)
}
