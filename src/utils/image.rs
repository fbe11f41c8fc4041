//! Image utility functions

use std::io::Cursor;
use std::path::Path;

use image::{ImageBuffer, ImageFormat, Rgb, RgbImage};
use ndarray::Array4;

use crate::error::StageError;

/// Convert a `[1, 3, H, W]` tensor in [0, 1] to an 8-bit RGB image.
/// Values are scaled by 255 and truncated, not rounded.
pub fn tensor_to_rgb(tensor: &Array4<f32>) -> Result<RgbImage, StageError> {
    let (batch, channels, height, width) = tensor.dim();
    if batch != 1 || channels != 3 {
        return Err(StageError::Synthesis(anyhow::anyhow!(
            "expected a [1, 3, H, W] image tensor, got {:?}",
            tensor.shape()
        )));
    }

    Ok(ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([0, 1, 2].map(|c| (tensor[[0, c, y, x]].clamp(0.0, 1.0) * 255.0) as u8))
    }))
}

/// Output format inferred from the destination extension, PNG when unknown
pub fn format_for_path(path: &Path) -> ImageFormat {
    ImageFormat::from_path(path).unwrap_or(ImageFormat::Png)
}

/// Encode an image in the given format (PNG or JPEG by destination)
pub fn encode(image: &RgbImage, format: ImageFormat) -> Result<Vec<u8>, StageError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, format)?;
    Ok(buffer.into_inner())
}
