//! Output enhancement
//!
//! Sharpness and contrast follow the classic enhancer model: build a
//! degenerate version of the image and extrapolate away from it,
//! `out = degenerate + factor * (image - degenerate)`. A factor of 1.0 is
//! the identity.

use image::{ImageBuffer, Rgb, RgbImage};

use crate::config::OutputConfig;

/// 3x3 smoothing kernel used as the sharpness degenerate, normalized by 13
const SMOOTH_KERNEL: [[u32; 3]; 3] = [[1, 1, 1], [1, 5, 1], [1, 1, 1]];
const SMOOTH_SCALE: f32 = 13.0;

#[derive(Debug, Clone, Copy)]
pub struct PostProcessor {
    sharpness: f32,
    contrast: f32,
}

impl PostProcessor {
    pub fn new(sharpness: f32, contrast: f32) -> Self {
        Self {
            sharpness,
            contrast,
        }
    }

    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(config.sharpness, config.contrast)
    }

    /// Sharpen, then boost contrast. Deterministic and pure.
    pub fn enhance(&self, image: &RgbImage) -> RgbImage {
        let sharpened = sharpen(image, self.sharpness);
        adjust_contrast(&sharpened, self.contrast)
    }
}

/// Extrapolate away from a smoothed copy. Border pixels are never smoothed,
/// so they pass through unchanged.
pub fn sharpen(image: &RgbImage, factor: f32) -> RgbImage {
    blend(&smooth(image), image, factor)
}

/// Extrapolate away from a flat image at the mean luminance
pub fn adjust_contrast(image: &RgbImage, factor: f32) -> RgbImage {
    let mean = mean_luma(image);
    let degenerate = ImageBuffer::from_pixel(image.width(), image.height(), Rgb([mean; 3]));
    blend(&degenerate, image, factor)
}

fn smooth(image: &RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    if width < 3 || height < 3 {
        return image.clone();
    }

    ImageBuffer::from_fn(width, height, |x, y| {
        if x == 0 || y == 0 || x == width - 1 || y == height - 1 {
            return *image.get_pixel(x, y);
        }
        let mut sums = [0u32; 3];
        for (ky, row) in SMOOTH_KERNEL.iter().enumerate() {
            for (kx, &weight) in row.iter().enumerate() {
                let pixel = image.get_pixel(x + kx as u32 - 1, y + ky as u32 - 1);
                for (sum, &channel) in sums.iter_mut().zip(pixel.0.iter()) {
                    *sum += weight * channel as u32;
                }
            }
        }
        Rgb(sums.map(|s| (s as f32 / SMOOTH_SCALE + 0.5).min(255.0) as u8))
    })
}

/// Fixed-point ITU-R 601-2 luma, rounded
fn luma(pixel: &Rgb<u8>) -> u32 {
    let [r, g, b] = pixel.0;
    (r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16
}

fn mean_luma(image: &RgbImage) -> u8 {
    let count = image.width() as u64 * image.height() as u64;
    if count == 0 {
        return 0;
    }
    let total: u64 = image.pixels().map(|p| luma(p) as u64).sum();
    (total as f64 / count as f64 + 0.5).min(255.0) as u8
}

/// `degenerate + factor * (image - degenerate)`, clipped then truncated
fn blend(degenerate: &RgbImage, image: &RgbImage, factor: f32) -> RgbImage {
    let mut out = image.clone();
    for (dst, (d, s)) in out.iter_mut().zip(degenerate.iter().zip(image.iter())) {
        let value = *d as f32 + factor * (*s as f32 - *d as f32);
        *dst = value.clamp(0.0, 255.0) as u8;
    }
    out
}
