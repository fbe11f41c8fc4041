//! Image preprocessing: decoding, detector input and face normalization

use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgb, RgbImage};
use ndarray::Array4;
use tracing::{debug, warn};

use super::detector::LandmarkDetector;

/// Standard input size for face detection (SCRFD)
pub const DETECTOR_INPUT_SIZE: (u32, u32) = (640, 640);

/// Letterbox to the detector input and convert to a BGR NCHW tensor
pub fn preprocess_for_detection(image: &DynamicImage) -> Array4<f32> {
    let (target_w, target_h) = DETECTOR_INPUT_SIZE;
    let resized = resize_with_padding(image, target_w, target_h);
    image_to_nchw(&resized, |r, g, b| {
        // InsightFace models take BGR
        [(b - 127.5) / 128.0, (g - 127.5) / 128.0, (r - 127.5) / 128.0]
    })
}

/// RGB NCHW tensor in [-1, 1] for the inversion encoder
pub fn image_to_encoder_tensor(image: &RgbImage) -> Array4<f32> {
    image_to_nchw(image, |r, g, b| {
        [
            (r / 255.0 - 0.5) / 0.5,
            (g / 255.0 - 0.5) / 0.5,
            (b / 255.0 - 0.5) / 0.5,
        ]
    })
}

/// Resize image with padding to maintain aspect ratio
fn resize_with_padding(image: &DynamicImage, target_w: u32, target_h: u32) -> RgbImage {
    let info = ResizeInfo::new(image.dimensions(), (target_w, target_h));
    let new_w = ((info.original_width as f32 * info.scale) as u32).max(1);
    let new_h = ((info.original_height as f32 * info.scale) as u32).max(1);

    let resized = image.resize_exact(new_w, new_h, FilterType::Lanczos3).to_rgb8();
    let mut padded = ImageBuffer::from_pixel(target_w, target_h, Rgb([0u8, 0, 0]));
    imageops::overlay(&mut padded, &resized, info.offset_x as i64, info.offset_y as i64);
    padded
}

fn image_to_nchw(rgb: &RgbImage, normalize: impl Fn(f32, f32, f32) -> [f32; 3]) -> Array4<f32> {
    let (width, height) = rgb.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let values = normalize(pixel[0] as f32, pixel[1] as f32, pixel[2] as f32);
        for (c, v) in values.into_iter().enumerate() {
            tensor[[0, c, y as usize, x as usize]] = v;
        }
    }

    tensor
}

/// Decode image from bytes with EXIF orientation handling
pub fn decode_image(data: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(data)?;
    Ok(apply_exif_orientation(data, image))
}

/// Apply EXIF orientation to correct image rotation
fn apply_exif_orientation(data: &[u8], image: DynamicImage) -> DynamicImage {
    let orientation = match exif::Reader::new().read_from_container(&mut Cursor::new(data)) {
        Ok(exif_data) => exif_data
            .get_field(exif::Tag::Orientation, exif::In::PRIMARY)
            .and_then(|field| field.value.get_uint(0))
            .unwrap_or(1),
        Err(_) => 1,
    };

    // https://exiftool.org/TagNames/EXIF.html (Orientation)
    match orientation {
        2 => image.fliph(),
        3 => image.rotate180(),
        4 => image.flipv(),
        5 => image.rotate90().fliph(),
        6 => image.rotate90(),
        7 => image.rotate270().fliph(),
        8 => image.rotate270(),
        _ => image,
    }
}

/// Letterbox geometry used to map detections back to the source image
pub struct ResizeInfo {
    pub scale: f32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl ResizeInfo {
    pub fn new(original: (u32, u32), target: (u32, u32)) -> Self {
        let (orig_w, orig_h) = original;
        let (target_w, target_h) = target;

        let scale = f32::min(
            target_w as f32 / orig_w.max(1) as f32,
            target_h as f32 / orig_h.max(1) as f32,
        );

        let new_w = ((orig_w as f32 * scale) as u32).min(target_w);
        let new_h = ((orig_h as f32 * scale) as u32).min(target_h);

        Self {
            scale,
            offset_x: (target_w - new_w) / 2,
            offset_y: (target_h - new_h) / 2,
            original_width: orig_w,
            original_height: orig_h,
        }
    }

    /// Convert detection coordinates back to original image space
    pub fn to_original(&self, x: f32, y: f32) -> (f32, f32) {
        let x = (x - self.offset_x as f32) / self.scale;
        let y = (y - self.offset_y as f32) / self.scale;
        (x, y)
    }
}

/// Crops, squares and resizes an input photo to the encoder resolution.
///
/// With a detector the crop is centered on the box and landmark extent of
/// the most confident face and sized `max(w, h) * margin`. Without one, or when no
/// face is found, the largest centered square is used.
pub struct FaceNormalizer {
    detector: Option<Arc<dyn LandmarkDetector>>,
    resolution: u32,
    margin: f32,
}

impl FaceNormalizer {
    pub fn new(detector: Option<Arc<dyn LandmarkDetector>>, resolution: u32, margin: f32) -> Self {
        Self {
            detector,
            resolution,
            margin,
        }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Encoder input for a normalized crop
    pub fn to_encoder_tensor(&self, image: &RgbImage) -> Array4<f32> {
        image_to_encoder_tensor(image)
    }

    /// Always yields an RGB image of exactly `resolution x resolution`
    pub fn normalize(&self, image: &DynamicImage) -> RgbImage {
        let rgb = image.to_rgb8();
        let cropped = match self.landmark_crop(image, &rgb) {
            Some(crop) => crop,
            None => center_crop(&rgb),
        };

        let square = pad_to_square(cropped);
        imageops::resize(&square, self.resolution, self.resolution, FilterType::Lanczos3)
    }

    fn landmark_crop(&self, image: &DynamicImage, rgb: &RgbImage) -> Option<RgbImage> {
        let detector = self.detector.as_ref()?;
        let faces = match detector.detect(image) {
            Ok(faces) => faces,
            Err(e) => {
                warn!("Face detection failed, falling back to center crop: {:#}", e);
                return None;
            }
        };
        let Some(face) = faces.first() else {
            debug!("No face detected, using center crop");
            return None;
        };

        let (min_x, min_y, max_x, max_y) = face.extent();
        let center_x = (min_x + max_x) / 2.0;
        let center_y = (min_y + max_y) / 2.0;
        let size = ((max_x - min_x).max(max_y - min_y) * self.margin) as i64;
        let half = size / 2;

        let (width, height) = (rgb.width() as i64, rgb.height() as i64);
        let left = (center_x as i64 - half).clamp(0, width);
        let top = (center_y as i64 - half).clamp(0, height);
        let right = (center_x as i64 + half).clamp(0, width);
        let bottom = (center_y as i64 + half).clamp(0, height);

        if right <= left || bottom <= top {
            debug!("Degenerate face crop, using center crop");
            return None;
        }

        debug!(
            "Face crop ({}, {}) - ({}, {}), confidence {:.3}",
            left, top, right, bottom, face.confidence
        );
        Some(
            imageops::crop_imm(
                rgb,
                left as u32,
                top as u32,
                (right - left) as u32,
                (bottom - top) as u32,
            )
            .to_image(),
        )
    }
}

/// Largest centered square
fn center_crop(rgb: &RgbImage) -> RgbImage {
    let (width, height) = rgb.dimensions();
    let side = width.min(height);
    imageops::crop_imm(rgb, (width - side) / 2, (height - side) / 2, side, side).to_image()
}

/// Center `image` on a black square canvas
fn pad_to_square(image: RgbImage) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == height {
        return image;
    }
    let side = width.max(height);
    let mut canvas = ImageBuffer::from_pixel(side, side, Rgb([0u8, 0, 0]));
    imageops::overlay(
        &mut canvas,
        &image,
        ((side - width) / 2) as i64,
        ((side - height) / 2) as i64,
    );
    canvas
}
