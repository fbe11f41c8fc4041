//! SCRFD Face Detector
//!
//! Locates faces and their 5-point landmarks for crop normalization.

use std::sync::Arc;

use anyhow::Result;
use image::{DynamicImage, GenericImageView};
use openvino::InferRequest;
use tracing::{debug, warn};

use super::pool::{f32_tensor, read_f32, ModelPool, ModelType};
use super::preprocess::{preprocess_for_detection, ResizeInfo, DETECTOR_INPUT_SIZE};

/// Face detection result in original image coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub landmarks: [(f32, f32); 5],
}

impl FaceBox {
    /// The detector leaves landmarks zeroed for models without a kps head
    pub fn has_landmarks(&self) -> bool {
        self.landmarks.iter().any(|&(x, y)| x != 0.0 || y != 0.0)
    }

    /// Axis-aligned extent `(min_x, min_y, max_x, max_y)` of the box joined
    /// with its landmarks. Five keypoints span only the inner face, so the
    /// box keeps chin and forehead inside the extent.
    pub fn extent(&self) -> (f32, f32, f32, f32) {
        let bounds = (self.x1, self.y1, self.x2, self.y2);
        if !self.has_landmarks() {
            return bounds;
        }
        self.landmarks
            .iter()
            .fold(bounds, |(min_x, min_y, max_x, max_y), &(x, y)| {
                (min_x.min(x), min_y.min(y), max_x.max(x), max_y.max(y))
            })
    }
}

/// Source of face landmarks for an already decoded image
pub trait LandmarkDetector: Send + Sync {
    /// Faces sorted by descending confidence
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>>;
}

/// SCRFD Face Detector
pub struct FaceDetector {
    pool: Arc<ModelPool>,
    confidence_threshold: f32,
    nms_threshold: f32,
}

impl FaceDetector {
    pub fn new(pool: Arc<ModelPool>, confidence_threshold: f32) -> Self {
        Self {
            pool,
            confidence_threshold,
            nms_threshold: 0.4,
        }
    }

    /// Parse InsightFace SCRFD outputs.
    ///
    /// Outputs are grouped by head: all score maps first, then bbox
    /// distances, then (optionally) keypoint offsets, one per stride.
    fn parse_outputs(&self, request: &InferRequest, resize_info: &ResizeInfo) -> Result<Vec<FaceBox>> {
        let mut output_count = 0;
        while output_count < 20 && request.get_output_tensor_by_index(output_count).is_ok() {
            output_count += 1;
        }

        let (fmc, use_kps, num_anchors) = match output_count {
            6 => (3, false, 2),
            9 => (3, true, 2),
            10 => (5, false, 1),
            15 => (5, true, 1),
            _ => {
                warn!("Unknown SCRFD output count: {}, trying default", output_count);
                (3, true, 2)
            }
        };
        let strides: &[usize] = if fmc == 3 {
            &[8, 16, 32]
        } else {
            &[8, 16, 32, 64, 128]
        };

        let mut faces = Vec::new();
        for (idx, &stride) in strides.iter().enumerate() {
            let (_, scores) = read_f32(&request.get_output_tensor_by_index(idx)?)?;
            let (_, bboxes) = read_f32(&request.get_output_tensor_by_index(idx + fmc)?)?;
            let kps = if use_kps {
                Some(read_f32(&request.get_output_tensor_by_index(idx + fmc * 2)?)?.1)
            } else {
                None
            };

            let head = StrideHead {
                stride,
                num_anchors,
                scores: &scores,
                bboxes: &bboxes,
                kps: kps.as_deref(),
            };
            faces.extend(head.decode(self.confidence_threshold, resize_info));
        }

        debug!("{} candidate faces before NMS", faces.len());
        Ok(faces)
    }
}

impl LandmarkDetector for FaceDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let resize_info = ResizeInfo::new(image.dimensions(), DETECTOR_INPUT_SIZE);
        let input = preprocess_for_detection(image);
        let input = f32_tensor(
            &[1, 3, DETECTOR_INPUT_SIZE.1 as usize, DETECTOR_INPUT_SIZE.0 as usize],
            input.as_slice().unwrap_or_default(),
        )?;

        let model = self.pool.get_model(ModelType::Detector)?;
        let mut request = model.create_infer_request()?;
        request.set_input_tensor(&input)?;
        request.infer()?;

        let faces = nms(self.parse_outputs(&request, &resize_info)?, self.nms_threshold);
        debug!("Detected {} faces after NMS", faces.len());
        Ok(faces)
    }
}

/// Raw outputs of one detection stride
struct StrideHead<'a> {
    stride: usize,
    num_anchors: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: Option<&'a [f32]>,
}

impl StrideHead<'_> {
    fn decode(&self, threshold: f32, resize_info: &ResizeInfo) -> Vec<FaceBox> {
        let feat_w = DETECTOR_INPUT_SIZE.0 as usize / self.stride;
        let feat_h = DETECTOR_INPUT_SIZE.1 as usize / self.stride;
        let stride = self.stride as f32;
        let (max_x, max_y) = (
            resize_info.original_width as f32,
            resize_info.original_height as f32,
        );

        let mut faces = Vec::new();
        for i in 0..(feat_w * feat_h * self.num_anchors) {
            let Some(&score) = self.scores.get(i) else {
                break;
            };
            if score < threshold {
                continue;
            }
            let Some(dist) = self.bboxes.get(i * 4..i * 4 + 4) else {
                continue;
            };

            // Anchors repeat per cell, cells are row-major
            let cell = i / self.num_anchors;
            let cx = (cell % feat_w) as f32 * stride;
            let cy = (cell / feat_w) as f32 * stride;

            let (x1, y1) = resize_info.to_original(cx - dist[0] * stride, cy - dist[1] * stride);
            let (x2, y2) = resize_info.to_original(cx + dist[2] * stride, cy + dist[3] * stride);

            let mut landmarks = [(0.0f32, 0.0f32); 5];
            if let Some(offsets) = self.kps.and_then(|k| k.get(i * 10..i * 10 + 10)) {
                for (j, point) in landmarks.iter_mut().enumerate() {
                    *point = resize_info.to_original(
                        cx + offsets[j * 2] * stride,
                        cy + offsets[j * 2 + 1] * stride,
                    );
                }
            }

            faces.push(FaceBox {
                x1: x1.clamp(0.0, max_x),
                y1: y1.clamp(0.0, max_y),
                x2: x2.clamp(0.0, max_x),
                y2: y2.clamp(0.0, max_y),
                confidence: score,
                landmarks,
            });
        }
        faces
    }
}

/// Greedy non-maximum suppression, result sorted by confidence
pub fn nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| compute_iou(kept, &candidate) <= iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Intersection over union of two boxes
pub fn compute_iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.x2 - a.x1) * (a.y2 - a.y1);
    let area_b = (b.x2 - b.x1) * (b.y2 - b.y1);
    let union = area_a + area_b - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}
