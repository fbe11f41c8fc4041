//! Service layer types

use serde::{Deserialize, Serialize};

use crate::latent::AttributeVector;

/// Outcome of one edit invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditResult {
    pub output_path: String,
    pub width: u32,
    pub height: u32,
    pub attributes: AttributeVector,
    pub truncation: f32,
    pub noise_strength: f32,
    pub inference_time_ms: u64,
}

/// Load state of one network in the model pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatus {
    pub name: String,
    pub available: bool,
    pub loaded: bool,
}
