//! Latent inversion encoder
//!
//! Wraps a HyperStyle-style encoder exported to OpenVINO IR. Output 0 is the
//! encoder's own reconstruction (ignored by the pipeline), output 1 the
//! latent code as `[1, L, D]` or a single W vector `[1, D]`.

use std::sync::Arc;

use anyhow::Result;
use ndarray::{Array4, ArrayD, Ix4, IxDyn};
use tracing::debug;

use crate::error::StageError;
use crate::latent::LatentCode;

use super::pool::{f32_tensor, read_f32, ModelPool, ModelType};

/// Raw encoder outputs before shape normalization
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub reconstruction: Option<Array4<f32>>,
    pub latent_shape: Vec<usize>,
    pub latent: Vec<f32>,
}

/// An image-to-latent inversion network
pub trait LatentEncoder: Send + Sync {
    /// `input` is an RGB NCHW tensor in [-1, 1]
    fn infer(&self, input: &Array4<f32>) -> Result<EncoderOutput>;
}

pub struct OpenVinoEncoder {
    pool: Arc<ModelPool>,
}

impl OpenVinoEncoder {
    pub fn new(pool: Arc<ModelPool>) -> Self {
        Self { pool }
    }
}

impl LatentEncoder for OpenVinoEncoder {
    fn infer(&self, input: &Array4<f32>) -> Result<EncoderOutput> {
        let data = input.as_standard_layout();
        let tensor = f32_tensor(input.shape(), data.as_slice().unwrap_or_default())?;

        let model = self.pool.get_model(ModelType::Encoder)?;
        let mut request = model.create_infer_request()?;
        request.set_input_tensor(&tensor)?;
        request.infer()?;

        let first = read_f32(&request.get_output_tensor_by_index(0)?)?;
        // Single-output exports carry only the latent
        let ((latent_shape, latent), reconstruction) = match request.get_output_tensor_by_index(1) {
            Ok(tensor) => {
                let (recon_dims, recon) = first;
                let reconstruction = ArrayD::from_shape_vec(IxDyn(&recon_dims), recon)
                    .ok()
                    .and_then(|a| a.into_dimensionality::<Ix4>().ok());
                (read_f32(&tensor)?, reconstruction)
            }
            Err(_) => (first, None),
        };

        Ok(EncoderOutput {
            reconstruction,
            latent_shape,
            latent,
        })
    }
}

/// Normalizes encoder output to a W+ code of the generator's geometry
#[derive(Clone)]
pub struct LatentEncoderAdapter {
    encoder: Arc<dyn LatentEncoder>,
    num_layers: usize,
    latent_dim: usize,
}

impl LatentEncoderAdapter {
    pub fn new(encoder: Arc<dyn LatentEncoder>, num_layers: usize, latent_dim: usize) -> Self {
        Self {
            encoder,
            num_layers,
            latent_dim,
        }
    }

    /// Returns the reconstruction (if any) and a `[1, L, D]` latent code
    pub fn encode(&self, input: &Array4<f32>) -> Result<(Option<Array4<f32>>, LatentCode), StageError> {
        let output = self.encoder.infer(input).map_err(StageError::Encoding)?;
        debug!("Encoder latent shape {:?}", output.latent_shape);

        let latent = LatentCode::from_raw(
            &output.latent_shape,
            output.latent,
            self.num_layers,
            self.latent_dim,
        )?;
        if latent.batch() != 1 {
            return Err(StageError::Shape {
                expected: (self.num_layers, self.latent_dim),
                actual: latent.as_array().shape().to_vec(),
            });
        }

        Ok((output.reconstruction, latent))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Emits a latent derived from the input's mean intensity
    pub struct MockEncoder {
        pub latent_shape: Vec<usize>,
        pub fail: bool,
    }

    impl MockEncoder {
        pub fn wplus(num_layers: usize, latent_dim: usize) -> Self {
            Self {
                latent_shape: vec![1, num_layers, latent_dim],
                fail: false,
            }
        }
    }

    impl LatentEncoder for MockEncoder {
        fn infer(&self, input: &Array4<f32>) -> Result<EncoderOutput> {
            anyhow::ensure!(!self.fail, "encoder network unavailable");
            let mean = input.mean().unwrap_or(0.0);
            let count: usize = self.latent_shape.iter().product();
            let latent = (0..count).map(|i| mean + (i % 7) as f32 * 0.1).collect();
            Ok(EncoderOutput {
                reconstruction: None,
                latent_shape: self.latent_shape.clone(),
                latent,
            })
        }
    }
}
