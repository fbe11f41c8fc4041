//! StyleGAN generator
//!
//! The generator is consumed as two opaque networks: a mapping network
//! (z → W+) used for the mean latent, and a synthesis network (W+ → image).
//! Noise is an explicit argument of every synthesis call. Backends that can
//! only be configured by mutating the model are wrapped in
//! [`ExclusiveGenerator`], which holds the model lock across the
//! set-noise/synthesize pair.

use std::sync::Arc;

use anyhow::Result;
use ndarray::{Array3, Array4, ArrayD, ArrayView2, Ix4, IxDyn};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::StageError;
use crate::latent::LatentCode;

use super::pool::{f32_tensor, read_f32, ModelPool, ModelType};

/// How per-layer noise is drawn during synthesis
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseMode {
    /// Fixed noise buffers, deterministic output
    Const,
    /// Fresh noise on every call
    Random,
}

impl NoiseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseMode::Const => "const",
            NoiseMode::Random => "random",
        }
    }
}

/// Noise settings for one synthesis call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseConfig {
    pub strength: f32,
    pub mode: NoiseMode,
}

impl NoiseConfig {
    /// `Const` when `strength <= 0`, `Random` otherwise
    pub fn from_strength(strength: f32) -> Self {
        let mode = if strength <= 0.0 {
            NoiseMode::Const
        } else {
            NoiseMode::Random
        };
        Self { strength, mode }
    }
}

/// A generator whose synthesis is a pure call
pub trait Generator: Send + Sync {
    fn num_layers(&self) -> usize;
    fn latent_dim(&self) -> usize;
    fn z_dim(&self) -> usize;

    /// Map z vectors `[N, z_dim]` to W+ codes `[N, layers, dim]`
    fn map(&self, z: ArrayView2<f32>) -> Result<Array3<f32>>;

    /// Render `[1, 3, H, W]` in the model's native [-1, 1] range
    fn synthesize(&self, latent: &LatentCode, noise: NoiseConfig) -> Result<Array4<f32>>;
}

/// A generator configured through mutable state on the model object.
///
/// Backends whose synthesis graph has no per-call noise input implement this
/// instead of [`Generator`]: a module that keeps `noise_strength` as an
/// attribute, or an IR exported with the strength folded into a variable.
/// Wrap such a backend in [`ExclusiveGenerator`] before handing it to
/// [`GeneratorAdapter`]. [`OpenVinoGenerator`] passes noise per call and does
/// not need it.
pub trait StatefulSynthesis: Send {
    fn num_layers(&self) -> usize;
    fn latent_dim(&self) -> usize;
    fn z_dim(&self) -> usize;
    fn map(&mut self, z: ArrayView2<f32>) -> Result<Array3<f32>>;
    fn set_noise_strength(&mut self, strength: f32);
    fn synthesize(&mut self, latent: &LatentCode, mode: NoiseMode) -> Result<Array4<f32>>;
}

/// Serializes access to a [`StatefulSynthesis`] model so one request's noise
/// setting can never leak into another request's synthesis call
pub struct ExclusiveGenerator<M> {
    model: Mutex<M>,
    num_layers: usize,
    latent_dim: usize,
    z_dim: usize,
}

impl<M: StatefulSynthesis> ExclusiveGenerator<M> {
    pub fn new(model: M) -> Self {
        Self {
            num_layers: model.num_layers(),
            latent_dim: model.latent_dim(),
            z_dim: model.z_dim(),
            model: Mutex::new(model),
        }
    }
}

impl<M: StatefulSynthesis> Generator for ExclusiveGenerator<M> {
    fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn z_dim(&self) -> usize {
        self.z_dim
    }

    fn map(&self, z: ArrayView2<f32>) -> Result<Array3<f32>> {
        self.model.lock().map(z)
    }

    fn synthesize(&self, latent: &LatentCode, noise: NoiseConfig) -> Result<Array4<f32>> {
        let mut model = self.model.lock();
        model.set_noise_strength(noise.strength);
        model.synthesize(latent, noise.mode)
    }
}

/// OpenVINO mapping + synthesis networks.
///
/// The synthesis IR takes `ws [1, L, D]` as input 0 and a scalar
/// `noise_strength [1]` as input 1; a zero strength selects the constant
/// noise buffers baked into the model.
pub struct OpenVinoGenerator {
    pool: Arc<ModelPool>,
    num_layers: usize,
    latent_dim: usize,
    z_dim: usize,
}

impl OpenVinoGenerator {
    pub fn new(pool: Arc<ModelPool>, num_layers: usize, latent_dim: usize, z_dim: usize) -> Self {
        Self {
            pool,
            num_layers,
            latent_dim,
            z_dim,
        }
    }
}

impl Generator for OpenVinoGenerator {
    fn num_layers(&self) -> usize {
        self.num_layers
    }

    fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn z_dim(&self) -> usize {
        self.z_dim
    }

    fn map(&self, z: ArrayView2<f32>) -> Result<Array3<f32>> {
        let (n, z_dim) = z.dim();
        let z = z.as_standard_layout();
        let input = f32_tensor(&[n, z_dim], z.as_slice().unwrap_or_default())?;

        let model = self.pool.get_model(ModelType::Mapping)?;
        let mut request = model.create_infer_request()?;
        request.set_input_tensor(&input)?;
        request.infer()?;

        let output = request.get_output_tensor()?;
        let (dims, data) = read_f32(&output)?;
        let code = LatentCode::from_raw(&dims, data, self.num_layers, self.latent_dim)?;
        Ok(code.into_array())
    }

    fn synthesize(&self, latent: &LatentCode, noise: NoiseConfig) -> Result<Array4<f32>> {
        let ws = latent.as_array().as_standard_layout();
        let (batch, layers, dim) = latent.as_array().dim();
        let ws_tensor = f32_tensor(&[batch, layers, dim], ws.as_slice().unwrap_or_default())?;

        let strength = match noise.mode {
            NoiseMode::Const => 0.0,
            NoiseMode::Random => noise.strength,
        };
        let noise_tensor = f32_tensor(&[1], &[strength])?;

        let model = self.pool.get_model(ModelType::Synthesis)?;
        let mut request = model.create_infer_request()?;
        request.set_input_tensor_by_index(0, &ws_tensor)?;
        request.set_input_tensor_by_index(1, &noise_tensor)?;

        debug!("Running synthesis with noise mode {}", noise.mode.as_str());
        request.infer()?;

        let output = request.get_output_tensor()?;
        let (dims, data) = read_f32(&output)?;
        let image = ArrayD::from_shape_vec(IxDyn(&dims), data)?.into_dimensionality::<Ix4>()?;
        Ok(image)
    }
}

/// Adapter around a [`Generator`] producing images in [0, 1]
#[derive(Clone)]
pub struct GeneratorAdapter {
    generator: Arc<dyn Generator>,
}

impl GeneratorAdapter {
    pub fn new(generator: Arc<dyn Generator>) -> Self {
        Self { generator }
    }

    pub fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    pub fn num_layers(&self) -> usize {
        self.generator.num_layers()
    }

    pub fn latent_dim(&self) -> usize {
        self.generator.latent_dim()
    }

    /// Render `latent` and rescale the result from [-1, 1] to [0, 1]
    pub fn synthesize(&self, latent: &LatentCode, noise_strength: f32) -> Result<Array4<f32>, StageError> {
        let expected = (self.num_layers(), self.latent_dim());
        if (latent.num_layers(), latent.latent_dim()) != expected {
            return Err(StageError::Shape {
                expected,
                actual: latent.as_array().shape().to_vec(),
            });
        }

        let noise = NoiseConfig::from_strength(noise_strength);
        let raw = self
            .generator
            .synthesize(latent, noise)
            .map_err(StageError::Synthesis)?;

        if raw.shape()[1] != 3 {
            return Err(StageError::Synthesis(anyhow::anyhow!(
                "generator returned {} channels, expected 3",
                raw.shape()[1]
            )));
        }

        Ok(raw.mapv(|v| ((v + 1.0) * 0.5).clamp(0.0, 1.0)))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockGenerator;
    use super::*;

    #[test]
    fn test_noise_mode_from_strength() {
        assert_eq!(NoiseConfig::from_strength(0.0).mode, NoiseMode::Const);
        assert_eq!(NoiseConfig::from_strength(-1.0).mode, NoiseMode::Const);
        assert_eq!(NoiseConfig::from_strength(0.05).mode, NoiseMode::Random);
    }

    #[test]
    fn test_adapter_rescales_and_clamps() {
        let adapter = GeneratorAdapter::new(Arc::new(MockGenerator::new(2, 4, 8)));
        let latent = LatentCode::new(Array3::from_elem((1, 2, 4), 3.0));
        let image = adapter.synthesize(&latent, 0.0).unwrap();
        assert_eq!(image.dim(), (1, 3, 8, 8));
        assert!(image.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_adapter_rejects_wrong_geometry() {
        let adapter = GeneratorAdapter::new(Arc::new(MockGenerator::new(2, 4, 8)));
        let latent = LatentCode::new(Array3::zeros((1, 3, 4)));
        assert!(matches!(
            adapter.synthesize(&latent, 0.0),
            Err(StageError::Shape { .. })
        ));
    }

    /// Model that only exposes noise through a mutable field, and records the
    /// strength observed inside each synthesis call
    struct FieldNoiseModel {
        noise_strength: f32,
        observed: Arc<Mutex<Vec<(f32, f32)>>>,
    }

    impl StatefulSynthesis for FieldNoiseModel {
        fn num_layers(&self) -> usize {
            1
        }
        fn latent_dim(&self) -> usize {
            2
        }
        fn z_dim(&self) -> usize {
            2
        }
        fn map(&mut self, z: ArrayView2<f32>) -> Result<Array3<f32>> {
            Ok(LatentCode::from_w(z, 1).into_array())
        }
        fn set_noise_strength(&mut self, strength: f32) {
            self.noise_strength = strength;
        }
        fn synthesize(&mut self, latent: &LatentCode, _mode: NoiseMode) -> Result<Array4<f32>> {
            let requested = latent.as_array()[[0, 0, 0]];
            std::thread::yield_now();
            self.observed.lock().push((requested, self.noise_strength));
            Ok(Array4::zeros((1, 3, 2, 2)))
        }
    }

    #[test]
    fn test_exclusive_generator_keeps_noise_per_call() {
        let observed = Arc::new(Mutex::new(Vec::new()));
        let generator = Arc::new(ExclusiveGenerator::new(FieldNoiseModel {
            noise_strength: 0.0,
            observed: observed.clone(),
        }));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    // Each thread encodes its own noise strength in the latent
                    let strength = i as f32 + 1.0;
                    let latent = LatentCode::new(Array3::from_elem((1, 1, 2), strength));
                    for _ in 0..20 {
                        generator
                            .synthesize(&latent, NoiseConfig::from_strength(strength))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let observed = observed.lock();
        assert_eq!(observed.len(), 160);
        assert!(observed.iter().all(|(requested, seen)| requested == seen));
    }
}
