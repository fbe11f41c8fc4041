//! Mean latent estimation
//!
//! The truncation anchor is the average of many random z vectors pushed
//! through the mapping network. It depends only on the generator, so it is
//! computed once and shared for the life of the process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use ndarray::{Array2, Array3, Axis};
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use tracing::info;

use crate::engine::generator::Generator;

use super::code::LatentCode;

pub struct MeanLatentCache {
    samples: usize,
    chunk: usize,
    seed: u64,
    cached: RwLock<Option<Arc<LatentCode>>>,
    computations: AtomicUsize,
}

impl MeanLatentCache {
    pub fn new(samples: usize, chunk: usize, seed: u64) -> Self {
        Self {
            samples: samples.max(1),
            chunk: chunk.max(1),
            seed,
            cached: RwLock::new(None),
            computations: AtomicUsize::new(0),
        }
    }

    /// Number of times the mean has actually been computed
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    pub fn is_cached(&self) -> bool {
        self.cached.read().is_some()
    }

    /// Get the `[1, L, D]` mean latent, computing it on first use.
    /// Concurrent first callers wait for one computation.
    pub fn get_mean_latent(&self, generator: &dyn Generator) -> Result<Arc<LatentCode>> {
        if let Some(mean) = self.cached.read().as_ref() {
            return Ok(mean.clone());
        }

        let mut guard = self.cached.write();
        // Double-check after acquiring write lock
        if let Some(mean) = guard.as_ref() {
            return Ok(mean.clone());
        }

        let mean = Arc::new(self.compute(generator)?);
        *guard = Some(mean.clone());
        Ok(mean)
    }

    fn compute(&self, generator: &dyn Generator) -> Result<LatentCode> {
        let start = Instant::now();
        let z_dim = generator.z_dim();
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut sum = Array3::<f32>::zeros((1, generator.num_layers(), generator.latent_dim()));

        let mut remaining = self.samples;
        while remaining > 0 {
            let n = remaining.min(self.chunk);
            let z = Array2::from_shape_simple_fn((n, z_dim), || rng.sample::<f32, _>(StandardNormal));
            let w = generator.map(z.view())?;
            anyhow::ensure!(
                w.shape()[1..] == sum.shape()[1..],
                "mapping network returned {:?}, expected (_, {}, {})",
                w.shape(),
                generator.num_layers(),
                generator.latent_dim()
            );
            sum += &w.sum_axis(Axis(0)).insert_axis(Axis(0));
            remaining -= n;
        }

        sum /= self.samples as f32;
        self.computations.fetch_add(1, Ordering::SeqCst);
        info!(
            "Computed mean latent from {} samples in {:?}",
            self.samples,
            start.elapsed()
        );
        Ok(LatentCode::new(sum))
    }
}
