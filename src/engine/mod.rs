//! Inference engine module
//!
//! OpenVINO-backed networks behind narrow traits:
//! - Model lazy loading and auto-unloading
//! - Face detection and crop normalization
//! - Latent inversion and StyleGAN synthesis

pub mod pool;
pub mod detector;
pub mod encoder;
pub mod generator;
pub mod preprocess;

pub use pool::ModelPool;
pub use detector::{FaceDetector, LandmarkDetector};
pub use encoder::{LatentEncoder, LatentEncoderAdapter, OpenVinoEncoder};
pub use generator::{ExclusiveGenerator, Generator, GeneratorAdapter, NoiseConfig, NoiseMode, OpenVinoGenerator};
pub use preprocess::FaceNormalizer;
