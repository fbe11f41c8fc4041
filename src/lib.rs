//! Semantic face attribute editing in StyleGAN latent space

pub mod config;
pub mod engine;
pub mod error;
pub mod latent;
pub mod service;
pub mod utils;

pub use config::Config;
pub use error::{PipelineError, Stage, StageError};
