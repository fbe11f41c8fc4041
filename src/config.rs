//! Latent editing service configuration

use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    pub latent: LatentConfig,
    pub components: ComponentsConfig,
    pub editing: EditingConfig,
    pub normalize: NormalizeConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub device: String,
    pub model_idle_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub detector: PathBuf,
    pub encoder: PathBuf,
    pub mapping: PathBuf,
    pub synthesis: PathBuf,
}

/// Generator geometry and mean-latent sampling
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LatentConfig {
    pub num_layers: usize,
    pub latent_dim: usize,
    pub z_dim: usize,
    pub mean_latent_samples: usize,
    pub mean_latent_chunk: usize,
    pub mean_latent_seed: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComponentsConfig {
    pub path: PathBuf,
    pub synthetic_count: usize,
    pub synthetic_seed: u64,
}

/// Editing constants. The defaults are hand-tuned; none of them is an invariant.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EditingConfig {
    /// Optional JSON file with the semantic mapping table
    pub mapping_path: Option<PathBuf>,
    pub epsilon: f32,
    pub damping: f32,
    pub importance_decay: f32,
    pub boost_threshold: f32,
    pub boost_rate: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    pub encoder_resolution: u32,
    pub crop_margin: f32,
    pub detector_confidence: f32,
    pub use_detector: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub sharpness: f32,
    pub contrast: f32,
    pub default_truncation: f32,
    pub default_noise_strength: f32,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            inference: InferenceConfig::default(),
            models: ModelsConfig::default(),
            latent: LatentConfig::default(),
            components: ComponentsConfig::default(),
            editing: EditingConfig::default(),
            normalize: NormalizeConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "CPU".to_string(),
            model_idle_timeout: 300,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            detector: PathBuf::from("models/scrfd_10g_kps.onnx"),
            encoder: PathBuf::from("models/hyperstyle_ffhq.xml"),
            mapping: PathBuf::from("models/stylegan2_ffhq_mapping.xml"),
            synthesis: PathBuf::from("models/stylegan2_ffhq_synthesis.xml"),
        }
    }
}

impl Default for LatentConfig {
    fn default() -> Self {
        Self {
            num_layers: 18,
            latent_dim: 512,
            z_dim: 512,
            mean_latent_samples: 10_000,
            mean_latent_chunk: 1_000,
            mean_latent_seed: 0,
        }
    }
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/ganspace/ffhq_pca_components.bin"),
            synthetic_count: 80,
            synthetic_seed: 42,
        }
    }
}

impl Default for EditingConfig {
    fn default() -> Self {
        Self {
            mapping_path: None,
            epsilon: 0.001,
            damping: 0.8,
            importance_decay: 0.05,
            boost_threshold: 5.0,
            boost_rate: 0.3,
        }
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            encoder_resolution: 256,
            crop_margin: 1.5,
            detector_confidence: 0.5,
            use_detector: true,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sharpness: 1.2,
            contrast: 1.1,
            default_truncation: 0.7,
            default_noise_strength: 0.05,
        }
    }
}
