//! Error taxonomy for the editing pipeline
//!
//! Stage-level failures abort the pipeline and are reported as a single
//! [`PipelineError`] naming the failing [`Stage`]. Per-attribute problems
//! (unknown attribute, out-of-range component, rejected sign) never reach
//! this level; the editor logs and skips them.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Pipeline states, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Decode,
    Normalize,
    Encode,
    Truncate,
    Edit,
    Synthesize,
    Enhance,
    Write,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Decode => "decode",
            Stage::Normalize => "normalize",
            Stage::Encode => "encode",
            Stage::Truncate => "truncate",
            Stage::Edit => "edit",
            Stage::Synthesize => "synthesize",
            Stage::Enhance => "enhance",
            Stage::Write => "write",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure inside a single stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error("input image could not be decoded: {0}")]
    Decode(#[source] anyhow::Error),

    #[error("latent encoding failed: {0}")]
    Encoding(#[source] anyhow::Error),

    #[error("synthesis failed: {0}")]
    Synthesis(#[source] anyhow::Error),

    #[error("mean latent estimation failed: {0}")]
    MeanLatent(#[source] anyhow::Error),

    #[error("latent shape mismatch: expected {expected:?}, got {actual:?}")]
    Shape {
        expected: (usize, usize),
        actual: Vec<usize>,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("image encoding failed: {0}")]
    ImageEncode(#[from] image::ImageError),

    #[error("cancelled")]
    Cancelled,
}

/// Error returned by a pipeline run, tagged with the stage that failed
#[derive(Debug, Error)]
#[error("pipeline failed at {stage} stage: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    pub fn new(stage: Stage, source: StageError) -> Self {
        Self { stage, source }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, StageError::Cancelled)
    }
}

/// Component library could not be read; always recovered by the
/// synthetic fallback
#[derive(Debug, Error)]
pub enum ComponentLoadError {
    #[error("component file not found: {0}")]
    Missing(PathBuf),

    #[error("component file too small ({size} bytes)")]
    TooSmall { size: u64 },

    #[error("bad component file header")]
    BadMagic,

    #[error("component payload could not be decoded: {0}")]
    Corrupt(#[from] bincode::Error),

    #[error("inconsistent component library: {0}")]
    Inconsistent(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
