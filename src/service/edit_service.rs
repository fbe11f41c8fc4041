//! Edit Service
//!
//! Async front of the pipeline. Each invocation runs on the blocking pool so
//! inference never stalls the runtime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::engine::pool::{ModelPool, ModelType};

use super::pipeline::{EditPipeline, EditRequest};
use super::types::{EditResult, ModelStatus};

pub struct EditService {
    pipeline: Arc<EditPipeline>,
    pool: Option<Arc<ModelPool>>,
}

impl EditService {
    pub fn new(pipeline: Arc<EditPipeline>) -> Self {
        Self {
            pipeline,
            pool: None,
        }
    }

    /// Build the model pool and a pipeline over it
    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = Arc::new(ModelPool::new(&config.inference, &config.models)?);
        let pipeline = Arc::new(EditPipeline::from_config(config, pool.clone())?);
        Ok(Self {
            pipeline,
            pool: Some(pool),
        })
    }

    pub fn pool(&self) -> Option<&Arc<ModelPool>> {
        self.pool.as_ref()
    }

    /// Edit the image at `input` and write the result to `output`
    pub async fn edit_file(
        &self,
        input: PathBuf,
        output: PathBuf,
        request: EditRequest,
        cancel: CancellationToken,
    ) -> Result<EditResult> {
        let start = Instant::now();

        let pipeline = self.pipeline.clone();
        let task_request = request.clone();
        let task_output = output.clone();
        let image = tokio::task::spawn_blocking(move || {
            pipeline.run_to_file(&input, &task_output, &task_request, &cancel)
        })
        .await??;

        let inference_time_ms = start.elapsed().as_millis() as u64;
        info!(
            "Edited image written to {} in {}ms",
            output.display(),
            inference_time_ms
        );

        Ok(EditResult {
            output_path: output.to_string_lossy().into_owned(),
            width: image.width(),
            height: image.height(),
            attributes: request.attributes,
            truncation: request.truncation,
            noise_strength: request.noise_strength,
            inference_time_ms,
        })
    }

    /// Availability and load state of every network
    pub fn model_status(&self) -> Vec<ModelStatus> {
        let Some(pool) = &self.pool else {
            return Vec::new();
        };
        pool.get_status()
            .into_iter()
            .map(|(model_type, loaded)| ModelStatus {
                name: model_type.as_str().to_string(),
                available: pool.is_available(model_type),
                loaded,
            })
            .collect()
    }

    /// Whether the networks the pipeline cannot run without are on disk
    pub fn models_available(&self) -> bool {
        self.pool.as_ref().map_or(true, |pool| {
            [ModelType::Encoder, ModelType::Mapping, ModelType::Synthesis]
                .into_iter()
                .all(|t| pool.is_available(t))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, Stage};
    use crate::latent::{Attribute, AttributeVector};
    use crate::service::pipeline::testing::pipeline;
    use image::{DynamicImage, ImageBuffer, Rgb};
    use tempfile::tempdir;

    fn write_photo(path: &std::path::Path) {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(24, 32, |x, y| {
            Rgb([(x * 10) as u8, (y * 7) as u8, 50])
        }))
        .save(path)
        .unwrap();
    }

    #[tokio::test]
    async fn test_edit_file_reports_result() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("face.png");
        let output = dir.path().join("edited.png");
        write_photo(&input);

        let service = EditService::new(Arc::new(pipeline()));
        let request = EditRequest::new(AttributeVector::new().with(Attribute::Smile, 1.5));
        let result = service
            .edit_file(input, output.clone(), request, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!((result.width, result.height), (12, 12));
        assert_eq!(result.attributes.get(Attribute::Smile), 1.5);
        assert_eq!(result.truncation, 0.7);
        assert!(output.exists());

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["attributes"]["smile"], 1.5);
    }

    #[tokio::test]
    async fn test_cancelled_edit_surfaces_pipeline_error() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("face.png");
        let output = dir.path().join("edited.png");
        write_photo(&input);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let service = EditService::new(Arc::new(pipeline()));
        let err = service
            .edit_file(input, output.clone(), EditRequest::default(), cancel)
            .await
            .unwrap_err();

        let pipeline_err = err.downcast_ref::<PipelineError>().unwrap();
        assert!(pipeline_err.is_cancelled());
        assert_eq!(pipeline_err.stage, Stage::Normalize);
        assert!(!output.exists());
    }

    #[test]
    fn test_service_without_pool_has_no_status() {
        let service = EditService::new(Arc::new(pipeline()));
        assert!(service.model_status().is_empty());
        assert!(service.models_available());
    }
}
