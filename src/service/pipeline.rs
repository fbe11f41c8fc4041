//! Edit pipeline
//!
//! One invocation runs strictly forward:
//! normalize → encode → truncate → edit → synthesize → enhance → write.
//! Cancellation is checked between stages, and the output file only
//! appears once every stage has succeeded.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use image::{DynamicImage, RgbImage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{Config, OutputConfig};
use crate::engine::detector::{FaceDetector, LandmarkDetector};
use crate::engine::encoder::{LatentEncoderAdapter, OpenVinoEncoder};
use crate::engine::generator::{GeneratorAdapter, OpenVinoGenerator};
use crate::engine::pool::{ModelPool, ModelType};
use crate::engine::preprocess::{decode_image, FaceNormalizer};
use crate::error::{PipelineError, PipelineResult, Stage, StageError};
use crate::latent::{
    AttributeVector, ComponentStore, LatentCode, MeanLatentCache, SemanticAttributeEditor,
    SemanticMappingTable,
};
use crate::utils::enhance::PostProcessor;
use crate::utils::image::{encode, format_for_path, tensor_to_rgb};

/// One edit invocation's parameters
#[derive(Debug, Clone, PartialEq)]
pub struct EditRequest {
    pub attributes: AttributeVector,
    /// Blend factor toward the mean latent, in (0, 1]
    pub truncation: f32,
    /// Synthesis noise; zero or below selects constant noise
    pub noise_strength: f32,
}

impl Default for EditRequest {
    fn default() -> Self {
        Self::new(AttributeVector::new())
    }
}

impl EditRequest {
    pub fn new(attributes: AttributeVector) -> Self {
        Self::from_config(attributes, &OutputConfig::default())
    }

    pub fn from_config(attributes: AttributeVector, output: &OutputConfig) -> Self {
        Self {
            attributes,
            truncation: output.default_truncation,
            noise_strength: output.default_noise_strength,
        }
    }

    pub fn with_truncation(mut self, truncation: f32) -> Self {
        self.truncation = truncation;
        self
    }

    pub fn with_noise_strength(mut self, noise_strength: f32) -> Self {
        self.noise_strength = noise_strength;
        self
    }

    /// Reject values that can never produce a meaningful image
    pub fn validate(&self) -> PipelineResult<()> {
        if !(self.truncation > 0.0 && self.truncation <= 1.0) {
            return Err(PipelineError::new(
                Stage::Truncate,
                StageError::InvalidRequest(format!(
                    "truncation must be in (0, 1], got {}",
                    self.truncation
                )),
            ));
        }
        if !self.noise_strength.is_finite() {
            return Err(PipelineError::new(
                Stage::Synthesize,
                StageError::InvalidRequest(format!(
                    "noise strength must be finite, got {}",
                    self.noise_strength
                )),
            ));
        }
        if let Some((attribute, strength)) = self.attributes.iter().find(|(_, s)| !s.is_finite()) {
            return Err(PipelineError::new(
                Stage::Edit,
                StageError::InvalidRequest(format!("{} strength is {}", attribute, strength)),
            ));
        }
        Ok(())
    }
}

fn at(stage: Stage) -> impl Fn(StageError) -> PipelineError {
    move |source| PipelineError::new(stage, source)
}

fn check_cancelled(cancel: &CancellationToken, stage: Stage) -> PipelineResult<()> {
    if cancel.is_cancelled() {
        info!("Edit cancelled before {} stage", stage);
        return Err(PipelineError::new(stage, StageError::Cancelled));
    }
    Ok(())
}

pub struct EditPipeline {
    normalizer: FaceNormalizer,
    encoder: LatentEncoderAdapter,
    generator: GeneratorAdapter,
    mean_latent: Arc<MeanLatentCache>,
    editor: SemanticAttributeEditor,
    post: PostProcessor,
}

impl EditPipeline {
    pub fn new(
        normalizer: FaceNormalizer,
        encoder: LatentEncoderAdapter,
        generator: GeneratorAdapter,
        mean_latent: Arc<MeanLatentCache>,
        editor: SemanticAttributeEditor,
        post: PostProcessor,
    ) -> Self {
        Self {
            normalizer,
            encoder,
            generator,
            mean_latent,
            editor,
            post,
        }
    }

    /// Wire every stage to the OpenVINO networks in `pool`
    pub fn from_config(config: &Config, pool: Arc<ModelPool>) -> anyhow::Result<Self> {
        let latent = &config.latent;

        let mappings = match &config.editing.mapping_path {
            Some(path) => SemanticMappingTable::load_json(path)
                .with_context(|| format!("Failed to load semantic mapping from {}", path.display()))?,
            None => SemanticMappingTable::default_ffhq(),
        };
        info!("Semantic mapping covers {} attributes", mappings.len());

        let components = ComponentStore::new(
            config.components.path.clone(),
            latent.num_layers * latent.latent_dim,
            config.components.synthetic_count,
            config.components.synthetic_seed,
        );

        let detector: Option<Arc<dyn LandmarkDetector>> =
            if config.normalize.use_detector && pool.is_available(ModelType::Detector) {
                Some(Arc::new(FaceDetector::new(
                    pool.clone(),
                    config.normalize.detector_confidence,
                )))
            } else {
                info!("Face detector unavailable, inputs will be center-cropped");
                None
            };

        let normalizer = FaceNormalizer::new(
            detector,
            config.normalize.encoder_resolution,
            config.normalize.crop_margin,
        );
        let encoder = LatentEncoderAdapter::new(
            Arc::new(OpenVinoEncoder::new(pool.clone())),
            latent.num_layers,
            latent.latent_dim,
        );
        let generator = GeneratorAdapter::new(Arc::new(OpenVinoGenerator::new(
            pool,
            latent.num_layers,
            latent.latent_dim,
            latent.z_dim,
        )));
        let mean_latent = Arc::new(MeanLatentCache::new(
            latent.mean_latent_samples,
            latent.mean_latent_chunk,
            latent.mean_latent_seed,
        ));
        let editor = SemanticAttributeEditor::new(
            Arc::new(mappings),
            Arc::new(components),
            config.editing.clone(),
        );

        Ok(Self::new(
            normalizer,
            encoder,
            generator,
            mean_latent,
            editor,
            PostProcessor::from_config(&config.output),
        ))
    }

    pub fn mean_latent(&self) -> &Arc<MeanLatentCache> {
        &self.mean_latent
    }

    /// Decode input bytes, honoring EXIF orientation
    pub fn decode(&self, data: &[u8]) -> PipelineResult<DynamicImage> {
        decode_image(data).map_err(|e| PipelineError::new(Stage::Decode, StageError::Decode(e)))
    }

    /// Run every stage up to and including enhancement
    pub fn run(
        &self,
        image: &DynamicImage,
        request: &EditRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<RgbImage> {
        request.validate()?;
        let start = Instant::now();

        check_cancelled(cancel, Stage::Normalize)?;
        let face = self.normalizer.normalize(image);
        let input = self.normalizer.to_encoder_tensor(&face);

        check_cancelled(cancel, Stage::Encode)?;
        let (_, latent) = self.encoder.encode(&input).map_err(at(Stage::Encode))?;

        check_cancelled(cancel, Stage::Truncate)?;
        let latent = self.truncate(latent, request.truncation)?;

        check_cancelled(cancel, Stage::Edit)?;
        let latent = self.editor.edit(latent, &request.attributes);

        check_cancelled(cancel, Stage::Synthesize)?;
        let synthesized = self
            .generator
            .synthesize(&latent, request.noise_strength)
            .map_err(at(Stage::Synthesize))?;
        let rgb = tensor_to_rgb(&synthesized).map_err(at(Stage::Synthesize))?;

        check_cancelled(cancel, Stage::Enhance)?;
        let output = self.post.enhance(&rgb);

        info!(
            "Generated {}x{} edit in {:?}",
            output.width(),
            output.height(),
            start.elapsed()
        );
        Ok(output)
    }

    fn truncate(&self, latent: LatentCode, truncation: f32) -> PipelineResult<LatentCode> {
        if truncation >= 1.0 {
            return Ok(latent);
        }
        let mean = self
            .mean_latent
            .get_mean_latent(self.generator.generator().as_ref())
            .map_err(|e| PipelineError::new(Stage::Truncate, StageError::MeanLatent(e)))?;
        debug!("Applying truncation {}", truncation);
        Ok(latent.truncate(&mean, truncation))
    }

    /// Read `input`, run the pipeline and atomically write the result to
    /// `output`. Nothing is written unless every stage succeeds.
    pub fn run_to_file(
        &self,
        input: &Path,
        output: &Path,
        request: &EditRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<RgbImage> {
        let data = std::fs::read(input).map_err(|source| {
            PipelineError::new(
                Stage::Decode,
                StageError::Io {
                    path: input.to_path_buf(),
                    source,
                },
            )
        })?;
        let image = self.decode(&data)?;
        let result = self.run(&image, request, cancel)?;

        check_cancelled(cancel, Stage::Write)?;
        write_atomically(&result, output).map_err(at(Stage::Write))?;
        info!("Saved edited image to {}", output.display());
        Ok(result)
    }
}

/// Encode by extension into a temp file beside `path`, then rename over it
fn write_atomically(image: &RgbImage, path: &Path) -> Result<(), StageError> {
    let bytes = encode(image, format_for_path(path))?;
    let io_err = |source| StageError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(&bytes).map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::{pipeline, pipeline_with, DIM, LAYERS};
    use super::*;
    use crate::engine::encoder::testing::MockEncoder;
    use crate::engine::generator::testing::MockGenerator;
    use crate::engine::generator::{Generator, NoiseConfig};
    use image::{ImageBuffer, Rgb};
    use ndarray::{Array3, Array4, ArrayView2};
    use tempfile::tempdir;

    struct FailingGenerator;

    impl Generator for FailingGenerator {
        fn num_layers(&self) -> usize {
            LAYERS
        }
        fn latent_dim(&self) -> usize {
            DIM
        }
        fn z_dim(&self) -> usize {
            DIM
        }
        fn map(&self, z: ArrayView2<f32>) -> anyhow::Result<Array3<f32>> {
            Ok(LatentCode::from_w(z, LAYERS).into_array())
        }
        fn synthesize(&self, _: &LatentCode, _: NoiseConfig) -> anyhow::Result<Array4<f32>> {
            anyhow::bail!("synthesis network crashed")
        }
    }

    /// Mapping network is broken, synthesis works
    struct UnmappableGenerator(MockGenerator);

    impl Generator for UnmappableGenerator {
        fn num_layers(&self) -> usize {
            LAYERS
        }
        fn latent_dim(&self) -> usize {
            DIM
        }
        fn z_dim(&self) -> usize {
            DIM
        }
        fn map(&self, _: ArrayView2<f32>) -> anyhow::Result<Array3<f32>> {
            anyhow::bail!("mapping network crashed")
        }
        fn synthesize(&self, latent: &LatentCode, noise: NoiseConfig) -> anyhow::Result<Array4<f32>> {
            self.0.synthesize(latent, noise)
        }
    }

    /// Cancels the run from inside synthesis
    struct CancellingGenerator {
        inner: MockGenerator,
        cancel: CancellationToken,
    }

    impl Generator for CancellingGenerator {
        fn num_layers(&self) -> usize {
            LAYERS
        }
        fn latent_dim(&self) -> usize {
            DIM
        }
        fn z_dim(&self) -> usize {
            DIM
        }
        fn map(&self, z: ArrayView2<f32>) -> anyhow::Result<Array3<f32>> {
            self.inner.map(z)
        }
        fn synthesize(&self, latent: &LatentCode, noise: NoiseConfig) -> anyhow::Result<Array4<f32>> {
            self.cancel.cancel();
            self.inner.synthesize(latent, noise)
        }
    }

    fn photo() -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(40, 30, |x, y| {
            Rgb([(x * 6) as u8, (y * 8) as u8, 90])
        }))
    }

    fn write_photo(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("input.png");
        photo().save(&path).unwrap();
        path
    }

    #[test]
    fn test_identity_request_is_deterministic() {
        let pipeline = pipeline();
        let request = EditRequest::default().with_noise_strength(0.0);
        let cancel = CancellationToken::new();

        let first = pipeline.run(&photo(), &request, &cancel).unwrap();
        let second = pipeline.run(&photo(), &request, &cancel).unwrap();
        assert_eq!(first.dimensions(), (12, 12));
        assert_eq!(first, second);
    }

    #[test]
    fn test_truncation_one_skips_mean_latent() {
        let pipeline = pipeline();
        let request = EditRequest::default().with_truncation(1.0);
        pipeline.run(&photo(), &request, &CancellationToken::new()).unwrap();
        assert!(!pipeline.mean_latent().is_cached());

        let request = request.with_truncation(0.7);
        pipeline.run(&photo(), &request, &CancellationToken::new()).unwrap();
        assert_eq!(pipeline.mean_latent().computations(), 1);
    }

    #[test]
    fn test_unmapped_attributes_leave_output_unchanged() {
        let pipeline = pipeline();
        let cancel = CancellationToken::new();
        let base = EditRequest::default().with_noise_strength(0.0);
        let unmapped = EditRequest {
            attributes: AttributeVector::from_named([("pose", 4.0), ("tail", 3.0)]),
            ..base.clone()
        };

        let a = pipeline.run(&photo(), &base, &cancel).unwrap();
        let b = pipeline.run(&photo(), &unmapped, &cancel).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_truncation_is_rejected() {
        let pipeline = pipeline();
        for t in [0.0, -0.5, 1.5, f32::NAN] {
            let request = EditRequest::default().with_truncation(t);
            let err = pipeline
                .run(&photo(), &request, &CancellationToken::new())
                .unwrap_err();
            assert_eq!(err.stage, Stage::Truncate);
            assert!(matches!(err.source, StageError::InvalidRequest(_)));
        }
    }

    #[test]
    fn test_encoder_failure_reports_encode_stage() {
        let encoder = MockEncoder {
            latent_shape: vec![1, LAYERS, DIM],
            fail: true,
        };
        let pipeline = pipeline_with(encoder, Arc::new(MockGenerator::new(LAYERS, DIM, 12)));
        let err = pipeline
            .run(&photo(), &EditRequest::default(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.stage, Stage::Encode);
        assert!(matches!(err.source, StageError::Encoding(_)));
    }

    #[test]
    fn test_synthesis_failure_reports_synthesize_stage() {
        let pipeline = pipeline_with(MockEncoder::wplus(LAYERS, DIM), Arc::new(FailingGenerator));
        let err = pipeline
            .run(&photo(), &EditRequest::default(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.stage, Stage::Synthesize);
        assert!(matches!(err.source, StageError::Synthesis(_)));
    }

    #[test]
    fn test_mean_latent_failure_reports_truncate_stage() {
        let generator = UnmappableGenerator(MockGenerator::new(LAYERS, DIM, 12));
        let pipeline = pipeline_with(MockEncoder::wplus(LAYERS, DIM), Arc::new(generator));

        let err = pipeline
            .run(&photo(), &EditRequest::default(), &CancellationToken::new())
            .unwrap_err();
        assert_eq!(err.stage, Stage::Truncate);
        assert!(matches!(err.source, StageError::MeanLatent(_)));
        assert!(err.to_string().contains("mean latent"));

        // Without truncation the mapping network is never needed
        let request = EditRequest::default().with_truncation(1.0);
        assert!(pipeline.run(&photo(), &request, &CancellationToken::new()).is_ok());
    }

    #[test]
    fn test_run_to_file_writes_output() {
        let dir = tempdir().unwrap();
        let input = write_photo(dir.path());
        let output = dir.path().join("out").join("edited.png");
        std::fs::create_dir_all(output.parent().unwrap()).unwrap();

        let pipeline = pipeline();
        let result = pipeline
            .run_to_file(&input, &output, &EditRequest::default(), &CancellationToken::new())
            .unwrap();

        let written = image::open(&output).unwrap().to_rgb8();
        assert_eq!(written, result);
        // Only the final file remains in the destination directory
        assert_eq!(std::fs::read_dir(output.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_cancelled_before_start_writes_nothing() {
        let dir = tempdir().unwrap();
        let input = write_photo(dir.path());
        let output = dir.path().join("edited.png");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pipeline()
            .run_to_file(&input, &output, &EditRequest::default(), &cancel)
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!output.exists());
    }

    #[test]
    fn test_cancelled_mid_run_writes_nothing() {
        let dir = tempdir().unwrap();
        let input = write_photo(dir.path());
        let output = dir.path().join("edited.png");

        let cancel = CancellationToken::new();
        let generator = CancellingGenerator {
            inner: MockGenerator::new(LAYERS, DIM, 12),
            cancel: cancel.clone(),
        };
        let pipeline = pipeline_with(MockEncoder::wplus(LAYERS, DIM), Arc::new(generator));
        let err = pipeline
            .run_to_file(&input, &output, &EditRequest::default(), &cancel)
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.stage, Stage::Enhance);
        assert!(!output.exists());
        // No stray temp files either
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_undecodable_input_reports_decode_stage() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("broken.png");
        std::fs::write(&input, b"not an image").unwrap();

        let err = pipeline()
            .run_to_file(
                &input,
                &dir.path().join("out.png"),
                &EditRequest::default(),
                &CancellationToken::new(),
            )
            .unwrap_err();
        assert_eq!(err.stage, Stage::Decode);
        assert!(matches!(err.source, StageError::Decode(_)));
    }
}
