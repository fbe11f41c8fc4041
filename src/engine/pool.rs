//! Model Pool Manager
//!
//! Handles lazy loading and automatic unloading of models after idle timeout.
//! The detector, inversion encoder and the generator's mapping/synthesis
//! networks are all compiled through one shared OpenVINO core.

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use openvino::{CompiledModel, Core, ElementType, Shape, Tensor};
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::{InferenceConfig, ModelsConfig};

/// Wrapper for OpenVINO Core that implements Send + Sync
pub struct SafeCore(Core);
unsafe impl Send for SafeCore {}
unsafe impl Sync for SafeCore {}

impl Deref for SafeCore {
    type Target = Core;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for SafeCore {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Wrapper for OpenVINO CompiledModel that implements Send + Sync
#[derive(Clone)]
pub struct SafeCompiledModel(pub Arc<CompiledModel>);
unsafe impl Send for SafeCompiledModel {}
unsafe impl Sync for SafeCompiledModel {}

impl SafeCompiledModel {
    /// Create an inference request
    /// OpenVINO CompiledModel methods are thread-safe in C++, but Rust bindings
    /// require &mut self. We bypass this restriction safely.
    pub fn create_infer_request(&self) -> anyhow::Result<openvino::InferRequest> {
        unsafe {
            let ptr = std::sync::Arc::as_ptr(&self.0) as *mut CompiledModel;
            (*ptr).create_infer_request().map_err(|e| e.into())
        }
    }
}

impl Deref for SafeCompiledModel {
    type Target = CompiledModel;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// A cached model with its last access time
struct CachedModel {
    compiled: SafeCompiledModel,
    last_access: Instant,
}

/// Model types that can be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Detector,
    Encoder,
    Mapping,
    Synthesis,
}

impl ModelType {
    pub const ALL: [ModelType; 4] = [
        ModelType::Detector,
        ModelType::Encoder,
        ModelType::Mapping,
        ModelType::Synthesis,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Detector => "detector",
            ModelType::Encoder => "encoder",
            ModelType::Mapping => "mapping",
            ModelType::Synthesis => "synthesis",
        }
    }
}

struct ModelSlot {
    path: PathBuf,
    cache: RwLock<Option<CachedModel>>,
}

impl ModelSlot {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            cache: RwLock::new(None),
        }
    }
}

/// Model Pool Manager with lazy loading and auto-unloading
pub struct ModelPool {
    core: Arc<RwLock<SafeCore>>,
    device: String,
    idle_timeout: Duration,

    detector: ModelSlot,
    encoder: ModelSlot,
    mapping: ModelSlot,
    synthesis: ModelSlot,

    // Shutdown signal
    shutdown: Notify,
}

impl ModelPool {
    /// Create a new model pool
    pub fn new(config: &InferenceConfig, models: &ModelsConfig) -> anyhow::Result<Self> {
        let core = Core::new().context("Failed to initialize OpenVINO runtime")?;

        Ok(Self {
            core: Arc::new(RwLock::new(SafeCore(core))),
            device: config.device.clone(),
            idle_timeout: Duration::from_secs(config.model_idle_timeout),
            detector: ModelSlot::new(models.detector.clone()),
            encoder: ModelSlot::new(models.encoder.clone()),
            mapping: ModelSlot::new(models.mapping.clone()),
            synthesis: ModelSlot::new(models.synthesis.clone()),
            shutdown: Notify::new(),
        })
    }

    fn slot(&self, model_type: ModelType) -> &ModelSlot {
        match model_type {
            ModelType::Detector => &self.detector,
            ModelType::Encoder => &self.encoder,
            ModelType::Mapping => &self.mapping,
            ModelType::Synthesis => &self.synthesis,
        }
    }

    /// Whether the model file for `model_type` exists on disk
    pub fn is_available(&self, model_type: ModelType) -> bool {
        self.slot(model_type).path.exists()
    }

    /// Get or load a model, returns a clone of the compiled model
    pub fn get_model(&self, model_type: ModelType) -> anyhow::Result<SafeCompiledModel> {
        let slot = self.slot(model_type);

        // Try read lock first
        {
            let read_guard = slot.cache.read();
            if read_guard.is_some() {
                // Model is loaded, update access time and return
                drop(read_guard);
                let mut write_guard = slot.cache.write();
                if let Some(ref mut cached) = *write_guard {
                    cached.last_access = Instant::now();
                    return Ok(cached.compiled.clone());
                }
            }
        }

        // Need to load the model
        let mut write_guard = slot.cache.write();

        // Double-check after acquiring write lock
        if let Some(ref mut cached) = *write_guard {
            cached.last_access = Instant::now();
            return Ok(cached.compiled.clone());
        }

        let path = slot.path.to_string_lossy();
        info!("Loading model: {} from {}", model_type.as_str(), path);
        let start = Instant::now();

        // Core methods like read_model require &mut self in Rust bindings
        let mut core = self.core.write();
        let model = core
            .read_model_from_file(&path, "")
            .with_context(|| format!("Failed to read {} model from {}", model_type.as_str(), path))?;
        let compiled = core.compile_model(&model, self.device.as_str().into())?;
        let safe_compiled = SafeCompiledModel(Arc::new(compiled));

        info!("Model {} loaded in {:?}", model_type.as_str(), start.elapsed());

        *write_guard = Some(CachedModel {
            compiled: safe_compiled.clone(),
            last_access: Instant::now(),
        });

        Ok(safe_compiled)
    }

    /// Check if a model is loaded
    pub fn is_loaded(&self, model_type: ModelType) -> bool {
        self.slot(model_type).cache.read().is_some()
    }

    /// Get status of all models
    pub fn get_status(&self) -> Vec<(ModelType, bool)> {
        ModelType::ALL
            .iter()
            .map(|&t| (t, self.is_loaded(t)))
            .collect()
    }

    /// Unload a model
    fn unload_model(&self, model_type: ModelType) {
        let mut write_guard = self.slot(model_type).cache.write();
        if write_guard.is_some() {
            info!("Unloading idle model: {}", model_type.as_str());
            *write_guard = None;
        }
    }

    /// Check and unload idle models
    fn cleanup_idle_models(&self) {
        let now = Instant::now();
        for model_type in ModelType::ALL {
            let should_unload = {
                let read_guard = self.slot(model_type).cache.read();
                match *read_guard {
                    Some(ref cached) => now.duration_since(cached.last_access) > self.idle_timeout,
                    None => false,
                }
            };

            if should_unload {
                self.unload_model(model_type);
            }
        }
    }

    /// Start the background cleanup task
    pub async fn start_cleanup_task(self: Arc<Self>) {
        let check_interval = Duration::from_secs(60);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {
                    debug!("Running model cleanup check");
                    self.cleanup_idle_models();
                }
                _ = self.shutdown.notified() => {
                    info!("Model pool cleanup task shutting down");
                    break;
                }
            }
        }
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

impl Drop for ModelPool {
    fn drop(&mut self) {
        self.shutdown.notify_one();
    }
}

/// Build an f32 input tensor of `dims` from `data`
pub(crate) fn f32_tensor(dims: &[usize], data: &[f32]) -> anyhow::Result<Tensor> {
    let expected: usize = dims.iter().product();
    anyhow::ensure!(
        expected == data.len(),
        "tensor shape {:?} needs {} values, got {}",
        dims,
        expected,
        data.len()
    );

    let shape_dims: Vec<i64> = dims.iter().map(|&d| d as i64).collect();
    let shape = Shape::new(&shape_dims)?;
    let mut tensor = Tensor::new(ElementType::F32, &shape)?;

    unsafe {
        let tensor_data = tensor.get_raw_data_mut()?.as_mut_ptr() as *mut f32;
        std::ptr::copy_nonoverlapping(data.as_ptr(), tensor_data, data.len());
    }

    Ok(tensor)
}

/// Read an output tensor as its dimensions and f32 values
pub(crate) fn read_f32(tensor: &Tensor) -> anyhow::Result<(Vec<usize>, Vec<f32>)> {
    let shape = tensor.get_shape()?;
    let dims: Vec<usize> = shape.get_dimensions().iter().map(|&d| d as usize).collect();
    let total_elements: usize = dims.iter().product();

    let data: Vec<f32> = unsafe {
        let ptr = tensor.get_raw_data()?.as_ptr() as *const f32;
        std::slice::from_raw_parts(ptr, total_elements).to_vec()
    };

    Ok((dims, data))
}
