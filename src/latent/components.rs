//! GANSpace principal component library
//!
//! File layout: 8 magic bytes followed by a bincode record with exactly
//! `components`, `mean`, `stdev` and `comp_indices`. When no usable library
//! loads, a deterministic synthetic one stands in so editing keeps working
//! offline.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use nalgebra::DMatrix;
use ndarray::{Array1, Array2, ArrayView1};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ComponentLoadError;
use crate::utils::math::{l2_norm, l2_normalize};

const MAGIC: &[u8; 8] = b"LFCOMP01";

/// Files smaller than this are treated as failed downloads
pub const MIN_FILE_SIZE: u64 = 1000;

/// Rows whose norm drifts further than this from 1 are rejected as corrupt
const NORM_TOLERANCE: f32 = 1e-2;

/// On-disk record
#[derive(Debug, Serialize, Deserialize)]
struct ComponentFile {
    components: Vec<Vec<f32>>,
    mean: Vec<f32>,
    stdev: Vec<f32>,
    comp_indices: Vec<u32>,
}

/// Immutable set of unit-norm principal directions in flattened W+ space
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentLibrary {
    components: Array2<f32>,
    mean: Array1<f32>,
    stdev: Array1<f32>,
    comp_indices: Vec<u32>,
}

impl ComponentLibrary {
    /// Number of principal directions (P)
    pub fn len(&self) -> usize {
        self.components.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.components.nrows() == 0
    }

    /// Length of each direction (L * D)
    pub fn width(&self) -> usize {
        self.components.ncols()
    }

    pub fn direction(&self, index: usize) -> Option<ArrayView1<'_, f32>> {
        (index < self.len()).then(|| self.components.row(index))
    }

    pub fn components(&self) -> &Array2<f32> {
        &self.components
    }

    pub fn mean(&self) -> &Array1<f32> {
        &self.mean
    }

    pub fn stdev(&self) -> &Array1<f32> {
        &self.stdev
    }

    pub fn comp_indices(&self) -> &[u32] {
        &self.comp_indices
    }

    /// Load and validate a component file
    pub fn load(path: &Path) -> Result<Self, ComponentLoadError> {
        if !path.exists() {
            return Err(ComponentLoadError::Missing(path.to_path_buf()));
        }
        let size = fs::metadata(path)?.len();
        if size < MIN_FILE_SIZE {
            return Err(ComponentLoadError::TooSmall { size });
        }

        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ComponentLoadError> {
        if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
            return Err(ComponentLoadError::BadMagic);
        }
        let file: ComponentFile = bincode::deserialize(&bytes[MAGIC.len()..])?;
        Self::from_file(file)
    }

    fn from_file(file: ComponentFile) -> Result<Self, ComponentLoadError> {
        let count = file.components.len();
        if count == 0 {
            return Err(ComponentLoadError::Inconsistent("no components".into()));
        }
        let width = file.components[0].len();
        if width == 0 || file.components.iter().any(|row| row.len() != width) {
            return Err(ComponentLoadError::Inconsistent("ragged component rows".into()));
        }
        if file.mean.len() != width {
            return Err(ComponentLoadError::Inconsistent(format!(
                "mean has {} values, expected {}",
                file.mean.len(),
                width
            )));
        }
        if file.stdev.len() != count || file.comp_indices.len() != count {
            return Err(ComponentLoadError::Inconsistent(format!(
                "stdev/comp_indices length ({}, {}) does not match {} components",
                file.stdev.len(),
                file.comp_indices.len(),
                count
            )));
        }

        let flat: Vec<f32> = file.components.into_iter().flatten().collect();
        let mut components = Array2::from_shape_vec((count, width), flat)
            .map_err(|e| ComponentLoadError::Inconsistent(e.to_string()))?;

        for (i, row) in components.rows_mut().into_iter().enumerate() {
            let norm = l2_norm(row.view());
            if (norm - 1.0).abs() > NORM_TOLERANCE {
                return Err(ComponentLoadError::Inconsistent(format!(
                    "component {} has norm {:.4}",
                    i, norm
                )));
            }
            l2_normalize(row);
        }

        Ok(Self {
            components,
            mean: Array1::from(file.mean),
            stdev: Array1::from(file.stdev),
            comp_indices: file.comp_indices,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ComponentLoadError> {
        let file = ComponentFile {
            components: self.components.rows().into_iter().map(|r| r.to_vec()).collect(),
            mean: self.mean.to_vec(),
            stdev: self.stdev.to_vec(),
            comp_indices: self.comp_indices.clone(),
        };
        let mut bytes = MAGIC.to_vec();
        bytes.extend(bincode::serialize(&file)?);
        Ok(bytes)
    }

    pub fn save(&self, path: &Path) -> Result<(), ComponentLoadError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Deterministic orthonormal library: seeded Gaussian matrix, QR of its
    /// transpose, rows re-normalized explicitly afterwards.
    pub fn synthesize(count: usize, width: usize, seed: u64) -> Self {
        let count = if count > width {
            warn!(
                "Requested {} components but latent width is {}, capping",
                count, width
            );
            width
        } else {
            count
        };

        let start = Instant::now();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        // Orthonormalize the transpose; column i of Q becomes row i
        let random = DMatrix::<f64>::from_fn(width, count, |_, _| rng.sample(StandardNormal));
        let q = random.qr().q();

        let mut components = Array2::<f32>::zeros((count, width));
        for (i, mut row) in components.rows_mut().into_iter().enumerate() {
            let column = q.column(i);
            let norm = column.norm();
            for (dst, src) in row.iter_mut().zip(column.iter()) {
                *dst = (src / norm) as f32;
            }
        }

        debug!(
            "Synthesized {} components of width {} in {:?}",
            count,
            width,
            start.elapsed()
        );

        Self {
            components,
            mean: Array1::zeros(width),
            stdev: Array1::ones(count),
            comp_indices: (0..count as u32).collect(),
        }
    }

    /// Load from `path`, or synthesize a replacement. Never fails: load
    /// errors are logged and recovered. The replacement is written back only
    /// when the file is absent or unreadable as a library; a valid library
    /// of another geometry and unexpected IO errors leave the file alone.
    pub fn load_or_synthesize(path: &Path, width: usize, count: usize, seed: u64) -> Self {
        let persist = match Self::load(path) {
            Ok(library) if library.width() == width => {
                info!(
                    "Loaded {} principal components from {}",
                    library.len(),
                    path.display()
                );
                return library;
            }
            Ok(library) => {
                warn!(
                    "Component library at {} has width {}, generator expects {}",
                    path.display(),
                    library.width(),
                    width
                );
                false
            }
            Err(e) => {
                warn!("Could not load components from {}: {}", path.display(), e);
                is_replaceable(&e)
            }
        };

        info!("Creating synthetic principal components (seed {})", seed);
        let library = Self::synthesize(count, width, seed);
        if persist {
            if let Err(e) = library.save(path) {
                warn!("Failed to persist synthetic components to {}: {}", path.display(), e);
            }
        }
        library
    }
}

/// Failed downloads and undecodable payloads may be overwritten
fn is_replaceable(error: &ComponentLoadError) -> bool {
    matches!(
        error,
        ComponentLoadError::Missing(_)
            | ComponentLoadError::TooSmall { .. }
            | ComponentLoadError::BadMagic
            | ComponentLoadError::Corrupt(_)
    )
}

/// Process-wide, lazily loaded component library
pub struct ComponentStore {
    path: PathBuf,
    width: usize,
    synthetic_count: usize,
    seed: u64,
    library: OnceLock<Arc<ComponentLibrary>>,
}

impl ComponentStore {
    pub fn new(path: impl Into<PathBuf>, width: usize, synthetic_count: usize, seed: u64) -> Self {
        Self {
            path: path.into(),
            width,
            synthetic_count,
            seed,
            library: OnceLock::new(),
        }
    }

    /// Store that is already populated
    pub fn preloaded(library: ComponentLibrary) -> Self {
        let store = Self::new(PathBuf::new(), library.width(), library.len(), 0);
        let _ = store.library.set(Arc::new(library));
        store
    }

    /// Get the library, loading it on first access. Concurrent first callers
    /// block until the single initialization finishes.
    pub fn get(&self) -> Arc<ComponentLibrary> {
        self.library
            .get_or_init(|| {
                Arc::new(ComponentLibrary::load_or_synthesize(
                    &self.path,
                    self.width,
                    self.synthetic_count,
                    self.seed,
                ))
            })
            .clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.library.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_synthetic_rows_are_orthonormal() {
        let library = ComponentLibrary::synthesize(8, 32, 42);
        assert_eq!(library.len(), 8);

        let c = library.components();
        for i in 0..8 {
            assert!((c.row(i).dot(&c.row(i)) - 1.0).abs() < 1e-5);
            for j in (i + 1)..8 {
                assert!(c.row(i).dot(&c.row(j)).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_synthetic_is_reproducible() {
        let a = ComponentLibrary::synthesize(4, 16, 42);
        let b = ComponentLibrary::synthesize(4, 16, 42);
        let c = ComponentLibrary::synthesize(4, 16, 7);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_synthetic_count_is_capped_by_width() {
        let library = ComponentLibrary::synthesize(10, 6, 1);
        assert_eq!(library.len(), 6);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("components.bin");
        let library = ComponentLibrary::synthesize(5, 64, 3);
        library.save(&path).unwrap();

        let loaded = ComponentLibrary::load(&path).unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded.comp_indices(), &[0, 1, 2, 3, 4]);
        assert!((loaded.components() - library.components())
            .iter()
            .all(|d| d.abs() < 1e-6));
    }

    #[test]
    fn test_missing_and_tiny_files_are_errors() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.bin");
        assert!(matches!(
            ComponentLibrary::load(&missing),
            Err(ComponentLoadError::Missing(_))
        ));

        let tiny = dir.path().join("tiny.bin");
        fs::write(&tiny, b"LFCOMP01").unwrap();
        assert!(matches!(
            ComponentLibrary::load(&tiny),
            Err(ComponentLoadError::TooSmall { .. })
        ));
    }

    #[test]
    fn test_corrupt_file_falls_back_to_synthetic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ganspace").join("components.bin");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0xAB; 4096]).unwrap();

        let library = ComponentLibrary::load_or_synthesize(&path, 96, 4, 42);
        assert_eq!(library, ComponentLibrary::synthesize(4, 96, 42));

        // The replacement was persisted and now loads cleanly
        assert_eq!(ComponentLibrary::load(&path).unwrap().len(), 4);
    }

    #[test]
    fn test_wrong_width_library_is_kept_on_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("components.bin");
        let original = ComponentLibrary::synthesize(6, 512, 9);
        original.save(&path).unwrap();

        let library = ComponentLibrary::load_or_synthesize(&path, 256, 4, 42);
        assert_eq!(library, ComponentLibrary::synthesize(4, 256, 42));

        let on_disk = ComponentLibrary::load(&path).unwrap();
        assert_eq!((on_disk.len(), on_disk.width()), (6, 512));
    }

    #[test]
    fn test_missing_file_is_replaced() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("components.bin");
        ComponentLibrary::load_or_synthesize(&path, 32, 3, 42);
        assert_eq!(ComponentLibrary::load(&path).unwrap().len(), 3);
    }

    #[test]
    fn test_concurrent_first_access_loads_once() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ComponentStore::new(dir.path().join("c.bin"), 64, 8, 42));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.get())
            })
            .collect();
        let libraries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(libraries.iter().all(|l| Arc::ptr_eq(l, &libraries[0])));
        assert_eq!(libraries[0].len(), 8);
        assert!(store.is_loaded());
    }

    #[test]
    fn test_store_initializes_once() {
        let dir = tempdir().unwrap();
        let store = ComponentStore::new(dir.path().join("c.bin"), 16, 3, 42);
        assert!(!store.is_loaded());
        let first = store.get();
        let second = store.get();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(store.is_loaded());
    }
}
