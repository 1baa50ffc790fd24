//! Volumetric image loading.
//!
//! Decoding goes through the [`VolumeDecoder`] trait so datasets can be
//! exercised without image files; [`NiftiDecoder`] is the production decoder.

use mvfuse_core::{FinetuneError, Result};
use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Dense row-major volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Volume {
    /// Wrap row-major voxel data.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::ShapeMismatch`] if `data.len()` is not the product of `shape`.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(FinetuneError::ShapeMismatch(format!(
                "volume shape {shape:?} needs {expected} voxels, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[must_use]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    #[must_use]
    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Number of voxels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Turns an image file into a raw volume.
pub trait VolumeDecoder: Send + Sync {
    /// Decode the image at `path`.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::Decode`] if the file is missing or corrupt.
    fn decode(&self, path: &Path) -> Result<Volume>;
}

/// NIfTI-1 decoder (`.nii` and `.nii.gz`).
#[derive(Debug, Clone, Copy, Default)]
pub struct NiftiDecoder;

impl VolumeDecoder for NiftiDecoder {
    fn decode(&self, path: &Path) -> Result<Volume> {
        let decode_err = |reason: String| FinetuneError::Decode {
            path: path.to_path_buf(),
            reason,
        };
        let object = ReaderOptions::new()
            .read_file(path)
            .map_err(|e| decode_err(format!("failed to read NIfTI file: {e}")))?;
        let array = object
            .into_volume()
            .into_ndarray::<f32>()
            .map_err(|e| decode_err(format!("failed to convert voxels: {e}")))?;
        let shape = array.shape().to_vec();
        let data: Vec<f32> = array.iter().copied().collect();
        Volume::new(shape, data).map_err(|e| decode_err(e.to_string()))
    }
}

/// Reshape a volume to `target` by cycling its flattened voxels.
///
/// The row-major voxel sequence is repeated (or truncated) until it fills the
/// target element count. This is a fill, not an interpolation: a 2×2×2 source
/// resized to 3×3×3 repeats its 8 voxels in order.
///
/// # Errors
///
/// [`FinetuneError::ShapeMismatch`] for an empty source volume.
pub fn resize_volume(volume: &Volume, target: &[usize]) -> Result<Volume> {
    if volume.is_empty() {
        return Err(FinetuneError::ShapeMismatch(
            "cannot resize an empty volume".to_string(),
        ));
    }
    if volume.shape() == target {
        return Ok(volume.clone());
    }
    let len: usize = target.iter().product();
    let data: Vec<f32> = volume.data().iter().copied().cycle().take(len).collect();
    Volume::new(target.to_vec(), data)
}

/// Resolves image identifiers to fixed-shape volumes under a root directory.
#[derive(Clone)]
pub struct VolumeSource {
    root: PathBuf,
    extension: String,
    target_shape: Vec<usize>,
    decoder: Arc<dyn VolumeDecoder>,
}

impl std::fmt::Debug for VolumeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeSource")
            .field("root", &self.root)
            .field("extension", &self.extension)
            .field("target_shape", &self.target_shape)
            .finish_non_exhaustive()
    }
}

impl VolumeSource {
    pub fn new(
        root: impl Into<PathBuf>,
        extension: impl Into<String>,
        target_shape: Vec<usize>,
        decoder: Arc<dyn VolumeDecoder>,
    ) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
            target_shape,
            decoder,
        }
    }

    /// NIfTI-backed source.
    pub fn nifti(root: impl Into<PathBuf>, extension: impl Into<String>, target_shape: Vec<usize>) -> Self {
        Self::new(root, extension, target_shape, Arc::new(NiftiDecoder))
    }

    /// File path of an image identifier.
    #[must_use]
    pub fn path_for(&self, image_id: &str) -> PathBuf {
        self.root.join(format!("{image_id}.{}", self.extension))
    }

    /// Shape of every volume this source returns.
    #[must_use]
    pub fn target_shape(&self) -> &[usize] {
        &self.target_shape
    }

    /// Decode and resize one image. Nothing is cached.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::Decode`] if the file is missing, corrupt or empty.
    pub fn load(&self, image_id: &str) -> Result<Volume> {
        let path = self.path_for(image_id);
        let raw = self.decoder.decode(&path)?;
        if raw.is_empty() {
            return Err(FinetuneError::Decode {
                path,
                reason: "volume contains no voxels".to_string(),
            });
        }
        resize_volume(&raw, &self.target_shape)
    }
}
