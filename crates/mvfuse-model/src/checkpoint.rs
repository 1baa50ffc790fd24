//! Safetensors checkpoints for sub-model parameter stores.
//!
//! A checkpoint is a flat mapping from parameter name to tensor. The ensemble
//! checkpoint stores its three per-view extractors in one file, keyed by the
//! view index prefix (`0.`, `1.`, `2.`).

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use mvfuse_core::{FinetuneError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::PoisonError;

/// A checkpoint read into memory, not yet applied to a model.
pub struct Checkpoint {
    tensors: BTreeMap<String, Tensor>,
    source: String,
}

impl Checkpoint {
    /// Read a safetensors file.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::Checkpoint`] if the file is unreadable, malformed or
    /// uses an unsupported dtype.
    pub fn read(path: &Path, device: &Device) -> Result<Self> {
        let source = path.display().to_string();
        let bytes = std::fs::read(path).map_err(|e| {
            FinetuneError::Checkpoint(format!("Failed to read {source}: {e}"))
        })?;
        let parsed = safetensors::SafeTensors::deserialize(&bytes).map_err(|e| {
            FinetuneError::Checkpoint(format!("Failed to parse safetensors {source}: {e}"))
        })?;

        let mut tensors = BTreeMap::new();
        for (name, view) in parsed.tensors() {
            let dtype = candle_dtype(view.dtype()).ok_or_else(|| {
                FinetuneError::Checkpoint(format!(
                    "Tensor '{name}' in {source} has unsupported dtype {:?}",
                    view.dtype()
                ))
            })?;
            let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)
                .map_err(|e| {
                    FinetuneError::Checkpoint(format!("Failed to build '{name}' from {source}: {e}"))
                })?;
            tensors.insert(name, tensor);
        }

        Ok(Self { tensors, source })
    }

    /// Parameter names stored in the checkpoint.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Copy every parameter of `varmap` whose name starts with `prefix` from
    /// this checkpoint.
    ///
    /// Loading is strict: each selected parameter must be present with the
    /// exact shape, and the checkpoint may not carry extra keys under `prefix`.
    /// Returns the number of parameters restored.
    ///
    /// # Errors
    ///
    /// [`FinetuneError::CheckpointShape`] on a shape difference,
    /// [`FinetuneError::Checkpoint`] on a missing or unexpected key.
    pub fn restore(&self, varmap: &VarMap, prefix: &str) -> Result<usize> {
        let vars = varmap.data().lock().unwrap_or_else(PoisonError::into_inner);

        let mut names: Vec<&String> = vars.keys().filter(|n| n.starts_with(prefix)).collect();
        names.sort();

        for name in &names {
            let var = &vars[*name];
            let tensor = self.tensors.get(*name).ok_or_else(|| {
                FinetuneError::Checkpoint(format!(
                    "Parameter '{name}' missing from {}",
                    self.source
                ))
            })?;
            if tensor.dims() != var.dims() {
                return Err(FinetuneError::CheckpointShape {
                    name: (*name).clone(),
                    expected: var.dims().to_vec(),
                    found: tensor.dims().to_vec(),
                });
            }
            var.set(&tensor.to_dtype(var.dtype())?)?;
        }

        let unexpected: Vec<&str> = self
            .tensors
            .keys()
            .filter(|k| k.starts_with(prefix) && !vars.contains_key(*k))
            .map(String::as_str)
            .collect();
        if !unexpected.is_empty() {
            return Err(FinetuneError::Checkpoint(format!(
                "Unexpected parameters in {}: {}",
                self.source,
                unexpected.join(", ")
            )));
        }

        Ok(names.len())
    }
}

/// Write every parameter of `varmap` to a safetensors file, creating parent
/// directories as needed.
///
/// # Errors
///
/// [`FinetuneError::Checkpoint`] if the file cannot be written.
pub fn save(varmap: &VarMap, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    varmap.save(path).map_err(|e| {
        FinetuneError::Checkpoint(format!("Failed to save {}: {e}", path.display()))
    })
}

fn candle_dtype(dtype: safetensors::Dtype) -> Option<DType> {
    match dtype {
        safetensors::Dtype::F32 => Some(DType::F32),
        safetensors::Dtype::F64 => Some(DType::F64),
        safetensors::Dtype::F16 => Some(DType::F16),
        safetensors::Dtype::BF16 => Some(DType::BF16),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{Init, VarBuilder};

    fn store(shape: (usize, usize)) -> VarMap {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        vb.pp("0")
            .get_with_hints(shape, "w", Init::Const(1.0))
            .unwrap();
        varmap
    }

    #[test]
    fn test_save_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ckpt.safetensors");
        save(&store((2, 3)), &path).unwrap();

        let target = VarMap::new();
        let vb = VarBuilder::from_varmap(&target, DType::F32, &Device::Cpu);
        let w = vb.pp("0").get_with_hints((2, 3), "w", Init::Const(0.0)).unwrap();

        let ckpt = Checkpoint::read(&path, &Device::Cpu).unwrap();
        assert_eq!(ckpt.names().collect::<Vec<_>>(), vec!["0.w"]);
        assert_eq!(ckpt.restore(&target, "0.").unwrap(), 1);
        let values: Vec<f32> = w.flatten_all().unwrap().to_vec1().unwrap();
        assert!(values.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_restore_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save(&store((2, 3)), &path).unwrap();

        let ckpt = Checkpoint::read(&path, &Device::Cpu).unwrap();
        let err = ckpt.restore(&store((3, 3)), "").unwrap_err();
        match err {
            FinetuneError::CheckpointShape {
                name,
                expected,
                found,
            } => {
                assert_eq!(name, "0.w");
                assert_eq!(expected, vec![3, 3]);
                assert_eq!(found, vec![2, 3]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_restore_missing_parameter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save(&store((2, 3)), &path).unwrap();

        let target = VarMap::new();
        let vb = VarBuilder::from_varmap(&target, DType::F32, &Device::Cpu);
        vb.pp("1").get_with_hints((2, 3), "w", Init::Const(0.0)).unwrap();

        let ckpt = Checkpoint::read(&path, &Device::Cpu).unwrap();
        assert!(matches!(
            ckpt.restore(&target, "1."),
            Err(FinetuneError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_restore_rejects_unexpected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        save(&store((2, 3)), &path).unwrap();

        let ckpt = Checkpoint::read(&path, &Device::Cpu).unwrap();
        let err = ckpt.restore(&VarMap::new(), "").unwrap_err();
        assert!(err.to_string().contains("0.w"));
    }

    #[test]
    fn test_read_nonexistent_path_fails() {
        let result = Checkpoint::read(Path::new("/nonexistent/ckpt.safetensors"), &Device::Cpu);
        assert!(matches!(result, Err(FinetuneError::Checkpoint(_))));
    }
}
