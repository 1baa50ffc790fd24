//! YAML configuration file loading.

use mvfuse_core::FinetuneConfig;
use std::path::Path;

/// Load a [`FinetuneConfig`] from a YAML file. Omitted keys take defaults.
pub fn load_config(path: &Path) -> anyhow::Result<FinetuneConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e))?;
    let config: FinetuneConfig = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {}", e))?;
    Ok(config)
}

/// Load from `path` when given, otherwise start from defaults.
pub fn resolve_config(path: Option<&Path>) -> anyhow::Result<FinetuneConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(FinetuneConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mvfuse_core::TaskMode;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    /// Helper to write YAML to a temp file and return the path.
    fn write_yaml(yaml: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_load_config_full() {
        let yaml = r#"
random_seed: 7
train_batch_size: 8
eval_batch_size: 2
dataset_root: "/data/adni"
manifest_path: "/data/adni/manifest.csv"
ensemble_checkpoint_path: "/ckpt/ensemble.safetensors"
fusion_checkpoint_path: "/ckpt/fusion.safetensors"
model_checkpoint_dir: "/ckpt/finetuned"
learning_rate: 0.0005
finetune_ensemble: false
finetune_fusion: true
classification: false
hidden_size: 16
train_ratio: 0.5
val_ratio: 0.1
test_ratio: 0.1
max_epochs: 3
patience: 2
volume_shape: [64, 64, 80]
logging:
  level: "debug"
  format: "json"
"#;
        let f = write_yaml(yaml);
        let config = load_config(f.path()).unwrap();
        assert_eq!(config.random_seed, 7);
        assert_eq!(config.train_batch_size, 8);
        assert_eq!(config.eval_batch_size, 2);
        assert_eq!(config.dataset_root, PathBuf::from("/data/adni"));
        assert!(!config.finetune_ensemble);
        assert_eq!(config.task_mode(), TaskMode::Regression);
        assert_eq!(config.hidden_size, 16);
        assert_eq!(config.patience, Some(2));
        assert_eq!(config.volume_shape, vec![64, 64, 80]);
        assert_eq!(config.logging.format, "json");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_config_empty_mapping_uses_defaults() {
        let f = write_yaml("{}\n");
        let config = load_config(f.path()).unwrap();
        assert_eq!(config, FinetuneConfig::default());
    }

    #[test]
    fn test_load_config_nonexistent_file() {
        let result = load_config(Path::new("/nonexistent/mvfuse.yaml"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to read"));
    }

    #[test]
    fn test_load_config_invalid_yaml() {
        let f = write_yaml("hidden_size: [not, a, number]\n");
        let result = load_config(f.path());
        assert!(result.unwrap_err().to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_resolve_without_path() {
        assert_eq!(resolve_config(None).unwrap(), FinetuneConfig::default());
    }
}
