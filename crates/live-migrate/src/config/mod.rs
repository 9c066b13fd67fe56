//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;
pub use validation::validate_engine_config;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_applies_defaults() {
        let config = Config::from_yaml("export_dir: /data/export\n").unwrap();
        assert_eq!(config.metainfo_dir(), Path::new("/data/export/metainfo"));
        assert_eq!(config.import.get_max_retries(), 3);
        assert!(config.import.get_event_channels() >= 1);
    }

    #[test]
    fn test_from_yaml_rejects_invalid_tuning() {
        let yaml = "export_dir: /data/export\nimport:\n  event_channels: 0\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(crate::error::MigrateError::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(err, crate::error::MigrateError::Io(_)));
    }
}
