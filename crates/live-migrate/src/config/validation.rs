//! Configuration validation.

use super::{Config, EngineKind, TargetEngineConfig};
use crate::error::{MigrateError, Result};

const SSL_MODES: &[&str] = &["disable", "prefer", "require", "verify-ca", "verify-full"];

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    if config.export_dir.as_os_str().is_empty() {
        return Err(MigrateError::Config("export_dir is required".into()));
    }

    // Only check if explicitly set
    if let Some(0) = config.import.parallel_jobs {
        return Err(MigrateError::Config(
            "import.parallel_jobs must be at least 1".into(),
        ));
    }
    if let Some(0) = config.import.max_connections {
        return Err(MigrateError::Config(
            "import.max_connections must be at least 1".into(),
        ));
    }
    if let Some(0) = config.import.event_channels {
        return Err(MigrateError::Config(
            "import.event_channels must be at least 1".into(),
        ));
    }
    if let Some(0) = config.import.events_per_batch {
        return Err(MigrateError::Config(
            "import.events_per_batch must be at least 1".into(),
        ));
    }
    if let Some(path) = &config.import.sqlldr_path {
        if path.trim().is_empty() {
            return Err(MigrateError::Config(
                "import.sqlldr_path cannot be empty".into(),
            ));
        }
    }

    Ok(())
}

/// Validate the connection configuration of one role before an adapter is built.
pub fn validate_engine_config(role: &str, conf: &TargetEngineConfig) -> Result<()> {
    if conf.user.is_empty() {
        return Err(MigrateError::Config(format!("{}.user is required", role)));
    }
    if conf.kind == EngineKind::Oracle {
        if conf.tns_alias.is_none() && conf.host.is_empty() {
            return Err(MigrateError::Config(format!(
                "{}: host or tns_alias is required",
                role
            )));
        }
        if conf.tns_alias.is_none() && conf.service_name.is_none() && conf.sid.is_none() {
            return Err(MigrateError::Config(format!(
                "{}: one of service_name, sid or tns_alias is required for oracle",
                role
            )));
        }
    } else {
        if conf.host.is_empty() {
            return Err(MigrateError::Config(format!("{}.host is required", role)));
        }
        if conf.database.is_empty() {
            return Err(MigrateError::Config(format!(
                "{}.database is required",
                role
            )));
        }
    }
    if conf.kind.is_postgres_family() && !SSL_MODES.contains(&conf.ssl_mode.as_str()) {
        return Err(MigrateError::Config(format!(
            "{}.ssl_mode must be one of {}, got '{}'",
            role,
            SSL_MODES.join(", "),
            conf.ssl_mode
        )));
    }
    if let Some(0) = conf.max_connections {
        return Err(MigrateError::Config(format!(
            "{}.max_connections must be at least 1",
            role
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(yaml: &str) -> TargetEngineConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_valid_config() {
        let config = Config::from_yaml("export_dir: /tmp/export\n").unwrap();
        assert_eq!(config.import.get_event_channels(), 16);
    }

    #[test]
    fn test_zero_parallel_jobs_rejected() {
        let err = Config::from_yaml("export_dir: /tmp/e\nimport:\n  parallel_jobs: 0\n").unwrap_err();
        assert!(err.to_string().contains("parallel_jobs"));
    }

    #[test]
    fn test_empty_export_dir_rejected() {
        assert!(Config::from_yaml("export_dir: ''\n").is_err());
    }

    #[test]
    fn test_postgres_requires_database() {
        let conf = engine("type: postgresql\nhost: h\nuser: u\n");
        let err = validate_engine_config("target_db", &conf).unwrap_err();
        assert!(err.to_string().contains("target_db.database"));
    }

    #[test]
    fn test_oracle_requires_service() {
        let conf = engine("type: oracle\nhost: h\nuser: u\n");
        assert!(validate_engine_config("fall_forward_db", &conf).is_err());
        let conf = engine("type: oracle\nhost: h\nuser: u\nservice_name: ORCLPDB1\n");
        assert!(validate_engine_config("fall_forward_db", &conf).is_ok());
    }

    #[test]
    fn test_bad_ssl_mode() {
        let conf = engine("type: yb\nhost: h\ndatabase: d\nuser: u\nssl_mode: sometimes\n");
        assert!(validate_engine_config("target_db", &conf).is_err());
    }
}
