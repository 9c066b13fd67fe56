//! Migration state: the status record, snapshot descriptor and bookkeeping stores.

mod backend;
mod db;
mod descriptor;
mod export_stats;

pub use backend::{ExportStatsStore, ImportStateStore};
pub use db::{TargetMetadataStore, METADATA_SCHEMA};
pub use descriptor::{DataFileDescriptor, FileEntry};
pub use export_stats::FileExportStatsStore;

use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::config::{validate_engine_config, TargetEngineConfig};
use crate::core::TableName;
use crate::error::{MigrateError, Result};
use crate::reconcile::{ImporterRole, RoleTopology};

/// Which roles are active, how to reach each one, and which tables are migrated.
///
/// Read once per pass; never mutated by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatusRecord {
    pub migration_uuid: Uuid,
    #[serde(default)]
    pub fall_forward_enabled: bool,
    #[serde(default)]
    pub fall_back_enabled: bool,
    pub source_db: TargetEngineConfig,
    #[serde(default)]
    pub target_db: Option<TargetEngineConfig>,
    #[serde(default)]
    pub fall_forward_db: Option<TargetEngineConfig>,
    /// The original source, reached as an import target for fall-back.
    #[serde(default)]
    pub source_db_as_target: Option<TargetEngineConfig>,
    #[serde(default)]
    pub table_list: Vec<TableName>,
}

impl MigrationStatusRecord {
    pub const FILE_NAME: &'static str = "migration_status.json";

    /// Load the record from `metainfo_dir`.
    pub fn load(metainfo_dir: &Path) -> Result<Self> {
        let path = metainfo_dir.join(Self::FILE_NAME);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            MigrateError::State(format!(
                "cannot read migration status {}: {}",
                path.display(),
                e
            ))
        })?;
        let record: Self = serde_json::from_str(&content)?;
        if record.fall_forward_enabled && record.fall_back_enabled {
            return Err(MigrateError::State(
                "fall-forward and fall-back cannot both be enabled".into(),
            ));
        }
        Ok(record)
    }

    pub fn topology(&self) -> RoleTopology {
        RoleTopology {
            fall_forward: self.fall_forward_enabled,
            fall_back: self.fall_back_enabled,
        }
    }

    /// True when the source has a single schema, so report names drop it.
    pub fn single_source_schema(&self) -> bool {
        self.source_db.schema_count() <= 1
    }

    /// Connection config of the database `role` imports into, validated.
    pub fn importer_config(&self, role: ImporterRole) -> Result<&TargetEngineConfig> {
        let (label, conf) = match role {
            ImporterRole::TargetDbImporter => ("target_db", self.target_db.as_ref()),
            ImporterRole::FfDbImporter => ("fall_forward_db", self.fall_forward_db.as_ref()),
            ImporterRole::FbDbImporter => ("source_db_as_target", self.source_db_as_target.as_ref()),
        };
        let conf = conf.ok_or_else(|| {
            MigrateError::Config(format!("{} is not configured for role {}", label, role))
        })?;
        validate_engine_config(label, conf)?;
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = r#"{
        "migration_uuid": "6f1c1f3e-4a11-4c3e-9a59-2a0c4d1b2f10",
        "fall_forward_enabled": true,
        "source_db": {"type": "oracle", "host": "src", "user": "scott", "schema": "SALES", "service_name": "ORCL"},
        "target_db": {"type": "yugabytedb", "host": "yb", "database": "app", "user": "yugabyte"},
        "fall_forward_db": {"type": "oracle", "host": "ff", "user": "scott", "service_name": "ORCL"},
        "table_list": ["SALES.ORDERS", "SALES.CUSTOMERS"]
    }"#;

    #[test]
    fn test_load_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MigrationStatusRecord::FILE_NAME), RECORD).unwrap();
        let record = MigrationStatusRecord::load(dir.path()).unwrap();
        assert!(record.topology().fall_forward);
        assert!(!record.topology().fall_back);
        assert!(record.single_source_schema());
        assert_eq!(record.table_list[0], TableName::new("SALES", "ORDERS"));
        assert_eq!(
            record
                .importer_config(ImporterRole::TargetDbImporter)
                .unwrap()
                .effective_port(),
            5433
        );
        assert!(record.importer_config(ImporterRole::FbDbImporter).is_err());
    }

    #[test]
    fn test_missing_record_is_state_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            MigrationStatusRecord::load(dir.path()),
            Err(MigrateError::State(_))
        ));
    }

    #[test]
    fn test_both_directions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let both = RECORD.replace(
            "\"fall_forward_enabled\": true",
            "\"fall_forward_enabled\": true, \"fall_back_enabled\": true",
        );
        std::fs::write(dir.path().join(MigrationStatusRecord::FILE_NAME), both).unwrap();
        assert!(MigrationStatusRecord::load(dir.path()).is_err());
    }
}
