//! Configuration type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use sysinfo::System;
use tracing::info;

use crate::error::MigrateError;

/// System resources detected at runtime for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        Self {
            total_memory_gb: sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
            cpu_cores: sys.cpus().len(),
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Export directory holding `metainfo/` state files and snapshot data.
    pub export_dir: PathBuf,

    /// Import/apply tuning.
    #[serde(default)]
    pub import: ImportConfig,
}

impl Config {
    /// Apply auto-tuning based on detected system resources.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.import = self.import.with_auto_tuning(&resources);
        self
    }

    /// Directory holding the migration state files.
    pub fn metainfo_dir(&self) -> PathBuf {
        self.export_dir.join("metainfo")
    }
}

/// Target database engine kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Oracle,
    Mysql,
    Postgresql,
    Yugabytedb,
}

impl EngineKind {
    pub fn default_port(&self) -> u16 {
        match self {
            EngineKind::Oracle => 1521,
            EngineKind::Mysql => 3306,
            EngineKind::Postgresql => 5432,
            EngineKind::Yugabytedb => 5433,
        }
    }

    /// Default schema when none is configured.
    pub fn default_schema(&self) -> &'static str {
        match self {
            EngineKind::Postgresql | EngineKind::Yugabytedb => "public",
            EngineKind::Mysql | EngineKind::Oracle => "",
        }
    }

    pub fn is_postgres_family(&self) -> bool {
        matches!(self, EngineKind::Postgresql | EngineKind::Yugabytedb)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::Oracle => "oracle",
            EngineKind::Mysql => "mysql",
            EngineKind::Postgresql => "postgresql",
            EngineKind::Yugabytedb => "yugabytedb",
        };
        f.write_str(name)
    }
}

impl FromStr for EngineKind {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "oracle" | "ora" => Ok(EngineKind::Oracle),
            "mysql" | "mariadb" => Ok(EngineKind::Mysql),
            "postgresql" | "postgres" | "pg" => Ok(EngineKind::Postgresql),
            "yugabytedb" | "yugabyte" | "yb" => Ok(EngineKind::Yugabytedb),
            other => Err(MigrateError::Config(format!(
                "unknown engine type '{}'",
                other
            ))),
        }
    }
}

/// Connection configuration for the database playing one role.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetEngineConfig {
    /// Engine kind ("oracle", "mysql", "postgresql", "yugabytedb").
    #[serde(rename = "type", deserialize_with = "deserialize_engine_kind")]
    pub kind: EngineKind,

    pub host: String,

    /// Port (0 means the engine default).
    #[serde(default)]
    pub port: u16,

    /// Database name (MySQL/PostgreSQL family).
    #[serde(default)]
    pub database: String,

    pub user: String,

    /// Password. Never written back to disk.
    #[serde(default, skip_serializing)]
    pub password: String,

    /// Schema holding the migrated tables. Multiple source schemas are `|` separated.
    #[serde(default)]
    pub schema: String,

    /// SSL mode for PostgreSQL-family connections (default: "prefer").
    #[serde(default = "default_prefer")]
    pub ssl_mode: String,

    /// Oracle service name.
    #[serde(default)]
    pub service_name: Option<String>,

    /// Oracle SID, used when no service name is set.
    #[serde(default)]
    pub sid: Option<String>,

    /// Oracle TNS alias, takes precedence over host/port.
    #[serde(default)]
    pub tns_alias: Option<String>,

    /// Oracle ODBC driver name as registered in odbcinst.ini (default: "Oracle").
    #[serde(default)]
    pub odbc_driver: Option<String>,

    /// Explicit pool bound for this role.
    #[serde(default)]
    pub max_connections: Option<usize>,
}

fn deserialize_engine_kind<'de, D>(deserializer: D) -> Result<EngineKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl fmt::Debug for TargetEngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetEngineConfig")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("ssl_mode", &self.ssl_mode)
            .field("service_name", &self.service_name)
            .field("sid", &self.sid)
            .field("tns_alias", &self.tns_alias)
            .field("odbc_driver", &self.odbc_driver)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl TargetEngineConfig {
    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.kind.default_port()
        } else {
            self.port
        }
    }

    /// Schema tables live in; falls back to the engine default.
    pub fn effective_schema(&self) -> String {
        if self.schema.is_empty() {
            match self.kind {
                EngineKind::Oracle => self.user.to_uppercase(),
                EngineKind::Mysql => self.database.clone(),
                _ => self.kind.default_schema().to_string(),
            }
        } else {
            self.schema.clone()
        }
    }

    /// Number of distinct schemas configured (`a|b|c` counts as three).
    pub fn schema_count(&self) -> usize {
        self.schema.split('|').filter(|s| !s.is_empty()).count()
    }

    /// Human label for logs; never includes credentials.
    pub fn describe(&self) -> String {
        format!(
            "{}://{}@{}:{}/{}",
            self.kind,
            self.user,
            self.host,
            self.effective_port(),
            self.database
        )
    }
}

/// Import and event-application tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportConfig {
    /// Concurrent batch imports per role (default: auto-tuned from CPU cores).
    #[serde(default)]
    pub parallel_jobs: Option<usize>,

    /// Connection pool bound per role (default: parallel_jobs + 2).
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Ordered apply channels for change events (default: 16).
    #[serde(default)]
    pub event_channels: Option<usize>,

    /// Most events applied in one transaction (default: 10000).
    #[serde(default)]
    pub events_per_batch: Option<usize>,

    /// Rows committed per transaction during COPY on engines that support it (default: 20000).
    #[serde(default)]
    pub rows_per_transaction: Option<u64>,

    /// SQL*Loader binary (default: "sqlldr").
    #[serde(default)]
    pub sqlldr_path: Option<String>,

    /// Attempts after a retryable batch failure (default: 3).
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl ImportConfig {
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Batch imports are I/O bound on the target: half the cores, 2-16.
        if self.parallel_jobs.is_none() {
            self.parallel_jobs = Some((resources.cpu_cores / 2).clamp(2, 16));
        }
        self
    }

    pub fn get_parallel_jobs(&self) -> usize {
        self.parallel_jobs.unwrap_or(4)
    }

    pub fn get_max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or_else(|| self.get_parallel_jobs() + 2)
    }

    pub fn get_event_channels(&self) -> usize {
        self.event_channels.unwrap_or(16)
    }

    pub fn get_events_per_batch(&self) -> usize {
        self.events_per_batch.unwrap_or(10_000)
    }

    pub fn get_rows_per_transaction(&self) -> u64 {
        self.rows_per_transaction.unwrap_or(20_000)
    }

    pub fn get_sqlldr_path(&self) -> String {
        self.sqlldr_path.clone().unwrap_or_else(|| "sqlldr".into())
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }
}

fn default_prefer() -> String {
    "prefer".to_string()
}
