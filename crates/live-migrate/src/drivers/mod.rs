//! Target engine drivers.
//!
//! - [`postgres`]: PostgreSQL over tokio-postgres, COPY from a streamed file
//! - [`yugabyte`]: YugabyteDB, the PostgreSQL engine with its own dialect
//! - [`mysql`]: MySQL over mysql_async, `LOAD DATA LOCAL INFILE`
//! - [`oracle`]: Oracle over ODBC, SQL*Loader for snapshot batches
//! - [`common`]: shared utilities (TLS, result parsing)
//!
//! [`EngineImpl`] picks the driver once from the role's connection config.
//! Dispatch is a plain match per method, so callers stay generic over
//! [`TargetEngine`] without boxing.

pub mod common;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod oracle;
pub mod postgres;
pub mod yugabyte;

pub use common::{SslMode, TlsBuilder};
#[cfg(feature = "mysql")]
pub use mysql::{MysqlDialect, MysqlEngine};
pub use oracle::OracleDialect;
#[cfg(feature = "oracle")]
pub use oracle::OracleEngine;
pub use postgres::{PostgresDialect, PostgresEngine};
pub use yugabyte::{YugabyteDialect, YugabyteEngine};

use async_trait::async_trait;

use crate::config::{EngineKind, ImportConfig, TargetEngineConfig};
use crate::core::{EngineDialect, TargetEngine, TargetTx};
use crate::error::{MigrateError, Result};

/// One role's engine, chosen by its configured kind.
pub enum EngineImpl {
    Postgres(PostgresEngine),
    Yugabyte(YugabyteEngine),
    #[cfg(feature = "mysql")]
    Mysql(MysqlEngine),
    #[cfg(feature = "oracle")]
    Oracle(OracleEngine),
}

impl EngineImpl {
    /// Build the engine for `conf`. Does not connect.
    pub fn from_config(conf: &TargetEngineConfig, import: &ImportConfig) -> Result<Self> {
        let max_connections = import.get_max_connections();
        match conf.kind {
            EngineKind::Postgresql => Ok(EngineImpl::Postgres(PostgresEngine::new(
                conf,
                max_connections,
            )?)),
            EngineKind::Yugabytedb => Ok(EngineImpl::Yugabyte(YugabyteEngine::with_dialect(
                conf,
                max_connections,
                YugabyteDialect::new(),
            )?)),
            #[cfg(feature = "mysql")]
            EngineKind::Mysql => Ok(EngineImpl::Mysql(MysqlEngine::new(conf, max_connections)?)),
            #[cfg(feature = "oracle")]
            EngineKind::Oracle => Ok(EngineImpl::Oracle(OracleEngine::new(
                conf,
                max_connections,
                &import.get_sqlldr_path(),
            )?)),
            #[allow(unreachable_patterns)]
            other => Err(MigrateError::Config(format!(
                "{} targets are not supported by this build (enable the '{}' feature)",
                other, other
            ))),
        }
    }
}

macro_rules! dispatch {
    ($self:expr, $engine:ident => $body:expr) => {
        match $self {
            EngineImpl::Postgres($engine) => $body,
            EngineImpl::Yugabyte($engine) => $body,
            #[cfg(feature = "mysql")]
            EngineImpl::Mysql($engine) => $body,
            #[cfg(feature = "oracle")]
            EngineImpl::Oracle($engine) => $body,
        }
    };
}

#[async_trait]
impl TargetEngine for EngineImpl {
    fn dialect(&self) -> &dyn EngineDialect {
        dispatch!(self, e => e.dialect())
    }

    fn target_schema(&self) -> &str {
        dispatch!(self, e => e.target_schema())
    }

    async fn init(&mut self) -> Result<()> {
        dispatch!(self, e => e.init().await)
    }

    async fn open_pool(&mut self) -> Result<()> {
        dispatch!(self, e => e.open_pool().await)
    }

    async fn finalize(&mut self) {
        dispatch!(self, e => e.finalize().await)
    }

    fn version(&self) -> Option<&str> {
        dispatch!(self, e => e.version())
    }

    fn max_connections(&self) -> usize {
        dispatch!(self, e => e.max_connections())
    }

    async fn begin(&self) -> Result<Box<dyn TargetTx>> {
        dispatch!(self, e => e.begin().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(kind: &str) -> TargetEngineConfig {
        serde_json::from_str(&format!(
            r#"{{"type": "{}", "host": "db", "database": "app", "user": "u", "service_name": "ORCL"}}"#,
            kind
        ))
        .unwrap()
    }

    #[test]
    fn test_engine_per_kind() {
        let import = ImportConfig {
            max_connections: Some(5),
            ..Default::default()
        };
        for (raw, kind) in [
            ("postgresql", EngineKind::Postgresql),
            ("yugabytedb", EngineKind::Yugabytedb),
        ] {
            let engine = EngineImpl::from_config(&conf(raw), &import).unwrap();
            assert_eq!(engine.kind(), kind);
            assert_eq!(engine.max_connections(), 5);
        }
    }

    #[cfg(feature = "mysql")]
    #[test]
    fn test_mysql_engine() {
        let engine = EngineImpl::from_config(&conf("mysql"), &ImportConfig::default()).unwrap();
        assert!(matches!(engine, EngineImpl::Mysql(_)));
        assert_eq!(engine.target_schema(), "app");
    }

    #[cfg(feature = "oracle")]
    #[test]
    fn test_oracle_engine() {
        let engine = EngineImpl::from_config(&conf("oracle"), &ImportConfig::default()).unwrap();
        assert!(matches!(engine, EngineImpl::Oracle(_)));
        assert_eq!(engine.target_schema(), "U");
    }

    #[tokio::test]
    async fn test_finalize_without_init() {
        let mut engine =
            EngineImpl::from_config(&conf("yugabytedb"), &ImportConfig::default()).unwrap();
        engine.finalize().await;
        assert!(engine.begin().await.is_err());
    }
}
