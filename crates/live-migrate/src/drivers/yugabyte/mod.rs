//! YugabyteDB driver.
//!
//! Speaks the PostgreSQL wire protocol and reuses [`PostgresEngine`]; the
//! dialect adds per-chunk commits to COPY and the distributed transaction
//! errors that are safe to retry.

use crate::config::EngineKind;
use crate::core::{BulkLoadTarget, EngineDialect, IdentityKind, TableName};
use crate::drivers::postgres::{
    copy_statement, pg_identity_columns_sql, pg_invalid_indexes_sql, pg_is_non_retryable,
    pg_unique_key_columns_sql, PostgresEngine, PG_MAX_BATCH_BYTES,
};
use crate::core::identifier::quote_literal;
use crate::error::{MigrateError, Result};

/// Distributed-transaction conflicts reported by YugabyteDB that succeed on retry.
const RETRYABLE_MESSAGES: &[&str] = &[
    "Restart read required",
    "Transaction aborted",
    "catalog version mismatch",
    "Try again",
];

/// YugabyteDB target engine.
pub type YugabyteEngine = PostgresEngine<YugabyteDialect>;

#[derive(Debug, Clone, Default)]
pub struct YugabyteDialect;

impl YugabyteDialect {
    pub fn new() -> Self {
        Self
    }
}

fn is_distributed_conflict(err: &MigrateError) -> bool {
    let message = match err {
        MigrateError::Postgres(e) => e
            .as_db_error()
            .map(|db| db.message().to_string())
            .unwrap_or_else(|| e.to_string()),
        other => other.to_string(),
    };
    RETRYABLE_MESSAGES.iter().any(|m| message.contains(m))
}

impl EngineDialect for YugabyteDialect {
    fn kind(&self) -> EngineKind {
        EngineKind::Yugabytedb
    }

    fn bulk_load_statement(&self, target: &BulkLoadTarget<'_>) -> Result<String> {
        let chunking = if target.args.rows_per_transaction > 0 {
            vec![format!(
                "ROWS_PER_TRANSACTION {}",
                target.args.rows_per_transaction
            )]
        } else {
            Vec::new()
        };
        Ok(copy_statement(target, &chunking))
    }

    fn is_non_retryable_error(&self, err: &MigrateError) -> bool {
        !is_distributed_conflict(err) && pg_is_non_retryable(err)
    }

    fn max_batch_size_bytes(&self) -> usize {
        PG_MAX_BATCH_BYTES
    }

    fn restore_sequence_sql(&self, sequence: &str, last_value: i64) -> Result<String> {
        Ok(format!(
            "SELECT pg_catalog.setval({}, {}, true)",
            quote_literal(EngineKind::Yugabytedb, sequence),
            last_value
        ))
    }

    fn identity_columns_sql(&self, table: &TableName, kind: IdentityKind) -> Option<String> {
        Some(pg_identity_columns_sql(table, kind))
    }

    fn identity_generation_sql(
        &self,
        table_sql: &str,
        column_sql: &str,
        kind: IdentityKind,
    ) -> Option<String> {
        Some(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET GENERATED {}",
            table_sql,
            column_sql,
            kind.as_sql()
        ))
    }

    fn unique_key_columns_sql(&self, table: &TableName) -> String {
        pg_unique_key_columns_sql(table)
    }

    fn invalid_indexes_sql(&self, schema: &str) -> Option<String> {
        Some(pg_invalid_indexes_sql(schema))
    }

    fn non_empty_probe_sql(&self, table_sql: &str) -> String {
        format!("SELECT 1 FROM {} LIMIT 1", table_sql)
    }
}
