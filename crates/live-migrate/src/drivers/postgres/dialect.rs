//! PostgreSQL SQL dialect.

use crate::config::EngineKind;
use crate::core::identifier::quote_literal;
use crate::core::{BulkLoadTarget, EngineDialect, IdentityKind, TableName};
use crate::error::{ErrorClass, MigrateError, Result};

/// Largest event batch payload accepted by PostgreSQL-family targets.
pub(crate) const PG_MAX_BATCH_BYTES: usize = 200 * 1024 * 1024;

/// SQLSTATE classes that indicate bad data or a schema mismatch.
const NON_RETRYABLE_CLASSES: &[&str] = &["22", "23", "42", "0A"];

/// PostgreSQL dialect.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    pub fn new() -> Self {
        Self
    }
}

/// `COPY ... FROM STDIN` for a delimited file, with optional trailing options.
pub(crate) fn copy_statement(target: &BulkLoadTarget<'_>, extra_options: &[String]) -> String {
    let mut options = target.args.copy_options();
    options.extend(extra_options.iter().cloned());
    let columns = if target.columns_sql.is_empty() {
        String::new()
    } else {
        format!(" ({})", target.columns_sql.join(", "))
    };
    format!(
        "COPY {}{} FROM STDIN WITH ({})",
        target.table_sql,
        columns,
        options.join(", ")
    )
}

/// PostgreSQL error classification shared with the distributed engine.
pub(crate) fn pg_is_non_retryable(err: &MigrateError) -> bool {
    match err {
        MigrateError::Postgres(e) => match e.code() {
            Some(state) => {
                let code = state.code();
                NON_RETRYABLE_CLASSES.iter().any(|class| code.starts_with(class))
            }
            // Closed connections and I/O failures carry no SQLSTATE.
            None => false,
        },
        MigrateError::Quoting { .. } | MigrateError::Config(_) => true,
        MigrateError::Import { class, .. } | MigrateError::Apply { class, .. } => {
            *class == ErrorClass::NonRetryable
        }
        _ => false,
    }
}

fn schema_list(schema: &str) -> String {
    schema
        .split('|')
        .map(|s| quote_literal(EngineKind::Postgresql, s))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn pg_identity_columns_sql(table: &TableName, kind: IdentityKind) -> String {
    format!(
        "SELECT column_name FROM information_schema.columns \
         WHERE table_schema = {} AND table_name = {} \
         AND is_identity = 'YES' AND identity_generation = {}",
        quote_literal(EngineKind::Postgresql, &table.schema),
        quote_literal(EngineKind::Postgresql, &table.name),
        quote_literal(EngineKind::Postgresql, kind.as_sql())
    )
}

pub(crate) fn pg_unique_key_columns_sql(table: &TableName) -> String {
    format!(
        "SELECT tc.constraint_name, kcu.column_name \
         FROM information_schema.table_constraints tc \
         JOIN information_schema.key_column_usage kcu \
           ON tc.constraint_name = kcu.constraint_name \
          AND tc.table_schema = kcu.table_schema \
          AND tc.table_name = kcu.table_name \
         WHERE tc.table_schema = {} AND tc.table_name = {} AND tc.constraint_type = 'UNIQUE' \
         ORDER BY tc.constraint_name, kcu.ordinal_position",
        quote_literal(EngineKind::Postgresql, &table.schema),
        quote_literal(EngineKind::Postgresql, &table.name)
    )
}

pub(crate) fn pg_invalid_indexes_sql(schema: &str) -> String {
    format!(
        "SELECT ns.nspname || '.' || c.relname \
         FROM pg_catalog.pg_index i \
         JOIN pg_catalog.pg_class c ON c.oid = i.indexrelid \
         JOIN pg_catalog.pg_namespace ns ON ns.oid = c.relnamespace \
         WHERE NOT i.indisvalid AND ns.nspname IN ({})",
        schema_list(schema)
    )
}

impl EngineDialect for PostgresDialect {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgresql
    }

    fn bulk_load_statement(&self, target: &BulkLoadTarget<'_>) -> Result<String> {
        Ok(copy_statement(target, &[]))
    }

    fn is_non_retryable_error(&self, err: &MigrateError) -> bool {
        pg_is_non_retryable(err)
    }

    fn max_batch_size_bytes(&self) -> usize {
        PG_MAX_BATCH_BYTES
    }

    fn restore_sequence_sql(&self, sequence: &str, last_value: i64) -> Result<String> {
        Ok(format!(
            "SELECT pg_catalog.setval({}, {}, true)",
            quote_literal(EngineKind::Postgresql, sequence),
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
