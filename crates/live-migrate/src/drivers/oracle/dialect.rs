//! Oracle SQL dialect.

use serde_json::Value;

use super::control_file::control_file;
use crate::config::EngineKind;
use crate::core::identifier::{quote_if_required, quote_literal};
use crate::core::{BulkLoadTarget, EngineDialect, IdentityKind, TableName};
use crate::error::{ErrorClass, MigrateError, Result};

pub(crate) const ORACLE_MAX_BATCH_BYTES: usize = 100 * 1024 * 1024;

/// Server errors caused by the data or the schema.
const NON_RETRYABLE_CODES: &[&str] = &[
    "ORA-00001", // unique constraint violated
    "ORA-00904", // invalid identifier
    "ORA-00942", // table or view does not exist
    "ORA-01400", // cannot insert NULL
    "ORA-01722", // invalid number
    "ORA-01830", // date format picture ends before converting entire input
    "ORA-01843", // not a valid month
    "ORA-01858", // non-numeric character where numeric expected
    "ORA-01861", // literal does not match format string
    "ORA-12899", // value too large for column
];

/// Network failures that make SQL*Loader exit with a hard error code.
const LOADER_NETWORK_CODES: &[&str] = &["ORA-12541", "ORA-03113", "ORA-12170"];

/// SQL*Loader exit codes: EX_FAIL, EX_WARN, EX_FTL.
const LOADER_FAILURE_EXIT_CODES: &[i32] = &[1, 2, 3];

/// Oracle dialect.
#[derive(Debug, Clone, Default)]
pub struct OracleDialect;

impl OracleDialect {
    pub fn new() -> Self {
        Self
    }
}

fn literal(value: &str) -> String {
    quote_literal(EngineKind::Oracle, value)
}

fn owner_list(schema: &str) -> String {
    schema
        .split('|')
        .map(|s| literal(&s.to_uppercase()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_plain_lowercase(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() || first == '_' => chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$' || c == '#'
        }),
        _ => false,
    }
}

impl EngineDialect for OracleDialect {
    fn kind(&self) -> EngineKind {
        EngineKind::Oracle
    }

    /// Unquoted names from case-folding-to-lower engines map onto Oracle's uppercase default.
    fn normalize_identifier(&self, name: &str) -> String {
        if is_plain_lowercase(name) {
            name.to_uppercase()
        } else {
            name.to_string()
        }
    }

    /// The SQL*Loader control file for the batch.
    fn bulk_load_statement(&self, target: &BulkLoadTarget<'_>) -> Result<String> {
        Ok(control_file(target))
    }

    fn is_non_retryable_error(&self, err: &MigrateError) -> bool {
        match err {
            #[cfg(feature = "oracle")]
            MigrateError::Odbc(e) => {
                let message = e.to_string();
                NON_RETRYABLE_CODES.iter().any(|code| message.contains(code))
            }
            MigrateError::BulkLoad {
                exit_code, message, ..
            } => {
                let hard_exit = exit_code.map_or(false, |c| LOADER_FAILURE_EXIT_CODES.contains(&c));
                hard_exit && !LOADER_NETWORK_CODES.iter().any(|code| message.contains(code))
            }
            MigrateError::Quoting { .. } | MigrateError::Config(_) => true,
            MigrateError::Import { class, .. } | MigrateError::Apply { class, .. } => {
                *class == ErrorClass::NonRetryable
            }
            _ => false,
        }
    }

    fn max_batch_size_bytes(&self) -> usize {
        ORACLE_MAX_BATCH_BYTES
    }

    /// Oracle has no boolean column type before 23c; booleans land in NUMBER(1).
    fn render_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => literal(s),
            other => literal(&other.to_string()),
        }
    }

    fn restore_sequence_sql(&self, sequence: &str, last_value: i64) -> Result<String> {
        let seq = TableName::parse(sequence);
        let name = quote_if_required(EngineKind::Oracle, sequence, &self.normalize_identifier(&seq.name))?;
        let seq_sql = if seq.schema.is_empty() {
            name
        } else {
            format!(
                "{}.{}",
                quote_if_required(EngineKind::Oracle, sequence, &self.normalize_identifier(&seq.schema))?,
                name
            )
        };
        Ok(format!(
            "ALTER SEQUENCE {} RESTART START WITH {}",
            seq_sql,
            last_value + 1
        ))
    }

    fn identity_columns_sql(&self, table: &TableName, kind: IdentityKind) -> Option<String> {
        Some(format!(
            "SELECT column_name FROM all_tab_identity_cols \
             WHERE owner = {} AND table_name = {} AND generation_type = {}",
            literal(&table.schema),
            literal(&table.name),
            literal(kind.as_sql())
        ))
    }

    fn identity_generation_sql(
        &self,
        table_sql: &str,
        column_sql: &str,
        kind: IdentityKind,
    ) -> Option<String> {
        Some(format!(
            "ALTER TABLE {} MODIFY {} GENERATED {} AS IDENTITY",
            table_sql,
            column_sql,
            kind.as_sql()
        ))
    }

    fn unique_key_columns_sql(&self, table: &TableName) -> String {
        format!(
            "SELECT c.constraint_name, cc.column_name \
             FROM all_constraints c \
             JOIN all_cons_columns cc \
               ON c.owner = cc.owner AND c.constraint_name = cc.constraint_name \
             WHERE c.owner = {} AND c.table_name = {} AND c.constraint_type = 'U' \
             ORDER BY c.constraint_name, cc.position",
            literal(&table.schema),
            literal(&table.name)
        )
    }

    fn invalid_indexes_sql(&self, schema: &str) -> Option<String> {
        Some(format!(
            "SELECT index_name FROM all_indexes WHERE owner IN ({}) AND status = 'UNUSABLE'",
            owner_list(schema)
        ))
    }

    fn non_empty_probe_sql(&self, table_sql: &str) -> String {
        format!("SELECT 1 FROM {} WHERE ROWNUM = 1", table_sql)
    }
}
