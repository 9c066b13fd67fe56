//! MySQL SQL dialect.

use crate::config::EngineKind;
use crate::core::identifier::{quote_literal, quote_mysql};
use crate::core::{BulkLoadTarget, EngineDialect, IdentityKind, TableName};
use crate::error::{ErrorClass, MigrateError, Result};

pub(crate) const MYSQL_MAX_BATCH_BYTES: usize = 64 * 1024 * 1024;

/// Server errors caused by the data or the schema.
const NON_RETRYABLE_CODES: &[u16] = &[1048, 1062, 1064, 1146, 1264, 1292, 1366, 1406, 1452];

/// MySQL dialect.
#[derive(Debug, Clone, Default)]
pub struct MysqlDialect;

impl MysqlDialect {
    pub fn new() -> Self {
        Self
    }
}

fn literal(value: &str) -> String {
    quote_literal(EngineKind::Mysql, value)
}

impl EngineDialect for MysqlDialect {
    fn kind(&self) -> EngineKind {
        EngineKind::Mysql
    }

    fn bulk_load_statement(&self, target: &BulkLoadTarget<'_>) -> Result<String> {
        let args = target.args;
        let mut sql = format!(
            "LOAD DATA LOCAL INFILE {} INTO TABLE {} CHARACTER SET utf8mb4 FIELDS TERMINATED BY {}",
            literal(&args.file_path.to_string_lossy()),
            target.table_sql,
            literal(&args.delimiter)
        );
        if let Some(q) = args.quote_char {
            sql.push_str(&format!(" OPTIONALLY ENCLOSED BY {}", literal(&q.to_string())));
        }
        if let Some(e) = args.escape_char {
            sql.push_str(&format!(" ESCAPED BY {}", literal(&e.to_string())));
        }
        sql.push_str(" LINES TERMINATED BY '\\n'");
        if args.has_header {
            sql.push_str(" IGNORE 1 LINES");
        }
        if target.columns_sql.is_empty() {
            return Ok(sql);
        }

        // MySQL recognises \N natively; any other sentinel needs NULLIF per column.
        if args.null_string.is_empty() || args.null_string == "\\N" {
            sql.push_str(&format!(" ({})", target.columns_sql.join(", ")));
        } else {
            let vars: Vec<String> = (1..=target.columns_sql.len())
                .map(|i| format!("@v{}", i))
                .collect();
            let sets: Vec<String> = target
                .columns_sql
                .iter()
                .zip(&vars)
                .map(|(col, var)| format!("{} = NULLIF({}, {})", col, var, literal(&args.null_string)))
                .collect();
            sql.push_str(&format!(" ({}) SET {}", vars.join(", "), sets.join(", ")));
        }
        Ok(sql)
    }

    fn is_non_retryable_error(&self, err: &MigrateError) -> bool {
        match err {
            MigrateError::Mysql(mysql_async::Error::Server(e)) => {
                NON_RETRYABLE_CODES.contains(&e.code)
            }
            MigrateError::Quoting { .. } | MigrateError::Config(_) => true,
            MigrateError::Import { class, .. } | MigrateError::Apply { class, .. } => {
                *class == ErrorClass::NonRetryable
            }
            // Lock wait timeouts, deadlocks, lost connections and driver I/O.
            _ => false,
        }
    }

    fn max_batch_size_bytes(&self) -> usize {
        MYSQL_MAX_BATCH_BYTES
    }

    /// MySQL has no sequences; `sequence` names the table owning the AUTO_INCREMENT counter.
    fn restore_sequence_sql(&self, sequence: &str, last_value: i64) -> Result<String> {
        let table = TableName::parse(sequence);
        let table_sql = if table.schema.is_empty() {
            quote_mysql(&table.name)?
        } else {
            format!("{}.{}", quote_mysql(&table.schema)?, quote_mysql(&table.name)?)
        };
        Ok(format!(
            "ALTER TABLE {} AUTO_INCREMENT = {}",
            table_sql,
            last_value + 1
        ))
    }

    fn identity_columns_sql(&self, _table: &TableName, _kind: IdentityKind) -> Option<String> {
        None
    }

    fn identity_generation_sql(
        &self,
        _table_sql: &str,
        _column_sql: &str,
        _kind: IdentityKind,
    ) -> Option<String> {
        None
    }

    fn unique_key_columns_sql(&self, table: &TableName) -> String {
        format!(
            "SELECT tc.CONSTRAINT_NAME, kcu.COLUMN_NAME \
             FROM information_schema.TABLE_CONSTRAINTS tc \
             JOIN information_schema.KEY_COLUMN_USAGE kcu \
               ON tc.CONSTRAINT_NAME = kcu.CONSTRAINT_NAME \
              AND tc.TABLE_SCHEMA = kcu.TABLE_SCHEMA \
              AND tc.TABLE_NAME = kcu.TABLE_NAME \
             WHERE tc.TABLE_SCHEMA = {} AND tc.TABLE_NAME = {} AND tc.CONSTRAINT_TYPE = 'UNIQUE' \
             ORDER BY tc.CONSTRAINT_NAME, kcu.ORDINAL_POSITION",
            literal(&table.schema),
            literal(&table.name)
        )
    }

    fn invalid_indexes_sql(&self, _schema: &str) -> Option<String> {
        None
    }

    fn non_empty_probe_sql(&self, table_sql: &str) -> String {
        format!("SELECT 1 FROM {} LIMIT 1", table_sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FileFormat, ImportBatchArgs, TableSchema};
    use std::path::PathBuf;

    fn args(null_string: &str) -> ImportBatchArgs {
        ImportBatchArgs {
            file_path: PathBuf::from("/export/data/orders_data.csv"),
            table_name: TableName::parse("shop.orders"),
            columns: vec!["id".into(), "status".into()],
            file_format: FileFormat::Csv,
            has_header: true,
            delimiter: ",".into(),
            quote_char: Some('"'),
            escape_char: None,
            null_string: null_string.into(),
            rows_per_transaction: 0,
        }
    }

    fn statement(args: &ImportBatchArgs) -> String {
        let schema = TableSchema::default();
        MysqlDialect
            .bulk_load_statement(&BulkLoadTarget {
                table_sql: "shop.orders".into(),
                columns_sql: vec!["id".into(), "`status`".into()],
                args,
                source_schema: &schema,
            })
            .unwrap()
    }

    #[test]
    fn test_load_data_statement() {
        assert_eq!(
            statement(&args("\\N")),
            "LOAD DATA LOCAL INFILE '/export/data/orders_data.csv' INTO TABLE shop.orders \
             CHARACTER SET utf8mb4 FIELDS TERMINATED BY ',' OPTIONALLY ENCLOSED BY '\"' \
             LINES TERMINATED BY '\\n' IGNORE 1 LINES (id, `status`)"
        );
    }

    #[test]
    fn test_custom_null_sentinel_uses_nullif() {
        assert!(statement(&args("null")).ends_with(
            "(@v1, @v2) SET id = NULLIF(@v1, 'null'), `status` = NULLIF(@v2, 'null')"
        ));
    }

    #[test]
    fn test_auto_increment_restore() {
        assert_eq!(
            MysqlDialect.restore_sequence_sql("shop.orders", 41).unwrap(),
            "ALTER TABLE `shop`.`orders` AUTO_INCREMENT = 42"
        );
    }

    #[test]
    fn test_no_identity_fixups() {
        assert!(MysqlDialect
            .identity_columns_sql(&TableName::parse("shop.orders"), IdentityKind::Always)
            .is_none());
    }
}
