//! SQL*Loader control file generation.

use crate::core::{BulkLoadTarget, SourceColumn};

/// Declared length used for LONG columns. The true maximum cannot be declared.
const LONG_CHAR_LENGTH: u64 = 2_000_000_000;

/// Field clause for one column, chosen from its source type.
pub(crate) fn column_clause(column: &str, source: Option<&SourceColumn>, null_string: &str) -> String {
    let null = null_string.replace('\'', "''");
    let nullif = format!("NULLIF {}='{}'", column, null);
    let Some(source) = source else {
        return format!("{} {}", column, nullif);
    };
    let data_type = source.data_type.to_uppercase();

    if data_type.contains("INTERVAL") {
        format!("{} {} {}", column, data_type, nullif)
    } else if data_type.starts_with("DATE") {
        format!("{} DATE \"DD-MM-YYYY\" {}", column, nullif)
    } else if data_type.starts_with("TIMESTAMP") {
        if data_type.contains("TIME ZONE") {
            format!(
                "{} TIMESTAMP WITH TIME ZONE \"YYYY-MM-DD HH:MI:SS.FF9 AM TZR\" {}",
                column, nullif
            )
        } else {
            format!("{} TIMESTAMP \"DD-MM-YYYY HH:MI:SS.FF9 AM\" {}", column, nullif)
        }
    } else if data_type.contains("CHAR") && source.length.is_some() {
        format!("{} CHAR({}) {}", column, source.length.unwrap_or_default(), nullif)
    } else if data_type == "LONG" {
        format!("{} CHAR({}) {}", column, LONG_CHAR_LENGTH, nullif)
    } else {
        format!("{} {}", column, nullif)
    }
}

/// Control file loading `target.args.file_path` into `target.table_sql`.
pub(crate) fn control_file(target: &BulkLoadTarget<'_>) -> String {
    let args = target.args;
    let path = args.file_path.to_string_lossy().replace('\'', "''");
    let mut out = format!(
        "LOAD DATA\nINFILE '{}'\nAPPEND\nINTO TABLE {}\nREENABLE DISABLED_CONSTRAINTS\nFIELDS CSV WITH EMBEDDED\nTRAILING NULLCOLS",
        path, target.table_sql
    );
    if !target.columns_sql.is_empty() {
        let clauses: Vec<String> = args
            .columns
            .iter()
            .zip(&target.columns_sql)
            .map(|(raw, quoted)| {
                column_clause(quoted, target.source_schema.column(raw), &args.null_string)
            })
            .collect();
        out.push_str("\n(\n");
        out.push_str(&clauses.join(",\n"));
        out.push_str("\n)");
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FileFormat, ImportBatchArgs, TableName, TableSchema};
    use std::path::PathBuf;

    fn col(data_type: &str, length: Option<u32>) -> SourceColumn {
        SourceColumn::new(data_type, length)
    }

    #[test]
    fn test_timestamp_with_time_zone_clause() {
        let clause = column_clause(
            "CREATED_AT",
            Some(&col("TIMESTAMP(6) WITH TIME ZONE", None)),
            "null",
        );
        assert_eq!(
            clause,
            "CREATED_AT TIMESTAMP WITH TIME ZONE \"YYYY-MM-DD HH:MI:SS.FF9 AM TZR\" NULLIF CREATED_AT='null'"
        );
        assert!(clause.contains("TZR"));
    }

    #[test]
    fn test_long_clause() {
        assert_eq!(
            column_clause("NOTES", Some(&col("LONG", None)), "null"),
            "NOTES CHAR(2000000000) NULLIF NOTES='null'"
        );
    }

    #[test]
    fn test_other_clauses() {
        assert_eq!(
            column_clause("D", Some(&col("DATE", None)), "null"),
            "D DATE \"DD-MM-YYYY\" NULLIF D='null'"
        );
        assert_eq!(
            column_clause("T", Some(&col("TIMESTAMP(6)", None)), "null"),
            "T TIMESTAMP \"DD-MM-YYYY HH:MI:SS.FF9 AM\" NULLIF T='null'"
        );
        assert_eq!(
            column_clause("I", Some(&col("INTERVAL DAY(2) TO SECOND(6)", None)), "null"),
            "I INTERVAL DAY(2) TO SECOND(6) NULLIF I='null'"
        );
        assert_eq!(
            column_clause("CODE", Some(&col("VARCHAR2", Some(40))), "null"),
            "CODE CHAR(40) NULLIF CODE='null'"
        );
        // CHAR without a known length falls through to the bare clause.
        assert_eq!(
            column_clause("CODE", Some(&col("CHAR", None)), "null"),
            "CODE NULLIF CODE='null'"
        );
        assert_eq!(column_clause("ID", None, "null"), "ID NULLIF ID='null'");
    }

    #[test]
    fn test_control_file_layout() {
        let args = ImportBatchArgs {
            file_path: PathBuf::from("/export/data/ORDERS_data.csv"),
            table_name: TableName::parse("SALES.ORDERS"),
            columns: vec!["ID".into(), "CREATED_AT".into()],
            file_format: FileFormat::Csv,
            has_header: false,
            delimiter: ",".into(),
            quote_char: Some('"'),
            escape_char: None,
            null_string: "null".into(),
            rows_per_transaction: 0,
        };
        let schema = TableSchema::default()
            .with_column("CREATED_AT", col("TIMESTAMP(6) WITH TIME ZONE", None));
        let target = BulkLoadTarget {
            table_sql: "SALES.ORDERS".into(),
            columns_sql: vec!["ID".into(), "CREATED_AT".into()],
            args: &args,
            source_schema: &schema,
        };
        assert_eq!(
            control_file(&target),
            "LOAD DATA\n\
             INFILE '/export/data/ORDERS_data.csv'\n\
             APPEND\n\
             INTO TABLE SALES.ORDERS\n\
             REENABLE DISABLED_CONSTRAINTS\n\
             FIELDS CSV WITH EMBEDDED\n\
             TRAILING NULLCOLS\n\
             (\n\
             ID NULLIF ID='null',\n\
             CREATED_AT TIMESTAMP WITH TIME ZONE \"YYYY-MM-DD HH:MI:SS.FF9 AM TZR\" NULLIF CREATED_AT='null'\n\
             )\n"
        );
    }
}
