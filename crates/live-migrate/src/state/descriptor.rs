//! Snapshot descriptor: which data file holds each table's snapshot.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::core::{FileFormat, ImportBatchArgs, TableName, TableSchema};
use crate::error::Result;

/// One exported snapshot file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_path: PathBuf,
    pub table_name: TableName,
    #[serde(default)]
    pub file_size: u64,
    /// Rows written to the file by the exporter.
    #[serde(default)]
    pub row_count: i64,
    #[serde(default)]
    pub columns: Vec<String>,
}

/// Format of the exported files plus one entry per exported file.
///
/// A large table may be exported as several files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataFileDescriptor {
    #[serde(default)]
    pub file_format: FileFormat,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default)]
    pub has_header: bool,
    #[serde(default)]
    pub quote_char: Option<char>,
    #[serde(default)]
    pub escape_char: Option<char>,
    #[serde(default)]
    pub null_string: String,
    #[serde(default)]
    pub data_file_list: Vec<FileEntry>,
    /// Source column types per qualified table name.
    #[serde(default)]
    pub table_schemas: HashMap<String, TableSchema>,
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl DataFileDescriptor {
    pub const FILE_NAME: &'static str = "data_file_descriptor.json";

    /// Load the descriptor from `metainfo_dir`. A missing file is an empty descriptor.
    pub fn load(metainfo_dir: &Path) -> Result<Self> {
        let path = metainfo_dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Snapshot files of `table`, in export order.
    pub fn entries<'a>(&'a self, table: &'a TableName) -> impl Iterator<Item = &'a FileEntry> + 'a {
        self.data_file_list
            .iter()
            .filter(move |e| &e.table_name == table)
    }

    /// Exported snapshot row count of `table` over all its files; zero when it has none.
    pub fn snapshot_row_count(&self, table: &TableName) -> i64 {
        self.entries(table).map(|e| e.row_count).sum()
    }

    pub fn table_schema(&self, table: &TableName) -> TableSchema {
        self.table_schemas
            .get(&table.qualified())
            .cloned()
            .unwrap_or_default()
    }

    /// Import batch for one file entry, carrying the descriptor's format settings.
    pub fn batch_args(&self, entry: &FileEntry, rows_per_transaction: u64) -> ImportBatchArgs {
        ImportBatchArgs {
            file_path: entry.file_path.clone(),
            table_name: entry.table_name.clone(),
            columns: entry.columns.clone(),
            file_format: self.file_format,
            has_header: self.has_header,
            delimiter: self.delimiter.clone(),
            quote_char: self.quote_char,
            escape_char: self.escape_char,
            null_string: self.null_string.clone(),
            rows_per_transaction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"{
        "file_format": "csv",
        "delimiter": ",",
        "has_header": true,
        "quote_char": "\"",
        "null_string": "\\N",
        "data_file_list": [
            {"file_path": "/export/data/orders_data.csv", "table_name": "public.orders",
             "file_size": 1024, "row_count": 100, "columns": ["id", "amount"]}
        ],
        "table_schemas": {
            "public.orders": {"amount": {"data_type": "NUMBER"}}
        }
    }"#;

    #[test]
    fn test_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DataFileDescriptor::FILE_NAME), DESCRIPTOR).unwrap();
        let d = DataFileDescriptor::load(dir.path()).unwrap();
        let orders = TableName::parse("public.orders");
        assert_eq!(d.snapshot_row_count(&orders), 100);
        assert!(d.table_schema(&orders).column("amount").is_some());

        let entry = d.entries(&orders).next().unwrap();
        let args = d.batch_args(entry, 500);
        assert!(args.has_header);
        assert_eq!(args.quote_char, Some('"'));
        assert_eq!(args.null_string, "\\N");
        assert_eq!(args.rows_per_transaction, 500);
    }

    #[test]
    fn test_missing_entry_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let d = DataFileDescriptor::load(dir.path()).unwrap();
        let t = TableName::parse("public.absent");
        assert_eq!(d.entries(&t).count(), 0);
        assert_eq!(d.snapshot_row_count(&t), 0);
        assert_eq!(d.table_schema(&t), TableSchema::default());
    }

    #[test]
    fn test_row_count_sums_every_file_of_a_table() {
        let json = r#"{
            "data_file_list": [
                {"file_path": "/e/orders_1.csv", "table_name": "public.orders", "row_count": 3},
                {"file_path": "/e/users.csv", "table_name": "public.users", "row_count": 9},
                {"file_path": "/e/orders_2.csv", "table_name": "public.orders", "row_count": 1}
            ]
        }"#;
        let d: DataFileDescriptor = serde_json::from_str(json).unwrap();
        let orders = TableName::parse("public.orders");
        assert_eq!(d.snapshot_row_count(&orders), 4);
        let files: Vec<_> = d.entries(&orders).map(|e| e.file_path.clone()).collect();
        assert_eq!(
            files,
            vec![PathBuf::from("/e/orders_1.csv"), PathBuf::from("/e/orders_2.csv")]
        );
    }
}
