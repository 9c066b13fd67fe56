//! Snapshot batch descriptors and completion markers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::schema::TableName;

/// On-disk format of a snapshot data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Csv,
    Text,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Text => "text",
        }
    }
}

/// Immutable description of one unit of bulk-load work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBatchArgs {
    pub file_path: PathBuf,
    pub table_name: TableName,
    /// Column order of the file; empty means "all columns, table order".
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub file_format: FileFormat,
    #[serde(default)]
    pub has_header: bool,
    pub delimiter: String,
    #[serde(default)]
    pub quote_char: Option<char>,
    #[serde(default)]
    pub escape_char: Option<char>,
    #[serde(default)]
    pub null_string: String,
    /// Chunking hint; 0 disables mid-stream commits.
    #[serde(default)]
    pub rows_per_transaction: u64,
}

impl ImportBatchArgs {
    /// Idempotency key of this batch.
    pub fn key(&self) -> BatchKey {
        BatchKey {
            file_path: self.file_path.to_string_lossy().into_owned(),
            table_name: self.table_name.clone(),
        }
    }

    /// Delimited-text options of a COPY statement, in the order the server documents them.
    pub fn copy_options(&self) -> Vec<String> {
        let mut options = vec![format!("FORMAT '{}'", self.file_format.as_str())];
        if self.has_header {
            options.push("HEADER".to_string());
        }
        if let Some(delimiter) = self.delimiter.chars().next() {
            options.push(format!("DELIMITER E'{}'", escape_copy_char(delimiter)));
        }
        if let Some(quote) = self.quote_char {
            options.push(format!("QUOTE E'{}'", escape_copy_char(quote)));
        }
        if let Some(escape) = self.escape_char {
            options.push(format!("ESCAPE E'{}'", escape_copy_char(escape)));
        }
        if !self.null_string.is_empty() {
            options.push(format!("NULL '{}'", self.null_string.replace('\'', "''")));
        }
        options
    }
}

/// A character inside an `E'...'` literal: quote and backslash get a backslash prefix.
fn escape_copy_char(c: char) -> String {
    match c {
        '\'' | '\\' => format!("\\{}", c),
        '\t' => "\\t".to_string(),
        other => other.to_string(),
    }
}

/// Identity of a batch: (file path, table).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub file_path: String,
    pub table_name: TableName,
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.file_path, self.table_name)
    }
}

/// Durable proof that a batch was committed to a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCompletionMarker {
    pub key: BatchKey,
    pub rows_imported: i64,
}
