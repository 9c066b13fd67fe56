//! Table identity and source column metadata.
//!
//! Source column types drive per-column clauses in Oracle control files; every
//! other engine only needs the column order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A possibly schema-qualified table name. Serialized as `schema.table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.table` or a bare `table`.
    pub fn parse(qualified: &str) -> Self {
        match qualified.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("", qualified),
        }
    }

    /// `schema.table`, or just `table` when there is no schema.
    pub fn qualified(&self) -> String {
        if self.schema.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.schema, self.name)
        }
    }

    /// Name shown in reports: the schema is dropped when only one source schema exists.
    pub fn display_name(&self, single_schema: bool) -> String {
        if single_schema {
            self.name.clone()
        } else {
            self.qualified()
        }
    }

    /// Same table under another schema (the schema of the role it lands on).
    pub fn with_schema(&self, schema: &str) -> Self {
        Self::new(schema, self.name.clone())
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

impl From<String> for TableName {
    fn from(s: String) -> Self {
        TableName::parse(&s)
    }
}

impl From<&str> for TableName {
    fn from(s: &str) -> Self {
        TableName::parse(s)
    }
}

impl From<TableName> for String {
    fn from(t: TableName) -> Self {
        t.qualified()
    }
}

/// Source-side type of one exported column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    /// Source type name, e.g. `TIMESTAMP(6) WITH TIME ZONE`, `VARCHAR2`, `LONG`.
    pub data_type: String,
    /// Declared character length, when the type carries one.
    #[serde(default)]
    pub length: Option<u32>,
}

impl SourceColumn {
    pub fn new(data_type: impl Into<String>, length: Option<u32>) -> Self {
        Self {
            data_type: data_type.into(),
            length,
        }
    }
}

/// Column name to source type, for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema {
    pub columns: HashMap<String, SourceColumn>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&SourceColumn> {
        self.columns
            .get(name)
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
    }

    pub fn with_column(mut self, name: impl Into<String>, column: SourceColumn) -> Self {
        self.columns.insert(name.into(), column);
        self
    }
}
