//! Identifier validation and per-engine quoting.
//!
//! SQL identifiers cannot be bound as statement parameters, so every table and
//! column name that ends up in generated SQL (COPY statements, control files,
//! event DML, metadata queries) goes through this module. Names are validated
//! first and quoted with the engine's quote character, doubling any embedded
//! quote characters.
//!
//! [`quote_if_required`] quotes only when the engine would otherwise fold or
//! reject the name: reserved words, mixed case on PostgreSQL, lowercase on
//! Oracle, characters outside the unquoted identifier alphabet.

use crate::config::EngineKind;
use crate::error::{MigrateError, Result};

/// Maximum identifier length (conservative limit across databases).
/// - PostgreSQL: 63 bytes
/// - MySQL: 64 characters
/// - Oracle: 128 bytes (12.2+)
const MAX_IDENTIFIER_LENGTH: usize = 128;

const POSTGRES_RESERVED: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "asymmetric", "both",
    "case", "cast", "check", "collate", "column", "constraint", "create", "current_catalog",
    "current_date", "current_role", "current_time", "current_timestamp", "current_user",
    "default", "deferrable", "desc", "distinct", "do", "else", "end", "except", "false", "fetch",
    "for", "foreign", "from", "grant", "group", "having", "in", "initially", "intersect", "into",
    "lateral", "leading", "limit", "localtime", "localtimestamp", "not", "null", "offset", "on",
    "only", "or", "order", "placing", "primary", "references", "returning", "select",
    "session_user", "some", "symmetric", "table", "then", "to", "trailing", "true", "union",
    "unique", "user", "using", "variadic", "when", "where", "window", "with",
];

const MYSQL_RESERVED: &[&str] = &[
    "add", "all", "alter", "analyze", "and", "as", "asc", "before", "between", "both", "by",
    "call", "cascade", "case", "change", "char", "check", "column", "condition", "constraint",
    "create", "cross", "current_date", "current_time", "current_timestamp", "database",
    "default", "delete", "desc", "describe", "distinct", "div", "drop", "else", "exists",
    "explain", "false", "fetch", "for", "force", "foreign", "from", "fulltext", "grant", "group",
    "groups", "having", "if", "ignore", "in", "index", "inner", "insert", "interval", "into",
    "is", "join", "key", "keys", "kill", "leading", "left", "like", "limit", "lines", "load",
    "lock", "match", "mod", "natural", "not", "null", "of", "on", "option", "or", "order",
    "outer", "partition", "primary", "range", "rank", "read", "references", "regexp", "rename",
    "replace", "require", "restrict", "right", "row", "rows", "schema", "select", "set", "show",
    "table", "then", "to", "trailing", "trigger", "true", "union", "unique", "unlock", "update",
    "usage", "use", "using", "values", "when", "where", "while", "window", "with", "write",
];

const ORACLE_RESERVED: &[&str] = &[
    "ACCESS", "ADD", "ALL", "ALTER", "AND", "ANY", "AS", "ASC", "AUDIT", "BETWEEN", "BY", "CHAR",
    "CHECK", "CLUSTER", "COLUMN", "COMMENT", "COMPRESS", "CONNECT", "CREATE", "CURRENT", "DATE",
    "DECIMAL", "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "EXCLUSIVE", "EXISTS",
    "FILE", "FLOAT", "FOR", "FROM", "GRANT", "GROUP", "HAVING", "IDENTIFIED", "IMMEDIATE", "IN",
    "INCREMENT", "INDEX", "INITIAL", "INSERT", "INTEGER", "INTERSECT", "INTO", "IS", "LEVEL",
    "LIKE", "LOCK", "LONG", "MAXEXTENTS", "MINUS", "MODE", "MODIFY", "NOAUDIT", "NOCOMPRESS",
    "NOT", "NOWAIT", "NULL", "NUMBER", "OF", "OFFLINE", "ON", "ONLINE", "OPTION", "OR", "ORDER",
    "PCTFREE", "PRIOR", "PUBLIC", "RAW", "RENAME", "RESOURCE", "REVOKE", "ROW", "ROWID", "ROWNUM",
    "ROWS", "SELECT", "SESSION", "SET", "SHARE", "SIZE", "SMALLINT", "START", "SUCCESSFUL",
    "SYNONYM", "SYSDATE", "TABLE", "THEN", "TO", "TRIGGER", "UID", "UNION", "UNIQUE", "UPDATE",
    "USER", "VALIDATE", "VALUES", "VARCHAR", "VARCHAR2", "VIEW", "WHENEVER", "WHERE", "WITH",
];

/// Validate an identifier for security issues.
///
/// Rejects empty identifiers, identifiers containing null bytes and
/// identifiers exceeding the maximum length.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MigrateError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier contains null byte (possible injection attempt): {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(MigrateError::Config(format!(
            "SECURITY: Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Quote a PostgreSQL identifier.
pub fn quote_pg(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Quote a MySQL identifier using backticks.
pub fn quote_mysql(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

/// Quote an Oracle identifier. Same rules as PostgreSQL, but quoted names are case-sensitive
/// against an uppercase default.
pub fn quote_oracle(name: &str) -> Result<String> {
    quote_pg(name)
}

/// Qualify a PostgreSQL table name with schema.
pub fn qualify_pg(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_pg(schema)?, quote_pg(table)?))
}

/// Qualify a MySQL table name with schema/database.
pub fn qualify_mysql(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_mysql(schema)?, quote_mysql(table)?))
}

fn quote_char(kind: EngineKind) -> char {
    match kind {
        EngineKind::Mysql => '`',
        _ => '"',
    }
}

fn is_already_quoted(kind: EngineKind, name: &str) -> bool {
    let q = quote_char(kind);
    name.len() >= 2 && name.starts_with(q) && name.ends_with(q)
}

/// True when `name` must be quoted to survive unchanged on `kind`.
pub fn needs_quoting(kind: EngineKind, name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return true;
    };
    match kind {
        EngineKind::Postgresql | EngineKind::Yugabytedb => {
            let plain = (first.is_ascii_lowercase() || first == '_')
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$');
            !plain || POSTGRES_RESERVED.contains(&name)
        }
        EngineKind::Mysql => {
            let plain = name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
                && !name.chars().all(|c| c.is_ascii_digit());
            !plain || MYSQL_RESERVED.contains(&name.to_lowercase().as_str())
        }
        EngineKind::Oracle => {
            let plain = first.is_ascii_uppercase()
                && chars.all(|c| {
                    c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '$' || c == '#'
                });
            !plain || ORACLE_RESERVED.contains(&name)
        }
    }
}

/// Quote `name` for `kind`, always.
pub fn quote(kind: EngineKind, name: &str) -> Result<String> {
    match kind {
        EngineKind::Mysql => quote_mysql(name),
        EngineKind::Oracle => quote_oracle(name),
        EngineKind::Postgresql | EngineKind::Yugabytedb => quote_pg(name),
    }
}

/// Quote `name` for `kind` only where the engine would otherwise fold or reject it.
///
/// Names that arrive already quoted are passed through. Invalid names become
/// [`MigrateError::Quoting`] attributed to `table`.
pub fn quote_if_required(kind: EngineKind, table: &str, name: &str) -> Result<String> {
    if is_already_quoted(kind, name) {
        let inner = &name[1..name.len() - 1];
        return validate_identifier(inner)
            .map(|_| name.to_string())
            .map_err(|e| MigrateError::quoting(table, name, e.to_string()));
    }
    validate_identifier(name).map_err(|e| MigrateError::quoting(table, name, e.to_string()))?;
    if needs_quoting(kind, name) {
        quote(kind, name)
    } else {
        Ok(name.to_string())
    }
}

/// Schema-qualify a table, quoting each part only where required.
pub fn qualify_if_required(kind: EngineKind, schema: &str, table: &str) -> Result<String> {
    let t = quote_if_required(kind, table, table)?;
    if schema.is_empty() {
        return Ok(t);
    }
    Ok(format!("{}.{}", quote_if_required(kind, table, schema)?, t))
}

/// Render a string as a SQL literal for `kind`.
///
/// MySQL treats backslash as an escape inside literals unless `NO_BACKSLASH_ESCAPES`
/// is set, so it is doubled there as well.
pub fn quote_literal(kind: EngineKind, value: &str) -> String {
    let escaped = value.replace('\'', "''");
    match kind {
        EngineKind::Mysql => format!("'{}'", escaped.replace('\\', "\\\\")),
        _ => format!("'{}'", escaped),
    }
}
