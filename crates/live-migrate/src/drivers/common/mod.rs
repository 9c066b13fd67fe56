//! Utilities shared by the drivers.

pub mod tls;

pub use tls::{SslMode, TlsBuilder};

use crate::error::{MigrateError, Result};

/// First row of a text result as integers; NULL (empty text) reads as zero.
pub(crate) fn parse_i64_row(rows: Vec<Vec<String>>) -> Result<Option<Vec<i64>>> {
    let Some(row) = rows.into_iter().next() else {
        return Ok(None);
    };
    row.iter()
        .map(|v| {
            let v = v.trim();
            if v.is_empty() {
                Ok(0)
            } else {
                v.parse::<i64>()
                    .map_err(|_| MigrateError::State(format!("expected an integer, got {:?}", v)))
            }
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}
