//! PostgreSQL driver.
//!
//! - [`PostgresDialect`]: SQL strategy for PostgreSQL targets
//! - [`PostgresEngine`]: pooled engine with streaming COPY, reused by YugabyteDB

mod dialect;
mod engine;

pub use dialect::PostgresDialect;
pub use engine::PostgresEngine;

pub(crate) use dialect::{
    copy_statement, pg_identity_columns_sql, pg_invalid_indexes_sql, pg_is_non_retryable,
    pg_unique_key_columns_sql, PG_MAX_BATCH_BYTES,
};
