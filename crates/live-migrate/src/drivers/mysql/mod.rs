//! MySQL driver.
//!
//! - [`MysqlDialect`]: `LOAD DATA LOCAL INFILE` rendering and server error classification
//! - [`MysqlEngine`]: mysql_async pool with explicit transactions
//!
//! Only available with the `mysql` feature (enabled by default).
//! Supported versions: MySQL 5.7+, 8.0+.

mod dialect;
mod engine;

pub use dialect::MysqlDialect;
pub use engine::MysqlEngine;
