//! Oracle driver.
//!
//! The dialect (control files, error classification, catalog queries) is
//! always built; the ODBC engine and SQL*Loader runner need the `oracle`
//! feature.

mod control_file;
mod dialect;
#[cfg(feature = "oracle")]
mod engine;
#[cfg(feature = "oracle")]
mod loader;

pub use dialect::OracleDialect;
#[cfg(feature = "oracle")]
pub use engine::OracleEngine;
