//! # live-migrate
//!
//! Data-movement core of a live database migration.
//!
//! Moves an exported snapshot and a stream of captured change events into one
//! or more importing roles (primary target, optional fall-forward replica,
//! optional fall-back onto the original source) across Oracle, MySQL,
//! PostgreSQL and YugabyteDB:
//!
//! - **Idempotent snapshot import**: every batch commits together with its
//!   completion marker, so a retried batch is never loaded twice
//! - **Exactly-once event application**: ordered per channel, with the
//!   channel's last applied sequence advanced in the same transaction
//! - **Reconciliation**: per table and per role, exported versus imported
//!   counters folded into a final row count
//!
//! ## Example
//!
//! ```rust,no_run
//! use live_migrate::{Config, ImporterRole, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> live_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let orchestrator = Orchestrator::new(config)?;
//!     let summary = orchestrator
//!         .import_snapshot(ImporterRole::TargetDbImporter, None)
//!         .await?;
//!     println!("Imported {} rows", summary.rows_imported());
//!     Ok(())
//! }
//! ```

pub mod apply;
pub mod config;
pub mod core;
pub mod drivers;
pub mod error;
pub mod import;
pub mod orchestrator;
pub mod reconcile;
pub mod state;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use apply::{ApplySummary, EventApplier};
pub use config::{Config, EngineKind, ImportConfig, TargetEngineConfig};
pub use crate::core::{ChangeEvent, EventCounter, TableName, TargetEngine, TargetTx};
pub use drivers::EngineImpl;
pub use error::{MigrateError, Result};
pub use import::{BatchImporter, ImportOutcome};
pub use orchestrator::{HealthCheck, ImportSummary, Orchestrator};
pub use reconcile::{final_row_count, ImporterRole, LiveMigrationReport, Role};
pub use state::{DataFileDescriptor, MigrationStatusRecord};
