//! Narrow persistence interfaces for markers and counters.
//!
//! Two stores back the migration's bookkeeping:
//!
//! - [`ImportStateStore`] lives on each importing role's own database and is only
//!   ever written through the caller's open [`TargetTx`], so a completion marker
//!   or an applied-sequence marker commits atomically with the data it describes.
//! - [`ExportStatsStore`] holds per-exporter event counts outside any target.
//!
//! Absence of a row is a valid zero state in both, never an error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::core::{BatchKey, EventCounter, ImportCompletionMarker, TableName, TargetTx};
use crate::error::Result;
use crate::reconcile::ExporterRole;

/// Import bookkeeping stored on an importing role's database.
#[async_trait]
pub trait ImportStateStore: Send + Sync {
    /// Create the metadata schema and tables. Idempotent.
    async fn init_schema(&self, tx: &mut dyn TargetTx) -> Result<()>;

    async fn completion_marker(
        &self,
        tx: &mut dyn TargetTx,
        key: &BatchKey,
    ) -> Result<Option<ImportCompletionMarker>>;

    /// Write a marker. Fails if one already exists for the key.
    async fn record_completion(
        &self,
        tx: &mut dyn TargetTx,
        marker: &ImportCompletionMarker,
    ) -> Result<()>;

    /// Sum of rows recorded by completion markers for `table`.
    async fn imported_row_count(&self, tx: &mut dyn TargetTx, table: &TableName) -> Result<i64>;

    /// Last event batch sequence applied on `channel`, if any.
    async fn last_applied_sequence(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        channel: usize,
    ) -> Result<Option<i64>>;

    async fn record_applied_sequence(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        channel: usize,
        sequence: i64,
    ) -> Result<()>;

    /// Add `counts` to the imported event counters of each table.
    async fn increment_imported_events(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        channel: usize,
        counts: &BTreeMap<TableName, EventCounter>,
    ) -> Result<()>;

    /// Imported event counters of `table`, summed over channels.
    async fn imported_event_counts(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        table: &TableName,
    ) -> Result<EventCounter>;

    /// Drop the migration's channel markers and event counters.
    async fn clear_migration_state(&self, tx: &mut dyn TargetTx, migration_uuid: Uuid) -> Result<()>;
}

/// Exported event counts, keyed by (exporter role, table).
#[async_trait]
pub trait ExportStatsStore: Send + Sync {
    async fn exported_event_counts(
        &self,
        role: ExporterRole,
        table: &TableName,
    ) -> Result<EventCounter>;

    async fn increment_exported(
        &self,
        role: ExporterRole,
        table: &TableName,
        counts: EventCounter,
    ) -> Result<()>;
}
