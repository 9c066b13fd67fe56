//! Role-tagged counter operations.
//!
//! Callers never touch the stores directly: inbound counts go through
//! [`ImportedCounters`] on the importing transaction, outbound counts through
//! [`ExportedCounters`], which refuses exporters that are not part of the topology.

use std::collections::BTreeMap;

use tracing::debug;
use uuid::Uuid;

use super::roles::{Direction, ExporterRole, ImporterRole, Role, RoleTopology};
use crate::core::{EventCounter, TableName, TargetTx};
use crate::error::{MigrateError, Result};
use crate::state::{ExportStatsStore, ImportStateStore};

/// Counts of one (table, role, direction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleCounter {
    pub table: TableName,
    pub role: Role,
    pub direction: Direction,
    pub counts: EventCounter,
}

/// Inbound counters of one importing role, stored on its own database.
pub struct ImportedCounters<'a> {
    role: ImporterRole,
    store: &'a dyn ImportStateStore,
}

impl<'a> ImportedCounters<'a> {
    pub fn new(role: ImporterRole, store: &'a dyn ImportStateStore) -> Self {
        Self { role, store }
    }

    pub fn role(&self) -> ImporterRole {
        self.role
    }

    /// Add one applied batch's counts. Must run on the transaction that applied it.
    pub async fn increment(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        channel: usize,
        counts: &BTreeMap<TableName, EventCounter>,
    ) -> Result<()> {
        debug!(
            role = %self.role,
            channel,
            tables = counts.len(),
            "incrementing imported event counters"
        );
        self.store
            .increment_imported_events(tx, migration_uuid, channel, counts)
            .await
    }

    pub async fn read(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        table: &TableName,
    ) -> Result<RoleCounter> {
        Ok(RoleCounter {
            table: table.clone(),
            role: self.role.role(),
            direction: Direction::Imported,
            counts: self
                .store
                .imported_event_counts(tx, migration_uuid, table)
                .await?,
        })
    }
}

/// Outbound counters of the exporting roles active in a topology.
pub struct ExportedCounters<'a> {
    topology: RoleTopology,
    store: &'a dyn ExportStatsStore,
}

impl<'a> ExportedCounters<'a> {
    pub fn new(topology: RoleTopology, store: &'a dyn ExportStatsStore) -> Self {
        Self { topology, store }
    }

    pub async fn increment(
        &self,
        exporter: ExporterRole,
        table: &TableName,
        counts: EventCounter,
    ) -> Result<()> {
        if !self.topology.is_active_exporter(exporter) {
            return Err(MigrateError::State(format!(
                "{} is not an active exporter in this migration",
                exporter
            )));
        }
        self.store.increment_exported(exporter, table, counts).await
    }

    pub async fn read(&self, exporter: ExporterRole, table: &TableName) -> Result<RoleCounter> {
        Ok(RoleCounter {
            table: table.clone(),
            role: exporter.role(),
            direction: Direction::Exported,
            counts: self.store.exported_event_counts(exporter, table).await?,
        })
    }
}
