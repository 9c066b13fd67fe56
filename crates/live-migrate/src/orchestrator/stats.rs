//! Imported stats read back from each importing role's own database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::with_engine;
use crate::config::ImportConfig;
use crate::core::{run_in_transaction, TableName, TargetEngine};
use crate::drivers::EngineImpl;
use crate::error::Result;
use crate::reconcile::{ImportedStatsReader, ImportedTableStats, ImporterRole};
use crate::state::{ImportStateStore, MigrationStatusRecord, TargetMetadataStore};

/// Snapshot rows and event counters of `tables`, read in one transaction.
///
/// The metadata schema is created first, so a role that never imported
/// anything reads as zero instead of failing.
pub async fn read_imported_stats<E: TargetEngine + ?Sized>(
    engine: &E,
    state: &dyn ImportStateStore,
    migration_uuid: Uuid,
    tables: &[TableName],
) -> Result<BTreeMap<TableName, ImportedTableStats>> {
    run_in_transaction(engine, |mut tx| async move {
        let result: Result<BTreeMap<TableName, ImportedTableStats>> = async {
            state.init_schema(tx.as_mut()).await?;
            let mut stats = BTreeMap::new();
            for table in tables {
                let snapshot_rows = state.imported_row_count(tx.as_mut(), table).await?;
                let events = state
                    .imported_event_counts(tx.as_mut(), migration_uuid, table)
                    .await?;
                stats.insert(
                    table.clone(),
                    ImportedTableStats {
                        snapshot_rows,
                        events,
                    },
                );
            }
            Ok(stats)
        }
        .await;
        (tx, result)
    })
    .await
}

/// Connects to each importing role on demand to read its stats.
pub struct EngineStatsReader<'a> {
    record: &'a MigrationStatusRecord,
    import: &'a ImportConfig,
}

impl<'a> EngineStatsReader<'a> {
    pub fn new(record: &'a MigrationStatusRecord, import: &'a ImportConfig) -> Self {
        Self { record, import }
    }
}

#[async_trait]
impl ImportedStatsReader for EngineStatsReader<'_> {
    async fn imported_stats(
        &self,
        role: ImporterRole,
        tables: &[TableName],
    ) -> Result<BTreeMap<TableName, ImportedTableStats>> {
        let conf = self.record.importer_config(role)?;
        debug!(role = %role, "reading imported stats from {}", conf.describe());
        let engine = EngineImpl::from_config(conf, self.import)?;
        let state = TargetMetadataStore::new(conf.kind);
        let uuid = self.record.migration_uuid;
        let state = &state;
        with_engine(engine, |engine| async move {
            let result = read_imported_stats(&engine, state, uuid, tables).await;
            (engine, result)
        })
        .await
    }
}
