//! Per-table, per-role reconciliation rows.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::counters::ExportedCounters;
use super::roles::{snapshot_baseline, ImporterRole, Role, SnapshotBaseline};
use crate::core::{EventCounter, TableName};
use crate::error::Result;
use crate::state::{DataFileDescriptor, ExportStatsStore, MigrationStatusRecord};

/// Authoritative current row count. Updates never change it.
pub fn final_row_count(
    snapshot_row_count: i64,
    inserts_in: i64,
    inserts_out: i64,
    deletes_in: i64,
    deletes_out: i64,
) -> i64 {
    snapshot_row_count + inserts_in + inserts_out - deletes_in - deletes_out
}

/// What an importing role's own database says about one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportedTableStats {
    /// Rows recorded by snapshot completion markers.
    pub snapshot_rows: i64,
    pub events: EventCounter,
}

/// Reads imported stats of every table from one importing role's database.
#[async_trait]
pub trait ImportedStatsReader: Send + Sync {
    async fn imported_stats(
        &self,
        role: ImporterRole,
        tables: &[TableName],
    ) -> Result<BTreeMap<TableName, ImportedTableStats>>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub table_name: String,
    pub db_type: Role,
    pub snapshot_row_count: i64,
    pub inserts_in: i64,
    pub updates_in: i64,
    pub deletes_in: i64,
    pub inserts_out: i64,
    pub updates_out: i64,
    pub deletes_out: i64,
    pub final_row_count: i64,
}

impl ReportRow {
    fn new(table_name: String, db_type: Role, snapshot_row_count: i64) -> Self {
        Self {
            table_name,
            db_type,
            snapshot_row_count,
            inserts_in: 0,
            updates_in: 0,
            deletes_in: 0,
            inserts_out: 0,
            updates_out: 0,
            deletes_out: 0,
            final_row_count: snapshot_row_count,
        }
    }

    fn set_in(&mut self, c: EventCounter) {
        self.inserts_in = c.inserts;
        self.updates_in = c.updates;
        self.deletes_in = c.deletes;
    }

    fn set_out(&mut self, c: EventCounter) {
        self.inserts_out = c.inserts;
        self.updates_out = c.updates;
        self.deletes_out = c.deletes;
    }

    fn finish(mut self) -> Self {
        self.final_row_count = final_row_count(
            self.snapshot_row_count,
            self.inserts_in,
            self.inserts_out,
            self.deletes_in,
            self.deletes_out,
        );
        self
    }
}

/// A role whose stats could not be read; its rows are left out.
#[derive(Debug, Clone, Serialize)]
pub struct ReportFailure {
    pub role: Role,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveMigrationReport {
    pub rows: Vec<ReportRow>,
    pub failures: Vec<ReportFailure>,
}

impl LiveMigrationReport {
    pub fn row(&self, table: &str, role: Role) -> Option<&ReportRow> {
        self.rows
            .iter()
            .find(|r| r.table_name == table && r.db_type == role)
    }
}

/// Build the reconciliation report for every table of the record.
pub async fn build_report(
    record: &MigrationStatusRecord,
    descriptor: &DataFileDescriptor,
    exported: &dyn ExportStatsStore,
    imported: &dyn ImportedStatsReader,
) -> Result<LiveMigrationReport> {
    let topology = record.topology();
    let exported = ExportedCounters::new(topology, exported);
    let tables = &record.table_list;
    let single_schema = record.single_source_schema();
    let mut report = LiveMigrationReport::default();

    let mut imports: BTreeMap<ImporterRole, BTreeMap<TableName, ImportedTableStats>> =
        BTreeMap::new();
    for leg in topology.legs() {
        match imported.imported_stats(leg.importer, tables).await {
            Ok(stats) => {
                imports.insert(leg.importer, stats);
            }
            Err(e) => {
                warn!(role = %leg.importer, "cannot read imported stats: {}", e);
                report.failures.push(ReportFailure {
                    role: leg.importer.role(),
                    message: e.to_string(),
                });
            }
        }
    }

    for table in tables {
        let name = table.display_name(single_schema);
        for role in topology.report_roles() {
            let inbound = match topology.inbound_for_report_row(role) {
                Some(importer) => match imports.get(&importer) {
                    Some(stats) => Some(stats.get(table).copied().unwrap_or_default()),
                    // Role failed to report; skip its row.
                    None => continue,
                },
                None => None,
            };

            let snapshot = match snapshot_baseline(role) {
                SnapshotBaseline::ExportedSnapshot => descriptor.snapshot_row_count(table),
                SnapshotBaseline::ImportedRows => {
                    inbound.map(|s| s.snapshot_rows).unwrap_or_default()
                }
            };

            let mut row = ReportRow::new(name.clone(), role, snapshot);
            if let Some(stats) = inbound {
                row.set_in(stats.events);
            }
            if let Some(exporter) = topology.exporter_for(role) {
                row.set_out(exported.read(exporter, table).await?.counts);
            }
            report.rows.push(row.finish());
        }
    }

    info!(
        "Reconciliation report: {} rows, {} failed roles",
        report.rows.len(),
        report.failures.len()
    );
    Ok(report)
}
