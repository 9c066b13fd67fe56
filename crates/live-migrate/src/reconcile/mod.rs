//! Role and counter reconciliation.
//!
//! Exported counts are recorded against the role exporting a leg, imported
//! counts against the role receiving it. Per table and role,
//! `final = snapshot + inserts_in + inserts_out - deletes_in - deletes_out`.

mod counters;
mod report;
mod roles;

pub use counters::{ExportedCounters, ImportedCounters, RoleCounter};
pub use report::{
    build_report, final_row_count, ImportedStatsReader, ImportedTableStats, LiveMigrationReport,
    ReportFailure, ReportRow,
};
pub use roles::{
    snapshot_baseline, Direction, ExporterRole, ImporterRole, Leg, Role, RoleTopology,
    SnapshotBaseline,
};
