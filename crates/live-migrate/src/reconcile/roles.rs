//! Roles, replication legs and the snapshot baseline policy.
//!
//! Which counters apply to which role is decided here from an explicit
//! [`RoleTopology`]; nothing reads a process-wide "current role".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MigrateError;

/// Logical participant in a live migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Source,
    Target,
    FallForward,
    FallBack,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Source => "source",
            Role::Target => "target",
            Role::FallForward => "fall_forward",
            Role::FallBack => "fall_back",
        };
        f.write_str(s)
    }
}

/// Direction of a counter relative to its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Exported,
    Imported,
}

/// Role acting as the data source of a replication leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExporterRole {
    SourceDbExporter,
    /// The primary target re-exporting to a fall-forward replica.
    TargetDbExporterFf,
    /// The primary target re-exporting back to the original source.
    TargetDbExporterFb,
}

impl ExporterRole {
    pub fn role(&self) -> Role {
        match self {
            ExporterRole::SourceDbExporter => Role::Source,
            ExporterRole::TargetDbExporterFf | ExporterRole::TargetDbExporterFb => Role::Target,
        }
    }
}

impl fmt::Display for ExporterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExporterRole::SourceDbExporter => "SOURCE_DB_EXPORTER",
            ExporterRole::TargetDbExporterFf => "TARGET_DB_EXPORTER_FF",
            ExporterRole::TargetDbExporterFb => "TARGET_DB_EXPORTER_FB",
        };
        f.write_str(s)
    }
}

/// Role acting as the destination of a replication leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImporterRole {
    TargetDbImporter,
    FfDbImporter,
    /// Imports into the original source database.
    FbDbImporter,
}

impl ImporterRole {
    pub fn role(&self) -> Role {
        match self {
            ImporterRole::TargetDbImporter => Role::Target,
            ImporterRole::FfDbImporter => Role::FallForward,
            ImporterRole::FbDbImporter => Role::FallBack,
        }
    }
}

impl fmt::Display for ImporterRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImporterRole::TargetDbImporter => "TARGET_DB_IMPORTER",
            ImporterRole::FfDbImporter => "FF_DB_IMPORTER",
            ImporterRole::FbDbImporter => "FB_DB_IMPORTER",
        };
        f.write_str(s)
    }
}

impl FromStr for ImporterRole {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "target" | "target-db-importer" => Ok(ImporterRole::TargetDbImporter),
            "fall-forward" | "ff" | "ff-db-importer" => Ok(ImporterRole::FfDbImporter),
            "fall-back" | "fb" | "fb-db-importer" => Ok(ImporterRole::FbDbImporter),
            other => Err(MigrateError::Config(format!(
                "unknown importer role '{}' (expected target, fall-forward or fall-back)",
                other
            ))),
        }
    }
}

/// One replication leg: who exports, who imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leg {
    pub exporter: ExporterRole,
    pub importer: ImporterRole,
}

/// Where a report row's snapshot baseline comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotBaseline {
    /// Rows the source exporter wrote to the snapshot file.
    ExportedSnapshot,
    /// Rows recorded by completion markers on the role's own database.
    ImportedRows,
}

/// Snapshot baseline per role.
///
/// Importing roles that received the snapshot count what was actually loaded
/// onto them. The source keeps the exported count, and fall-back (which lands
/// on the source database) never overrides it: fall-back only receives change
/// events, not a snapshot.
pub fn snapshot_baseline(role: Role) -> SnapshotBaseline {
    match role {
        Role::Source | Role::FallBack => SnapshotBaseline::ExportedSnapshot,
        Role::Target | Role::FallForward => SnapshotBaseline::ImportedRows,
    }
}

/// Which optional roles are active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleTopology {
    pub fall_forward: bool,
    pub fall_back: bool,
}

impl RoleTopology {
    /// Active replication legs, primary leg first.
    pub fn legs(&self) -> Vec<Leg> {
        let mut legs = vec![Leg {
            exporter: ExporterRole::SourceDbExporter,
            importer: ImporterRole::TargetDbImporter,
        }];
        if self.fall_forward {
            legs.push(Leg {
                exporter: ExporterRole::TargetDbExporterFf,
                importer: ImporterRole::FfDbImporter,
            });
        }
        if self.fall_back {
            legs.push(Leg {
                exporter: ExporterRole::TargetDbExporterFb,
                importer: ImporterRole::FbDbImporter,
            });
        }
        legs
    }

    /// Exporter whose outbound counts are recorded against `role`.
    pub fn exporter_for(&self, role: Role) -> Option<ExporterRole> {
        match role {
            Role::Source => Some(ExporterRole::SourceDbExporter),
            Role::Target if self.fall_forward => Some(ExporterRole::TargetDbExporterFf),
            Role::Target if self.fall_back => Some(ExporterRole::TargetDbExporterFb),
            _ => None,
        }
    }

    /// Importer whose inbound counts are recorded against `role`.
    pub fn importer_for(&self, role: Role) -> Option<ImporterRole> {
        match role {
            Role::Target => Some(ImporterRole::TargetDbImporter),
            Role::FallForward if self.fall_forward => Some(ImporterRole::FfDbImporter),
            Role::FallBack if self.fall_back => Some(ImporterRole::FbDbImporter),
            _ => None,
        }
    }

    pub fn is_active_exporter(&self, exporter: ExporterRole) -> bool {
        self.legs().iter().any(|l| l.exporter == exporter)
    }

    pub fn is_active_importer(&self, importer: ImporterRole) -> bool {
        self.legs().iter().any(|l| l.importer == importer)
    }

    /// Roles that get a report row. Fall-back shares the source database, so its
    /// inbound counts are folded into the source row.
    pub fn report_roles(&self) -> Vec<Role> {
        let mut roles = vec![Role::Source, Role::Target];
        if self.fall_forward {
            roles.push(Role::FallForward);
        }
        roles
    }

    /// Importer feeding the inbound columns of `role`'s report row.
    pub fn inbound_for_report_row(&self, role: Role) -> Option<ImporterRole> {
        match role {
            Role::Source => self.importer_for(Role::FallBack),
            other => self.importer_for(other),
        }
    }
}
