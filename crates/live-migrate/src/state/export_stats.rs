//! File-backed exported-event statistics.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::backend::ExportStatsStore;
use crate::core::{EventCounter, TableName};
use crate::error::{MigrateError, Result};
use crate::reconcile::ExporterRole;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatsEntry {
    exporter_role: ExporterRole,
    table_name: TableName,
    #[serde(flatten)]
    counts: EventCounter,
}

type StatsKey = (ExporterRole, TableName);

/// Exported counts in `metainfo/exported_events_stats.json`.
///
/// Every increment rewrites the file atomically (temp file, then rename).
pub struct FileExportStatsStore {
    path: PathBuf,
    stats: Mutex<BTreeMap<StatsKey, EventCounter>>,
}

impl FileExportStatsStore {
    pub const FILE_NAME: &'static str = "exported_events_stats.json";

    /// Open the store under `metainfo_dir`; a missing file is an empty store.
    pub fn open(metainfo_dir: &Path) -> Result<Self> {
        let path = metainfo_dir.join(Self::FILE_NAME);
        let mut stats = BTreeMap::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let entries: Vec<StatsEntry> = serde_json::from_str(&content)?;
            for e in entries {
                *stats.entry((e.exporter_role, e.table_name)).or_default() += e.counts;
            }
        }
        Ok(Self {
            path,
            stats: Mutex::new(stats),
        })
    }

    async fn persist(&self, stats: &BTreeMap<StatsKey, EventCounter>) -> Result<()> {
        let entries: Vec<StatsEntry> = stats
            .iter()
            .map(|((role, table), counts)| StatsEntry {
                exporter_role: *role,
                table_name: table.clone(),
                counts: *counts,
            })
            .collect();
        let content = serde_json::to_string_pretty(&entries)
            .map_err(|e| MigrateError::State(format!("Failed to serialize export stats: {}", e)))?;

        // Atomic write: write to temp file, then rename
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ExportStatsStore for FileExportStatsStore {
    async fn exported_event_counts(
        &self,
        role: ExporterRole,
        table: &TableName,
    ) -> Result<EventCounter> {
        let stats = self.stats.lock().await;
        Ok(stats
            .get(&(role, table.clone()))
            .copied()
            .unwrap_or_default())
    }

    async fn increment_exported(
        &self,
        role: ExporterRole,
        table: &TableName,
        counts: EventCounter,
    ) -> Result<()> {
        let mut stats = self.stats.lock().await;
        *stats.entry((role, table.clone())).or_default() += counts;
        self.persist(&stats).await
    }
}
