//! Snapshot import pass: every exported file of the selected tables, loaded by
//! a worker pool bounded by the role's connection limit.

use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::core::{run_in_transaction, TableName, TargetEngine};
use crate::error::{MigrateError, Result, TableFailure};
use crate::import::{BatchImporter, ImportOutcome};
use crate::state::{DataFileDescriptor, FileEntry, ImportStateStore};

/// Base delay between retry attempts; attempt `n` waits `n` times this.
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Outcome of one data file.
#[derive(Debug, Clone, Serialize)]
pub struct FileImportResult {
    pub table: TableName,
    pub file: String,
    pub rows: i64,
    pub already_imported: bool,
}

/// Result of a snapshot import pass.
#[derive(Debug, Default, Serialize)]
pub struct ImportSummary {
    pub files: Vec<FileImportResult>,
    /// Tables in the table list that have no exported file.
    pub tables_without_data: Vec<TableName>,
    #[serde(skip)]
    pub failures: Vec<TableFailure>,
    pub cancelled: bool,
    pub duration_seconds: f64,
}

impl ImportSummary {
    pub fn rows_imported(&self) -> i64 {
        self.files
            .iter()
            .filter(|f| !f.already_imported)
            .map(|f| f.rows)
            .sum()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// Failed tables as one aggregated error.
    pub fn into_result(self) -> Result<Self> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(MigrateError::Tables(self.failures))
        }
    }
}

/// One role's snapshot import.
pub struct SnapshotImport<'a, E: TargetEngine + ?Sized> {
    pub engine: &'a E,
    pub state: &'a dyn ImportStateStore,
    pub descriptor: &'a DataFileDescriptor,
    pub parallel_jobs: usize,
    pub rows_per_transaction: u64,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

fn is_cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
    cancel.as_ref().map(|c| *c.borrow()).unwrap_or(false)
}

impl<'a, E: TargetEngine + ?Sized> SnapshotImport<'a, E> {
    /// Import every file of `tables`. Per-table failures are collected in the summary.
    pub async fn run(
        &self,
        tables: &[TableName],
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ImportSummary> {
        let start = Instant::now();
        let state = self.state;
        run_in_transaction(self.engine, |mut tx| async move {
            let result = state.init_schema(tx.as_mut()).await;
            (tx, result)
        })
        .await?;

        let entries: Vec<&FileEntry> = self
            .descriptor
            .data_file_list
            .iter()
            .filter(|e| tables.contains(&e.table_name))
            .collect();
        let mut summary = ImportSummary {
            tables_without_data: tables
                .iter()
                .filter(|t| !entries.iter().any(|e| &e.table_name == *t))
                .cloned()
                .collect(),
            ..Default::default()
        };
        for table in &summary.tables_without_data {
            info!(table = %table, "no snapshot file; nothing to import");
        }

        let workers = self.parallel_jobs.min(self.engine.max_connections()).max(1);
        info!(
            "Importing {} files for {} tables with {} workers",
            entries.len(),
            tables.len(),
            workers
        );

        let results: Vec<(&FileEntry, Result<ImportOutcome>)> = stream::iter(entries)
            .map(|entry| {
                let cancel = cancel.clone();
                async move { (entry, self.import_file(entry, &cancel).await) }
            })
            .buffer_unordered(workers)
            .collect()
            .await;

        for (entry, result) in results {
            let table = entry.table_name.clone();
            match result {
                Ok(outcome) => summary.files.push(FileImportResult {
                    table,
                    file: entry.file_path.display().to_string(),
                    rows: outcome.rows_affected,
                    already_imported: outcome.already_imported,
                }),
                Err(MigrateError::Cancelled) => summary.cancelled = true,
                Err(e) => {
                    error!(table = %table, "import failed: {}", e);
                    summary.failures.push(TableFailure {
                        table: table.qualified(),
                        error: e,
                    });
                }
            }
        }
        summary.files.sort_by(|a, b| (&a.table, &a.file).cmp(&(&b.table, &b.file)));
        summary.failures.sort_by(|a, b| a.table.cmp(&b.table));
        summary.duration_seconds = start.elapsed().as_secs_f64();

        info!(
            rows = summary.rows_imported(),
            files = summary.files.len(),
            failed = summary.failures.len(),
            "Snapshot import finished in {:.1}s",
            summary.duration_seconds
        );
        Ok(summary)
    }

    /// Import one file, retrying retryable failures with linear backoff.
    async fn import_file(
        &self,
        entry: &FileEntry,
        cancel: &Option<watch::Receiver<bool>>,
    ) -> Result<ImportOutcome> {
        let args = self.descriptor.batch_args(entry, self.rows_per_transaction);
        let schema = self.descriptor.table_schema(&entry.table_name);
        let importer = BatchImporter::new(self.engine, self.state);

        let mut attempt = 0;
        loop {
            if is_cancelled(cancel) {
                return Err(MigrateError::Cancelled);
            }
            match importer.import_batch(&args, &schema).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        table = %entry.table_name,
                        "retryable failure, attempt {}/{}: {}",
                        attempt,
                        self.max_retries,
                        e
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                result => return result,
            }
        }
    }
}
