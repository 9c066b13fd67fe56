//! Idempotent snapshot batch import.
//!
//! A batch is loaded and its completion marker written in one target
//! transaction. A batch whose marker already exists is never loaded again, so
//! re-running an interrupted pass is safe.

use tracing::{debug, info};

use crate::core::{
    run_in_transaction, BatchKey, ImportBatchArgs, ImportCompletionMarker, TableSchema,
    TargetEngine, TargetTx,
};
use crate::error::{ErrorClass, MigrateError, Result};
use crate::state::ImportStateStore;

/// Result of importing one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Rows loaded now, or rows recorded by the existing marker.
    pub rows_affected: i64,
    /// True when the batch had been committed by an earlier run.
    pub already_imported: bool,
}

/// Imports snapshot batches into one role's database.
pub struct BatchImporter<'a, E: TargetEngine + ?Sized> {
    engine: &'a E,
    state: &'a dyn ImportStateStore,
}

impl<'a, E: TargetEngine + ?Sized> BatchImporter<'a, E> {
    pub fn new(engine: &'a E, state: &'a dyn ImportStateStore) -> Self {
        Self { engine, state }
    }

    /// Import one batch exactly once.
    ///
    /// Errors from the load are classified with the engine's rules and
    /// returned as [`MigrateError::Import`]; a failed load leaves no marker.
    pub async fn import_batch(
        &self,
        args: &ImportBatchArgs,
        source_schema: &TableSchema,
    ) -> Result<ImportOutcome> {
        let key = args.key();
        let table = args.table_name.qualified();

        if let Some(marker) = self.existing_marker(&key).await? {
            info!(
                "{}: batch {} already imported ({} rows)",
                table, key.file_path, marker.rows_imported
            );
            return Ok(ImportOutcome {
                rows_affected: marker.rows_imported,
                already_imported: true,
            });
        }

        let statement = self.engine.bulk_load_statement(args, source_schema)?;
        if !tokio::fs::try_exists(&args.file_path).await.unwrap_or(false) {
            return Err(MigrateError::import(
                &table,
                ErrorClass::NonRetryable,
                format!("data file {} does not exist", args.file_path.display()),
            ));
        }
        debug!("{}: {}", table, statement);

        let state = self.state;
        run_in_transaction(self.engine, |mut tx| async move {
            let result = load_once(state, tx.as_mut(), &key, &statement, args).await;
            (tx, result)
        })
        .await
        .map_err(|e| self.classify(&table, e))
    }

    async fn existing_marker(&self, key: &BatchKey) -> Result<Option<ImportCompletionMarker>> {
        let state = self.state;
        run_in_transaction(self.engine, |mut tx| async move {
            let result = state.completion_marker(tx.as_mut(), key).await;
            (tx, result)
        })
        .await
    }

    fn classify(&self, table: &str, err: MigrateError) -> MigrateError {
        match err {
            MigrateError::Import { .. } | MigrateError::Quoting { .. } | MigrateError::Cancelled => {
                err
            }
            other => {
                let class = if self.engine.is_non_retryable_error(&other) {
                    ErrorClass::NonRetryable
                } else {
                    ErrorClass::Retryable
                };
                MigrateError::import(table, class, other)
            }
        }
    }
}

async fn load_once(
    state: &dyn ImportStateStore,
    tx: &mut dyn TargetTx,
    key: &BatchKey,
    statement: &str,
    args: &ImportBatchArgs,
) -> Result<ImportOutcome> {
    // A concurrent worker may have committed the same batch since the first check.
    if let Some(marker) = state.completion_marker(tx, key).await? {
        return Ok(ImportOutcome {
            rows_affected: marker.rows_imported,
            already_imported: true,
        });
    }
    let rows = tx.copy_from_file(statement, args).await? as i64;
    state
        .record_completion(
            tx,
            &ImportCompletionMarker {
                key: key.clone(),
                rows_imported: rows,
            },
        )
        .await?;
    info!("{}: imported {} rows from {}", key.table_name, rows, key.file_path);
    Ok(ImportOutcome {
        rows_affected: rows,
        already_imported: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{FileFormat, TableName};
    use crate::testing::{CopyFailure, MemoryImportState, MockEngine};
    use std::path::Path;

    fn args_for(path: &Path) -> ImportBatchArgs {
        ImportBatchArgs {
            file_path: path.to_path_buf(),
            table_name: TableName::parse("public.orders"),
            columns: vec!["id".into(), "amount".into()],
            file_format: FileFormat::Csv,
            has_header: true,
            delimiter: ",".into(),
            quote_char: Some('"'),
            escape_char: None,
            null_string: "\\N".into(),
            rows_per_transaction: 0,
        }
    }

    fn write_csv(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("orders_data.csv");
        std::fs::write(&path, "id,amount\n1,10\n2,20\n3,30\n").unwrap();
        path
    }

    #[tokio::test]
    async fn test_import_batch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let args = args_for(&write_csv(dir.path()));
        let engine = MockEngine::new();
        let state = MemoryImportState::default();
        let importer = BatchImporter::new(&engine, &state);

        let first = importer
            .import_batch(&args, &TableSchema::default())
            .await
            .unwrap();
        assert_eq!(first.rows_affected, 3);
        assert!(!first.already_imported);

        let second = importer
            .import_batch(&args, &TableSchema::default())
            .await
            .unwrap();
        assert_eq!(second.rows_affected, 3);
        assert!(second.already_imported);

        assert_eq!(engine.copies(), 1);
        assert_eq!(state.marker_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_data_is_non_retryable_and_leaves_no_marker() {
        let dir = tempfile::tempdir().unwrap();
        let args = args_for(&write_csv(dir.path()));
        let engine = MockEngine::new();
        engine.fail_copies(Some(CopyFailure::BadData));
        let state = MemoryImportState::default();

        let err = BatchImporter::new(&engine, &state)
            .import_batch(&args, &TableSchema::default())
            .await
            .unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::NonRetryable));
        assert_eq!(state.marker_count(), 0);
        assert_eq!(engine.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retryable_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let args = args_for(&write_csv(dir.path()));
        let engine = MockEngine::new();
        let state = MemoryImportState::default();
        let importer = BatchImporter::new(&engine, &state);

        engine.fail_copies(Some(CopyFailure::Transient));
        let err = importer
            .import_batch(&args, &TableSchema::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        engine.fail_copies(None);
        let outcome = importer
            .import_batch(&args, &TableSchema::default())
            .await
            .unwrap();
        assert!(!outcome.already_imported);
        assert_eq!(engine.copies(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_non_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let args = args_for(&dir.path().join("absent.csv"));
        let engine = MockEngine::new();
        let state = MemoryImportState::default();

        let err = BatchImporter::new(&engine, &state)
            .import_batch(&args, &TableSchema::default())
            .await
            .unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::NonRetryable));
        assert_eq!(engine.copies(), 0);
    }

    #[tokio::test]
    async fn test_distinct_files_of_one_table_each_load() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::new();
        let state = MemoryImportState::default();
        let importer = BatchImporter::new(&engine, &state);

        let first = args_for(&write_csv(dir.path()));
        let second_path = dir.path().join("orders_data.1.csv");
        std::fs::write(&second_path, "id,amount\n4,40\n").unwrap();
        let second = args_for(&second_path);

        importer.import_batch(&first, &TableSchema::default()).await.unwrap();
        let outcome = importer
            .import_batch(&second, &TableSchema::default())
            .await
            .unwrap();
        assert_eq!(outcome.rows_affected, 1);
        assert_eq!(engine.copies(), 2);
    }
}
