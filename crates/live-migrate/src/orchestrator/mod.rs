//! Pass coordinator.
//!
//! Every pass builds one role's engine, initializes it, opens its pool, runs,
//! and finalizes the engine whatever the outcome.

mod snapshot;
mod stats;

pub use snapshot::{FileImportResult, ImportSummary, SnapshotImport};
pub use stats::{read_imported_stats, EngineStatsReader};

use std::collections::BTreeSet;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::apply::{ApplySummary, EventApplier};
use crate::config::{Config, EngineKind};
use crate::core::event::read_event_file;
use crate::core::{
    route_events, run_in_transaction, BatchLimits, ChangeEvent, IdentityKind, TargetEngine,
};
use crate::drivers::EngineImpl;
use crate::error::{MigrateError, Result};
use crate::reconcile::{build_report, ImporterRole, LiveMigrationReport};
use crate::state::{
    DataFileDescriptor, FileExportStatsStore, ImportStateStore, MigrationStatusRecord,
    TargetMetadataStore,
};

use snapshot::RETRY_DELAY;

/// Run `work` on an initialized engine with an open pool, then finalize it.
///
/// `work` takes the engine by value and hands it back with its result.
/// Finalization also runs when initialization or pool setup fails.
pub(crate) async fn with_engine<E, T, F, Fut>(mut engine: E, work: F) -> Result<T>
where
    E: TargetEngine,
    F: FnOnce(E) -> Fut,
    Fut: Future<Output = (E, Result<T>)>,
{
    let started = match engine.init().await {
        Ok(()) => engine.open_pool().await,
        Err(e) => Err(e),
    };
    if let Err(e) = started {
        engine.finalize().await;
        return Err(e);
    }
    let (mut engine, result) = work(engine).await;
    engine.finalize().await;
    result
}

/// What `health-check` found for one role.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub role: ImporterRole,
    pub kind: EngineKind,
    pub version: Option<String>,
    pub max_connections: usize,
    pub checked_at: DateTime<Utc>,
}

/// Runs import, apply, report and health passes for one migration.
pub struct Orchestrator {
    config: Config,
    record: MigrationStatusRecord,
    descriptor: DataFileDescriptor,
    retry_delay: Duration,
}

impl Orchestrator {
    /// Load the migration state from the configured export directory.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let metainfo = config.metainfo_dir();
        let record = MigrationStatusRecord::load(&metainfo)?;
        let descriptor = DataFileDescriptor::load(&metainfo)?;
        info!(
            migration = %record.migration_uuid,
            tables = record.table_list.len(),
            "Loaded migration state from {}",
            metainfo.display()
        );
        Ok(Self::from_parts(config, record, descriptor))
    }

    pub fn from_parts(
        config: Config,
        record: MigrationStatusRecord,
        descriptor: DataFileDescriptor,
    ) -> Self {
        Self {
            config,
            record,
            descriptor,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Base delay between retries of retryable failures.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn record(&self) -> &MigrationStatusRecord {
        &self.record
    }

    fn engine_for(&self, role: ImporterRole) -> Result<(EngineImpl, TargetMetadataStore)> {
        let conf = self.record.importer_config(role)?;
        let engine = EngineImpl::from_config(conf, &self.config.import)?;
        Ok((engine, TargetMetadataStore::new(conf.kind)))
    }

    fn ensure_active(&self, role: ImporterRole) -> Result<()> {
        if self.record.topology().is_active_importer(role) {
            Ok(())
        } else {
            Err(MigrateError::Config(format!(
                "role {} is not enabled for migration {}",
                role, self.record.migration_uuid
            )))
        }
    }

    /// Import every snapshot file of the table list into `role`'s database.
    pub async fn import_snapshot(
        &self,
        role: ImporterRole,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ImportSummary> {
        self.ensure_snapshot_role(role)?;
        let (engine, state) = self.engine_for(role)?;
        info!(role = %role, "Starting snapshot import");
        let state = &state;
        with_engine(engine, |engine| async move {
            let result = self.import_snapshot_on(&engine, state, cancel).await;
            (engine, result)
        })
        .await
    }

    fn ensure_snapshot_role(&self, role: ImporterRole) -> Result<()> {
        self.ensure_active(role)?;
        if role == ImporterRole::FbDbImporter {
            return Err(MigrateError::Config(
                "the fall-back database already holds the snapshot; it only receives change events"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Snapshot import on an already started engine.
    ///
    /// GENERATED ALWAYS identity columns accept imported values for the
    /// duration of the load and are switched back afterwards.
    pub async fn import_snapshot_on<E: TargetEngine + ?Sized>(
        &self,
        engine: &E,
        state: &dyn ImportStateStore,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ImportSummary> {
        let tables = &self.record.table_list;
        let lookup = engine
            .identity_columns_by_table(tables, IdentityKind::Always)
            .await;
        for failure in &lookup.failures {
            warn!(
                table = %failure.object,
                "could not list identity columns, loading without switching them: {}",
                failure.error
            );
        }
        let always = lookup.found;
        if !always.is_empty() {
            let switched = engine.disable_generated_always_identity(&always).await?;
            if !switched.is_clean() {
                warn!(
                    "{} identity columns still reject imported values",
                    switched.failures.len()
                );
            }
        }

        let pass = SnapshotImport {
            engine,
            state,
            descriptor: &self.descriptor,
            parallel_jobs: self.config.import.get_parallel_jobs(),
            rows_per_transaction: self.config.import.get_rows_per_transaction(),
            max_retries: self.config.import.get_max_retries(),
            retry_delay: self.retry_delay,
        };
        let summary = pass.run(tables, cancel).await;

        if !always.is_empty() {
            let restored = engine.enable_generated_always_identity(&always).await?;
            if !restored.is_clean() {
                warn!(
                    "{} identity columns could not be switched back to GENERATED ALWAYS",
                    restored.failures.len()
                );
            }
        }
        let summary = summary?;

        let invalid = engine.invalid_indexes().await.unwrap_or_else(|e| {
            warn!("Could not list invalid indexes: {}", e);
            BTreeSet::new()
        });
        for index in &invalid {
            warn!(index = %index, "index is invalid after the snapshot load");
        }
        Ok(summary)
    }

    /// Apply the change events of `file` to `role`'s database.
    pub async fn apply_events(
        &self,
        role: ImporterRole,
        file: &Path,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ApplySummary> {
        self.ensure_active(role)?;
        let events = read_event_file(file).await?;
        info!(role = %role, events = events.len(), "Applying events from {}", file.display());
        let (engine, state) = self.engine_for(role)?;
        let state = &state;
        with_engine(engine, |engine| async move {
            let result = self
                .apply_events_on(&engine, state, role, events, cancel)
                .await;
            (engine, result)
        })
        .await
    }

    /// Route `events` into channels and apply them on an already started engine.
    ///
    /// Channels that stop on a retryable error are replayed; batches they had
    /// already committed are skipped by their recorded sequence.
    pub async fn apply_events_on<E: TargetEngine + ?Sized>(
        &self,
        engine: &E,
        state: &dyn ImportStateStore,
        role: ImporterRole,
        events: Vec<ChangeEvent>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ApplySummary> {
        run_in_transaction(engine, |mut tx| async move {
            let result = state.init_schema(tx.as_mut()).await;
            (tx, result)
        })
        .await?;

        let limits = BatchLimits {
            max_events: self.config.import.get_events_per_batch(),
            max_bytes: engine.max_batch_size_bytes(),
        };
        let batches = route_events(
            self.record.migration_uuid,
            events,
            self.config.import.get_event_channels(),
            limits,
        );
        let applier = EventApplier::new(engine, state, role);
        let max_retries = self.config.import.get_max_retries();

        let mut summary = applier.apply_batches(batches.clone(), cancel.clone()).await;
        let mut attempt = 0;
        while summary.failures_retryable() && !summary.cancelled && attempt < max_retries {
            attempt += 1;
            let failed: BTreeSet<usize> = summary.failures.iter().map(|f| f.channel).collect();
            warn!(
                role = %role,
                "retrying {} channels, attempt {}/{}",
                failed.len(),
                attempt,
                max_retries
            );
            tokio::time::sleep(self.retry_delay * attempt).await;
            let retry: Vec<_> = batches
                .iter()
                .filter(|b| failed.contains(&b.channel))
                .cloned()
                .collect();
            summary.merge_retry(applier.apply_batches(retry, cancel.clone()).await);
        }

        info!(
            role = %role,
            applied = summary.batches_applied,
            skipped = summary.batches_skipped,
            failed = summary.failures.len(),
            "Event apply finished"
        );
        Ok(summary)
    }

    /// Drop `role`'s channel sequences and imported event counters for this migration.
    ///
    /// The next apply pass starts every channel from the beginning. Snapshot
    /// completion markers are kept.
    pub async fn clear_event_state(&self, role: ImporterRole) -> Result<()> {
        self.ensure_active(role)?;
        let (engine, state) = self.engine_for(role)?;
        let state = &state;
        with_engine(engine, |engine| async move {
            let result = self.clear_event_state_on(&engine, state).await;
            (engine, result)
        })
        .await?;
        info!(role = %role, migration = %self.record.migration_uuid, "Cleared event state");
        Ok(())
    }

    pub async fn clear_event_state_on<E: TargetEngine + ?Sized>(
        &self,
        engine: &E,
        state: &dyn ImportStateStore,
    ) -> Result<()> {
        let uuid = self.record.migration_uuid;
        run_in_transaction(engine, |mut tx| async move {
            let result = match state.init_schema(tx.as_mut()).await {
                Ok(()) => state.clear_migration_state(tx.as_mut(), uuid).await,
                Err(e) => Err(e),
            };
            (tx, result)
        })
        .await
    }

    /// Reconciliation report over every active role.
    pub async fn report(&self) -> Result<LiveMigrationReport> {
        let exported = FileExportStatsStore::open(&self.config.metainfo_dir())?;
        let imported = EngineStatsReader::new(&self.record, &self.config.import);
        build_report(&self.record, &self.descriptor, &exported, &imported).await
    }

    /// Start `role`'s engine, report what it found, and shut it down.
    pub async fn health_check(&self, role: ImporterRole) -> Result<HealthCheck> {
        self.ensure_active(role)?;
        let (engine, _) = self.engine_for(role)?;
        with_engine(engine, |engine| async move {
            let check = HealthCheck {
                role,
                kind: engine.kind(),
                version: engine.version().map(str::to_string),
                max_connections: engine.max_connections(),
                checked_at: Utc::now(),
            };
            info!(role = %role, version = ?check.version, "Health check passed");
            (engine, Ok(check))
        })
        .await
    }
}
