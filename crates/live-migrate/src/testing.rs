//! Test doubles: a counting in-memory engine and in-memory stores.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::EngineKind;
use crate::core::{
    BatchKey, BulkLoadTarget, EngineDialect, EventCounter, IdentityKind, ImportBatchArgs,
    ImportCompletionMarker, TableName, TargetEngine, TargetTx,
};
use crate::error::{MigrateError, Result};
use crate::reconcile::{ExporterRole, ImportedStatsReader, ImportedTableStats, ImporterRole};
use crate::state::{ExportStatsStore, ImportStateStore};

/// How the next bulk loads should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFailure {
    Transient,
    BadData,
}

#[derive(Debug, Default)]
struct MockState {
    copies: usize,
    copied_files: Vec<String>,
    committed: Vec<String>,
    commits: usize,
    rollbacks: usize,
    begins: usize,
    fail_patterns: Vec<String>,
    query_rows: Vec<(String, Vec<Vec<String>>)>,
    copy_failure: Option<CopyFailure>,
    initialized: bool,
    pool_open: bool,
    finalized: usize,
    fail_open_pool: bool,
}

pub struct MockDialect;

impl EngineDialect for MockDialect {
    fn kind(&self) -> EngineKind {
        EngineKind::Postgresql
    }

    fn bulk_load_statement(&self, target: &BulkLoadTarget<'_>) -> Result<String> {
        Ok(format!(
            "COPY {} FROM STDIN WITH ({})",
            target.table_sql,
            target.args.copy_options().join(", ")
        ))
    }

    fn is_non_retryable_error(&self, err: &MigrateError) -> bool {
        match err {
            MigrateError::State(msg) => msg.contains("invalid input") || msg.contains("constraint"),
            _ => false,
        }
    }

    fn max_batch_size_bytes(&self) -> usize {
        1024 * 1024
    }

    fn restore_sequence_sql(&self, sequence: &str, last_value: i64) -> Result<String> {
        Ok(format!("SELECT setval('{}', {})", sequence, last_value))
    }

    fn identity_columns_sql(&self, table: &TableName, kind: IdentityKind) -> Option<String> {
        Some(format!("identity {} columns of {}", kind.as_sql(), table))
    }

    fn identity_generation_sql(
        &self,
        table_sql: &str,
        column_sql: &str,
        kind: IdentityKind,
    ) -> Option<String> {
        Some(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET GENERATED {}",
            table_sql,
            column_sql,
            kind.as_sql()
        ))
    }

    fn unique_key_columns_sql(&self, table: &TableName) -> String {
        format!("unique keys of {}", table)
    }

    fn invalid_indexes_sql(&self, schema: &str) -> Option<String> {
        Some(format!("invalid indexes in {}", schema))
    }

    fn non_empty_probe_sql(&self, table_sql: &str) -> String {
        format!("SELECT 1 FROM {} LIMIT 1", table_sql)
    }
}

/// Counting engine: records bulk loads and committed statements.
#[derive(Clone)]
pub struct MockEngine {
    state: Arc<Mutex<MockState>>,
    max_connections: usize,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            max_connections: 4,
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn copies(&self) -> usize {
        self.with(|s| s.copies)
    }

    pub fn copied_files(&self) -> Vec<String> {
        self.with(|s| s.copied_files.clone())
    }

    pub fn committed_statements(&self) -> Vec<String> {
        self.with(|s| s.committed.clone())
    }

    pub fn commits(&self) -> usize {
        self.with(|s| s.commits)
    }

    pub fn rollbacks(&self) -> usize {
        self.with(|s| s.rollbacks)
    }

    pub fn begins(&self) -> usize {
        self.with(|s| s.begins)
    }

    pub fn finalized(&self) -> usize {
        self.with(|s| s.finalized)
    }

    pub fn fail_statements_containing(&self, pattern: &str) {
        self.with(|s| s.fail_patterns.push(pattern.to_string()));
    }

    /// Rows returned by text queries containing `pattern`; other queries return none.
    pub fn respond_to(&self, pattern: &str, rows: &[&[&str]]) {
        let rows = rows
            .iter()
            .map(|row| row.iter().map(|v| v.to_string()).collect())
            .collect();
        self.with(|s| s.query_rows.push((pattern.to_string(), rows)));
    }

    pub fn fail_copies(&self, failure: Option<CopyFailure>) {
        self.with(|s| s.copy_failure = failure);
    }

    pub fn fail_open_pool(&self) {
        self.with(|s| s.fail_open_pool = true);
    }
}

struct MockTx {
    state: Arc<Mutex<MockState>>,
    pending: Vec<String>,
}

#[async_trait]
impl TargetTx for MockTx {
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let failing = {
            let s = self.state.lock().unwrap();
            s.fail_patterns.iter().any(|p| sql.contains(p.as_str()))
        };
        if failing {
            return Err(MigrateError::State(format!("injected failure: {}", sql)));
        }
        self.pending.push(sql.to_string());
        Ok(1)
    }

    async fn query_i64s(&mut self, _sql: &str) -> Result<Option<Vec<i64>>> {
        Ok(None)
    }

    async fn query_strings(&mut self, sql: &str) -> Result<Vec<Vec<String>>> {
        let s = self.state.lock().unwrap();
        if s.fail_patterns.iter().any(|p| sql.contains(p.as_str())) {
            return Err(MigrateError::State(format!("injected failure: {}", sql)));
        }
        Ok(s
            .query_rows
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn copy_from_file(&mut self, statement: &str, args: &ImportBatchArgs) -> Result<u64> {
        let failure = self.state.lock().unwrap().copy_failure;
        match failure {
            Some(CopyFailure::Transient) => {
                return Err(MigrateError::State("connection reset by peer".into()))
            }
            Some(CopyFailure::BadData) => {
                return Err(MigrateError::State(
                    "invalid input syntax for type integer".into(),
                ))
            }
            None => {}
        }
        let content = tokio::fs::read_to_string(&args.file_path).await?;
        let lines = content.lines().filter(|l| !l.is_empty()).count() as u64;
        let rows = if args.has_header {
            lines.saturating_sub(1)
        } else {
            lines
        };
        let mut s = self.state.lock().unwrap();
        s.copies += 1;
        s.copied_files
            .push(args.file_path.to_string_lossy().into_owned());
        drop(s);
        self.pending.push(statement.to_string());
        Ok(rows)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut s = self.state.lock().unwrap();
        s.commits += 1;
        s.committed.extend(self.pending);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.state.lock().unwrap().rollbacks += 1;
        Ok(())
    }
}

#[async_trait]
impl TargetEngine for MockEngine {
    fn dialect(&self) -> &dyn EngineDialect {
        &MockDialect
    }

    fn target_schema(&self) -> &str {
        "public"
    }

    async fn init(&mut self) -> Result<()> {
        self.with(|s| s.initialized = true);
        Ok(())
    }

    async fn open_pool(&mut self) -> Result<()> {
        let fail = self.with(|s| s.fail_open_pool);
        if fail {
            return Err(MigrateError::connection("password authentication failed", "mock pool"));
        }
        self.with(|s| s.pool_open = true);
        Ok(())
    }

    async fn finalize(&mut self) {
        self.with(|s| {
            s.pool_open = false;
            s.finalized += 1;
        });
    }

    fn version(&self) -> Option<&str> {
        Some("mock 1.0")
    }

    fn max_connections(&self) -> usize {
        self.max_connections
    }

    async fn begin(&self) -> Result<Box<dyn TargetTx>> {
        self.with(|s| s.begins += 1);
        Ok(Box::new(MockTx {
            state: self.state.clone(),
            pending: Vec::new(),
        }))
    }
}

/// In-memory import bookkeeping. Writes land immediately, not on commit.
#[derive(Default)]
pub struct MemoryImportState {
    markers: Mutex<HashMap<BatchKey, i64>>,
    sequences: Mutex<HashMap<(Uuid, usize), i64>>,
    counts: Mutex<HashMap<(Uuid, TableName), EventCounter>>,
    init_calls: Mutex<usize>,
}

impl MemoryImportState {
    pub fn marker_count(&self) -> usize {
        self.markers.lock().unwrap().len()
    }

    pub fn init_calls(&self) -> usize {
        *self.init_calls.lock().unwrap()
    }

    pub fn counts(&self, uuid: Uuid, table: &TableName) -> EventCounter {
        self.counts
            .lock()
            .unwrap()
            .get(&(uuid, table.clone()))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ImportStateStore for MemoryImportState {
    async fn init_schema(&self, _tx: &mut dyn TargetTx) -> Result<()> {
        *self.init_calls.lock().unwrap() += 1;
        Ok(())
    }

    async fn completion_marker(
        &self,
        _tx: &mut dyn TargetTx,
        key: &BatchKey,
    ) -> Result<Option<ImportCompletionMarker>> {
        Ok(self
            .markers
            .lock()
            .unwrap()
            .get(key)
            .map(|rows| ImportCompletionMarker {
                key: key.clone(),
                rows_imported: *rows,
            }))
    }

    async fn record_completion(
        &self,
        _tx: &mut dyn TargetTx,
        marker: &ImportCompletionMarker,
    ) -> Result<()> {
        let mut markers = self.markers.lock().unwrap();
        if markers.contains_key(&marker.key) {
            return Err(MigrateError::State(format!(
                "duplicate key value violates unique constraint for {}",
                marker.key
            )));
        }
        markers.insert(marker.key.clone(), marker.rows_imported);
        Ok(())
    }

    async fn imported_row_count(&self, _tx: &mut dyn TargetTx, table: &TableName) -> Result<i64> {
        Ok(self
            .markers
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| &k.table_name == table)
            .map(|(_, rows)| rows)
            .sum())
    }

    async fn last_applied_sequence(
        &self,
        _tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        channel: usize,
    ) -> Result<Option<i64>> {
        Ok(self
            .sequences
            .lock()
            .unwrap()
            .get(&(migration_uuid, channel))
            .copied())
    }

    async fn record_applied_sequence(
        &self,
        _tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        channel: usize,
        sequence: i64,
    ) -> Result<()> {
        self.sequences
            .lock()
            .unwrap()
            .insert((migration_uuid, channel), sequence);
        Ok(())
    }

    async fn increment_imported_events(
        &self,
        _tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        _channel: usize,
        counts: &BTreeMap<TableName, EventCounter>,
    ) -> Result<()> {
        let mut all = self.counts.lock().unwrap();
        for (table, c) in counts {
            *all.entry((migration_uuid, table.clone())).or_default() += *c;
        }
        Ok(())
    }

    async fn imported_event_counts(
        &self,
        _tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        table: &TableName,
    ) -> Result<EventCounter> {
        Ok(self.counts(migration_uuid, table))
    }

    async fn clear_migration_state(&self, _tx: &mut dyn TargetTx, migration_uuid: Uuid) -> Result<()> {
        self.sequences
            .lock()
            .unwrap()
            .retain(|(uuid, _), _| *uuid != migration_uuid);
        self.counts
            .lock()
            .unwrap()
            .retain(|(uuid, _), _| *uuid != migration_uuid);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryExportStats {
    stats: Mutex<HashMap<(ExporterRole, TableName), EventCounter>>,
}

impl MemoryExportStats {
    pub fn set(&self, role: ExporterRole, table: &TableName, counts: EventCounter) {
        self.stats
            .lock()
            .unwrap()
            .insert((role, table.clone()), counts);
    }

    pub fn get(&self, role: ExporterRole, table: &TableName) -> EventCounter {
        self.stats
            .lock()
            .unwrap()
            .get(&(role, table.clone()))
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ExportStatsStore for MemoryExportStats {
    async fn exported_event_counts(
        &self,
        role: ExporterRole,
        table: &TableName,
    ) -> Result<EventCounter> {
        Ok(self.get(role, table))
    }

    async fn increment_exported(
        &self,
        role: ExporterRole,
        table: &TableName,
        counts: EventCounter,
    ) -> Result<()> {
        *self
            .stats
            .lock()
            .unwrap()
            .entry((role, table.clone()))
            .or_default() += counts;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStatsReader {
    stats: Mutex<HashMap<(ImporterRole, TableName), ImportedTableStats>>,
    failing: Mutex<HashSet<ImporterRole>>,
}

impl MemoryStatsReader {
    pub fn set(&self, role: ImporterRole, table: &TableName, stats: ImportedTableStats) {
        self.stats
            .lock()
            .unwrap()
            .insert((role, table.clone()), stats);
    }

    pub fn fail_role(&self, role: ImporterRole) {
        self.failing.lock().unwrap().insert(role);
    }
}

#[async_trait]
impl ImportedStatsReader for MemoryStatsReader {
    async fn imported_stats(
        &self,
        role: ImporterRole,
        tables: &[TableName],
    ) -> Result<BTreeMap<TableName, ImportedTableStats>> {
        if self.failing.lock().unwrap().contains(&role) {
            return Err(MigrateError::connection("connection refused", role.to_string()));
        }
        let stats = self.stats.lock().unwrap();
        Ok(tables
            .iter()
            .filter_map(|t| stats.get(&(role, t.clone())).map(|s| (t.clone(), *s)))
            .collect())
    }
}
