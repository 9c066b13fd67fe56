//! Import bookkeeping kept in a metadata schema on each target.
//!
//! PostgreSQL-family and MySQL targets get a dedicated `live_migrate_metadata`
//! schema (database on MySQL). Oracle keeps `LM_`-prefixed tables in the
//! connected user's schema. Every statement runs on the caller's transaction.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::backend::ImportStateStore;
use crate::config::EngineKind;
use crate::core::identifier::quote_literal;
use crate::core::{BatchKey, EventCounter, ImportCompletionMarker, TableName, TargetTx};
use crate::error::Result;

/// Schema holding the metadata tables.
pub const METADATA_SCHEMA: &str = "live_migrate_metadata";

const BATCHES: &str = "import_data_batches";
const CHANNELS: &str = "event_channels";
const EVENT_COUNTS: &str = "imported_event_counts";

/// Metadata tables on a target, rendered in that target's dialect.
#[derive(Debug, Clone)]
pub struct TargetMetadataStore {
    kind: EngineKind,
}

impl TargetMetadataStore {
    pub fn new(kind: EngineKind) -> Self {
        Self { kind }
    }

    fn table(&self, name: &str) -> String {
        match self.kind {
            EngineKind::Oracle => format!("LM_{}", name.to_uppercase()),
            _ => format!("{}.{}", METADATA_SCHEMA, name),
        }
    }

    fn lit(&self, value: &str) -> String {
        quote_literal(self.kind, value)
    }

    fn sum(&self, column: &str) -> String {
        match self.kind {
            EngineKind::Mysql => format!("CAST(COALESCE(SUM({}), 0) AS SIGNED)", column),
            EngineKind::Oracle => format!("COALESCE(SUM({}), 0)", column),
            _ => format!("CAST(COALESCE(SUM({}), 0) AS BIGINT)", column),
        }
    }

    /// DDL creating the metadata schema and tables.
    pub fn schema_statements(&self) -> Vec<String> {
        match self.kind {
            EngineKind::Postgresql | EngineKind::Yugabytedb => vec![
                format!("CREATE SCHEMA IF NOT EXISTS {}", METADATA_SCHEMA),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        data_file_name TEXT NOT NULL,
                        table_name TEXT NOT NULL,
                        rows_imported BIGINT NOT NULL,
                        imported_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                        PRIMARY KEY (data_file_name, table_name)
                    )",
                    self.table(BATCHES)
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        migration_uuid TEXT NOT NULL,
                        channel_no INT NOT NULL,
                        last_applied_vsn BIGINT NOT NULL,
                        PRIMARY KEY (migration_uuid, channel_no)
                    )",
                    self.table(CHANNELS)
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        migration_uuid TEXT NOT NULL,
                        table_name TEXT NOT NULL,
                        channel_no INT NOT NULL,
                        num_inserts BIGINT NOT NULL DEFAULT 0,
                        num_updates BIGINT NOT NULL DEFAULT 0,
                        num_deletes BIGINT NOT NULL DEFAULT 0,
                        PRIMARY KEY (migration_uuid, table_name, channel_no)
                    )",
                    self.table(EVENT_COUNTS)
                ),
            ],
            EngineKind::Mysql => vec![
                format!("CREATE DATABASE IF NOT EXISTS {}", METADATA_SCHEMA),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        data_file_name VARCHAR(500) NOT NULL,
                        table_name VARCHAR(250) NOT NULL,
                        rows_imported BIGINT NOT NULL,
                        imported_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                        PRIMARY KEY (data_file_name, table_name)
                    )",
                    self.table(BATCHES)
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        migration_uuid VARCHAR(64) NOT NULL,
                        channel_no INT NOT NULL,
                        last_applied_vsn BIGINT NOT NULL,
                        PRIMARY KEY (migration_uuid, channel_no)
                    )",
                    self.table(CHANNELS)
                ),
                format!(
                    "CREATE TABLE IF NOT EXISTS {} (
                        migration_uuid VARCHAR(64) NOT NULL,
                        table_name VARCHAR(250) NOT NULL,
                        channel_no INT NOT NULL,
                        num_inserts BIGINT NOT NULL DEFAULT 0,
                        num_updates BIGINT NOT NULL DEFAULT 0,
                        num_deletes BIGINT NOT NULL DEFAULT 0,
                        PRIMARY KEY (migration_uuid, table_name, channel_no)
                    )",
                    self.table(EVENT_COUNTS)
                ),
            ],
            EngineKind::Oracle => [
                format!(
                    "CREATE TABLE {} (
                        data_file_name VARCHAR2(1000) NOT NULL,
                        table_name VARCHAR2(500) NOT NULL,
                        rows_imported NUMBER(19) NOT NULL,
                        imported_at TIMESTAMP DEFAULT SYSTIMESTAMP NOT NULL,
                        PRIMARY KEY (data_file_name, table_name)
                    )",
                    self.table(BATCHES)
                ),
                format!(
                    "CREATE TABLE {} (
                        migration_uuid VARCHAR2(64) NOT NULL,
                        channel_no NUMBER(10) NOT NULL,
                        last_applied_vsn NUMBER(19) NOT NULL,
                        PRIMARY KEY (migration_uuid, channel_no)
                    )",
                    self.table(CHANNELS)
                ),
                format!(
                    "CREATE TABLE {} (
                        migration_uuid VARCHAR2(64) NOT NULL,
                        table_name VARCHAR2(500) NOT NULL,
                        channel_no NUMBER(10) NOT NULL,
                        num_inserts NUMBER(19) DEFAULT 0 NOT NULL,
                        num_updates NUMBER(19) DEFAULT 0 NOT NULL,
                        num_deletes NUMBER(19) DEFAULT 0 NOT NULL,
                        PRIMARY KEY (migration_uuid, table_name, channel_no)
                    )",
                    self.table(EVENT_COUNTS)
                ),
            ]
            .into_iter()
            // ORA-00955: name is already used by an existing object
            .map(|ddl| {
                format!(
                    "BEGIN EXECUTE IMMEDIATE '{}'; EXCEPTION WHEN OTHERS THEN IF SQLCODE != -955 THEN RAISE; END IF; END;",
                    ddl.replace('\'', "''")
                )
            })
            .collect(),
        }
    }

    pub fn marker_query(&self, key: &BatchKey) -> String {
        format!(
            "SELECT rows_imported FROM {} WHERE data_file_name = {} AND table_name = {}",
            self.table(BATCHES),
            self.lit(&key.file_path),
            self.lit(&key.table_name.qualified())
        )
    }

    pub fn insert_marker(&self, marker: &ImportCompletionMarker) -> String {
        format!(
            "INSERT INTO {} (data_file_name, table_name, rows_imported) VALUES ({}, {}, {})",
            self.table(BATCHES),
            self.lit(&marker.key.file_path),
            self.lit(&marker.key.table_name.qualified()),
            marker.rows_imported
        )
    }

    pub fn imported_rows_query(&self, table: &TableName) -> String {
        format!(
            "SELECT {} FROM {} WHERE table_name = {}",
            self.sum("rows_imported"),
            self.table(BATCHES),
            self.lit(&table.qualified())
        )
    }

    pub fn last_sequence_query(&self, migration_uuid: Uuid, channel: usize) -> String {
        format!(
            "SELECT last_applied_vsn FROM {} WHERE migration_uuid = {} AND channel_no = {}",
            self.table(CHANNELS),
            self.lit(&migration_uuid.to_string()),
            channel
        )
    }

    pub fn upsert_sequence(&self, migration_uuid: Uuid, channel: usize, sequence: i64) -> String {
        let table = self.table(CHANNELS);
        let uuid = self.lit(&migration_uuid.to_string());
        match self.kind {
            EngineKind::Postgresql | EngineKind::Yugabytedb => format!(
                "INSERT INTO {} (migration_uuid, channel_no, last_applied_vsn) VALUES ({}, {}, {}) \
                 ON CONFLICT (migration_uuid, channel_no) DO UPDATE SET last_applied_vsn = EXCLUDED.last_applied_vsn",
                table, uuid, channel, sequence
            ),
            EngineKind::Mysql => format!(
                "INSERT INTO {} (migration_uuid, channel_no, last_applied_vsn) VALUES ({}, {}, {}) \
                 ON DUPLICATE KEY UPDATE last_applied_vsn = VALUES(last_applied_vsn)",
                table, uuid, channel, sequence
            ),
            EngineKind::Oracle => format!(
                "MERGE INTO {t} d USING (SELECT {u} migration_uuid, {c} channel_no, {s} last_applied_vsn FROM dual) s \
                 ON (d.migration_uuid = s.migration_uuid AND d.channel_no = s.channel_no) \
                 WHEN MATCHED THEN UPDATE SET d.last_applied_vsn = s.last_applied_vsn \
                 WHEN NOT MATCHED THEN INSERT (migration_uuid, channel_no, last_applied_vsn) \
                 VALUES (s.migration_uuid, s.channel_no, s.last_applied_vsn)",
                t = table,
                u = uuid,
                c = channel,
                s = sequence
            ),
        }
    }

    pub fn increment_counts(
        &self,
        migration_uuid: Uuid,
        channel: usize,
        table: &TableName,
        counts: &EventCounter,
    ) -> String {
        let t = self.table(EVENT_COUNTS);
        let uuid = self.lit(&migration_uuid.to_string());
        let name = self.lit(&table.qualified());
        let (i, u, d) = (counts.inserts, counts.updates, counts.deletes);
        match self.kind {
            EngineKind::Postgresql | EngineKind::Yugabytedb => format!(
                "INSERT INTO {t} AS c (migration_uuid, table_name, channel_no, num_inserts, num_updates, num_deletes) \
                 VALUES ({uuid}, {name}, {channel}, {i}, {u}, {d}) \
                 ON CONFLICT (migration_uuid, table_name, channel_no) DO UPDATE SET \
                 num_inserts = c.num_inserts + EXCLUDED.num_inserts, \
                 num_updates = c.num_updates + EXCLUDED.num_updates, \
                 num_deletes = c.num_deletes + EXCLUDED.num_deletes"
            ),
            EngineKind::Mysql => format!(
                "INSERT INTO {t} (migration_uuid, table_name, channel_no, num_inserts, num_updates, num_deletes) \
                 VALUES ({uuid}, {name}, {channel}, {i}, {u}, {d}) \
                 ON DUPLICATE KEY UPDATE \
                 num_inserts = num_inserts + VALUES(num_inserts), \
                 num_updates = num_updates + VALUES(num_updates), \
                 num_deletes = num_deletes + VALUES(num_deletes)"
            ),
            EngineKind::Oracle => format!(
                "MERGE INTO {t} c USING (SELECT {uuid} migration_uuid, {name} table_name, {channel} channel_no, \
                 {i} num_inserts, {u} num_updates, {d} num_deletes FROM dual) s \
                 ON (c.migration_uuid = s.migration_uuid AND c.table_name = s.table_name AND c.channel_no = s.channel_no) \
                 WHEN MATCHED THEN UPDATE SET c.num_inserts = c.num_inserts + s.num_inserts, \
                 c.num_updates = c.num_updates + s.num_updates, c.num_deletes = c.num_deletes + s.num_deletes \
                 WHEN NOT MATCHED THEN INSERT (migration_uuid, table_name, channel_no, num_inserts, num_updates, num_deletes) \
                 VALUES (s.migration_uuid, s.table_name, s.channel_no, s.num_inserts, s.num_updates, s.num_deletes)"
            ),
        }
    }

    pub fn counts_query(&self, migration_uuid: Uuid, table: &TableName) -> String {
        format!(
            "SELECT {}, {}, {} FROM {} WHERE migration_uuid = {} AND table_name = {}",
            self.sum("num_inserts"),
            self.sum("num_updates"),
            self.sum("num_deletes"),
            self.table(EVENT_COUNTS),
            self.lit(&migration_uuid.to_string()),
            self.lit(&table.qualified())
        )
    }

    pub fn clear_statements(&self, migration_uuid: Uuid) -> Vec<String> {
        let uuid = self.lit(&migration_uuid.to_string());
        [CHANNELS, EVENT_COUNTS]
            .iter()
            .map(|t| format!("DELETE FROM {} WHERE migration_uuid = {}", self.table(t), uuid))
            .collect()
    }
}

#[async_trait]
impl ImportStateStore for TargetMetadataStore {
    async fn init_schema(&self, tx: &mut dyn TargetTx) -> Result<()> {
        for ddl in self.schema_statements() {
            tx.execute(&ddl).await?;
        }
        debug!("Import metadata schema ready on {}", self.kind);
        Ok(())
    }

    async fn completion_marker(
        &self,
        tx: &mut dyn TargetTx,
        key: &BatchKey,
    ) -> Result<Option<ImportCompletionMarker>> {
        let row = tx.query_i64s(&self.marker_query(key)).await?;
        Ok(row.and_then(|r| r.first().copied()).map(|rows| ImportCompletionMarker {
            key: key.clone(),
            rows_imported: rows,
        }))
    }

    async fn record_completion(
        &self,
        tx: &mut dyn TargetTx,
        marker: &ImportCompletionMarker,
    ) -> Result<()> {
        tx.execute(&self.insert_marker(marker)).await?;
        Ok(())
    }

    async fn imported_row_count(&self, tx: &mut dyn TargetTx, table: &TableName) -> Result<i64> {
        let row = tx.query_i64s(&self.imported_rows_query(table)).await?;
        Ok(row.and_then(|r| r.first().copied()).unwrap_or(0))
    }

    async fn last_applied_sequence(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        channel: usize,
    ) -> Result<Option<i64>> {
        let row = tx
            .query_i64s(&self.last_sequence_query(migration_uuid, channel))
            .await?;
        Ok(row.and_then(|r| r.first().copied()))
    }

    async fn record_applied_sequence(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        channel: usize,
        sequence: i64,
    ) -> Result<()> {
        tx.execute(&self.upsert_sequence(migration_uuid, channel, sequence))
            .await?;
        Ok(())
    }

    async fn increment_imported_events(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        channel: usize,
        counts: &BTreeMap<TableName, EventCounter>,
    ) -> Result<()> {
        for (table, counter) in counts {
            if counter.is_zero() {
                continue;
            }
            tx.execute(&self.increment_counts(migration_uuid, channel, table, counter))
                .await?;
        }
        Ok(())
    }

    async fn imported_event_counts(
        &self,
        tx: &mut dyn TargetTx,
        migration_uuid: Uuid,
        table: &TableName,
    ) -> Result<EventCounter> {
        let row = tx.query_i64s(&self.counts_query(migration_uuid, table)).await?;
        Ok(match row.as_deref() {
            Some([inserts, updates, deletes, ..]) => EventCounter::new(*inserts, *updates, *deletes),
            _ => EventCounter::default(),
        })
    }

    async fn clear_migration_state(&self, tx: &mut dyn TargetTx, migration_uuid: Uuid) -> Result<()> {
        for sql in self.clear_statements(migration_uuid) {
            tx.execute(&sql).await?;
        }
        Ok(())
    }
}
