//! Core traits for importing into heterogeneous target engines.
//!
//! - [`EngineDialect`]: SQL and bulk-load syntax strategy for one engine kind
//! - [`TargetTx`]: a single transaction interface over every driver's native handle
//! - [`TargetEngine`]: a live, pooled handle on one role's database
//!
//! Engine-specific behavior is chosen once, when the engine is constructed;
//! the batch importer and event applier only ever see these traits.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::EngineKind;
use crate::error::{ErrorClass, MigrateError, Result};

use super::batch::ImportBatchArgs;
use super::event::{ChangeEvent, EventOp};
use super::identifier::{quote_if_required, quote_literal};
use super::schema::{TableName, TableSchema};

/// Identity column generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Always,
    ByDefault,
}

impl IdentityKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IdentityKind::Always => "ALWAYS",
            IdentityKind::ByDefault => "BY DEFAULT",
        }
    }
}

/// Everything a dialect needs to render a bulk-load command.
#[derive(Debug)]
pub struct BulkLoadTarget<'a> {
    /// Quoted, schema-qualified target table.
    pub table_sql: String,
    /// Quoted target columns, in file order.
    pub columns_sql: Vec<String>,
    pub args: &'a ImportBatchArgs,
    pub source_schema: &'a TableSchema,
}

/// One object a post-load fixup could not process.
#[derive(Debug)]
pub struct ObjectFailure {
    pub object: String,
    pub error: MigrateError,
}

/// Result of a post-load fixup: objects are processed independently.
#[derive(Debug, Default)]
pub struct FixupOutcome {
    pub succeeded: Vec<String>,
    pub failures: Vec<ObjectFailure>,
}

impl FixupOutcome {
    pub fn record(&mut self, object: impl Into<String>, result: Result<()>) {
        let object = object.into();
        match result {
            Ok(()) => self.succeeded.push(object),
            Err(error) => {
                warn!("Fixup failed for {}: {}", object, error);
                self.failures.push(ObjectFailure { object, error });
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-table result of a catalog lookup run over many tables.
///
/// `found` holds the tables that produced a value; a table whose query
/// failed is listed in `failures` and does not stop the others.
#[derive(Debug)]
pub struct TableLookup<T> {
    pub found: BTreeMap<TableName, T>,
    pub failures: Vec<ObjectFailure>,
}

impl<T> Default for TableLookup<T> {
    fn default() -> Self {
        Self {
            found: BTreeMap::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> TableLookup<T> {
    /// Keep `value` for `table` when the lookup produced one.
    pub fn record(&mut self, table: &TableName, result: Result<Option<T>>) {
        match result {
            Ok(Some(value)) => {
                self.found.insert(table.clone(), value);
            }
            Ok(None) => {}
            Err(error) => {
                warn!("Catalog lookup failed for {}: {}", table, error);
                self.failures.push(ObjectFailure {
                    object: table.qualified(),
                    error,
                });
            }
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn tables(&self) -> Vec<TableName> {
        self.found.keys().cloned().collect()
    }
}

/// SQL syntax strategy for one engine kind.
pub trait EngineDialect: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Map a name arriving from another engine onto this engine's default case.
    fn normalize_identifier(&self, name: &str) -> String {
        name.to_string()
    }

    /// Quote `name` only where this engine requires it.
    fn quote_identifier(&self, table: &str, name: &str) -> Result<String> {
        quote_if_required(self.kind(), table, &self.normalize_identifier(name))
    }

    /// Engine-native bulk-load command (COPY, LOAD DATA, or a loader control file).
    fn bulk_load_statement(&self, target: &BulkLoadTarget<'_>) -> Result<String>;

    /// True when `err` is permanent and must not be retried.
    fn is_non_retryable_error(&self, err: &MigrateError) -> bool;

    /// Upper bound for one event batch's payload.
    fn max_batch_size_bytes(&self) -> usize;

    /// Render a JSON value as a SQL literal.
    fn render_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => quote_literal(self.kind(), s),
            other => quote_literal(self.kind(), &other.to_string()),
        }
    }

    /// DML statement applying one change event to `table_sql`.
    fn event_statement(&self, table_sql: &str, event: &ChangeEvent) -> Result<String> {
        let label = event.table_name.qualified();
        let malformed = |what: &str| {
            MigrateError::apply(
                "-",
                event.vsn,
                ErrorClass::NonRetryable,
                format!("{} event on {} has no {}", event.op, label, what),
            )
        };
        let predicate = |key: &BTreeMap<String, Value>| -> Result<String> {
            key.iter()
                .map(|(col, value)| {
                    let col = self.quote_identifier(&label, col)?;
                    Ok(match value {
                        Value::Null => format!("{} IS NULL", col),
                        v => format!("{} = {}", col, self.render_value(v)),
                    })
                })
                .collect::<Result<Vec<_>>>()
                .map(|parts| parts.join(" AND "))
        };

        match event.op {
            EventOp::Insert => {
                if event.fields.is_empty() {
                    return Err(malformed("fields"));
                }
                let mut cols = Vec::with_capacity(event.fields.len());
                let mut vals = Vec::with_capacity(event.fields.len());
                for (col, value) in &event.fields {
                    cols.push(self.quote_identifier(&label, col)?);
                    vals.push(self.render_value(value));
                }
                Ok(format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table_sql,
                    cols.join(", "),
                    vals.join(", ")
                ))
            }
            EventOp::Update => {
                if event.key.is_empty() {
                    return Err(malformed("key"));
                }
                if event.fields.is_empty() {
                    return Err(malformed("fields"));
                }
                let sets = event
                    .fields
                    .iter()
                    .map(|(col, value)| {
                        Ok(format!(
                            "{} = {}",
                            self.quote_identifier(&label, col)?,
                            self.render_value(value)
                        ))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!(
                    "UPDATE {} SET {} WHERE {}",
                    table_sql,
                    sets.join(", "),
                    predicate(&event.key)?
                ))
            }
            EventOp::Delete => {
                if event.key.is_empty() {
                    return Err(malformed("key"));
                }
                Ok(format!(
                    "DELETE FROM {} WHERE {}",
                    table_sql,
                    predicate(&event.key)?
                ))
            }
        }
    }

    fn restore_sequence_sql(&self, sequence: &str, last_value: i64) -> Result<String>;

    /// Query listing identity columns of `kind`, one name per row; None if the engine has none.
    fn identity_columns_sql(&self, table: &TableName, kind: IdentityKind) -> Option<String>;

    /// Statement switching a column's identity generation; None if it is a no-op on this engine.
    fn identity_generation_sql(
        &self,
        table_sql: &str,
        column_sql: &str,
        kind: IdentityKind,
    ) -> Option<String>;

    /// Query listing `(constraint, column)` rows of unique keys other than the primary key.
    fn unique_key_columns_sql(&self, table: &TableName) -> String;

    /// Query listing invalid or unusable indexes, one name per row.
    fn invalid_indexes_sql(&self, schema: &str) -> Option<String>;

    /// Query returning a row only when the table has at least one row.
    fn non_empty_probe_sql(&self, table_sql: &str) -> String;
}

/// One open transaction on a target.
///
/// Consumed by `commit`/`rollback`. Dropping an open transaction must not
/// return its connection to the pool in a half-finished state.
#[async_trait]
pub trait TargetTx: Send {
    /// Execute a statement, returning rows affected.
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    /// First row of a query as integers, or None when it returns no rows.
    async fn query_i64s(&mut self, sql: &str) -> Result<Option<Vec<i64>>>;

    /// All rows of a query as text (NULL becomes an empty string).
    async fn query_strings(&mut self, sql: &str) -> Result<Vec<Vec<String>>>;

    /// Stream the batch's file into the target using `statement`, returning rows loaded.
    async fn copy_from_file(&mut self, statement: &str, args: &ImportBatchArgs) -> Result<u64>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Run `work` inside a transaction: commit only on success, roll back on every error path.
///
/// `work` receives the transaction by value and hands it back with its result,
/// so it may borrow anything the caller holds.
pub async fn run_in_transaction<E, T, F, Fut>(engine: &E, work: F) -> Result<T>
where
    E: TargetEngine + ?Sized,
    F: FnOnce(Box<dyn TargetTx>) -> Fut,
    Fut: Future<Output = (Box<dyn TargetTx>, Result<T>)>,
{
    let tx = engine.begin().await?;
    let (tx, result) = work(tx).await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed after error ({}): {}", e, rollback_err);
            }
            Err(e)
        }
    }
}

/// A live, initialized handle on one role's database.
#[async_trait]
pub trait TargetEngine: Send + Sync {
    fn dialect(&self) -> &dyn EngineDialect;

    /// Schema this role's tables live in (may be `a|b` for multi-schema sources).
    fn target_schema(&self) -> &str;

    /// Establish metadata for dialect decisions (server version). Does not open the pool.
    async fn init(&mut self) -> Result<()>;

    /// Open the bounded connection pool.
    async fn open_pool(&mut self) -> Result<()>;

    /// Release the pool and all handles. Idempotent; safe after partial initialization.
    async fn finalize(&mut self);

    fn version(&self) -> Option<&str>;

    fn max_connections(&self) -> usize;

    async fn begin(&self) -> Result<Box<dyn TargetTx>>;

    fn kind(&self) -> EngineKind {
        self.dialect().kind()
    }

    /// The table's identity on this role's database.
    fn target_table(&self, table: &TableName) -> TableName {
        let schema = self.target_schema();
        let dialect = self.dialect();
        let name = dialect.normalize_identifier(&table.name);
        if !schema.is_empty() && !schema.contains('|') {
            TableName::new(dialect.normalize_identifier(schema), name)
        } else {
            TableName::new(dialect.normalize_identifier(&table.schema), name)
        }
    }

    /// Quoted, schema-qualified name of `table` on this database.
    fn qualified_table(&self, table: &TableName) -> Result<String> {
        let target = self.target_table(table);
        let label = target.qualified();
        let name = self.dialect().quote_identifier(&label, &target.name)?;
        if target.schema.is_empty() {
            Ok(name)
        } else {
            Ok(format!(
                "{}.{}",
                self.dialect().quote_identifier(&label, &target.schema)?,
                name
            ))
        }
    }

    /// Quote column names only where required.
    fn quote_columns(&self, table: &TableName, columns: &[String]) -> Result<Vec<String>> {
        let label = table.qualified();
        columns
            .iter()
            .map(|c| self.dialect().quote_identifier(&label, c))
            .collect()
    }

    fn bulk_load_statement(
        &self,
        args: &ImportBatchArgs,
        source_schema: &TableSchema,
    ) -> Result<String> {
        let target = BulkLoadTarget {
            table_sql: self.qualified_table(&args.table_name)?,
            columns_sql: self.quote_columns(&args.table_name, &args.columns)?,
            args,
            source_schema,
        };
        self.dialect().bulk_load_statement(&target)
    }

    fn is_non_retryable_error(&self, err: &MigrateError) -> bool {
        self.dialect().is_non_retryable_error(err)
    }

    fn max_batch_size_bytes(&self) -> usize {
        self.dialect().max_batch_size_bytes()
    }

    /// Execute one statement in its own transaction.
    async fn execute_standalone(&self, sql: &str) -> Result<u64> {
        debug!("standalone: {}", sql);
        run_in_transaction(self, |mut tx| async move {
            let result = tx.execute(sql).await;
            (tx, result)
        })
        .await
    }

    async fn query_standalone(&self, sql: &str) -> Result<Vec<Vec<String>>> {
        run_in_transaction(self, |mut tx| async move {
            let result = tx.query_strings(sql).await;
            (tx, result)
        })
        .await
    }

    /// Move each sequence past its last migrated value.
    async fn restore_sequences(&self, last_values: &BTreeMap<String, i64>) -> Result<FixupOutcome> {
        let mut outcome = FixupOutcome::default();
        for (sequence, last_value) in last_values {
            let result = match self.dialect().restore_sequence_sql(sequence, *last_value) {
                Ok(sql) => self.execute_standalone(&sql).await.map(|_| ()),
                Err(e) => Err(e),
            };
            outcome.record(sequence.clone(), result);
        }
        Ok(outcome)
    }

    async fn identity_columns(&self, table: &TableName, kind: IdentityKind) -> Result<Vec<String>> {
        let target = self.target_table(table);
        match self.dialect().identity_columns_sql(&target, kind) {
            Some(sql) => Ok(self
                .query_standalone(&sql)
                .await?
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Identity columns of `kind` for every table that has any.
    async fn identity_columns_by_table(
        &self,
        tables: &[TableName],
        kind: IdentityKind,
    ) -> TableLookup<Vec<String>> {
        let mut lookup = TableLookup::default();
        for table in tables {
            let result = self
                .identity_columns(table, kind)
                .await
                .map(|cols| (!cols.is_empty()).then_some(cols));
            lookup.record(table, result);
        }
        lookup
    }

    async fn set_identity_generation(
        &self,
        columns: &BTreeMap<TableName, Vec<String>>,
        kind: IdentityKind,
    ) -> Result<FixupOutcome> {
        let mut outcome = FixupOutcome::default();
        for (table, cols) in columns {
            for column in cols {
                let object = format!("{}.{}", table, column);
                let result: Result<()> = async {
                    let table_sql = self.qualified_table(table)?;
                    let column_sql = self.dialect().quote_identifier(&table.qualified(), column)?;
                    if let Some(sql) =
                        self.dialect()
                            .identity_generation_sql(&table_sql, &column_sql, kind)
                    {
                        self.execute_standalone(&sql).await?;
                    }
                    Ok(())
                }
                .await;
                outcome.record(object, result);
            }
        }
        Ok(outcome)
    }

    /// Let the import supply values for GENERATED ALWAYS identity columns.
    async fn disable_generated_always_identity(
        &self,
        columns: &BTreeMap<TableName, Vec<String>>,
    ) -> Result<FixupOutcome> {
        self.set_identity_generation(columns, IdentityKind::ByDefault)
            .await
    }

    async fn enable_generated_always_identity(
        &self,
        columns: &BTreeMap<TableName, Vec<String>>,
    ) -> Result<FixupOutcome> {
        self.set_identity_generation(columns, IdentityKind::Always)
            .await
    }

    async fn enable_generated_by_default_identity(
        &self,
        columns: &BTreeMap<TableName, Vec<String>>,
    ) -> Result<FixupOutcome> {
        self.set_identity_generation(columns, IdentityKind::ByDefault)
            .await
    }

    /// Columns of each table's non-primary unique keys (deduplicated, in key order).
    async fn unique_key_columns(&self, tables: &[TableName]) -> TableLookup<Vec<String>> {
        let mut lookup = TableLookup::default();
        for table in tables {
            let sql = self
                .dialect()
                .unique_key_columns_sql(&self.target_table(table));
            let result = self.query_standalone(&sql).await.map(|rows| {
                let mut columns: Vec<String> = Vec::new();
                for col in rows.into_iter().filter_map(|row| row.into_iter().nth(1)) {
                    if !columns.contains(&col) {
                        columns.push(col);
                    }
                }
                (!columns.is_empty()).then_some(columns)
            });
            lookup.record(table, result);
        }
        lookup
    }

    async fn invalid_indexes(&self) -> Result<BTreeSet<String>> {
        let schema = self.target_schema().to_string();
        match self.dialect().invalid_indexes_sql(&schema) {
            Some(sql) => Ok(self
                .query_standalone(&sql)
                .await?
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .collect()),
            None => Ok(BTreeSet::new()),
        }
    }

    /// Tables holding at least one row; `found` lists only those.
    async fn non_empty_tables(&self, tables: &[TableName]) -> TableLookup<()> {
        let mut lookup = TableLookup::default();
        for table in tables {
            let result = match self.qualified_table(table) {
                Ok(table_sql) => {
                    let sql = self.dialect().non_empty_probe_sql(&table_sql);
                    self.query_standalone(&sql)
                        .await
                        .map(|rows| (!rows.is_empty()).then_some(()))
                }
                Err(e) => Err(e),
            };
            lookup.record(table, result);
        }
        lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockEngine;
    use serde_json::json;

    fn event(op: EventOp, key: &[(&str, Value)], fields: &[(&str, Value)]) -> ChangeEvent {
        ChangeEvent {
            vsn: 7,
            op,
            table_name: TableName::parse("public.users"),
            key: key.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            fields: fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    #[test]
    fn test_event_statements() {
        let engine = MockEngine::new();
        let d = engine.dialect();
        let insert = event(
            EventOp::Insert,
            &[],
            &[("id", json!(1)), ("name", json!("O'Hara")), ("active", json!(true))],
        );
        assert_eq!(
            d.event_statement("public.users", &insert).unwrap(),
            "INSERT INTO public.users (active, id, name) VALUES (TRUE, 1, 'O''Hara')"
        );

        let update = event(EventOp::Update, &[("id", json!(1))], &[("name", Value::Null)]);
        assert_eq!(
            d.event_statement("public.users", &update).unwrap(),
            "UPDATE public.users SET name = NULL WHERE id = 1"
        );

        let delete = event(EventOp::Delete, &[("id", json!(1)), ("user", Value::Null)], &[]);
        assert_eq!(
            d.event_statement("public.users", &delete).unwrap(),
            "DELETE FROM public.users WHERE id = 1 AND \"user\" IS NULL"
        );
    }

    #[test]
    fn test_event_without_key_rejected() {
        let engine = MockEngine::new();
        let err = engine
            .dialect()
            .event_statement("t", &event(EventOp::Delete, &[], &[]))
            .unwrap_err();
        assert_eq!(err.class(), Some(ErrorClass::NonRetryable));
    }

    #[tokio::test]
    async fn test_run_in_transaction_commits_on_success() {
        let engine = MockEngine::new();
        let n = run_in_transaction(&engine, |mut tx| async move {
            let r = tx.execute("SELECT 1").await;
            (tx, r)
        })
        .await
        .unwrap();
        assert_eq!(n, 1);
        assert_eq!(engine.commits(), 1);
        assert_eq!(engine.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_run_in_transaction_rolls_back_on_error() {
        let engine = MockEngine::new();
        let result: Result<()> = run_in_transaction(&engine, |tx| async move {
            (tx, Err(MigrateError::State("boom".into())))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(engine.commits(), 0);
        assert_eq!(engine.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_fixup_failures_do_not_abort_siblings() {
        let engine = MockEngine::new();
        engine.fail_statements_containing("bad_seq");
        let values = BTreeMap::from([
            ("public.bad_seq".to_string(), 10),
            ("public.good_seq".to_string(), 20),
        ]);
        let outcome = engine.restore_sequences(&values).await.unwrap();
        assert_eq!(outcome.succeeded, vec!["public.good_seq".to_string()]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].object, "public.bad_seq");
    }

    #[tokio::test]
    async fn test_unique_key_lookup_keeps_going_past_a_failed_table() {
        let engine = MockEngine::new();
        engine.respond_to(
            "unique keys of public.users",
            &[&["uk_email", "email"], &["uk_email_tenant", "email"], &["uk_email_tenant", "tenant"]],
        );
        engine.fail_statements_containing("unique keys of public.broken");
        let tables = [
            TableName::parse("public.broken"),
            TableName::parse("public.users"),
            TableName::parse("public.plain"),
        ];

        let lookup = engine.unique_key_columns(&tables).await;
        assert_eq!(lookup.tables(), vec![TableName::parse("public.users")]);
        assert_eq!(
            lookup.found[&TableName::parse("public.users")],
            vec!["email".to_string(), "tenant".to_string()]
        );
        assert_eq!(lookup.failures.len(), 1);
        assert_eq!(lookup.failures[0].object, "public.broken");
    }

    #[tokio::test]
    async fn test_non_empty_tables_reports_failed_tables() {
        let engine = MockEngine::new();
        engine.respond_to("FROM public.orders", &[&["1"]]);
        engine.fail_statements_containing("FROM public.locked");
        let tables = [
            TableName::parse("public.orders"),
            TableName::parse("public.locked"),
            TableName::parse("public.empty"),
        ];

        let lookup = engine.non_empty_tables(&tables).await;
        assert_eq!(lookup.tables(), vec![TableName::parse("public.orders")]);
        assert!(!lookup.is_clean());
        assert_eq!(lookup.failures[0].object, "public.locked");
    }

    #[tokio::test]
    async fn test_identity_lookup_per_table() {
        let engine = MockEngine::new();
        engine.respond_to("ALWAYS columns of public.orders", &[&["id"]]);
        engine.fail_statements_containing("columns of public.broken");
        let tables = [TableName::parse("public.broken"), TableName::parse("public.orders")];

        let lookup = engine
            .identity_columns_by_table(&tables, IdentityKind::Always)
            .await;
        assert_eq!(
            lookup.found,
            BTreeMap::from([(TableName::parse("public.orders"), vec!["id".to_string()])])
        );
        assert_eq!(lookup.failures.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_indexes_listed() {
        let engine = MockEngine::new();
        engine.respond_to("invalid indexes in public", &[&["orders_idx"], &["users_idx"]]);
        let invalid = engine.invalid_indexes().await.unwrap();
        assert_eq!(
            invalid,
            BTreeSet::from(["orders_idx".to_string(), "users_idx".to_string()])
        );

        engine.fail_statements_containing("invalid indexes");
        assert!(engine.invalid_indexes().await.is_err());
    }

    #[tokio::test]
    async fn test_identity_generation_switch_statements() {
        let engine = MockEngine::new();
        engine.fail_statements_containing("public.broken");
        let columns = BTreeMap::from([
            (TableName::parse("public.broken"), vec!["id".to_string()]),
            (TableName::parse("public.orders"), vec!["id".to_string()]),
        ]);

        let outcome = engine.disable_generated_always_identity(&columns).await.unwrap();
        assert_eq!(outcome.succeeded, vec!["public.orders.id".to_string()]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(
            engine.committed_statements(),
            vec!["ALTER TABLE public.orders ALTER COLUMN id SET GENERATED BY DEFAULT".to_string()]
        );
    }

    #[test]
    fn test_target_table_uses_role_schema() {
        let engine = MockEngine::new();
        let t = engine.target_table(&TableName::parse("SALES.orders"));
        assert_eq!(t, TableName::new("public", "orders"));
        assert_eq!(
            engine.qualified_table(&TableName::parse("x.Order")).unwrap(),
            "public.\"Order\""
        );
    }
}
