//! Exactly-once, ordered application of change events.
//!
//! Each batch runs in one transaction that also advances the channel's
//! last-applied sequence and the role's imported counters. Events at or below
//! the recorded sequence are skipped, so a replayed batch has no side effects
//! and an overlapping one only applies and counts its new suffix.

use std::collections::BTreeMap;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::event::count_events;
use crate::core::{run_in_transaction, EventBatch, EventCounter, TableName, TargetEngine, TargetTx};
use crate::error::{ErrorClass, MigrateError, Result, TableFailure};
use crate::reconcile::{ImportedCounters, ImporterRole};
use crate::state::ImportStateStore;

/// Result of applying one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// False when the batch had already been applied and was skipped.
    pub applied: bool,
    /// Per-table counts added by this application (empty when skipped).
    pub counts: BTreeMap<TableName, EventCounter>,
}

/// A channel that stopped on an error. Later batches of that channel were not applied.
#[derive(Debug)]
pub struct ChannelFailure {
    pub channel: usize,
    pub error: MigrateError,
}

/// Totals of an apply pass over many channels.
#[derive(Debug, Default, Serialize)]
pub struct ApplySummary {
    pub batches_applied: usize,
    pub batches_skipped: usize,
    pub counts: BTreeMap<TableName, EventCounter>,
    #[serde(skip)]
    pub failures: Vec<ChannelFailure>,
    pub cancelled: bool,
}

impl ApplySummary {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }

    /// True when every failed channel stopped on a retryable error.
    pub fn failures_retryable(&self) -> bool {
        !self.failures.is_empty() && self.failures.iter().all(|f| f.error.is_retryable())
    }

    /// Stopped channels as one aggregated error.
    pub fn into_result(mut self) -> Result<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        let failures = std::mem::take(&mut self.failures)
            .into_iter()
            .map(|f| TableFailure {
                table: format!("channel {}", f.channel),
                error: f.error,
            })
            .collect();
        Err(MigrateError::Tables(failures))
    }

    /// Fold a retry attempt in: its totals add up, its failures replace ours.
    pub fn merge_retry(&mut self, retry: ApplySummary) {
        self.batches_applied += retry.batches_applied;
        self.batches_skipped += retry.batches_skipped;
        for (table, counts) in retry.counts {
            *self.counts.entry(table).or_default() += counts;
        }
        self.failures = retry.failures;
        self.cancelled = retry.cancelled;
    }

    fn absorb(&mut self, outcome: ApplyOutcome) {
        if outcome.applied {
            self.batches_applied += 1;
        } else {
            self.batches_skipped += 1;
        }
        for (table, counts) in outcome.counts {
            *self.counts.entry(table).or_default() += counts;
        }
    }
}

/// Applies event batches to one importing role's database.
pub struct EventApplier<'a, E: TargetEngine + ?Sized> {
    engine: &'a E,
    state: &'a dyn ImportStateStore,
    counters: ImportedCounters<'a>,
}

impl<'a, E: TargetEngine + ?Sized> EventApplier<'a, E> {
    pub fn new(engine: &'a E, state: &'a dyn ImportStateStore, role: ImporterRole) -> Self {
        Self {
            engine,
            state,
            counters: ImportedCounters::new(role, state),
        }
    }

    /// Apply one batch atomically, in event order, at most once.
    pub async fn apply_event_batch(&self, batch: &EventBatch) -> Result<ApplyOutcome> {
        let uuid = batch.migration_uuid;
        let sequence = batch.sequence();
        if batch.events.is_empty() {
            return Ok(ApplyOutcome::default());
        }
        if let Some(pos) = batch.first_out_of_order() {
            return Err(MigrateError::apply(
                uuid,
                sequence,
                ErrorClass::NonRetryable,
                format!(
                    "event {} has vsn {} which does not follow vsn {}",
                    pos,
                    batch.events[pos].vsn,
                    batch.events[pos - 1].vsn
                ),
            ));
        }
        let size = batch.payload_bytes();
        if size > self.engine.max_batch_size_bytes() {
            return Err(MigrateError::apply(
                uuid,
                sequence,
                ErrorClass::NonRetryable,
                format!(
                    "batch payload of {} bytes exceeds the {} byte limit",
                    size,
                    self.engine.max_batch_size_bytes()
                ),
            ));
        }

        let statements = batch
            .events
            .iter()
            .map(|event| {
                let table_sql = self.engine.qualified_table(&event.table_name)?;
                self.engine.dialect().event_statement(&table_sql, event)
            })
            .collect::<Result<Vec<_>>>()
            .map_err(|e| self.classify(uuid, sequence, e))?;

        let statements = &statements;
        let counts = run_in_transaction(self.engine, |mut tx| async move {
            let result = self.apply_in_tx(tx.as_mut(), batch, statements).await;
            (tx, result)
        })
        .await
        .map_err(|e| self.classify(uuid, sequence, e))?;

        match counts {
            Some(counts) => {
                debug!(
                    role = %self.counters.role(),
                    channel = batch.channel,
                    sequence,
                    events = batch.events.len(),
                    "applied event batch"
                );
                Ok(ApplyOutcome {
                    applied: true,
                    counts,
                })
            }
            None => {
                info!(
                    role = %self.counters.role(),
                    channel = batch.channel,
                    sequence,
                    "event batch already applied, skipping"
                );
                Ok(ApplyOutcome::default())
            }
        }
    }

    /// Execute and count the events past the channel's last applied sequence.
    /// Returns None when every event of the batch was already applied.
    async fn apply_in_tx(
        &self,
        tx: &mut dyn TargetTx,
        batch: &EventBatch,
        statements: &[String],
    ) -> Result<Option<BTreeMap<TableName, EventCounter>>> {
        let uuid = batch.migration_uuid;
        let last = self
            .state
            .last_applied_sequence(tx, uuid, batch.channel)
            .await?;
        let start = batch.pending_from(last);
        if start == batch.events.len() {
            return Ok(None);
        }
        if start > 0 {
            debug!(
                channel = batch.channel,
                skipped = start,
                "batch overlaps events already applied"
            );
        }
        for statement in &statements[start..] {
            tx.execute(statement).await?;
        }
        let counts = count_events(&batch.events[start..]);
        self.counters
            .increment(tx, uuid, batch.channel, &counts)
            .await?;
        self.state
            .record_applied_sequence(tx, uuid, batch.channel, batch.sequence())
            .await?;
        Ok(Some(counts))
    }

    fn classify(&self, uuid: Uuid, sequence: i64, err: MigrateError) -> MigrateError {
        match err {
            MigrateError::Apply { class, message, .. } => {
                MigrateError::apply(uuid, sequence, class, message)
            }
            MigrateError::Cancelled => err,
            MigrateError::Quoting { .. } => {
                MigrateError::apply(uuid, sequence, ErrorClass::NonRetryable, err)
            }
            other => {
                let class = if self.engine.is_non_retryable_error(&other) {
                    ErrorClass::NonRetryable
                } else {
                    ErrorClass::Retryable
                };
                MigrateError::apply(uuid, sequence, class, other)
            }
        }
    }

    /// Apply batches of many channels.
    ///
    /// Batches of one channel run strictly in the given order; a failure stops
    /// that channel only. Channels run concurrently up to the engine's
    /// connection bound. Cancellation is honoured between batches.
    pub async fn apply_batches(
        &self,
        batches: Vec<EventBatch>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> ApplySummary {
        let mut by_channel: BTreeMap<usize, Vec<EventBatch>> = BTreeMap::new();
        for batch in batches {
            by_channel.entry(batch.channel).or_default().push(batch);
        }
        let concurrency = self.engine.max_connections().max(1);

        let results: Vec<(usize, Vec<ApplyOutcome>, Option<MigrateError>)> =
            stream::iter(by_channel)
                .map(|(channel, batches)| {
                    let cancel = cancel.clone();
                    async move {
                        let mut outcomes = Vec::with_capacity(batches.len());
                        for batch in &batches {
                            if cancel.as_ref().map(|c| *c.borrow()).unwrap_or(false) {
                                return (channel, outcomes, Some(MigrateError::Cancelled));
                            }
                            match self.apply_event_batch(batch).await {
                                Ok(outcome) => outcomes.push(outcome),
                                Err(e) => {
                                    warn!(
                                        role = %self.counters.role(),
                                        channel,
                                        "channel stopped: {}",
                                        e
                                    );
                                    return (channel, outcomes, Some(e));
                                }
                            }
                        }
                        (channel, outcomes, None)
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await;

        let mut summary = ApplySummary::default();
        for (channel, outcomes, error) in results {
            for outcome in outcomes {
                summary.absorb(outcome);
            }
            match error {
                Some(MigrateError::Cancelled) => summary.cancelled = true,
                Some(error) => summary.failures.push(ChannelFailure { channel, error }),
                None => {}
            }
        }
        summary.failures.sort_by_key(|f| f.channel);
        summary
    }
}
