//! Change events, event batches and per-type counters.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;
use std::path::Path;
use uuid::Uuid;

use super::schema::TableName;
use crate::error::{MigrateError, Result};

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOp {
    #[serde(alias = "c", alias = "INSERT")]
    Insert,
    #[serde(alias = "u", alias = "UPDATE")]
    Update,
    #[serde(alias = "d", alias = "DELETE")]
    Delete,
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventOp::Insert => write!(f, "insert"),
            EventOp::Update => write!(f, "update"),
            EventOp::Delete => write!(f, "delete"),
        }
    }
}

/// One captured row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Monotonic sequence number assigned at capture, in source commit order.
    pub vsn: i64,
    pub op: EventOp,
    pub table_name: TableName,
    /// Key columns identifying the row (update/delete).
    #[serde(default)]
    pub key: BTreeMap<String, Value>,
    /// New column values (insert/update).
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
}

impl ChangeEvent {
    /// Approximate payload size of the event's keys and values.
    pub fn payload_bytes(&self) -> usize {
        self.key
            .iter()
            .chain(self.fields.iter())
            .map(|(k, v)| k.len() + v.to_string().len())
            .sum()
    }
}

/// Per-table counts of the operations in `events`.
pub fn count_events(events: &[ChangeEvent]) -> BTreeMap<TableName, EventCounter> {
    let mut counts: BTreeMap<TableName, EventCounter> = BTreeMap::new();
    for event in events {
        counts
            .entry(event.table_name.clone())
            .or_default()
            .record(event.op);
    }
    counts
}

/// Ordered events of one channel, applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub migration_uuid: Uuid,
    pub channel: usize,
    pub events: Vec<ChangeEvent>,
}

impl EventBatch {
    pub fn new(migration_uuid: Uuid, channel: usize, events: Vec<ChangeEvent>) -> Self {
        Self {
            migration_uuid,
            channel,
            events,
        }
    }

    /// Batch sequence: the VSN of the last event, or -1 for an empty batch.
    pub fn sequence(&self) -> i64 {
        self.events.last().map(|e| e.vsn).unwrap_or(-1)
    }

    /// Position of the first event whose VSN does not increase.
    pub fn first_out_of_order(&self) -> Option<usize> {
        self.events
            .windows(2)
            .position(|w| w[1].vsn <= w[0].vsn)
            .map(|i| i + 1)
    }

    /// Per-table counts of the operations in this batch.
    pub fn counts_by_table(&self) -> BTreeMap<TableName, EventCounter> {
        count_events(&self.events)
    }

    /// Index of the first event past `last_applied`; events before it were already applied.
    ///
    /// Assumes VSNs increase through the batch.
    pub fn pending_from(&self, last_applied: Option<i64>) -> usize {
        match last_applied {
            Some(last) => self.events.partition_point(|e| e.vsn <= last),
            None => 0,
        }
    }

    /// Approximate payload size, used against the engine's batch size limit.
    pub fn payload_bytes(&self) -> usize {
        self.events.iter().map(ChangeEvent::payload_bytes).sum()
    }
}

/// Counts of inserts, updates and deletes. Only ever increases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounter {
    #[serde(default)]
    pub inserts: i64,
    #[serde(default)]
    pub updates: i64,
    #[serde(default)]
    pub deletes: i64,
}

impl EventCounter {
    pub fn new(inserts: i64, updates: i64, deletes: i64) -> Self {
        Self {
            inserts,
            updates,
            deletes,
        }
    }

    pub fn record(&mut self, op: EventOp) {
        match op {
            EventOp::Insert => self.inserts += 1,
            EventOp::Update => self.updates += 1,
            EventOp::Delete => self.deletes += 1,
        }
    }

    pub fn total(&self) -> i64 {
        self.inserts + self.updates + self.deletes
    }

    pub fn is_zero(&self) -> bool {
        self.total() == 0
    }
}

impl AddAssign for EventCounter {
    fn add_assign(&mut self, rhs: Self) {
        self.inserts += rhs.inserts;
        self.updates += rhs.updates;
        self.deletes += rhs.deletes;
    }
}

/// Channel of a table, stable across processes and restarts.
pub fn channel_for(table: &TableName, channels: usize) -> usize {
    let digest = Sha256::digest(table.qualified().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % channels.max(1) as u64) as usize
}

/// Bounds on one event batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_events: usize,
    pub max_bytes: usize,
}

/// Split events into per-channel batches, keeping the input order inside each channel.
///
/// A channel's events are cut into consecutive batches of at most
/// `limits.max_events` events and `limits.max_bytes` payload bytes. An event
/// larger than `max_bytes` on its own becomes a single-event batch, which the
/// applier rejects.
pub fn route_events(
    migration_uuid: Uuid,
    events: Vec<ChangeEvent>,
    channels: usize,
    limits: BatchLimits,
) -> Vec<EventBatch> {
    let mut by_channel: BTreeMap<usize, Vec<ChangeEvent>> = BTreeMap::new();
    for event in events {
        by_channel
            .entry(channel_for(&event.table_name, channels))
            .or_default()
            .push(event);
    }

    let max_events = limits.max_events.max(1);
    let mut batches = Vec::new();
    for (channel, events) in by_channel {
        let mut current: Vec<ChangeEvent> = Vec::new();
        let mut current_bytes = 0usize;
        for event in events {
            let size = event.payload_bytes();
            if !current.is_empty()
                && (current.len() >= max_events || current_bytes + size > limits.max_bytes)
            {
                batches.push(EventBatch::new(
                    migration_uuid,
                    channel,
                    std::mem::take(&mut current),
                ));
                current_bytes = 0;
            }
            current_bytes += size;
            current.push(event);
        }
        if !current.is_empty() {
            batches.push(EventBatch::new(migration_uuid, channel, current));
        }
    }
    batches
}

/// Read a JSON-lines event file. Blank lines are skipped.
pub async fn read_event_file(path: &Path) -> Result<Vec<ChangeEvent>> {
    let content = tokio::fs::read_to_string(path).await?;
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line).map_err(|e| {
                MigrateError::State(format!("{}:{}: invalid event: {}", path.display(), n + 1, e))
            })
        })
        .collect()
}
