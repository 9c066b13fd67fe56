//! Core abstractions shared by every engine and pass.
//!
//! - [`identifier`]: identifier validation and per-engine quoting
//! - [`schema`]: table identity and source column metadata
//! - [`batch`]: snapshot batch descriptors and completion markers
//! - [`event`]: change events, event batches and counters
//! - [`traits`]: the dialect, transaction and engine capability traits

pub mod batch;
pub mod event;
pub mod identifier;
pub mod schema;
pub mod traits;

// Re-export commonly used types for convenience
pub use batch::{BatchKey, FileFormat, ImportBatchArgs, ImportCompletionMarker};
pub use event::{route_events, BatchLimits, ChangeEvent, EventBatch, EventCounter, EventOp};
pub use schema::{SourceColumn, TableName, TableSchema};
pub use traits::{
    run_in_transaction, BulkLoadTarget, EngineDialect, FixupOutcome, IdentityKind, ObjectFailure,
    TableLookup, TargetEngine, TargetTx,
};
