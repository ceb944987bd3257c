//! Reconciling polled telemetry with what the store already holds.
//!
//! The decisions here are pure; `db::repositories::records` applies them
//! inside one transaction per batch.

pub mod threads;

pub use threads::synthesize_thread_activity;

use crate::models::{TelemetryBatch, TelemetryRecord};

/// What to do with one incoming record.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeAction<T> {
    /// New identity: store it.
    Insert(T),
    /// Same identity is stored open-ended and the incoming copy is closed:
    /// rewrite the stored record with this closed value.
    Close(T),
    /// Stored copy is already closed; the incoming one is a re-poll.
    Duplicate,
    /// Both copies are still open.
    Unchanged,
}

pub fn reconcile<T: TelemetryRecord>(existing: Option<&T>, incoming: &T) -> MergeAction<T> {
    let Some(stored) = existing else {
        return MergeAction::Insert(incoming.clone());
    };

    if !stored.is_open_ended() {
        return MergeAction::Duplicate;
    }

    if incoming.is_open_ended() {
        return MergeAction::Unchanged;
    }

    // Close from the stored copy so start time and identity stay as first seen.
    // An end the agent reports at or before the start still closes after it.
    let end = incoming
        .end_timestamp()
        .max(stored.timestamp().saturating_add(1));
    MergeAction::Close(stored.close(end, incoming.status()))
}

fn order_for_merge<T: TelemetryRecord>(records: &mut Vec<T>, pid: i32) {
    records.retain(|record| record.pid() == pid);
    records.sort_by_key(|record| record.merge_order());
}

/// Keep only `pid`'s records and put every kind in deterministic merge order:
/// ascending group id (thread id), then timestamp, then identity.
pub fn prepare_batch(mut batch: TelemetryBatch, pid: i32) -> TelemetryBatch {
    order_for_merge(&mut batch.memory, pid);
    order_for_merge(&mut batch.cpu, pid);
    order_for_merge(&mut batch.gc_pauses, pid);
    order_for_merge(&mut batch.heap_dumps, pid);
    order_for_merge(&mut batch.allocation_tracking, pid);
    order_for_merge(&mut batch.threads, pid);
    order_for_merge(&mut batch.allocations, pid);
    batch
}
