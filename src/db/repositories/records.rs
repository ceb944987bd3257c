//! Telemetry records, all kinds in one table.
//!
//! Rows are keyed by `(session_id, kind, group_id, identity)`. Points store
//! `end_ns = start_ns`, open intervals store `end_ns = OPEN_END`.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    db::{
        helpers::{decode_payload, encode_payload},
        Database,
    },
    error::RelayError,
    merge::{reconcile, MergeAction},
    models::{
        AllocationEvent, AllocationTrackingInfo, HeapDumpInfo, IntervalStatus, RecordKind,
        RecordShape, SessionId, TelemetryBatch, TelemetryRecord, ThreadStateEvent, OPEN_END,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Closed,
    Unchanged,
}

/// Counts for one applied batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub inserted: usize,
    pub closed: usize,
    pub duplicates: usize,
    pub unchanged: usize,
    pub pruned: usize,
}

impl MergeReport {
    /// Whether the batch changed anything a query could observe.
    pub fn changed(&self) -> bool {
        self.inserted + self.closed + self.pruned > 0
    }
}

/// End time given to an operation aborted at `now`: strictly after its start.
pub fn aborted_end(start: i64, now: i64) -> i64 {
    now.max(start.saturating_add(1))
}

pub(crate) fn ensure_session_open(conn: &Connection, session_id: SessionId) -> Result<()> {
    let end_ns: Option<i64> = conn
        .query_row(
            "SELECT end_ns FROM sessions WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;

    match end_ns {
        None => Err(RelayError::SessionNotFound(session_id).into()),
        Some(end) if end != OPEN_END => Err(RelayError::StaleWrite { session_id }.into()),
        Some(_) => Ok(()),
    }
}

fn load_existing<T: TelemetryRecord>(
    conn: &Connection,
    session_id: SessionId,
    group: i64,
    identity: i64,
) -> Result<Option<T>> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM records
             WHERE session_id = ?1 AND kind = ?2 AND group_id = ?3 AND identity = ?4",
            params![session_id, T::KIND.as_str(), group, identity],
            |row| row.get(0),
        )
        .optional()?;

    payload.map(|raw| decode_payload(&raw)).transpose()
}

fn insert_row<T: TelemetryRecord>(conn: &Connection, session_id: SessionId, record: &T) -> Result<()> {
    conn.execute(
        "INSERT INTO records (session_id, kind, group_id, identity, start_ns, end_ns, payload)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            session_id,
            T::KIND.as_str(),
            record.group(),
            record.identity(),
            record.timestamp(),
            record.end_timestamp(),
            encode_payload(record)?,
        ],
    )
    .with_context(|| format!("failed to insert {} record", T::KIND.as_str()))?;
    Ok(())
}

fn replace_row<T: TelemetryRecord>(
    conn: &Connection,
    session_id: SessionId,
    record: &T,
) -> Result<()> {
    conn.execute(
        "UPDATE records
         SET end_ns = ?5,
             payload = ?6
         WHERE session_id = ?1 AND kind = ?2 AND group_id = ?3 AND identity = ?4",
        params![
            session_id,
            T::KIND.as_str(),
            record.group(),
            record.identity(),
            record.end_timestamp(),
            encode_payload(record)?,
        ],
    )
    .with_context(|| format!("failed to close {} record", T::KIND.as_str()))?;
    Ok(())
}

/// Append or close one record. A record whose identity is already stored
/// closed fails with `RelayError::Conflict`.
pub(crate) fn merge_record<T: TelemetryRecord>(
    conn: &Connection,
    session_id: SessionId,
    incoming: &T,
) -> Result<AppendOutcome> {
    let existing: Option<T> = load_existing(conn, session_id, incoming.group(), incoming.identity())?;

    match reconcile(existing.as_ref(), incoming) {
        MergeAction::Insert(record) => {
            insert_row(conn, session_id, &record)?;
            Ok(AppendOutcome::Inserted)
        }
        MergeAction::Close(record) => {
            replace_row(conn, session_id, &record)?;
            Ok(AppendOutcome::Closed)
        }
        MergeAction::Unchanged => Ok(AppendOutcome::Unchanged),
        MergeAction::Duplicate => Err(RelayError::Conflict {
            kind: T::KIND,
            identity: incoming.identity(),
        }
        .into()),
    }
}

fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<RelayError>(), Some(RelayError::Conflict { .. }))
}

fn merge_all<T: TelemetryRecord>(
    conn: &Connection,
    session_id: SessionId,
    records: &[T],
    report: &mut MergeReport,
) -> Result<()> {
    for record in records {
        match merge_record(conn, session_id, record) {
            Ok(AppendOutcome::Inserted) => report.inserted += 1,
            Ok(AppendOutcome::Closed) => report.closed += 1,
            Ok(AppendOutcome::Unchanged) => report.unchanged += 1,
            Err(err) if is_conflict(&err) => report.duplicates += 1,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub(crate) fn merge_batch(
    conn: &Connection,
    session_id: SessionId,
    batch: &TelemetryBatch,
) -> Result<MergeReport> {
    let mut report = MergeReport::default();
    merge_all(conn, session_id, &batch.memory, &mut report)?;
    merge_all(conn, session_id, &batch.cpu, &mut report)?;
    merge_all(conn, session_id, &batch.gc_pauses, &mut report)?;
    merge_all(conn, session_id, &batch.heap_dumps, &mut report)?;
    merge_all(conn, session_id, &batch.allocation_tracking, &mut report)?;
    merge_all(conn, session_id, &batch.threads, &mut report)?;
    merge_all(conn, session_id, &batch.allocations, &mut report)?;
    Ok(report)
}

/// Force every still-open record of `T` to `Failed`, ending at
/// [`aborted_end`]. Returns how many were closed.
pub(crate) fn fail_open_records<T: TelemetryRecord>(
    conn: &Connection,
    session_id: SessionId,
    now: i64,
) -> Result<usize> {
    let open: Vec<T> = query_open(conn, session_id)?;
    for record in &open {
        let failed = record.close(aborted_end(record.timestamp(), now), IntervalStatus::Failed);
        replace_row(conn, session_id, &failed)?;
    }
    Ok(open.len())
}

/// Abort every in-flight agent operation (heap dumps, allocation tracking)
/// recorded for the session. Live allocations stay live.
pub(crate) fn fail_open_operations(
    conn: &Connection,
    session_id: SessionId,
    now: i64,
) -> Result<usize> {
    Ok(fail_open_records::<HeapDumpInfo>(conn, session_id, now)?
        + fail_open_records::<AllocationTrackingInfo>(conn, session_id, now)?)
}

/// Delete the oldest freed allocations once a session holds more than
/// `limit`. Live allocations are kept regardless.
pub(crate) fn prune_allocations(
    conn: &Connection,
    session_id: SessionId,
    limit: usize,
) -> Result<usize> {
    let kind = RecordKind::Allocation.as_str();
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE session_id = ?1 AND kind = ?2",
        params![session_id, kind],
        |row| row.get(0),
    )?;

    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    if count <= limit {
        return Ok(0);
    }

    let pruned = conn
        .execute(
            "DELETE FROM records WHERE rowid IN (
                 SELECT rowid FROM records
                 WHERE session_id = ?1 AND kind = ?2 AND end_ns < ?3
                 ORDER BY end_ns
                 LIMIT ?4
             )",
            params![session_id, kind, OPEN_END, count - limit],
        )
        .context("failed to prune allocation records")?;
    Ok(pruned)
}

fn collect_payloads<T: TelemetryRecord>(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<T>> {
    let payloads = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    payloads.iter().map(|raw| decode_payload(raw)).collect()
}

pub(crate) fn query_range_conn<T: TelemetryRecord>(
    conn: &Connection,
    session_id: SessionId,
    start: i64,
    end: i64,
) -> Result<Vec<T>> {
    let sql = match T::KIND.shape() {
        RecordShape::Point => {
            "SELECT payload FROM records
             WHERE session_id = ?1 AND kind = ?2 AND start_ns >= ?3 AND start_ns < ?4
             ORDER BY start_ns, group_id, identity"
        }
        // Half-open overlap: ending exactly at `start` does not count.
        RecordShape::Interval => {
            "SELECT payload FROM records
             WHERE session_id = ?1 AND kind = ?2 AND start_ns < ?4 AND end_ns > ?3
             ORDER BY start_ns, group_id, identity"
        }
    };
    let mut stmt = conn.prepare(sql)?;
    collect_payloads(&mut stmt, params![session_id, T::KIND.as_str(), start, end])
}

fn query_open<T: TelemetryRecord>(conn: &Connection, session_id: SessionId) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(
        "SELECT payload FROM records
         WHERE session_id = ?1 AND kind = ?2 AND end_ns = ?3
         ORDER BY start_ns, group_id, identity",
    )?;
    collect_payloads(&mut stmt, params![session_id, T::KIND.as_str(), OPEN_END])
}

impl Database {
    /// Add or close a single record in an open session.
    pub async fn append<T: TelemetryRecord>(
        &self,
        session_id: SessionId,
        record: T,
    ) -> Result<AppendOutcome> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            ensure_session_open(&tx, session_id)?;
            let outcome = merge_record(&tx, session_id, &record)?;
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    /// Apply one polled batch atomically. Duplicates are counted, not raised;
    /// a closed or missing session rejects the whole batch.
    pub async fn apply_batch(
        &self,
        session_id: SessionId,
        batch: TelemetryBatch,
        allocation_limit: usize,
    ) -> Result<MergeReport> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            ensure_session_open(&tx, session_id)?;
            let mut report = merge_batch(&tx, session_id, &batch)?;
            report.pruned = prune_allocations(&tx, session_id, allocation_limit)?;
            tx.commit()?;
            Ok(report)
        })
        .await
    }

    pub async fn query_range<T: TelemetryRecord>(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Result<Vec<T>> {
        self.execute(move |conn| query_range_conn(conn, session_id, start, end))
            .await
    }

    pub async fn open_records<T: TelemetryRecord>(&self, session_id: SessionId) -> Result<Vec<T>> {
        self.execute(move |conn| query_open(conn, session_id)).await
    }

    pub async fn record_count(&self, session_id: SessionId, kind: RecordKind) -> Result<usize> {
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE session_id = ?1 AND kind = ?2",
                params![session_id, kind.as_str()],
                |row| row.get(0),
            )?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }

    /// Largest finite timestamp stored for the session, if any.
    pub async fn latest_data_timestamp(&self, session_id: SessionId) -> Result<Option<i64>> {
        self.execute(move |conn| {
            let latest: Option<i64> = conn.query_row(
                "SELECT MAX(CASE WHEN end_ns = ?2 THEN start_ns ELSE end_ns END)
                 FROM records WHERE session_id = ?1",
                params![session_id, OPEN_END],
                |row| row.get(0),
            )?;
            Ok(latest)
        })
        .await
    }

    /// Objects allocated before `at` and not yet freed at `at`.
    pub async fn live_allocations(
        &self,
        session_id: SessionId,
        at: i64,
    ) -> Result<Vec<AllocationEvent>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM records
                 WHERE session_id = ?1 AND kind = ?2 AND start_ns < ?3 AND end_ns > ?3
                 ORDER BY start_ns, identity",
            )?;
            collect_payloads(
                &mut stmt,
                params![session_id, RecordKind::Allocation.as_str(), at],
            )
        })
        .await
    }

    /// Thread transitions for a window: `(last transition before start per
    /// thread, transitions inside [start, end))`, read in one pass.
    pub async fn thread_events(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Result<(Vec<ThreadStateEvent>, Vec<ThreadStateEvent>)> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT r.payload FROM records r
                 WHERE r.session_id = ?1 AND r.kind = ?2 AND r.start_ns = (
                     SELECT MAX(p.start_ns) FROM records p
                     WHERE p.session_id = r.session_id
                       AND p.kind = r.kind
                       AND p.group_id = r.group_id
                       AND p.start_ns < ?3
                 )
                 ORDER BY r.group_id",
            )?;
            let prior = collect_payloads(
                &mut stmt,
                params![session_id, RecordKind::ThreadState.as_str(), start],
            )?;
            let in_window = query_range_conn(conn, session_id, start, end)?;
            Ok((prior, in_window))
        })
        .await
    }
}
