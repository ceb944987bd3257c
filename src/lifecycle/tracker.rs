use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::{
    db::{Database, MergeReport},
    error::{RelayError, RelayResult},
    merge::prepare_batch,
    models::{
        DeviceState, Process, ProcessChanges, Session, SessionId, StreamId, TelemetryBatch,
    },
};

use super::state::{alive_process, diff_processes, StreamLifecycle};

/// What happened to one polled batch.
#[derive(Debug, Clone, PartialEq)]
pub enum TickMerge {
    /// The stream went away before the batch could land.
    Disconnected,
    /// No open session on the stream; telemetry was dropped.
    NoSession,
    Merged {
        session_id: SessionId,
        report: MergeReport,
    },
    /// The session was closed while the tick was in flight.
    Stale { session_id: SessionId },
}

/// Single mutation point for one stream instance. Processes are tracked per
/// instance (`boot_id`); records left by earlier instances are history.
pub struct LifecycleTracker {
    stream_id: StreamId,
    boot_id: String,
    db: Database,
    state: Mutex<StreamLifecycle>,
}

impl LifecycleTracker {
    pub fn new(stream_id: StreamId, boot_id: impl Into<String>, db: Database) -> Self {
        Self {
            stream_id,
            boot_id: boot_id.into(),
            db,
            state: Mutex::new(StreamLifecycle::new()),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.is_connected()
    }

    /// The session a tick should deliver into, read before the agent is
    /// polled. Pass it back to [`merge_tick`](Self::merge_tick).
    pub async fn open_session_id(&self) -> RelayResult<Option<SessionId>> {
        Ok(self
            .db
            .open_session_for_stream(self.stream_id)
            .await?
            .map(|session| session.session_id))
    }

    async fn reconcile_locked(&self, observed: &[Process]) -> RelayResult<ProcessChanges> {
        let known = self
            .db
            .list_instance_processes(self.stream_id, &self.boot_id)
            .await?;
        let changes = diff_processes(&known, observed);
        if changes.is_empty() {
            return Ok(changes);
        }

        for process in &changes.started {
            debug!(
                "stream {}: process {} ({}) started",
                self.stream_id, process.pid, process.name
            );
        }
        for process in &changes.died {
            info!(
                "stream {}: process {} ({}) is dead",
                self.stream_id, process.pid, process.name
            );
        }
        self.db
            .apply_process_changes(self.stream_id, &self.boot_id, changes.clone())
            .await?;
        Ok(changes)
    }

    /// Bring the stored process list in line with the agent's report.
    pub async fn reconcile_processes(&self, observed: Vec<Process>) -> RelayResult<ProcessChanges> {
        let state = self.state.lock().await;
        if !state.is_connected() {
            return Ok(ProcessChanges::default());
        }
        self.reconcile_locked(&observed).await
    }

    /// Apply one tick's results: process list first, then the telemetry of
    /// `target`, the session that was open when the tick started polling.
    /// If that session has been ended (or replaced) since, the batch is
    /// dropped as stale.
    pub async fn merge_tick(
        &self,
        target: Option<SessionId>,
        observed: Vec<Process>,
        batch: TelemetryBatch,
        allocation_limit: usize,
    ) -> RelayResult<TickMerge> {
        let state = self.state.lock().await;
        if !state.is_connected() {
            return Ok(TickMerge::Disconnected);
        }

        self.reconcile_locked(&observed).await?;

        let Some(target) = target else {
            return Ok(TickMerge::NoSession);
        };
        let session = match self.db.open_session_for_stream(self.stream_id).await? {
            Some(session) if session.session_id == target => session,
            _ => {
                warn!(
                    "stream {}: session {target} ended during the tick, dropped its batch",
                    self.stream_id
                );
                return Ok(TickMerge::Stale { session_id: target });
            }
        };

        let batch = prepare_batch(batch, session.pid);
        let applied = self
            .db
            .apply_batch(session.session_id, batch, allocation_limit)
            .await
            .map_err(RelayError::from);

        match applied {
            Ok(report) => Ok(TickMerge::Merged {
                session_id: session.session_id,
                report,
            }),
            Err(RelayError::StaleWrite { session_id }) => {
                warn!("stream {}: dropped batch for closed session {session_id}", self.stream_id);
                Ok(TickMerge::Stale { session_id })
            }
            Err(err) => Err(err),
        }
    }

    /// Open a session for an alive process on a connected stream.
    pub async fn begin_session(&self, pid: i32, now: i64) -> RelayResult<Session> {
        let state = self.state.lock().await;
        if !state.is_connected() {
            return Err(RelayError::StreamDisconnected(self.stream_id));
        }

        let known = self
            .db
            .list_instance_processes(self.stream_id, &self.boot_id)
            .await?;
        let process = alive_process(&known, pid).ok_or(RelayError::ProcessNotAlive {
            stream_id: self.stream_id,
            pid,
        })?;

        let session = self
            .db
            .insert_session(self.stream_id, pid, &process.name, now)
            .await?;
        info!(
            "stream {}: began session {} for pid {pid}",
            self.stream_id, session.session_id
        );
        Ok(session)
    }

    /// Close a session and fail its in-flight operations. Ending a closed
    /// session returns it unchanged.
    pub async fn end_session(&self, session_id: SessionId, now: i64) -> RelayResult<Session> {
        let _state = self.state.lock().await;
        let session = self.db.close_session(session_id, now).await?;
        info!(
            "stream {}: session {session_id} closed at {}",
            self.stream_id, session.end_timestamp
        );
        Ok(session)
    }

    pub async fn end_open_session(&self, now: i64) -> RelayResult<Option<Session>> {
        let _state = self.state.lock().await;
        let Some(open) = self.db.open_session_for_stream(self.stream_id).await? else {
            return Ok(None);
        };
        let session = self.db.close_session(open.session_id, now).await?;
        info!(
            "stream {}: session {} closed at {}",
            self.stream_id, session.session_id, session.end_timestamp
        );
        Ok(Some(session))
    }

    /// `Connected -> Disconnected`: every alive process on the stream dies.
    /// Open sessions stay open until explicitly ended.
    pub async fn disconnect(&self) -> RelayResult<bool> {
        let mut state = self.state.lock().await;
        if !state.disconnect() {
            return Ok(false);
        }

        self.db
            .set_device_state(self.stream_id, DeviceState::Disconnected)
            .await?;
        let dead = self.db.mark_stream_processes_dead(self.stream_id).await?;
        warn!(
            "stream {} disconnected, {dead} process(es) marked dead",
            self.stream_id
        );
        Ok(true)
    }
}
