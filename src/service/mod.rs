//! The face callers see.
//!
//! Range getters never fail: unknown sessions, inverted ranges and storage
//! trouble all come back as empty responses. Session and command operations
//! return [`RelayResult`].

pub mod context;

pub use context::StreamContext;

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::{
    agent::AgentClient,
    cache::{CacheStats, QueryCache, QueryKind, QueryKey},
    clock::{Clock, DeviceClock},
    db::{AppendOutcome, Database},
    error::{RelayError, RelayResult},
    lifecycle::TickMerge,
    merge::synthesize_thread_activity,
    models::{
        AllocationEvent, AllocationTrackingInfo, CpuUsageSample, Device, DeviceState, GcPause,
        HeapDumpInfo, IntervalStatus, MemorySample, Process, RangeResponse, Session, SessionId,
        SessionImport, StreamId, TelemetryBatch, TelemetryRecord, ThreadActivityResponse,
    },
    poller::run_tick,
    settings::RelayConfig,
};

pub struct QueryService {
    db: Database,
    cache: Arc<QueryCache>,
    local_clock: Arc<dyn Clock>,
    config: RelayConfig,
    streams: RwLock<HashMap<StreamId, Arc<StreamContext>>>,
}

impl QueryService {
    pub fn new(db: Database, local_clock: Arc<dyn Clock>, config: RelayConfig) -> Self {
        Self {
            db,
            cache: Arc::new(QueryCache::new()),
            local_clock,
            config,
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn stream(&self, stream_id: StreamId) -> RelayResult<Arc<StreamContext>> {
        self.streams
            .read()
            .get(&stream_id)
            .cloned()
            .ok_or(RelayError::StreamNotFound(stream_id))
    }

    async fn session(&self, session_id: SessionId) -> RelayResult<Session> {
        self.db
            .get_session(session_id)
            .await?
            .ok_or(RelayError::SessionNotFound(session_id))
    }

    /// The stream context that owns an open session.
    async fn live_session(&self, session_id: SessionId) -> RelayResult<(Session, Arc<StreamContext>)> {
        let session = self.session(session_id).await?;
        if !session.is_open() {
            return Err(RelayError::StaleWrite { session_id });
        }
        let ctx = self.stream(session.stream_id)?;
        Ok((session, ctx))
    }

    // ---- streams -------------------------------------------------------

    /// Register a fresh stream instance. Connecting a stream id that is
    /// already known replaces the old instance: its polling stops and its
    /// processes are left dead.
    pub async fn connect_stream(
        &self,
        stream_id: StreamId,
        serial: &str,
        agent: Arc<dyn AgentClient>,
    ) -> RelayResult<Device> {
        let previous = self.streams.write().remove(&stream_id);
        if let Some(previous) = previous {
            info!("stream {stream_id} reconnecting, retiring previous instance");
            previous.poller.lock().await.stop().await?;
            previous.tracker.disconnect().await?;
        }

        let device = Device {
            stream_id,
            serial: serial.to_string(),
            boot_id: Uuid::new_v4().to_string(),
            state: DeviceState::Connected,
            connected_at: Utc::now(),
        };
        self.db.upsert_device(&device).await?;

        let ctx = Arc::new(StreamContext::new(
            device.clone(),
            agent,
            self.db.clone(),
            Arc::clone(&self.cache),
            DeviceClock::new(Arc::clone(&self.local_clock)),
            self.config.clone(),
        ));
        self.streams.write().insert(stream_id, ctx);
        info!("stream {stream_id} connected ({serial}, boot {})", device.boot_id);
        Ok(device)
    }

    pub async fn start_monitoring(&self, stream_id: StreamId) -> RelayResult<()> {
        let ctx = self.stream(stream_id)?;
        if !ctx.tracker.is_connected().await {
            return Err(RelayError::StreamDisconnected(stream_id));
        }
        let mut poller = ctx.poller.lock().await;
        poller.start(Arc::clone(&ctx))?;
        Ok(())
    }

    /// Cancel future ticks. Merges already applied stay.
    pub async fn stop_monitoring(&self, stream_id: StreamId) -> RelayResult<()> {
        let ctx = self.stream(stream_id)?;
        ctx.poller.lock().await.stop().await?;
        Ok(())
    }

    pub async fn is_monitoring(&self, stream_id: StreamId) -> bool {
        match self.stream(stream_id) {
            Ok(ctx) => ctx.poller.lock().await.is_running(),
            Err(_) => false,
        }
    }

    /// Run one tick now, outside the periodic loop.
    pub async fn poll_once(&self, stream_id: StreamId) -> RelayResult<TickMerge> {
        let ctx = self.stream(stream_id)?;
        run_tick(&ctx).await
    }

    /// Stop every poll loop.
    pub async fn shutdown(&self) {
        let contexts: Vec<Arc<StreamContext>> = self.streams.read().values().cloned().collect();
        for ctx in contexts {
            if let Err(err) = ctx.poller.lock().await.stop().await {
                error!("failed to stop polling stream {}: {err:#}", ctx.stream_id());
            }
        }
    }

    pub async fn get_devices(&self) -> RelayResult<Vec<Device>> {
        Ok(self.db.list_devices().await?)
    }

    pub async fn get_processes(&self, stream_id: StreamId) -> RelayResult<Vec<Process>> {
        Ok(self.db.list_processes(stream_id).await?)
    }

    // ---- sessions ------------------------------------------------------

    /// Open a session for `pid`. The process list is refreshed from the agent
    /// first so a just-launched process can be targeted.
    pub async fn begin_session(&self, stream_id: StreamId, pid: i32) -> RelayResult<Session> {
        let ctx = self.stream(stream_id)?;
        let processes = ctx.command(ctx.agent.get_processes(stream_id)).await?;
        ctx.tracker.reconcile_processes(processes).await?;
        ctx.tracker.begin_session(pid, ctx.clock.now_ns()).await
    }

    /// Close a session at the stream's current time. Ending a closed session
    /// is a no-op that returns it unchanged.
    pub async fn end_session(&self, session_id: SessionId) -> RelayResult<Session> {
        let session = self.session(session_id).await?;
        if !session.is_open() {
            return Ok(session);
        }

        let closed = match self.stream(session.stream_id) {
            Ok(ctx) => ctx.tracker.end_session(session_id, ctx.clock.now_ns()).await?,
            Err(_) => {
                // Left open by an earlier run; no stream to route through.
                let now = self.local_clock.now_ns();
                self.db.close_session(session_id, now).await?
            }
        };
        self.cache.invalidate_session(session_id);
        Ok(closed)
    }

    pub async fn import_session(
        &self,
        import: SessionImport,
        batch: TelemetryBatch,
    ) -> RelayResult<Session> {
        let (session, report) = self.db.import_session(import, batch).await?;
        info!(
            "imported session {} ({} record(s), {} duplicate)",
            session.session_id, report.inserted, report.duplicates
        );
        Ok(session)
    }

    pub async fn delete_session(&self, session_id: SessionId) -> RelayResult<()> {
        self.db.delete_session(session_id).await?;
        self.cache.invalidate_session(session_id);
        Ok(())
    }

    /// All sessions ordered by `(stream_id, start_timestamp)`.
    pub async fn get_sessions(&self) -> RelayResult<Vec<Session>> {
        Ok(self.db.list_sessions().await?)
    }

    // ---- agent commands ------------------------------------------------

    /// Attach the agent to `pid` and open a session for it.
    pub async fn start_profiling_app(&self, stream_id: StreamId, pid: i32) -> RelayResult<Session> {
        let ctx = self.stream(stream_id)?;
        ctx.command(ctx.agent.start_profiling_app(stream_id, pid))
            .await?;
        self.begin_session(stream_id, pid).await
    }

    /// End the open session of `pid` on the stream, then detach the agent.
    /// The session is closed even if the agent cannot be told.
    pub async fn stop_profiling_app(
        &self,
        stream_id: StreamId,
        pid: i32,
    ) -> RelayResult<Option<Session>> {
        let ctx = self.stream(stream_id)?;

        let closed = match self.db.open_session_for_stream(stream_id).await? {
            Some(open) if open.pid == pid => {
                let session = ctx
                    .tracker
                    .end_session(open.session_id, ctx.clock.now_ns())
                    .await?;
                self.cache.invalidate_session(open.session_id);
                Some(session)
            }
            _ => None,
        };

        if let Err(err) = ctx.command(ctx.agent.stop_profiling_app(stream_id, pid)).await {
            warn!("stream {stream_id}: detaching from pid {pid} failed: {err}");
        }
        Ok(closed)
    }

    async fn append_to_session<T: TelemetryRecord>(
        &self,
        session_id: SessionId,
        record: T,
    ) -> RelayResult<AppendOutcome> {
        let outcome = self.db.append(session_id, record).await?;
        self.cache.invalidate_session(session_id);
        Ok(outcome)
    }

    /// Start allocation tracking and record it as in progress.
    pub async fn start_allocation_tracking(
        &self,
        session_id: SessionId,
    ) -> RelayResult<AllocationTrackingInfo> {
        let (session, ctx) = self.live_session(session_id).await?;
        let started_at = ctx
            .command(ctx.agent.start_tracking(session.stream_id, session.pid))
            .await?;

        let info = AllocationTrackingInfo::in_progress(session.pid, started_at);
        self.append_to_session(session_id, info.clone()).await?;
        Ok(info)
    }

    /// Stop the session's running allocation tracking, if any, and close it
    /// as succeeded.
    pub async fn stop_allocation_tracking(
        &self,
        session_id: SessionId,
    ) -> RelayResult<Option<AllocationTrackingInfo>> {
        let (session, ctx) = self.live_session(session_id).await?;
        let open: Vec<AllocationTrackingInfo> = self.db.open_records(session_id).await?;
        let Some(running) = open.into_iter().last() else {
            return Ok(None);
        };

        let stopped_at = ctx
            .command(ctx.agent.stop_tracking(session.stream_id, session.pid))
            .await?;
        let closed = running.close(
            stopped_at.max(running.start_time.saturating_add(1)),
            IntervalStatus::Succeeded,
        );

        match self.append_to_session(session_id, closed.clone()).await {
            Ok(_) => Ok(Some(closed)),
            // A poll delivered the agent's own closing record first.
            Err(RelayError::Conflict { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Ask the agent for a heap dump. The dump is recorded in progress; the
    /// poll that reports it finished closes it.
    pub async fn trigger_heap_dump(&self, session_id: SessionId) -> RelayResult<HeapDumpInfo> {
        let (session, ctx) = self.live_session(session_id).await?;
        let started_at = ctx
            .command(ctx.agent.trigger_heap_dump(session.stream_id, session.pid))
            .await?;

        let dump = HeapDumpInfo::in_progress(session.pid, started_at);
        self.append_to_session(session_id, dump.clone()).await?;
        Ok(dump)
    }

    /// Opaque bytes by id. Fetched from the agent once, then served from the
    /// store even if the stream is gone. Failures yield an empty buffer.
    pub async fn get_bytes(&self, stream_id: StreamId, blob_id: &str) -> Vec<u8> {
        match self.db.get_blob(stream_id, blob_id).await {
            Ok(Some(bytes)) => return bytes,
            Ok(None) => {}
            Err(err) => {
                error!("blob lookup failed for {blob_id}: {err:#}");
                return Vec::new();
            }
        }

        let Ok(ctx) = self.stream(stream_id) else {
            return Vec::new();
        };
        let bytes = match ctx.command(ctx.agent.get_bytes(stream_id, blob_id)).await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!("stream {stream_id}: fetching blob {blob_id} failed: {err}");
                return Vec::new();
            }
        };

        if let Err(err) = self.db.put_blob(stream_id, blob_id, bytes.clone()).await {
            error!("failed to store blob {blob_id}: {err:#}");
        }
        bytes
    }

    // ---- range queries -------------------------------------------------

    async fn cached<T, F, Fut>(
        &self,
        key: QueryKey,
        compute: F,
    ) -> Arc<RangeResponse<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RelayResult<Vec<T>>>,
    {
        if key.end < key.start {
            debug!("invalid range [{}, {}) for session {}", key.start, key.end, key.session_id);
            return Arc::new(RangeResponse::empty(key.session_id, key.start, key.end));
        }

        let result = self
            .cache
            .get_or_compute(key, || async move {
                // An unknown session is answered but never cached: its id may
                // be handed out later.
                if self.db.get_session(key.session_id).await?.is_none() {
                    return Err(RelayError::SessionNotFound(key.session_id));
                }
                let records = compute().await?;
                Ok::<_, RelayError>(RangeResponse {
                    session_id: key.session_id,
                    start: key.start,
                    end: key.end,
                    records,
                })
            })
            .await;

        result.unwrap_or_else(|err| {
            match err {
                RelayError::SessionNotFound(_) => {}
                other => error!("query {key:?} failed: {other}"),
            }
            Arc::new(RangeResponse::empty(key.session_id, key.start, key.end))
        })
    }

    async fn range_of<T: TelemetryRecord>(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Arc<RangeResponse<T>> {
        let key = QueryKey::new(session_id, QueryKind::Records(T::KIND), start, end);
        self.cached(key, || async move {
            Ok::<_, RelayError>(self.db.query_range::<T>(session_id, start, end).await?)
        })
        .await
    }

    pub async fn get_memory_samples(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Arc<RangeResponse<MemorySample>> {
        self.range_of(session_id, start, end).await
    }

    pub async fn get_cpu_usage(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Arc<RangeResponse<CpuUsageSample>> {
        self.range_of(session_id, start, end).await
    }

    pub async fn get_gc_pauses(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Arc<RangeResponse<GcPause>> {
        self.range_of(session_id, start, end).await
    }

    pub async fn get_heap_dumps(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Arc<RangeResponse<HeapDumpInfo>> {
        self.range_of(session_id, start, end).await
    }

    pub async fn get_allocation_tracking(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Arc<RangeResponse<AllocationTrackingInfo>> {
        self.range_of(session_id, start, end).await
    }

    pub async fn get_allocations(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Arc<RangeResponse<AllocationEvent>> {
        self.range_of(session_id, start, end).await
    }

    /// Per-thread transitions in `[start, end)`, each thread carrying its
    /// state at `start` as a synthesized first transition.
    pub async fn get_thread_activity(
        &self,
        session_id: SessionId,
        start: i64,
        end: i64,
    ) -> Arc<ThreadActivityResponse> {
        let key = QueryKey::new(session_id, QueryKind::ThreadActivity, start, end);
        self.cached(key, || async move {
            let (prior, in_window) = self.db.thread_events(session_id, start, end).await?;
            Ok::<_, RelayError>(synthesize_thread_activity(prior, in_window, start))
        })
        .await
    }

    /// Objects alive at `at`: allocated before it, not freed by it.
    pub async fn get_live_allocations(
        &self,
        session_id: SessionId,
        at: i64,
    ) -> Arc<RangeResponse<AllocationEvent>> {
        let key = QueryKey::new(session_id, QueryKind::LiveAllocations, at, at);
        self.cached(key, || async move {
            Ok::<_, RelayError>(self.db.live_allocations(session_id, at).await?)
        })
        .await
    }

    pub async fn get_latest_data_timestamp(&self, session_id: SessionId) -> Option<i64> {
        match self.db.latest_data_timestamp(session_id).await {
            Ok(latest) => latest,
            Err(err) => {
                error!("latest timestamp lookup failed for session {session_id}: {err:#}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests;
