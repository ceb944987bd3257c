use std::{
    future::Future,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use log::warn;
use tokio::sync::Mutex;

use crate::{
    agent::{AgentClient, AgentError, AgentResult},
    cache::QueryCache,
    clock::DeviceClock,
    db::Database,
    error::{RelayError, RelayResult},
    lifecycle::LifecycleTracker,
    models::{Device, StreamId},
    poller::PollController,
    settings::RelayConfig,
};

/// Everything one connected stream instance needs, passed explicitly to the
/// poller and to every service operation on that stream.
pub struct StreamContext {
    pub device: Device,
    pub agent: Arc<dyn AgentClient>,
    pub db: Database,
    pub cache: Arc<QueryCache>,
    pub tracker: LifecycleTracker,
    pub clock: DeviceClock,
    pub config: RelayConfig,
    pub(crate) poller: Mutex<PollController>,
    cursor: AtomicI64,
}

impl StreamContext {
    pub fn new(
        device: Device,
        agent: Arc<dyn AgentClient>,
        db: Database,
        cache: Arc<QueryCache>,
        clock: DeviceClock,
        config: RelayConfig,
    ) -> Self {
        let tracker = LifecycleTracker::new(device.stream_id, device.boot_id.clone(), db.clone());
        Self {
            device,
            agent,
            db,
            cache,
            tracker,
            clock,
            config,
            poller: Mutex::new(PollController::new()),
            cursor: AtomicI64::new(0),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.device.stream_id
    }

    /// Cursor handed to the agent on the next incremental fetch.
    pub fn cursor(&self) -> i64 {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn advance_cursor(&self, next: i64) {
        self.cursor.fetch_max(next, Ordering::SeqCst);
    }

    /// Run one agent call under the configured timeout.
    pub async fn bounded<T, Fut>(&self, call: Fut) -> AgentResult<T>
    where
        Fut: Future<Output = AgentResult<T>>,
    {
        let limit = self.config.agent_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(
                u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            )),
        }
    }

    /// Run an agent command. A transport failure disconnects the stream and
    /// surfaces as `StreamDisconnected`; a refusal as `CommandRejected`.
    pub async fn command<T, Fut>(&self, call: Fut) -> RelayResult<T>
    where
        Fut: Future<Output = AgentResult<T>>,
    {
        if !self.tracker.is_connected().await {
            return Err(RelayError::StreamDisconnected(self.stream_id()));
        }

        match self.bounded(call).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_transport() => {
                warn!("stream {}: agent command failed: {err}", self.stream_id());
                self.tracker.disconnect().await?;
                Err(RelayError::StreamDisconnected(self.stream_id()))
            }
            Err(AgentError::Rejected(reason)) => Err(RelayError::CommandRejected(reason)),
            Err(err) => Err(RelayError::Transport(err)),
        }
    }
}
