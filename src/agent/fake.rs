use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::models::{Process, ProcessState, StreamId, TelemetryBatch};

use super::{AgentClient, AgentError, AgentResult, IncrementalData};

#[derive(Default)]
struct FakeState {
    now: i64,
    processes: Vec<Process>,
    batches: VecDeque<TelemetryBatch>,
    blobs: HashMap<String, Vec<u8>>,
    reject_commands: bool,
    delay: Option<Duration>,
    calls: HashMap<&'static str, usize>,
}

/// Scriptable agent for tests.
pub(crate) struct FakeAgent {
    connected: AtomicBool,
    state: Mutex<FakeState>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn set_time(&self, now: i64) {
        self.state.lock().now = now;
    }

    pub fn add_process(&self, stream_id: StreamId, pid: i32, name: &str, start_time_ns: i64) {
        self.state.lock().processes.push(Process {
            stream_id,
            pid,
            name: name.to_string(),
            start_time_ns,
            state: ProcessState::Alive,
        });
    }

    pub fn remove_process(&self, pid: i32) {
        self.state.lock().processes.retain(|p| p.pid != pid);
    }

    pub fn push_batch(&self, batch: TelemetryBatch) {
        self.state.lock().batches.push_back(batch);
    }

    pub fn put_blob(&self, id: &str, bytes: Vec<u8>) {
        self.state.lock().blobs.insert(id.to_string(), bytes);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_reject_commands(&self, reject: bool) {
        self.state.lock().reject_commands = reject;
    }

    /// Every call sleeps this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    pub fn calls(&self, method: &str) -> usize {
        self.state.lock().calls.get(method).copied().unwrap_or(0)
    }

    async fn enter(&self, method: &'static str) -> AgentResult<()> {
        let delay = {
            let mut state = self.state.lock();
            *state.calls.entry(method).or_insert(0) += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AgentError::Unreachable("connection refused".into()))
        }
    }

    fn command_time(&self) -> AgentResult<i64> {
        let state = self.state.lock();
        if state.reject_commands {
            return Err(AgentError::Rejected("command refused".into()));
        }
        Ok(state.now)
    }
}

#[async_trait]
impl AgentClient for FakeAgent {
    async fn get_current_time(&self, _stream_id: StreamId) -> AgentResult<i64> {
        self.enter("get_current_time").await?;
        Ok(self.state.lock().now)
    }

    async fn get_processes(&self, stream_id: StreamId) -> AgentResult<Vec<Process>> {
        self.enter("get_processes").await?;
        Ok(self
            .state
            .lock()
            .processes
            .iter()
            .map(|p| Process {
                stream_id,
                ..p.clone()
            })
            .collect())
    }

    async fn get_incremental_data(
        &self,
        _stream_id: StreamId,
        since_cursor: i64,
    ) -> AgentResult<IncrementalData> {
        self.enter("get_incremental_data").await?;
        let mut state = self.state.lock();
        let batch = state.batches.pop_front().unwrap_or_default();
        Ok(IncrementalData {
            batch,
            next_cursor: since_cursor.max(state.now),
        })
    }

    async fn get_bytes(&self, _stream_id: StreamId, id: &str) -> AgentResult<Vec<u8>> {
        self.enter("get_bytes").await?;
        self.state
            .lock()
            .blobs
            .get(id)
            .cloned()
            .ok_or_else(|| AgentError::Rejected(format!("unknown blob {id}")))
    }

    async fn start_profiling_app(&self, _stream_id: StreamId, _pid: i32) -> AgentResult<()> {
        self.enter("start_profiling_app").await?;
        self.command_time().map(|_| ())
    }

    async fn stop_profiling_app(&self, _stream_id: StreamId, _pid: i32) -> AgentResult<()> {
        self.enter("stop_profiling_app").await?;
        self.command_time().map(|_| ())
    }

    async fn start_tracking(&self, _stream_id: StreamId, _pid: i32) -> AgentResult<i64> {
        self.enter("start_tracking").await?;
        self.command_time()
    }

    async fn stop_tracking(&self, _stream_id: StreamId, _pid: i32) -> AgentResult<i64> {
        self.enter("stop_tracking").await?;
        self.command_time()
    }

    async fn trigger_heap_dump(&self, _stream_id: StreamId, _pid: i32) -> AgentResult<i64> {
        self.enter("trigger_heap_dump").await?;
        self.command_time()
    }
}
