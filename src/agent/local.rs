use std::collections::BTreeSet;

use async_trait::async_trait;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;

use crate::{
    clock::{Clock, SystemClock},
    models::{CpuUsageSample, MemorySample, Process, ProcessState, StreamId, TelemetryBatch},
};

use super::{AgentClient, AgentError, AgentResult, IncrementalData};

const NANOS_PER_SECOND: i64 = 1_000_000_000;

struct LocalState {
    system: System,
    attached: BTreeSet<i32>,
}

/// Agent for the machine the relay runs on. Reports the host process list
/// and samples memory and CPU of attached processes on every poll.
pub struct LocalAgent {
    clock: SystemClock,
    state: Mutex<LocalState>,
}

impl LocalAgent {
    pub fn new() -> Self {
        let mut system = System::new();
        // First refresh gives CPU usage a baseline.
        system.refresh_cpu_usage();
        system.refresh_processes(ProcessesToUpdate::All);

        Self {
            clock: SystemClock::new(),
            state: Mutex::new(LocalState {
                system,
                attached: BTreeSet::new(),
            }),
        }
    }

    fn to_pid(pid: i32) -> AgentResult<Pid> {
        u32::try_from(pid)
            .map(Pid::from_u32)
            .map_err(|_| AgentError::Rejected(format!("invalid pid {pid}")))
    }
}

impl Default for LocalAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentClient for LocalAgent {
    async fn get_current_time(&self, _stream_id: StreamId) -> AgentResult<i64> {
        Ok(self.clock.now_ns())
    }

    async fn get_processes(&self, stream_id: StreamId) -> AgentResult<Vec<Process>> {
        let mut state = self.state.lock().await;
        state.system.refresh_processes(ProcessesToUpdate::All);

        let mut processes: Vec<Process> = state
            .system
            .processes()
            .iter()
            .filter_map(|(pid, process)| {
                let pid = i32::try_from(pid.as_u32()).ok()?;
                let start_secs = i64::try_from(process.start_time()).ok()?;
                Some(Process {
                    stream_id,
                    pid,
                    name: process.name().to_string_lossy().into_owned(),
                    start_time_ns: start_secs.saturating_mul(NANOS_PER_SECOND),
                    state: ProcessState::Alive,
                })
            })
            .collect();
        processes.sort_by_key(|process| process.pid);
        Ok(processes)
    }

    async fn get_incremental_data(
        &self,
        _stream_id: StreamId,
        since_cursor: i64,
    ) -> AgentResult<IncrementalData> {
        let now = self.clock.now_ns();
        if now <= since_cursor {
            return Ok(IncrementalData {
                batch: TelemetryBatch::default(),
                next_cursor: since_cursor,
            });
        }

        let mut state = self.state.lock().await;
        let pids: Vec<Pid> = state
            .attached
            .iter()
            .filter_map(|pid| Self::to_pid(*pid).ok())
            .collect();
        if pids.is_empty() {
            return Ok(IncrementalData {
                batch: TelemetryBatch::default(),
                next_cursor: now,
            });
        }

        state.system.refresh_cpu_usage();
        state.system.refresh_processes(ProcessesToUpdate::Some(&pids));
        let system_cpu = f64::from(state.system.global_cpu_usage());

        let mut batch = TelemetryBatch::default();
        for pid in &pids {
            let Some(process) = state.system.process(*pid) else {
                continue;
            };
            let Ok(pid) = i32::try_from(pid.as_u32()) else {
                continue;
            };
            batch.memory.push(MemorySample {
                pid,
                timestamp: now,
                resident_bytes: process.memory(),
                virtual_bytes: process.virtual_memory(),
            });
            batch.cpu.push(CpuUsageSample {
                pid,
                timestamp: now,
                app_cpu_percent: f64::from(process.cpu_usage()),
                system_cpu_percent: system_cpu,
            });
        }

        Ok(IncrementalData {
            batch,
            next_cursor: now,
        })
    }

    async fn get_bytes(&self, _stream_id: StreamId, id: &str) -> AgentResult<Vec<u8>> {
        Err(AgentError::Rejected(format!("no blob {id} on the local agent")))
    }

    async fn start_profiling_app(&self, _stream_id: StreamId, pid: i32) -> AgentResult<()> {
        let target = Self::to_pid(pid)?;
        let mut state = self.state.lock().await;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[target]));
        if state.system.process(target).is_none() {
            return Err(AgentError::Rejected(format!("process {pid} not found")));
        }
        state.attached.insert(pid);
        Ok(())
    }

    async fn stop_profiling_app(&self, _stream_id: StreamId, pid: i32) -> AgentResult<()> {
        self.state.lock().await.attached.remove(&pid);
        Ok(())
    }

    async fn start_tracking(&self, _stream_id: StreamId, _pid: i32) -> AgentResult<i64> {
        Err(AgentError::Rejected(
            "allocation tracking is not supported by the local agent".into(),
        ))
    }

    async fn stop_tracking(&self, _stream_id: StreamId, _pid: i32) -> AgentResult<i64> {
        Err(AgentError::Rejected(
            "allocation tracking is not supported by the local agent".into(),
        ))
    }

    async fn trigger_heap_dump(&self, _stream_id: StreamId, _pid: i32) -> AgentResult<i64> {
        Err(AgentError::Rejected(
            "heap dumps are not supported by the local agent".into(),
        ))
    }
}
