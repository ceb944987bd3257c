use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type StreamId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeviceState {
    Connected,
    Disconnected,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Connected => "Connected",
            DeviceState::Disconnected => "Disconnected",
        }
    }
}

/// One monitored device connection. `stream_id` is the key every process,
/// session and telemetry record hangs off.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub stream_id: StreamId,
    pub serial: String,
    /// Changes every time the agent restarts; lets callers tell reconnects apart.
    pub boot_id: String,
    pub state: DeviceState,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    Alive,
    Dead,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Alive => "Alive",
            ProcessState::Dead => "Dead",
        }
    }
}

/// A process as reported by the agent. Identity is `(stream_id, pid, start_time_ns)`
/// so a recycled pid shows up as a separate record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub stream_id: StreamId,
    pub pid: i32,
    pub name: String,
    pub start_time_ns: i64,
    pub state: ProcessState,
}

impl Process {
    pub fn is_same_process(&self, other: &Process) -> bool {
        self.stream_id == other.stream_id
            && self.pid == other.pid
            && self.start_time_ns == other.start_time_ns
    }
}

/// Result of comparing the agent's process list with what is stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessChanges {
    pub started: Vec<Process>,
    pub died: Vec<Process>,
}

impl ProcessChanges {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.died.is_empty()
    }
}
