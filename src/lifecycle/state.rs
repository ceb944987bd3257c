use serde::{Deserialize, Serialize};

use crate::models::{DeviceState, Process, ProcessChanges, ProcessState};

/// What the tracker knows about one stream instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamLifecycle {
    pub connection: DeviceState,
}

impl Default for StreamLifecycle {
    fn default() -> Self {
        Self {
            connection: DeviceState::Connected,
        }
    }
}

impl StreamLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connection == DeviceState::Connected
    }

    /// `Connected -> Disconnected`. Returns false if the stream was already
    /// disconnected; a stream instance never reconnects.
    pub fn disconnect(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.connection = DeviceState::Disconnected;
        true
    }
}

/// Compare the processes stored for one stream instance with the agent's
/// current list.
///
/// Reported processes with an unseen `(pid, start time)` are new. Stored
/// alive processes missing from the report have died. A stored dead process
/// is never revived by the same instance, even if the agent reports it again.
pub fn diff_processes(known: &[Process], observed: &[Process]) -> ProcessChanges {
    let started = observed
        .iter()
        .filter(|candidate| !known.iter().any(|p| p.is_same_process(candidate)))
        .map(|candidate| Process {
            state: ProcessState::Alive,
            ..candidate.clone()
        })
        .collect();

    let died = known
        .iter()
        .filter(|p| p.state == ProcessState::Alive)
        .filter(|p| !observed.iter().any(|candidate| candidate.is_same_process(p)))
        .map(|p| Process {
            state: ProcessState::Dead,
            ..p.clone()
        })
        .collect();

    ProcessChanges { started, died }
}

/// The newest alive process for `pid`, if any.
pub fn alive_process(known: &[Process], pid: i32) -> Option<&Process> {
    known
        .iter()
        .filter(|p| p.pid == pid && p.state == ProcessState::Alive)
        .max_by_key(|p| p.start_time_ns)
}
