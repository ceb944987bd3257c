//! Client side of the on-device agent.
//!
//! The relay never looks past "succeeded" or "failed" here: any
//! [`AgentError::Unreachable`] or [`AgentError::Timeout`] is treated as the
//! stream going away, [`AgentError::Rejected`] as the agent refusing one command.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Process, StreamId, TelemetryBatch};

pub mod local;

#[cfg(test)]
pub(crate) mod fake;

pub use local::LocalAgent;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent unreachable: {0}")]
    Unreachable(String),
    #[error("agent call timed out after {0}ms")]
    Timeout(u64),
    #[error("agent rejected command: {0}")]
    Rejected(String),
}

impl AgentError {
    pub fn is_transport(&self) -> bool {
        matches!(self, AgentError::Unreachable(_) | AgentError::Timeout(_))
    }
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;

/// Incremental data since a cursor. `next_cursor` is handed back on the next
/// poll so the agent only sends what is new.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncrementalData {
    pub batch: TelemetryBatch,
    pub next_cursor: i64,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Device-relative "now" in nanoseconds.
    async fn get_current_time(&self, stream_id: StreamId) -> AgentResult<i64>;

    async fn get_processes(&self, stream_id: StreamId) -> AgentResult<Vec<Process>>;

    async fn get_incremental_data(
        &self,
        stream_id: StreamId,
        since_cursor: i64,
    ) -> AgentResult<IncrementalData>;

    async fn get_bytes(&self, stream_id: StreamId, id: &str) -> AgentResult<Vec<u8>>;

    async fn start_profiling_app(&self, stream_id: StreamId, pid: i32) -> AgentResult<()>;

    async fn stop_profiling_app(&self, stream_id: StreamId, pid: i32) -> AgentResult<()>;

    /// Returns the device time tracking started at.
    async fn start_tracking(&self, stream_id: StreamId, pid: i32) -> AgentResult<i64>;

    /// Returns the device time tracking stopped at.
    async fn stop_tracking(&self, stream_id: StreamId, pid: i32) -> AgentResult<i64>;

    /// Returns the device time the dump started at.
    async fn trigger_heap_dump(&self, stream_id: StreamId, pid: i32) -> AgentResult<i64>;
}
