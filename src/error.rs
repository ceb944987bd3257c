use thiserror::Error;

use crate::agent::AgentError;
use crate::models::{RecordKind, SessionId, StreamId};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport failure: {0}")]
    Transport(#[from] AgentError),

    #[error("duplicate {} record with identity {identity}", .kind.as_str())]
    Conflict { kind: RecordKind, identity: i64 },

    #[error("invalid range: end {end} is before start {start}")]
    InvalidRange { start: i64, end: i64 },

    #[error("session {session_id} is closed")]
    StaleWrite { session_id: SessionId },

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("stream {stream_id} already has open session {session_id}")]
    SessionAlreadyOpen {
        stream_id: StreamId,
        session_id: SessionId,
    },

    #[error("process {pid} on stream {stream_id} is not alive")]
    ProcessNotAlive { stream_id: StreamId, pid: i32 },

    #[error("stream {0} is disconnected")]
    StreamDisconnected(StreamId),

    #[error("session {0} is still open")]
    SessionStillOpen(SessionId),

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),
}

/// Domain errors raised on the database thread come back wrapped in
/// `anyhow::Error`; unwrap them so callers can match on the variant.
impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RelayError>() {
            Ok(relay) => relay,
            Err(other) => RelayError::Storage(other),
        }
    }
}

pub type RelayResult<T> = std::result::Result<T, RelayError>;
