use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{StreamId, OPEN_END};

pub type SessionId = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionOrigin {
    Live,
    Imported,
}

impl SessionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOrigin::Live => "Live",
            SessionOrigin::Imported => "Imported",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub stream_id: StreamId,
    pub pid: i32,
    pub name: String,
    pub start_timestamp: i64,
    /// `OPEN_END` while the session is live.
    pub end_timestamp: i64,
    pub origin: SessionOrigin,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn state(&self) -> SessionState {
        if self.end_timestamp == OPEN_END {
            SessionState::Open
        } else {
            SessionState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }
}

/// Metadata for a session that is created already closed, e.g. from an
/// imported capture file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionImport {
    pub stream_id: StreamId,
    pub pid: i32,
    pub name: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}
