use serde::{Deserialize, Serialize};

use super::{SessionId, ThreadState, ThreadStateEvent};

/// Result of a range query. Responses are shared through the query cache, so
/// they are never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RangeResponse<T> {
    pub session_id: SessionId,
    pub start: i64,
    pub end: i64,
    pub records: Vec<T>,
}

impl<T> RangeResponse<T> {
    pub fn empty(session_id: SessionId, start: i64, end: i64) -> Self {
        Self {
            session_id,
            start,
            end,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadActivity {
    pub thread_id: i64,
    pub name: String,
    /// Transitions inside the window, ascending. The first one may be
    /// synthesized at the window start.
    pub events: Vec<ThreadStateEvent>,
}

impl ThreadActivity {
    pub fn state_at(&self, at: i64) -> Option<ThreadState> {
        self.events
            .iter()
            .take_while(|event| event.timestamp <= at)
            .last()
            .map(|event| event.state)
    }
}

pub type ThreadActivityResponse = RangeResponse<ThreadActivity>;
