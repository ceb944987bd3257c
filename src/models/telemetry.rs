//! Telemetry record kinds.
//!
//! Every kind implements [`TelemetryRecord`], which is all the store and the
//! merger need to know about it: where it sits in time, what identifies it and
//! whether it is still open-ended.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::OPEN_END;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    MemorySample,
    CpuUsage,
    GcPause,
    HeapDump,
    AllocationTracking,
    ThreadState,
    Allocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    /// Single timestamp, immutable once stored.
    Point,
    /// `[start, end)`, `end == OPEN_END` while in progress.
    Interval,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::MemorySample => "memory_sample",
            RecordKind::CpuUsage => "cpu_usage",
            RecordKind::GcPause => "gc_pause",
            RecordKind::HeapDump => "heap_dump",
            RecordKind::AllocationTracking => "allocation_tracking",
            RecordKind::ThreadState => "thread_state",
            RecordKind::Allocation => "allocation",
        }
    }

    pub fn shape(&self) -> RecordShape {
        match self {
            RecordKind::MemorySample | RecordKind::CpuUsage | RecordKind::ThreadState => {
                RecordShape::Point
            }
            RecordKind::GcPause
            | RecordKind::HeapDump
            | RecordKind::AllocationTracking
            | RecordKind::Allocation => RecordShape::Interval,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum IntervalStatus {
    InProgress,
    Succeeded,
    Failed,
}

pub trait TelemetryRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: RecordKind;

    fn pid(&self) -> i32;

    /// Secondary key, e.g. the thread id for thread transitions.
    fn group(&self) -> i64 {
        0
    }

    fn identity(&self) -> i64;

    fn timestamp(&self) -> i64;

    fn end_timestamp(&self) -> i64 {
        self.timestamp()
    }

    fn is_open_ended(&self) -> bool {
        Self::KIND.shape() == RecordShape::Interval && self.end_timestamp() == OPEN_END
    }

    fn status(&self) -> IntervalStatus {
        if self.is_open_ended() {
            IntervalStatus::InProgress
        } else {
            IntervalStatus::Succeeded
        }
    }

    /// Returns a closed copy. Identity and start time are never touched.
    fn close(&self, _at: i64, _status: IntervalStatus) -> Self {
        self.clone()
    }

    fn merge_order(&self) -> (i64, i64, i64) {
        (self.group(), self.timestamp(), self.identity())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemorySample {
    pub pid: i32,
    pub timestamp: i64,
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
}

impl TelemetryRecord for MemorySample {
    const KIND: RecordKind = RecordKind::MemorySample;

    fn pid(&self) -> i32 {
        self.pid
    }

    fn identity(&self) -> i64 {
        self.timestamp
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CpuUsageSample {
    pub pid: i32,
    pub timestamp: i64,
    pub app_cpu_percent: f64,
    pub system_cpu_percent: f64,
}

impl TelemetryRecord for CpuUsageSample {
    const KIND: RecordKind = RecordKind::CpuUsage;

    fn pid(&self) -> i32 {
        self.pid
    }

    fn identity(&self) -> i64 {
        self.timestamp
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcPause {
    pub pid: i32,
    pub start_time: i64,
    pub end_time: i64,
    pub freed_bytes: u64,
}

impl TelemetryRecord for GcPause {
    const KIND: RecordKind = RecordKind::GcPause;

    fn pid(&self) -> i32 {
        self.pid
    }

    fn identity(&self) -> i64 {
        self.start_time
    }

    fn timestamp(&self) -> i64 {
        self.start_time
    }

    fn end_timestamp(&self) -> i64 {
        self.end_time
    }

    fn close(&self, at: i64, _status: IntervalStatus) -> Self {
        Self {
            end_time: at,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeapDumpInfo {
    pub pid: i32,
    pub start_time: i64,
    pub end_time: i64,
    pub status: IntervalStatus,
    /// Key of the dump contents for `get_bytes`.
    pub blob_id: String,
}

impl HeapDumpInfo {
    pub fn in_progress(pid: i32, start_time: i64) -> Self {
        Self {
            pid,
            start_time,
            end_time: OPEN_END,
            status: IntervalStatus::InProgress,
            blob_id: format!("heap-dump-{pid}-{start_time}"),
        }
    }

    pub fn success(&self) -> bool {
        self.status == IntervalStatus::Succeeded
    }
}

impl TelemetryRecord for HeapDumpInfo {
    const KIND: RecordKind = RecordKind::HeapDump;

    fn pid(&self) -> i32 {
        self.pid
    }

    fn identity(&self) -> i64 {
        self.start_time
    }

    fn timestamp(&self) -> i64 {
        self.start_time
    }

    fn end_timestamp(&self) -> i64 {
        self.end_time
    }

    fn status(&self) -> IntervalStatus {
        self.status
    }

    fn close(&self, at: i64, status: IntervalStatus) -> Self {
        Self {
            end_time: at,
            status,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationTrackingInfo {
    pub pid: i32,
    pub start_time: i64,
    pub end_time: i64,
    pub status: IntervalStatus,
}

impl AllocationTrackingInfo {
    pub fn in_progress(pid: i32, start_time: i64) -> Self {
        Self {
            pid,
            start_time,
            end_time: OPEN_END,
            status: IntervalStatus::InProgress,
        }
    }

    pub fn success(&self) -> bool {
        self.status == IntervalStatus::Succeeded
    }
}

impl TelemetryRecord for AllocationTrackingInfo {
    const KIND: RecordKind = RecordKind::AllocationTracking;

    fn pid(&self) -> i32 {
        self.pid
    }

    fn identity(&self) -> i64 {
        self.start_time
    }

    fn timestamp(&self) -> i64 {
        self.start_time
    }

    fn end_timestamp(&self) -> i64 {
        self.end_time
    }

    fn status(&self) -> IntervalStatus {
        self.status
    }

    fn close(&self, at: i64, status: IntervalStatus) -> Self {
        Self {
            end_time: at,
            status,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ThreadState {
    Running,
    Sleeping,
    Waiting,
    Dead,
    Unknown,
}

/// A thread changing state. The current state of a thread is its latest
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadStateEvent {
    pub pid: i32,
    pub thread_id: i64,
    pub name: String,
    pub timestamp: i64,
    pub state: ThreadState,
}

impl TelemetryRecord for ThreadStateEvent {
    const KIND: RecordKind = RecordKind::ThreadState;

    fn pid(&self) -> i32 {
        self.pid
    }

    fn group(&self) -> i64 {
        self.thread_id
    }

    fn identity(&self) -> i64 {
        self.timestamp
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// One tracked object: allocated at `alloc_time`, freed at `free_time`
/// (`OPEN_END` while alive).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationEvent {
    pub pid: i32,
    pub tag: i64,
    pub class_name: String,
    pub size: u64,
    pub thread_id: i64,
    pub alloc_time: i64,
    pub free_time: i64,
}

impl AllocationEvent {
    pub fn is_alive_at(&self, at: i64) -> bool {
        self.alloc_time < at && self.free_time > at
    }
}

impl TelemetryRecord for AllocationEvent {
    const KIND: RecordKind = RecordKind::Allocation;

    fn pid(&self) -> i32 {
        self.pid
    }

    fn identity(&self) -> i64 {
        self.tag
    }

    fn timestamp(&self) -> i64 {
        self.alloc_time
    }

    fn end_timestamp(&self) -> i64 {
        self.free_time
    }

    fn close(&self, at: i64, _status: IntervalStatus) -> Self {
        Self {
            free_time: at,
            ..self.clone()
        }
    }
}

/// Everything one poll returned for a stream, tagged by pid.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryBatch {
    pub memory: Vec<MemorySample>,
    pub cpu: Vec<CpuUsageSample>,
    pub gc_pauses: Vec<GcPause>,
    pub heap_dumps: Vec<HeapDumpInfo>,
    pub allocation_tracking: Vec<AllocationTrackingInfo>,
    pub threads: Vec<ThreadStateEvent>,
    pub allocations: Vec<AllocationEvent>,
}

impl TelemetryBatch {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.memory.len()
            + self.cpu.len()
            + self.gc_pauses.len()
            + self.heap_dumps.len()
            + self.allocation_tracking.len()
            + self.threads.len()
            + self.allocations.len()
    }
}
