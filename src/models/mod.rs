pub mod device;
pub mod query;
pub mod session;
pub mod telemetry;

pub use device::{Device, DeviceState, Process, ProcessChanges, ProcessState, StreamId};
pub use query::{RangeResponse, ThreadActivity, ThreadActivityResponse};
pub use session::{Session, SessionId, SessionImport, SessionOrigin, SessionState};
pub use telemetry::{
    AllocationEvent, AllocationTrackingInfo, CpuUsageSample, GcPause, HeapDumpInfo,
    IntervalStatus, MemorySample, RecordKind, RecordShape, TelemetryBatch, TelemetryRecord,
    ThreadState, ThreadStateEvent,
};

/// End timestamp of anything still in progress.
pub const OPEN_END: i64 = i64::MAX;
