//! Stream, process and session lifecycle.
//!
//! Every transition for a stream goes through its [`LifecycleTracker`], which
//! holds one lock per stream. Poll ticks merge under that lock too, so an
//! explicit stop always lands either fully before or fully after a tick.

pub mod state;
pub mod tracker;

pub use state::{alive_process, diff_processes, StreamLifecycle};
pub use tracker::{LifecycleTracker, TickMerge};
