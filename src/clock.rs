//! Time sources.
//!
//! All timestamps in the relay are device-relative nanoseconds. [`DeviceClock`]
//! follows the agent's clock between polls and never runs backwards.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;

pub trait Clock: Send + Sync {
    fn now_ns(&self) -> i64;
}

/// Wall-clock anchored at construction, advanced by a monotonic `Instant`.
pub struct SystemClock {
    origin: Instant,
    base_ns: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        let base_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self {
            origin: Instant::now(),
            base_ns,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ns(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX);
        self.base_ns.saturating_add(elapsed)
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug, Default)]
pub struct FakeClock {
    now: AtomicI64,
}

impl FakeClock {
    pub const ONE_SECOND_NS: i64 = 1_000_000_000;

    pub fn new(start_ns: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ns),
        }
    }

    pub fn set(&self, now_ns: i64) {
        self.now.store(now_ns, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ns: i64) {
        self.now.fetch_add(delta_ns, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ns(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

struct AgentSync {
    agent_ns: i64,
    local_ns: i64,
    last_returned: i64,
}

/// The device's "now", as last reported by the agent plus the local time
/// elapsed since that report.
pub struct DeviceClock {
    local: Arc<dyn Clock>,
    sync: Mutex<Option<AgentSync>>,
}

impl DeviceClock {
    pub fn new(local: Arc<dyn Clock>) -> Self {
        Self {
            local,
            sync: Mutex::new(None),
        }
    }

    /// Record a timestamp read from the agent.
    pub fn observe(&self, agent_ns: i64) {
        let local_ns = self.local.now_ns();
        let mut guard = self.sync.lock();
        let last_returned = guard.as_ref().map_or(i64::MIN, |sync| sync.last_returned);
        *guard = Some(AgentSync {
            agent_ns,
            local_ns,
            last_returned: last_returned.max(agent_ns),
        });
    }

    pub fn has_observed(&self) -> bool {
        self.sync.lock().is_some()
    }
}

impl Clock for DeviceClock {
    fn now_ns(&self) -> i64 {
        let local_now = self.local.now_ns();
        let mut guard = self.sync.lock();
        match guard.as_mut() {
            Some(sync) => {
                let drift = local_now.saturating_sub(sync.local_ns).max(0);
                let now = sync.agent_ns.saturating_add(drift).max(sync.last_returned);
                sync.last_returned = now;
                now
            }
            // Nothing heard from the agent yet; fall back to local time.
            None => local_now,
        }
    }
}
