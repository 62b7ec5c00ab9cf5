use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Keepalive bookkeeping shared between the session's tasks and an external keepalive timer.
///
/// The last contact time is stored as an offset from a fixed base so it fits into an atomic.
///  No lock is involved, so the timer can poll this at any time.
#[derive(Debug)]
pub struct Liveness {
    base: Instant,
    last_contact_millis: AtomicU64,
    ping_outstanding: AtomicBool,
}

impl Default for Liveness {
    fn default() -> Self {
        Liveness::new()
    }
}

impl Liveness {
    pub fn new() -> Liveness {
        Liveness {
            base: Instant::now(),
            last_contact_millis: AtomicU64::new(0),
            ping_outstanding: AtomicBool::new(false),
        }
    }

    /// record that a packet was written successfully
    pub fn touch(&self) {
        let millis = self.base.elapsed().as_millis() as u64;
        self.last_contact_millis.fetch_max(millis, Ordering::AcqRel);
    }

    pub fn last_contact(&self) -> Instant {
        self.base + Duration::from_millis(self.last_contact_millis.load(Ordering::Acquire))
    }

    pub fn since_last_contact(&self) -> Duration {
        self.last_contact().elapsed()
    }

    pub fn ping_outstanding(&self) -> bool {
        self.ping_outstanding.load(Ordering::Acquire)
    }

    pub fn set_ping_outstanding(&self, value: bool) {
        self.ping_outstanding.store(value, Ordering::Release);
    }
}
