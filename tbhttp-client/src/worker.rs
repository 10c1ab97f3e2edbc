use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

/// The background workers owned by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerRole {
    Publish,
    Attributes,
    Rpc,
}

impl Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Publish => f.write_str("publish"),
            WorkerRole::Attributes => f.write_str("attributes"),
            WorkerRole::Rpc => f.write_str("rpc"),
        }
    }
}

/// Lifecycle flags shared between a worker handle and its loop.
///
/// `running` is owned by whoever holds the consumer slot, so at most one
/// loop per worker is alive at a time. `stop_requested` is only ever
/// observed cooperatively by the loop.
#[derive(Debug, Default)]
pub(crate) struct WorkerState {
    running: AtomicBool,
    stop_requested: AtomicBool,
}

impl WorkerState {
    /// Clear any pending stop request and claim the consumer slot.
    ///
    /// Returns `true` if the slot was free and the caller must spawn the loop.
    pub fn start(&self) -> bool {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Release the consumer slot after observing a stop request.
    ///
    /// A `start` may have raced with the stop and found the slot still taken.
    /// In that case the slot is claimed back and `true` is returned: the loop
    /// must keep running instead of exiting.
    pub fn finish(&self) -> bool {
        self.running.store(false, Ordering::SeqCst);
        !self.stop_requested.load(Ordering::SeqCst)
            && self
                .running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }

    /// Release the consumer slot after an unrecoverable failure.
    pub fn abort(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
