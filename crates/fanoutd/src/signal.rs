//! Stop-flag based signal handling for the supervisor process.
//!
//! Handlers only flip atomics; no store writes happen in signal
//! context. The first SIGTERM/SIGINT requests a graceful drain, a
//! second one escalates to group-killing live agent children.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn handle_stop_signal(_signum: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
    SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// A shared stop flag. The executor polls it between dispatches; tests
/// construct their own and trip it directly.
#[derive(Clone)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
    /// None for process-global flags driven by real signals.
    local_count: Option<Arc<AtomicU32>>,
}

impl StopFlag {
    /// A flag owned by the caller, independent of process signals.
    pub fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            local_count: Some(Arc::new(AtomicU32::new(0))),
        }
    }

    pub fn trip(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(count) = &self.local_count {
            count.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn is_set(&self) -> bool {
        match self.local_count {
            Some(_) => self.flag.load(Ordering::SeqCst),
            None => STOP_REQUESTED.load(Ordering::SeqCst),
        }
    }

    /// How many stop requests have arrived; two or more means the
    /// operator wants an immediate teardown.
    pub fn request_count(&self) -> u32 {
        match &self.local_count {
            Some(count) => count.load(Ordering::SeqCst),
            None => SIGNAL_COUNT.load(Ordering::SeqCst),
        }
    }
}

/// Install SIGTERM/SIGINT handlers and return the process-global stop
/// flag they drive.
#[cfg(unix)]
pub fn install_stop_handlers() -> StopFlag {
    unsafe {
        libc::signal(libc::SIGTERM, handle_stop_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_stop_signal as libc::sighandler_t);
    }
    StopFlag {
        flag: Arc::new(AtomicBool::new(false)),
        local_count: None,
    }
}

#[cfg(not(unix))]
pub fn install_stop_handlers() -> StopFlag {
    StopFlag::manual()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_flag_starts_clear_and_counts_trips() {
        let flag = StopFlag::manual();
        assert!(!flag.is_set());
        assert_eq!(flag.request_count(), 0);

        flag.trip();
        assert!(flag.is_set());
        assert_eq!(flag.request_count(), 1);

        flag.trip();
        assert_eq!(flag.request_count(), 2);
    }

    #[test]
    fn clones_share_the_same_flag() {
        let flag = StopFlag::manual();
        let clone = flag.clone();
        clone.trip();
        assert!(flag.is_set());
    }
}
