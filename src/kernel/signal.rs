use log::debug;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe signal handling for the runner
/// The handler only stores atomics; the watchdog polls them and turns a
/// request into a group kill.
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Global cancellation flag (async-safe atomic)
static CANCEL_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Last signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Signal handler state
#[derive(Clone, Copy, Debug)]
pub struct SignalHandler;

impl SignalHandler {
    /// Initialize signal handlers
    /// Must be called early, before the watchdog thread is spawned
    pub fn init() -> Result<Self, String> {
        Self::install_signal_handlers()?;
        Ok(Self)
    }

    /// Install signal handlers for SIGINT, SIGTERM, SIGHUP
    fn install_signal_handlers() -> Result<(), String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            unsafe { signal::sigaction(sig, &sig_action) }
                .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
        }

        debug!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(())
    }

    /// Only performs atomic operations - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        CANCEL_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn cancellation_requested(&self) -> bool {
        CANCEL_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that requested cancellation (0 if none)
    pub fn received_signal(&self) -> i32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn raise_for_test(&self, sig: i32) {
        Self::signal_handler(sig);
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        CANCEL_REQUESTED.store(false, Ordering::SeqCst);
        SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
    }
}

/// Symbolic name of a signal number, e.g. `SIGSEGV`
pub fn signal_name(signo: i32) -> Option<&'static str> {
    Signal::try_from(signo).ok().map(Signal::as_str)
}
