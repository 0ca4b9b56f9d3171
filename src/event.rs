//! Tracee state changes, as published by the wait loop.

use nix::sys::{signal::Signal, wait::WaitStatus};


/// A state change of the tracee.
///
/// The stream of events for a tracee always ends with at most one terminal event
/// ([`Exited`](Event::Exited) or [`Signaled`](Event::Signaled)), after which it closes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// The tracee is in a ptrace-stop with `signal`, and can be commanded.
    ///
    /// Single-step completions, exec traps and breakpoints all report `SIGTRAP`.
    Stopped { signal: Signal },

    /// The tracee exited normally.
    Exited { exit_code: i32 },

    /// The tracee was terminated by `signal`.
    Signaled {
        signal: Signal,
        core_dumped: bool,
    },
}

impl Event {
    pub fn is_stop(&self) -> bool {
        matches!(self, Event::Stopped { .. })
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_stop()
    }

    /// Signal carried by the event, if any.
    pub fn signal(&self) -> Option<Signal> {
        match *self {
            Event::Stopped { signal } |
            Event::Signaled { signal, .. } => Some(signal),
            Event::Exited { .. } => None,
        }
    }

    /// Interpret a `waitpid(2)` status for the tracee.
    ///
    /// Returns `None` for statuses that carry no state change we report, which with
    /// `__WALL | WNOHANG` means `StillAlive` and `Continued`.
    pub(crate) fn from_wait_status(status: WaitStatus) -> Option<Self> {
        let event = match status {
            WaitStatus::Stopped(_pid, signal) =>
                Event::Stopped { signal },
            WaitStatus::Exited(_pid, exit_code) =>
                Event::Exited { exit_code },
            WaitStatus::Signaled(_pid, signal, core_dumped) =>
                Event::Signaled { signal, core_dumped },

            // We never set `PTRACE_O_TRACESYSGOOD` or event options ourselves, but an attached
            // process may carry options from a previous tracer. Either way the tracee sits in
            // a ptrace-stop that was entered via `SIGTRAP`.
            #[cfg(any(target_os = "linux", target_os = "android"))]
            WaitStatus::PtraceEvent(_pid, signal, _code) =>
                Event::Stopped { signal },
            #[cfg(any(target_os = "linux", target_os = "android"))]
            WaitStatus::PtraceSyscall(_pid) =>
                Event::Stopped { signal: Signal::SIGTRAP },

            WaitStatus::Continued(_) |
            WaitStatus::StillAlive =>
                return None,
        };

        Some(event)
    }
}
