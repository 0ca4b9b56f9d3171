//! Lifecycle stage of a tracee, shared between the caller, the command executor and the
//! wait loop.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing::debug;

use crate::tracee::Pid;


/// Where a tracee is in its lifecycle.
///
/// `Created -> Running <-> Stopped -> {Exited | Detached}`. The last two are terminal and
/// are never left once entered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Stage {
    // Handle under construction, initial stop not yet observed.
    Created = 0,

    // Restarted, free-running until the next ptrace-stop.
    Running,

    // In a ptrace-stop, ready to accept commands.
    Stopped,

    // Exited, killed, or no longer waitable.
    Exited,

    // Tracing relationship released.
    Detached,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Exited | Stage::Detached)
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Stage::Created,
            1 => Stage::Running,
            2 => Stage::Stopped,
            3 => Stage::Exited,
            _ => Stage::Detached,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Lifecycle {
    pid: Pid,
    stage: AtomicU8,
}

impl Lifecycle {
    pub fn new(pid: Pid) -> Self {
        let stage = AtomicU8::new(Stage::Created as u8);

        Self { pid, stage }
    }

    pub fn stage(&self) -> Stage {
        Stage::from_raw(self.stage.load(Ordering::SeqCst))
    }

    /// Move to `next`, unless the current stage is terminal.
    ///
    /// Returns the stage that was replaced, or `Err` with the terminal stage that blocked
    /// the transition.
    pub fn advance(&self, next: Stage) -> std::result::Result<Stage, Stage> {
        let prev = self.stage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |raw| {
                if Stage::from_raw(raw).is_terminal() {
                    None
                } else {
                    Some(next as u8)
                }
            })
            .map(Stage::from_raw)
            .map_err(Stage::from_raw);

        if let Ok(prev) = prev {
            if prev != next {
                debug!(pid = self.pid.as_raw(), ?prev, ?next, "tracee stage changed");
            }
        }

        prev
    }

    /// Move from exactly `from` to `to`. Used to undo a tentative `Running` after a
    /// failed restart, without clobbering a stage the wait loop has since written.
    pub fn revert(&self, from: Stage, to: Stage) -> bool {
        self.stage
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
