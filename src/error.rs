use std::io;

use nix::errno::Errno;

use crate::lifecycle::Stage;
use crate::tracee::{Pid, Restart};


pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Tracee = {pid} has exited or been detached")]
    TraceeExited { pid: Pid },

    #[error("Tracee = {pid} is not in a ptrace-stop (stage = {stage:?})")]
    NotStopped { pid: Pid, stage: Stage },

    #[error("Could not spawn tracee")]
    Spawn(#[source] io::Error),

    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not restart tracee = {pid} with mode = {mode:?}")]
    Restart { pid: Pid, mode: Restart, source: nix::Error },

    #[error("Tracee = {pid} died")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("Short transfer at {addr:#x} for tracee = {pid}: expected {expected} bytes, moved {actual}")]
    ShortTransfer {
        pid: Pid,
        addr: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Could not wait on tracee = {pid}")]
    Wait { pid: Pid, source: nix::Error },

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True if the tracee was already terminal (exited or detached) when the
    /// request was made, so no kernel call was attempted.
    pub fn tracee_exited(&self) -> bool {
        matches!(self, Error::TraceeExited { .. })
    }

    /// True if the kernel reported the tracee as gone (`ESRCH`) while serving
    /// a request.
    pub fn tracee_died(&self) -> bool {
        match self {
            Error::TraceeDied { .. } => true,
            Error::Restart { source, .. } => *source == Errno::ESRCH,
            _ => false,
        }
    }
}

pub(crate) trait ResultExt<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| match source {
            Errno::ESRCH => Error::TraceeDied { pid, source },
            source => Error::OS(source),
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}
