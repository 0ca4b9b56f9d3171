use std::ffi::OsStr;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

use nix::sys::ptrace;
use tracing::debug;

use crate::error::{Error, Result};
use crate::tracee::Pid;


/// Build a command for `path` with argument vector `args`, not including `argv[0]`.
///
/// The child inherits the controller's environment and standard streams.
pub fn command<S, I, A>(path: S, args: I) -> Command
where
    S: AsRef<OsStr>,
    I: IntoIterator<Item = A>,
    A: AsRef<OsStr>,
{
    let mut cmd = Command::new(path);
    cmd.args(args);
    cmd
}

/// Spawn `cmd` as a tracee of the _calling thread_.
///
/// The child requests `PTRACE_TRACEME` after `fork()` and pre-`exec()`, so it will report
/// a `SIGTRAP` ptrace-stop once `execve()` succeeds. If `die_with_tracer`, it also asks to
/// be sent `SIGKILL` when the thread that forked it exits.
///
/// Must be called on the command executor thread: with `PTRACE_TRACEME`, the tracer is
/// the thread that forked the child.
pub(crate) fn spawn_traced(mut cmd: Command, die_with_tracer: bool) -> Result<Pid> {
    // Runs post-fork in the child, so only async-signal-safe calls.
    unsafe {
        cmd.pre_exec(move || {
            if die_with_tracer {
                let res = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
                if res == -1 {
                    return Err(io::Error::last_os_error());
                }
            }

            ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32))
        })
    };

    let child = cmd.spawn().map_err(Error::Spawn)?;
    let pid = Pid::from_raw(child.id() as i32);

    debug!(pid = pid.as_raw(), program = ?cmd.get_program(), "spawned tracee");

    // The wait loop reaps the child via `waitpid(2)`. Dropping `Child` neither waits on
    // nor kills it.
    drop(child);

    Ok(pid)
}
