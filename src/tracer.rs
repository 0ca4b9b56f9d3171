//! Configuration and construction of [`Tracee`]s.

use std::cmp;
use std::ffi::OsStr;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel;
use nix::sys::{
    ptrace,
    signal::{self, Signal},
    wait::{self, WaitPidFlag},
};
use tracing::{debug, info};

use crate::cmd;
use crate::error::{Error, Result};
use crate::executor::{self, CommandQueue, Job};
use crate::tracee::{Inner, Origin, Pid, Tracee};
use crate::wait::WaitLoop;


const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(1);
const DEFAULT_MAX_POLL_DELAY: Duration = Duration::from_millis(5);
const MIN_POLL_DELAY: Duration = Duration::from_nanos(100);

/// Builder for [`Tracee`]s.
///
/// Each tracee gets two threads of its own: a command executor, which is the tracer of the
/// process in the kernel's eyes and issues every ptrace request for it, and a wait loop,
/// which publishes its state changes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Tracer {
    /// Time to sleep for after the first empty poll of the tracee's wait status.
    poll_delay: Duration,

    /// Upper bound for the exponential poll backoff.
    max_poll_delay: Duration,

    /// Kill spawned tracees when their handle is dropped, or when the executor thread
    /// exits. Attached tracees are detached instead.
    kill_on_drop: bool,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    pub fn new() -> Self {
        let poll_delay = DEFAULT_POLL_DELAY;
        let max_poll_delay = DEFAULT_MAX_POLL_DELAY;
        let kill_on_drop = true;

        Self { poll_delay, max_poll_delay, kill_on_drop }
    }

    /// Return the initial tracee poll delay.
    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    /// Set the initial tracee poll delay.
    pub fn set_poll_delay(&mut self, poll_delay: Duration) -> &mut Self {
        self.poll_delay = cmp::max(poll_delay, MIN_POLL_DELAY);
        self.max_poll_delay = cmp::max(self.max_poll_delay, self.poll_delay);
        self
    }

    /// Return the maximum tracee poll delay.
    pub fn max_poll_delay(&self) -> Duration {
        self.max_poll_delay
    }

    /// Set the maximum tracee poll delay. Never less than the initial delay.
    pub fn set_max_poll_delay(&mut self, max_poll_delay: Duration) -> &mut Self {
        self.max_poll_delay = cmp::max(max_poll_delay, self.poll_delay);
        self
    }

    pub fn kill_on_drop(&self) -> bool {
        self.kill_on_drop
    }

    pub fn set_kill_on_drop(&mut self, kill_on_drop: bool) -> &mut Self {
        self.kill_on_drop = kill_on_drop;
        self
    }

    /// Spawn `cmd` for tracing.
    ///
    /// Returns once the tracee has reported its post-exec `SIGTRAP` stop. That stop is the
    /// first event on [`Tracee::events()`].
    pub fn spawn(&self, cmd: Command) -> Result<Tracee> {
        let die_with_tracer = self.kill_on_drop;

        self.start(Origin::Spawned, move || cmd::spawn_traced(cmd, die_with_tracer))
    }

    /// Spawn `path` with arguments `args` (not including `argv[0]`) for tracing.
    pub fn exec<S, I, A>(&self, path: S, args: I) -> Result<Tracee>
    where
        S: AsRef<OsStr>,
        I: IntoIterator<Item = A>,
        A: AsRef<OsStr>,
    {
        self.spawn(cmd::command(path, args))
    }

    /// Attach to the running process `pid`.
    ///
    /// Returns once the tracee has reported its attach-stop, which is the first event on
    /// [`Tracee::events()`].
    pub fn attach(&self, pid: Pid) -> Result<Tracee> {
        self.start(Origin::Attached, move || {
            ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;

            info!(pid = pid.as_raw(), "attached to tracee");

            Ok(pid)
        })
    }

    fn start<F>(&self, origin: Origin, setup: F) -> Result<Tracee>
    where
        F: FnOnce() -> Result<Pid> + Send + 'static,
    {
        let (jobs_tx, jobs_rx) = channel::unbounded::<Job>();
        let (setup_tx, setup_rx) = channel::bounded(1);

        // The thread that spawns or attaches becomes the tracer, so it must also be the
        // one that runs every later request.
        thread::Builder::new()
            .name("tracee-executor".into())
            .spawn(move || {
                let pid = match setup() {
                    Ok(pid) => pid,
                    Err(err) => {
                        let _ = setup_tx.send(Err(err));
                        return;
                    },
                };

                let _ = setup_tx.send(Ok(pid));

                executor::run(pid, jobs_rx);
            })?;

        let pid = match setup_rx.recv() {
            Ok(res) => res?,
            Err(_) => internal_error!("command executor exited during setup"),
        };

        let queue = CommandQueue::new(pid, jobs_tx);
        let inner = Arc::new(Inner::new(pid, origin, self.kill_on_drop, queue));

        let (events_tx, events_rx) = channel::unbounded();
        let (errors_tx, errors_rx) = channel::bounded(1);
        let (ready_tx, ready_rx) = channel::bounded(1);

        let wait_loop = WaitLoop::new(
            Arc::clone(&inner),
            events_tx,
            errors_tx,
            ready_tx,
            self.poll_delay,
            self.max_poll_delay,
        );

        let spawned = thread::Builder::new()
            .name(format!("tracee-wait-{pid}"))
            .spawn(move || wait_loop.run());

        if let Err(err) = spawned {
            discard(&inner);
            return Err(err.into());
        }

        // Block until the initial stop is observable, so requests made as soon as we
        // return find the tracee stopped.
        if ready_rx.recv().is_err() {
            debug!(pid = pid.as_raw(), "tracee lost before its initial stop");

            let err = errors_rx
                .recv()
                .unwrap_or(Error::TraceeExited { pid });

            return Err(err);
        }

        Ok(Tracee::new(inner, events_rx, errors_rx))
    }
}

// Tear down a tracee nobody will ever wait on: its wait loop could not be started.
fn discard(inner: &Arc<Inner>) {
    let pid = inner.pid;
    let flags = Some(WaitPidFlag::__WALL);

    match inner.origin {
        Origin::Spawned => {
            let _ = signal::kill(pid, Signal::SIGKILL);
            let _ = wait::waitpid(pid, flags);
        },
        Origin::Attached => {
            // Consume the attach-stop, then detach from the tracer thread.
            let _ = wait::waitpid(pid, flags);
            let _ = inner.queue.call(move || Ok(ptrace::detach(pid, None)?));
        },
    }

    inner.queue.close();
}
