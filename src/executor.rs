//! The command executor: the one OS thread allowed to make ptrace requests for a tracee.
//!
//! The kernel records the tracer of a tracee as a _thread_, not a process. Every ptrace
//! request for the tracee must come from that thread, or it fails with `ESRCH`. The
//! executor thread spawns or attaches to the tracee itself, then runs submitted jobs one
//! at a time until its queue is closed.

use std::sync::RwLock;

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::tracee::Pid;


/// Unit of work run on the executor thread.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Drain `jobs` until every sender has been dropped.
///
/// Jobs still buffered when the queue closes are run, so their submitters get a reply.
pub(crate) fn run(pid: Pid, jobs: Receiver<Job>) {
    debug!(pid = pid.as_raw(), "command executor started");

    let mut count = 0usize;

    for job in jobs.iter() {
        job();
        count += 1;
    }

    debug!(pid = pid.as_raw(), jobs = count, "command executor stopped");
}

/// Sending side of the job queue, guarded against the close-vs-send race.
///
/// Submitters hold the read side of the lock for the duration of the enqueue. The single
/// close takes the write side and drops the sender, so no job is ever sent on a closed
/// queue, and the queue is never closed twice.
#[derive(Debug)]
pub(crate) struct CommandQueue {
    pid: Pid,
    sender: RwLock<Option<Sender<Job>>>,
}

impl CommandQueue {
    pub fn new(pid: Pid, sender: Sender<Job>) -> Self {
        let sender = RwLock::new(Some(sender));

        Self { pid, sender }
    }

    /// Enqueue `job`. Fails with [`Error::TraceeExited`] if the queue has been closed.
    pub fn submit(&self, job: Job) -> Result<()> {
        let guard = match self.sender.read() {
            Ok(guard) => guard,
            Err(_) => internal_error!("command queue lock poisoned"),
        };

        match guard.as_ref() {
            Some(sender) => {
                // The executor only drops its receiver after every sender is gone, and we
                // hold one under the lock.
                if sender.send(job).is_err() {
                    internal_error!("command executor hung up on an open queue");
                }

                Ok(())
            },
            None => Err(Error::TraceeExited { pid: self.pid }),
        }
    }

    /// Run `f` on the executor thread and block for its result.
    pub fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = channel::bounded(1);

        self.submit(Box::new(move || {
            // The caller may have given up; nobody to tell.
            let _ = reply_tx.send(f());
        }))?;

        match reply_rx.recv() {
            Ok(res) => res,
            // Job dropped unrun: the executor thread is gone.
            Err(_) => Err(Error::TraceeExited { pid: self.pid }),
        }
    }

    /// Close the queue. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut guard = match self.sender.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let closed = guard.take().is_some();
        trace!(pid = self.pid.as_raw(), closed, "closing command queue");

        closed
    }
}
