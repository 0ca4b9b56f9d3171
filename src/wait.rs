//! The wait loop: observes tracee state changes and publishes them as [`Event`]s.
//!
//! It is the only writer of the error slot, and the only party that closes the command
//! queue. It closes it once, after it has seen the tracee terminate.

use std::cmp;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::Sender;
use nix::{
    errno::Errno,
    sys::wait::{self, WaitPidFlag, WaitStatus},
};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::lifecycle::Stage;
use crate::tracee::Inner;


pub(crate) struct WaitLoop {
    inner: Arc<Inner>,
    events: Sender<Event>,
    errors: Sender<Error>,

    // Signaled once the first event has been published.
    ready: Option<Sender<()>>,

    poll_delay: Duration,
    max_poll_delay: Duration,
}

impl WaitLoop {
    pub fn new(
        inner: Arc<Inner>,
        events: Sender<Event>,
        errors: Sender<Error>,
        ready: Sender<()>,
        poll_delay: Duration,
        max_poll_delay: Duration,
    ) -> Self {
        let ready = Some(ready);

        Self { inner, events, errors, ready, poll_delay, max_poll_delay }
    }

    pub fn run(mut self) {
        let pid = self.inner.pid;

        debug!(pid = pid.as_raw(), "wait loop started");

        if let Err(err) = self.wait_until_terminated() {
            warn!(pid = pid.as_raw(), %err, "wait loop failed");

            // Bounded to one, and we are its only writer.
            let _ = self.errors.send(err);
        }

        self.teardown();
    }

    fn wait_until_terminated(&mut self) -> Result<()> {
        loop {
            let status = match self.poll()? {
                Some(status) => status,
                None => return Ok(()),
            };

            trace!(pid = self.inner.pid.as_raw(), ?status, "tracee changed state");

            let event = match Event::from_wait_status(status) {
                Some(event) => event,
                None => continue,
            };

            if event.is_terminal() {
                self.on_terminated(event);
                return Ok(());
            }

            self.on_stopped(event);
        }
    }

    // Poll the tracee for a `wait(2)` status change, backing off while there is none.
    //
    // Returns `None` if a detached tracee can no longer be waited on.
    fn poll(&self) -> Result<Option<WaitStatus>> {
        let pid = self.inner.pid;
        let flags = WaitPidFlag::__WALL | WaitPidFlag::WNOHANG;

        let mut poll_delay = self.poll_delay;

        loop {
            match wait::waitpid(pid, Some(flags)) {
                Ok(WaitStatus::StillAlive) => {
                    thread::sleep(poll_delay);

                    poll_delay = cmp::min(poll_delay * 2, self.max_poll_delay);
                },
                Ok(status) => {
                    return Ok(Some(status));
                },
                Err(Errno::EINTR) => {
                    continue;
                },
                Err(Errno::ECHILD) if self.inner.lifecycle.stage() == Stage::Detached => {
                    // An attached process that is not our child stops being waitable as
                    // soon as we detach.
                    debug!(pid = pid.as_raw(), "detached tracee is no longer waitable");
                    return Ok(None);
                },
                Err(source) => {
                    return Err(Error::Wait { pid, source });
                },
            }
        }
    }

    fn on_stopped(&mut self, event: Event) {
        let pid = self.inner.pid;

        if let Err(stage) = self.inner.lifecycle.advance(Stage::Stopped) {
            trace!(pid = pid.as_raw(), ?stage, ?event, "not publishing stop of untraced tracee");
            return;
        }

        // Stops that precede an expected `SIGSTOP` are never published. In particular,
        // the first event of an attached tracee is its attach-stop.
        if self.inner.skips_stop(&event) {
            self.resume_past(event);
            return;
        }

        if self.inner.is_abandoned() || self.events.send(event).is_err() {
            self.release(event);
            return;
        }

        self.signal_ready();
    }

    fn on_terminated(&mut self, event: Event) {
        let pid = self.inner.pid;

        match self.inner.lifecycle.advance(Stage::Exited) {
            Ok(_) => {
                info!(pid = pid.as_raw(), ?event, "tracee terminated");

                // Fails only if the handle is gone, and then nobody is listening.
                let _ = self.events.send(event);
                self.signal_ready();
            },
            Err(stage) => {
                debug!(pid = pid.as_raw(), ?stage, ?event, "untraced tracee terminated");
            },
        }
    }

    fn signal_ready(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(());
        }
    }

    fn resume_past(&self, event: Event) {
        let inner = Arc::clone(&self.inner);

        self.submit(move || {
            if let Err(err) = inner.resume_past(event) {
                debug!(pid = inner.pid.as_raw(), %err, "could not resume tracee");
            }
        });
    }

    // Nobody will command this tracee again. Let it go at this stop, or a later one.
    fn release(&self, event: Event) {
        info!(pid = self.inner.pid.as_raw(), ?event, "releasing abandoned tracee");

        let inner = Arc::clone(&self.inner);

        self.submit(move || {
            if let Err(err) = inner.release_at(event) {
                debug!(pid = inner.pid.as_raw(), %err, "could not release abandoned tracee");
            }
        });
    }

    fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(err) = self.inner.queue.submit(Box::new(job)) {
            debug!(pid = self.inner.pid.as_raw(), %err, "could not submit request");
        }
    }

    fn teardown(self) {
        let WaitLoop { inner, events, errors, ready, .. } = self;
        let pid = inner.pid;

        // A wait failure leaves the tracee in an unknown state. Treat it as gone.
        let _ = inner.lifecycle.advance(Stage::Exited);

        // Error slot first, so it is readable once the event stream reports closed.
        drop(errors);
        drop(events);
        drop(ready);

        inner.queue.close();

        debug!(pid = pid.as_raw(), "wait loop stopped");
    }
}
