//! The public handle to a traced process, and the ptrace requests it serializes onto the
//! command executor.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::Receiver;
use nix::{
    errno::Errno,
    sys::{ptrace, signal},
};
use tracing::{debug, info, trace};

use crate::error::{Error, Result, ResultExt};
use crate::event::Event;
use crate::executor::CommandQueue;
use crate::lifecycle::{Lifecycle, Stage};
use crate::tracer::Tracer;

#[cfg(target_arch = "aarch64")]
use crate::aarch64;

#[cfg(target_arch = "x86_64")]
use crate::x86;

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

/// Register state of a tracee.
#[cfg(target_arch = "aarch64")]
pub type Registers = aarch64::user_pt_regs;

/// Register state of a tracee.
#[cfg(target_arch = "x86_64")]
pub type Registers = libc::user_regs_struct;

/// Extra signal info, such as its cause.
pub type Siginfo = libc::siginfo_t;

/// Restart requests, which resume stopped tracees.
///
/// The restart mode determines the possible subsequent stops of the restarted tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    Step,
    Continue,
    Syscall,
}

/// How the tracing relationship was established.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Origin {
    // Forked by the executor thread, self-attached via `PTRACE_TRACEME`.
    Spawned,

    // Pre-existing process, attached via `PTRACE_ATTACH`.
    Attached,
}

/// State shared by the handle, the command executor, and the wait loop.
#[derive(Debug)]
pub(crate) struct Inner {
    pub pid: Pid,
    pub origin: Origin,
    pub kill_on_drop: bool,
    pub lifecycle: Lifecycle,
    pub queue: CommandQueue,

    // Set when the handle is dropped while the tracee is still traced.
    abandoned: AtomicBool,

    // A `SIGSTOP` we caused, by attaching or to force a stop, has not been seen yet.
    awaiting_sigstop: AtomicBool,
}

impl Inner {
    pub fn new(pid: Pid, origin: Origin, kill_on_drop: bool, queue: CommandQueue) -> Self {
        let lifecycle = Lifecycle::new(pid);
        let abandoned = AtomicBool::new(false);

        // `PTRACE_ATTACH` sends a `SIGSTOP`, which may be reported after other stops, such
        // as the `SIGTRAP` of an `execve()` still in flight.
        let awaiting_sigstop = AtomicBool::new(origin == Origin::Attached);

        Self { pid, origin, kill_on_drop, lifecycle, queue, abandoned, awaiting_sigstop }
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Whether the tracee must be resumed past the stop reported by `event`, because it
    /// precedes a `SIGSTOP` we are waiting for. Seeing that `SIGSTOP` ends the wait.
    pub fn skips_stop(&self, event: &Event) -> bool {
        if !self.awaiting_sigstop.load(Ordering::SeqCst) {
            return false;
        }

        if event.signal() == Some(Signal::SIGSTOP) {
            self.awaiting_sigstop.store(false, Ordering::SeqCst);
            return false;
        }

        true
    }

    fn kills_on_release(&self) -> bool {
        self.origin == Origin::Spawned && self.kill_on_drop
    }

    // The requests below must only run on the executor thread.

    fn check_live(&self) -> Result<Stage> {
        let stage = self.lifecycle.stage();

        if stage.is_terminal() {
            return Err(Error::TraceeExited { pid: self.pid });
        }

        Ok(stage)
    }

    fn check_stopped(&self) -> Result<()> {
        match self.check_live()? {
            Stage::Stopped => Ok(()),
            stage => Err(Error::NotStopped { pid: self.pid, stage }),
        }
    }

    fn restart(&self, mode: Restart, signal: Option<Signal>) -> Result<()> {
        let pid = self.pid;

        self.check_stopped()?;

        // Once the request lands, the wait loop may see the next stop at any moment, so
        // `Running` must be published first.
        if self.lifecycle.advance(Stage::Running).is_err() {
            return Err(Error::TraceeExited { pid });
        }

        let res = match mode {
            Restart::Step =>
                ptrace::step(pid, signal),
            Restart::Continue =>
                ptrace::cont(pid, signal),
            Restart::Syscall =>
                ptrace::syscall(pid, signal),
        };

        if let Err(source) = res {
            self.lifecycle.revert(Stage::Running, Stage::Stopped);
            return Err(Error::Restart { pid, mode, source });
        }

        Ok(())
    }

    fn detach(&self) -> Result<()> {
        let pid = self.pid;

        self.check_stopped()?;

        // Mark first, so the wait loop treats the loss of the tracee as expected and
        // publishes nothing more for it.
        let prev = match self.lifecycle.advance(Stage::Detached) {
            Ok(prev) => prev,
            Err(_) => return Err(Error::TraceeExited { pid }),
        };

        if let Err(source) = ptrace::detach(pid, None) {
            // With `ESRCH` the tracee is gone, and there is nothing left to detach from.
            if source != Errno::ESRCH {
                self.lifecycle.revert(Stage::Detached, prev);
            }

            return Err::<(), _>(source).died_if_esrch(pid);
        }

        info!(pid = pid.as_raw(), "detached from tracee");

        Ok(())
    }

    fn send_signal(&self, sig: Signal) -> Result<()> {
        self.check_live()?;

        signal::kill(self.pid, sig).died_if_esrch(self.pid)
    }

    fn read_word(&self, addr: u64) -> Result<u64> {
        self.check_stopped()?;

        let word = ptrace::read(self.pid, addr as ptrace::AddressType).died_if_esrch(self.pid)?;

        Ok(word as u64)
    }

    fn write_word(&self, addr: u64, word: u64) -> Result<()> {
        self.check_stopped()?;

        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                self.pid.as_raw(),
                addr as *mut libc::c_void,
                word as *mut libc::c_void,
            )
        };

        Errno::result(res).died_if_esrch(self.pid)?;

        Ok(())
    }

    fn proc_mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid.as_raw())
    }

    fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        use std::os::unix::fs::FileExt;

        self.check_stopped()?;

        let mem = fs::File::open(self.proc_mem_path())?;
        let mut data = vec![0; len];
        let actual = mem.read_at(&mut data, addr)?;

        if actual != len {
            return Err(Error::ShortTransfer { pid: self.pid, addr, expected: len, actual });
        }

        Ok(data)
    }

    fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        self.check_stopped()?;

        let mem = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.proc_mem_path())?;

        let actual = mem.write_at(data, addr)?;

        if actual != data.len() {
            return Err(Error::ShortTransfer { pid: self.pid, addr, expected: data.len(), actual });
        }

        Ok(())
    }

    #[cfg(target_arch = "x86_64")]
    fn registers(&self) -> Result<Registers> {
        self.check_stopped()?;

        ptrace::getregs(self.pid).died_if_esrch(self.pid)
    }

    #[cfg(target_arch = "aarch64")]
    fn registers(&self) -> Result<Registers> {
        self.check_stopped()?;

        aarch64::getregs(self.pid).died_if_esrch(self.pid)
    }

    #[cfg(target_arch = "x86_64")]
    fn set_registers(&self, regs: Registers) -> Result<()> {
        self.check_stopped()?;

        ptrace::setregs(self.pid, regs).died_if_esrch(self.pid)
    }

    #[cfg(target_arch = "aarch64")]
    fn set_registers(&self, regs: Registers) -> Result<()> {
        self.check_stopped()?;

        aarch64::setregs(self.pid, regs).died_if_esrch(self.pid)
    }

    #[cfg(target_arch = "x86_64")]
    fn instruction_pointer(&self) -> Result<u64> {
        self.check_stopped()?;

        x86::peek_user(self.pid, x86::rip_user_offset()).died_if_esrch(self.pid)
    }

    #[cfg(target_arch = "aarch64")]
    fn instruction_pointer(&self) -> Result<u64> {
        Ok(self.registers()?.pc)
    }

    #[cfg(target_arch = "x86_64")]
    fn set_instruction_pointer(&self, addr: u64) -> Result<()> {
        self.check_stopped()?;

        x86::poke_user(self.pid, x86::rip_user_offset(), addr).died_if_esrch(self.pid)
    }

    #[cfg(target_arch = "aarch64")]
    fn set_instruction_pointer(&self, addr: u64) -> Result<()> {
        let mut regs = self.registers()?;
        regs.pc = addr;
        self.set_registers(regs)
    }

    fn siginfo(&self) -> Result<Siginfo> {
        self.check_stopped()?;

        ptrace::getsiginfo(self.pid).died_if_esrch(self.pid)
    }

    /// Continue past the stop reported by `event`, delivering its signal unless it is a
    /// ptrace trap.
    pub fn resume_past(&self, event: Event) -> Result<()> {
        let signal = event.signal().filter(|signal| *signal != Signal::SIGTRAP);

        trace!(pid = self.pid.as_raw(), ?event, ?signal, "resuming past stop");

        self.restart(Restart::Continue, signal)
    }

    /// Let go of a tracee whose handle has been dropped: kill it if it is ours to kill,
    /// otherwise detach so it can run on untraced.
    fn release(&self) -> Result<()> {
        if self.kills_on_release() {
            self.send_signal(Signal::SIGKILL)
        } else {
            self.detach()
        }
    }

    /// Release an abandoned tracee at the stop reported by `event`.
    ///
    /// Detaching while our own `SIGSTOP` is still pending would leave the untraced process
    /// stopped for good, so until that `SIGSTOP` is reported, resume past any other stop.
    pub fn release_at(&self, event: Event) -> Result<()> {
        if !self.kills_on_release() && self.skips_stop(&event) {
            return self.resume_past(event);
        }

        self.release()
    }

    /// Run when the handle is dropped while the tracee is still traced.
    ///
    /// A running tracee that is not ours to kill is sent a `SIGSTOP`. The wait loop
    /// releases it once that `SIGSTOP` is reported.
    fn abandon(&self) -> Result<()> {
        if self.kills_on_release() {
            return self.send_signal(Signal::SIGKILL);
        }

        match self.check_live()? {
            Stage::Stopped => self.detach(),
            _ => {
                self.awaiting_sigstop.store(true, Ordering::SeqCst);
                self.send_signal(Signal::SIGSTOP)
            },
        }
    }
}

/// A traced process.
///
/// Every ptrace request is executed on a dedicated thread which is the kernel-recognized
/// tracer of the process, so a `Tracee` may be shared and used from any thread. Each
/// request blocks the calling thread until it completes.
///
/// Requests that need the tracee in a ptrace-stop fail with [`Error::NotStopped`] while it
/// runs. Wait for a [`Event::Stopped`] on [`events()`](Tracee::events) after restarting it.
/// Once the tracee has exited or been detached, every request fails with
/// [`Error::TraceeExited`].
#[derive(Debug)]
pub struct Tracee {
    inner: Arc<Inner>,
    events: Receiver<Event>,
    errors: Receiver<Error>,
}

impl Tracee {
    pub(crate) fn new(inner: Arc<Inner>, events: Receiver<Event>, errors: Receiver<Error>) -> Self {
        Self { inner, events, errors }
    }

    /// Spawn `path` with arguments `args` (not including `argv[0]`) as a tracee, using the
    /// default [`Tracer`] configuration.
    pub fn exec<S, I, A>(path: S, args: I) -> Result<Self>
    where
        S: AsRef<std::ffi::OsStr>,
        I: IntoIterator<Item = A>,
        A: AsRef<std::ffi::OsStr>,
    {
        Tracer::new().exec(path, args)
    }

    /// Attach to the running process `pid`, using the default [`Tracer`] configuration.
    pub fn attach(pid: Pid) -> Result<Self> {
        Tracer::new().attach(pid)
    }

    pub fn pid(&self) -> Pid {
        self.inner.pid
    }

    /// Current lifecycle stage.
    pub fn stage(&self) -> Stage {
        self.inner.lifecycle.stage()
    }

    /// Stream of tracee state changes, in the order they happened.
    ///
    /// The stream is finite: it closes after a terminal event, after a wait failure (see
    /// [`error()`](Tracee::error)), or once a detached tracee is no longer waitable.
    pub fn events(&self) -> &Receiver<Event> {
        &self.events
    }

    /// Return the error that ended the event stream, if any.
    ///
    /// Call once, after the event stream has closed. Blocks until it does.
    pub fn error(&self) -> Option<Error> {
        self.errors.recv().ok()
    }

    fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);

        self.inner.queue.call(move || f(&inner))
    }

    /// Resume the stopped tracee with `mode`, delivering `signal` if given.
    pub fn restart(&self, mode: Restart, signal: impl Into<Option<Signal>>) -> Result<()> {
        let signal = signal.into();

        self.call(move |inner| inner.restart(mode, signal))
    }

    /// Resume the tracee for exactly one instruction.
    pub fn single_step(&self) -> Result<()> {
        self.restart(Restart::Step, None)
    }

    /// Resume the tracee until its next ptrace-stop.
    pub fn cont(&self) -> Result<()> {
        self.restart(Restart::Continue, None)
    }

    /// Resume the tracee until the next syscall entry or exit.
    pub fn syscall(&self) -> Result<()> {
        self.restart(Restart::Syscall, None)
    }

    /// Release the tracing relationship. The tracee continues untraced, and no further
    /// events are published for it.
    pub fn detach(&self) -> Result<()> {
        self.call(|inner| inner.detach())
    }

    /// Send `signal` to the tracee. Does not require a ptrace-stop.
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        self.call(move |inner| inner.send_signal(signal))
    }

    pub fn kill(&self) -> Result<()> {
        self.send_signal(Signal::SIGKILL)
    }

    /// Read the word at `addr` in the tracee's address space.
    pub fn read_word(&self, addr: u64) -> Result<u64> {
        self.call(move |inner| inner.read_word(addr))
    }

    /// Overwrite the word at `addr` in the tracee's address space.
    pub fn write_word(&self, addr: u64, word: u64) -> Result<()> {
        self.call(move |inner| inner.write_word(addr, word))
    }

    /// Read exactly `len` bytes starting at `addr`, via `/proc/<pid>/mem`.
    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.call(move |inner| inner.read_memory(addr, len))
    }

    /// Write all of `data` starting at `addr`, via `/proc/<pid>/mem`.
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<()> {
        let data = data.to_vec();

        self.call(move |inner| inner.write_memory(addr, &data))
    }

    pub fn registers(&self) -> Result<Registers> {
        self.call(|inner| inner.registers())
    }

    pub fn set_registers(&self, regs: Registers) -> Result<()> {
        self.call(move |inner| inner.set_registers(regs))
    }

    pub fn instruction_pointer(&self) -> Result<u64> {
        self.call(|inner| inner.instruction_pointer())
    }

    pub fn set_instruction_pointer(&self, addr: u64) -> Result<()> {
        self.call(move |inner| inner.set_instruction_pointer(addr))
    }

    /// Signal info for the current ptrace-stop.
    pub fn siginfo(&self) -> Result<Siginfo> {
        self.call(|inner| inner.siginfo())
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        let stage = self.stage();

        if stage.is_terminal() {
            return;
        }

        // Before the request runs, so that any stop the wait loop sees from here on is
        // handled as a release point.
        self.inner.abandoned.store(true, Ordering::SeqCst);

        debug!(pid = self.pid().as_raw(), ?stage, "tracee handle dropped while traced");

        if let Err(err) = self.call(|inner| inner.abandon()) {
            debug!(pid = self.pid().as_raw(), %err, "could not release dropped tracee");
        }
    }
}
