use std::fs;
use std::path::Path;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tracee::{Event, Pid, Registers, Tracee};

/// Longest we wait for any single event before calling the test hung.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

#[allow(unused)]
macro_rules! assert_matches {
    ($expr: expr, $pat: pat) => {
        if let $pat = $expr {
            // Pass.
        } else {
            panic!("expected `{}` to match `{}`", stringify!($expr), stringify!($pat));
        }
    }
}

/// Spawn a traced `/bin/true`.
#[allow(unused)]
pub fn trace_true() -> Result<Tracee> {
    Ok(Tracee::exec("/bin/true", Vec::<&str>::new())?)
}

/// Receive the next event, failing instead of hanging.
#[allow(unused)]
pub fn next_event(tracee: &Tracee) -> Result<Event> {
    Ok(tracee.events().recv_timeout(EVENT_TIMEOUT)?)
}

/// Receive events until the stream closes.
#[allow(unused)]
pub fn drain(tracee: &Tracee) -> Result<Vec<Event>> {
    use crossbeam::channel::RecvTimeoutError;

    let mut events = vec![];

    loop {
        match tracee.events().recv_timeout(EVENT_TIMEOUT) {
            Ok(event) => events.push(event),
            Err(RecvTimeoutError::Disconnected) => return Ok(events),
            Err(RecvTimeoutError::Timeout) => return Err(anyhow!("event stream did not close")),
        }
    }
}

/// Base address of the first mapping of `exe` in `pid`'s address space.
#[allow(unused)]
pub fn image_base(pid: Pid, exe: impl AsRef<Path>) -> Result<u64> {
    let exe = fs::canonicalize(exe)?;
    let exe = exe.to_string_lossy();
    let maps = fs::read_to_string(format!("/proc/{}/maps", pid))?;

    for line in maps.lines() {
        let cols: Vec<_> = line.split_whitespace().collect();

        // start-end perms offset dev inode path
        if cols.len() == 6 && cols[5] == exe && cols[2] == "00000000" {
            let start = cols[0].split('-').next().unwrap_or_default();
            return Ok(u64::from_str_radix(start, 16)?);
        }
    }

    Err(anyhow!("no mapping for {} in pid {}", exe, pid))
}

#[cfg(target_arch = "x86_64")]
#[allow(unused)]
pub fn ip_of(regs: &Registers) -> u64 {
    regs.rip
}

#[cfg(target_arch = "aarch64")]
#[allow(unused)]
pub fn ip_of(regs: &Registers) -> u64 {
    regs.pc
}

#[cfg(target_arch = "x86_64")]
#[allow(unused)]
pub fn sp_of(regs: &Registers) -> u64 {
    regs.rsp
}

#[cfg(target_arch = "aarch64")]
#[allow(unused)]
pub fn sp_of(regs: &Registers) -> u64 {
    regs.sp
}

/// Scheduler state of `pid`, as in the third field of `/proc/<pid>/stat`.
#[allow(unused)]
pub fn proc_state(pid: Pid) -> Result<char> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid))?;

    // `comm` may contain spaces and parens, so split after its closing paren.
    let state = stat
        .rfind(')')
        .and_then(|end| stat[end + 1..].trim_start().chars().next());

    state.ok_or_else(|| anyhow!("malformed stat for pid {}", pid))
}

/// PID of the process tracing `pid`, or 0 if untraced.
#[allow(unused)]
pub fn tracer_pid(pid: Pid) -> Result<i32> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid))?;

    for line in status.lines() {
        if let Some(value) = line.strip_prefix("TracerPid:") {
            return Ok(value.trim().parse()?);
        }
    }

    Err(anyhow!("no TracerPid for pid {}", pid))
}

/// Wait until `pid` is no longer traced, then check that it was not left stopped.
#[allow(unused)]
pub fn wait_untraced(pid: Pid) -> Result<()> {
    let deadline = Instant::now() + EVENT_TIMEOUT;

    while tracer_pid(pid)? != 0 {
        if Instant::now() > deadline {
            bail!("pid {} is still traced", pid);
        }

        thread::sleep(Duration::from_millis(1));
    }

    // Give a stray pending `SIGSTOP` time to land.
    thread::sleep(Duration::from_millis(50));

    match proc_state(pid)? {
        'T' | 't' => bail!("pid {} was left stopped", pid),
        _ => Ok(()),
    }
}

/// An untraced `sleep 60` child, killed and reaped on drop.
#[allow(unused)]
pub struct Sleeper {
    child: Child,
}

#[allow(unused)]
impl Sleeper {
    /// Spawn, returning as soon as the child exists. It may still be inside `execve()`.
    pub fn spawn() -> Result<Self> {
        let child = Command::new("sleep").arg("60").spawn()?;

        Ok(Self { child })
    }

    /// Spawn, returning once the child is past `execve()` and asleep.
    pub fn spawn_asleep() -> Result<Self> {
        let sleeper = Self::spawn()?;
        let pid = sleeper.pid();
        let deadline = Instant::now() + EVENT_TIMEOUT;

        loop {
            let comm = fs::read_to_string(format!("/proc/{}/comm", pid))?;

            if comm.trim() == "sleep" && proc_state(pid)? == 'S' {
                return Ok(sleeper);
            }

            if Instant::now() > deadline {
                bail!("pid {} never fell asleep", pid);
            }

            thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }

    pub fn kill(&mut self) -> Result<()> {
        Ok(self.child.kill()?)
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let _ = self.child.kill();

        // Fails if a wait loop has already reaped it.
        let _ = self.child.wait();
    }
}
