use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use tracee::{Error, Event, Pid, Signal, Stage, Tracee, Tracer};

#[macro_use]
mod support;
use support::*;

#[test]
#[timeout(5000)]
fn test_attach_stop_is_first_event() -> Result<()> {
    let sleeper = Sleeper::spawn_asleep()?;
    let pid = sleeper.pid();

    let tracee = Tracee::attach(pid)?;

    assert_eq!(tracee.pid(), pid);
    assert_eq!(tracee.stage(), Stage::Stopped);
    assert_eq!(next_event(&tracee)?, Event::Stopped { signal: Signal::SIGSTOP });

    tracee.instruction_pointer()?;

    tracee.kill()?;
    assert_eq!(
        drain(&tracee)?,
        vec![Event::Signaled { signal: Signal::SIGKILL, core_dumped: false }],
    );

    Ok(())
}

#[test]
#[timeout(30000)]
fn test_attach_during_exec() -> Result<()> {
    // Attach as early as possible, often while the child is still in `execve()`. Its
    // post-exec `SIGTRAP` must not be mistaken for the attach-stop.
    for _ in 0..20 {
        let sleeper = Sleeper::spawn()?;
        let pid = sleeper.pid();

        let tracee = Tracee::attach(pid)?;
        assert_eq!(next_event(&tracee)?, Event::Stopped { signal: Signal::SIGSTOP });

        tracee.detach()?;
        wait_untraced(pid)?;
    }

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_attach_detach() -> Result<()> {
    let mut sleeper = Sleeper::spawn_asleep()?;
    let pid = sleeper.pid();

    let tracee = Tracee::attach(pid)?;
    next_event(&tracee)?;

    tracee.detach()?;
    assert_eq!(tracee.stage(), Stage::Detached);
    assert!(tracee.read_word(0x1000).unwrap_err().tracee_exited());
    assert!(tracee.detach().unwrap_err().tracee_exited());

    wait_untraced(pid)?;

    // Still our child, so the wait loop reaps it once it dies, silently.
    sleeper.kill()?;

    assert_eq!(drain(&tracee)?, Vec::<Event>::new());
    assert!(tracee.error().is_none());

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_attach_failure_returns_no_tracee() -> Result<()> {
    // PIDs are capped well below this.
    let pid = Pid::from_raw(i32::MAX);

    let res = Tracer::new().attach(pid);
    assert_matches!(res, Err(Error::Attach { .. }));

    Ok(())
}
