use nix::errno::Errno;

use crate::tracee::Pid;


/// Offset of `rip` in the virtual `user` struct.
pub(crate) fn rip_user_offset() -> u64 {
    let regs = memoffset::offset_of!(libc::user, regs);
    let rip = memoffset::offset_of!(libc::user_regs_struct, rip);

    (regs + rip) as u64
}

pub(crate) fn peek_user(pid: Pid, off: u64) -> nix::Result<u64> {
    // SAFETY: `off` does not require validation, because it is not actually used as a
    // pointer offset by the kernel.
    //
    // See: https://github.com/torvalds/linux/blob/v4.9/arch/x86/kernel/ptrace.c#L774-L791

    // A successful peek can return `-1`, so errno is the only failure signal.
    Errno::clear();

    let data = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            pid.as_raw(),
            off as *mut libc::c_void,
            std::ptr::null_mut::<libc::c_void>(),
        )
    };

    if data == -1 {
        match Errno::last() {
            Errno::UnknownErrno => {},
            errno => return Err(errno),
        }
    }

    Ok(data as u64)
}

pub(crate) fn poke_user(pid: Pid, off: u64, data: u64) -> nix::Result<()> {
    // SAFETY: see `peek_user()`.
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            pid.as_raw(),
            off as *mut libc::c_void,
            data as *mut libc::c_void,
        )
    };

    Errno::result(res)?;

    Ok(())
}
