use nix::errno::Errno;

use crate::tracee::Pid;


/// Linux constant defined in `include/uapi/linux/elf.h`.
const NT_PRSTATUS: i32 = 0x1;

/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88).
#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct user_pt_regs {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64
}

pub(crate) fn getregs(pid: Pid) -> nix::Result<user_pt_regs> {
    let mut data = user_pt_regs::default();
    let mut rv = libc::iovec {
        iov_base: &mut data as *mut _ as *mut libc::c_void,
        iov_len: std::mem::size_of::<user_pt_regs>(),
    };

    let res = unsafe {
        libc::ptrace(libc::PTRACE_GETREGSET, pid.as_raw(), NT_PRSTATUS, &mut rv as *mut _ as *mut libc::c_void)
    };

    Errno::result(res)?;

    Ok(data)
}

pub(crate) fn setregs(pid: Pid, regs: user_pt_regs) -> nix::Result<()> {
    let mut rv = libc::iovec {
        iov_base: &regs as *const _ as *const libc::c_void as *mut libc::c_void,
        iov_len: std::mem::size_of::<user_pt_regs>(),
    };

    let res = unsafe {
        libc::ptrace(libc::PTRACE_SETREGSET, pid.as_raw(), NT_PRSTATUS, &mut rv as *mut _ as *mut libc::c_void)
    };

    Errno::result(res)?;

    Ok(())
}
