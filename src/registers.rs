//! Architecture-specific program-counter extraction via
//! `PTRACE_GETREGSET(NT_PRSTATUS)`. See spec.md §4.6 and §9's note on the
//! `regs.pc` field.
//!
//! `nix::sys::ptrace::getregs` only wraps `PTRACE_GETREGS` for the host's
//! native `libc::user_regs_struct`, which doesn't exist in a single portable
//! shape across x86_64 and aarch64. We go straight to `libc::ptrace` with an
//! `iovec`, exactly as the original sampler's `PTRACE_GETREGSET` call does,
//! and define the register layout per target rather than leaning on a system
//! header (`<sys/user.h>`'s aarch64 `user_regs_struct` isn't exposed by the
//! `libc` crate at all).

use std::mem::MaybeUninit;

use nix::errno::Errno;

use crate::error::{Result, SprofError};

#[cfg(target_arch = "x86_64")]
type NativeRegs = libc::user_regs_struct;

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Copy, Clone, Default)]
struct NativeRegs {
    regs: [u64; 31],
    sp: u64,
    pc: u64,
    pstate: u64,
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!(
    "sprof only extracts the program counter for x86_64 and aarch64; see spec.md §9 on RISC-V"
);

/// Reads `tid`'s program counter while it is ptrace-stopped. Returns
/// `Ok(None)` on `ESRCH` (the tid died between its `SIGSTOP` and this read),
/// which the event loop treats as task-vanished rather than fatal.
pub fn read_pc(tid: i32) -> Result<Option<u64>> {
    let mut regs = MaybeUninit::<NativeRegs>::uninit();
    let mut iov = libc::iovec {
        iov_base: regs.as_mut_ptr() as *mut libc::c_void,
        iov_len: std::mem::size_of::<NativeRegs>(),
    };

    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid,
            libc::NT_PRSTATUS,
            &mut iov as *mut libc::iovec,
        )
    };

    if rc == -1 {
        let errno = Errno::last();
        if errno == Errno::ESRCH {
            return Ok(None);
        }
        return Err(SprofError::RegisterRead { tid, source: errno });
    }

    let regs = unsafe { regs.assume_init() };
    Ok(Some(pc_of(&regs)))
}

#[cfg(target_arch = "x86_64")]
fn pc_of(regs: &NativeRegs) -> u64 {
    regs.rip
}

#[cfg(target_arch = "aarch64")]
fn pc_of(regs: &NativeRegs) -> u64 {
    regs.pc
}
