//! POSIX realtime interval timer driving the sampling cadence. See
//! spec.md §4.5.
//!
//! `SIGALRM` fires `timer_callback`, which must do only two things to stay
//! async-signal-safe: send `SIGUSR2` to the root tid, and record the instant
//! it did so. Both live in process-wide atomics rather than a
//! `lazy_static<Mutex<..>>` cell, since locking a mutex from a signal handler
//! risks deadlocking against the very thread the signal interrupted.

use std::mem::MaybeUninit;
use std::os::raw::c_int;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use nix::errno::Errno;
use nix::sys::signal::Signal;

use crate::error::{Result, SprofError};
use crate::time::TimeSpec;

/// The signal sent to the tracee's root tid on every timer interrupt,
/// requesting it stop so the tracer can read its register/CPU-time state.
pub const TRACEE_INTERRUPT_SIGNAL: c_int = libc::SIGUSR2;

/// Same signal, as the `nix` type the event loop matches `WaitStatus::Stopped`
/// against.
pub const TRACEE_INTERRUPT_SIGNAL_NIX: Signal = Signal::SIGUSR2;

static CALLBACK_TID: AtomicI32 = AtomicI32::new(0);
static LAST_INTERRUPT_SEC: AtomicI64 = AtomicI64::new(0);
static LAST_INTERRUPT_NSEC: AtomicI64 = AtomicI64::new(0);

/// Sets the tid the next `SIGALRM` should interrupt. Must be called before
/// `Timer::start`.
pub fn set_target(tid: i32) {
    CALLBACK_TID.store(tid, Ordering::SeqCst);
}

/// Timestamp of the most recent timer interrupt, used to schedule the next
/// one at a fixed phase rather than drifting by however long the tracer took
/// to service the previous one.
pub fn last_interrupt() -> TimeSpec {
    TimeSpec::new(
        LAST_INTERRUPT_SEC.load(Ordering::SeqCst),
        LAST_INTERRUPT_NSEC.load(Ordering::SeqCst),
    )
}

extern "C" fn timer_callback(_sig: c_int) {
    let tid = CALLBACK_TID.load(Ordering::SeqCst);
    if tid != 0 {
        loop {
            let rc = unsafe { libc::kill(tid, TRACEE_INTERRUPT_SIGNAL) };
            if rc == 0 || unsafe { *libc::__errno_location() } != libc::EAGAIN {
                break;
            }
        }
    }
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, ts.as_mut_ptr()) } == 0 {
        let ts = unsafe { ts.assume_init() };
        LAST_INTERRUPT_SEC.store(ts.tv_sec as i64, Ordering::SeqCst);
        LAST_INTERRUPT_NSEC.store(ts.tv_nsec as i64, Ordering::SeqCst);
    }
}

pub struct Timer {
    active: bool,
    timer_id: libc::timer_t,
    sampling_interval: TimeSpec,
    old_action: libc::sigaction,
}

impl Timer {
    pub fn new(sampling_interval: TimeSpec) -> Timer {
        Timer {
            active: false,
            timer_id: ptr::null_mut(),
            sampling_interval,
            old_action: unsafe { MaybeUninit::zeroed().assume_init() },
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Installs the `SIGALRM` handler and creates the underlying POSIX
    /// timer. A zero sampling interval disables the timer entirely (a
    /// single, manually-triggered sample is still possible via
    /// `schedule_interrupt_now`... but with no timer to fire it, callers
    /// that asked for frequency 0 are expected to sample exactly once up
    /// front and rely on process exit to end the run).
    pub fn start(&mut self) -> Result<()> {
        if self.sampling_interval.is_zero() {
            return Ok(());
        }
        if self.active {
            return Ok(());
        }

        let mut action: libc::sigaction = unsafe { MaybeUninit::zeroed().assume_init() };
        unsafe {
            libc::sigfillset(&mut action.sa_mask);
        }
        action.sa_flags = libc::SA_RESTART;
        action.sa_sigaction = timer_callback as usize;

        if unsafe { libc::sigaction(libc::SIGALRM, &action, &mut self.old_action) } != 0 {
            return Err(SprofError::TimerStart(Errno::last()));
        }

        let mut timer_id: libc::timer_t = ptr::null_mut();
        if unsafe { libc::timer_create(libc::CLOCK_REALTIME, ptr::null_mut(), &mut timer_id) } != 0
        {
            return Err(SprofError::TimerStart(Errno::last()));
        }

        self.timer_id = timer_id;
        self.active = true;
        Ok(())
    }

    pub fn pause(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.arm(TimeSpec::ZERO)
    }

    /// Fires (almost) immediately: one nanosecond out, matching the
    /// original's `scheduleInterruptNow` (an all-zero `it_value` disarms the
    /// timer instead of firing it).
    pub fn schedule_interrupt_now(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.arm(TimeSpec::new(0, 1))
    }

    pub fn schedule_interrupt_in(&mut self, interrupt: TimeSpec) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        if interrupt.to_nanoseconds() == 0 {
            return self.schedule_interrupt_now();
        }
        self.arm(interrupt)
    }

    /// Arms the timer for `last_interrupt + sampling_interval - now`, so
    /// interrupts land on a fixed cadence instead of drifting by however
    /// long each sample took to service.
    pub fn schedule_next(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        let now = TimeSpec::now();
        let next_planned = last_interrupt() + self.sampling_interval;
        let delay = next_planned - now;
        if delay.to_nanoseconds() == 0 {
            return self.schedule_interrupt_now();
        }
        self.arm(delay)
    }

    fn arm(&mut self, value: TimeSpec) -> Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: value.sec,
                tv_nsec: value.nsec,
            },
        };
        if unsafe { libc::timer_settime(self.timer_id, 0, &spec, ptr::null_mut()) } != 0 {
            return Err(SprofError::TimerStart(Errno::last()));
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        if unsafe { libc::timer_delete(self.timer_id) } != 0 {
            return Err(SprofError::TimerStop(Errno::last()));
        }
        if unsafe { libc::sigaction(libc::SIGALRM, &self.old_action, ptr::null_mut()) } != 0 {
            return Err(SprofError::TimerStop(Errno::last()));
        }
        self.active = false;
        Ok(())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_interval_never_becomes_active() {
        let mut timer = Timer::new(TimeSpec::ZERO);
        timer.start().unwrap();
        assert!(!timer.is_active());
    }
}
