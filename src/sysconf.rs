//! Scheduling-class and CPU-affinity configuration, plus online-CPU
//! discovery for `--core-isolation`. Out of scope for the sampling engine
//! itself (spec.md §1), but still needed to ship a complete CLI binary —
//! mirrors `pperf.c`'s `main` setup before `fork`.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;

use nix::errno::Errno;

use crate::error::{Result, SprofError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedClass {
    Fifo,
    RoundRobin,
}

/// Reads `/proc/cpuinfo` and returns the `processor` field of every logical
/// CPU, in the order they appear, matching `getOnlineCPUIds`.
pub fn online_cpu_ids() -> Vec<u32> {
    let file = match File::open("/proc/cpuinfo") {
        Ok(f) => f,
        Err(_) => return Vec::new(),
    };

    let mut ids = Vec::new();
    for line in BufReader::new(file).lines().flatten() {
        if let Some(rest) = line.strip_prefix("processor") {
            if let Some(id) = rest.trim().trim_start_matches(':').trim().parse::<u32>().ok() {
                ids.push(id);
            }
        }
    }
    ids
}

/// Applies `SCHED_FIFO` or `SCHED_RR` at `priority` to the calling process
/// (pid 0), exactly as `pperf.c` does both in the parent (before fork) and
/// again in the child (after fork, before `execvp`).
pub fn set_scheduler(class: SchedClass, priority: i32) -> Result<()> {
    let policy = match class {
        SchedClass::Fifo => libc::SCHED_FIFO,
        SchedClass::RoundRobin => libc::SCHED_RR,
    };
    let param = libc::sched_param {
        sched_priority: priority,
    };
    let rc = unsafe { libc::sched_setscheduler(0, policy, &param) };
    if rc != 0 {
        return Err(SprofError::SchedSetScheduler(Errno::last()));
    }
    Ok(())
}

/// Pins the calling process to exactly `cpu_id`. Used for the sampler's own
/// affinity (last online CPU).
pub fn pin_to_cpu(cpu_id: u32) -> Result<()> {
    pin_to_cpus(std::iter::once(cpu_id))
}

/// Pins the calling process to every id in `cpu_ids`. Used for the target's
/// affinity (every online CPU except the sampler's).
pub fn pin_to_cpus(cpu_ids: impl Iterator<Item = u32>) -> Result<()> {
    unsafe {
        let mut set = MaybeUninit::<libc::cpu_set_t>::zeroed().assume_init();
        libc::CPU_ZERO(&mut set);
        for id in cpu_ids {
            libc::CPU_SET(id as usize, &mut set);
        }
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == -1 {
            return Err(SprofError::SchedSetAffinity(Errno::last()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_cpu_ids_reads_real_proc_cpuinfo() {
        // /proc/cpuinfo is always present on Linux CI/dev hosts; this is a
        // smoke test, not an assertion about core count.
        let ids = online_cpu_ids();
        assert!(!ids.is_empty());
    }
}
