//! The tracer/sampler core: forks and ptrace-traces the target, turns timer
//! interrupts into group stops, collects samples, and resumes threads. See
//! spec.md §4.6 for the full state machine this implements.

use std::ffi::CString;
use std::path::Path;

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult, Pid};
use rand::Rng;

use crate::error::{Result, SprofError};
use crate::pmu::Pmu;
use crate::profile::ProfileWriter;
use crate::registers;
use crate::sysconf::{self, SchedClass};
use crate::task_table::TaskTable;
use crate::time::TimeSpec;
use crate::timer::{self, Timer};
use crate::vmmap::{self, VMMaps};

/// End-of-run statistics for `--verbose`, mirroring the five lines
/// `pperf.c`'s `exitSampler` prints.
pub struct RunStats {
    pub total_wall_us: u64,
    pub total_latency_us: u64,
    pub samples: u64,
    pub foreign_interrupts: u64,
    pub sampling_interval: TimeSpec,
    pub target_frequency: f64,
}

pub struct RunConfig<'a> {
    pub command: &'a [String],
    pub sched: Option<(SchedClass, i32)>,
    pub core_isolation: bool,
    pub frequency: f64,
    pub randomize: bool,
    pub output: Option<&'a Path>,
}

/// Forks, ptrace-traces, and samples the configured command. `pmu` must
/// already be `init`ialized; this function takes over its `read`/`release`
/// lifecycle.
pub fn run(config: &RunConfig, mut pmu: Box<dyn Pmu>) -> Result<RunStats> {
    let online_cpus = if config.core_isolation {
        let ids = sysconf::online_cpu_ids();
        if ids.is_empty() {
            return Err(SprofError::NoOnlineCpus);
        }
        Some(ids)
    } else {
        None
    };

    if let Some((class, prio)) = config.sched {
        sysconf::set_scheduler(class, prio)?;
    }
    if let Some(ref ids) = online_cpus {
        let sampler_cpu = *ids.last().unwrap();
        sysconf::pin_to_cpu(sampler_cpu)?;
    }

    let writer = match config.output {
        Some(path) => Some(ProfileWriter::create(path)?),
        None => None,
    };

    let command = config.command.to_vec();
    let child_sched = config.sched;
    let child_cpus = online_cpus.clone();

    let fork_result = retry_fork()?;
    match fork_result {
        ForkResult::Child => {
            // Only async-signal-safe-ish work from here: we're about to
            // exec, so panicking/allocating before that is tolerated the
            // way the original's C child branch tolerates fprintf.
            if let Some((class, prio)) = child_sched {
                if sysconf::set_scheduler(class, prio).is_err() {
                    std::process::exit(1);
                }
            }
            if let Some(ids) = child_cpus {
                if ids.len() > 1 {
                    let target_cpus = ids[..ids.len() - 1].iter().copied();
                    if sysconf::pin_to_cpus(target_cpus).is_err() {
                        std::process::exit(1);
                    }
                }
            }
            if ptrace::traceme().is_err() {
                std::process::exit(1);
            }
            let exe = CString::new(command[0].as_bytes()).unwrap();
            let args: Vec<CString> = command
                .iter()
                .map(|a| CString::new(a.as_bytes()).unwrap())
                .collect();
            let _ = execvp(&exe, &args);
            std::process::exit(1);
        }
        ForkResult::Parent { child } => {
            run_parent(child, config, pmu.as_mut(), writer)
        }
    }
}

fn retry_fork() -> Result<ForkResult> {
    loop {
        match unsafe { fork() } {
            Ok(r) => return Ok(r),
            Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(SprofError::Fork(e)),
        }
    }
}

fn run_parent(
    target: Pid,
    config: &RunConfig,
    pmu: &mut dyn Pmu,
    mut writer: Option<ProfileWriter>,
) -> Result<RunStats> {
    let rendezvous = retry_wait(Some(target))?;
    match rendezvous {
        WaitStatus::Exited(..) => return Err(SprofError::TargetNeverStarted),
        WaitStatus::Stopped(pid, _) if pid == target => {}
        WaitStatus::Stopped(pid, _) => {
            return Err(SprofError::UnexpectedRendezvousPid {
                expected: target.as_raw(),
                got: pid.as_raw(),
            })
        }
        _ => return Err(SprofError::TargetNeverStarted),
    }

    let options = ptrace::Options::PTRACE_O_TRACECLONE
        | ptrace::Options::PTRACE_O_TRACEFORK
        | ptrace::Options::PTRACE_O_TRACEVFORK
        | ptrace::Options::PTRACE_O_TRACEEXIT
        | ptrace::Options::PTRACE_O_EXITKILL;
    if ptrace::setoptions(target, options).is_err() {
        kill_and_detach(target);
        return Err(SprofError::SetOptions(Errno::last()));
    }

    // Prove the address space is readable before we commit to tracing it;
    // the authoritative map is captured later, at PTRACE_EVENT_EXIT.
    let probe = vmmap::collect(target.as_raw(), 1);
    if probe.is_empty() {
        kill_and_detach(target);
        return Err(SprofError::InitialVmmapUnreadable(target.as_raw()));
    }

    timer::set_target(target.as_raw());
    let mut table = TaskTable::new(target.as_raw());
    if let Err(e) = table.add(target.as_raw()) {
        kill_and_detach(target);
        return Err(e);
    }

    let sampling_interval = TimeSpec::from_frequency(config.frequency);
    let mut timer_obj = Timer::new(sampling_interval);
    if timer_obj.start().is_err() {
        kill_and_detach(target);
        return Err(SprofError::TimerStart(Errno::last()));
    }

    let sampler_start = TimeSpec::now();

    if config.randomize {
        let fraction: f64 = rand::thread_rng().gen();
        let delay = TimeSpec::from_nanoseconds(
            (sampling_interval.to_nanoseconds() as f64 * fraction) as u64,
        );
        if timer_obj.schedule_interrupt_in(delay).is_err() {
            kill_and_detach(target);
            return Err(SprofError::TimerStart(Errno::last()));
        }
    } else if timer_obj.schedule_interrupt_now().is_err() {
        kill_and_detach(target);
        return Err(SprofError::TimerStart(Errno::last()));
    }

    match ptrace_cont_retry(target, None) {
        Ok(true) => {}
        Ok(false) => {
            kill_and_detach(target);
            return Err(SprofError::TargetNeverStarted);
        }
        Err(e) => {
            kill_and_detach(target);
            return Err(e);
        }
    }

    let pmu_data_size = pmu.data_size() as usize;
    let mut pmu_buf = vec![0u8; pmu_data_size];

    let mut samples: u64 = 0;
    let mut foreign_interrupts: u64 = 0;
    let mut total_latency = TimeSpec::ZERO;
    let mut process_maps = VMMaps::new();

    let run_result = 'outer: loop {
        let mut group_stop = false;
        let mut stop_count: usize = 0;
        let mut latency_start = TimeSpec::now();

        // Phase A: collect a group stop.
        while !table.is_empty() {
            let status = match retry_wait(None) {
                Ok(s) => s,
                Err(e) => break 'outer Err(e),
            };

            match status {
                WaitStatus::Exited(pid, _) => {
                    let tid = pid.as_raw();
                    if tid == target.as_raw() || table.len() == 1 {
                        debug!("[{}] last tracee died", tid);
                        break 'outer Ok(());
                    }
                    let _ = table.remove(tid);
                    debug!("[{}] tracee died", tid);
                    if group_stop && stop_count >= table.len() {
                        break;
                    }
                    continue;
                }
                WaitStatus::PtraceEvent(pid, _sig, event) => {
                    let tid = pid.as_raw();
                    let signal_to_send = handle_ptrace_event(
                        event,
                        tid,
                        &table,
                        &mut process_maps,
                    );
                    if let Err(e) = ptrace_continue(tid, signal_to_send, &mut table) {
                        break 'outer Err(e);
                    }
                }
                WaitStatus::Stopped(pid, sig) => {
                    let tid = pid.as_raw();
                    let mut signal_to_send = None;

                    if sig == timer::TRACEE_INTERRUPT_SIGNAL_NIX && !group_stop {
                        trace!("[{}] initiate group stop", tid);
                        table.group_stop_non_threads();
                        signal_to_send = Some(Signal::SIGSTOP);
                        group_stop = true;
                        stop_count = 0;
                        latency_start = TimeSpec::now();
                    } else if sig == Signal::SIGSTOP {
                        if !table.contains(tid) {
                            trace!("[{}] new child detected", tid);
                            if let Err(e) = table.add(tid) {
                                break 'outer Err(e);
                            }
                        }
                        if group_stop {
                            stop_count += 1;
                            if stop_count == table.len() {
                                break;
                            } else {
                                continue;
                            }
                        }
                    } else {
                        trace!("[{}] foreign interrupt, signal {}", tid, sig);
                        foreign_interrupts += 1;
                        signal_to_send = Some(sig);
                    }

                    if let Err(e) = ptrace_continue(tid, signal_to_send, &mut table) {
                        break 'outer Err(e);
                    }
                }
                WaitStatus::Signaled(pid, sig, _) => {
                    warn!("[{}] terminated by signal {}", pid, sig);
                    break 'outer Err(SprofError::UnexpectedWaitStatus { tid: pid.as_raw() });
                }
                other => {
                    warn!("unexpected wait status {:?}", other);
                    break 'outer Err(SprofError::UnexpectedWaitStatus { tid: -1 });
                }
            }
        }

        if table.is_empty() {
            break 'outer Ok(());
        }

        // Phase B: take the sample.
        let sample_wall_time = TimeSpec::now();
        pmu.read(&mut pmu_buf);

        let mut i = 0;
        let mut tids = table.tids();
        while i < tids.len() {
            let tid = tids[i];
            match registers::read_pc(tid) {
                Ok(Some(pc)) => {
                    if let Err(e) = table.sample(tid, pc) {
                        break 'outer Err(e);
                    }
                    i += 1;
                }
                Ok(None) => {
                    debug!("[{}] death on ptrace regs", tid);
                    let _ = table.remove(tid);
                    tids.remove(i);
                }
                Err(e) => break 'outer Err(e),
            }
        }

        if let Some(w) = writer.as_mut() {
            let trace = table.snapshot();
            if let Err(e) = w.write_sample(sample_wall_time.to_microseconds(), &pmu_buf, &trace) {
                break 'outer Err(e);
            }
        }

        samples += 1;

        if timer_obj.schedule_next().is_err() {
            break 'outer Err(SprofError::TimerStart(Errno::last()));
        }

        let now = TimeSpec::now();
        total_latency = total_latency + (now - latency_start);

        let tids = table.tids();
        for tid in tids {
            if let Err(e) = ptrace_continue(tid, None, &mut table) {
                break 'outer Err(e);
            }
        }
    };

    let _ = timer_obj.stop();
    let _ = pmu.release();

    if run_result.is_err() {
        // Tracer-protocol / resource errors mid-loop leave the target in an
        // unknown ptrace state; PTRACE_O_EXITKILL backstops this if the
        // detach itself fails (spec.md §5).
        kill_and_detach(target);
    }
    run_result?;

    let total_wall = TimeSpec::now() - sampler_start;

    if process_maps.is_empty() {
        return Err(SprofError::MissingFinalVmmap);
    }

    if let Some(w) = writer {
        w.finalize(
            pmu.kind(),
            pmu_data_size as u32,
            total_wall.to_microseconds(),
            total_latency.to_microseconds(),
            &process_maps,
        )?;
    }

    Ok(RunStats {
        total_wall_us: total_wall.to_microseconds(),
        total_latency_us: total_latency.to_microseconds(),
        samples,
        foreign_interrupts,
        sampling_interval,
        target_frequency: config.frequency,
    })
}

/// Resolves the `PTRACE_CONT` signal (and VMMap capture) for a `SIGTRAP`
/// ptrace-event stop.
fn handle_ptrace_event(
    event: i32,
    tid: i32,
    table: &TaskTable,
    process_maps: &mut VMMaps,
) -> Option<Signal> {
    if event == libc::PTRACE_EVENT_EXIT {
        if table.is_non_thread(tid) {
            trace!("[{}] non-thread tracee exits, record vmmaps", tid);
            process_maps.accumulate(vmmap::collect(tid, 0));
        }
        trace!("[{}] tracee exits", tid);
    } else {
        trace!("[{}] tracee event {}", tid, event);
    }
    None
}

/// `PTRACE_CONT`s `tid` with `signal`, removing it from the table on
/// `ESRCH`. Returns `false` on any other (fatal) error.
fn ptrace_continue(tid: i32, signal: Option<Signal>, table: &mut TaskTable) -> Result<()> {
    match ptrace_cont_retry(Pid::from_raw(tid), signal)? {
        true => Ok(()),
        false => {
            debug!("[{}] death on ptrace cont", tid);
            let _ = table.remove(tid);
            Ok(())
        }
    }
}

/// `PTRACE_CONT`, retrying transient errors. `Ok(false)` means `ESRCH` (the
/// tid is gone); any other error is fatal.
fn ptrace_cont_retry(pid: Pid, signal: Option<Signal>) -> Result<bool> {
    loop {
        match ptrace::cont(pid, signal) {
            Ok(()) => return Ok(true),
            Err(Errno::ESRCH) => return Ok(false),
            Err(Errno::EAGAIN) | Err(Errno::EBUSY) | Err(Errno::EFAULT) | Err(Errno::EINTR) => {
                continue
            }
            Err(e) => return Err(SprofError::PtraceCont {
                tid: pid.as_raw(),
                source: e,
            }),
        }
    }
}

/// `waitpid`, retrying `EAGAIN`/`EINTR`. `target == None` waits on any
/// tracee (`-1`, `__WALL`), matching the steady-state event loop; `Some`
/// is used only for the initial rendezvous.
fn retry_wait(target: Option<Pid>) -> Result<WaitStatus> {
    let pid = target.unwrap_or_else(|| Pid::from_raw(-1));
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(status) => return Ok(status),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => continue,
            Err(e) => {
                return Err(SprofError::Wait {
                    tid: pid.as_raw(),
                    source: e,
                })
            }
        }
    }
}

fn kill_and_detach(target: Pid) {
    let _ = signal::kill(target, Signal::SIGKILL);
    let _ = ptrace::detach(target, None);
}
