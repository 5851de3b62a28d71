//! The single source of truth for which tids are currently traced, mirroring
//! `pperf.c`'s `taskList`/`addTask`/`removeTask`/`groupStopNonThreadTasks`.
//! See spec.md §4.4.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{Result, SprofError};

/// The per-sample record eventually copied verbatim into the profile. Kept
/// packed-field-order identical to the on-disk `struct task`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Task {
    pub tid: u32,
    pub pc: u64,
    pub cputime: u64,
}

/// One tracked tid plus the bookkeeping needed to read its CPU time and to
/// know whether it must be group-stopped explicitly (a separate process
/// sharing the traced thread-group's address space, e.g. via `clone(CLONE_VM)`
/// without `CLONE_THREAD`) rather than relying on the kernel's own
/// thread-group stop semantics.
struct TrackedEntry {
    trace: Task,
    is_thread: bool,
    schedstat: File,
}

/// Single array-of-struct task table. The original keeps `trace` and `tasks`
/// as two parallel arrays kept in lockstep by hand; we fold them into one
/// `Vec` so there is no index to desynchronize, and project out just the
/// `Task` triples when writing a sample (see `profile` module).
pub struct TaskTable {
    root: i32,
    entries: Vec<TrackedEntry>,
}

impl TaskTable {
    pub fn new(root: i32) -> TaskTable {
        TaskTable {
            root,
            entries: Vec::new(),
        }
    }

    pub fn root(&self) -> i32 {
        self.root
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tid: i32) -> bool {
        self.entries.iter().any(|e| e.trace.tid == tid as u32)
    }

    /// Adds `tid` to the table. Prefers `/proc/<root>/task/<tid>/schedstat`
    /// (true thread of the root thread-group); falls back to
    /// `/proc/<tid>/task/<tid>/schedstat` and marks the entry as a non-thread
    /// tracee, exactly as `addTask` does.
    pub fn add(&mut self, tid: i32) -> Result<()> {
        let primary = format!("/proc/{}/task/{}/schedstat", self.root, tid);
        if let Ok(f) = File::open(&primary) {
            self.entries.push(TrackedEntry {
                trace: Task {
                    tid: tid as u32,
                    pc: 0,
                    cputime: 0,
                },
                is_thread: self.root != tid,
                schedstat: f,
            });
            return Ok(());
        }

        let fallback = format!("/proc/{}/task/{}/schedstat", tid, tid);
        let f = File::open(&fallback).map_err(|_| SprofError::SchedstatOpen { tid })?;
        self.entries.push(TrackedEntry {
            trace: Task {
                tid: tid as u32,
                pc: 0,
                cputime: 0,
            },
            is_thread: false,
            schedstat: f,
        });
        Ok(())
    }

    /// Removes the entry for `tid`, returning an error if it isn't present.
    /// Order among remaining entries is not preserved (swap-remove), which
    /// spec.md §9 explicitly permits in place of the original's
    /// shift-left-preserving-order removal.
    pub fn remove(&mut self, tid: i32) -> Result<()> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.trace.tid == tid as u32)
            .ok_or(SprofError::UnknownTask { tid })?;
        self.entries.swap_remove(idx);
        Ok(())
    }

    pub fn is_non_thread(&self, tid: i32) -> bool {
        self.entries
            .iter()
            .find(|e| e.trace.tid == tid as u32)
            .map(|e| !e.is_thread)
            .unwrap_or(false)
    }

    /// Sends `SIGSTOP` to every tracked tid that is not a thread of the root
    /// thread-group. A true sibling thread stops automatically once any
    /// thread in its group is ptrace-stopped; a separate process sharing
    /// memory does not, so it needs an explicit signal.
    pub fn group_stop_non_threads(&self) {
        for entry in &self.entries {
            if !entry.is_thread {
                let _ = signal::kill(Pid::from_raw(entry.trace.tid as i32), Signal::SIGSTOP);
            }
        }
    }

    /// Records `pc` and re-reads cumulative CPU time (first field of
    /// `schedstat`) for `tid` in one step, exactly as `pperf.c`'s per-task
    /// sampling loop does right after `PTRACE_GETREGSET`. A failed schedstat
    /// read is a resource error (spec.md §7): the sample would otherwise be
    /// silently incomplete.
    pub fn sample(&mut self, tid: i32, pc: u64) -> Result<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.trace.tid == tid as u32)
            .ok_or(SprofError::UnknownTask { tid })?;
        entry.trace.pc = pc;
        entry.trace.cputime = read_cputime(&mut entry.schedstat).ok_or(SprofError::SchedstatRead { tid })?;
        Ok(())
    }

    /// tids currently tracked, in table order. Snapshotting before a loop
    /// that may remove entries avoids mutating the table while iterating it.
    pub fn tids(&self) -> Vec<i32> {
        self.entries.iter().map(|e| e.trace.tid as i32).collect()
    }

    /// Snapshot of the current `Task` triples, in table order, ready to be
    /// appended to a sample record.
    pub fn snapshot(&self) -> Vec<Task> {
        self.entries.iter().map(|e| e.trace).collect()
    }
}

fn read_cputime(f: &mut File) -> Option<u64> {
    f.seek(SeekFrom::Start(0)).ok()?;
    let mut buf = String::new();
    f.read_to_string(&mut buf).ok()?;
    buf.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_unknown_tid_errors() {
        let mut table = TaskTable::new(1);
        assert!(table.remove(999).is_err());
    }

    #[test]
    fn is_non_thread_false_when_absent() {
        let table = TaskTable::new(1);
        assert!(!table.is_non_thread(42));
    }
}
