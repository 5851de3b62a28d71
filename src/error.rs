//! Error taxonomy for the sampler, mirroring spec.md's five buckets:
//! setup, tracer-protocol, transient (retried inline, never surfaced here),
//! task-vanished (absorbed by the event loop, never surfaced here), and
//! resource errors. Only errors that abort a run reach this enum.

use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

#[derive(thiserror::Error, Debug)]
pub enum SprofError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("failed to open output file {path:?}: {source}")]
    OutputOpen { path: PathBuf, source: io::Error },

    #[error("PMU init failed: {0}")]
    PmuInit(String),

    #[error("could not fork: {0}")]
    Fork(Errno),

    #[error("ptrace(TRACEME) failed: {0}")]
    TraceMe(Errno),

    #[error("exec of target command failed: {0}")]
    Exec(Errno),

    #[error("target process terminated before the initial ptrace stop")]
    TargetNeverStarted,

    #[error("unexpected pid {got} stopped, expected root tid {expected}")]
    UnexpectedRendezvousPid { expected: i32, got: i32 },

    #[error("could not set ptrace options: {0}")]
    SetOptions(Errno),

    #[error("could not read initial vmmap of pid {0}; process may not be readable")]
    InitialVmmapUnreadable(i32),

    #[error("task {tid} not found in the task table")]
    UnknownTask { tid: i32 },

    #[error("could not open schedstat for tid {tid}")]
    SchedstatOpen { tid: i32 },

    #[error("could not read cputime from schedstat of tid {tid}")]
    SchedstatRead { tid: i32 },

    #[error("unexpected wait status for tid {tid}: neither exited nor stopped")]
    UnexpectedWaitStatus { tid: i32 },

    #[error("ptrace register read failed for tid {tid}: {source}")]
    RegisterRead { tid: i32, source: Errno },

    #[error("waitpid(tid={tid}) failed: {source}")]
    Wait { tid: i32, source: Errno },

    #[error("ptrace(PTRACE_CONT, tid={tid}) failed: {source}")]
    PtraceCont { tid: i32, source: Errno },

    #[error("could not start sampling timer: {0}")]
    TimerStart(Errno),

    #[error("could not stop sampling timer: {0}")]
    TimerStop(Errno),

    #[error("sampler exited without ever capturing the target's vmmap")]
    MissingFinalVmmap,

    #[error("could not set scheduler class: {0}")]
    SchedSetScheduler(Errno),

    #[error("could not set cpu affinity: {0}")]
    SchedSetAffinity(Errno),

    #[error("no online CPUs detected for --core-isolation")]
    NoOnlineCpus,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SprofError>;

/// Exit codes per spec.md §6.
impl SprofError {
    pub fn exit_code(&self) -> i32 {
        match self {
            SprofError::TargetNeverStarted | SprofError::UnexpectedRendezvousPid { .. } => 2,
            _ => 1,
        }
    }
}
