//! Command-line surface. See spec.md §6; out of the sampling engine's scope
//! per §1, but needed for a runnable binary.

use std::path::PathBuf;

use structopt::StructOpt;

use crate::error::{Result, SprofError};
use crate::sysconf::SchedClass;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "sprof",
    about = "Intrusive statistical profiler for Linux processes built on ptrace"
)]
pub struct Args {
    /// Write the binary profile to this file.
    #[structopt(short, long)]
    pub output: Option<PathBuf>,

    /// Back-end to read power/energy/current samples from.
    #[structopt(long = "pmu", default_value = "dummy")]
    pub pmu: String,

    /// Argument passed through to the selected PMU back-end (e.g. a
    /// comma-separated list of `intel-rapl:<n>` ids for `--pmu rapl`).
    #[structopt(short, long = "pmu-arg")]
    pub pmu_arg: Option<String>,

    /// Sampling frequency in Hz. 0 disables the timer; the sampler then
    /// blocks until the target exits with zero samples taken.
    #[structopt(short, long, default_value = "1000")]
    pub frequency: f64,

    /// Randomize the phase of the first sample uniformly in
    /// `[0, 1/frequency)` instead of sampling immediately.
    #[structopt(short, long)]
    pub randomize: bool,

    /// Pin the sampler to the last online CPU and the target to every
    /// other online CPU.
    #[structopt(long = "core-isolation")]
    pub core_isolation: bool,

    /// Run under SCHED_FIFO at this priority (1..=99). Wins over --rr if
    /// both are given.
    #[structopt(long)]
    pub fifo: Option<i32>,

    /// Run under SCHED_RR at this priority (1..=99).
    #[structopt(long)]
    pub rr: Option<i32>,

    /// Print end-of-run statistics (ideal vs. actual time, interrupts,
    /// samples, latency, frequency).
    #[structopt(short, long)]
    pub verbose: bool,

    /// The command to launch and sample, and its arguments, after `--`.
    #[structopt(last = true, required = true)]
    pub command: Vec<String>,
}

impl Args {
    pub fn parse() -> Result<Args> {
        let args = Args::from_args();
        args.validate()?;
        Ok(args)
    }

    fn validate(&self) -> Result<()> {
        if self.frequency < 0.0 {
            return Err(SprofError::InvalidArgument(format!(
                "frequency must be >= 0, got {}",
                self.frequency
            )));
        }
        for (flag, value) in [("--fifo", self.fifo), ("--rr", self.rr)] {
            if let Some(p) = value {
                if !(1..=99).contains(&p) {
                    return Err(SprofError::InvalidArgument(format!(
                        "{} priority must be in 1..=99, got {}",
                        flag, p
                    )));
                }
            }
        }
        if self.command.is_empty() {
            return Err(SprofError::InvalidArgument(
                "no command specified after --".into(),
            ));
        }
        Ok(())
    }

    /// The scheduling class and priority to apply, resolving the
    /// fifo-wins-over-rr tie-break from spec.md §6.
    pub fn sched_class(&self) -> Option<(SchedClass, i32)> {
        if let Some(p) = self.fifo {
            Some((SchedClass::Fifo, p))
        } else {
            self.rr.map(|p| (SchedClass::RoundRobin, p))
        }
    }
}
