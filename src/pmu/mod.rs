//! Pluggable power-measurement-unit backends. See spec.md §4.3.
//!
//! The active backend's [`PmuKind`] becomes the profile header's magic
//! number, so a consumer of the trace file can tell which physical quantity
//! the per-sample PMU bytes represent without out-of-band metadata.

mod dummy;
mod rapl;

#[cfg(feature = "lynsyn")]
mod lynsyn;

pub use dummy::DummyPmu;
pub use rapl::RaplPmu;

#[cfg(feature = "lynsyn")]
pub use lynsyn::LynsynPmu;

use crate::error::{Result, SprofError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PmuKind {
    Custom = 0,
    Current = 1,
    Voltage = 2,
    Power = 3,
}

impl PmuKind {
    pub fn magic(self) -> u32 {
        self as u32
    }
}

/// A power/energy/current measurement back-end sampled once per profiling
/// interrupt. Implementations must be cheap and async-signal-adjacent only
/// in the sense that `read` runs on the tracer thread right after a group
/// stop — not in the timer's signal handler itself.
pub trait Pmu {
    /// One-line description of the backend and what it measures, printed
    /// under `--verbose` once the backend has been selected and `init`ed
    /// (matching `pperf.c`'s `pmuAbout()` in its `-h`/`--help` text).
    fn about(&self) -> &'static str;

    /// Parses `pmu_arg` (the `--pmu-arg` CLI value) and opens whatever
    /// files/handles the backend needs. Called once before sampling starts.
    fn init(&mut self, pmu_arg: Option<&str>) -> Result<()>;

    /// Reads the current value and serializes it into `out`, which is
    /// exactly `data_size()` bytes long.
    fn read(&mut self, out: &mut [u8]);

    /// Size in bytes of the `read` payload, recorded once in the profile
    /// header so the reader can skip over the per-sample PMU blob.
    fn data_size(&self) -> u32;

    fn kind(&self) -> PmuKind;

    /// Releases any resources opened by `init`. Called once after sampling
    /// stops, even on the error path.
    fn release(&mut self) -> Result<()>;
}

/// Fixed PMU payload shape used by every backend in this tree: one packed
/// `f64`, matching the original `struct PMUData { double value; }`.
pub const PMU_DATA_SIZE: u32 = std::mem::size_of::<f64>() as u32;

fn encode_value(value: f64, out: &mut [u8]) {
    out[..8].copy_from_slice(&value.to_le_bytes());
}

/// Builds the backend named by `--pmu` (`dummy`, `rapl`, or `lynsyn` when the
/// `lynsyn` feature is enabled).
pub fn build(name: &str) -> Result<Box<dyn Pmu>> {
    match name {
        "dummy" => Ok(Box::new(DummyPmu::default())),
        "rapl" => Ok(Box::new(RaplPmu::default())),
        #[cfg(feature = "lynsyn")]
        "lynsyn" => Ok(Box::new(LynsynPmu::default())),
        #[cfg(not(feature = "lynsyn"))]
        "lynsyn" => Err(SprofError::PmuInit(
            "this build was compiled without the `lynsyn` feature".into(),
        )),
        other => Err(SprofError::PmuInit(format!("unknown PMU backend {:?}", other))),
    }
}
