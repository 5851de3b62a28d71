use super::{Pmu, PmuKind, PMU_DATA_SIZE};
use crate::error::{Result, SprofError};

/// Lynsyn v3 hardware power probe. The real backend talks to a USB device
/// through `liblynsyn`, which this tree does not vendor; `init` always
/// fails with an explanatory error so enabling the `lynsyn` feature doesn't
/// silently produce zeroed readings.
#[derive(Default)]
pub struct LynsynPmu {
    _selected_sensor: u32,
}

impl Pmu for LynsynPmu {
    fn about(&self) -> &'static str {
        "Lynsyn v3 PMU, measures current in averaging mode"
    }

    fn init(&mut self, _pmu_arg: Option<&str>) -> Result<()> {
        Err(SprofError::PmuInit(
            "the lynsyn backend requires liblynsyn, which is not vendored in this build".into(),
        ))
    }

    fn read(&mut self, out: &mut [u8]) {
        out[..8].copy_from_slice(&0.0f64.to_le_bytes());
    }

    fn data_size(&self) -> u32 {
        PMU_DATA_SIZE
    }

    fn kind(&self) -> PmuKind {
        PmuKind::Power
    }

    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}
