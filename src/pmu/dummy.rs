use super::{encode_value, Pmu, PmuKind, PMU_DATA_SIZE};
use crate::error::Result;

/// Always reports 0.0. Used when no PMU is requested, or as a smoke-test
/// backend that never fails to init.
#[derive(Default)]
pub struct DummyPmu;

impl Pmu for DummyPmu {
    fn about(&self) -> &'static str {
        "Dummy PMU, always reports 0.0 as PMU_POWER"
    }

    fn init(&mut self, _pmu_arg: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn read(&mut self, out: &mut [u8]) {
        encode_value(0.0, out);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_zero() {
        let mut pmu = DummyPmu::default();
        pmu.init(None).unwrap();
        let mut buf = [0u8; 8];
        pmu.read(&mut buf);
        assert_eq!(f64::from_le_bytes(buf), 0.0);
    }
}
