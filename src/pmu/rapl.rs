use std::fs;
use std::path::PathBuf;

use super::{encode_value, Pmu, PmuKind, PMU_DATA_SIZE};
use crate::error::{Result, SprofError};
use crate::time::TimeSpec;

const RAPL_BASE: &str = "/sys/class/powercap/intel-rapl:";

struct Endpoint {
    energy_path: PathBuf,
    max_energy_uj: u64,
    last_energy_uj: u64,
    last_time_us: u64,
}

/// Reads one or more `intel-rapl:<n>` sysfs energy counters and reports
/// average Watts consumed since the previous read, handling counter
/// wraparound against each endpoint's `max_energy_range_uj`.
#[derive(Default)]
pub struct RaplPmu {
    endpoints: Vec<Endpoint>,
}

impl Pmu for RaplPmu {
    fn about(&self) -> &'static str {
        "RAPL SysFS PMU, reads energy values from sysfs"
    }

    fn init(&mut self, pmu_arg: Option<&str>) -> Result<()> {
        let arg = pmu_arg.ok_or_else(|| {
            SprofError::PmuInit("rapl backend requires --pmu-arg=<id>[,<id>...]".into())
        })?;

        for id in arg.split(',').filter(|s| !s.is_empty()) {
            let max_path = PathBuf::from(format!("{}{}/max_energy_range_uj", RAPL_BASE, id));
            let energy_path = PathBuf::from(format!("{}{}/energy_uj", RAPL_BASE, id));

            let max_energy_uj = read_u64(&max_path)?;
            let last_energy_uj = read_u64(&energy_path)?;

            self.endpoints.push(Endpoint {
                energy_path,
                max_energy_uj,
                last_energy_uj,
                last_time_us: 0,
            });
        }

        if self.endpoints.is_empty() {
            return Err(SprofError::PmuInit(
                "rapl backend given an empty --pmu-arg".into(),
            ));
        }

        // Prime last_time_us/last_energy_uj so the first real read reports
        // a sane rate rather than dividing by a zero baseline time.
        let mut discard = [0u8; 8];
        self.read(&mut discard);
        Ok(())
    }

    fn read(&mut self, out: &mut [u8]) {
        let now_us = TimeSpec::now().to_microseconds();
        let mut total = 0.0;
        for ep in &mut self.endpoints {
            let energy = match read_u64(&ep.energy_path) {
                Ok(e) => e,
                Err(_) => continue,
            };

            let diff = if energy < ep.last_energy_uj {
                (ep.max_energy_uj - ep.last_energy_uj) + energy
            } else {
                energy - ep.last_energy_uj
            };

            let dt_us = now_us.saturating_sub(ep.last_time_us);
            if dt_us > 0 {
                total += diff as f64 / dt_us as f64;
            }

            ep.last_energy_uj = energy;
            ep.last_time_us = now_us;
        }
        encode_value(total, out);
    }

    fn data_size(&self) -> u32 {
        PMU_DATA_SIZE
    }

    fn kind(&self) -> PmuKind {
        PmuKind::Power
    }

    fn release(&mut self) -> Result<()> {
        self.endpoints.clear();
        Ok(())
    }
}

fn read_u64(path: &std::path::Path) -> Result<u64> {
    let s = fs::read_to_string(path).map_err(|_| {
        SprofError::PmuInit(format!("rapl endpoint {:?} not found or unreadable", path))
    })?;
    s.trim()
        .parse()
        .map_err(|_| SprofError::PmuInit(format!("rapl endpoint {:?} had unparseable contents", path)))
}
