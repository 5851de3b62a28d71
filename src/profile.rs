//! Binary profile writer. See spec.md §6 for the exact on-disk layout; this
//! module is "trivial I/O" over a format frozen by that section, matching
//! `pperf.c`'s direct `fwrite` sequence rather than introducing a generic
//! serialization framework for a format that will never gain a second
//! encoding.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

use static_assertions::const_assert_eq;

use crate::error::Result;
use crate::pmu::PmuKind;
use crate::task_table::Task;
use crate::vmmap::{VMMapEntry, VMMaps, LABEL_MAX_LEN};

/// Fixed header size: magic(4) + wall_us(8) + latency_us(8) + samples(8) +
/// pmu_data_size(4) + vmmap_count(4).
pub const HEADER_SIZE: u64 = 4 + 8 + 8 + 8 + 4 + 4;
const_assert_eq!(HEADER_SIZE, 36);

/// The 256-byte fixed label field (255 chars + NUL) per spec.md §3.
const LABEL_FIELD_SIZE: usize = 256;
const_assert_eq!(LABEL_MAX_LEN + 1, LABEL_FIELD_SIZE);

pub struct ProfileWriter {
    file: File,
    sample_count: u64,
}

impl ProfileWriter {
    /// Opens `path` for writing and seeks past the reserved header, matching
    /// `pperf.c`'s `fopen(optarg, "w+")` followed by an `fseek` to the
    /// post-header offset.
    pub fn create(path: &Path) -> Result<ProfileWriter> {
        let mut file = File::create(path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        Ok(ProfileWriter {
            file,
            sample_count: 0,
        })
    }

    /// Appends one sample record: `{ sample_time_us: u64, pmu_data: P bytes,
    /// task_count: u32, tasks: K × { tid: u32, pc: u64, cputime: u64 } }`.
    pub fn write_sample(&mut self, sample_time_us: u64, pmu_data: &[u8], tasks: &[Task]) -> Result<()> {
        self.file.write_all(&sample_time_us.to_le_bytes())?;
        self.file.write_all(pmu_data)?;
        self.file.write_all(&(tasks.len() as u32).to_le_bytes())?;
        for task in tasks {
            self.file.write_all(&task.tid.to_le_bytes())?;
            self.file.write_all(&task.pc.to_le_bytes())?;
            self.file.write_all(&task.cputime.to_le_bytes())?;
        }
        self.sample_count += 1;
        Ok(())
    }

    /// Writes the accumulated VMMap block, then rewinds and writes the
    /// header, matching the order in `pperf.c`'s `exitSampler`: maps first
    /// (while the cursor is already sitting right after the last sample),
    /// header last (which requires seeking back to offset 0).
    pub fn finalize(
        mut self,
        pmu_kind: PmuKind,
        pmu_data_size: u32,
        total_wall_us: u64,
        total_latency_us: u64,
        vmmaps: &VMMaps,
    ) -> Result<()> {
        for entry in &vmmaps.0 {
            write_vmmap_entry(&mut self.file, entry)?;
        }

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&pmu_kind.magic().to_le_bytes())?;
        self.file.write_all(&total_wall_us.to_le_bytes())?;
        self.file.write_all(&total_latency_us.to_le_bytes())?;
        self.file.write_all(&self.sample_count.to_le_bytes())?;
        self.file.write_all(&pmu_data_size.to_le_bytes())?;
        self.file.write_all(&(vmmaps.0.len() as u32).to_le_bytes())?;

        debug_assert_eq!(
            self.file.stream_position().unwrap_or(0),
            HEADER_SIZE,
            "header write must land exactly at the reserved header size"
        );
        Ok(())
    }
}

fn write_vmmap_entry(file: &mut File, entry: &VMMapEntry) -> io::Result<()> {
    file.write_all(&entry.addr.to_le_bytes())?;
    file.write_all(&entry.size.to_le_bytes())?;
    let mut label = [0u8; LABEL_FIELD_SIZE];
    let bytes = entry.label.as_bytes();
    let n = bytes.len().min(LABEL_MAX_LEN);
    label[..n].copy_from_slice(&bytes[..n]);
    file.write_all(&label)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn header_lands_at_reserved_size_with_no_samples() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("sprof-test-{}.bin", std::process::id()));
        let writer = ProfileWriter::create(&path).unwrap();
        let vmmaps = VMMaps(vec![VMMapEntry {
            addr: 0x1000,
            size: 0x2000,
            label: "cat".into(),
        }]);
        writer
            .finalize(PmuKind::Power, 8, 1_000_000, 10_000, &vmmaps)
            .unwrap();

        let mut buf = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut buf).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(
            buf.len() as u64,
            HEADER_SIZE + (8 + 8 + 256)
        );
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), PmuKind::Power.magic());
        assert_eq!(u64::from_le_bytes(buf[20..28].try_into().unwrap()), 0);
        assert_eq!(u32::from_le_bytes(buf[32..36].try_into().unwrap()), 1);
    }
}
