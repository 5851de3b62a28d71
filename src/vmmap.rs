//! Parses `/proc/<pid>/maps` into the set of executable, non-pseudo
//! mappings the profile writer appends to each run. See spec.md §4.2.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Maximum label length the on-disk format can carry (255 chars + NUL),
/// matching `VMMAP_LABEL_LENGTH` in the original `vmmap.h`.
pub const LABEL_MAX_LEN: usize = 255;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VMMapEntry {
    pub addr: u64,
    pub size: u64,
    pub label: String,
}

impl VMMapEntry {
    fn key(&self) -> (u64, u64, &str) {
        (self.addr, self.size, self.label.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VMMaps(pub Vec<VMMapEntry>);

impl VMMaps {
    pub fn new() -> VMMaps {
        VMMaps(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn contains(&self, entry: &VMMapEntry) -> bool {
        self.0.iter().any(|e| e.key() == entry.key())
    }

    /// Appends `other`'s entries to `self`, deduplicating by exact
    /// `(addr, size, label)` triple, as required for the accumulated
    /// `processMaps` collected across multiple `PTRACE_EVENT_EXIT`s.
    pub fn accumulate(&mut self, other: VMMaps) {
        for entry in other.0 {
            if !self.contains(&entry) {
                self.0.push(entry);
            }
        }
    }
}

/// Reads `/proc/<pid>/maps` and returns the accepted entries. `limit == 0`
/// means unlimited; otherwise collection stops after `limit` entries.
///
/// A line is accepted when it matches
/// `<saddr>-<eaddr> <r><w>x<p> <offset> <dev> <inode> <path>` (executable
/// bit set) and the path's basename is not `[...]`-bracketed (excludes
/// `[stack]`, `[heap]`, `[vdso]`, etc). Unparseable lines are discarded.
pub fn collect(pid: i32, limit: usize) -> VMMaps {
    let path = format!("/proc/{}/maps", pid);
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(_) => return VMMaps::new(),
    };

    let mut result = VMMaps::new();
    for line in BufReader::new(file).lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        if let Some(entry) = parse_line(&line) {
            if !result.contains(&entry) {
                result.0.push(entry);
                if limit != 0 && result.0.len() >= limit {
                    break;
                }
            }
        }
    }
    result
}

fn parse_line(line: &str) -> Option<VMMapEntry> {
    // "00400000-0040b000 r-xp 00000000 08:01 123456 /bin/cat"
    let mut it = line.splitn(6, ' ').filter(|s| !s.is_empty());
    let range = it.next()?;
    let perms = it.next()?;
    let _offset = it.next()?;
    let _dev = it.next()?;
    let _inode = it.next()?;
    let rest = it.next().unwrap_or("").trim();

    if perms.len() < 3 || perms.as_bytes()[2] != b'x' {
        return None;
    }
    if rest.is_empty() {
        return None;
    }

    let (saddr_s, eaddr_s) = range.split_once('-')?;
    let saddr = u64::from_str_radix(saddr_s, 16).ok()?;
    let eaddr = u64::from_str_radix(eaddr_s, 16).ok()?;
    if eaddr < saddr {
        return None;
    }

    let label = Path::new(rest)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| rest.to_string());
    if label.starts_with('[') && label.ends_with(']') {
        return None;
    }

    let mut label = label;
    label.truncate(LABEL_MAX_LEN);

    Some(VMMapEntry {
        addr: saddr,
        size: eaddr - saddr,
        label,
    })
}

/// True if any half-open interval `[addr, addr+size)` in `m1` overlaps any
/// in `m2`.
pub fn collision(m1: &VMMaps, m2: &VMMaps) -> bool {
    for a in &m1.0 {
        let a_start = a.addr;
        let a_end = a.addr + a.size;
        for b in &m2.0 {
            let b_start = b.addr;
            let b_end = b.addr + b.size;
            if a_start < b_end && b_start < a_end {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn accepts_executable_mapping_with_path() {
        let line = "00400000-0040b000 r-xp 00000000 08:01 123456 /bin/cat";
        let entry = parse_line(line).unwrap();
        assert_eq!(entry.addr, 0x0040_0000);
        assert_eq!(entry.size, 0xb000);
        assert_eq!(entry.label, "cat");
    }

    #[test]
    fn rejects_non_executable_mapping() {
        let line = "00400000-0040b000 r--p 00000000 08:01 123456 /bin/cat";
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn rejects_bracketed_pseudo_mapping() {
        let line = "7ffd00000000-7ffd00001000 r-xp 00000000 00:00 0 [vdso]";
        assert!(parse_line(line).is_none());
    }

    #[test]
    fn discards_unparseable_line() {
        assert!(parse_line("garbage line with no structure").is_none());
    }

    #[test]
    fn accumulate_dedupes_exact_triples() {
        let mut acc = VMMaps::new();
        let e = VMMapEntry {
            addr: 1,
            size: 2,
            label: "a".into(),
        };
        acc.accumulate(VMMaps(vec![e.clone()]));
        acc.accumulate(VMMaps(vec![e.clone()]));
        assert_eq!(acc.len(), 1);
    }

    #[test]
    fn collision_detects_overlap() {
        let m1 = VMMaps(vec![VMMapEntry {
            addr: 100,
            size: 50,
            label: "x".into(),
        }]);
        let m2 = VMMaps(vec![VMMapEntry {
            addr: 140,
            size: 10,
            label: "y".into(),
        }]);
        assert!(collision(&m1, &m2));
        assert!(collision(&m2, &m1));
    }

    #[test]
    fn collision_false_for_disjoint_ranges() {
        let m1 = VMMaps(vec![VMMapEntry {
            addr: 0,
            size: 10,
            label: "x".into(),
        }]);
        let m2 = VMMaps(vec![VMMapEntry {
            addr: 10,
            size: 10,
            label: "y".into(),
        }]);
        assert!(!collision(&m1, &m2));
    }
}
