//! Immutable copies of a stopped session and their file artifact.
//!
//! Artifact layout: line 1 is the magic, line 2 a JSON header, then one JSON record per line.
//! Unknown record kinds and unknown fields are skipped so that older readers can open newer
//! artifacts.
use crate::debugger::backend::BackendVariant;
use crate::debugger::error::Error;
use crate::debugger::location::Frame;
use crate::debugger::register::RegisterSet;
use crate::debugger::thread::ThreadId;
use crate::debugger::variable::value::Variable;
use crate::muted_error;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use log::{debug, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fs;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const MAGIC: &str = "MDBG-SNAPSHOT 1";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub format_version: u32,
    pub backend: BackendVariant,
    pub created_at: DateTime<Utc>,
    pub session_id: Uuid,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub current_thread: Option<ThreadId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread: ThreadId,
    pub label: String,
    #[serde(default)]
    pub is_current: bool,
    #[serde(default)]
    pub frames: Vec<Frame>,
    #[serde(default)]
    pub registers: RegisterSet,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub address: u64,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalsRecord {
    pub thread: ThreadId,
    pub frame: u32,
    pub variables: Vec<Variable>,
    /// Children of expanded values, by parent expression.
    #[serde(default)]
    pub expanded: IndexMap<String, Vec<Variable>>,
    /// Watch expression results.
    #[serde(default)]
    pub evaluated: Vec<Variable>,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum Record {
    Thread(ThreadRecord),
    Memory(MemoryRecord),
    Locals(LocalsRecord),
    #[serde(other)]
    Unknown,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::fmt::Write;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        let mut hex = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            let _ = write!(hex, "{b:02x}");
        }
        s.serialize_str(&hex)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let hex = String::deserialize(d)?;
        if hex.len() % 2 != 0 {
            return Err(serde::de::Error::custom("odd hex string length"));
        }
        (0..hex.len())
            .step_by(2)
            .map(|i| {
                hex.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| serde::de::Error::custom("invalid hex digit"))
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub threads: Vec<ThreadRecord>,
    pub memory: Vec<MemoryRecord>,
    pub locals: Vec<LocalsRecord>,
}

impl Snapshot {
    pub fn new(backend: BackendVariant, session_id: Uuid, target: Option<String>) -> Self {
        Self {
            header: SnapshotHeader {
                format_version: FORMAT_VERSION,
                backend,
                created_at: Utc::now(),
                session_id,
                target,
                current_thread: None,
            },
            threads: vec![],
            memory: vec![],
            locals: vec![],
        }
    }

    /// Default artifact name inside `dir`.
    pub fn default_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!(
            "mdbg-{}-{}.snapshot",
            self.header.session_id.simple(),
            self.header.created_at.format("%Y%m%dT%H%M%S")
        ))
    }

    /// Write the artifact. Data goes to a temporary file first, the final path appears atomically.
    /// Nothing is left behind when writing fails.
    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let tmp = path.with_extension("part");
        let written = self
            .write_records(&tmp)
            .and_then(|_| fs::rename(&tmp, path).map_err(Error::from));
        if let Err(e) = written {
            muted_error!(fs::remove_file(&tmp), "remove partial snapshot:");
            return Err(e);
        }
        debug!(target: "snapshot", "snapshot written to {}", path.display());
        Ok(())
    }

    fn write_records(&self, tmp: &Path) -> Result<(), Error> {
        let mut out = BufWriter::new(File::create(tmp)?);
        writeln!(out, "{MAGIC}")?;
        writeln!(out, "{}", serde_json::to_string(&self.header)?)?;
        for t in &self.threads {
            serde_json::to_writer(&mut out, &Record::Thread(t.clone()))?;
            out.write_all(b"\n")?;
        }
        for m in &self.memory {
            serde_json::to_writer(&mut out, &Record::Memory(m.clone()))?;
            out.write_all(b"\n")?;
        }
        for l in &self.locals {
            serde_json::to_writer(&mut out, &Record::Locals(l.clone()))?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    /// Read an artifact. Every failure is reported as [`Error::ArtifactCorrupt`].
    pub fn read(path: &Path) -> Result<Self, Error> {
        let corrupt = |reason: String| Error::ArtifactCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| corrupt(e.to_string()))?;
        let mut lines = BufReader::new(file).lines();

        let magic = lines
            .next()
            .ok_or_else(|| corrupt("empty file".to_string()))?
            .map_err(|e| corrupt(e.to_string()))?;
        if magic.trim_end() != MAGIC {
            return Err(corrupt(format!("bad magic `{magic}`")));
        }

        let header = lines
            .next()
            .ok_or_else(|| corrupt("missing header".to_string()))?
            .map_err(|e| corrupt(e.to_string()))?;
        let header: SnapshotHeader =
            serde_json::from_str(&header).map_err(|e| corrupt(format!("header: {e}")))?;
        if header.format_version > FORMAT_VERSION {
            warn!(
                target: "snapshot",
                "snapshot format version {} is newer than {FORMAT_VERSION}, unknown data is skipped",
                header.format_version
            );
        }

        let mut snapshot = Snapshot {
            header,
            threads: vec![],
            memory: vec![],
            locals: vec![],
        };

        for (n, line) in lines.enumerate() {
            let line = line.map_err(|e| corrupt(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Record = serde_json::from_str(&line)
                .map_err(|e| corrupt(format!("record at line {}: {e}", n + 3)))?;
            match record {
                Record::Thread(t) => snapshot.threads.push(t),
                Record::Memory(m) => snapshot.memory.push(m),
                Record::Locals(l) => snapshot.locals.push(l),
                Record::Unknown => debug!(target: "snapshot", "skip unknown record at line {}", n + 3),
            }
        }

        Ok(snapshot)
    }

    /// Bytes at `[address, address + len)` from captured regions, possibly fewer than `len`.
    pub fn read_memory(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        self.memory.iter().find_map(|region| {
            let end = region.address + region.bytes.len() as u64;
            if address < region.address || address >= end {
                return None;
            }
            let start = (address - region.address) as usize;
            let stop = (start + len).min(region.bytes.len());
            Some(region.bytes[start..stop].to_vec())
        })
    }
}

/// Memory regions recently touched by inspection, bounded in count and size.
pub struct MemoryTracker {
    regions: LruCache<u64, usize>,
    max_region_size: usize,
}

impl MemoryTracker {
    pub fn new(max_regions: usize, max_region_size: usize) -> Self {
        Self {
            regions: LruCache::new(NonZeroUsize::new(max_regions.max(1)).unwrap_or(NonZeroUsize::MIN)),
            max_region_size,
        }
    }

    pub fn record(&mut self, address: u64, len: usize) {
        if len == 0 {
            return;
        }
        let len = len.min(self.max_region_size);
        let known = self.regions.get(&address).copied().unwrap_or(0);
        self.regions.put(address, known.max(len));
    }

    /// Tracked regions ordered by address.
    pub fn regions(&self) -> Vec<(u64, usize)> {
        let mut regions: Vec<_> = self.regions.iter().map(|(a, l)| (*a, *l)).collect();
        regions.sort_unstable();
        regions
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::debugger::location::Location;
    use crate::debugger::variable::value::RawValue;
    use std::env;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::new(
            BackendVariant::Script,
            Uuid::new_v4(),
            Some("prog.mds".to_string()),
        );
        snapshot.header.current_thread = Some(ThreadId(1));
        snapshot.threads.push(ThreadRecord {
            thread: ThreadId(1),
            label: "main".to_string(),
            is_current: true,
            frames: vec![Frame {
                level: 0,
                location: Location::at_line("prog.mds", 3).with_function("main"),
            }],
            registers: [("pc".to_string(), 3), ("sp".to_string(), 1)]
                .into_iter()
                .collect(),
        });
        snapshot.memory.push(MemoryRecord {
            address: 0x10,
            bytes: vec![0xde, 0xad, 0x00, 0x01],
        });
        snapshot.locals.push(LocalsRecord {
            thread: ThreadId(1),
            frame: 0,
            variables: vec![Variable::new("x", "x", "int", RawValue::Int(42))],
            expanded: IndexMap::new(),
            evaluated: vec![],
        });
        snapshot
    }

    fn tmp_path(name: &str) -> PathBuf {
        env::temp_dir().join(format!("mdbg-test-{}-{name}", Uuid::new_v4().simple()))
    }

    #[test]
    fn test_artifact_round_trip() {
        let snapshot = sample();
        let path = tmp_path("round-trip.snapshot");
        snapshot.write(&path).unwrap();

        let data = fs::read_to_string(&path).unwrap();
        assert!(data.starts_with("MDBG-SNAPSHOT 1\n"));
        assert!(data.contains("\"record\":\"memory\""));
        assert!(data.contains("dead0001"));

        let restored = Snapshot::read(&path).unwrap();
        assert_eq!(restored, snapshot);
        assert_eq!(restored.read_memory(0x11, 2), Some(vec![0xad, 0x00]));
        assert_eq!(restored.read_memory(0x12, 10), Some(vec![0x00, 0x01]));
        assert_eq!(restored.read_memory(0x20, 1), None);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_failed_write_leaves_no_partial_file() {
        // a non-empty directory at the target path makes the final rename fail
        let path = tmp_path("occupied.snapshot");
        fs::create_dir_all(path.join("inside")).unwrap();

        let err = sample().write(&path).unwrap_err();
        assert!(matches!(err, Error::IO(_)));
        assert!(!path.with_extension("part").exists());
        assert!(path.is_dir());
        fs::remove_dir_all(path).unwrap();
    }

    #[test]
    fn test_unknown_records_and_fields_skipped() {
        let path = tmp_path("forward.snapshot");
        let header = format!(
            r#"{{"format_version":2,"backend":"gdb","created_at":"2024-01-01T00:00:00Z","session_id":"{}","compression":"none"}}"#,
            Uuid::new_v4()
        );
        let data = format!(
            "{MAGIC}\n{header}\n{}\n{}\n\n",
            r#"{"record":"watchpoints","items":[1,2]}"#,
            r#"{"record":"thread","thread":7,"label":"worker","color":"red"}"#,
        );
        fs::write(&path, data).unwrap();

        let snapshot = Snapshot::read(&path).unwrap();
        assert_eq!(snapshot.header.backend, BackendVariant::Gdb);
        assert_eq!(snapshot.threads.len(), 1);
        assert_eq!(snapshot.threads[0].thread, ThreadId(7));
        assert!(snapshot.threads[0].frames.is_empty());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_corrupt_artifacts() {
        struct TestCase {
            data: &'static str,
            reason: &'static str,
        }

        let cases = vec![
            TestCase { data: "", reason: "empty file" },
            TestCase { data: "GDB-CORE\n{}\n", reason: "bad magic" },
            TestCase { data: "MDBG-SNAPSHOT 1\n", reason: "missing header" },
            TestCase { data: "MDBG-SNAPSHOT 1\n{\"format_version\":1}\n", reason: "header" },
        ];

        for tc in cases {
            let path = tmp_path("corrupt.snapshot");
            fs::write(&path, tc.data).unwrap();
            match Snapshot::read(&path) {
                Err(Error::ArtifactCorrupt { reason, .. }) => {
                    assert!(reason.contains(tc.reason), "{reason}")
                }
                other => panic!("unexpected result: {other:?}"),
            }
            fs::remove_file(path).unwrap();
        }

        let missing = Snapshot::read(Path::new("/nonexistent/dir/a.snapshot"));
        assert!(matches!(missing, Err(Error::ArtifactCorrupt { .. })));
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let snapshot = sample();
        let path = tmp_path("truncated.snapshot");
        snapshot.write(&path).unwrap();
        let mut data = fs::read_to_string(&path).unwrap();
        data.truncate(data.len() - 10);
        fs::write(&path, data).unwrap();
        assert!(matches!(
            Snapshot::read(&path),
            Err(Error::ArtifactCorrupt { .. })
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_memory_tracker_is_bounded() {
        let mut tracker = MemoryTracker::new(2, 16);
        tracker.record(0x100, 8);
        tracker.record(0x200, 64);
        tracker.record(0x100, 4);
        tracker.record(0x300, 1);
        // 0x200 is the least recently used one
        assert_eq!(tracker.regions(), vec![(0x100, 8), (0x300, 1)]);
        tracker.record(0x400, 0);
        assert_eq!(tracker.regions().len(), 2);
    }
}
