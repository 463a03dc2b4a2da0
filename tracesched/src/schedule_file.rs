/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! On-disk schedule streams.
//!
//! Recorded schedules are archive-structured: a directory with one flat
//! binary component per output, named `output.NNNN`.  The as-traced per-cpu
//! schedule uses one component per cpu.  Compressed-archive backends are out
//! of scope; the directory layout keeps components independently readable
//! for parallel incremental reads.

use std::fs::File;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use tracesched_model::schedule::component_name;
use tracesched_model::CpuScheduleEntry;
use tracesched_model::ScheduleSegment;
use tracesched_model::SegmentKind;

use crate::error::Result;
use crate::error::SchedulerError;

// Recorded schedule (per-output segments):
// =============================================================================

/// Writes one component per output into a schedule archive directory.
#[derive(Debug)]
pub struct ScheduleWriter {
    dir: PathBuf,
    cur: Option<File>,
}

impl ScheduleWriter {
    /// Create (or reuse) the archive directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            SchedulerError::FileOpen(format!(
                "failed to create schedule archive {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(ScheduleWriter { dir, cur: None })
    }

    /// Start a new component; subsequent writes go to it.
    pub fn open_new_component(&mut self, name: &str) -> Result<()> {
        let path = self.dir.join(name);
        let file = File::create(&path).map_err(|e| {
            SchedulerError::FileWrite(format!(
                "failed to open component {}: {}",
                path.display(),
                e
            ))
        })?;
        self.cur = Some(file);
        Ok(())
    }

    /// Append one segment to the current component.
    pub fn write_segment(&mut self, segment: &ScheduleSegment) -> Result<()> {
        let file = self.cur.as_mut().ok_or_else(|| {
            SchedulerError::FileWrite("no schedule component is open".to_string())
        })?;
        file.write_all(&segment.encode())
            .map_err(|e| SchedulerError::FileWrite(format!("failed to write segment: {}", e)))
    }
}

/// Reads components of a recorded schedule archive.
#[derive(Debug)]
pub struct ScheduleReader {
    dir: PathBuf,
}

impl ScheduleReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        ScheduleReader { dir: dir.into() }
    }

    /// Whether the named component exists.
    pub fn has_component(&self, name: &str) -> bool {
        self.dir.join(name).is_file()
    }

    /// Read every segment of one component, including version and footer.
    pub fn read_component(&self, name: &str) -> Result<Vec<ScheduleSegment>> {
        let path = self.dir.join(name);
        let mut file = File::open(&path).map_err(|e| {
            SchedulerError::FileOpen(format!(
                "failed to open component {}: {}",
                path.display(),
                e
            ))
        })?;
        read_segments(&mut file, &path)
    }
}

fn read_segments(file: &mut File, path: &Path) -> Result<Vec<ScheduleSegment>> {
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|e| SchedulerError::FileRead(format!("failed to read {}: {}", path.display(), e)))?;
    if bytes.len() % ScheduleSegment::ENCODED_LEN != 0 {
        return Err(SchedulerError::FileRead(format!(
            "truncated schedule component {}",
            path.display()
        )));
    }
    let mut segments = Vec::with_capacity(bytes.len() / ScheduleSegment::ENCODED_LEN);
    for chunk in bytes.chunks_exact(ScheduleSegment::ENCODED_LEN) {
        let buf: &[u8; ScheduleSegment::ENCODED_LEN] = chunk.try_into().unwrap();
        let segment = ScheduleSegment::decode(buf).ok_or_else(|| {
            SchedulerError::FileRead(format!(
                "unknown segment type in {}",
                path.display()
            ))
        })?;
        segments.push(segment);
    }
    Ok(segments)
}

/// Scan a recorded schedule archive for corruption that balloons file size:
/// consecutive idle records are never legal, the writer merges them.
pub fn check_schedule_file(dir: &Path) -> Result<()> {
    let reader = ScheduleReader::new(dir);
    let mut output = 0;
    while reader.has_component(&component_name(output)) {
        let segments = reader.read_component(&component_name(output))?;
        let mut prev_was_idle = false;
        for segment in &segments {
            if segment.kind == SegmentKind::Idle {
                if prev_was_idle {
                    return Err(SchedulerError::Invalid(format!(
                        "consecutive idle records in {}",
                        component_name(output)
                    )));
                }
                prev_was_idle = true;
            } else {
                prev_was_idle = false;
            }
        }
        output += 1;
    }
    if output == 0 {
        return Err(SchedulerError::FileOpen(format!(
            "no schedule components under {}",
            dir.display()
        )));
    }
    Ok(())
}

// As-traced cpu schedule:
// =============================================================================

/// The as-traced schedule: the entries of every per-cpu component,
/// concatenated in component order.  Entries of one cpu are contiguous, which
/// is how component boundaries are recovered.
#[derive(Debug, Clone)]
pub struct CpuScheduleSource {
    entries: Vec<CpuScheduleEntry>,
}

impl CpuScheduleSource {
    /// Wrap already-decoded entries (synthetic traces, tests).
    pub fn from_entries(entries: Vec<CpuScheduleEntry>) -> Self {
        CpuScheduleSource { entries }
    }

    /// Read every component of an as-traced schedule archive directory, in
    /// sorted component order.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| {
                SchedulerError::FileOpen(format!(
                    "failed to open as-traced schedule {}: {}",
                    dir.display(),
                    e
                ))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        let mut entries = Vec::new();
        for path in paths {
            let mut bytes = Vec::new();
            File::open(&path)
                .and_then(|mut f| f.read_to_end(&mut bytes))
                .map_err(|e| {
                    SchedulerError::FileRead(format!(
                        "failed to read {}: {}",
                        path.display(),
                        e
                    ))
                })?;
            if bytes.len() % CpuScheduleEntry::ENCODED_LEN != 0 {
                return Err(SchedulerError::FileRead(format!(
                    "truncated cpu schedule component {}",
                    path.display()
                )));
            }
            for chunk in bytes.chunks_exact(CpuScheduleEntry::ENCODED_LEN) {
                let buf: &[u8; CpuScheduleEntry::ENCODED_LEN] = chunk.try_into().unwrap();
                entries.push(CpuScheduleEntry::decode(buf));
            }
        }
        Ok(CpuScheduleSource { entries })
    }

    pub fn entries(&self) -> &[CpuScheduleEntry] {
        &self.entries
    }
}

/// Writes an as-traced schedule archive, one component per cpu.
#[derive(Debug)]
pub struct CpuScheduleWriter {
    dir: PathBuf,
}

impl CpuScheduleWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| {
            SchedulerError::FileOpen(format!(
                "failed to create cpu schedule archive {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(CpuScheduleWriter { dir })
    }

    /// Write one cpu's entries as one component.
    pub fn write_cpu(&self, cpu: u64, entries: &[CpuScheduleEntry]) -> Result<()> {
        let path = self.dir.join(format!("cpu.{:04}", cpu));
        let mut file = File::create(&path).map_err(|e| {
            SchedulerError::FileWrite(format!(
                "failed to open component {}: {}",
                path.display(),
                e
            ))
        })?;
        for entry in entries {
            debug_assert_eq!(entry.cpu, cpu);
            file.write_all(&entry.encode()).map_err(|e| {
                SchedulerError::FileWrite(format!("failed to write entry: {}", e))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracesched_model::Tid;

    use super::*;

    fn idle(duration: u64) -> ScheduleSegment {
        ScheduleSegment {
            kind: SegmentKind::Idle,
            input: 0,
            start_instruction: duration,
            stop_instruction: 0,
            timestamp: 0,
        }
    }

    fn default_segment(input: i32, start: u64, stop: u64) -> ScheduleSegment {
        ScheduleSegment {
            kind: SegmentKind::Default,
            input,
            start_instruction: start,
            stop_instruction: stop,
            timestamp: 7,
        }
    }

    #[test]
    fn write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ScheduleWriter::new(dir.path()).unwrap();
        let segments = vec![
            ScheduleSegment::version(1, 0),
            default_segment(0, 0, 4),
            idle(50),
            default_segment(1, 0, 2),
            ScheduleSegment::footer(9),
        ];
        writer.open_new_component(&component_name(0)).unwrap();
        for segment in &segments {
            writer.write_segment(segment).unwrap();
        }
        let reader = ScheduleReader::new(dir.path());
        assert_eq!(reader.read_component(&component_name(0)).unwrap(), segments);
        assert!(!reader.has_component(&component_name(1)));
    }

    #[test]
    fn checker_flags_consecutive_idles() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ScheduleWriter::new(dir.path()).unwrap();
        writer.open_new_component(&component_name(0)).unwrap();
        for segment in [
            ScheduleSegment::version(1, 0),
            idle(10),
            idle(20),
            ScheduleSegment::footer(0),
        ] {
            writer.write_segment(&segment).unwrap();
        }
        let err = check_schedule_file(dir.path()).unwrap_err();
        assert!(matches!(err, SchedulerError::Invalid(_)));
    }

    #[test]
    fn checker_accepts_interleaved_idles() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ScheduleWriter::new(dir.path()).unwrap();
        writer.open_new_component(&component_name(0)).unwrap();
        for segment in [
            ScheduleSegment::version(1, 0),
            idle(10),
            default_segment(0, 0, 4),
            idle(20),
            ScheduleSegment::footer(0),
        ] {
            writer.write_segment(&segment).unwrap();
        }
        check_schedule_file(dir.path()).unwrap();
    }

    #[test]
    fn truncated_component_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(component_name(0)), [0u8; 10]).unwrap();
        let reader = ScheduleReader::new(dir.path());
        let err = reader.read_component(&component_name(0)).unwrap_err();
        assert!(matches!(err, SchedulerError::FileRead(_)));
    }

    #[test]
    fn cpu_schedule_round_trip_concatenates_components() {
        let dir = tempfile::tempdir().unwrap();
        let writer = CpuScheduleWriter::new(dir.path()).unwrap();
        let cpu2: Vec<CpuScheduleEntry> = (0..3)
            .map(|i| CpuScheduleEntry {
                thread: Tid::from_raw(100),
                timestamp: 1000 + i,
                cpu: 2,
                start_instruction: i * 10,
            })
            .collect();
        let cpu7 = vec![CpuScheduleEntry {
            thread: Tid::from_raw(200),
            timestamp: 1500,
            cpu: 7,
            start_instruction: 0,
        }];
        writer.write_cpu(2, &cpu2).unwrap();
        writer.write_cpu(7, &cpu7).unwrap();
        let source = CpuScheduleSource::open(dir.path()).unwrap();
        let mut expected = cpu2;
        expected.extend(cpu7);
        assert_eq!(source.entries(), &expected[..]);
    }
}
