/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Workload descriptions and trace-directory discovery.
//!
//! A workload is either a path (a single trace file or a directory of them)
//! or an explicit list of already-opened readers.  Directory discovery lists
//! and sorts the regular files, skipping the reserved auxiliary filenames, so
//! shard ordinals are stable for `only_shards`.

use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use tracesched_model::ThreadModifier;
use tracesched_model::Tid;
use tracesched_model::TimeRange;

use crate::error::Result;
use crate::error::SchedulerError;

/// Serial schedule sidecar; matched by prefix since it may carry a
/// compression suffix.
pub const SERIAL_SCHEDULE_FILENAME: &str = "serial_schedule";
/// The as-traced per-cpu schedule sidecar.
pub const CPU_SCHEDULE_FILENAME: &str = "cpu_schedule";
pub const MODULE_LIST_FILENAME: &str = "modules.log";
pub const FUNCTION_LIST_FILENAME: &str = "funclist.log";
pub const ENCODING_FILENAME: &str = "encodings.bin";

/// One explicitly-provided input.
#[derive(Debug)]
pub struct ReaderInput<Rd> {
    pub reader: Rd,
    pub tid: Tid,
}

/// One workload: a set of inputs scheduled together, with per-thread
/// scheduling attributes.
#[derive(Debug)]
pub struct Workload<Rd> {
    /// Trace file or directory; mutually exclusive with `readers`.
    pub path: Option<PathBuf>,
    /// Already-opened inputs; mutually exclusive with `path`.
    pub readers: Vec<ReaderInput<Rd>>,
    /// Restrict to these tids.  Mutually exclusive with `only_shards`.
    pub only_threads: BTreeSet<Tid>,
    /// Restrict to these 0-based shard ordinals.
    pub only_shards: BTreeSet<usize>,
    /// Timestamp windows translated into per-thread regions of interest.
    pub times_of_interest: Vec<TimeRange>,
    pub thread_modifiers: Vec<ThreadModifier>,
}

impl<Rd> Workload<Rd> {
    /// A workload over explicit readers.
    pub fn from_readers(readers: Vec<ReaderInput<Rd>>) -> Self {
        Workload {
            path: None,
            readers,
            only_threads: BTreeSet::new(),
            only_shards: BTreeSet::new(),
            times_of_interest: Vec::new(),
            thread_modifiers: Vec::new(),
        }
    }

    /// A workload discovered from a file or directory path.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Workload {
            path: Some(path.into()),
            readers: Vec::new(),
            only_threads: BTreeSet::new(),
            only_shards: BTreeSet::new(),
            times_of_interest: Vec::new(),
            thread_modifiers: Vec::new(),
        }
    }
}

/// Whether discovery must skip this directory entry.
fn is_reserved_file(name: &str) -> bool {
    name.starts_with(SERIAL_SCHEDULE_FILENAME)
        || name == CPU_SCHEDULE_FILENAME
        || name == MODULE_LIST_FILENAME
        || name == FUNCTION_LIST_FILENAME
        || name == ENCODING_FILENAME
}

/// List the trace files of a directory in sorted order, skipping the
/// reserved auxiliary files.  Sorting keeps shard ordinals reliable; leading
/// zeros in embedded numbers are assumed, so a plain sort preserves numeric
/// order.
pub fn discover_trace_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        SchedulerError::FileOpen(format!("failed to list directory {}: {}", dir.display(), e))
    })?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            SchedulerError::FileRead(format!(
                "failed to list directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if is_reserved_file(&name) {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn discovery_skips_reserved_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "trace.0002",
            "trace.0000",
            "trace.0001",
            "cpu_schedule",
            "serial_schedule.gz",
            "modules.log",
            "funclist.log",
            "encodings.bin",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let files = discover_trace_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["trace.0000", "trace.0001", "trace.0002"]);
    }

    #[test]
    fn discovery_reports_missing_directory() {
        let err = discover_trace_files(Path::new("/nonexistent-tracesched")).unwrap_err();
        assert!(matches!(err, SchedulerError::FileOpen(_)));
    }
}
