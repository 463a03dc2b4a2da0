/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The uniform lazy-sequence interface the scheduler consumes, plus an
//! in-memory implementation for explicit-reader workloads and synthetic
//! traces.  Concrete on-disk decoders live outside this crate and only need
//! to implement [`TraceReader`].

use tracesched_model::TraceRecord;

use crate::error::Result;
use crate::error::SchedulerError;

/// First trace format version whose syscalls are bracketed by timestamps.
/// Older traces fall back to the threshold-only blocking model.
pub const TRACE_VERSION_FREQUENT_TIMESTAMPS: u64 = 5;

/// A lazy sequence of trace records with ordinal and timestamp queries.
///
/// The sequence is positional: after [`TraceReader::init`] the reader is
/// parked on its first record, [`TraceReader::advance`] consumes it and moves
/// on.  All counters include the record currently parked on.
pub trait TraceReader<R: TraceRecord> {
    /// Prepare the source.  May block (e.g. an IPC-backed source); the
    /// scheduler calls it lazily on first use unless told to read during init.
    fn init(&mut self) -> Result<()>;

    /// True once the sequence is exhausted.
    fn at_end(&self) -> bool;

    /// The current record.  Must not be called when [`TraceReader::at_end`].
    fn record(&self) -> &R;

    /// Consume the current record and move to the next.
    fn advance(&mut self);

    /// Skip forward until `count` more instructions have been consumed,
    /// leaving the reader parked just past the last one.  Counters advance
    /// as if read.
    fn skip_instructions(&mut self, count: u64);

    /// Identifier for logs and `get_input_name`.
    fn stream_name(&self) -> String;

    /// Trace format version (from the version marker, if any).
    fn version(&self) -> u64;

    /// Filetype bits (from the filetype marker, if any).
    fn filetype(&self) -> u64;

    fn cache_line_size(&self) -> u64;

    fn chunk_instr_count(&self) -> u64;

    fn page_size(&self) -> u64;

    /// First timestamp marker value seen, 0 if none yet.
    fn first_timestamp(&self) -> u64;

    /// Most recent timestamp marker value seen, 0 if none yet.
    fn last_timestamp(&self) -> u64;

    /// Count of records read so far, including the current one.
    fn record_ordinal(&self) -> u64;

    /// Count of instruction records consumed.  The current, not-yet-consumed
    /// record is excluded, so this equals the count visible to consumers.
    fn instruction_ordinal(&self) -> u64;

    /// Whether the current record was synthesized rather than traced.
    fn is_record_synthetic(&self) -> bool {
        false
    }

    /// Whether the current record is kernel-provided code.
    fn is_record_kernel(&self) -> bool {
        false
    }
}

/// Factory used by workload directory discovery to open one reader per
/// discovered file.  Decoding is the factory's business; the scheduler only
/// sees the resulting [`TraceReader`].
pub trait ReaderFactory<R: TraceRecord> {
    type Reader: TraceReader<R>;

    fn open(&self, path: &std::path::Path) -> Result<Self::Reader>;
}

/// An in-memory record sequence.  Used for the explicit-readers workload path
/// and throughout the test suite.
#[derive(Debug, Clone)]
pub struct MemoryReader<R> {
    name: String,
    records: Vec<R>,
    pos: usize,
    initialized: bool,
    fail_init: bool,
    version: u64,
    filetype: u64,
    cache_line_size: u64,
    chunk_instr_count: u64,
    page_size: u64,
    first_timestamp: u64,
    last_timestamp: u64,
    record_count: u64,
    instr_count: u64,
}

impl<R: TraceRecord> MemoryReader<R> {
    pub fn new(name: impl Into<String>, records: Vec<R>) -> Self {
        MemoryReader {
            name: name.into(),
            records,
            pos: 0,
            initialized: false,
            fail_init: false,
            version: TRACE_VERSION_FREQUENT_TIMESTAMPS,
            filetype: 0,
            cache_line_size: 64,
            chunk_instr_count: 0,
            page_size: 4096,
            first_timestamp: 0,
            last_timestamp: 0,
            record_count: 0,
            instr_count: 0,
        }
    }

    /// Override the reported trace version (e.g. to model legacy traces
    /// without paired syscall timestamps).
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Make `init` fail, for exercising open-error paths.
    pub fn with_failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    /// Update the record count and header state for the record at `self.pos`.
    /// Instructions are counted on departure instead, in `advance`.
    fn absorb_current(&mut self) {
        let Some(record) = self.records.get(self.pos) else {
            return;
        };
        self.record_count += 1;
        if let Some((kind, value)) = record.as_marker() {
            use tracesched_model::MarkerKind;
            match kind {
                MarkerKind::Timestamp => {
                    self.last_timestamp = value;
                    if self.first_timestamp == 0 {
                        self.first_timestamp = value;
                    }
                }
                MarkerKind::Version => self.version = value,
                MarkerKind::Filetype => self.filetype = value,
                MarkerKind::CacheLineSize => self.cache_line_size = value,
                MarkerKind::ChunkInstrCount => self.chunk_instr_count = value,
                MarkerKind::PageSize => self.page_size = value,
                _ => {}
            }
        }
    }
}

impl<R: TraceRecord> TraceReader<R> for MemoryReader<R> {
    fn init(&mut self) -> Result<()> {
        if self.fail_init {
            return Err(SchedulerError::FileOpen(format!(
                "failed to open {}",
                self.name
            )));
        }
        if !self.initialized {
            self.initialized = true;
            self.absorb_current();
        }
        Ok(())
    }

    fn at_end(&self) -> bool {
        self.pos >= self.records.len()
    }

    fn record(&self) -> &R {
        &self.records[self.pos]
    }

    fn advance(&mut self) {
        if self.at_end() {
            return;
        }
        if self.records[self.pos].is_instruction() {
            self.instr_count += 1;
        }
        self.pos += 1;
        self.absorb_current();
    }

    fn skip_instructions(&mut self, count: u64) {
        let target = self.instr_count + count;
        while self.instr_count < target && !self.at_end() {
            self.advance();
        }
    }

    fn stream_name(&self) -> String {
        self.name.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn filetype(&self) -> u64 {
        self.filetype
    }

    fn cache_line_size(&self) -> u64 {
        self.cache_line_size
    }

    fn chunk_instr_count(&self) -> u64 {
        self.chunk_instr_count
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn first_timestamp(&self) -> u64 {
        self.first_timestamp
    }

    fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    fn record_ordinal(&self) -> u64 {
        self.record_count
    }

    fn instruction_ordinal(&self) -> u64 {
        self.instr_count
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracesched_model::MarkerKind;
    use tracesched_model::Memref;
    use tracesched_model::Pid;
    use tracesched_model::Tid;

    use super::*;

    fn instr(pc: u64) -> Memref {
        Memref::Instruction {
            tid: Tid::from_raw(1),
            pid: Pid::from_raw(1),
            pc,
            size: 4,
        }
    }

    fn timestamp(value: u64) -> Memref {
        Memref::Marker {
            tid: Tid::from_raw(1),
            pid: Pid::from_raw(1),
            kind: MarkerKind::Timestamp,
            value,
        }
    }

    #[test]
    fn instruction_ordinal_counts_consumed() {
        let mut reader =
            MemoryReader::new("mem", vec![timestamp(10), instr(0x100), instr(0x104)]);
        reader.init().unwrap();
        assert_eq!(reader.record_ordinal(), 1);
        assert_eq!(reader.instruction_ordinal(), 0);
        assert_eq!(reader.last_timestamp(), 10);
        reader.advance();
        // Parked on the first instruction: not yet consumed.
        assert_eq!(reader.instruction_ordinal(), 0);
        reader.advance();
        assert_eq!(reader.instruction_ordinal(), 1);
        reader.advance();
        assert_eq!(reader.instruction_ordinal(), 2);
        assert!(reader.at_end());
    }

    #[test]
    fn skip_lands_past_target_instruction() {
        // i1 i2 i3 ts i4: skipping 3 from i1 consumes i1..i3 and parks on the
        // timestamp ahead of i4.
        let mut reader = MemoryReader::new(
            "mem",
            vec![
                instr(0x100),
                instr(0x104),
                instr(0x108),
                timestamp(50),
                instr(0x10c),
            ],
        );
        reader.init().unwrap();
        reader.skip_instructions(3);
        assert_eq!(reader.instruction_ordinal(), 3);
        assert_eq!(reader.record(), &timestamp(50));
        assert_eq!(reader.last_timestamp(), 50);
    }

    #[test]
    fn skip_past_end_reports_eof() {
        let mut reader = MemoryReader::new("mem", vec![instr(0x100), instr(0x104)]);
        reader.init().unwrap();
        reader.skip_instructions(100);
        assert!(reader.at_end());
    }
}
