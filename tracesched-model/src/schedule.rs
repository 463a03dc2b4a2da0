/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Persisted schedule formats: the per-output segment stream written and
//! replayed by the scheduler, and the per-cpu as-traced schedule entries
//! emitted at tracing time.

use serde::Deserialize;
use serde::Serialize;

use crate::ids::Tid;

/// Current version of the recorded schedule format.
pub const SCHEDULE_VERSION_CURRENT: u64 = 1;

/// Segment category.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    /// Header record; the value field holds the format version.
    Version,
    /// Run the input from start (inclusive) to stop (exclusive) instruction.
    Default,
    /// Skip the input forward from start to stop.
    Skip,
    /// Insert a synthesized thread exit for the input.
    SyntheticEnd,
    /// The output was idle; the value field holds the idle duration.
    Idle,
    /// Terminates one output's segment stream.
    Footer,
}

impl SegmentKind {
    fn from_raw(code: u8) -> Option<SegmentKind> {
        match code {
            0 => Some(SegmentKind::Version),
            1 => Some(SegmentKind::Default),
            2 => Some(SegmentKind::Skip),
            3 => Some(SegmentKind::SyntheticEnd),
            4 => Some(SegmentKind::Idle),
            5 => Some(SegmentKind::Footer),
            _ => None,
        }
    }

    fn as_raw(&self) -> u8 {
        match self {
            SegmentKind::Version => 0,
            SegmentKind::Default => 1,
            SegmentKind::Skip => 2,
            SegmentKind::SyntheticEnd => 3,
            SegmentKind::Idle => 4,
            SegmentKind::Footer => 5,
        }
    }
}

/// One persisted interval of an output's execution:
/// `{type:u8, input:i32, start_instruction:u64, stop_instruction:u64, timestamp:u64}`
/// little-endian, 29 bytes.  `start_instruction` doubles as the version for
/// VERSION segments and the idle duration for IDLE segments.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub struct ScheduleSegment {
    pub kind: SegmentKind,
    /// Input ordinal; meaningless for VERSION/IDLE/FOOTER.
    pub input: i32,
    pub start_instruction: u64,
    /// Exclusive; `u64::MAX` means to end-of-input.
    pub stop_instruction: u64,
    /// Wall-clock microseconds at record time.
    pub timestamp: u64,
}

impl ScheduleSegment {
    /// Size of the on-disk encoding.
    pub const ENCODED_LEN: usize = 29;

    /// A VERSION header segment.
    pub fn version(version: u64, timestamp: u64) -> Self {
        ScheduleSegment {
            kind: SegmentKind::Version,
            input: 0,
            start_instruction: version,
            stop_instruction: 0,
            timestamp,
        }
    }

    /// A FOOTER segment.
    pub fn footer(timestamp: u64) -> Self {
        ScheduleSegment {
            kind: SegmentKind::Footer,
            input: 0,
            start_instruction: 0,
            stop_instruction: 0,
            timestamp,
        }
    }

    /// The format version carried by a VERSION segment.
    pub fn format_version(&self) -> u64 {
        self.start_instruction
    }

    /// The duration carried by an IDLE segment.
    pub fn idle_duration(&self) -> u64 {
        self.start_instruction
    }

    /// Overwrite the duration of an IDLE segment.
    pub fn set_idle_duration(&mut self, duration: u64) {
        self.start_instruction = duration;
    }

    /// Serialize to the fixed on-disk layout.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0] = self.kind.as_raw();
        buf[1..5].copy_from_slice(&self.input.to_le_bytes());
        buf[5..13].copy_from_slice(&self.start_instruction.to_le_bytes());
        buf[13..21].copy_from_slice(&self.stop_instruction.to_le_bytes());
        buf[21..29].copy_from_slice(&self.timestamp.to_le_bytes());
        buf
    }

    /// Inverse of [`ScheduleSegment::encode`].  `None` on an unknown type byte.
    pub fn decode(buf: &[u8; Self::ENCODED_LEN]) -> Option<Self> {
        let kind = SegmentKind::from_raw(buf[0])?;
        Some(ScheduleSegment {
            kind,
            input: i32::from_le_bytes(buf[1..5].try_into().unwrap()),
            start_instruction: u64::from_le_bytes(buf[5..13].try_into().unwrap()),
            stop_instruction: u64::from_le_bytes(buf[13..21].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[21..29].try_into().unwrap()),
        })
    }
}

impl std::fmt::Display for ScheduleSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = serde_json::to_string(&self).unwrap();
        write!(f, "{}", str)
    }
}

/// Name of one output's component inside the schedule archive.
pub fn component_name(output: usize) -> String {
    format!("output.{:04}", output)
}

/// One entry of the as-traced per-cpu schedule:
/// `{thread:i64, timestamp:u64, cpu:u64, start_instruction:u64}`
/// little-endian, 32 bytes.  There is one entry per timestamp marker, so
/// consecutive entries for one cpu and input are common.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub struct CpuScheduleEntry {
    pub thread: Tid,
    pub timestamp: u64,
    pub cpu: u64,
    pub start_instruction: u64,
}

impl CpuScheduleEntry {
    /// Size of the on-disk encoding.
    pub const ENCODED_LEN: usize = 32;

    /// Serialize to the fixed on-disk layout.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.thread.as_raw().to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..24].copy_from_slice(&self.cpu.to_le_bytes());
        buf[24..32].copy_from_slice(&self.start_instruction.to_le_bytes());
        buf
    }

    /// Inverse of [`CpuScheduleEntry::encode`].
    pub fn decode(buf: &[u8; Self::ENCODED_LEN]) -> Self {
        CpuScheduleEntry {
            thread: Tid::from_raw(i64::from_le_bytes(buf[0..8].try_into().unwrap())),
            timestamp: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            cpu: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            start_instruction: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    #[test_case(SegmentKind::Version)]
    #[test_case(SegmentKind::Default)]
    #[test_case(SegmentKind::Skip)]
    #[test_case(SegmentKind::SyntheticEnd)]
    #[test_case(SegmentKind::Idle)]
    #[test_case(SegmentKind::Footer)]
    fn segment_codec_round_trip(kind: SegmentKind) {
        let segment = ScheduleSegment {
            kind,
            input: 3,
            start_instruction: 17,
            stop_instruction: u64::MAX,
            timestamp: 123_456_789,
        };
        let decoded = ScheduleSegment::decode(&segment.encode()).unwrap();
        assert_eq!(decoded, segment);
    }

    #[test]
    fn segment_decode_rejects_unknown_type() {
        let mut buf = ScheduleSegment::version(1, 0).encode();
        buf[0] = 0xff;
        assert_eq!(ScheduleSegment::decode(&buf), None);
    }

    #[test]
    fn cpu_entry_codec_round_trip() {
        let entry = CpuScheduleEntry {
            thread: Tid::from_raw(1234),
            timestamp: 13_344_214_879_969_223,
            cpu: 6,
            start_instruction: 10_000_000,
        };
        assert_eq!(CpuScheduleEntry::decode(&entry.encode()), entry);
    }

    #[test]
    fn component_names_are_zero_padded() {
        assert_eq!(component_name(0), "output.0000");
        assert_eq!(component_name(42), "output.0042");
        assert_eq!(component_name(10_000), "output.10000");
    }
}
