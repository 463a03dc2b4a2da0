/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The two record variants the scheduler is generic over, plus the
//! classification predicates shared between them.
//!
//! [`Memref`] is the high-level normalized form handed to analysis tools;
//! [`TraceEntry`] is the raw on-disk encoding.  All scheduler logic is written
//! against the [`TraceRecord`] trait so the two shapes share one engine.

use serde::Deserialize;
use serde::Serialize;

use crate::ids::Pid;
use crate::ids::Tid;

/// Marker categories understood by the scheduler.  Raw streams store these as
/// numeric codes; [`MarkerKind::from_raw`] and [`MarkerKind::as_raw`] are the
/// stable mapping.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum MarkerKind {
    /// Trace format version, emitted once per input before any instruction.
    Version,
    /// Wall-clock microseconds at trace buffer flush.
    Timestamp,
    /// Bitfield describing the originating trace flavor.
    Filetype,
    CacheLineSize,
    PageSize,
    /// Instruction count per on-disk chunk.
    ChunkInstrCount,
    /// Region-of-interest separator carrying the region ordinal.
    WindowId,
    /// A system call was entered.
    Syscall,
    /// The just-entered system call may block.
    MaybeBlockingSyscall,
    /// Timeout argument of the pending syscall, cleared post-syscall.
    SyscallArgTimeout,
    /// The thread voluntarily parked itself.
    SyscallUnschedule,
    /// The thread asked the kernel to wake the target tid in the value.
    SyscallSchedule,
    /// The thread requested an immediate switch to the target tid.
    DirectThreadSwitch,
    SyscallTraceStart,
    SyscallTraceEnd,
    ContextSwitchStart,
    ContextSwitchEnd,
    /// Target of the upcoming branch instruction (pre-instruction marker).
    BranchTarget,
    /// A marker category this scheduler has no special handling for.
    Other(u16),
}

impl MarkerKind {
    /// Decode a raw marker code.
    pub fn from_raw(code: u16) -> MarkerKind {
        match code {
            0 => MarkerKind::Version,
            1 => MarkerKind::Timestamp,
            2 => MarkerKind::Filetype,
            3 => MarkerKind::CacheLineSize,
            4 => MarkerKind::PageSize,
            5 => MarkerKind::ChunkInstrCount,
            6 => MarkerKind::WindowId,
            7 => MarkerKind::Syscall,
            8 => MarkerKind::MaybeBlockingSyscall,
            9 => MarkerKind::SyscallArgTimeout,
            10 => MarkerKind::SyscallUnschedule,
            11 => MarkerKind::SyscallSchedule,
            12 => MarkerKind::DirectThreadSwitch,
            13 => MarkerKind::SyscallTraceStart,
            14 => MarkerKind::SyscallTraceEnd,
            15 => MarkerKind::ContextSwitchStart,
            16 => MarkerKind::ContextSwitchEnd,
            17 => MarkerKind::BranchTarget,
            other => MarkerKind::Other(other),
        }
    }

    /// Inverse of [`MarkerKind::from_raw`].
    pub fn as_raw(&self) -> u16 {
        match self {
            MarkerKind::Version => 0,
            MarkerKind::Timestamp => 1,
            MarkerKind::Filetype => 2,
            MarkerKind::CacheLineSize => 3,
            MarkerKind::PageSize => 4,
            MarkerKind::ChunkInstrCount => 5,
            MarkerKind::WindowId => 6,
            MarkerKind::Syscall => 7,
            MarkerKind::MaybeBlockingSyscall => 8,
            MarkerKind::SyscallArgTimeout => 9,
            MarkerKind::SyscallUnschedule => 10,
            MarkerKind::SyscallSchedule => 11,
            MarkerKind::DirectThreadSwitch => 12,
            MarkerKind::SyscallTraceStart => 13,
            MarkerKind::SyscallTraceEnd => 14,
            MarkerKind::ContextSwitchStart => 15,
            MarkerKind::ContextSwitchEnd => 16,
            MarkerKind::BranchTarget => 17,
            MarkerKind::Other(other) => *other,
        }
    }
}

/// An opaque trace element, classified via predicates rather than direct field
/// access so the scheduler can stay generic over the concrete shape.
pub trait TraceRecord: Clone + std::fmt::Debug {
    /// An executed (fetched) instruction.
    fn is_instruction(&self) -> bool;

    /// Instruction-encoding bytes preceding their instruction record.
    fn is_encoding(&self) -> bool;

    /// Marker kind and value, if this is a marker.
    fn as_marker(&self) -> Option<(MarkerKind, u64)>;

    /// Timestamp value, if this is a timestamp marker.
    fn timestamp(&self) -> Option<u64> {
        match self.as_marker() {
            Some((MarkerKind::Timestamp, value)) => Some(value),
            _ => None,
        }
    }

    /// The sentinel produced by [`TraceRecord::invalid`].
    fn is_invalid(&self) -> bool;

    /// A stream header that is not expressed as a marker (raw form only).
    fn is_non_marker_header(&self) -> bool;

    /// The traced thread id, for shapes/records that carry one.
    fn tid(&self) -> Option<Tid>;

    /// The traced process id, for shapes/records that carry one.
    fn pid(&self) -> Option<Pid>;

    /// Rewrite the thread id, for records that carry one.  No-op otherwise.
    fn set_tid(&mut self, tid: Tid);

    /// True when delivering this record crosses an instruction boundary.
    /// Raw streams must not split an instruction from the encodings and
    /// pre-instruction markers in front of it, hence the previous record.
    fn is_instruction_boundary(&self, prev: &Self) -> bool;

    /// Whether [`crate::record::TraceRecord::is_instruction_boundary`] can be
    /// re-established after un-reading one record.  False for the raw shape,
    /// which would need the record before the previous one.
    fn supports_unread() -> bool;

    /// Region separator inserted between regions of interest.
    fn window_marker(tid: Tid, region_ordinal: u64) -> Self;

    /// Synthesized end-of-thread record.
    fn thread_exit(tid: Tid) -> Self;

    /// Sentinel used before any real record has been seen.
    fn invalid() -> Self;

    /// A synthetic nop instruction at `pc`, for speculation.
    fn nop_instruction(pc: u64) -> Self;

    /// Records to prepend when an output switches to this input so a
    /// downstream decoder sees the new thread context.  Empty for the
    /// normalized shape, where every record already carries its tid.
    fn switch_context_headers(tid: Tid, pid: Pid) -> Vec<Self>;
}

// Normalized records:
//--------------------------------------------------------------------------------

/// High-level normalized record: the shape analysis tools consume.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum Memref {
    /// A fetched instruction.
    Instruction { tid: Tid, pid: Pid, pc: u64, size: u16 },
    /// A data load or store performed by the previous instruction.
    DataRef {
        tid: Tid,
        pid: Pid,
        addr: u64,
        size: u16,
        write: bool,
    },
    /// A metadata marker.
    Marker {
        tid: Tid,
        pid: Pid,
        kind: MarkerKind,
        value: u64,
    },
    /// The thread exited (possibly synthesized by the scheduler).
    ThreadExit { tid: Tid, pid: Pid },
    /// Sentinel; never produced by a reader.
    Invalid,
}

impl TraceRecord for Memref {
    fn is_instruction(&self) -> bool {
        matches!(self, Memref::Instruction { .. })
    }

    fn is_encoding(&self) -> bool {
        // Encoding bytes live inside normalized instruction records.
        false
    }

    fn as_marker(&self) -> Option<(MarkerKind, u64)> {
        match self {
            Memref::Marker { kind, value, .. } => Some((*kind, *value)),
            _ => None,
        }
    }

    fn is_invalid(&self) -> bool {
        matches!(self, Memref::Invalid)
    }

    fn is_non_marker_header(&self) -> bool {
        // Raw headers are normalized into markers or hidden.
        false
    }

    fn tid(&self) -> Option<Tid> {
        match self {
            Memref::Instruction { tid, .. }
            | Memref::DataRef { tid, .. }
            | Memref::Marker { tid, .. }
            | Memref::ThreadExit { tid, .. } => Some(*tid),
            Memref::Invalid => None,
        }
    }

    fn pid(&self) -> Option<Pid> {
        match self {
            Memref::Instruction { pid, .. }
            | Memref::DataRef { pid, .. }
            | Memref::Marker { pid, .. }
            | Memref::ThreadExit { pid, .. } => Some(*pid),
            Memref::Invalid => None,
        }
    }

    fn set_tid(&mut self, new_tid: Tid) {
        match self {
            Memref::Instruction { tid, .. }
            | Memref::DataRef { tid, .. }
            | Memref::Marker { tid, .. }
            | Memref::ThreadExit { tid, .. } => *tid = new_tid,
            Memref::Invalid => {}
        }
    }

    fn is_instruction_boundary(&self, _prev: &Self) -> bool {
        self.is_instruction()
    }

    fn supports_unread() -> bool {
        true
    }

    fn window_marker(tid: Tid, region_ordinal: u64) -> Self {
        Memref::Marker {
            tid,
            pid: Pid::from_raw(0),
            kind: MarkerKind::WindowId,
            value: region_ordinal,
        }
    }

    fn thread_exit(tid: Tid) -> Self {
        Memref::ThreadExit {
            tid,
            pid: Pid::from_raw(0),
        }
    }

    fn invalid() -> Self {
        Memref::Invalid
    }

    fn nop_instruction(pc: u64) -> Self {
        Memref::Instruction {
            tid: Tid::from_raw(0),
            pid: Pid::from_raw(0),
            pc,
            size: 1,
        }
    }

    fn switch_context_headers(_tid: Tid, _pid: Pid) -> Vec<Self> {
        // Every normalized record carries its own tid.
        Vec::new()
    }
}

// Raw records:
//--------------------------------------------------------------------------------

/// Category byte of a raw trace entry.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Instruction,
    DataLoad,
    DataStore,
    Encoding,
    Marker,
    /// File-level header.
    Header,
    /// Thread id header.
    Thread,
    /// Process id header.
    Pid,
    ThreadExit,
    Invalid,
}

/// Low-level record: the raw on-disk encoding, `{kind, size, addr}`.
/// The `size` field is overloaded as the marker code for marker entries,
/// and `addr` as the marker value, matching the wire format.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub struct TraceEntry {
    pub kind: EntryKind,
    pub size: u16,
    pub addr: u64,
}

impl TraceEntry {
    /// Build a marker entry.
    pub fn marker(kind: MarkerKind, value: u64) -> Self {
        TraceEntry {
            kind: EntryKind::Marker,
            size: kind.as_raw(),
            addr: value,
        }
    }

    /// Encodings and pre-instruction markers must stay glued to the
    /// instruction that follows them.
    fn is_pre_instruction(&self) -> bool {
        self.is_encoding()
            || matches!(self.as_marker(), Some((MarkerKind::BranchTarget, _)))
    }
}

impl TraceRecord for TraceEntry {
    fn is_instruction(&self) -> bool {
        self.kind == EntryKind::Instruction
    }

    fn is_encoding(&self) -> bool {
        self.kind == EntryKind::Encoding
    }

    fn as_marker(&self) -> Option<(MarkerKind, u64)> {
        if self.kind != EntryKind::Marker {
            return None;
        }
        Some((MarkerKind::from_raw(self.size), self.addr))
    }

    fn is_invalid(&self) -> bool {
        self.kind == EntryKind::Invalid
    }

    fn is_non_marker_header(&self) -> bool {
        matches!(self.kind, EntryKind::Header | EntryKind::Thread | EntryKind::Pid)
    }

    fn tid(&self) -> Option<Tid> {
        if self.kind != EntryKind::Thread {
            return None;
        }
        Some(Tid::from_raw(self.addr as i64))
    }

    fn pid(&self) -> Option<Pid> {
        if self.kind != EntryKind::Pid {
            return None;
        }
        Some(Pid::from_raw(self.addr as i64))
    }

    fn set_tid(&mut self, tid: Tid) {
        if self.kind != EntryKind::Thread {
            return;
        }
        self.addr = tid.as_raw() as u64;
    }

    fn is_instruction_boundary(&self, prev: &Self) -> bool {
        (self.is_instruction() || self.is_pre_instruction()) && !prev.is_pre_instruction()
    }

    fn supports_unread() -> bool {
        // Restoring boundary state would need the record before the previous.
        false
    }

    fn window_marker(_tid: Tid, region_ordinal: u64) -> Self {
        TraceEntry::marker(MarkerKind::WindowId, region_ordinal)
    }

    fn thread_exit(tid: Tid) -> Self {
        TraceEntry {
            kind: EntryKind::ThreadExit,
            size: std::mem::size_of::<i64>() as u16,
            addr: tid.as_raw() as u64,
        }
    }

    fn invalid() -> Self {
        TraceEntry {
            kind: EntryKind::Invalid,
            size: 0,
            addr: 0,
        }
    }

    fn nop_instruction(pc: u64) -> Self {
        TraceEntry {
            kind: EntryKind::Instruction,
            size: 1,
            addr: pc,
        }
    }

    fn switch_context_headers(tid: Tid, pid: Pid) -> Vec<Self> {
        // Explicit tid,pid headers so a raw-stream decoder sees the new
        // context before the injected records.
        vec![
            TraceEntry {
                kind: EntryKind::Thread,
                size: 0,
                addr: tid.as_raw() as u64,
            },
            TraceEntry {
                kind: EntryKind::Pid,
                size: 0,
                addr: pid.as_raw() as u64,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn marker_codes_round_trip() {
        for code in 0..32u16 {
            assert_eq!(MarkerKind::from_raw(code).as_raw(), code);
        }
    }

    #[test]
    fn raw_boundary_keeps_encoding_with_instruction() {
        let enc = TraceEntry {
            kind: EntryKind::Encoding,
            size: 4,
            addr: 0x1000,
        };
        let instr = TraceEntry {
            kind: EntryKind::Instruction,
            size: 4,
            addr: 0x1000,
        };
        let marker = TraceEntry::marker(MarkerKind::Timestamp, 5);
        // An encoding after a regular record opens the instruction.
        assert!(enc.is_instruction_boundary(&marker));
        // The instruction after its encoding is not a second boundary.
        assert!(!instr.is_instruction_boundary(&enc));
        assert!(instr.is_instruction_boundary(&marker));
    }

    #[test]
    fn normalized_tid_rewrite() {
        let mut record = Memref::Instruction {
            tid: Tid::from_raw(4),
            pid: Pid::from_raw(4),
            pc: 0x42,
            size: 2,
        };
        record.set_tid(Tid::from_raw(7));
        assert_eq!(record.tid(), Some(Tid::from_raw(7)));
    }
}
