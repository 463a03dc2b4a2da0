/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Kernel context-switch sequences: preloaded record runs injected at each
//! input→input transition.  The source stream brackets each sequence with
//! context-switch start/end markers whose value names the switch type.

use std::collections::BTreeMap;

use tracesched_model::MarkerKind;
use tracesched_model::SwitchKind;
use tracesched_model::TraceRecord;

use crate::error::Result;
use crate::error::SchedulerError;
use crate::reader::TraceReader;

/// Read all switch sequences from a reader.  The sequences are small, so
/// they are held in memory rather than streamed on every use.
pub(crate) fn read_switch_sequences<R, Rd>(
    reader: &mut Rd,
) -> Result<BTreeMap<SwitchKind, Vec<R>>>
where
    R: TraceRecord,
    Rd: TraceReader<R>,
{
    reader.init()?;
    let mut sequences: BTreeMap<SwitchKind, Vec<R>> = BTreeMap::new();
    let mut cur: Option<SwitchKind> = None;
    while !reader.at_end() {
        let record = reader.record().clone();
        if let Some((MarkerKind::ContextSwitchStart, value)) = record.as_marker() {
            let kind = SwitchKind::from_marker_value(value).ok_or_else(|| {
                SchedulerError::InvalidParameter(format!(
                    "unknown context switch sequence type {}",
                    value
                ))
            })?;
            if sequences.contains_key(&kind) {
                return Err(SchedulerError::InvalidParameter(
                    "duplicate context switch sequence type found".to_string(),
                ));
            }
            cur = Some(kind);
        }
        if let Some(kind) = cur {
            sequences.entry(kind).or_default().push(record.clone());
        }
        if let Some((MarkerKind::ContextSwitchEnd, value)) = record.as_marker() {
            if SwitchKind::from_marker_value(value) != cur {
                return Err(SchedulerError::InvalidParameter(
                    "context switch marker values mismatched".to_string(),
                ));
            }
            let kind = cur.take().unwrap();
            tracing::debug!(
                "read {} kernel context switch records for type {:?}",
                sequences[&kind].len(),
                kind
            );
        }
        reader.advance();
    }
    Ok(sequences)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracesched_model::Memref;
    use tracesched_model::Pid;
    use tracesched_model::Tid;

    use super::*;
    use crate::reader::MemoryReader;

    fn marker(kind: MarkerKind, value: u64) -> Memref {
        Memref::Marker {
            tid: Tid::from_raw(0),
            pid: Pid::from_raw(0),
            kind,
            value,
        }
    }

    fn instr(pc: u64) -> Memref {
        Memref::Instruction {
            tid: Tid::from_raw(0),
            pid: Pid::from_raw(0),
            pc,
            size: 4,
        }
    }

    #[test]
    fn reads_bracketed_sequences() {
        let mut reader = MemoryReader::new(
            "switch",
            vec![
                marker(MarkerKind::ContextSwitchStart, 1),
                instr(0x100),
                instr(0x104),
                marker(MarkerKind::ContextSwitchEnd, 1),
                marker(MarkerKind::ContextSwitchStart, 2),
                instr(0x200),
                marker(MarkerKind::ContextSwitchEnd, 2),
            ],
        );
        let sequences = read_switch_sequences(&mut reader).unwrap();
        assert_eq!(sequences[&SwitchKind::Thread].len(), 4);
        assert_eq!(sequences[&SwitchKind::Process].len(), 3);
    }

    #[test]
    fn duplicate_sequence_type_rejected() {
        let mut reader = MemoryReader::new(
            "switch",
            vec![
                marker(MarkerKind::ContextSwitchStart, 1),
                marker(MarkerKind::ContextSwitchEnd, 1),
                marker(MarkerKind::ContextSwitchStart, 1),
                marker(MarkerKind::ContextSwitchEnd, 1),
            ],
        );
        let err = read_switch_sequences(&mut reader).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidParameter(_)));
    }

    #[test]
    fn mismatched_end_marker_rejected() {
        let mut reader = MemoryReader::new(
            "switch",
            vec![
                marker(MarkerKind::ContextSwitchStart, 1),
                marker(MarkerKind::ContextSwitchEnd, 2),
            ],
        );
        let err = read_switch_sequences(&mut reader).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidParameter(_)));
    }
}
