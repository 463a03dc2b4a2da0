/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Synthetic record generation for consumer-driven speculation.  The only
//! strategy today is a stream of nops from the requested address; the
//! interface leaves room for instruction-decoding strategies later.

use tracesched_model::TraceRecord;

use crate::error::Result;

/// Generates speculative records starting from a program counter.
#[derive(Debug, Default)]
pub(crate) struct NopSpeculator;

impl NopSpeculator {
    /// Produce the record at `pc` and the pc to continue from.
    pub fn next_record<R: TraceRecord>(&self, pc: u64) -> Result<(R, u64)> {
        let record = R::nop_instruction(pc);
        // A nop advances by its own length.
        Ok((record, pc + 1))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tracesched_model::Memref;
    use tracesched_model::TraceRecord;

    use super::*;

    #[test]
    fn nops_advance_pc() {
        let speculator = NopSpeculator;
        let (record, next_pc): (Memref, u64) = speculator.next_record(0x1000).unwrap();
        assert!(record.is_instruction());
        assert_eq!(next_pc, 0x1001);
        let (_, next_pc): (Memref, u64) = speculator.next_record(next_pc).unwrap();
        assert_eq!(next_pc, 0x1002);
    }
}
