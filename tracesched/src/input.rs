/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-input bookkeeping.  One `Input` exists per recorded thread (or shard)
//! and is protected by its own lock inside the scheduler; an output owns at
//! most one input at a time and all transfers go through the ready queue.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use tracesched_model::InputIndex;
use tracesched_model::InstrRange;
use tracesched_model::OutputIndex;
use tracesched_model::Pid;
use tracesched_model::Tid;
use tracesched_model::TraceRecord;
use tracesched_model::WorkloadIndex;

use crate::error::Result;
use crate::reader::TraceReader;
use crate::scheduler::runqueue::Priority;
use crate::scheduler::runqueue::DEFAULT_PRIORITY;

/// State for one recorded execution stream.
///
/// INVARIANT: an input with `unscheduled` set and `blocked_time == 0` lives in
/// the unscheduled queue; otherwise, when runnable and unowned, in the ready
/// queue.
#[derive(Debug)]
pub(crate) struct Input<R, Rd> {
    pub index: InputIndex,
    pub tid: Tid,
    pub pid: Option<Pid>,
    pub workload: WorkloadIndex,

    /// The owned lazy record source.
    pub reader: Rd,
    /// `init` has not run yet; it may block, so it runs on first use.
    pub needs_init: bool,
    /// False exactly when the current reader record has not been consumed,
    /// i.e. on first use and after a skip.
    pub needs_advance: bool,
    pub at_eof: bool,

    /// Deferred records delivered before the reader's current record:
    /// readahead from init, injected switch sequences, synthesized exits,
    /// and candidates put back during a switch.
    pub queue: VecDeque<R>,
    /// The record just delivered came from `queue`.
    pub cur_from_queue: bool,
    /// Instructions consumed by init-time readahead, invisible to consumers.
    pub instrs_pre_read: u64,

    pub priority: Priority,
    /// Outputs allowed to run this input; empty means any.
    pub binding: BTreeSet<OutputIndex>,
    pub has_modifier: bool,

    /// Minimum first timestamp across the workload, for timestamp ordering.
    pub base_timestamp: u64,
    /// First (then most recently seen) timestamp of this input.
    pub next_timestamp: u64,
    pub order_by_timestamp: bool,

    /// Remaining modeled block time, in time units.  0 = not blocked.
    pub blocked_time: u64,
    pub blocked_start_time: u64,
    /// Parked indefinitely by an unschedule or direct-switch marker.
    pub unscheduled: bool,
    /// Swallow the next unschedule request (a schedule marker arrived first).
    pub skip_next_unscheduled: bool,
    /// Pending direct-switch target.
    pub switch_to_input: Option<InputIndex>,

    pub processing_syscall: bool,
    pub processing_maybe_blocking_syscall: bool,
    pub pre_syscall_timestamp: u64,
    /// Timeout argument of the pending syscall; cleared post-syscall.
    pub syscall_timeout_arg: u64,

    pub instrs_in_quantum: u64,
    pub time_spent_in_quantum: u64,
    pub prev_time_in_quantum: u64,

    /// Strictly ascending, non-adjacent regions.
    pub regions_of_interest: Vec<InstrRange>,
    pub cur_region: usize,
    pub in_cur_region: bool,
    /// Cleared for one iteration after a skip to avoid re-requesting it.
    pub needs_roi: bool,

    /// The pending switch happens before the just-read instruction was
    /// consumed, so the recorded stop ordinal needs +1.
    pub switching_pre_instruction: bool,

    /// The output that last ran this input, for migration accounting and
    /// replay linkage.
    pub prev_output: Option<OutputIndex>,
    /// Thread id carried by the most recent delivered record.
    pub last_record_tid: Tid,
}

impl<R: TraceRecord, Rd: TraceReader<R>> Input<R, Rd> {
    pub fn new(index: InputIndex, tid: Tid, workload: WorkloadIndex, reader: Rd) -> Self {
        Input {
            index,
            tid,
            pid: None,
            workload,
            reader,
            needs_init: true,
            needs_advance: false,
            at_eof: false,
            queue: VecDeque::new(),
            cur_from_queue: false,
            instrs_pre_read: 0,
            priority: DEFAULT_PRIORITY,
            binding: BTreeSet::new(),
            has_modifier: false,
            base_timestamp: 0,
            next_timestamp: 0,
            order_by_timestamp: false,
            blocked_time: 0,
            blocked_start_time: 0,
            unscheduled: false,
            skip_next_unscheduled: false,
            switch_to_input: None,
            processing_syscall: false,
            processing_maybe_blocking_syscall: false,
            pre_syscall_timestamp: 0,
            syscall_timeout_arg: 0,
            instrs_in_quantum: 0,
            time_spent_in_quantum: 0,
            prev_time_in_quantum: 0,
            regions_of_interest: Vec::new(),
            cur_region: 0,
            in_cur_region: false,
            needs_roi: true,
            switching_pre_instruction: false,
            prev_output: None,
            last_record_tid: tid,
        }
    }

    /// Run the reader's (possibly blocking) init if it hasn't run yet.
    pub fn ensure_init(&mut self) -> Result<()> {
        if self.needs_init {
            self.reader.init()?;
            self.needs_init = false;
        }
        Ok(())
    }

    /// Instruction ordinal as visible to consumers: the reader's count minus
    /// the init-time readahead.
    pub fn instr_ordinal(&self) -> u64 {
        let reader_cur = self.reader.instruction_ordinal();
        debug_assert!(reader_cur >= self.instrs_pre_read);
        reader_cur - self.instrs_pre_read
    }

    /// The timestamp delta used for timestamp-ordered queueing.
    pub fn timestamp_delta(&self) -> u64 {
        if !self.order_by_timestamp {
            return 0;
        }
        self.reader
            .last_timestamp()
            .max(self.next_timestamp)
            .saturating_sub(self.base_timestamp)
    }

    /// Drop all queued records.  Only legal when the queue holds no
    /// instructions beyond the single unconsumed candidate, as when skipping
    /// ahead in the stream.
    pub fn clear_queue(&mut self) {
        if cfg!(debug_assertions) {
            for (i, record) in self.queue.iter().enumerate() {
                assert!(
                    i == 0 || (!record.is_instruction() && !record.is_encoding()),
                    "clearing queued instructions would corrupt ordinals"
                );
            }
        }
        self.queue.clear();
    }
}
