/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-output state.  Each output models one logical cpu and is driven by a
//! single consumer thread at a time; everything here sits behind the output's
//! own lock.  Replay segments and the replay cursor live outside this struct
//! (see the scheduler's output slots) because other outputs read them for
//! cross-output timestamp waits.

use tracesched_model::stats::SCHEDULE_STAT_COUNT;
use tracesched_model::InputIndex;
use tracesched_model::OutputIndex;
use tracesched_model::ScheduleSegment;
use tracesched_model::ScheduleStat;
use tracesched_model::TraceRecord;

/// State for one synthesized output stream.
#[derive(Debug)]
pub(crate) struct Output<R> {
    pub index: OutputIndex,
    pub cur_input: Option<InputIndex>,
    pub prev_input: Option<InputIndex>,

    /// Inactive outputs return idle and surrender their input.
    pub active: bool,
    /// Between inputs; the next call re-dispatches.
    pub waiting: bool,
    pub at_eof: bool,
    pub wait_start_time: u64,
    /// Time supplied by the consumer on the latest call (or wall-clock).
    pub cur_time: u64,

    /// Segments recorded by this output when schedule recording is on.
    pub recorded: Vec<ScheduleSegment>,

    /// Resume addresses; non-empty while speculating.
    pub speculation_stack: Vec<u64>,
    pub speculate_pc: u64,
    pub prev_speculate_pc: u64,

    pub in_kernel_code: bool,
    pub in_context_switch_code: bool,
    /// The switch-end marker was just delivered; the flag flip is delayed one
    /// record so the marker itself still counts as switch code.
    pub hit_switch_code_end: bool,

    pub stats: [u64; SCHEDULE_STAT_COUNT],
    /// The traced cpu this output stands in for under as-traced replay.
    pub as_traced_cpuid: i64,

    /// Most recently delivered record, for boundary checks and unread.
    pub last_record: R,

    /// Static partition for consistent mapping.
    pub input_indices: Vec<InputIndex>,
    pub input_indices_index: usize,

    // Stream header state, surfaced through the output query API.  Filled
    // from a newly assigned input on first use and updated from markers.
    pub version: u64,
    pub filetype: u64,
    pub cache_line_size: u64,
    pub chunk_instr_count: u64,
    pub page_size: u64,
    pub first_timestamp: u64,
    pub last_timestamp: u64,

    /// Records delivered, excluding synthetic ones.
    pub ref_count: u64,
    /// Instructions delivered.
    pub instr_count: u64,
}

impl<R: TraceRecord> Output<R> {
    pub fn new(index: OutputIndex) -> Self {
        Output {
            index,
            cur_input: None,
            prev_input: None,
            active: true,
            waiting: false,
            at_eof: false,
            wait_start_time: 0,
            cur_time: 0,
            recorded: Vec::new(),
            speculation_stack: Vec::new(),
            speculate_pc: 0,
            prev_speculate_pc: 0,
            in_kernel_code: false,
            in_context_switch_code: false,
            hit_switch_code_end: false,
            stats: [0; SCHEDULE_STAT_COUNT],
            as_traced_cpuid: -1,
            last_record: R::invalid(),
            input_indices: Vec::new(),
            input_indices_index: 0,
            version: 0,
            filetype: 0,
            cache_line_size: 0,
            chunk_instr_count: 0,
            page_size: 0,
            first_timestamp: 0,
            last_timestamp: 0,
            ref_count: 0,
            instr_count: 0,
        }
    }

    pub fn bump_stat(&mut self, stat: ScheduleStat) {
        self.stats[stat.index()] += 1;
    }

    pub fn stat(&self, stat: ScheduleStat) -> u64 {
        self.stats[stat.index()]
    }
}
