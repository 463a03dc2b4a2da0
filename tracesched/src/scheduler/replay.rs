/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Replay-mode dispatch and schedule-stream loading.
//!
//! Two replay flavors share this code: exact replay of a schedule this
//! scheduler recorded earlier, and replay of the as-traced per-cpu schedule,
//! which is first massaged into the same segment form (filling stop ordinals
//! in a second pass, collapsing adjacent same-input entries, and working
//! around two known data defects in stored ordinals).

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

use tracing::debug;
use tracing::trace;
use tracing::warn;

use tracesched_model::schedule::component_name;
use tracesched_model::schedule::SCHEDULE_VERSION_CURRENT;
use tracesched_model::CpuScheduleEntry;
use tracesched_model::DependencyMode;
use tracesched_model::InputIndex;
use tracesched_model::InstrRange;
use tracesched_model::ScheduleSegment;
use tracesched_model::SegmentKind;
use tracesched_model::Tid;
use tracesched_model::TimeRange;
use tracesched_model::TraceRecord;

use crate::error::Result;
use crate::error::SchedulerError;
use crate::output::Output;
use crate::reader::TraceReader;
use crate::schedule_file::CpuScheduleSource;
use crate::schedule_file::ScheduleReader;
use crate::times::regions_from_times;
use crate::times::TimeInterpolator;

use super::Pick;
use super::SchedState;
use super::Scheduler;

/// Chunk instruction count assumed by the modulo-wrap workaround.  The trace
/// has not been read far enough at this point to learn the real one, so only
/// the long-standing default is supported.
const DEFAULT_CHUNK_SIZE: u64 = 10 * 1000 * 1000;

/// One as-traced entry from an input's perspective, with a back-pointer into
/// the per-output list.
#[derive(Debug, Clone, Copy)]
struct ScheduleInputTracker {
    output: usize,
    output_array_idx: usize,
    start_instruction: u64,
    timestamp: u64,
}

/// One as-traced entry from an output's perspective.  `stop_instruction` is
/// filled in a second pass from the input's next start.
#[derive(Debug, Clone, Copy)]
struct ScheduleOutputTracker {
    valid: bool,
    input: InputIndex,
    start_instruction: u64,
    stop_instruction: u64,
    timestamp: u64,
}

/// The decoded as-traced schedule, cross-indexed by input and by on-disk
/// component (one component per traced cpu).
struct TracedSchedule {
    input_sched: Vec<Vec<ScheduleInputTracker>>,
    start2stop: Vec<BTreeSet<u64>>,
    all_sched: Vec<Vec<ScheduleOutputTracker>>,
    disk_ord2cpuid: Vec<u64>,
}

/// Decode the as-traced entries into cross-indexed form, applying the two
/// data-defect workarounds.  Component boundaries are recovered from cpu
/// changes; entries for unknown tids (filtered-out threads) are dropped.
fn read_traced_schedule(
    entries: &[CpuScheduleEntry],
    tid2input: &HashMap<Tid, InputIndex>,
    input_count: usize,
    max_outputs: Option<usize>,
) -> Result<TracedSchedule> {
    let mut traced = TracedSchedule {
        input_sched: vec![Vec::new(); input_count],
        start2stop: vec![BTreeSet::new(); input_count],
        all_sched: Vec::new(),
        disk_ord2cpuid: Vec::new(),
    };
    let mut cur_output = 0usize;
    let mut cur_cpu = u64::MAX;
    for entry in entries {
        if entry.cpu != cur_cpu {
            if cur_cpu != u64::MAX {
                cur_output += 1;
                if let Some(max) = max_outputs {
                    if cur_output >= max {
                        return Err(SchedulerError::InvalidParameter(
                            "as-traced schedule cpu count != output count".to_string(),
                        ));
                    }
                }
            }
            cur_cpu = entry.cpu;
            traced.disk_ord2cpuid.push(cur_cpu);
        }
        let Some(&input) = tid2input.get(&entry.thread) else {
            warn!("as-traced entry for unknown tid {}; dropping", entry.thread);
            continue;
        };
        if traced.all_sched.len() < cur_output + 1 {
            traced.all_sched.resize_with(cur_output + 1, Vec::new);
        }
        // A signal can arrive right after a prior timestamp with no
        // intervening instructions; such an entry adds nothing.
        if let Some(back) = traced.all_sched[cur_output].last() {
            if back.input == input && back.start_instruction == entry.start_instruction {
                trace!(
                    "output #{}: as-read segment #{} has no instructions: skipping",
                    cur_output,
                    traced.all_sched[cur_output].len() - 1
                );
                continue;
            }
        }
        traced.all_sched[cur_output].push(ScheduleOutputTracker {
            valid: true,
            input,
            start_instruction: entry.start_instruction,
            stop_instruction: 0,
            timestamp: entry.timestamp,
        });
        traced.start2stop[input].insert(entry.start_instruction);
        traced.input_sched[input].push(ScheduleInputTracker {
            output: cur_output,
            output_array_idx: traced.all_sched[cur_output].len() - 1,
            start_instruction: entry.start_instruction,
            timestamp: entry.timestamp,
        });
    }
    check_and_fix_modulo_problem(&mut traced, input_count)?;
    remove_zero_instruction_segments(&mut traced, input_count)?;
    Ok(traced)
}

/// Stored ordinals in some schedules are incorrectly modulo the chunk size.
/// A decreasing ordinal within 50% of the end of a default-sized chunk is
/// treated as a wrap and subsequent values for that input are shifted up.
/// A decrease not attributable to the wrap is a malformed schedule.
fn check_and_fix_modulo_problem(traced: &mut TracedSchedule, input_count: usize) -> Result<()> {
    // The actual instruction count per timestamp per input, keyed by
    // timestamp so the per-cpu walk can look it up.  Consecutive identical
    // timestamps in one input are not supported by this workaround.
    let mut timestamp2adjust: Vec<HashMap<u64, u64>> = vec![HashMap::new(); input_count];
    let mut found_wrap = false;
    for input_idx in 0..input_count {
        traced.input_sched[input_idx].sort_by_key(|s| s.timestamp);
        let mut prev_start = 0u64;
        let mut add_to_start = 0u64;
        let mut in_order = true;
        for sched in traced.input_sched[input_idx].iter_mut() {
            if sched.start_instruction < prev_start {
                if prev_start * 2 > DEFAULT_CHUNK_SIZE {
                    add_to_start += DEFAULT_CHUNK_SIZE;
                    if in_order {
                        debug!(
                            "working around modulo-wrapped ordinals for input #{}",
                            input_idx
                        );
                        in_order = false;
                        found_wrap = true;
                    }
                } else {
                    return Err(SchedulerError::InvalidParameter(
                        "invalid decreasing start field in schedule file".to_string(),
                    ));
                }
            }
            if timestamp2adjust[input_idx].contains_key(&sched.timestamp) {
                return Err(SchedulerError::InvalidParameter(
                    "same timestamps not supported for the modulo workaround".to_string(),
                ));
            }
            prev_start = sched.start_instruction;
            timestamp2adjust[input_idx]
                .insert(sched.timestamp, sched.start_instruction + add_to_start);
            sched.start_instruction += add_to_start;
        }
    }
    if !found_wrap {
        return Ok(());
    }
    for input_idx in 0..input_count {
        traced.start2stop[input_idx].clear();
        for &adjusted in timestamp2adjust[input_idx].values() {
            traced.start2stop[input_idx].insert(adjusted);
        }
    }
    for output_sched in traced.all_sched.iter_mut() {
        for segment in output_sched.iter_mut() {
            if !segment.valid {
                continue;
            }
            let Some(&adjusted) = timestamp2adjust[segment.input].get(&segment.timestamp)
            else {
                return Err(SchedulerError::InvalidParameter(
                    "failed to find timestamp for the modulo workaround".to_string(),
                ));
            };
            debug_assert!(adjusted >= segment.start_instruction);
            debug_assert_eq!(adjusted % DEFAULT_CHUNK_SIZE, segment.start_instruction);
            if adjusted != segment.start_instruction {
                trace!(
                    "adjusting input {} start from {} to {}",
                    segment.input,
                    segment.start_instruction,
                    adjusted
                );
            }
            segment.start_instruction = adjusted;
        }
    }
    Ok(())
}

/// Two entries with the same start ordinal on one input (no instructions
/// between two timestamps) cannot both be modeled with instruction-based
/// control points: the older one is dropped and the newer kept, as the newer
/// is the one bundled with actual instructions.
fn remove_zero_instruction_segments(
    traced: &mut TracedSchedule,
    input_count: usize,
) -> Result<()> {
    for input_idx in 0..input_count {
        traced.input_sched[input_idx].sort_by_key(|s| s.timestamp);
        let mut prev_start = 0u64;
        for i in 0..traced.input_sched[input_idx].len() {
            let start = traced.input_sched[input_idx][i].start_instruction;
            debug_assert!(start >= prev_start);
            if i > 0 && start == prev_start {
                debug!(
                    "dropping same-input={} same-start={} entry",
                    input_idx, start
                );
                let older = traced.input_sched[input_idx][i - 1];
                traced.all_sched[older.output][older.output_array_idx].valid = false;
            }
            prev_start = start;
        }
    }
    Ok(())
}

/// Translate a workload's times-of-interest into per-thread instruction
/// regions, interpolating over the as-traced schedule.  Threads the windows
/// fully cover are omitted; threads with no overlap get the parking sentinel
/// inside [`regions_from_times`].
pub(super) fn create_regions_from_times(
    as_traced: &CpuScheduleSource,
    all_tids: &HashMap<Tid, InputIndex>,
    input_count: usize,
    workload_tids: &BTreeMap<Tid, InputIndex>,
    times: &[TimeRange],
) -> Result<Vec<(Tid, Vec<InstrRange>)>> {
    let traced = read_traced_schedule(as_traced.entries(), all_tids, input_count, None)?;
    let mut interpolators: Vec<TimeInterpolator> =
        (0..input_count).map(|_| TimeInterpolator::default()).collect();
    for (input_idx, scheds) in traced.input_sched.iter().enumerate() {
        for sched in scheds {
            trace!(
                "as-read: input={} start={} time={}",
                input_idx,
                sched.start_instruction,
                sched.timestamp
            );
            interpolators[input_idx].insert(sched.timestamp, sched.start_instruction);
        }
    }
    let mut result = Vec::new();
    for (tid, &input_idx) in workload_tids {
        match regions_from_times(&interpolators[input_idx], times)? {
            // The windows cover the entire input: no restriction needed.
            None => {
                debug!("tid {} fully covered by times_of_interest", tid);
            }
            Some(regions) => {
                for range in &regions {
                    debug!(
                        "tid {} restricted to [{}, {}]",
                        tid, range.start_instruction, range.stop_instruction
                    );
                }
                result.push((*tid, regions));
            }
        }
    }
    Ok(result)
}

impl<R: TraceRecord, Rd: TraceReader<R>> Scheduler<R, Rd> {
    /// Load the previously recorded schedule, one component per output, and
    /// park each output on its first segment.
    pub(super) fn read_recorded_schedule(&mut self, reader: &ScheduleReader) -> Result<()> {
        // The whole schedule easily fits in memory; the archive format
        // exists so very long traces could do parallel incremental reads.
        for i in 0..self.outputs.len() {
            let name = component_name(i);
            let segments = reader.read_component(&name).map_err(|e| {
                SchedulerError::InvalidParameter(format!(
                    "failed to open schedule replay component {}: {}",
                    name, e
                ))
            })?;
            let mut replay = Vec::new();
            let mut saw_footer = false;
            for segment in segments {
                match segment.kind {
                    SegmentKind::Version => {
                        if segment.format_version() != SCHEDULE_VERSION_CURRENT {
                            return Err(SchedulerError::InvalidParameter(format!(
                                "unsupported schedule file version {}",
                                segment.format_version()
                            )));
                        }
                    }
                    SegmentKind::Footer => {
                        saw_footer = true;
                        break;
                    }
                    _ => replay.push(segment),
                }
            }
            if !saw_footer {
                return Err(SchedulerError::InvalidParameter(
                    "record file missing footer".to_string(),
                ));
            }
            debug!("read {} recorded segments for output #{}", replay.len(), i);
            self.outputs[i].replay = replay;
        }
        if reader.has_component(&component_name(self.outputs.len())) {
            return Err(SchedulerError::InvalidParameter(
                "not enough output streams for recorded file".to_string(),
            ));
        }
        for i in 0..self.outputs.len() {
            let first = self.outputs[i].replay.first().copied();
            let mut out = self.outputs[i].state.lock().unwrap();
            match first {
                None => {
                    debug!("output {} empty: returning eof up front", i);
                    self.set_cur_input(None, &mut out, None)?;
                    out.at_eof = true;
                    self.outputs[i].record_index.store(0, Ordering::Release);
                }
                Some(segment) if segment.kind == SegmentKind::Idle => {
                    self.set_cur_input(None, &mut out, None)?;
                    out.waiting = true;
                    // Updated on the first next_record().
                    out.wait_start_time = 0;
                    self.outputs[i].record_index.store(-1, Ordering::Release);
                    debug!("output {} starting out idle", i);
                }
                Some(segment) => {
                    debug_assert_eq!(segment.kind, SegmentKind::Default);
                    self.set_cur_input(None, &mut out, Some(segment.input as usize))?;
                    self.outputs[i].record_index.store(0, Ordering::Release);
                }
            }
        }
        Ok(())
    }

    /// Turn the as-traced per-cpu schedule into per-output replay segments:
    /// sort components by cpuid, fill in stop ordinals from each input's next
    /// start, and collapse adjacent same-input segments.
    pub(super) fn read_and_instantiate_traced_schedule(
        &mut self,
        as_traced: &CpuScheduleSource,
    ) -> Result<()> {
        let mut tid2input: HashMap<Tid, InputIndex> = HashMap::new();
        for input in &self.inputs {
            let input = input.lock().unwrap();
            tid2input.insert(input.tid, input.index);
        }
        let mut traced = read_traced_schedule(
            as_traced.entries(),
            &tid2input,
            self.inputs.len(),
            Some(self.outputs.len()),
        )?;
        // Sort by cpuid for a more natural ordering; many schedule files
        // already on disk are unsorted, so raw order cannot be trusted.
        let disk_count = traced.disk_ord2cpuid.len();
        let mut disk_ord2index: Vec<usize> = (0..disk_count).collect();
        disk_ord2index.sort_by_key(|&i| traced.disk_ord2cpuid[i]);
        // disk_ord2index[i] now holds the disk ordinal with the ith smallest
        // cpuid; invert it to map each disk ordinal to its output.
        let mut disk_ord2output = vec![0usize; disk_count];
        for (i, &disk) in disk_ord2index.iter().enumerate() {
            disk_ord2output[disk] = i;
        }
        for disk_idx in 0..self.outputs.len() {
            if disk_idx >= disk_count {
                debug!("output {} empty: returning eof up front", disk_idx);
                let mut out = self.outputs[disk_idx].state.lock().unwrap();
                out.at_eof = true;
                self.set_cur_input(None, &mut out, None)?;
                continue;
            }
            let output_idx = disk_ord2output[disk_idx];
            debug!(
                "read {} as-traced records for output #{} (cpu {})",
                traced.all_sched[disk_idx].len(),
                output_idx,
                traced.disk_ord2cpuid[disk_idx]
            );
            // Update the stop ordinal and collapse consecutive same-input
            // entries while inserting into the final location.
            let mut segments: Vec<ScheduleSegment> = Vec::new();
            let mut start_consec: Option<usize> = None;
            for sched_idx in 0..traced.all_sched[disk_idx].len() {
                let segment = traced.all_sched[disk_idx][sched_idx];
                if !segment.valid {
                    continue;
                }
                let stop = traced.start2stop[segment.input]
                    .range((segment.start_instruction + 1)..)
                    .next()
                    .copied()
                    .unwrap_or(u64::MAX);
                traced.all_sched[disk_idx][sched_idx].stop_instruction = stop;
                trace!(
                    "as-read segment #{}: input={} start={} stop={} time={}",
                    sched_idx,
                    segment.input,
                    segment.start_instruction,
                    stop,
                    segment.timestamp
                );
                let next = traced.all_sched[disk_idx].get(sched_idx + 1).copied();
                if let Some(next) = next.filter(|n| n.input == segment.input) {
                    if stop > next.start_instruction {
                        // A second sanity check.
                        return Err(SchedulerError::InvalidParameter(
                            "invalid decreasing start field in schedule file".to_string(),
                        ));
                    }
                    if stop == next.start_instruction {
                        // Collapse into the next entry.
                        if start_consec.is_none() {
                            start_consec = Some(sched_idx);
                        }
                        continue;
                    }
                }
                let first = start_consec.take().unwrap_or(sched_idx);
                let toadd = traced.all_sched[disk_idx][first];
                segments.push(ScheduleSegment {
                    kind: SegmentKind::Default,
                    input: toadd.input as i32,
                    start_instruction: toadd.start_instruction,
                    stop_instruction: stop,
                    timestamp: toadd.timestamp,
                });
                trace!(
                    "segment #{}: input={} start={} stop={} time={}",
                    segments.len() - 1,
                    toadd.input,
                    toadd.start_instruction,
                    stop,
                    toadd.timestamp
                );
            }
            debug!(
                "collapsed duplicates into {} as-traced records for output #{}",
                segments.len(),
                output_idx
            );
            if segments.is_empty() {
                return Err(SchedulerError::InvalidParameter(
                    "empty as-traced schedule".to_string(),
                ));
            }
            let first_segment = segments[0];
            self.outputs[output_idx].replay = segments;
            let mut out = self.outputs[output_idx].state.lock().unwrap();
            out.as_traced_cpuid = traced.disk_ord2cpuid[disk_idx] as i64;
            if first_segment.start_instruction != 0 {
                debug!("initial input for output #{} is: wait state", output_idx);
                self.set_cur_input(None, &mut out, None)?;
                out.waiting = true;
                self.outputs[output_idx]
                    .record_index
                    .store(-1, Ordering::Release);
            } else {
                debug!(
                    "initial input for output #{} is {}",
                    output_idx, first_segment.input
                );
                self.set_cur_input(None, &mut out, Some(first_segment.input as usize))?;
                self.outputs[output_idx]
                    .record_index
                    .store(0, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Follow the recorded segments for this output: idle for recorded idle
    /// periods, wait for lagging outputs, skip and synthesize ends where the
    /// recording says so, and otherwise hand out the recorded input.
    pub(super) fn pick_next_input_as_previously(
        &self,
        mut sched: Option<&mut SchedState>,
        out: &mut Output<R>,
    ) -> Result<(Option<InputIndex>, Pick)> {
        let slot = &self.outputs[out.index];
        let rec_idx = slot.record_index.load(Ordering::Acquire);
        if rec_idx + 1 >= slot.replay.len() as i64 {
            if !out.at_eof {
                out.at_eof = true;
                self.live_replay_output_count
                    .fetch_sub(1, Ordering::Release);
            }
            let cur = out.cur_input;
            let pick = self.eof_or_idle(out, sched, cur)?;
            return Ok((None, pick));
        }
        let segment = slot.replay[(rec_idx + 1) as usize];
        if segment.kind == SegmentKind::Idle {
            out.waiting = true;
            out.wait_start_time = out.cur_time;
            slot.record_index.store(rec_idx + 1, Ordering::Release);
            return Ok((None, Pick::Idle));
        }
        let index = segment.input as usize;
        trace!(
            "pick_next_input_as_previously[{}]: next replay segment in={} type={:?} \
             start={} end={}",
            out.index,
            index,
            segment.kind,
            segment.start_instruction,
            segment.stop_instruction
        );
        {
            let input = self.inputs[index].lock().unwrap();
            if input.instr_ordinal() > segment.start_instruction {
                warn!(
                    "next_record[{}]: input {} wants instr #{} but it is already at #{}",
                    out.index,
                    index,
                    segment.start_instruction,
                    input.instr_ordinal()
                );
            }
            if input.instr_ordinal() < segment.start_instruction
                // Don't wait for an ROI that starts at the beginning.
                && segment.start_instruction > 1
                // The output may have begun in the wait state.
                && (rec_idx == -1
                    // After a skip the separator and timestamp markers sit at
                    // the prior instruction ordinal: no wait for that.
                    || (slot.replay[rec_idx as usize].kind != SegmentKind::Skip
                        // No wait when only the end record is left.
                        && segment.kind != SegmentKind::SyntheticEnd))
            {
                // Another output has not advanced far enough, and an input
                // stream has only one position: wait and retry on the next
                // call.
                drop(input);
                trace!(
                    "next_record[{}]: waiting for input {} instr #{}",
                    out.index,
                    index,
                    segment.start_instruction
                );
                self.set_cur_input(sched.as_deref_mut(), out, None)?;
                out.waiting = true;
                return Ok((Some(index), Pick::Wait));
            }
        }
        // Also wait if this segment is ahead of the next-up segment on
        // another output.  One timestamp per context switch is all we have,
        // so finer-grained timing cannot be enforced.
        if self.options.deps == DependencyMode::Timestamps {
            for (i, other) in self.outputs.iter().enumerate() {
                if i == out.index {
                    continue;
                }
                let other_idx = other.record_index.load(Ordering::Acquire);
                if (other_idx + 1) < other.replay.len() as i64
                    && segment.timestamp > other.replay[(other_idx + 1) as usize].timestamp
                {
                    trace!(
                        "next_record[{}]: waiting because timestamp {} is ahead of output {}",
                        out.index,
                        segment.timestamp,
                        i
                    );
                    self.set_cur_input(sched.as_deref_mut(), out, None)?;
                    out.waiting = true;
                    return Ok((Some(index), Pick::Wait));
                }
            }
        }
        match segment.kind {
            SegmentKind::SyntheticEnd => {
                // Past the final region of interest: throw out any queued
                // candidate and insert a synthetic thread exit.  The queued
                // record still needs to be read, so stay on this entry.
                let mut input = self.inputs[index].lock().unwrap();
                input.clear_queue();
                let exit = R::thread_exit(input.tid);
                input.queue.push_back(exit);
                self.mark_input_eof(&mut input);
                debug!("early end for input {}", index);
                slot.record_index.store(rec_idx + 1, Ordering::Release);
                Ok((Some(index), Pick::Skipped))
            }
            SegmentKind::Skip => {
                let mut input = self.inputs[index].lock().unwrap();
                input.ensure_init()?;
                let cur_reader_instr = input.reader.instruction_ordinal();
                debug!(
                    "next_record[{}]: skipping from {} to {} in {} for schedule",
                    out.index,
                    cur_reader_instr,
                    segment.stop_instruction,
                    index
                );
                let res = self.skip_instructions_in(
                    &mut input,
                    segment.stop_instruction.saturating_sub(cur_reader_instr + 1),
                )?;
                // Bump the region so window markers carry ordinals.
                input.cur_region += 1;
                if res != Pick::Skipped {
                    return Err(SchedulerError::Invalid(
                        "replay skip failed to advance".to_string(),
                    ));
                }
                // Done with the skip: move to and past it.
                slot.record_index.store(rec_idx + 2, Ordering::Release);
                Ok((Some(index), Pick::Skipped))
            }
            _ => {
                trace!(
                    "next_record[{}]: advancing to input {} instr #{}",
                    out.index,
                    index,
                    segment.start_instruction
                );
                slot.record_index.store(rec_idx + 1, Ordering::Release);
                Ok((Some(index), Pick::Ok))
            }
        }
    }
}
