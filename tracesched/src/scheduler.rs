/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The scheduler proper: maps inputs onto outputs one record at a time.
//!
//! Lock order, to avoid deadlock:
//! 1. The output's own state lock (only ever taken by its driving thread).
//! 2. The scheduler-wide lock (ready/unscheduled queues, blocked count).
//!    Taken only for dynamic and replay mappings; consistent mapping is
//!    lock-free on the hot path.
//! 3. A per-input lock.  Never two input locks at once.
//!
//! Replay segment lists are immutable after init and the replay cursor is an
//! atomic, so cross-output timestamp waits read them without touching another
//! output's state lock.

mod replay;
pub mod runqueue;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::time::Instant;

use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use tracesched_model::schedule::component_name;
use tracesched_model::schedule::SCHEDULE_VERSION_CURRENT;
use tracesched_model::DependencyMode;
use tracesched_model::InputIndex;
use tracesched_model::MappingMode;
use tracesched_model::MarkerKind;
use tracesched_model::OutputIndex;
use tracesched_model::QuantumUnit;
use tracesched_model::ScheduleSegment;
use tracesched_model::ScheduleStat;
use tracesched_model::SchedulerOptions;
use tracesched_model::SegmentKind;
use tracesched_model::SwitchKind;
use tracesched_model::Tid;
use tracesched_model::TraceRecord;
use tracesched_model::WorkloadIndex;

use crate::discovery::discover_trace_files;
use crate::discovery::Workload;
use crate::error::Result;
use crate::error::SchedulerError;
use crate::input::Input;
use crate::output::Output;
use crate::reader::ReaderFactory;
use crate::reader::TraceReader;
use crate::reader::TRACE_VERSION_FREQUENT_TIMESTAMPS;
use crate::schedule_file::CpuScheduleSource;
use crate::schedule_file::ScheduleReader;
use crate::schedule_file::ScheduleWriter;
use crate::speculator::NopSpeculator;
use crate::switch_sequence::read_switch_sequences;
use runqueue::RunQueue;

/// What a call to [`Scheduler::next_record`] produced.
#[derive(PartialEq, Debug, Eq, Clone)]
pub enum NextRecord<R> {
    /// One record, at most, per call.
    Record(R),
    /// Another output has not advanced far enough; call again.
    Wait,
    /// Nothing is runnable right now (or this output is inactive).
    Idle,
    /// This output is finished.
    Eof,
}

/// Internal dispatch status.  `Skipped` never escapes to consumers; the
/// engine loops on it.
#[derive(PartialEq, Debug, Eq, Copy, Clone)]
pub(crate) enum Pick {
    Ok,
    Skipped,
    Wait,
    Idle,
    Eof,
}

impl Pick {
    fn into_next<R>(self) -> NextRecord<R> {
        match self {
            Pick::Wait => NextRecord::Wait,
            Pick::Idle => NextRecord::Idle,
            Pick::Eof => NextRecord::Eof,
            Pick::Ok | Pick::Skipped => {
                unreachable!("internal statuses never reach consumers")
            }
        }
    }
}

/// Streams and factories handed to the scheduler at construction.
pub struct SchedulerIo<R: TraceRecord, Rd: TraceReader<R>> {
    /// Record the schedule here for later replay.
    pub schedule_record: Option<ScheduleWriter>,
    /// Replay this previously recorded schedule (`MappingMode::AsPreviously`).
    pub schedule_replay: Option<ScheduleReader>,
    /// The as-traced per-cpu schedule, for `MappingMode::ToRecordedOutput`
    /// with multiple outputs and for times-of-interest resolution.
    pub replay_as_traced: Option<CpuScheduleSource>,
    /// Kernel context-switch sequences to inject at input transitions.
    pub kernel_switch_reader: Option<Rd>,
    /// Opens readers for path-based workloads.
    pub reader_factory: Option<Box<dyn ReaderFactory<R, Reader = Rd>>>,
}

impl<R: TraceRecord, Rd: TraceReader<R>> Default for SchedulerIo<R, Rd> {
    fn default() -> Self {
        SchedulerIo {
            schedule_record: None,
            schedule_replay: None,
            replay_as_traced: None,
            kernel_switch_reader: None,
            reader_factory: None,
        }
    }
}

/// State behind the scheduler-wide lock.
#[derive(Debug)]
pub(crate) struct SchedState {
    pub ready: RunQueue,
    pub unscheduled: RunQueue,
    /// Entries in `ready` whose blocked time has not elapsed.
    pub num_blocked: usize,
}

/// One output plus the replay state other outputs may inspect.
pub(crate) struct OutputSlot<R> {
    pub state: Mutex<Output<R>>,
    /// Immutable after init.
    pub replay: Vec<ScheduleSegment>,
    /// Index of the segment currently executing; -1 before the first.
    /// Written by the owning output under the scheduler lock, read by peers
    /// for cross-output timestamp waits.
    pub record_index: AtomicI64,
}

/// Process-local monotonic clock, used for recorded timestamps and replay
/// idle durations.  Never returns 0, which means "unset" elsewhere.
pub(crate) fn wall_time_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64 + 1
}

/// The trace scheduler.  Generic over the record shape and reader; all
/// methods other than construction take `&self` so outputs can be driven
/// from independent threads.
pub struct Scheduler<R: TraceRecord, Rd: TraceReader<R>> {
    options: SchedulerOptions,
    pub(crate) inputs: Vec<Mutex<Input<R, Rd>>>,
    pub(crate) outputs: Vec<OutputSlot<R>>,
    sched: Mutex<SchedState>,
    pub(crate) tid2input: HashMap<(WorkloadIndex, Tid), InputIndex>,
    pub(crate) live_input_count: AtomicI64,
    pub(crate) live_replay_output_count: AtomicI64,
    switch_sequences: BTreeMap<SwitchKind, Vec<R>>,
    schedule_writer: Option<Mutex<ScheduleWriter>>,
    record_enabled: bool,
    as_traced_replay: bool,
    speculator: NopSpeculator,
}

impl<R: TraceRecord, Rd: TraceReader<R>> Scheduler<R, Rd> {
    /// Build a scheduler over `workloads`, feeding `output_count` outputs.
    /// Validation problems are fatal here; nothing is retried later.
    pub fn new(
        mut workloads: Vec<Workload<Rd>>,
        output_count: usize,
        mut options: SchedulerOptions,
        mut io: SchedulerIo<R, Rd>,
    ) -> Result<Self> {
        options
            .normalize_legacy_fields()
            .map_err(SchedulerError::InvalidParameter)?;
        if output_count == 0 {
            return Err(SchedulerError::InvalidParameter(
                "output_count must be > 0".to_string(),
            ));
        }
        if options.mapping == MappingMode::AsPreviously && io.schedule_replay.is_none() {
            return Err(SchedulerError::InvalidParameter(
                "replay mapping requires a schedule replay stream".to_string(),
            ));
        }
        if options.mapping != MappingMode::AsPreviously && io.schedule_replay.is_some() {
            return Err(SchedulerError::InvalidParameter(
                "schedule replay stream requires replay mapping".to_string(),
            ));
        }

        let mut inputs: Vec<Input<R, Rd>> = Vec::new();
        let mut tid2input: HashMap<(WorkloadIndex, Tid), InputIndex> = HashMap::new();
        let mut workload2inputs: Vec<Vec<InputIndex>> = vec![Vec::new(); workloads.len()];

        for (workload_idx, workload) in workloads.iter_mut().enumerate() {
            if !workload.only_threads.is_empty() && !workload.only_shards.is_empty() {
                return Err(SchedulerError::InvalidParameter(
                    "only_threads and only_shards cannot be combined".to_string(),
                ));
            }
            let mut unfiltered_tids: BTreeSet<Tid> = BTreeSet::new();
            let mut input_count = 0usize;
            let mut workload_tid2input: BTreeMap<Tid, InputIndex> = BTreeMap::new();

            if let Some(path) = workload.path.clone() {
                if !workload.readers.is_empty() {
                    return Err(SchedulerError::InvalidParameter(
                        "a workload takes a path or explicit readers, not both".to_string(),
                    ));
                }
                let factory = io.reader_factory.as_ref().ok_or_else(|| {
                    SchedulerError::InvalidParameter(
                        "path workloads require a reader factory".to_string(),
                    )
                })?;
                let files = if path.is_dir() {
                    discover_trace_files(&path)?
                } else {
                    vec![path]
                };
                for (shard_idx, file) in files.iter().enumerate() {
                    let mut reader = factory.open(file)?;
                    reader.init()?;
                    // We need the tid up front.  Rather than assume it is
                    // still part of the filename, read until a record
                    // carries it, queueing what we pass over.
                    let mut queued: VecDeque<R> = VecDeque::new();
                    let mut tid = None;
                    while !reader.at_end() {
                        let record = reader.record().clone();
                        if let Some(t) = record.tid() {
                            tid = Some(t);
                            break;
                        }
                        queued.push_back(record);
                        reader.advance();
                    }
                    let Some(tid) = tid else {
                        return Err(SchedulerError::FileRead(format!(
                            "failed to read {}",
                            file.display()
                        )));
                    };
                    unfiltered_tids.insert(tid);
                    input_count += 1;
                    if !workload.only_threads.is_empty()
                        && !workload.only_threads.contains(&tid)
                    {
                        continue;
                    }
                    if !workload.only_shards.is_empty()
                        && !workload.only_shards.contains(&shard_idx)
                    {
                        continue;
                    }
                    debug!("opened reader for tid {} {}", tid, file.display());
                    let index = inputs.len();
                    let mut input = Input::new(index, tid, workload_idx, reader);
                    input.needs_init = false;
                    input.queue = queued;
                    inputs.push(input);
                    workload_tid2input.insert(tid, index);
                    workload2inputs[workload_idx].push(index);
                    tid2input.insert((workload_idx, tid), index);
                }
            } else {
                if workload.readers.is_empty() {
                    return Err(SchedulerError::InvalidParameter(
                        "a workload needs a path or explicit readers".to_string(),
                    ));
                }
                input_count = workload.readers.len();
                let readers = std::mem::take(&mut workload.readers);
                for (shard_idx, reader_input) in readers.into_iter().enumerate() {
                    unfiltered_tids.insert(reader_input.tid);
                    if !workload.only_threads.is_empty()
                        && !workload.only_threads.contains(&reader_input.tid)
                    {
                        continue;
                    }
                    if !workload.only_shards.is_empty()
                        && !workload.only_shards.contains(&shard_idx)
                    {
                        continue;
                    }
                    let index = inputs.len();
                    let input = Input::new(
                        index,
                        reader_input.tid,
                        workload_idx,
                        reader_input.reader,
                    );
                    inputs.push(input);
                    workload_tid2input.insert(reader_input.tid, index);
                    workload2inputs[workload_idx].push(index);
                    tid2input.insert((workload_idx, reader_input.tid), index);
                }
            }

            for ord in &workload.only_shards {
                if *ord >= input_count {
                    return Err(SchedulerError::InvalidParameter(format!(
                        "only_shards entry {} out of bounds for a shard ordinal",
                        ord
                    )));
                }
            }
            for tid in &workload.only_threads {
                if !unfiltered_tids.contains(tid) {
                    return Err(SchedulerError::InvalidParameter(format!(
                        "only_threads entry {} not found in workload inputs",
                        tid
                    )));
                }
            }

            if !workload.times_of_interest.is_empty() {
                for modifier in &workload.thread_modifiers {
                    if !modifier.regions_of_interest.is_empty() {
                        // Mixing with other ROI specifiers is not supported.
                        return Err(SchedulerError::InvalidParameter(
                            "times_of_interest cannot be combined with \
                             regions_of_interest"
                                .to_string(),
                        ));
                    }
                }
                let as_traced = io.replay_as_traced.take().ok_or_else(|| {
                    SchedulerError::InvalidParameter(
                        "times_of_interest requires an as-traced schedule".to_string(),
                    )
                })?;
                let mut all_tids: HashMap<Tid, InputIndex> = HashMap::new();
                for input in &inputs {
                    all_tids.insert(input.tid, input.index);
                }
                let derived = replay::create_regions_from_times(
                    &as_traced,
                    &all_tids,
                    inputs.len(),
                    &workload_tid2input,
                    &workload.times_of_interest,
                )?;
                for (tid, regions) in derived {
                    let mut modifier = tracesched_model::ThreadModifier::regions(regions);
                    modifier.tids.push(tid);
                    workload.thread_modifiers.push(modifier);
                }
            }

            for modifier in &workload.thread_modifiers {
                let which_tids: Vec<Tid> = if modifier.tids.is_empty() {
                    // Apply to all tids that have not already been modified.
                    workload_tid2input
                        .iter()
                        .filter(|(_tid, idx)| !inputs[**idx].has_modifier)
                        .map(|(tid, _idx)| *tid)
                        .collect()
                } else {
                    modifier.tids.clone()
                };
                for tid in which_tids {
                    let Some(&index) = workload_tid2input.get(&tid) else {
                        return Err(SchedulerError::InvalidParameter(format!(
                            "thread modifier tid {} not found in workload",
                            tid
                        )));
                    };
                    let input = &mut inputs[index];
                    input.has_modifier = true;
                    input.binding = modifier.output_binding.clone();
                    input.priority = modifier.priority;
                    for (i, range) in modifier.regions_of_interest.iter().enumerate() {
                        trace!(
                            "ROI #{} for input {}: [{}, {})",
                            i,
                            index,
                            range.start_instruction,
                            range.stop_instruction
                        );
                        if range.start_instruction == 0
                            || (range.stop_instruction < range.start_instruction
                                && range.stop_instruction != 0)
                        {
                            return Err(SchedulerError::InvalidParameter(
                                "invalid region of interest bounds".to_string(),
                            ));
                        }
                        if i == 0 {
                            continue;
                        }
                        if range.start_instruction
                            <= modifier.regions_of_interest[i - 1].stop_instruction
                        {
                            return Err(SchedulerError::InvalidParameter(
                                "gap required between regions of interest".to_string(),
                            ));
                        }
                    }
                    input.regions_of_interest = modifier.regions_of_interest.clone();
                }
            }
        }

        let record_enabled = io.schedule_record.is_some();
        let mut outputs: Vec<OutputSlot<R>> = Vec::with_capacity(output_count);
        for i in 0..output_count {
            let mut out = Output::new(i);
            if record_enabled {
                out.recorded.push(ScheduleSegment::version(
                    SCHEDULE_VERSION_CURRENT,
                    wall_time_micros(),
                ));
            }
            outputs.push(OutputSlot {
                state: Mutex::new(out),
                replay: Vec::new(),
                record_index: AtomicI64::new(0),
            });
        }
        info!("{} inputs, {} outputs", inputs.len(), output_count);

        let switch_sequences = match io.kernel_switch_reader.as_mut() {
            Some(reader) => read_switch_sequences(reader)?,
            None => BTreeMap::new(),
        };

        let rand_seed = options.rand_seed;
        let live_input_count = AtomicI64::new(inputs.len() as i64);
        let mut scheduler = Scheduler {
            options,
            inputs: inputs.into_iter().map(Mutex::new).collect(),
            outputs,
            sched: Mutex::new(SchedState {
                ready: RunQueue::new(rand_seed),
                unscheduled: RunQueue::new(rand_seed.wrapping_add(1)),
                num_blocked: 0,
            }),
            tid2input,
            live_input_count,
            live_replay_output_count: AtomicI64::new(0),
            switch_sequences,
            schedule_writer: io.schedule_record.take().map(Mutex::new),
            record_enabled,
            as_traced_replay: false,
            speculator: NopSpeculator,
        };
        scheduler.set_initial_schedule(&workload2inputs, &mut io)?;
        Ok(scheduler)
    }

    fn need_sched_lock(&self) -> bool {
        matches!(
            self.options.mapping,
            MappingMode::ToAnyOutput | MappingMode::AsPreviously
        )
    }

    fn lock_sched(&self) -> Option<MutexGuard<'_, SchedState>> {
        if self.need_sched_lock() {
            Some(self.sched.lock().unwrap())
        } else {
            None
        }
    }

    // Initial schedule:
    // =========================================================================

    fn set_initial_schedule(
        &mut self,
        workload2inputs: &[Vec<InputIndex>],
        io: &mut SchedulerIo<R, Rd>,
    ) -> Result<()> {
        // Determine whether to read ahead in the inputs.  We avoid it where
        // we can: it would block forever on sources that are not available
        // yet, and it complicates ordinals.
        let gather_timestamps = (matches!(
            self.options.mapping,
            MappingMode::AsPreviously | MappingMode::ToAnyOutput
        ) && self.options.deps == DependencyMode::Timestamps)
            || (self.options.mapping == MappingMode::ToRecordedOutput
                && io.replay_as_traced.is_none()
                && self.inputs.len() > 1);
        if gather_timestamps && !self.options.read_inputs_in_init {
            return Err(SchedulerError::InvalidParameter(
                "timestamp dependencies require read_inputs_in_init".to_string(),
            ));
        }
        // The filetype, if present, is before the first timestamp; if we only
        // need the filetype we avoid going as far as the timestamp.
        if self.options.read_inputs_in_init || gather_timestamps {
            self.get_initial_input_content(gather_timestamps)?;
        }

        match self.options.mapping {
            MappingMode::AsPreviously => {
                self.live_replay_output_count
                    .store(self.outputs.len() as i64, Ordering::Release);
                let reader = io.schedule_replay.take().ok_or_else(|| {
                    SchedulerError::InvalidParameter(
                        "replay mapping requires a schedule replay stream".to_string(),
                    )
                })?;
                self.read_recorded_schedule(&reader)?;
            }
            MappingMode::ToConsistentOutput => {
                // Assign the inputs up front to avoid locks in parallel mode:
                // a simple round-robin static partition.
                for i in 0..self.inputs.len() {
                    let output_idx = i % self.outputs.len();
                    let mut out = self.outputs[output_idx].state.lock().unwrap();
                    if out.input_indices.is_empty() {
                        self.set_cur_input(None, &mut out, Some(i))?;
                    }
                    out.input_indices.push(i);
                    debug!("assigning input #{} to output #{}", i, output_idx);
                }
            }
            MappingMode::ToRecordedOutput => {
                if let Some(as_traced) = io.replay_as_traced.take() {
                    self.read_and_instantiate_traced_schedule(&as_traced)?;
                    // Now leverage the regular replay code.
                    self.options.mapping = MappingMode::AsPreviously;
                    self.as_traced_replay = true;
                    self.live_replay_output_count
                        .store(self.outputs.len() as i64, Ordering::Release);
                } else if self.outputs.len() > 1 {
                    return Err(SchedulerError::InvalidParameter(
                        "as-traced mapping with multiple outputs requires the \
                         as-traced schedule stream"
                            .to_string(),
                    ));
                } else if self.inputs.len() == 1 {
                    let mut out = self.outputs[0].state.lock().unwrap();
                    self.set_cur_input(None, &mut out, Some(0))?;
                } else {
                    // Start directly with the oldest timestamp's input; the
                    // queued headers of the others are presented when they
                    // are scheduled.
                    let mut min_time = u64::MAX;
                    let mut min_input = None;
                    for (i, input) in self.inputs.iter().enumerate() {
                        let input = input.lock().unwrap();
                        if input.next_timestamp > 0 && input.next_timestamp < min_time {
                            min_time = input.next_timestamp;
                            min_input = Some(i);
                        }
                    }
                    let min_input = min_input.ok_or_else(|| {
                        SchedulerError::InvalidParameter(
                            "no input timestamps for as-traced ordering".to_string(),
                        )
                    })?;
                    let mut out = self.outputs[0].state.lock().unwrap();
                    self.set_cur_input(None, &mut out, Some(min_input))?;
                }
            }
            MappingMode::ToAnyOutput => {
                if self.options.deps == DependencyMode::Timestamps {
                    // Compute the min timestamp (== base_timestamp) per
                    // workload so the queue can order inputs by relative time.
                    for input_indices in workload2inputs {
                        let mut min_time = u64::MAX;
                        for &i in input_indices {
                            let input = self.inputs[i].lock().unwrap();
                            if input.next_timestamp < min_time {
                                min_time = input.next_timestamp;
                            }
                        }
                        if min_time == u64::MAX {
                            return Err(SchedulerError::InvalidParameter(
                                "missing timestamps for dependency ordering".to_string(),
                            ));
                        }
                        for &i in input_indices {
                            let mut input = self.inputs[i].lock().unwrap();
                            trace!(
                                "input {} base_timestamp {} next_timestamp {}",
                                i,
                                min_time,
                                input.next_timestamp
                            );
                            input.base_timestamp = min_time;
                            input.order_by_timestamp = true;
                        }
                    }
                }
                // Queue everything, then hand the front of the queue to each
                // output, honoring bindings and time ordering.
                let mut sched_guard = self.sched.lock().unwrap();
                for i in 0..self.inputs.len() {
                    let mut input = self.inputs[i].lock().unwrap();
                    self.add_to_ready_queue(&mut sched_guard, &mut input);
                }
                for output_idx in 0..self.outputs.len() {
                    let mut out = self.outputs[output_idx].state.lock().unwrap();
                    let cur_time = out.cur_time;
                    let (queue_next, _status) =
                        self.pop_from_ready_queue(&mut sched_guard, output_idx, cur_time);
                    self.set_cur_input(Some(&mut sched_guard), &mut out, queue_next)?;
                }
            }
        }
        Ok(())
    }

    /// Keep-reading predicate for the init-time readahead.  Also identifies
    /// threads that should start out unscheduled because tracing attached in
    /// the middle of an unschedule syscall: that marker *before* any
    /// instruction is the initial exit from such a call.
    fn process_next_initial_record(
        &self,
        input: &mut Input<R, Rd>,
        record: &R,
        found_filetype: &mut bool,
        found_timestamp: &mut bool,
    ) -> bool {
        if record.is_invalid() {
            return true;
        }
        if record.is_non_marker_header() {
            return true;
        }
        let Some((kind, _value)) = record.as_marker() else {
            trace!("stopping initial readahead at non-marker");
            return false;
        };
        if kind == MarkerKind::Filetype {
            *found_filetype = true;
        } else if let Some(timestamp) = record.timestamp() {
            if !*found_timestamp {
                // next_timestamp must be the first timestamp, even when we
                // read ahead.
                input.next_timestamp = timestamp;
                *found_timestamp = true;
            } else {
                trace!("stopping initial readahead at 2nd timestamp");
                return false;
            }
        } else if kind == MarkerKind::SyscallUnschedule {
            if self.options.honor_direct_switches
                && self.options.mapping != MappingMode::AsPreviously
            {
                input.unscheduled = true;
                // Ignore this marker during regular processing.
                input.skip_next_unscheduled = true;
            }
            return false;
        }
        true
    }

    /// Read ahead in each input until the filetype (and first timestamp when
    /// requested) is known, queueing the records we pass over.
    fn get_initial_input_content(&mut self, gather_timestamps: bool) -> Result<()> {
        debug!(
            "reading headers from inputs to find filetypes{}",
            if gather_timestamps { " and timestamps" } else { "" }
        );
        for input_idx in 0..self.inputs.len() {
            let mut guard = self.inputs[input_idx].lock().unwrap();
            let input = &mut *guard;

            // If the input jumps to the middle immediately, do that now so
            // we will have the proper start timestamp.
            if !input.regions_of_interest.is_empty()
                && self.options.mapping != MappingMode::AsPreviously
            {
                let mut record = R::invalid();
                let res = self.advance_region_of_interest(None, &mut record, input)?;
                if res == Pick::Skipped {
                    input.next_timestamp = input.reader.last_timestamp();
                    // The filetype will be there in the stream.
                    continue;
                }
                if res != Pick::Ok {
                    warn!("failed to advance initial region of interest");
                    return Err(SchedulerError::RangeInvalid(
                        "failed to advance initial region of interest".to_string(),
                    ));
                }
            }

            let mut found_filetype = false;
            let mut found_timestamp = !gather_timestamps || input.next_timestamp > 0;
            // First, check any queued records.
            for i in 0..input.queue.len() {
                let record = input.queue[i].clone();
                if !self.process_next_initial_record(
                    input,
                    &record,
                    &mut found_filetype,
                    &mut found_timestamp,
                ) {
                    break;
                }
            }
            if input.next_timestamp > 0 {
                found_timestamp = true;
            }
            // If the targets were not in the queue, request new records.
            input.ensure_init()?;
            while !input.reader.at_end() {
                let record = input.reader.record().clone();
                if !self.process_next_initial_record(
                    input,
                    &record,
                    &mut found_filetype,
                    &mut found_timestamp,
                ) {
                    break;
                }
                // Don't go too far if only looking for the filetype: legacy
                // traces have none and we would reach the first instruction,
                // which causes ordinal trouble.  Exit with a 0 filetype.
                if !found_filetype
                    && (record.timestamp().is_some()
                        || matches!(record.as_marker(), Some((MarkerKind::PageSize, _))))
                {
                    debug!("no filetype found: assuming synthetic input");
                    found_filetype = true;
                    if !gather_timestamps {
                        break;
                    }
                }
                // An instruction this early means a malformed or synthetic
                // trace with no timestamp; do not read further.
                if record.is_instruction() {
                    break;
                }
                input.queue.push_back(record);
                input.reader.advance();
            }
            if gather_timestamps && input.next_timestamp == 0 {
                return Err(SchedulerError::InvalidParameter(format!(
                    "input {} has no initial timestamp",
                    input_idx
                )));
            }
        }
        Ok(())
    }

    // Queues:
    // =========================================================================

    fn add_to_unscheduled_queue(&self, sched: &mut SchedState, input: &Input<R, Rd>) {
        debug_assert!(input.unscheduled && input.blocked_time == 0);
        trace!(
            "add_to_unscheduled_queue (pre-size {}): input {} priority {}",
            sched.unscheduled.len(),
            input.index,
            input.priority
        );
        sched.unscheduled.push(input.index, input.priority, 0);
    }

    fn add_to_ready_queue(&self, sched: &mut SchedState, input: &mut Input<R, Rd>) {
        if input.unscheduled && input.blocked_time == 0 {
            self.add_to_unscheduled_queue(sched, input);
            return;
        }
        trace!(
            "add_to_ready_queue (pre-size {}): input {} priority {} delta {} block time {}",
            sched.ready.len(),
            input.index,
            input.priority,
            input.timestamp_delta(),
            input.blocked_time
        );
        if input.blocked_time > 0 {
            sched.num_blocked += 1;
        }
        sched
            .ready
            .push(input.index, input.priority, input.timestamp_delta());
    }

    /// Pop the best input this output may run.  Binding-incompatible entries
    /// are re-inserted with their old keys to preserve FIFO; still-blocked
    /// entries go to the back.  With only blocked entries left the caller
    /// should idle and retry rather than report EOF.
    fn pop_from_ready_queue(
        &self,
        sched: &mut SchedState,
        for_output: OutputIndex,
        output_time: u64,
    ) -> (Option<InputIndex>, Pick) {
        let mut skipped = Vec::new();
        let mut blocked = Vec::new();
        let mut result = None;
        let mut status = Pick::Ok;
        // Blocked inputs have no interrupt to wake them; elapsed time is only
        // checked when they would be chosen to run.
        let cur_time = if sched.num_blocked > 0 { output_time } else { 0 };
        loop {
            let popped = if self.options.randomize_next_input {
                sched.ready.pop_random()
            } else {
                sched.ready.pop()
            };
            let Some((index, key)) = popped else { break };
            let mut input = self.inputs[index].lock().unwrap();
            debug_assert!(!input.unscheduled || input.blocked_time > 0);
            if input.binding.is_empty() || input.binding.contains(&for_output) {
                if input.blocked_time > 0 {
                    debug_assert!(cur_time > 0);
                    sched.num_blocked -= 1;
                    if cur_time.saturating_sub(input.blocked_start_time) < input.blocked_time {
                        trace!(
                            "pop queue: {} still blocked for {}",
                            index,
                            input.blocked_time - (cur_time - input.blocked_start_time)
                        );
                        blocked.push(index);
                        continue;
                    }
                }
                input.blocked_time = 0;
                input.unscheduled = false;
                result = Some(index);
                break;
            }
            skipped.push((index, key));
        }
        if result.is_none() && !blocked.is_empty() {
            // Do not hand out EOF thinking we're done: inputs are still
            // blocked on i/o, so wait and retry.
            status = Pick::Idle;
        }
        for (index, key) in skipped {
            sched.ready.reinsert(index, key);
        }
        for index in blocked {
            let mut input = self.inputs[index].lock().unwrap();
            self.add_to_ready_queue(sched, &mut input);
        }
        if let Some(index) = result {
            trace!(
                "pop_from_ready_queue[{}] (post-size {}): input {}",
                for_output,
                sched.ready.len(),
                index
            );
        }
        (result, status)
    }

    // Blocking model:
    // =========================================================================

    fn scale_blocked_time(&self, initial_time: u64) -> u64 {
        let mut scaled_us = initial_time as f64 * self.options.block_time_multiplier;
        if scaled_us > self.options.block_time_max_us as f64 {
            // A cap so outlier latencies of a second or more do not scale to
            // tens of minutes and dominate the simulation.
            scaled_us = self.options.block_time_max_us as f64;
        }
        (scaled_us * self.options.time_units_per_us) as u64
    }

    /// Decide whether the just-completed syscall blocks, and the modeled
    /// block time if it does.
    fn syscall_incurs_switch(&self, input: &Input<R, Rd>) -> (bool, u64) {
        debug_assert!(input.processing_syscall || input.processing_maybe_blocking_syscall);
        if input.reader.version() < TRACE_VERSION_FREQUENT_TIMESTAMPS {
            // A legacy trace without timestamps bracketing syscalls: switch
            // on every maybe-blocking syscall with a simplified model using
            // the threshold as the block time.
            return (
                input.processing_maybe_blocking_syscall,
                self.options.blocking_switch_threshold,
            );
        }
        let post_time = input.reader.last_timestamp();
        debug_assert!(input.pre_syscall_timestamp > 0);
        let latency = post_time.saturating_sub(input.pre_syscall_timestamp);
        let threshold = if input.processing_maybe_blocking_syscall {
            self.options.blocking_switch_threshold
        } else {
            self.options.syscall_switch_threshold
        };
        let blocked_time = self.scale_blocked_time(latency);
        trace!(
            "input {} {}syscall latency {} * scale {} => blocked time {}",
            input.index,
            if input.processing_maybe_blocking_syscall {
                "maybe-blocking "
            } else {
                ""
            },
            latency,
            self.options.block_time_multiplier,
            blocked_time
        );
        (latency >= threshold, blocked_time)
    }

    // Current-input transitions:
    // =========================================================================

    /// Make `new_input` current on `out`, releasing any prior input to the
    /// pool and handling segment recording, header initialization, and
    /// kernel-switch injection.
    fn set_cur_input(
        &self,
        mut sched: Option<&mut SchedState>,
        out: &mut Output<R>,
        new_input: Option<InputIndex>,
    ) -> Result<()> {
        let prev_input = out.cur_input;
        if let Some(prev_idx) = prev_input {
            if self.options.mapping == MappingMode::ToAnyOutput && prev_input != new_input {
                let mut prev = self.inputs[prev_idx].lock().unwrap();
                if !prev.at_eof {
                    let sched = sched
                        .as_deref_mut()
                        .expect("dynamic mapping holds the scheduler lock");
                    self.add_to_ready_queue(sched, &mut prev);
                }
            }
            if prev_input != new_input && self.record_enabled {
                let mut prev = self.inputs[prev_idx].lock().unwrap();
                self.close_schedule_segment(out, Some(&mut prev))?;
            }
        } else if self.record_enabled
            && out.recorded.last().map(|s| s.kind) == Some(SegmentKind::Idle)
        {
            self.close_schedule_segment(out, None)?;
        }
        if out.cur_input.is_some() {
            out.prev_input = out.cur_input;
        }
        out.cur_input = new_input;
        let Some(new_idx) = new_input else {
            return Ok(());
        };
        if prev_input == new_input {
            return Ok(());
        }

        let prev_workload = match out.prev_input {
            Some(p) if Some(p) != new_input => {
                Some(self.inputs[p].lock().unwrap().workload)
            }
            _ => None,
        };

        let mut input = self.inputs[new_idx].lock().unwrap();

        if let Some(prev_output) = input.prev_output {
            if prev_output != out.index {
                debug!(
                    "output[{}] migrating input {} from output {}",
                    out.index, new_idx, prev_output
                );
                out.bump_stat(ScheduleStat::Migrations);
            }
        }
        input.prev_output = Some(out.index);

        if prev_input.is_none() && out.version == 0 {
            // Set the header state up front so the consumer can query it at
            // init time, including after a skip for a region of interest.
            out.version = input.reader.version();
            out.last_timestamp = input.reader.last_timestamp();
            out.first_timestamp = input.reader.first_timestamp();
            out.filetype = input.reader.filetype();
            out.cache_line_size = input.reader.cache_line_size();
            out.chunk_instr_count = input.reader.chunk_instr_count();
            out.page_size = input.reader.page_size();
        }

        if let Some(pid) = input.pid {
            // Raw streams need explicit tid,pid records so a decoder sees the
            // new context; we insert at the front, so reverse order.
            for header in R::switch_context_headers(input.tid, pid).into_iter().rev() {
                input.queue.push_front(header);
            }
        }

        if !self.switch_sequences.is_empty() && out.instr_count > 0 {
            let switch_kind = if prev_workload.is_some() && prev_workload != Some(input.workload)
            {
                SwitchKind::Process
            } else {
                SwitchKind::Thread
            };
            // Inject kernel context switch code.  The records belong to this
            // input (the kernel acts on its behalf) so they go into its
            // queue, ahead of prior items: walk in reverse for the
            // push_front calls.  Tids are rewritten to match; the records
            // are synthetic and do not affect input ordinals.
            if let Some(sequence) = self.switch_sequences.get(&switch_kind) {
                for record in sequence.iter().rev() {
                    let mut record = record.clone();
                    record.set_tid(input.tid);
                    input.queue.push_front(record);
                }
                debug!(
                    "inserted {} switch records for type {:?} into input {}",
                    sequence.len(),
                    switch_kind,
                    new_idx
                );
            }
        }

        input.prev_time_in_quantum = out.cur_time;

        if self.record_enabled {
            let instr_ord = input.instr_ordinal();
            trace!("set_cur_input: recording input={} start={}", new_idx, instr_ord);
            let roi_start = input
                .regions_of_interest
                .first()
                .map(|r| r.start_instruction);
            if input.cur_region == 0
                && input.in_cur_region
                // The ordinal may be 1 less when still on the inserted
                // timestamp.
                && (roi_start == Some(instr_ord) || roi_start == Some(instr_ord + 1))
            {
                // We skipped during init without an output to record the
                // skip: record it now.
                let roi_start = roi_start.unwrap();
                self.record_schedule_skip(out, &mut input, 0, roi_start)?;
            } else {
                self.record_schedule_segment(out, SegmentKind::Default, new_idx as i32, instr_ord, 0);
            }
        }
        Ok(())
    }

    // Schedule recording:
    // =========================================================================

    /// Open a new segment on this output's recording.  Consecutive IDLE
    /// segments merge; intermediate timestamps add nothing while idle and
    /// repeated records balloon the file.
    fn record_schedule_segment(
        &self,
        out: &mut Output<R>,
        kind: SegmentKind,
        input: i32,
        start_instruction: u64,
        stop_instruction: u64,
    ) {
        // Always wall-clock time: the time stored by the prior next_record
        // call can be out of order across outputs and lead to deadlocks.
        let timestamp = wall_time_micros();
        if kind == SegmentKind::Idle
            && out.recorded.last().map(|s| s.kind) == Some(SegmentKind::Idle)
        {
            return;
        }
        trace!(
            "recording out={} type={:?} input={} start={} stop={} time={}",
            out.index,
            kind,
            input,
            start_instruction,
            stop_instruction,
            timestamp
        );
        out.recorded.push(ScheduleSegment {
            kind,
            input,
            start_instruction,
            stop_instruction,
            timestamp,
        });
        // The stop is typically filled in by close_schedule_segment().
    }

    /// Fill in the stop (or idle duration) of the output's open segment.
    fn close_schedule_segment(
        &self,
        out: &mut Output<R>,
        input: Option<&mut Input<R, Rd>>,
    ) -> Result<()> {
        let Some(last) = out.recorded.last_mut() else {
            return Ok(());
        };
        match last.kind {
            // Skips already carry their final stop value.
            SegmentKind::Skip | SegmentKind::Version | SegmentKind::Footer => Ok(()),
            SegmentKind::Idle => {
                let end = wall_time_micros();
                debug_assert!(end >= last.timestamp);
                let duration = end - last.timestamp;
                last.set_idle_duration(duration);
                trace!(
                    "close_schedule_segment: idle duration {} = {} - {}",
                    duration,
                    end,
                    last.timestamp
                );
                Ok(())
            }
            SegmentKind::Default | SegmentKind::SyntheticEnd => {
                let input = input.ok_or_else(|| {
                    SchedulerError::Invalid(
                        "closing an input segment without its input".to_string(),
                    )
                })?;
                let mut instr_ord = input.instr_ordinal();
                if input.at_eof || input.reader.at_end() {
                    // The end is exclusive, so use the max value.
                    instr_ord = u64::MAX;
                }
                if input.switching_pre_instruction {
                    input.switching_pre_instruction = false;
                    // Not switching after an instruction the consumer saw, so
                    // the exclusive stop ordinal needs +1.
                    trace!(
                        "close_schedule_segment: +1 for not-yet-processed instr in input {}",
                        input.index
                    );
                    instr_ord += 1;
                }
                trace!(
                    "close_schedule_segment: input={} start={} stop={}",
                    input.index,
                    last.start_instruction,
                    instr_ord
                );
                debug_assert!(
                    last.kind != SegmentKind::Default
                        || last.start_instruction < instr_ord
                        || instr_ord == 0
                );
                last.stop_instruction = instr_ord;
                Ok(())
            }
        }
    }

    /// Record a skip over `input`: close any open segment for it, then emit
    /// SKIP bracketed by DEFAULT entries.
    fn record_schedule_skip(
        &self,
        out: &mut Output<R>,
        input: &mut Input<R, Rd>,
        start_instruction: u64,
        stop_instruction: u64,
    ) -> Result<()> {
        if !self.record_enabled {
            return Err(SchedulerError::Invalid(
                "schedule recording is not enabled".to_string(),
            ));
        }
        // Close any prior default record for this input; on an input switch
        // it was already closed in set_cur_input().
        if out
            .recorded
            .last()
            .map(|s| (s.kind, s.input))
            == Some((SegmentKind::Default, input.index as i32))
        {
            self.close_schedule_segment(out, Some(&mut *input))?;
        }
        if out.recorded.len() == 1 {
            // Replay cannot start with a skip record: a start=0,stop=0 dummy
            // entry gets things rolling at the front of an output's records
            // when we are the first record after the version.
            debug_assert!(out.recorded.last().map(|s| s.kind) == Some(SegmentKind::Version));
            self.record_schedule_segment(out, SegmentKind::Default, input.index as i32, 0, 0);
        }
        self.record_schedule_segment(
            out,
            SegmentKind::Skip,
            input.index as i32,
            start_instruction,
            stop_instruction,
        );
        self.record_schedule_segment(
            out,
            SegmentKind::Default,
            input.index as i32,
            stop_instruction,
            0,
        );
        Ok(())
    }

    /// Write the recorded schedule: close any still-open segment, then a
    /// footer per output and one archive component per output.
    pub fn write_recorded_schedule(&self) -> Result<()> {
        let writer = self.schedule_writer.as_ref().ok_or_else(|| {
            SchedulerError::InvalidParameter("no schedule record stream".to_string())
        })?;
        let mut writer = writer.lock().unwrap();
        for (i, slot) in self.outputs.iter().enumerate() {
            let mut out = slot.state.lock().unwrap();
            // An output that ran straight into EOF still has its final
            // segment open; close it so replay runs the tail out.
            let last = out
                .recorded
                .last()
                .map(|s| (s.kind, s.input, s.stop_instruction));
            match last {
                Some((SegmentKind::Default, input_ord, 0)) => {
                    let mut input = self.inputs[input_ord as usize].lock().unwrap();
                    self.close_schedule_segment(&mut out, Some(&mut input))?;
                }
                Some((SegmentKind::Idle, _, _)) => {
                    self.close_schedule_segment(&mut out, None)?;
                }
                _ => {}
            }
            self.record_schedule_segment(&mut out, SegmentKind::Footer, 0, 0, 0);
            writer.open_new_component(&component_name(i))?;
            for segment in &out.recorded {
                writer.write_segment(segment)?;
            }
        }
        Ok(())
    }

    // EOF/idle handling:
    // =========================================================================

    fn mark_input_eof(&self, input: &mut Input<R, Rd>) {
        if input.at_eof {
            return;
        }
        input.at_eof = true;
        let prev = self.live_input_count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0);
        debug!("input {} at eof; {} live inputs left", input.index, prev - 1);
    }

    /// Report EOF when nothing can ever run again, else park the output idle.
    /// For dynamic mapping, a long-enough all-unscheduled stall force-moves
    /// the unscheduled queue into the ready queue so that direct-switch
    /// targets filtered out of the workload cannot hang the run.
    fn eof_or_idle(
        &self,
        out: &mut Output<R>,
        sched: Option<&mut SchedState>,
        prev_input: Option<InputIndex>,
    ) -> Result<Pick> {
        if self.options.mapping == MappingMode::ToConsistentOutput
            || self.live_input_count.load(Ordering::Acquire) <= 0
            || (self.options.mapping == MappingMode::AsPreviously
                && self.live_replay_output_count.load(Ordering::Acquire) <= 0)
        {
            return Ok(Pick::Eof);
        }
        let mut local_guard = None;
        let mut sched: Option<&mut SchedState> = match sched {
            Some(s) => Some(s),
            None => {
                local_guard = self.lock_sched();
                local_guard.as_deref_mut()
            }
        };
        if self.options.mapping == MappingMode::ToAnyOutput {
            let sched = sched.as_deref_mut().unwrap();
            trace!(
                "eof_or_idle output={} live={} unsched={} runq={} blocked={}",
                out.index,
                self.live_input_count.load(Ordering::Acquire),
                sched.unscheduled.len(),
                sched.ready.len(),
                sched.num_blocked
            );
            if sched.ready.is_empty() && !sched.unscheduled.is_empty() {
                if out.wait_start_time == 0 {
                    out.wait_start_time = out.cur_time;
                } else {
                    let elapsed_micros = (out.cur_time - out.wait_start_time) as f64
                        * self.options.time_units_per_us;
                    if elapsed_micros > self.options.block_time_max_us as f64 {
                        warn!("eof_or_idle moving entire unscheduled queue to ready queue");
                        while let Some((index, _key)) = sched.unscheduled.pop() {
                            let mut input = self.inputs[index].lock().unwrap();
                            input.unscheduled = false;
                            let delta = input.timestamp_delta();
                            sched.ready.push(index, input.priority, delta);
                        }
                        out.wait_start_time = 0;
                    }
                }
            } else {
                out.wait_start_time = 0;
            }
        }
        out.waiting = true;
        if prev_input.is_some() {
            out.bump_stat(ScheduleStat::SwitchInputToIdle);
        }
        self.set_cur_input(sched, out, None)?;
        Ok(Pick::Idle)
    }

    // Marker processing:
    // =========================================================================

    /// React to a marker on the current input.  Returns the target index of
    /// a schedule marker, which needs queue surgery the caller performs
    /// after releasing this input's lock.
    fn process_marker(
        &self,
        input: &mut Input<R, Rd>,
        out: &mut Output<R>,
        kind: MarkerKind,
        value: u64,
    ) -> Option<InputIndex> {
        match kind {
            MarkerKind::Syscall => {
                input.processing_syscall = true;
                input.pre_syscall_timestamp = input.reader.last_timestamp();
            }
            MarkerKind::MaybeBlockingSyscall => {
                input.processing_maybe_blocking_syscall = true;
                // Normally the timestamp came from a just-prior syscall
                // marker, but synthetic sequences may have only the maybe.
                input.pre_syscall_timestamp = input.reader.last_timestamp();
            }
            MarkerKind::ContextSwitchStart => {
                out.in_context_switch_code = true;
                out.in_kernel_code = true;
            }
            MarkerKind::SyscallTraceStart => {
                out.in_kernel_code = true;
            }
            MarkerKind::ContextSwitchEnd => {
                // The flag flip is delayed one record so the end marker
                // itself still counts as switch code.
                out.hit_switch_code_end = true;
                out.in_kernel_code = false;
            }
            MarkerKind::SyscallTraceEnd => {
                out.in_kernel_code = false;
            }
            MarkerKind::DirectThreadSwitch => {
                if !self.options.honor_direct_switches {
                    return None;
                }
                out.bump_stat(ScheduleStat::DirectSwitchAttempts);
                let target_tid = Tid::from_raw(value as i64);
                match self.tid2input.get(&(input.workload, target_tid)) {
                    None => {
                        warn!("failed to find input for target switch thread {}", target_tid)
                    }
                    Some(&target_idx) => input.switch_to_input = Some(target_idx),
                }
                if input.skip_next_unscheduled {
                    // The modeled kernel mechanism holds a single request;
                    // they do not accumulate.
                    input.skip_next_unscheduled = false;
                    trace!(
                        "input {} unschedule request ignored due to prior schedule request",
                        input.index
                    );
                    return None;
                }
                input.unscheduled = true;
                if input.syscall_timeout_arg > 0 {
                    input.blocked_time = self.scale_blocked_time(input.syscall_timeout_arg);
                    input.blocked_start_time = out.cur_time;
                    trace!("input {} unscheduled for {}", input.index, input.blocked_time);
                } else {
                    trace!("input {} unscheduled indefinitely", input.index);
                }
            }
            MarkerKind::SyscallArgTimeout => {
                // Cleared at the post-syscall instruction.
                input.syscall_timeout_arg = value;
            }
            MarkerKind::SyscallUnschedule => {
                if !self.options.honor_direct_switches {
                    return None;
                }
                if input.skip_next_unscheduled {
                    input.skip_next_unscheduled = false;
                    trace!(
                        "input {} unschedule request ignored due to prior schedule request",
                        input.index
                    );
                    return None;
                }
                input.unscheduled = true;
                if input.syscall_timeout_arg > 0 {
                    input.blocked_time = self.scale_blocked_time(input.syscall_timeout_arg);
                    input.blocked_start_time = out.cur_time;
                    trace!("input {} unscheduled for {}", input.index, input.blocked_time);
                } else {
                    trace!("input {} unscheduled indefinitely", input.index);
                }
            }
            MarkerKind::SyscallSchedule => {
                if !self.options.honor_direct_switches {
                    return None;
                }
                let target_tid = Tid::from_raw(value as i64);
                let Some(&target_idx) = self.tid2input.get(&(input.workload, target_tid))
                else {
                    warn!("failed to find input for schedule target tid {}", target_tid);
                    return None;
                };
                trace!("input {} re-scheduling input {}", input.index, target_idx);
                return Some(target_idx);
            }
            _ => {}
        }
        None
    }

    /// Wake a schedule marker's target.  The caller released the current
    /// input's lock: the lock order is scheduler lock before input lock.
    fn handle_schedule_marker(&self, target_idx: InputIndex) {
        let mut sched_guard = self.lock_sched();
        let sched = sched_guard
            .as_deref_mut()
            .expect("schedule markers are processed under dynamic mapping");
        let mut target = self.inputs[target_idx].lock().unwrap();
        if target.unscheduled {
            target.unscheduled = false;
            if sched.unscheduled.contains(target_idx) {
                sched.unscheduled.erase(target_idx);
                self.add_to_ready_queue(sched, &mut target);
            } else if sched.ready.contains(target_idx) {
                // The blocked time came from a timeout argument rather than
                // regular blocking i/o; erase it to wake the input.
                if target.blocked_time > 0 {
                    trace!("erasing blocked time for schedule target {}", target_idx);
                    sched.num_blocked -= 1;
                    target.blocked_time = 0;
                }
            }
        } else {
            trace!("input {} will skip next unschedule", target_idx);
            target.skip_next_unscheduled = true;
        }
    }

    // Regions of interest:
    // =========================================================================

    /// Clear queued records and skip the reader forward.  Returns
    /// `Pick::Skipped` on success (including a skip to a deliberate
    /// end-of-input) and an error for an out-of-bounds region.
    fn skip_instructions_in(
        &self,
        input: &mut Input<R, Rd>,
        skip_amount: u64,
    ) -> Result<Pick> {
        input.ensure_init()?;
        // For a skip of 0 the queue still must be cleared of non-instrs, but
        // should hold no instruction.
        debug_assert!(
            skip_amount > 0
                || input
                    .queue
                    .front()
                    .map_or(true, |r| !r.is_instruction() && !r.is_encoding())
        );
        input.clear_queue();
        input.reader.skip_instructions(skip_amount);
        trace!("skip_instructions: input={} amount={}", input.index, skip_amount);
        if input.instrs_pre_read > 0 {
            // Skipping always covers the pre-read records.
            input.instrs_pre_read = 0;
        }
        if input.reader.at_end() {
            self.mark_input_eof(input);
            // Out of bounds is an error, except the max sentinel used
            // internally for times_of_interest.
            if skip_amount >= u64::MAX - 2 {
                debug!("skip_instructions: input={} skip to eof", input.index);
                return Ok(Pick::Skipped);
            }
            debug!("skip_instructions: input={} skip out of bounds", input.index);
            return Err(SchedulerError::RegionInvalid(format!(
                "region of interest is out of bounds for input {}",
                input.index
            )));
        }
        input.in_cur_region = true;

        // Let the consumer know we skipped.  There is no discontinuity for
        // the first region, so no marker there.
        if input.cur_region > 0 {
            trace!("skip_instructions input={}: inserting separator marker", input.index);
            input
                .queue
                .push_back(R::window_marker(input.tid, input.cur_region as u64));
        }
        Ok(Pick::Skipped)
    }

    /// Move the input toward (or out of) its current region of interest.
    /// `out` is None during init, before outputs are assigned; a skip done
    /// then is recorded later by set_cur_input().
    fn advance_region_of_interest(
        &self,
        mut out: Option<&mut Output<R>>,
        record: &mut R,
        input: &mut Input<R, Rd>,
    ) -> Result<Pick> {
        let cur_instr = input.instr_ordinal();
        let cur_reader_instr = input.reader.instruction_ordinal();
        debug_assert!(input.cur_region < input.regions_of_interest.len());
        let mut cur_range = input.regions_of_interest[input.cur_region];
        // Look for the end of the current range.
        if input.in_cur_region
            && cur_range.stop_instruction != 0
            && cur_instr >= cur_range.stop_instruction
        {
            input.cur_region += 1;
            input.in_cur_region = false;
            debug!("at {} instrs: advancing to ROI #{}", cur_instr, input.cur_region);
            if input.cur_region >= input.regions_of_interest.len() {
                if input.at_eof {
                    return Ok(Pick::Eof);
                }
                // Let the consumer know we're done.
                if self.record_enabled {
                    if let Some(out) = out.as_deref_mut() {
                        self.close_schedule_segment(out, Some(&mut *input))?;
                        // A synthetic thread exit is needed on replay.
                        self.record_schedule_segment(
                            out,
                            SegmentKind::SyntheticEnd,
                            input.index as i32,
                            cur_instr,
                            0,
                        );
                    }
                }
                input.queue.push_back(R::thread_exit(input.tid));
                self.mark_input_eof(input);
                return Ok(Pick::Skipped);
            }
            cur_range = input.regions_of_interest[input.cur_region];
        }

        if !input.in_cur_region && cur_instr + 1 >= cur_range.start_instruction {
            // Already there (back-to-back regions).  Even without a gap the
            // consumer learns of the new region.
            input.in_cur_region = true;
            if input.cur_region > 0 {
                trace!("inserting separator marker for input {}", input.index);
                input.queue.push_back(record.clone());
                *record = R::window_marker(input.tid, input.cur_region as u64);
            }
            return Ok(Pick::Ok);
        }
        // Within one and already skipped: exit to avoid re-requesting a skip
        // and making no progress (we're on the inserted timestamp and the
        // instruction count is not yet the target).
        if input.in_cur_region && cur_instr + 1 >= cur_range.start_instruction {
            return Ok(Pick::Ok);
        }

        debug!(
            "skipping from {} to {} instrs ({} in reader) for ROI",
            cur_instr,
            cur_range.start_instruction,
            cur_reader_instr
        );
        if self.record_enabled {
            if let Some(out) = out.as_deref_mut() {
                self.record_schedule_skip(
                    out,
                    input,
                    cur_instr,
                    cur_range.start_instruction,
                )?;
            }
            // Else recorded in set_cur_input once assigned to an output.
        }
        if cur_range.start_instruction < cur_reader_instr {
            // Skipping backward over the pre-read would mean extracting from
            // the queue, which is not supported.
            return Err(SchedulerError::Invalid(
                "region of interest behind the reader position".to_string(),
            ));
        }
        self.skip_instructions_in(input, cur_range.start_instruction - cur_reader_instr - 1)
    }

    // Dispatch:
    // =========================================================================

    /// Choose the next input for an idle output, per the mapping mode.
    /// `blocked_time` is the block to apply to the input being given up.
    fn pick_next_input(&self, out: &mut Output<R>, blocked_time: u64) -> Result<Pick> {
        let mut res = Pick::Ok;
        let mut sched_guard = self.lock_sched();
        let prev_index = out.cur_input;
        let mut index: Option<InputIndex> = None;
        loop {
            if index.is_none() {
                match self.options.mapping {
                    MappingMode::AsPreviously => {
                        let (idx, status) =
                            self.pick_next_input_as_previously(sched_guard.as_deref_mut(), out)?;
                        match status {
                            Pick::Skipped => {
                                index = idx;
                                res = Pick::Skipped;
                                break;
                            }
                            Pick::Ok => index = idx,
                            other => return Ok(other),
                        }
                    }
                    MappingMode::ToAnyOutput => {
                        if blocked_time > 0 {
                            if let Some(prev_idx) = prev_index {
                                let mut prev = self.inputs[prev_idx].lock().unwrap();
                                if prev.blocked_time == 0 {
                                    debug!(
                                        "next_record[{}]: blocked time {}",
                                        out.index, blocked_time
                                    );
                                    prev.blocked_time = blocked_time;
                                    prev.blocked_start_time = out.cur_time;
                                }
                            }
                        }
                        // A pending direct switch?
                        let mut target_idx = None;
                        if let Some(prev_idx) = prev_index {
                            target_idx =
                                self.inputs[prev_idx].lock().unwrap().switch_to_input.take();
                        }
                        if let Some(target) = target_idx {
                            let sched = sched_guard.as_deref_mut().unwrap();
                            let mut target_input = self.inputs[target].lock().unwrap();
                            if sched.ready.contains(target) {
                                debug!(
                                    "next_record[{}]: direct switch from input {:?} to input {}",
                                    out.index, prev_index, target
                                );
                                sched.ready.erase(target);
                                index = Some(target);
                                // Erase any remaining wait time for the target.
                                if target_input.blocked_time > 0 {
                                    trace!(
                                        "direct switch erasing blocked time for input {}",
                                        target
                                    );
                                    sched.num_blocked -= 1;
                                    target_input.blocked_time = 0;
                                    target_input.unscheduled = false;
                                }
                                if target_input.prev_output.is_some()
                                    && target_input.prev_output != Some(out.index)
                                {
                                    out.bump_stat(ScheduleStat::Migrations);
                                }
                                out.bump_stat(ScheduleStat::DirectSwitchSuccesses);
                            } else if sched.unscheduled.contains(target) {
                                debug!(
                                    "next_record[{}]: direct switch from input {:?} to \
                                     was-unscheduled input {}",
                                    out.index, prev_index, target
                                );
                                target_input.unscheduled = false;
                                sched.unscheduled.erase(target);
                                index = Some(target);
                                if target_input.prev_output.is_some()
                                    && target_input.prev_output != Some(out.index)
                                {
                                    out.bump_stat(ScheduleStat::Migrations);
                                }
                                out.bump_stat(ScheduleStat::DirectSwitchSuccesses);
                            } else {
                                // Inter-input dependencies are captured in the
                                // switch and unschedule markers; a target
                                // running elsewhere means there is no real
                                // dependence and this is a dynamic switch to
                                // whoever is available.  Keep the missed
                                // target from waiting indefinitely.
                                warn!(
                                    "direct switch (from {:?}) target input #{} is running \
                                     elsewhere; picking a different target",
                                    prev_index, target
                                );
                                target_input.skip_next_unscheduled = true;
                            }
                        }
                        if index.is_some() {
                            // Found the direct switch target.
                        } else if sched_guard.as_ref().unwrap().ready.is_empty()
                            && blocked_time == 0
                        {
                            let Some(prev_idx) = prev_index else {
                                return self.eof_or_idle(out, sched_guard.as_deref_mut(), None);
                            };
                            let prev_at_eof = self.inputs[prev_idx].lock().unwrap().at_eof;
                            if prev_at_eof {
                                return self.eof_or_idle(
                                    out,
                                    sched_guard.as_deref_mut(),
                                    prev_index,
                                );
                            }
                            // Go back to the prior input.
                            index = prev_index;
                        } else {
                            // Give up the input before going to the queue so
                            // we can add ourselves: FIFO among equal
                            // priorities means we switch whenever someone of
                            // equal priority is waiting.
                            self.set_cur_input(sched_guard.as_deref_mut(), out, None)?;
                            let sched = sched_guard.as_deref_mut().unwrap();
                            let cur_time = out.cur_time;
                            let (queue_next, status) =
                                self.pop_from_ready_queue(sched, out.index, cur_time);
                            if status == Pick::Idle {
                                out.waiting = true;
                                if self.record_enabled {
                                    self.record_schedule_segment(
                                        out,
                                        SegmentKind::Idle,
                                        0,
                                        0,
                                        0,
                                    );
                                }
                                if prev_index.is_some() {
                                    out.bump_stat(ScheduleStat::SwitchInputToIdle);
                                }
                                return Ok(Pick::Idle);
                            }
                            match queue_next {
                                None => {
                                    debug_assert!(
                                        blocked_time == 0 || prev_index.is_none()
                                    );
                                    return self.eof_or_idle(
                                        out,
                                        sched_guard.as_deref_mut(),
                                        prev_index,
                                    );
                                }
                                Some(idx) => index = Some(idx),
                            }
                        }
                    }
                    _ if self.options.deps == DependencyMode::Timestamps => {
                        // As-traced ordering with a single output: globally
                        // oldest timestamp first.
                        let mut min_time = u64::MAX;
                        for (i, input) in self.inputs.iter().enumerate() {
                            let input = input.lock().unwrap();
                            if !input.at_eof
                                && input.next_timestamp > 0
                                && input.next_timestamp < min_time
                            {
                                min_time = input.next_timestamp;
                                index = Some(i);
                            }
                        }
                        let Some(idx) = index else {
                            return self.eof_or_idle(out, sched_guard.as_deref_mut(), prev_index);
                        };
                        debug!(
                            "next_record[{}]: advancing to timestamp {} == input #{}",
                            out.index, min_time, idx
                        );
                    }
                    MappingMode::ToConsistentOutput => {
                        // The prior thread is done; take the next one
                        // pre-allocated to this output.  One consumer thread
                        // per output lets this stay lock-free.
                        out.input_indices_index += 1;
                        if out.input_indices_index >= out.input_indices.len() {
                            debug!("next_record[{}]: all at eof", out.index);
                            return Ok(Pick::Eof);
                        }
                        index = Some(out.input_indices[out.input_indices_index]);
                        debug!(
                            "next_record[{}]: advancing to local index {} == input #{:?}",
                            out.index, out.input_indices_index, index
                        );
                    }
                    _ => {
                        return Err(SchedulerError::Invalid(
                            "unsupported mapping/dependency combination".to_string(),
                        ))
                    }
                }
                if let Some(idx) = index {
                    self.inputs[idx].lock().unwrap().ensure_init()?;
                }
            }
            let idx = index.unwrap();
            {
                let mut input = self.inputs[idx].lock().unwrap();
                if input.at_eof || input.reader.at_end() {
                    debug!("next_record[{}]: input #{} at eof", out.index, idx);
                    if !input.at_eof {
                        self.mark_input_eof(&mut input);
                    }
                    index = None;
                    continue;
                }
            }
            break;
        }
        // These stats cannot live in set_cur_input() as that is also called
        // to temporarily give up an input.
        if prev_index == index {
            out.bump_stat(ScheduleStat::SwitchNop);
        } else if prev_index.is_some() && index.is_some() {
            out.bump_stat(ScheduleStat::SwitchInputToInput);
        } else if index.is_none() {
            out.bump_stat(ScheduleStat::SwitchInputToIdle);
        } else {
            out.bump_stat(ScheduleStat::SwitchIdleToInput);
        }
        self.set_cur_input(sched_guard.as_deref_mut(), out, index)?;
        Ok(res)
    }

    // Record delivery:
    // =========================================================================

    /// Deliver the next record for `output`.  At most one record per call;
    /// never blocks.  `cur_time` is the consumer's clock in time units
    /// (0 falls back to the process wall clock).
    pub fn next_record(&self, output: OutputIndex, cur_time: u64) -> Result<NextRecord<R>> {
        if output >= self.outputs.len() {
            return Err(SchedulerError::InvalidParameter(format!(
                "output {} out of bounds",
                output
            )));
        }
        let slot = &self.outputs[output];
        let mut out_guard = slot.state.lock().unwrap();
        let out = &mut *out_guard;
        let cur_time = if cur_time == 0 { wall_time_micros() } else { cur_time };
        out.cur_time = cur_time;
        if !out.active {
            return Ok(NextRecord::Idle);
        }
        if out.waiting {
            if self.options.mapping == MappingMode::AsPreviously && out.wait_start_time > 0 {
                let rec_idx = slot.record_index.load(Ordering::Acquire);
                let duration = slot
                    .replay
                    .get(rec_idx.max(0) as usize)
                    .map(|s| s.idle_duration())
                    .unwrap_or(0);
                if out.cur_time.saturating_sub(out.wait_start_time) < duration {
                    trace!(
                        "next_record[{}]: elapsed {} < duration {}",
                        output,
                        out.cur_time - out.wait_start_time,
                        duration
                    );
                    return Ok(NextRecord::Wait);
                }
                out.wait_start_time = 0;
            }
            trace!("next_record[{}]: need new input (cur=waiting)", output);
            match self.pick_next_input(out, 0)? {
                Pick::Ok | Pick::Skipped => {}
                other => return Ok(other.into_next()),
            }
            out.waiting = false;
        }
        let Some(mut cur_idx) = out.cur_input else {
            // More outputs than inputs.
            return Ok(self.eof_or_idle(out, None, None)?.into_next());
        };

        if !out.speculation_stack.is_empty() {
            out.prev_speculate_pc = out.speculate_pc;
            let (record, next_pc) = self
                .speculator
                .next_record::<R>(out.speculate_pc)
                .map_err(|e| SchedulerError::Invalid(e.to_string()))?;
            out.speculate_pc = next_pc;
            // The current input stays put: ordinals remain unchanged, and no
            // context switch checks run while speculating.
            return Ok(NextRecord::Record(record));
        }

        let mut input = self.inputs[cur_idx].lock().unwrap();
        // No start time is requested from consumers, so the first record of
        // each input sets it here.
        if input.prev_time_in_quantum == 0 {
            input.prev_time_in_quantum = cur_time;
        }

        let record;
        loop {
            input.cur_from_queue = false;
            input.ensure_init()?;
            let mut candidate;
            if let Some(queued) = input.queue.pop_front() {
                candidate = queued;
                input.cur_from_queue = true;
            } else {
                // The reader parks on an unconsumed record after init and
                // after a skip, so the advance is skipped exactly then.
                if input.needs_advance && !input.at_eof {
                    input.reader.advance();
                } else {
                    input.needs_advance = true;
                }
                if input.at_eof || input.reader.at_end() {
                    if !input.at_eof {
                        self.mark_input_eof(&mut input);
                    }
                    drop(input);
                    trace!("next_record[{}]: need new input (cur={} eof)", output, cur_idx);
                    let res = self.pick_next_input(out, 0)?;
                    if res != Pick::Ok && res != Pick::Skipped {
                        return Ok(res.into_next());
                    }
                    cur_idx = out.cur_input.expect("pick assigned an input");
                    input = self.inputs[cur_idx].lock().unwrap();
                    if res == Pick::Skipped {
                        input.needs_advance = false;
                    }
                    continue;
                }
                candidate = input.reader.record().clone();
            }
            if input.instrs_pre_read > 0 && candidate.is_instruction() {
                input.instrs_pre_read -= 1;
            }

            let mut need_new_input = false;
            let mut preempt = false;
            let mut blocked_time = 0u64;
            let mut prev_time_in_quantum = 0u64;
            match self.options.mapping {
                MappingMode::AsPreviously => {
                    let rec_idx = slot.record_index.load(Ordering::Acquire);
                    debug_assert!(rec_idx >= 0);
                    if rec_idx as usize >= slot.replay.len() {
                        trace!("next_record[{}]: on last record", output);
                    } else {
                        let segment = &slot.replay[rec_idx as usize];
                        match segment.kind {
                            SegmentKind::Skip => {
                                trace!("next_record[{}]: need new input after skip", output);
                                need_new_input = true;
                            }
                            SegmentKind::SyntheticEnd => {
                                trace!("next_record[{}]: at synthetic end", output);
                            }
                            _ => {
                                debug_assert_eq!(segment.kind, SegmentKind::Default);
                                let start = segment.start_instruction;
                                let stop = segment.stop_instruction;
                                // The stop is exclusive; a 0,0 entry is a
                                // starter sharing the next entry for an
                                // initial skip.  Only check the stop once the
                                // queue is exhausted, or on the starter.
                                if input.instr_ordinal() >= stop
                                    && (!input.cur_from_queue || (start == 0 && stop == 0))
                                {
                                    trace!(
                                        "next_record[{}]: end of segment in={} stop={}",
                                        output,
                                        input.index,
                                        stop
                                    );
                                    need_new_input = true;
                                }
                            }
                        }
                    }
                }
                MappingMode::ToAnyOutput => {
                    // Regular traces have a syscall marker alongside any
                    // maybe-blocking marker, but synthetic sequences may have
                    // just the maybe, so check both.
                    if input.processing_syscall || input.processing_maybe_blocking_syscall {
                        // Wait until past all markers tied to the syscall.
                        if candidate.is_instruction_boundary(&out.last_record) {
                            if input.switch_to_input.is_some() {
                                // The switch request overrides any latency
                                // threshold.
                                need_new_input = true;
                                debug!(
                                    "next_record[{}]: direct switch on low-latency \
                                     syscall in input {}",
                                    output, input.index
                                );
                            } else if input.blocked_time > 0 {
                                // Another source already blocked this input.
                                need_new_input = true;
                                blocked_time = input.blocked_time;
                                debug!(
                                    "next_record[{}]: blocked time set for input {}",
                                    output, input.index
                                );
                            } else if input.unscheduled {
                                need_new_input = true;
                                debug!(
                                    "next_record[{}]: input {} going unscheduled",
                                    output, input.index
                                );
                            } else {
                                let (switches, bt) = self.syscall_incurs_switch(&input);
                                if switches {
                                    // Model as blocking; switch away.
                                    need_new_input = true;
                                    blocked_time = bt;
                                    debug!(
                                        "next_record[{}]: hit blocking syscall in input {}",
                                        output, input.index
                                    );
                                }
                            }
                            input.processing_syscall = false;
                            input.processing_maybe_blocking_syscall = false;
                            input.pre_syscall_timestamp = 0;
                            input.syscall_timeout_arg = 0;
                        }
                    }
                    if out.hit_switch_code_end {
                        // Delayed so the end marker was still switch code.
                        out.in_context_switch_code = false;
                        out.hit_switch_code_end = false;
                        // Back on the clock.
                        if self.options.quantum_unit == QuantumUnit::Time {
                            input.prev_time_in_quantum = cur_time;
                        }
                    }
                    if let Some((kind, value)) = candidate.as_marker() {
                        if let Some(target) = self.process_marker(&mut input, out, kind, value)
                        {
                            drop(input);
                            self.handle_schedule_marker(target);
                            input = self.inputs[cur_idx].lock().unwrap();
                        }
                    }
                    if self.options.quantum_unit == QuantumUnit::Instructions
                        && candidate.is_instruction_boundary(&out.last_record)
                        && !out.in_kernel_code
                    {
                        input.instrs_in_quantum += 1;
                        if input.instrs_in_quantum > self.options.quantum_duration_instrs {
                            // Prefer a switch even when this input has the
                            // oldest timestamp: context switch rate beats
                            // timestamp ordering.
                            trace!(
                                "next_record[{}]: input {} hit end of instr quantum",
                                output,
                                input.index
                            );
                            preempt = true;
                            need_new_input = true;
                            input.instrs_in_quantum = 0;
                            out.bump_stat(ScheduleStat::QuantumPreempts);
                        }
                    } else if self.options.quantum_unit == QuantumUnit::Time {
                        if cur_time == 0 || cur_time < input.prev_time_in_quantum {
                            warn!(
                                "next_record[{}]: invalid time {} vs start {}",
                                output, cur_time, input.prev_time_in_quantum
                            );
                            return Err(SchedulerError::Invalid(format!(
                                "invalid time {} vs quantum start {}",
                                cur_time, input.prev_time_in_quantum
                            )));
                        }
                        input.time_spent_in_quantum += cur_time - input.prev_time_in_quantum;
                        prev_time_in_quantum = input.prev_time_in_quantum;
                        input.prev_time_in_quantum = cur_time;
                        let elapsed_micros =
                            input.time_spent_in_quantum as f64 / self.options.time_units_per_us;
                        if elapsed_micros >= self.options.quantum_duration_us as f64
                            // Switches happen only on instruction boundaries.
                            && candidate.is_instruction_boundary(&out.last_record)
                        {
                            trace!(
                                "next_record[{}]: input {} hit end of time quantum after {}",
                                output,
                                input.index,
                                input.time_spent_in_quantum
                            );
                            preempt = true;
                            need_new_input = true;
                            input.time_spent_in_quantum = 0;
                            out.bump_stat(ScheduleStat::QuantumPreempts);
                        }
                    }
                }
                _ => {}
            }
            if self.options.deps == DependencyMode::Timestamps
                && self.options.mapping != MappingMode::AsPreviously
                // For dynamic mapping with timestamps, the asked-for switch
                // rate matters more than trace-buffer timestamp
                // dependencies: no early quantum end purely on timestamps.
                && self.options.mapping != MappingMode::ToAnyOutput
            {
                if let Some(timestamp) = candidate.timestamp() {
                    input.next_timestamp = timestamp;
                    need_new_input = true;
                }
            }
            if need_new_input {
                let prev_input = out.cur_input;
                trace!("next_record[{}]: need new input (cur={:?})", output, prev_input);
                // The candidate goes into the queue before the lock is
                // released: another output may grab this input.
                input.queue.push_back(candidate.clone());
                drop(input);
                let res = self.pick_next_input(out, blocked_time)?;
                if res != Pick::Ok && res != Pick::Wait && res != Pick::Skipped {
                    return Ok(res.into_next());
                }
                if out.cur_input != prev_input {
                    trace!(
                        "next_record[{}]: switching from {:?} to {:?}",
                        output,
                        prev_input,
                        out.cur_input
                    );
                    {
                        // Give back the quantum accounting overshoot from the
                        // candidate that was handed to the new input, except
                        // on a preempt which already reset to 0.
                        let mut prev = self.inputs[cur_idx].lock().unwrap();
                        if !preempt && self.options.mapping == MappingMode::ToAnyOutput {
                            if self.options.quantum_unit == QuantumUnit::Instructions
                                && candidate.is_instruction_boundary(&out.last_record)
                            {
                                debug_assert!(prev.instrs_in_quantum > 0);
                                prev.instrs_in_quantum -= 1;
                            } else if self.options.quantum_unit == QuantumUnit::Time {
                                debug_assert!(
                                    prev.time_spent_in_quantum
                                        >= cur_time - prev_time_in_quantum
                                );
                                prev.time_spent_in_quantum -=
                                    cur_time - prev_time_in_quantum;
                            }
                        }
                    }
                    if res == Pick::Wait {
                        return Ok(NextRecord::Wait);
                    }
                    cur_idx = out.cur_input.expect("pick assigned an input");
                    input = self.inputs[cur_idx].lock().unwrap();
                    continue;
                }
                input = self.inputs[cur_idx].lock().unwrap();
                if res == Pick::Skipped {
                    input.needs_advance = false;
                    continue;
                }
                // Take the candidate back.
                candidate = input.queue.pop_back().expect("candidate was queued");
            }
            if input.needs_roi
                && self.options.mapping != MappingMode::AsPreviously
                && !input.regions_of_interest.is_empty()
            {
                let res =
                    self.advance_region_of_interest(Some(&mut *out), &mut candidate, &mut input)?;
                match res {
                    Pick::Skipped => {
                        // The queue or a re-read is needed; loop, but do not
                        // come back here.
                        input.needs_roi = false;
                        input.needs_advance = false;
                        continue;
                    }
                    Pick::Ok => {}
                    Pick::Eof => {
                        drop(input);
                        return Ok(self
                            .eof_or_idle(out, None, Some(cur_idx))?
                            .into_next());
                    }
                    other => return Ok(other.into_next()),
                }
            } else {
                input.needs_roi = true;
            }
            record = candidate;
            break;
        }

        trace!("next_record[{}]: from {} @{}", output, input.index, cur_time);

        // Stream bookkeeping: counts exclude synthetic records, and header
        // state follows the markers.
        if !input.reader.is_record_synthetic() {
            out.ref_count += 1;
        }
        if record.is_instruction_boundary(&out.last_record) {
            out.instr_count += 1;
        }
        if let Some((kind, value)) = record.as_marker() {
            match kind {
                MarkerKind::Timestamp => {
                    out.last_timestamp = value;
                    if out.first_timestamp == 0 {
                        out.first_timestamp = value;
                    }
                }
                MarkerKind::Version => out.version = value,
                MarkerKind::Filetype => out.filetype = value,
                MarkerKind::CacheLineSize => out.cache_line_size = value,
                MarkerKind::ChunkInstrCount => out.chunk_instr_count = value,
                MarkerKind::PageSize => out.page_size = value,
                _ => {}
            }
        }
        if let Some(tid) = record.tid() {
            input.last_record_tid = tid;
        }
        if let Some(pid) = record.pid() {
            input.pid = Some(pid);
        }
        out.last_record = record.clone();
        Ok(NextRecord::Record(record))
    }

    /// Restore the last delivered record at the head of the current input's
    /// queue.  Not possible mid-speculation, before any record, or for the
    /// raw record shape (instruction-boundary state cannot be rebuilt).
    pub fn unread_last_record(&self, output: OutputIndex) -> Result<()> {
        if !R::supports_unread() {
            return Err(SchedulerError::NotImplemented(
                "unread_last_record is not supported for this record shape".to_string(),
            ));
        }
        let mut out = self.outputs[output].state.lock().unwrap();
        if out.last_record.is_invalid() {
            return Err(SchedulerError::Invalid("no last record to unread".to_string()));
        }
        if !out.speculation_stack.is_empty() {
            return Err(SchedulerError::Invalid(
                "cannot unread during speculation".to_string(),
            ));
        }
        let cur_idx = out.cur_input.ok_or_else(|| {
            SchedulerError::Invalid("no current input to unread into".to_string())
        })?;
        let mut input = self.inputs[cur_idx].lock().unwrap();
        trace!("next_record[{}]: unreading last record, from {}", output, cur_idx);
        input.queue.push_back(out.last_record.clone());
        if self.options.quantum_unit == QuantumUnit::Instructions
            && out.last_record.is_instruction()
        {
            input.instrs_in_quantum -= 1;
        }
        if !input.reader.is_record_synthetic() {
            out.ref_count -= 1;
        }
        if out.last_record.is_instruction() {
            out.instr_count -= 1;
        }
        // get_input_last_timestamp is documented to stay as-is.
        out.last_record = R::invalid();
        Ok(())
    }

    // Speculation:
    // =========================================================================

    /// Enter (possibly nested) speculation at `pc`.  With `queue_current`,
    /// the last delivered record is replayed on return to the trace.
    pub fn start_speculation(
        &self,
        output: OutputIndex,
        pc: u64,
        queue_current: bool,
    ) -> Result<()> {
        let mut out = self.outputs[output].state.lock().unwrap();
        if out.speculation_stack.is_empty() {
            if queue_current {
                if out.last_record.is_invalid() {
                    return Err(SchedulerError::Invalid(
                        "no last record to queue for speculation".to_string(),
                    ));
                }
                let cur_idx = out.cur_input.ok_or_else(|| {
                    SchedulerError::Invalid("no current input for speculation".to_string())
                })?;
                self.inputs[cur_idx]
                    .lock()
                    .unwrap()
                    .queue
                    .push_back(out.last_record.clone());
            }
            // The outer layer's stored address is unused: the actual trace
            // holds the resumption context, so a sentinel suffices.
            const SPECULATION_OUTER_ADDRESS: u64 = 0;
            out.speculation_stack.push(SPECULATION_OUTER_ADDRESS);
        } else if queue_current {
            let prev_speculate_pc = out.prev_speculate_pc;
            out.speculation_stack.push(prev_speculate_pc);
        } else {
            let speculate_pc = out.speculate_pc;
            out.speculation_stack.push(speculate_pc);
        }
        // Set the prev in case another start arrives before a read.
        out.prev_speculate_pc = out.speculate_pc;
        out.speculate_pc = pc;
        debug!(
            "start_speculation layer={} pc={:#x}",
            out.speculation_stack.len(),
            pc
        );
        Ok(())
    }

    /// Leave the innermost speculation layer.
    pub fn stop_speculation(&self, output: OutputIndex) -> Result<()> {
        let mut out = self.outputs[output].state.lock().unwrap();
        if out.speculation_stack.is_empty() {
            return Err(SchedulerError::Invalid("no speculation to stop".to_string()));
        }
        if out.speculation_stack.len() > 1 {
            // speculate_pc is only used when exiting inner layers.
            out.speculate_pc = *out.speculation_stack.last().unwrap();
        }
        debug!(
            "stop_speculation layer={} (resume={:#x})",
            out.speculation_stack.len(),
            out.speculate_pc
        );
        out.speculation_stack.pop();
        Ok(())
    }

    // Activation:
    // =========================================================================

    /// Park or resume an output.  An inactive output returns idle and its
    /// input goes back to the pool; re-activation starts with a wait and a
    /// fresh dispatch.
    pub fn set_output_active(&self, output: OutputIndex, active: bool) -> Result<()> {
        if self.options.mapping != MappingMode::ToAnyOutput {
            return Err(SchedulerError::Invalid(
                "output activation requires dynamic mapping".to_string(),
            ));
        }
        let mut out = self.outputs[output].state.lock().unwrap();
        if out.active == active {
            return Ok(());
        }
        out.active = active;
        debug!("output stream {} is now {}", output, if active { "active" } else { "inactive" });
        let mut sched_guard = self.lock_sched();
        if !active {
            // Make the now-inactive output's input available to other
            // outputs.  This also resets its quantum.
            if let Some(cur_idx) = out.cur_input {
                let mut input = self.inputs[cur_idx].lock().unwrap();
                if input.queue.is_empty() {
                    // Not switching on a just-read unconsumed instruction.
                    input.switching_pre_instruction = true;
                }
            }
            self.set_cur_input(sched_guard.as_deref_mut(), &mut out, None)?;
        } else {
            out.waiting = true;
        }
        Ok(())
    }

    // Query API:
    // =========================================================================

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    /// Name of the input currently assigned to `output`, or "".
    pub fn get_input_name(&self, output: OutputIndex) -> String {
        let out = self.outputs[output].state.lock().unwrap();
        match out.cur_input {
            Some(idx) => self.inputs[idx].lock().unwrap().reader.stream_name(),
            None => String::new(),
        }
    }

    pub fn get_input_ordinal(&self, output: OutputIndex) -> Option<InputIndex> {
        self.outputs[output].state.lock().unwrap().cur_input
    }

    pub fn get_tid(&self, output: OutputIndex) -> Option<Tid> {
        let out = self.outputs[output].state.lock().unwrap();
        out.cur_input.map(|idx| self.inputs[idx].lock().unwrap().tid)
    }

    pub fn get_shard_index(&self, output: OutputIndex) -> usize {
        output
    }

    pub fn get_workload_ordinal(&self, output: OutputIndex) -> Option<WorkloadIndex> {
        let out = self.outputs[output].state.lock().unwrap();
        out.cur_input
            .map(|idx| self.inputs[idx].lock().unwrap().workload)
    }

    /// The cpu this output stands in for: the traced cpuid under as-traced
    /// replay, the output ordinal otherwise.
    pub fn get_output_cpuid(&self, output: OutputIndex) -> i64 {
        let out = self.outputs[output].state.lock().unwrap();
        if self.as_traced_replay && out.as_traced_cpuid >= 0 {
            out.as_traced_cpuid
        } else {
            output as i64
        }
    }

    /// Record ordinal within the current input, adjusted for init-time
    /// readahead so the consumer never sees inflated counts.
    pub fn get_input_record_ordinal(&self, output: OutputIndex) -> u64 {
        let out = self.outputs[output].state.lock().unwrap();
        let Some(idx) = out.cur_input else { return 0 };
        let input = self.inputs[idx].lock().unwrap();
        let mut ordinal = input.reader.record_ordinal();
        if input.instr_ordinal() == 0 {
            // Readahead for filetype/timestamp has been consumed by the
            // reader but not yet by the consumer.
            ordinal = ordinal
                .saturating_sub(input.queue.len() as u64 + u64::from(input.cur_from_queue));
        }
        ordinal
    }

    pub fn get_input_first_timestamp(&self, output: OutputIndex) -> u64 {
        let out = self.outputs[output].state.lock().unwrap();
        let Some(idx) = out.cur_input else { return 0 };
        let input = self.inputs[idx].lock().unwrap();
        if input.instr_ordinal() == 0 && (!input.queue.is_empty() || input.cur_from_queue) {
            return 0;
        }
        input.reader.first_timestamp()
    }

    pub fn get_input_last_timestamp(&self, output: OutputIndex) -> u64 {
        let out = self.outputs[output].state.lock().unwrap();
        let Some(idx) = out.cur_input else { return 0 };
        let input = self.inputs[idx].lock().unwrap();
        if input.instr_ordinal() == 0 && (!input.queue.is_empty() || input.cur_from_queue) {
            return 0;
        }
        input.reader.last_timestamp()
    }

    pub fn is_record_synthetic(&self, output: OutputIndex) -> bool {
        let out = self.outputs[output].state.lock().unwrap();
        let Some(idx) = out.cur_input else { return false };
        if out.in_context_switch_code {
            return true;
        }
        self.inputs[idx].lock().unwrap().reader.is_record_synthetic()
    }

    pub fn is_record_kernel(&self, output: OutputIndex) -> bool {
        let out = self.outputs[output].state.lock().unwrap();
        let Some(idx) = out.cur_input else { return false };
        self.inputs[idx].lock().unwrap().reader.is_record_kernel()
    }

    pub fn get_statistic(&self, output: OutputIndex, stat: ScheduleStat) -> u64 {
        self.outputs[output].state.lock().unwrap().stat(stat)
    }

    pub fn get_output_time(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().cur_time
    }

    /// Records delivered on this output, excluding synthetic ones.
    pub fn get_record_ordinal(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().ref_count
    }

    /// Instructions delivered on this output.
    pub fn get_instruction_ordinal(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().instr_count
    }

    pub fn get_version(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().version
    }

    pub fn get_filetype(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().filetype
    }

    pub fn get_cache_line_size(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().cache_line_size
    }

    pub fn get_chunk_instr_count(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().chunk_instr_count
    }

    pub fn get_page_size(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().page_size
    }

    pub fn get_first_timestamp(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().first_timestamp
    }

    pub fn get_last_timestamp(&self, output: OutputIndex) -> u64 {
        self.outputs[output].state.lock().unwrap().last_timestamp
    }

    /// One stream rotating round-robin across all outputs, for driving N
    /// outputs in lockstep from one thread.
    pub fn lockstep_stream(&self) -> Result<LockstepStream<'_, R, Rd>> {
        if !self.options.single_lockstep_output {
            return Err(SchedulerError::InvalidParameter(
                "single_lockstep_output is not enabled".to_string(),
            ));
        }
        Ok(LockstepStream {
            scheduler: self,
            next_output: 0,
        })
    }
}

impl<R: TraceRecord, Rd: TraceReader<R>> Drop for Scheduler<R, Rd> {
    fn drop(&mut self) {
        for (i, slot) in self.outputs.iter().enumerate() {
            let out = slot.state.lock().unwrap();
            info!("stats for output #{}", i);
            for stat in ScheduleStat::all() {
                info!("  {:<24?}: {:9}", stat, out.stat(stat));
            }
        }
    }
}

/// Rotates one record per call across every output of a scheduler.
pub struct LockstepStream<'a, R: TraceRecord, Rd: TraceReader<R>> {
    scheduler: &'a Scheduler<R, Rd>,
    next_output: OutputIndex,
}

impl<'a, R: TraceRecord, Rd: TraceReader<R>> LockstepStream<'a, R, Rd> {
    /// Pull one record from the next output in rotation.
    pub fn next_record(&mut self, cur_time: u64) -> Result<(OutputIndex, NextRecord<R>)> {
        let output = self.next_output;
        self.next_output = (self.next_output + 1) % self.scheduler.output_count();
        let result = self.scheduler.next_record(output, cur_time)?;
        Ok((output, result))
    }
}
