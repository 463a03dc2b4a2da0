/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Whole-scheduler scenario tests: synthetic inputs driven through the
//! public API, covering dynamic scheduling, the blocking model, direct
//! switches, regions of interest, and record/replay.

use pretty_assertions::assert_eq;
use tracesched::scheduler::NextRecord;
use tracesched::scheduler::Scheduler;
use tracesched::scheduler::SchedulerIo;
use tracesched::MemoryReader;
use tracesched::ReaderInput;
use tracesched::ScheduleReader;
use tracesched::ScheduleWriter;
use tracesched::Workload;
use tracesched_model::schedule::component_name;
use tracesched_model::CpuScheduleEntry;
use tracesched_model::MappingMode;
use tracesched_model::MarkerKind;
use tracesched_model::Memref;
use tracesched_model::Pid;
use tracesched_model::ScheduleSegment;
use tracesched_model::ScheduleStat;
use tracesched_model::SchedulerOptions;
use tracesched_model::SegmentKind;
use tracesched_model::Tid;
use tracesched_model::TimeRange;
use tracesched_model::TraceRecord;

type TestScheduler = Scheduler<Memref, MemoryReader<Memref>>;

fn tid(raw: i64) -> Tid {
    Tid::from_raw(raw)
}

fn instr(tid_raw: i64, pc: u64) -> Memref {
    Memref::Instruction {
        tid: tid(tid_raw),
        pid: Pid::from_raw(100),
        pc,
        size: 4,
    }
}

fn marker(tid_raw: i64, kind: MarkerKind, value: u64) -> Memref {
    Memref::Marker {
        tid: tid(tid_raw),
        pid: Pid::from_raw(100),
        kind,
        value,
    }
}

fn timestamp(tid_raw: i64, value: u64) -> Memref {
    marker(tid_raw, MarkerKind::Timestamp, value)
}

fn reader_input(tid_raw: i64, records: Vec<Memref>) -> ReaderInput<MemoryReader<Memref>> {
    ReaderInput {
        reader: MemoryReader::new(format!("input.{}", tid_raw), records),
        tid: tid(tid_raw),
    }
}

/// A run of `count` instructions for one thread, with distinguishable pcs.
fn instr_run(tid_raw: i64, count: u64) -> Vec<Memref> {
    (0..count).map(|i| instr(tid_raw, 0x1000 + i * 4)).collect()
}

/// Drain one output, advancing the supplied clock by one unit per call.
/// Wait and idle states are folded into the result for inspection.
fn drain_output(scheduler: &TestScheduler, output: usize) -> Vec<NextRecord<Memref>> {
    let mut results = Vec::new();
    let mut time = 1u64;
    loop {
        let next = scheduler.next_record(output, time).unwrap();
        time += 1;
        match next {
            NextRecord::Eof => break,
            other => results.push(other),
        }
        assert!(results.len() < 100_000, "output {} never reached eof", output);
    }
    results
}

/// Only the delivered records, dropping wait/idle states.
fn records_of(results: &[NextRecord<Memref>]) -> Vec<Memref> {
    results
        .iter()
        .filter_map(|r| match r {
            NextRecord::Record(record) => Some(*record),
            _ => None,
        })
        .collect()
}

// Dynamic scheduling:
// =============================================================================

#[test]
fn round_robin_on_instruction_quantum() {
    let workload = Workload::from_readers(vec![
        reader_input(1, instr_run(1, 4)),
        reader_input(2, instr_run(2, 4)),
    ]);
    let options = SchedulerOptions {
        quantum_duration_instrs: 2,
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![workload], 1, options, SchedulerIo::default()).unwrap();
    let delivered = records_of(&drain_output(&scheduler, 0));
    let tids: Vec<i64> = delivered
        .iter()
        .map(|r| r.tid().unwrap().as_raw())
        .collect();
    assert_eq!(tids, vec![1, 1, 2, 2, 1, 1, 2, 2]);
    // Each input runs its first two instructions, is preempted on reading a
    // third, and finishes after one more quantum.
    let pcs: Vec<u64> = delivered
        .iter()
        .map(|r| match r {
            Memref::Instruction { pc, .. } => *pc,
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(
        pcs,
        vec![0x1000, 0x1004, 0x1000, 0x1004, 0x1008, 0x100c, 0x1008, 0x100c]
    );
    assert_eq!(scheduler.get_statistic(0, ScheduleStat::SwitchInputToInput), 3);
    // Two quantum expiries force preemptions; the third switch is an EOF
    // handoff.
    assert_eq!(scheduler.get_statistic(0, ScheduleStat::QuantumPreempts), 2);
    assert_eq!(scheduler.get_record_ordinal(0), 8);
    assert_eq!(scheduler.get_instruction_ordinal(0), 8);
}

#[test]
fn instruction_ordinals_strictly_increase_per_input() {
    let workload = Workload::from_readers(vec![
        reader_input(1, instr_run(1, 9)),
        reader_input(2, instr_run(2, 9)),
        reader_input(3, instr_run(3, 9)),
    ]);
    let options = SchedulerOptions {
        quantum_duration_instrs: 3,
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![workload], 1, options, SchedulerIo::default()).unwrap();
    let delivered = records_of(&drain_output(&scheduler, 0));
    let mut last_pc: std::collections::HashMap<i64, u64> = Default::default();
    for record in &delivered {
        if let Memref::Instruction { tid, pc, .. } = record {
            if let Some(prev) = last_pc.insert(tid.as_raw(), *pc) {
                assert!(pc > &prev, "pc went backwards for tid {}", tid);
            }
        }
    }
    assert_eq!(delivered.len(), 27);
}

#[test]
fn consistent_mapping_partitions_inputs() {
    let workload = Workload::from_readers(vec![
        reader_input(1, instr_run(1, 2)),
        reader_input(2, instr_run(2, 2)),
        reader_input(3, instr_run(3, 2)),
    ]);
    let options = SchedulerOptions {
        mapping: MappingMode::ToConsistentOutput,
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![workload], 2, options, SchedulerIo::default()).unwrap();
    let out0: Vec<i64> = records_of(&drain_output(&scheduler, 0))
        .iter()
        .map(|r| r.tid().unwrap().as_raw())
        .collect();
    let out1: Vec<i64> = records_of(&drain_output(&scheduler, 1))
        .iter()
        .map(|r| r.tid().unwrap().as_raw())
        .collect();
    // Round-robin static partition: inputs 0 and 2 on output 0, input 1 on
    // output 1, each consumed in order.
    assert_eq!(out0, vec![1, 1, 3, 3]);
    assert_eq!(out1, vec![2, 2]);
}

// Blocking syscalls:
// =============================================================================

#[test]
fn blocking_syscall_yields_and_returns_after_block_time() {
    let blocking_threshold = 500u64;
    let a_records = vec![
        instr(1, 0x1000),
        timestamp(1, 1000),
        marker(1, MarkerKind::Syscall, 42),
        marker(1, MarkerKind::MaybeBlockingSyscall, 0),
        timestamp(1, 1000 + blocking_threshold),
        instr(1, 0x1004),
        instr(1, 0x1008),
    ];
    let workload = Workload::from_readers(vec![
        reader_input(1, a_records),
        reader_input(2, instr_run(2, 3)),
    ]);
    let options = SchedulerOptions {
        blocking_switch_threshold: blocking_threshold,
        block_time_multiplier: 1.0,
        time_units_per_us: 1.0,
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![workload], 1, options, SchedulerIo::default()).unwrap();
    let results = drain_output(&scheduler, 0);
    let delivered = records_of(&results);
    let tids: Vec<i64> = delivered
        .iter()
        .map(|r| r.tid().unwrap().as_raw())
        .collect();
    // The latency equals the threshold, so input 1 blocks at the next
    // instruction: its syscall markers are delivered, then input 2 runs to
    // completion, then input 1 returns after its block time elapses.
    assert_eq!(tids, vec![1, 1, 1, 1, 1, 2, 2, 2, 1, 1]);
    // blocked_time = latency * multiplier * units = 500: the scheduler idles
    // until it elapses (one time unit per call).
    let idle_count = results
        .iter()
        .filter(|r| matches!(r, NextRecord::Idle))
        .count();
    assert!(idle_count > 400, "expected a long idle gap, got {}", idle_count);
}

#[test]
fn legacy_trace_blocks_on_every_maybe_blocking_syscall() {
    let a_records = vec![
        instr(1, 0x1000),
        marker(1, MarkerKind::MaybeBlockingSyscall, 0),
        instr(1, 0x1004),
    ];
    let legacy = MemoryReader::new("legacy", a_records).with_version(2);
    let workload = Workload::from_readers(vec![
        ReaderInput {
            reader: legacy,
            tid: tid(1),
        },
        reader_input(2, instr_run(2, 2)),
    ]);
    let options = SchedulerOptions {
        blocking_switch_threshold: 3,
        block_time_multiplier: 1.0,
        time_units_per_us: 1.0,
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![workload], 1, options, SchedulerIo::default()).unwrap();
    let tids: Vec<i64> = records_of(&drain_output(&scheduler, 0))
        .iter()
        .map(|r| r.tid().unwrap().as_raw())
        .collect();
    // No timestamps bracket the syscall, yet the maybe-blocking marker alone
    // forces the switch.
    assert_eq!(tids, vec![1, 1, 2, 2, 1]);
}

// Direct switches and unscheduling:
// =============================================================================

#[test]
fn direct_switch_hands_off_to_target() {
    let a_records = vec![
        instr(1, 0x1000),
        timestamp(1, 1000),
        marker(1, MarkerKind::Syscall, 7),
        marker(1, MarkerKind::DirectThreadSwitch, 2),
        instr(1, 0x1004),
    ];
    let b_records = vec![
        instr(2, 0x2000),
        timestamp(2, 2000),
        marker(2, MarkerKind::Syscall, 8),
        marker(2, MarkerKind::SyscallSchedule, 1),
        instr(2, 0x2004),
    ];
    let workload = Workload::from_readers(vec![
        reader_input(1, a_records),
        reader_input(2, b_records),
    ]);
    let scheduler = TestScheduler::new(
        vec![workload],
        1,
        SchedulerOptions::default(),
        SchedulerIo::default(),
    )
    .unwrap();
    let results = drain_output(&scheduler, 0);
    let tids: Vec<i64> = records_of(&results)
        .iter()
        .map(|r| r.tid().unwrap().as_raw())
        .collect();
    // Input 1 parks itself with a direct switch to input 2; input 2 later
    // re-schedules input 1, whose queued instruction then completes.
    assert_eq!(tids, vec![1, 1, 1, 1, 2, 2, 2, 2, 2, 1]);
    assert_eq!(
        scheduler.get_statistic(0, ScheduleStat::DirectSwitchAttempts),
        1
    );
    assert_eq!(
        scheduler.get_statistic(0, ScheduleStat::DirectSwitchSuccesses),
        1
    );
}

#[test]
fn initially_unscheduled_input_is_flushed_by_hang_avoidance() {
    let a_records = vec![
        marker(1, MarkerKind::SyscallUnschedule, 0),
        instr(1, 0x1000),
    ];
    let workload = Workload::from_readers(vec![
        reader_input(1, a_records),
        reader_input(2, instr_run(2, 2)),
    ]);
    let options = SchedulerOptions {
        time_units_per_us: 1.0,
        block_time_max_us: 200,
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![workload], 1, options, SchedulerIo::default()).unwrap();
    let results = drain_output(&scheduler, 0);
    let tids: Vec<i64> = records_of(&results)
        .iter()
        .map(|r| r.tid().unwrap().as_raw())
        .collect();
    // Input 1 starts out unscheduled (its unschedule marker precedes any
    // instruction); with nothing else to run the scheduler idles until the
    // hang-avoidance timer flushes the unscheduled queue.
    assert_eq!(tids, vec![2, 2, 1, 1]);
    assert!(results.iter().any(|r| matches!(r, NextRecord::Idle)));
}

// Regions of interest:
// =============================================================================

#[test]
fn regions_of_interest_skip_and_separate() {
    use tracesched_model::InstrRange;
    use tracesched_model::ThreadModifier;

    let mut workload = Workload::from_readers(vec![reader_input(1, instr_run(1, 60))]);
    let mut modifier = ThreadModifier::regions(vec![
        InstrRange::new(10, 20),
        InstrRange::new(30, 40),
    ]);
    modifier.tids.push(tid(1));
    workload.thread_modifiers.push(modifier);
    let scheduler = TestScheduler::new(
        vec![workload],
        1,
        SchedulerOptions::default(),
        SchedulerIo::default(),
    )
    .unwrap();
    let delivered = records_of(&drain_output(&scheduler, 0));
    // Both regions delivered in full, separated by a window marker, ending
    // with a synthesized thread exit.
    let first_region: Vec<Memref> = (10..=20).map(|i| instr(1, 0x1000 + (i - 1) * 4)).collect();
    let second_region: Vec<Memref> = (30..=40).map(|i| instr(1, 0x1000 + (i - 1) * 4)).collect();
    let mut expected = first_region;
    expected.push(Memref::window_marker(tid(1), 1));
    expected.extend(second_region);
    expected.push(Memref::thread_exit(tid(1)));
    assert_eq!(delivered, expected);
    // Delivered instruction count matches the region sizes.
    let instr_count = delivered.iter().filter(|r| r.is_instruction()).count() as u64;
    assert_eq!(instr_count, (20 - 10 + 1) + (40 - 30 + 1));
}

#[test]
fn times_of_interest_derive_regions_from_as_traced_schedule() {
    use tracesched::CpuScheduleSource;

    let entries = vec![
        CpuScheduleEntry {
            thread: tid(1),
            timestamp: 500,
            cpu: 0,
            start_instruction: 0,
        },
        CpuScheduleEntry {
            thread: tid(1),
            timestamp: 1500,
            cpu: 0,
            start_instruction: 50,
        },
        CpuScheduleEntry {
            thread: tid(1),
            timestamp: 2500,
            cpu: 0,
            start_instruction: 200,
        },
    ];
    let mut workload = Workload::from_readers(vec![reader_input(1, instr_run(1, 250))]);
    workload.times_of_interest.push(TimeRange {
        start_timestamp: 1000,
        stop_timestamp: 2000,
    });
    let io = SchedulerIo {
        replay_as_traced: Some(CpuScheduleSource::from_entries(entries)),
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![workload], 1, SchedulerOptions::default(), io).unwrap();
    let delivered = records_of(&drain_output(&scheduler, 0));
    // Linear interpolation, rounding down: [25, 125].
    let instrs: Vec<&Memref> = delivered.iter().filter(|r| r.is_instruction()).collect();
    assert_eq!(instrs.len(), 101);
    assert_eq!(instrs[0], &instr(1, 0x1000 + 24 * 4));
    assert_eq!(
        delivered.last().unwrap(),
        &Memref::thread_exit(tid(1))
    );
}

// Record and replay:
// =============================================================================

fn two_input_workload() -> Workload<MemoryReader<Memref>> {
    Workload::from_readers(vec![
        reader_input(1, instr_run(1, 4)),
        reader_input(2, instr_run(2, 4)),
    ])
}

#[test]
fn record_then_replay_reproduces_the_schedule() {
    let record_dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions {
        quantum_duration_instrs: 2,
        ..Default::default()
    };

    let recorded_run = {
        let io = SchedulerIo {
            schedule_record: Some(ScheduleWriter::new(record_dir.path()).unwrap()),
            ..Default::default()
        };
        let scheduler =
            TestScheduler::new(vec![two_input_workload()], 1, options.clone(), io).unwrap();
        let delivered = records_of(&drain_output(&scheduler, 0));
        scheduler.write_recorded_schedule().unwrap();
        delivered
    };
    tracesched::check_schedule_file(record_dir.path()).unwrap();

    let replay_options = SchedulerOptions {
        mapping: MappingMode::AsPreviously,
        ..options
    };
    let io = SchedulerIo {
        schedule_replay: Some(ScheduleReader::new(record_dir.path())),
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![two_input_workload()], 1, replay_options, io).unwrap();
    let replayed = records_of(&drain_output(&scheduler, 0));
    assert_eq!(replayed, recorded_run);
}

#[test]
fn rerecording_a_replay_is_idempotent() {
    let first_dir = tempfile::tempdir().unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let options = SchedulerOptions {
        quantum_duration_instrs: 2,
        ..Default::default()
    };

    {
        let io = SchedulerIo {
            schedule_record: Some(ScheduleWriter::new(first_dir.path()).unwrap()),
            ..Default::default()
        };
        let scheduler =
            TestScheduler::new(vec![two_input_workload()], 1, options.clone(), io).unwrap();
        drain_output(&scheduler, 0);
        scheduler.write_recorded_schedule().unwrap();
    }
    {
        let replay_options = SchedulerOptions {
            mapping: MappingMode::AsPreviously,
            ..options
        };
        let io = SchedulerIo {
            schedule_replay: Some(ScheduleReader::new(first_dir.path())),
            schedule_record: Some(ScheduleWriter::new(second_dir.path()).unwrap()),
            ..Default::default()
        };
        let scheduler =
            TestScheduler::new(vec![two_input_workload()], 1, replay_options, io).unwrap();
        drain_output(&scheduler, 0);
        scheduler.write_recorded_schedule().unwrap();
    }

    let strip_times = |dir: &std::path::Path| -> Vec<(SegmentKind, i32, u64, u64)> {
        ScheduleReader::new(dir)
            .read_component(&component_name(0))
            .unwrap()
            .into_iter()
            .map(|s| (s.kind, s.input, s.start_instruction, s.stop_instruction))
            .collect()
    };
    // Byte-equivalent modulo timestamps, which reflect replay wall-clock
    // time.  Idle durations are also wall-clock and none occur here.
    assert_eq!(strip_times(first_dir.path()), strip_times(second_dir.path()));
}

#[test]
fn replay_honors_idle_and_segment_bounds() {
    // Hand-written schedule: input 0 for 3 instructions, 50 time units of
    // idle, then input 1 for 2 instructions.
    let dir = tempfile::tempdir().unwrap();
    let mut writer = ScheduleWriter::new(dir.path()).unwrap();
    writer.open_new_component(&component_name(0)).unwrap();
    let segments = [
        ScheduleSegment::version(1, 0),
        ScheduleSegment {
            kind: SegmentKind::Default,
            input: 0,
            start_instruction: 0,
            stop_instruction: 3,
            timestamp: 1,
        },
        ScheduleSegment {
            kind: SegmentKind::Idle,
            input: 0,
            start_instruction: 50,
            stop_instruction: 0,
            timestamp: 2,
        },
        ScheduleSegment {
            kind: SegmentKind::Default,
            input: 1,
            start_instruction: 0,
            stop_instruction: 2,
            timestamp: 3,
        },
        ScheduleSegment::footer(4),
    ];
    for segment in &segments {
        writer.write_segment(segment).unwrap();
    }

    let options = SchedulerOptions {
        mapping: MappingMode::AsPreviously,
        ..Default::default()
    };
    let io = SchedulerIo {
        schedule_replay: Some(ScheduleReader::new(dir.path())),
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![two_input_workload()], 1, options, io).unwrap();
    let results = drain_output(&scheduler, 0);
    let tids: Vec<i64> = records_of(&results)
        .iter()
        .map(|r| r.tid().unwrap().as_raw())
        .collect();
    assert_eq!(tids, vec![1, 1, 1, 2, 2]);
    // The idle period spans the recorded 50 time units: one idle report,
    // then waits until the clock catches up.
    let wait_count = results
        .iter()
        .filter(|r| matches!(r, NextRecord::Wait))
        .count();
    assert!(wait_count >= 48, "expected ~50 wait reports, got {}", wait_count);
    assert!(results.iter().any(|r| matches!(r, NextRecord::Idle)));
}

// Speculation and unread:
// =============================================================================

#[test]
fn speculation_synthesizes_nops_without_advancing_ordinals() {
    let workload = Workload::from_readers(vec![reader_input(1, instr_run(1, 3))]);
    let scheduler = TestScheduler::new(
        vec![workload],
        1,
        SchedulerOptions::default(),
        SchedulerIo::default(),
    )
    .unwrap();
    // Deliver the first instruction.
    let NextRecord::Record(first) = scheduler.next_record(0, 1).unwrap() else {
        panic!("expected a record");
    };
    assert_eq!(first, instr(1, 0x1000));
    let ordinal_before = scheduler.get_instruction_ordinal(0);

    scheduler.start_speculation(0, 0x5000, false).unwrap();
    let NextRecord::Record(spec1) = scheduler.next_record(0, 2).unwrap() else {
        panic!("expected a speculative record");
    };
    let NextRecord::Record(spec2) = scheduler.next_record(0, 3).unwrap() else {
        panic!("expected a speculative record");
    };
    assert_eq!(spec1, Memref::nop_instruction(0x5000));
    assert_eq!(spec2, Memref::nop_instruction(0x5001));
    assert_eq!(scheduler.get_instruction_ordinal(0), ordinal_before);

    // Nested layer resumes the outer pc on exit.
    scheduler.start_speculation(0, 0x6000, false).unwrap();
    let NextRecord::Record(nested) = scheduler.next_record(0, 4).unwrap() else {
        panic!("expected a speculative record");
    };
    assert_eq!(nested, Memref::nop_instruction(0x6000));
    scheduler.stop_speculation(0).unwrap();
    let NextRecord::Record(resumed) = scheduler.next_record(0, 5).unwrap() else {
        panic!("expected a speculative record");
    };
    assert_eq!(resumed, Memref::nop_instruction(0x5002));
    scheduler.stop_speculation(0).unwrap();

    // Back to the trace where it left off.
    let NextRecord::Record(second) = scheduler.next_record(0, 6).unwrap() else {
        panic!("expected a record");
    };
    assert_eq!(second, instr(1, 0x1004));
}

#[test]
fn unread_last_record_redelivers() {
    let workload = Workload::from_readers(vec![reader_input(1, instr_run(1, 2))]);
    let scheduler = TestScheduler::new(
        vec![workload],
        1,
        SchedulerOptions::default(),
        SchedulerIo::default(),
    )
    .unwrap();
    let NextRecord::Record(first) = scheduler.next_record(0, 1).unwrap() else {
        panic!("expected a record");
    };
    scheduler.unread_last_record(0).unwrap();
    // Unreading twice is not possible.
    assert!(scheduler.unread_last_record(0).is_err());
    let NextRecord::Record(again) = scheduler.next_record(0, 2).unwrap() else {
        panic!("expected a record");
    };
    assert_eq!(first, again);
}

#[test]
fn lockstep_stream_rotates_outputs() {
    let workload = Workload::from_readers(vec![
        reader_input(1, instr_run(1, 2)),
        reader_input(2, instr_run(2, 2)),
    ]);
    let options = SchedulerOptions {
        mapping: MappingMode::ToConsistentOutput,
        single_lockstep_output: true,
        ..Default::default()
    };
    let scheduler =
        TestScheduler::new(vec![workload], 2, options, SchedulerIo::default()).unwrap();
    let mut stream = scheduler.lockstep_stream().unwrap();
    let mut delivered: Vec<(usize, i64)> = Vec::new();
    let mut eofs = 0;
    let mut time = 1;
    while eofs < 2 {
        let (output, next) = stream.next_record(time).unwrap();
        time += 1;
        match next {
            NextRecord::Record(record) => {
                delivered.push((output, record.tid().unwrap().as_raw()))
            }
            NextRecord::Eof => eofs += 1,
            _ => {}
        }
        assert!(time < 100);
    }
    // One record per output per turn, each output on its own partition.
    assert_eq!(delivered, vec![(0, 1), (1, 2), (0, 1), (1, 2)]);
}

// Output activation:
// =============================================================================

#[test]
fn inactive_output_surrenders_its_input() {
    let workload = Workload::from_readers(vec![reader_input(1, instr_run(1, 4))]);
    let scheduler = TestScheduler::new(
        vec![workload],
        2,
        SchedulerOptions::default(),
        SchedulerIo::default(),
    )
    .unwrap();
    // Output 0 owns the only input; park it and the input becomes available
    // to output 1.
    let NextRecord::Record(_) = scheduler.next_record(0, 1).unwrap() else {
        panic!("expected a record");
    };
    scheduler.set_output_active(0, false).unwrap();
    assert_eq!(scheduler.next_record(0, 2).unwrap(), NextRecord::Idle);
    let mut delivered = 0;
    let mut time = 3;
    loop {
        match scheduler.next_record(1, time).unwrap() {
            NextRecord::Record(record) => {
                assert_eq!(record.tid(), Some(tid(1)));
                delivered += 1;
            }
            NextRecord::Eof => break,
            _ => {}
        }
        time += 1;
        assert!(time < 1000);
    }
    assert_eq!(delivered, 3);
}
