/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Scheduler configuration and per-workload input descriptions.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;

use crate::ids::OutputIndex;
use crate::ids::Tid;

/// How inputs are mapped onto outputs.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum MappingMode {
    /// Dynamic: any input may run on any output, chosen via the ready queue.
    ToAnyOutput,
    /// Static round-robin partition decided at init; lock-free afterward.
    ToConsistentOutput,
    /// Follow the as-traced schedule (or oldest-timestamp-first for a single
    /// output without one).
    ToRecordedOutput,
    /// Replay a previously recorded schedule exactly.
    AsPreviously,
}

/// Optional inter-input ordering.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum DependencyMode {
    /// No cross-input ordering beyond the mapping itself.
    Ignore,
    /// Order same-workload inputs by their trace timestamps.
    Timestamps,
}

/// Unit in which scheduling quanta are measured.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum QuantumUnit {
    /// Retired instructions delivered to the output.
    Instructions,
    /// Simulator-reported time units (see `time_units_per_us`).
    Time,
}

/// Category of an injected kernel context-switch sequence.  The values match
/// the context-switch start/end marker payloads.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SwitchKind {
    Thread,
    Process,
}

impl SwitchKind {
    /// Decode a context-switch marker payload.
    pub fn from_marker_value(value: u64) -> Option<SwitchKind> {
        match value {
            1 => Some(SwitchKind::Thread),
            2 => Some(SwitchKind::Process),
            _ => None,
        }
    }
}

/// A `(start_instruction, stop_instruction]`-style region of interest.
/// Ordinals are 1-based; `stop_instruction == 0` means to end-of-trace.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub struct InstrRange {
    pub start_instruction: u64,
    /// Inclusive stop; 0 for an open-ended region.
    pub stop_instruction: u64,
}

impl InstrRange {
    pub fn new(start_instruction: u64, stop_instruction: u64) -> Self {
        InstrRange {
            start_instruction,
            stop_instruction,
        }
    }
}

/// A timestamp window used to derive regions of interest per input.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start_timestamp: u64,
    /// 0 means to end-of-trace.
    pub stop_timestamp: u64,
}

/// Scheduling attributes applied to a set of threads within one workload.
/// An empty `tids` list applies to every thread not already modified.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct ThreadModifier {
    pub tids: Vec<Tid>,
    /// Higher runs first.
    pub priority: i32,
    /// Outputs allowed to run these threads; empty means any.
    pub output_binding: BTreeSet<OutputIndex>,
    /// Strictly ascending, non-adjacent regions.
    pub regions_of_interest: Vec<InstrRange>,
}

impl ThreadModifier {
    /// A modifier that only restricts execution to the given regions.
    pub fn regions(regions_of_interest: Vec<InstrRange>) -> Self {
        ThreadModifier {
            tids: Vec::new(),
            priority: 0,
            output_binding: BTreeSet::new(),
            regions_of_interest,
        }
    }
}

/// Global scheduler options.
///
/// Latencies and thresholds are in simulated microseconds unless noted;
/// `time_units_per_us` converts the consumer-supplied `cur_time` units into
/// microseconds.
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerOptions {
    pub mapping: MappingMode,
    pub deps: DependencyMode,
    pub quantum_unit: QuantumUnit,

    /// Instructions per quantum for `QuantumUnit::Instructions`.
    pub quantum_duration_instrs: u64,
    /// Microseconds per quantum for `QuantumUnit::Time`.
    pub quantum_duration_us: u64,
    /// How many `cur_time` units equal one simulated microsecond.
    pub time_units_per_us: f64,

    /// Syscall latency (us) at or above which a plain syscall blocks.
    pub syscall_switch_threshold: u64,
    /// Syscall latency (us) at or above which a maybe-blocking syscall blocks.
    pub blocking_switch_threshold: u64,
    /// Multiplier from observed syscall latency to modeled blocked time.
    pub block_time_multiplier: f64,
    /// Cap (us) on modeled blocked time, to keep outlier latencies from
    /// dominating the simulation.
    pub block_time_max_us: u64,

    /// Whether to honor direct-switch/unschedule/schedule markers.
    pub honor_direct_switches: bool,
    /// Pick a uniformly random runnable entry instead of the queue head.
    pub randomize_next_input: bool,
    /// Seed for the deterministic PRNG behind `randomize_next_input`.
    pub rand_seed: u64,
    /// Read ahead in every input during init to surface filetypes (and
    /// timestamps when needed).  Must be off for sources whose init blocks.
    pub read_inputs_in_init: bool,
    /// Expose one stream that rotates across all outputs in lockstep.
    pub single_lockstep_output: bool,

    /// Deprecated: quantum in the unit of `quantum_unit`.  Translated by
    /// [`SchedulerOptions::normalize_legacy_fields`]; 0 means unset.
    pub quantum_duration: u64,
    /// Deprecated: blocked-time scale in time units.  0.0 means unset.
    pub block_time_scale: f64,
    /// Deprecated: blocked-time cap in time units.  0 means unset.
    pub block_time_max: u64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            mapping: MappingMode::ToAnyOutput,
            deps: DependencyMode::Ignore,
            quantum_unit: QuantumUnit::Instructions,
            quantum_duration_instrs: 10_000_000,
            quantum_duration_us: 5_000,
            time_units_per_us: 100.0,
            syscall_switch_threshold: 30_000,
            blocking_switch_threshold: 500,
            block_time_multiplier: 10.0,
            block_time_max_us: 250_000,
            honor_direct_switches: true,
            randomize_next_input: false,
            rand_seed: 0,
            read_inputs_in_init: true,
            single_lockstep_output: false,
            quantum_duration: 0,
            block_time_scale: 0.0,
            block_time_max: 0,
        }
    }
}

impl SchedulerOptions {
    /// Translate deprecated fields into their replacements and reject
    /// unusable values.  Called once at scheduler init.
    pub fn normalize_legacy_fields(&mut self) -> Result<(), String> {
        if self.time_units_per_us <= 0.0 {
            return Err("time_units_per_us must be > 0".to_string());
        }
        if self.quantum_duration > 0 {
            match self.quantum_unit {
                QuantumUnit::Instructions => {
                    self.quantum_duration_instrs = self.quantum_duration;
                }
                QuantumUnit::Time => {
                    self.quantum_duration_us =
                        (self.quantum_duration as f64 / self.time_units_per_us) as u64;
                }
            }
            self.quantum_duration = 0;
        }
        if self.quantum_duration_us == 0 {
            return Err("quantum_duration_us must be > 0".to_string());
        }
        if self.block_time_scale > 0.0 {
            self.block_time_multiplier = self.block_time_scale / self.time_units_per_us;
            self.block_time_scale = 0.0;
        }
        if self.block_time_multiplier == 0.0 {
            return Err("block_time_multiplier must != 0".to_string());
        }
        if self.block_time_max > 0 {
            self.block_time_max_us =
                (self.block_time_max as f64 / self.time_units_per_us) as u64;
            self.block_time_max = 0;
        }
        if self.block_time_max_us == 0 {
            return Err("block_time_max_us must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_normalized() {
        let mut options = SchedulerOptions::default();
        options.normalize_legacy_fields().unwrap();
        assert_eq!(options, SchedulerOptions::default());
    }

    #[test]
    fn legacy_quantum_translates_per_unit() {
        let mut options = SchedulerOptions {
            quantum_duration: 600,
            ..Default::default()
        };
        options.normalize_legacy_fields().unwrap();
        assert_eq!(options.quantum_duration_instrs, 600);

        let mut options = SchedulerOptions {
            quantum_unit: QuantumUnit::Time,
            quantum_duration: 600,
            time_units_per_us: 2.0,
            ..Default::default()
        };
        options.normalize_legacy_fields().unwrap();
        assert_eq!(options.quantum_duration_us, 300);
    }

    #[test]
    fn legacy_block_scale_translates() {
        let mut options = SchedulerOptions {
            block_time_scale: 50.0,
            block_time_max: 500_000,
            time_units_per_us: 100.0,
            ..Default::default()
        };
        options.normalize_legacy_fields().unwrap();
        assert_eq!(options.block_time_multiplier, 0.5);
        assert_eq!(options.block_time_max_us, 5_000);
    }

    #[test]
    fn zero_quantum_rejected() {
        let mut options = SchedulerOptions {
            quantum_duration_us: 0,
            ..Default::default()
        };
        assert!(options.normalize_legacy_fields().is_err());
    }
}
