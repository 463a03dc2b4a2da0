/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-output scheduling statistics.

use serde::Deserialize;
use serde::Serialize;

/// Counters kept per output stream.
#[derive(PartialEq, Debug, Eq, Copy, Clone, Hash, Serialize, Deserialize)]
pub enum ScheduleStat {
    /// Switches from one live input directly to another.
    SwitchInputToInput,
    SwitchInputToIdle,
    SwitchIdleToInput,
    /// A switch point that re-selected the same input.
    SwitchNop,
    /// Quantum expirations that forced a preemption.
    QuantumPreempts,
    /// Direct-switch markers processed.
    DirectSwitchAttempts,
    /// Direct switches that reached their target.
    DirectSwitchSuccesses,
    /// Inputs that migrated from a different output.
    Migrations,
}

/// Number of [`ScheduleStat`] variants, for flat counter arrays.
pub const SCHEDULE_STAT_COUNT: usize = 8;

impl ScheduleStat {
    /// Index into a flat counter array.
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// All statistics, in display order.
    pub fn all() -> [ScheduleStat; SCHEDULE_STAT_COUNT] {
        [
            ScheduleStat::SwitchInputToInput,
            ScheduleStat::SwitchInputToIdle,
            ScheduleStat::SwitchIdleToInput,
            ScheduleStat::SwitchNop,
            ScheduleStat::QuantumPreempts,
            ScheduleStat::DirectSwitchAttempts,
            ScheduleStat::DirectSwitchSuccesses,
            ScheduleStat::Migrations,
        ]
    }
}
