/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Widely-shared type definitions for the trace scheduler: record variants and
//! their classification predicates, persisted schedule segments, scheduler
//! options, and per-output statistics.

pub mod config;
pub mod ids;
pub mod record;
pub mod schedule;
pub mod stats;

pub use config::DependencyMode;
pub use config::InstrRange;
pub use config::MappingMode;
pub use config::QuantumUnit;
pub use config::SchedulerOptions;
pub use config::SwitchKind;
pub use config::ThreadModifier;
pub use config::TimeRange;
pub use ids::InputIndex;
pub use ids::OutputIndex;
pub use ids::Pid;
pub use ids::Tid;
pub use ids::WorkloadIndex;
pub use record::MarkerKind;
pub use record::Memref;
pub use record::TraceEntry;
pub use record::TraceRecord;
pub use schedule::CpuScheduleEntry;
pub use schedule::ScheduleSegment;
pub use schedule::SegmentKind;
pub use stats::ScheduleStat;
