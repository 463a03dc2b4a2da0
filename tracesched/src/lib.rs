/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A multi-input, multi-output trace scheduler.
//!
//! Maps a set of recorded per-thread (or per-core) execution traces onto a
//! configurable number of output streams, modeling OS context switching:
//! priority-driven dispatch with quanta, a blocking/unscheduling model driven
//! by syscall markers, direct-switch hints, regions of interest, speculation,
//! and two record/replay protocols for reproducible schedules.
//!
//! Consumers drive one output each, pulling one record at a time via
//! [`Scheduler::next_record`]; the call never blocks and instead reports
//! [`NextRecord::Wait`]/[`NextRecord::Idle`] states to poll through.

pub mod discovery;
pub mod error;
pub mod reader;
pub mod schedule_file;
pub mod scheduler;
mod input;
mod output;
mod speculator;
mod switch_sequence;
mod times;

pub use discovery::ReaderInput;
pub use discovery::Workload;
pub use error::Result;
pub use error::SchedulerError;
pub use reader::MemoryReader;
pub use reader::ReaderFactory;
pub use reader::TraceReader;
pub use reader::TRACE_VERSION_FREQUENT_TIMESTAMPS;
pub use schedule_file::check_schedule_file;
pub use schedule_file::CpuScheduleSource;
pub use schedule_file::CpuScheduleWriter;
pub use schedule_file::ScheduleReader;
pub use schedule_file::ScheduleWriter;
pub use scheduler::LockstepStream;
pub use scheduler::NextRecord;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerIo;
pub use scheduler::runqueue::Priority;
pub use scheduler::runqueue::DEFAULT_PRIORITY;
