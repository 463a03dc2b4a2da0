/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Times-of-interest resolution: translating `(timestamp, timestamp)` windows
//! into per-input instruction-ordinal regions, using the as-traced schedule
//! as the timestamp→ordinal map.

use std::collections::BTreeMap;

use tracesched_model::InstrRange;
use tracesched_model::TimeRange;

use crate::error::Result;
use crate::error::SchedulerError;

/// An interval map from trace timestamp to instruction ordinal for one input.
/// Intervals do not overlap and have no gaps, so only start keys are stored.
#[derive(Debug, Default)]
pub(crate) struct TimeInterpolator {
    tree: BTreeMap<u64, u64>,
}

impl TimeInterpolator {
    pub fn insert(&mut self, timestamp: u64, instruction: u64) {
        self.tree.insert(timestamp, instruction);
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Interpolate the instruction ordinal at `time`, rounding down so a
    /// system call spanning the start time is included (the right starting
    /// behavior for a thread blocked or unscheduled at that point).
    ///
    /// Queries at or past the last known timestamp return `None`: there is no
    /// timestamp in the footer, so anything beyond the final known point is
    /// treated as no overlap.  Queries before the first timestamp also
    /// return `None`.
    pub fn lookup(&self, time: u64) -> Option<u64> {
        let (upper_time, upper_ord) = self.tree.range((time + 1)..).next()?;
        let (lower_time, lower_ord) = self.tree.range(..=time).next_back()?;
        let fraction = (time - lower_time) as f64 / (upper_time - lower_time) as f64;
        let interpolated = *lower_ord as f64 + fraction * (*upper_ord as f64 - *lower_ord as f64);
        let ordinal = interpolated as u64;
        tracing::trace!(
            "time2ordinal: time {} => times [{}, {}) ords [{}, {}) => interpolated {}",
            time,
            lower_time,
            upper_time,
            lower_ord,
            upper_ord,
            ordinal
        );
        Some(ordinal)
    }
}

/// Convert one input's requested time windows into instruction ranges.
///
/// Returns `None` when the windows cover the entire input (no restriction
/// needed).  An input with no overlap at all gets a sentinel `u64::MAX` start
/// so it never runs.
pub(crate) fn regions_from_times(
    interpolator: &TimeInterpolator,
    times_of_interest: &[TimeRange],
) -> Result<Option<Vec<InstrRange>>> {
    let mut ranges: Vec<InstrRange> = Vec::new();
    let mut entire_input = false;
    for times in times_of_interest {
        let mut instr_start = 0;
        let mut instr_end = 0;
        let has_start = match interpolator.lookup(times.start_timestamp) {
            Some(ordinal) => {
                instr_start = ordinal;
                true
            }
            None => false,
        };
        let has_end = if times.stop_timestamp == 0 {
            true
        } else {
            match interpolator.lookup(times.stop_timestamp) {
                Some(ordinal) => {
                    instr_end = ordinal;
                    true
                }
                None => false,
            }
        };
        if has_start && has_end && instr_start == instr_end {
            if instr_start == 0 && instr_end == 0 {
                entire_input = true;
            } else {
                instr_end += 1;
            }
        }
        // Without a start we include from the first instruction; without an
        // end, 0 means end-of-trace.
        if instr_start > 0 || instr_end > 0 {
            if let Some(last) = ranges.last() {
                if last.stop_instruction >= instr_start || last.stop_instruction == 0 {
                    return Err(SchedulerError::InvalidParameter(
                        "times_of_interest are too close together: corresponding \
                         instruction ordinals are overlapping or adjacent"
                            .to_string(),
                    ));
                }
            }
            ranges.push(InstrRange::new(instr_start.max(1), instr_end));
        }
    }
    if entire_input {
        return Ok(None);
    }
    if ranges.is_empty() {
        // No overlap with any window: park the input forever.
        ranges.push(InstrRange::new(u64::MAX, 0));
    }
    Ok(Some(ranges))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn interpolator(points: &[(u64, u64)]) -> TimeInterpolator {
        let mut interp = TimeInterpolator::default();
        for (time, ord) in points {
            interp.insert(*time, *ord);
        }
        interp
    }

    #[test]
    fn interpolates_linearly_rounding_down() {
        let interp = interpolator(&[(500, 0), (1500, 50), (2500, 200)]);
        assert_eq!(interp.lookup(1000), Some(25));
        assert_eq!(interp.lookup(2000), Some(125));
        assert_eq!(interp.lookup(500), Some(0));
        assert_eq!(interp.lookup(1500), Some(50));
        // 1999 -> 50 + 0.499 * 150 = 124.85, rounded down.
        assert_eq!(interp.lookup(1999), Some(124));
    }

    #[test]
    fn out_of_bounds_has_no_overlap() {
        let interp = interpolator(&[(500, 0), (1500, 50)]);
        assert_eq!(interp.lookup(499), None);
        assert_eq!(interp.lookup(1500), None);
        assert_eq!(interp.lookup(9999), None);
    }

    #[test]
    fn derives_region_from_window() {
        let interp = interpolator(&[(500, 0), (1500, 50), (2500, 200)]);
        let regions = regions_from_times(
            &interp,
            &[TimeRange {
                start_timestamp: 1000,
                stop_timestamp: 2000,
            }],
        )
        .unwrap()
        .unwrap();
        assert_eq!(regions, vec![InstrRange::new(25, 125)]);
    }

    #[test]
    fn no_overlap_parks_the_input() {
        let interp = interpolator(&[(500, 0), (1500, 50)]);
        let regions = regions_from_times(
            &interp,
            &[TimeRange {
                start_timestamp: 100_000,
                stop_timestamp: 200_000,
            }],
        )
        .unwrap()
        .unwrap();
        assert_eq!(regions, vec![InstrRange::new(u64::MAX, 0)]);
    }

    #[test]
    fn adjacent_windows_rejected() {
        let interp = interpolator(&[(0, 0), (1000, 100), (2000, 200), (3000, 300)]);
        let err = regions_from_times(
            &interp,
            &[
                TimeRange {
                    start_timestamp: 100,
                    stop_timestamp: 500,
                },
                TimeRange {
                    start_timestamp: 500,
                    stop_timestamp: 900,
                },
            ],
        )
        .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidParameter(_)));
    }

    #[test]
    fn full_coverage_means_no_restriction() {
        let interp = interpolator(&[(500, 0), (1500, 50)]);
        // Both endpoints interpolate to ordinal 0: the window covers the
        // whole input and no region is needed.
        let regions = regions_from_times(
            &interp,
            &[TimeRange {
                start_timestamp: 500,
                stop_timestamp: 505,
            }],
        )
        .unwrap();
        assert_eq!(regions, None);
    }
}
