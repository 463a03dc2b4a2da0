/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The priority structure behind the ready and unscheduled queues.
//!
//! Entries are selected by 3 factors:
//! 1. Their priority (higher runs first).
//! 2. Their timestamp delta, when timestamp dependence is on.
//! 3. Their FIFO turn, assigned at insertion time.
//! compared in that order.  Turns monotonically increase across the entire
//! queue, so FIFO order among equal priorities is stable.  Re-inserting an
//! entry with its previous key (after a binding-incompatible pop) preserves
//! its place in line.
//!
//! Keys are snapshots taken at insertion: a queued input whose priority
//! changes is re-keyed by erase + push, never mutated in place.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;
use tracesched_model::InputIndex;

/// The user-settable priority of an input.  Higher runs first.
pub type Priority = i32;

/// The default priority for an input without a thread modifier.
pub const DEFAULT_PRIORITY: Priority = 0;

/// The key that uniquely determines what runs next.
/// Keys that compare lower run first.
#[derive(Debug, Copy, Clone)]
pub struct QueueKey {
    /// Higher priorities run first, so priority compares inverted.
    pub priority: Priority,
    /// Trace timestamp minus the workload base; 0 when timestamp ordering
    /// is off.  Smaller (= earlier in the recording) runs first.
    pub timestamp_delta: u64,
    /// FIFO turn within equal priority and delta.
    pub turn: u64,
}

// These spell out the intended order: priority descending, then delta and
// turn ascending.
impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.timestamp_delta.cmp(&other.timestamp_delta))
            .then(self.turn.cmp(&other.turn))
    }
}
impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for QueueKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}
impl Eq for QueueKey {}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(p: {}, d: {}, t: {})",
            self.priority, self.timestamp_delta, self.turn
        )
    }
}

/// A run queue over input ordinals.
///
/// We use a flattened `BTreeMap` (rather than a priority -> vector map) to
/// simplify peek/pop logic and give each input one global key, which makes
/// erase and random selection straightforward.  A `BinaryHeap` would have to
/// be rebuilt to remove an arbitrary entry.
#[derive(Debug)]
pub struct RunQueue {
    queue: BTreeMap<QueueKey, InputIndex>,
    /// Reverse index for `contains`/`erase`.
    by_input: HashMap<InputIndex, QueueKey>,
    last_turn: u64,
    prng: Pcg64Mcg,
}

/// A multi-line print of the queue contents.
impl fmt::Display for RunQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Run queue, size={}, last_turn={}:", self.queue.len(), self.last_turn)?;
        for (key, input) in self.queue.iter() {
            writeln!(f, "    {} => input {}", key, input)?;
        }
        Ok(())
    }
}

impl RunQueue {
    /// Create a new queue.  The seed drives `pop_random` only.
    pub fn new(seed: u64) -> Self {
        RunQueue {
            queue: BTreeMap::new(),
            by_input: HashMap::new(),
            last_turn: 0,
            prng: Pcg64Mcg::seed_from_u64(seed),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the input is queued.
    pub fn contains(&self, input: InputIndex) -> bool {
        self.by_input.contains_key(&input)
    }

    /// Queue an input at the back of its priority level, returning the key it
    /// was stored under.
    pub fn push(
        &mut self,
        input: InputIndex,
        priority: Priority,
        timestamp_delta: u64,
    ) -> QueueKey {
        self.last_turn += 1;
        let key = QueueKey {
            priority,
            timestamp_delta,
            turn: self.last_turn,
        };
        self.insert(input, key);
        key
    }

    /// Re-queue an input under a key obtained from a prior `pop`/`erase`,
    /// preserving its FIFO position.
    pub fn reinsert(&mut self, input: InputIndex, key: QueueKey) {
        self.insert(input, key);
    }

    fn insert(&mut self, input: InputIndex, key: QueueKey) {
        assert!(
            !self.by_input.contains_key(&input),
            "invariant violation: input {} is already queued:\n{}",
            input,
            self
        );
        let old = self.queue.insert(key, input);
        assert!(old.is_none()); // Turns guarantee unique keys.
        self.by_input.insert(input, key);
    }

    /// The input that would pop next.
    pub fn top(&self) -> Option<InputIndex> {
        self.queue.iter().next().map(|(_k, input)| *input)
    }

    /// Remove and return the front entry.
    pub fn pop(&mut self) -> Option<(InputIndex, QueueKey)> {
        let (key, input) = self.queue.pop_first()?;
        self.by_input.remove(&input);
        Some((input, key))
    }

    /// Remove and return a uniformly random entry.
    pub fn pop_random(&mut self) -> Option<(InputIndex, QueueKey)> {
        if self.queue.is_empty() {
            return None;
        }
        let nth = self.prng.gen_range(0..self.queue.len());
        let key = *self.queue.keys().nth(nth).unwrap();
        let input = self.queue.remove(&key).unwrap();
        self.by_input.remove(&input);
        Some((input, key))
    }

    /// Remove a specific input, returning the key it held.
    pub fn erase(&mut self, input: InputIndex) -> Option<QueueKey> {
        let key = self.by_input.remove(&input)?;
        let removed = self.queue.remove(&key);
        debug_assert_eq!(removed, Some(input));
        Some(key)
    }

    /// Iterate queued inputs in run order.
    pub fn iter(&self) -> impl Iterator<Item = InputIndex> + '_ {
        self.queue.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fifo_within_priority() {
        let mut q = RunQueue::new(0);
        q.push(7, DEFAULT_PRIORITY, 0);
        q.push(3, DEFAULT_PRIORITY, 0);
        q.push(5, DEFAULT_PRIORITY, 0);
        assert_eq!(q.pop().unwrap().0, 7);
        assert_eq!(q.pop().unwrap().0, 3);
        assert_eq!(q.pop().unwrap().0, 5);
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn higher_priority_wins() {
        let mut q = RunQueue::new(0);
        q.push(1, 0, 0);
        q.push(2, 5, 0);
        q.push(3, -1, 0);
        assert_eq!(q.pop().unwrap().0, 2);
        assert_eq!(q.pop().unwrap().0, 1);
        assert_eq!(q.pop().unwrap().0, 3);
    }

    #[test]
    fn smaller_timestamp_delta_wins_within_priority() {
        let mut q = RunQueue::new(0);
        q.push(1, 0, 900);
        q.push(2, 0, 100);
        q.push(3, 1, 5000);
        assert_eq!(q.pop().unwrap().0, 3);
        assert_eq!(q.pop().unwrap().0, 2);
        assert_eq!(q.pop().unwrap().0, 1);
    }

    #[test]
    fn reinsert_preserves_order() {
        let mut q = RunQueue::new(0);
        q.push(1, 0, 0);
        q.push(2, 0, 0);
        q.push(3, 0, 0);
        // Pop 1, skip it (e.g. binding mismatch), put it back.
        let (input, key) = q.pop().unwrap();
        assert_eq!(input, 1);
        q.reinsert(input, key);
        // It is still first in line.
        assert_eq!(q.pop().unwrap().0, 1);
        assert_eq!(q.pop().unwrap().0, 2);
    }

    #[test]
    fn erase_then_repush_goes_to_back() {
        let mut q = RunQueue::new(0);
        q.push(1, 0, 0);
        q.push(2, 0, 0);
        assert!(q.contains(1));
        q.erase(1).unwrap();
        assert!(!q.contains(1));
        q.push(1, 0, 0);
        assert_eq!(q.pop().unwrap().0, 2);
        assert_eq!(q.pop().unwrap().0, 1);
    }

    #[test]
    fn pop_random_is_deterministic_per_seed() {
        let run = |seed| {
            let mut q = RunQueue::new(seed);
            for i in 0..10 {
                q.push(i, 0, 0);
            }
            let mut order = Vec::new();
            while let Some((input, _)) = q.pop_random() {
                order.push(input);
            }
            order
        };
        assert_eq!(run(42), run(42));
    }
}
