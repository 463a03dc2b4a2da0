/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

// Recorded thread/process identities:
//--------------------------------------------------------------------------------

/// The thread id a record was traced under.
#[derive(
    PartialEq, // Silly protection from rustfmt disagreements.
    Debug,
    Eq,
    Clone,
    Copy,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Default,
)]
pub struct Tid(i64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Tid {
    /// Create a `Tid` from a raw traced thread id.
    pub const fn from_raw(tid: i64) -> Tid {
        Tid(tid)
    }

    /// Convert to a raw integer.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl FromStr for Tid {
    type Err = <i64 as FromStr>::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_raw(s.parse::<i64>()?))
    }
}

/// The process id a record was traced under.
#[derive(
    PartialEq, Debug, Eq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Pid(i64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Pid {
    /// Create a `Pid` from a raw traced process id.
    pub const fn from_raw(pid: i64) -> Pid {
        Pid(pid)
    }

    /// Convert to a raw integer.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

/// 0-based ordinal of an input (one recorded thread or shard).
pub type InputIndex = usize;

/// 0-based ordinal of an output (one synthesized stream / logical cpu).
pub type OutputIndex = usize;

/// 0-based ordinal of a workload within a scheduler instance.
pub type WorkloadIndex = usize;
