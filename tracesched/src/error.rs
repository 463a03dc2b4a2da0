/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error kinds surfaced by scheduler init and record delivery.

use std::fmt;

/// Everything that can go wrong while configuring or driving the scheduler.
/// Validation problems are fatal at init; runtime unknowns degrade gracefully
/// and are logged instead of raised.
#[derive(PartialEq, Debug, Eq, Clone)]
pub enum SchedulerError {
    /// Bad option combination or out-of-bounds ordinal.
    InvalidParameter(String),
    FileOpen(String),
    FileRead(String),
    FileWrite(String),
    /// A requested skip landed outside the input.
    RangeInvalid(String),
    /// A malformed region of interest.
    RegionInvalid(String),
    NotImplemented(String),
    /// Internal logic error, including speculator failures.
    Invalid(String),
}

impl SchedulerError {
    /// The human-readable message carried by any kind.
    pub fn message(&self) -> &str {
        match self {
            SchedulerError::InvalidParameter(msg)
            | SchedulerError::FileOpen(msg)
            | SchedulerError::FileRead(msg)
            | SchedulerError::FileWrite(msg)
            | SchedulerError::RangeInvalid(msg)
            | SchedulerError::RegionInvalid(msg)
            | SchedulerError::NotImplemented(msg)
            | SchedulerError::Invalid(msg) => msg,
        }
    }
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            SchedulerError::InvalidParameter(_) => "invalid parameter",
            SchedulerError::FileOpen(_) => "file open failed",
            SchedulerError::FileRead(_) => "file read failed",
            SchedulerError::FileWrite(_) => "file write failed",
            SchedulerError::RangeInvalid(_) => "invalid range",
            SchedulerError::RegionInvalid(_) => "invalid region",
            SchedulerError::NotImplemented(_) => "not implemented",
            SchedulerError::Invalid(_) => "internal error",
        };
        write!(f, "{}: {}", kind, self.message())
    }
}

impl std::error::Error for SchedulerError {}

/// Reader implementations typically wrap decoders that surface
/// `anyhow::Error`; fold those into the internal kind, keeping the chain.
impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Invalid(format!("{:#}", err))
    }
}

/// Shorthand for engine results.
pub type Result<T> = std::result::Result<T, SchedulerError>;
