//! Failure code tracking
//!
//! Counts block failures per mode so that aggregated segment and splitfile
//! failures can report what went wrong without carrying every error.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::error::FailureMode;

/// Tally of failures keyed by failure mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureCodeTracker<M: FailureMode> {
    codes: BTreeMap<M, u64>,
}

impl<M: FailureMode> Default for FailureCodeTracker<M> {
    fn default() -> Self {
        Self {
            codes: BTreeMap::new(),
        }
    }
}

impl<M: FailureMode> FailureCodeTracker<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure.
    pub fn inc(&mut self, mode: M) {
        self.inc_by(mode, 1);
    }

    /// Record several failures of the same mode.
    pub fn inc_by(&mut self, mode: M, count: u64) {
        if count > 0 {
            *self.codes.entry(mode).or_insert(0) += count;
        }
    }

    /// Fold another tracker into this one.
    pub fn merge(&mut self, other: &FailureCodeTracker<M>) {
        for (mode, count) in &other.codes {
            self.inc_by(*mode, *count);
        }
    }

    pub fn get(&self, mode: M) -> u64 {
        self.codes.get(&mode).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.codes.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    /// True if any recorded mode is fatal.
    pub fn is_fatal(&self) -> bool {
        self.codes.keys().any(|mode| mode.is_fatal())
    }

    /// The most frequently recorded mode, preferring fatal modes on ties.
    pub fn dominant(&self) -> Option<M> {
        self.codes
            .iter()
            .max_by_key(|(mode, count)| (**count, mode.is_fatal()))
            .map(|(mode, _)| *mode)
    }

    pub fn iter(&self) -> impl Iterator<Item = (M, u64)> + '_ {
        self.codes.iter().map(|(mode, count)| (*mode, *count))
    }
}

impl<M: FailureMode> fmt::Display for FailureCodeTracker<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (mode, count) in &self.codes {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{} x{}", mode, count)?;
            first = false;
        }
        Ok(())
    }
}
