//! Retry tracker
//!
//! Buckets the blocks of one request group by retry level (completed failed
//! attempts) and hands out the next block to try. The next block always
//! comes from the lowest occupied level and is picked uniformly at random
//! within it, so no block is systematically first or last under
//! congestion.
//!
//! Every block is in exactly one place at a time: one level set, the running
//! set, or one of the terminal sets (succeeded, exhausted, fatal).
//!
//! ```text
//! queued@L ──next_attempt──▶ running ──success──▶ succeeded
//!    ▲                         │ │
//!    └──── nonfatal (L+1) ─────┘ ├──nonfatal, L+1 > max──▶ exhausted
//!                                └──fatal──▶ fatal
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::failure::FailureCodeTracker;
use crate::error::{BlockCounts, Error, FailureMode, Result};

/// Where a block currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Queued { level: u32 },
    Running { level: u32 },
    Succeeded,
    Exhausted,
    Fatal,
}

impl BlockState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BlockState::Succeeded | BlockState::Exhausted | BlockState::Fatal
        )
    }
}

/// Result of a nonfatal failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Queued again at the given level
    Requeued { level: u32 },
    /// Out of retries
    Exhausted,
}

/// Per-group retry state machine over block indices.
#[derive(Debug)]
pub struct RetryTracker<M: FailureMode> {
    max_level: u32,
    levels: BTreeMap<u32, Vec<usize>>,
    queued: HashMap<usize, u32>,
    running: HashMap<usize, u32>,
    succeeded: BTreeSet<usize>,
    exhausted: BTreeSet<usize>,
    fatal: BTreeSet<usize>,
    tries: HashMap<usize, u32>,
    nonfatal_codes: FailureCodeTracker<M>,
    fatal_codes: FailureCodeTracker<M>,
    rng: StdRng,
    sealed: bool,
    killed: bool,
}

impl<M: FailureMode> RetryTracker<M> {
    /// Tracker allowing retry levels up to `max_level`.
    pub fn new(max_level: u32) -> Self {
        Self::with_rng(max_level, StdRng::from_entropy())
    }

    /// Tracker with a deterministic selection order.
    pub fn with_seed(max_level: u32, seed: u64) -> Self {
        Self::with_rng(max_level, StdRng::seed_from_u64(seed))
    }

    fn with_rng(max_level: u32, rng: StdRng) -> Self {
        Self {
            max_level,
            levels: BTreeMap::new(),
            queued: HashMap::new(),
            running: HashMap::new(),
            succeeded: BTreeSet::new(),
            exhausted: BTreeSet::new(),
            fatal: BTreeSet::new(),
            tries: HashMap::new(),
            nonfatal_codes: FailureCodeTracker::new(),
            fatal_codes: FailureCodeTracker::new(),
            rng,
            sealed: false,
            killed: false,
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Queue a new block at level 0.
    pub fn add_block(&mut self, block: usize) -> Result<()> {
        if self.sealed || self.killed {
            return Err(Error::InvalidState(format!(
                "cannot add block {} after the group started finishing",
                block
            )));
        }
        if self.state(block).is_some() {
            return Err(Error::InvalidState(format!("block {} already tracked", block)));
        }
        self.enqueue(block, 0);
        Ok(())
    }

    /// No more blocks will be added.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    /// Take a random block from the lowest occupied level and mark it running.
    ///
    /// `None` means nothing is queued (or the tracker was killed); blocks may
    /// still be running.
    pub fn next_attempt(&mut self) -> Option<usize> {
        if self.killed {
            return None;
        }
        let mut lowest = self.levels.first_entry()?;
        let level = *lowest.key();
        let blocks = lowest.get_mut();
        let pick = self.rng.gen_range(0..blocks.len());
        let block = blocks.swap_remove(pick);
        if blocks.is_empty() {
            lowest.remove();
        }
        self.queued.remove(&block);
        self.running.insert(block, level);
        Some(block)
    }

    /// A running block failed in a way worth retrying.
    pub fn report_non_fatal(&mut self, block: usize, mode: M) -> Result<RetryOutcome> {
        let level = self.take_running(block)?;
        *self.tries.entry(block).or_insert(0) += 1;
        self.nonfatal_codes.inc(mode);

        let next = level.saturating_add(1);
        if next > self.max_level {
            self.exhausted.insert(block);
            Ok(RetryOutcome::Exhausted)
        } else {
            self.enqueue(block, next);
            Ok(RetryOutcome::Requeued { level: next })
        }
    }

    /// A running block failed for good.
    pub fn report_fatal(&mut self, block: usize, mode: M) -> Result<()> {
        self.take_running(block)?;
        *self.tries.entry(block).or_insert(0) += 1;
        self.fatal_codes.inc(mode);
        self.fatal.insert(block);
        Ok(())
    }

    /// A running block completed.
    pub fn report_success(&mut self, block: usize) -> Result<()> {
        self.take_running(block)?;
        self.succeeded.insert(block);
        Ok(())
    }

    /// Stop handing out attempts. Queued blocks stay queued and terminal
    /// blocks are untouched; running blocks may still report.
    pub fn kill(&mut self) {
        self.killed = true;
    }

    fn enqueue(&mut self, block: usize, level: u32) {
        self.levels.entry(level).or_default().push(block);
        self.queued.insert(block, level);
    }

    fn take_running(&mut self, block: usize) -> Result<u32> {
        self.running
            .remove(&block)
            .ok_or_else(|| Error::InvalidState(format!("block {} is not running", block)))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Where `block` currently is, or `None` if it was never added.
    pub fn state(&self, block: usize) -> Option<BlockState> {
        if let Some(level) = self.queued.get(&block) {
            Some(BlockState::Queued { level: *level })
        } else if let Some(level) = self.running.get(&block) {
            Some(BlockState::Running { level: *level })
        } else if self.succeeded.contains(&block) {
            Some(BlockState::Succeeded)
        } else if self.exhausted.contains(&block) {
            Some(BlockState::Exhausted)
        } else if self.fatal.contains(&block) {
            Some(BlockState::Fatal)
        } else {
            None
        }
    }

    /// Failed attempts completed for `block`.
    pub fn tries(&self, block: usize) -> u32 {
        self.tries.get(&block).copied().unwrap_or(0)
    }

    /// Blocks that succeeded.
    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    /// Blocks that failed fatally.
    pub fn fatal_count(&self) -> usize {
        self.fatal.len()
    }

    /// Blocks that used up their retries.
    pub fn exhausted_count(&self) -> usize {
        self.exhausted.len()
    }

    /// Blocks with an attempt in flight.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Blocks waiting for an attempt.
    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Every block ever added, in any state.
    pub fn total_blocks(&self) -> usize {
        self.queued.len()
            + self.running.len()
            + self.succeeded.len()
            + self.exhausted.len()
            + self.fatal.len()
    }

    /// True while anything is queued (and not killed) or running.
    pub fn has_more_work(&self) -> bool {
        !self.running.is_empty() || (!self.killed && !self.levels.is_empty())
    }

    /// Blocks that have succeeded or still could.
    pub fn potential_successes(&self) -> usize {
        let queued = if self.killed { 0 } else { self.queued.len() };
        self.succeeded.len() + self.running.len() + queued
    }

    /// True once `kill` was called.
    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Indices of the blocks that succeeded.
    pub fn succeeded_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.succeeded.iter().copied()
    }

    /// Indices of the blocks with an attempt in flight.
    pub fn running_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.running.keys().copied()
    }

    /// Tallies for failure reports.
    pub fn counts(&self) -> BlockCounts {
        BlockCounts {
            succeeded: self.succeeded.len(),
            failed: self.exhausted.len(),
            fatal: self.fatal.len(),
            total: self.total_blocks(),
        }
    }

    /// Every failure reported so far, nonfatal and fatal.
    pub fn failure_codes(&self) -> FailureCodeTracker<M> {
        let mut codes = self.nonfatal_codes.clone();
        codes.merge(&self.fatal_codes);
        codes
    }

    /// Fatal failures reported so far.
    pub fn fatal_codes(&self) -> &FailureCodeTracker<M> {
        &self.fatal_codes
    }
}
