// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Selection between single-outstanding and command queue execution.
//!
//! A periodic timer samples the queued requests. Random small reads benefit
//! from the device command queue, while a single sequential stream is served
//! better by issuing one transfer at a time. A mode flip requires two
//! consecutive agreeing votes.

use crate::queue::Shared;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

/// Execution mode of the scheduler or the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// One transfer at a time, issued directly.
    Hsq,
    /// Multiple transfers queued on the device as tasks.
    Cmdq,
}

/// A queued read considered by the arbiter.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct ReadSample {
    pub lba: u32,
    pub blocks: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum VoteReason {
    TooFewQueued,
    TooFewReads,
    Stalled,
    Sequential,
    Discontiguous,
    NoTrackedReads,
    TrackedReads,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Vote {
    pub mode: Mode,
    pub reason: VoteReason,
}

/// What the arbiter observed during one period.
#[derive(Debug)]
pub(crate) struct Period<'a> {
    /// Requests queued but not yet handed to the device.
    pub queued: usize,
    /// Queued reads of the tracked size.
    pub reads: &'a mut [ReadSample],
    /// Tracked reads dispatched during the period.
    pub dispatched_reads: u32,
}

#[derive(Debug, Default)]
pub(crate) struct ModeArbiter {
    prev_vote: Option<Mode>,
    prev_checksum: u64,
}

impl ModeArbiter {
    pub fn vote(&mut self, current: Mode, vote_threshold: usize, period: Period<'_>) -> Vote {
        let (mode, reason) = match current {
            Mode::Cmdq => {
                if period.dispatched_reads == 0 {
                    (Mode::Hsq, VoteReason::NoTrackedReads)
                } else {
                    (Mode::Cmdq, VoteReason::TrackedReads)
                }
            }
            Mode::Hsq => self.vote_from_hsq(vote_threshold, period),
        };
        Vote { mode, reason }
    }

    fn vote_from_hsq(&mut self, vote_threshold: usize, period: Period<'_>) -> (Mode, VoteReason) {
        if period.queued < vote_threshold {
            return (Mode::Hsq, VoteReason::TooFewQueued);
        }
        let reads = period.reads;
        if reads.len() < vote_threshold {
            return (Mode::Hsq, VoteReason::TooFewReads);
        }
        // An unchanged sample means nothing is being serviced, so there is no
        // pattern to judge.
        let checksum = reads.iter().map(|r| u64::from(r.lba)).sum::<u64>();
        let stalled = checksum != 0 && checksum == self.prev_checksum;
        self.prev_checksum = checksum;
        if stalled {
            return (Mode::Hsq, VoteReason::Stalled);
        }
        reads.sort_unstable_by_key(|r| r.lba);
        let contiguous = reads
            .windows(2)
            .all(|w| u64::from(w[0].lba) + u64::from(w[0].blocks) == u64::from(w[1].lba));
        if contiguous {
            (Mode::Hsq, VoteReason::Sequential)
        } else {
            (Mode::Cmdq, VoteReason::Discontiguous)
        }
    }

    /// Applies hysteresis, returning the mode to switch to, if any.
    pub fn decide(&mut self, current: Mode, vote: Vote, transition_allowed: bool) -> Option<Mode> {
        let agreed = self.prev_vote == Some(vote.mode);
        self.prev_vote = Some(vote.mode);
        (agreed && transition_allowed && vote.mode != current).then_some(vote.mode)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
struct TimerState {
    armed: bool,
    shutdown: bool,
}

/// Control block for the arbiter timer thread.
#[derive(Debug, Default)]
pub(crate) struct ArbiterTimer {
    state: Mutex<TimerState>,
    cond: Condvar,
}

impl ArbiterTimer {
    pub fn set_armed(&self, armed: bool) {
        let mut state = self.state.lock();
        if state.armed != armed {
            state.armed = armed;
            self.cond.notify_all();
        }
    }

    pub fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Blocks until the next tick is due. Returns false on shutdown.
    fn wait_tick(&self, interval: std::time::Duration) -> bool {
        let mut state = self.state.lock();
        loop {
            self.cond
                .wait_while(&mut state, |state| !state.armed && !state.shutdown);
            if state.shutdown {
                return false;
            }
            let deadline = Instant::now() + interval;
            let timed_out = self
                .cond
                .wait_until(&mut state, deadline)
                .timed_out();
            if state.shutdown {
                return false;
            }
            if timed_out && state.armed {
                return true;
            }
        }
    }
}

pub(crate) fn run_timer(shared: Arc<Shared>) {
    while shared.timer.wait_tick(shared.config.check_interval) {
        shared.evaluate_mode();
    }
    tracing::debug!("arbiter timer stopped");
}
