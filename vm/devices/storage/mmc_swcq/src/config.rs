// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Scheduler tuning knobs.

use std::time::Duration;

/// Policy constants for a [`SoftwareQueue`](crate::SoftwareQueue).
///
/// The defaults match the timing a production eMMC host uses. Tests and
/// emulated hosts typically shorten the delays.
#[derive(Debug, Clone)]
pub struct SwcqConfig {
    /// Period of the mode arbiter timer.
    pub check_interval: Duration,
    /// Minimum number of queued requests before the arbiter considers
    /// leaving single-outstanding mode, and minimum number of sampled reads.
    pub vote_threshold: usize,
    /// Block count of the reads the arbiter samples.
    pub tracked_read_blocks: u16,
    /// How long the device may report no ready task before it is reset.
    pub stuck_threshold: Duration,
    /// Bound on waiting for a data phase to complete.
    pub data_timeout: Duration,
    /// Bound on waiting for the card to return to the transfer state.
    pub status_timeout: Duration,
    /// How long to poll the queue status without sleeping.
    pub poll_spin: Duration,
    /// Delay between queue status polls once spinning has stopped.
    pub poll_interval: Duration,
    /// Bound on waiting for outstanding work when disabling.
    pub disable_timeout: Duration,
    /// Retries for control commands (status, stop, discard).
    pub command_retries: u32,
    /// Retries for a request whose transfer failed.
    pub request_retries: u32,
    /// Delay before a hardware reset during recovery.
    pub reset_settle_delay: Duration,
    /// Number of entries kept in the command history.
    pub history_depth: usize,
    /// The queue reports congestion once fewer than this many tags are left.
    pub congestion_margin: usize,
}

impl Default for SwcqConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(10),
            vote_threshold: 3,
            tracked_read_blocks: 8,
            stuck_threshold: Duration::from_secs(30),
            data_timeout: Duration::from_secs(10),
            status_timeout: Duration::from_secs(10),
            poll_spin: Duration::from_millis(1),
            poll_interval: Duration::from_millis(2),
            disable_timeout: Duration::from_millis(500),
            command_retries: 3,
            request_retries: 2,
            reset_settle_delay: Duration::from_secs(2),
            history_depth: 400,
            congestion_margin: 4,
        }
    }
}
