// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A software command queue for eMMC hosts.
//!
//! The queue accepts tagged block requests and runs them against the card in
//! one of two modes: one transfer at a time, or emulating a hardware command
//! queue engine by driving the card's task queue commands from software. A
//! periodic arbiter picks the mode from the observed access pattern, and
//! failures are handled by resetting the card and replaying the affected
//! requests.

mod arbiter;
mod backoff;
mod config;
mod history;
mod node_pool;
mod queue;
mod recovery;
mod request;
mod sequencer;
mod slot_table;
mod tagged;
mod transport;

#[cfg(test)]
mod tests;

pub use arbiter::Mode;
pub use config::SwcqConfig;
pub use history::HistoryEntry;
pub use history::HistoryEvent;
pub use history::HistoryFlags;
pub use queue::DeviceInfo;
pub use queue::Diagnostics;
pub use queue::DisableError;
pub use queue::EnableError;
pub use queue::SoftwareQueue;
pub use queue::StateSnapshot;
pub use queue::SubmitError;
pub use queue::WaitIdleError;
pub use recovery::RecoveryState;
pub use request::Direction;
pub use request::Request;
pub use request::RequestError;
pub use request::RequestFlags;
pub use transport::Command;
pub use transport::CommandCompletion;
pub use transport::CommandError;
pub use transport::DataTransfer;
pub use transport::HostTransport;

/// Number of request tags, and so of arrival slots.
pub const NUM_SLOTS: usize = 64;

/// Maximum depth of the card's task queue.
pub const MAX_QUEUE_DEPTH: usize = mmc_spec::MAX_TASKS;
