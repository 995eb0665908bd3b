// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface to the host controller that actually moves commands and
//! data to the card.

use crate::queue::Shared;
use crate::request::Direction;
use mmc_spec::CardStatus;
use mmc_spec::Opcode;
use std::sync::Arc;
use thiserror::Error;

/// A command to send to the card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub arg: u32,
    /// The data phase, for commands that transfer data.
    pub data: Option<DataTransfer>,
}

impl Command {
    pub fn new(opcode: Opcode, arg: u32) -> Self {
        Self {
            opcode,
            arg,
            data: None,
        }
    }

    pub fn with_data(mut self, data: DataTransfer) -> Self {
        self.data = Some(data);
        self
    }
}

/// Describes the data phase of a command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DataTransfer {
    pub direction: Direction,
    pub lba: u32,
    pub block_count: u16,
    /// The request tag for direct transfers, or the task id for queued
    /// task execution.
    pub tag: u8,
}

/// An error returned by the host controller for a single command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("command timed out")]
    Timeout,
    #[error("response crc error")]
    Crc,
    #[error("data phase failed")]
    Data,
    #[error("card reported error status {0:#x}")]
    Status(u32),
    #[error("command not supported by the card in its current state")]
    Illegal,
    #[error("card was removed")]
    Gone,
    #[error("completion was dropped")]
    Dropped,
}

impl CommandError {
    /// Converts an R1 response with error bits set into an error.
    pub fn check_status(response: u32) -> Result<CardStatus, Self> {
        let status = CardStatus::from_bits(response);
        if status.has_command_error() {
            Err(Self::Status(response))
        } else {
            Ok(status)
        }
    }

    /// Returns true if issuing the command again may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Gone | Self::Illegal)
    }
}

/// The host controller driving the card.
pub trait HostTransport: Send + Sync {
    /// Issues a command without a data phase and waits for its response.
    fn issue(&self, command: &Command) -> Result<u32, CommandError>;

    /// Starts a command with a data phase. `completion` must eventually be
    /// completed, typically from the controller's interrupt path.
    fn issue_data(&self, command: Command, completion: CommandCompletion);

    /// Power cycles or hardware resets the card.
    ///
    /// Completions for data phases started before the reset may still
    /// arrive, including the [`CommandError::Dropped`] report of a discarded
    /// [`CommandCompletion`]. The queue ignores any completion that does not
    /// match the data phase or direct transfer it currently has active, and
    /// waits out the configured settle delay before resetting so that
    /// transfers in flight can finish first.
    fn hw_reset(&self) -> Result<(), CommandError>;

    /// Returns true if the controller reports data phase completion
    /// asynchronously. Otherwise the sequencer waits for each data phase
    /// before doing anything else.
    fn cqe_can_doorbell(&self) -> bool {
        true
    }
}

/// The continuation for a command issued with
/// [`HostTransport::issue_data`].
///
/// Dropping it without completing reports [`CommandError::Dropped`].
pub struct CommandCompletion {
    shared: Option<Arc<Shared>>,
    opcode: Opcode,
    tag: u8,
}

impl std::fmt::Debug for CommandCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandCompletion")
            .field("opcode", &self.opcode)
            .field("tag", &self.tag)
            .finish()
    }
}

impl CommandCompletion {
    pub(crate) fn new(shared: Arc<Shared>, opcode: Opcode, tag: u8) -> Self {
        Self {
            shared: Some(shared),
            opcode,
            tag,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn complete(mut self, result: Result<(), CommandError>) {
        if let Some(shared) = self.shared.take() {
            shared.data_completed(self.opcode, self.tag, result);
        }
    }
}

impl Drop for CommandCompletion {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.data_completed(self.opcode, self.tag, Err(CommandError::Dropped));
        }
    }
}
