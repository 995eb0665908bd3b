// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Card recovery.
//!
//! On a failure anywhere in the pipeline the card is brought back to the
//! transfer state, its queue is discarded, and it is reset and reconfigured.
//! Every request that had been handed to the card then goes back to its
//! arrival slot to be dispatched from scratch.

use crate::arbiter::Mode;
use crate::backoff::Backoff;
use crate::history::HistoryEvent;
use crate::queue::DeviceInfo;
use crate::queue::PumpContext;
use crate::queue::SchedulerState;
use crate::queue::Shared;
use crate::request::Request;
use crate::request::RequestError;
use crate::transport::Command;
use crate::transport::CommandError;
use mmc_spec::ext_csd;
use mmc_spec::switch_access;
use mmc_spec::CardState;
use mmc_spec::CardStatus;
use mmc_spec::Opcode;
use mmc_spec::SendStatusArg;
use mmc_spec::SwitchArg;
use mmc_spec::TaskMgmtArg;
use mmc_spec::TaskMgmtOp;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Progress of a recovery cycle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RecoveryState {
    #[default]
    Normal,
    /// Quiescing the card and discarding its queue.
    Discarding,
    /// Resetting and reconfiguring the card.
    Resetting,
    /// Returning requests to their slots.
    Restoring,
}

/// What triggered recovery.
#[derive(Debug)]
pub(crate) enum RecoveryCause {
    /// The data phase of the request with this tag failed.
    Transfer { tag: u8, error: CommandError },
    /// Queueing the request with this tag on the card failed.
    AddressPhase { tag: u8, error: CommandError },
    /// Reading the queue status failed.
    StatusPoll(CommandError),
    /// The card reported a task that was never queued.
    UnknownTask { bitmap: u32 },
    /// The card stopped reporting ready tasks.
    Stuck,
    /// The card refused to change execution mode.
    ModeSwitch(CommandError),
}

impl RecoveryCause {
    /// The request blamed for the failure, if any.
    fn failed(&self) -> Option<(u8, &CommandError)> {
        match self {
            Self::Transfer { tag, error } | Self::AddressPhase { tag, error } => Some((*tag, error)),
            _ => None,
        }
    }
}

impl fmt::Display for RecoveryCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transfer { tag, error } => write!(f, "transfer for tag {tag} failed: {error}"),
            Self::AddressPhase { tag, error } => {
                write!(f, "queueing tag {tag} failed: {error}")
            }
            Self::StatusPoll(error) => write!(f, "queue status poll failed: {error}"),
            Self::UnknownTask { bitmap } => {
                write!(f, "card reported unknown ready tasks {bitmap:#010x}")
            }
            Self::Stuck => f.write_str("card stopped reporting ready tasks"),
            Self::ModeSwitch(error) => write!(f, "mode switch failed: {error}"),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum RecoveryError {
    #[error("failed to read card status")]
    Status(#[source] CommandError),
    #[error("card did not return to the transfer state")]
    TransferTimeout,
    #[error("failed to discard the card queue")]
    Discard(#[source] CommandError),
    #[error("hardware reset failed")]
    Reset(#[source] CommandError),
    #[error("failed to select the user partition")]
    Partition(#[source] CommandError),
    #[error("failed to re-enable the command queue")]
    CmdqEnable(#[source] CommandError),
}

/// Moves every request held by the card back into its slot.
///
/// The blamed request is charged an attempt; once it has used up `retries`
/// it is returned for failing instead.
pub(crate) fn restore(
    state: &mut SchedulerState,
    failed: Option<(u8, &CommandError)>,
    retries: u32,
) -> Vec<(Request, RequestError)> {
    let mut requests: Vec<_> = state
        .hsq_active
        .take()
        .map(|active| (active.request, active.arrived))
        .into_iter()
        .collect();
    requests.extend(
        state
            .tagged
            .drain()
            .into_iter()
            .map(|(_, entry)| (entry.request, entry.arrived)),
    );

    let mut exhausted = Vec::new();
    for (mut request, arrived) in requests {
        if let Some((tag, error)) = failed {
            if request.tag == tag {
                request.attempts += 1;
                let attempts = request.attempts;
                if attempts > retries {
                    tracing::warn!(tag, attempts, "request failed, giving up");
                    exhausted.push((
                        request,
                        RequestError::Transfer {
                            attempts,
                            source: error.clone(),
                        },
                    ));
                    continue;
                }
            }
        }
        state.slots.record_at(request, arrived);
    }
    exhausted
}

impl Shared {
    fn set_recovery_state(&self, recovery: RecoveryState) {
        self.state.lock().recovery = recovery;
    }

    /// Runs a full recovery cycle. Blocks on card commands.
    pub fn recover(self: &Arc<Self>, cause: RecoveryCause) {
        let (device, device_mode) = {
            let mut state = self.state.lock();
            state.recovery = RecoveryState::Discarding;
            self.record(
                &state,
                HistoryEvent::Recovery,
                cause.failed().map(|(tag, _)| tag),
                0,
            );
            (state.device, state.device_mode)
        };
        tracing::warn!(%cause, "recovering card");

        let mut mode = device_mode;
        if let Some(device) = device {
            if let Err(err) = self.wait_for_transfer(&device) {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "card did not settle before reset"
                );
            }
            if device_mode == Mode::Cmdq {
                if let Err(err) = self.discard_queue() {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "failed to discard card queue"
                    );
                }
            }

            self.set_recovery_state(RecoveryState::Resetting);
            if !self.config.reset_settle_delay.is_zero() {
                std::thread::sleep(self.config.reset_settle_delay);
            }
            if let Err(err) = self.reset_card(&device, device_mode, &mut mode) {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "card reset failed"
                );
                self.history.dump_to_log("reset failure");
            }
        }

        let exhausted = {
            let mut state = self.state.lock();
            state.recovery = RecoveryState::Restoring;
            let exhausted = restore(&mut state, cause.failed(), self.config.request_retries);
            self.command_queue.clear();
            self.data_queue.clear();
            if state.device_mode != mode {
                tracing::info!(mode = ?mode, "card execution mode changed by reset");
                state.device_mode = mode;
            }
            if matches!(cause, RecoveryCause::ModeSwitch(_)) {
                state.mode = state.device_mode;
            }
            state.recovery = RecoveryState::Normal;
            self.changed.notify_all();
            exhausted
        };
        tracing::info!(failed = exhausted.len(), "recovery complete");

        for (request, error) in exhausted {
            self.complete_request(request, Err(error));
        }
        self.pump(PumpContext::Caller);
    }

    /// Waits for the card to return to the transfer state, stopping any
    /// transfer it is still in.
    fn wait_for_transfer(&self, device: &DeviceInfo) -> Result<(), RecoveryError> {
        let arg = SendStatusArg::new().with_rca(device.rca).into_bits();
        let deadline = Instant::now() + self.config.status_timeout;
        let mut backoff = Backoff::new(self.config.poll_spin, self.config.poll_interval);
        loop {
            let response = self
                .issue(
                    &Command::new(Opcode::SEND_STATUS, arg),
                    self.config.command_retries,
                )
                .map_err(RecoveryError::Status)?;
            match CardStatus::from_bits(response).state() {
                CardState::TRAN => return Ok(()),
                CardState::DATA | CardState::RCV => {
                    if let Err(err) = self.issue(
                        &Command::new(Opcode::STOP_TRANSMISSION, 0),
                        self.config.command_retries,
                    ) {
                        tracing::debug!(
                            error = &err as &dyn std::error::Error,
                            "stop transmission failed"
                        );
                    }
                }
                _ => {}
            }
            if Instant::now() >= deadline {
                return Err(RecoveryError::TransferTimeout);
            }
            backoff.back_off();
        }
    }

    fn discard_queue(&self) -> Result<(), RecoveryError> {
        let arg = TaskMgmtArg::new()
            .with_op(TaskMgmtOp::DISCARD_QUEUE.0)
            .into_bits();
        self.issue(
            &Command::new(Opcode::CMDQ_TASK_MGMT, arg),
            self.config.command_retries,
        )
        .and_then(CommandError::check_status)
        .map_err(RecoveryError::Discard)?;
        Ok(())
    }

    /// Resets the card and restores its configuration. `mode` tracks the
    /// execution mode the card is left in.
    fn reset_card(
        &self,
        device: &DeviceInfo,
        target: Mode,
        mode: &mut Mode,
    ) -> Result<(), RecoveryError> {
        self.transport.hw_reset().map_err(RecoveryError::Reset)?;
        *mode = Mode::Hsq;

        let switch = |index, value| {
            let arg = SwitchArg::new()
                .with_access(switch_access::WRITE_BYTE)
                .with_index(index)
                .with_value(value)
                .into_bits();
            self.issue(
                &Command::new(Opcode::SWITCH, arg),
                self.config.command_retries,
            )
            .and_then(CommandError::check_status)
        };
        switch(
            ext_csd::PART_CONFIG,
            device.part_config & !ext_csd::PART_CONFIG_ACCESS_MASK,
        )
        .map_err(RecoveryError::Partition)?;
        if target == Mode::Cmdq {
            switch(ext_csd::CMDQ_MODE_EN, 1).map_err(RecoveryError::CmdqEnable)?;
            *mode = Mode::Cmdq;
        }
        Ok(())
    }
}
