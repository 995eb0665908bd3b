// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The sequencer thread, which owns all command queue protocol traffic.
//!
//! Each queued task goes through four commands: the task parameters
//! (CMD44) and task address (CMD45) queue it on the card, queue status polls
//! (CMD13) find out when the card is ready for it, and an execute command
//! (CMD46 or CMD47) runs its data phase. Only one data phase is active at a
//! time; the address phases of other tasks are sent while it runs.

use crate::backoff::Backoff;
use crate::history::HistoryEvent;
use crate::queue::PumpContext;
use crate::queue::Shared;
use crate::recovery::RecoveryCause;
use crate::request::Direction;
use crate::request::RequestError;
use crate::transport::Command;
use crate::transport::CommandCompletion;
use crate::transport::CommandError;
use crate::transport::DataTransfer;
use mmc_spec::CardState;
use mmc_spec::CardStatus;
use mmc_spec::ExecuteTaskArg;
use mmc_spec::Opcode;
use mmc_spec::SendStatusArg;
use mmc_spec::MAX_TASKS;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

#[derive(Debug)]
pub(crate) enum SequencerEvent {
    /// New tasks were queued.
    Kick,
    /// A data phase finished.
    DataDone {
        task: u8,
        result: Result<(), CommandError>,
    },
    Shutdown,
}

enum Wake {
    Event,
    Timeout,
    Shutdown,
}

pub(crate) struct Sequencer {
    shared: Arc<Shared>,
    events: flume::Receiver<SequencerEvent>,
    /// A data phase completion not yet processed.
    pending: Option<(u8, Result<(), CommandError>)>,
    /// The task whose data phase is running.
    data_active: Option<u8>,
    /// A finished task waiting to be retired.
    notify: Option<(u8, Option<RequestError>)>,
    /// Tasks queued on the card but not yet reported ready.
    waiting: usize,
    not_ready_since: Option<Instant>,
    backoff: Backoff,
    shutdown: bool,
}

impl Sequencer {
    pub fn new(shared: Arc<Shared>, events: flume::Receiver<SequencerEvent>) -> Self {
        let backoff = Backoff::new(shared.config.poll_spin, shared.config.poll_interval);
        Self {
            shared,
            events,
            pending: None,
            data_active: None,
            notify: None,
            waiting: 0,
            not_ready_since: None,
            backoff,
            shutdown: false,
        }
    }

    pub fn run(mut self) {
        while !self.shutdown {
            self.step();
        }
        tracing::debug!("sequencer stopped");
    }

    fn handle(&mut self, event: SequencerEvent) {
        match event {
            SequencerEvent::Kick => {}
            SequencerEvent::DataDone { task, result } => {
                if self.data_active == Some(task) && self.pending.is_none() {
                    self.pending = Some((task, result));
                } else {
                    tracing::debug!(task, "ignoring stale data completion");
                }
            }
            SequencerEvent::Shutdown => self.shutdown = true,
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Wake {
        let event = match timeout {
            Some(timeout) => match self.events.recv_timeout(timeout) {
                Ok(event) => event,
                Err(flume::RecvTimeoutError::Timeout) => return Wake::Timeout,
                Err(flume::RecvTimeoutError::Disconnected) => SequencerEvent::Shutdown,
            },
            None => self.events.recv().unwrap_or(SequencerEvent::Shutdown),
        };
        self.handle(event);
        if self.shutdown {
            Wake::Shutdown
        } else {
            Wake::Event
        }
    }

    fn step(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.handle(event);
        }
        if self.shutdown {
            return;
        }

        if let Some((task, result)) = self.pending.take() {
            self.data_active = None;
            match result.and_then(|()| self.post_process(task)) {
                Ok(status) => self.notify = Some((task, status)),
                Err(error) => {
                    self.recover_task(task, error, |tag, error| RecoveryCause::Transfer {
                        tag,
                        error,
                    });
                    return;
                }
            }
        }

        if self.data_active.is_none() && !self.shared.state.lock().switching {
            if let Some(task) = self.shared.data_queue.pop() {
                self.execute(task);
                if self.shutdown {
                    return;
                }
            }
        }

        if let Some((task, status)) = self.notify.take() {
            self.retire(task, status);
        }

        if self.shared.data_queue.is_empty() {
            while let Some(task) = self.shared.command_queue.pop() {
                if let Err(error) = self.queue_task(task) {
                    self.recover_task(task, error, |tag, error| RecoveryCause::AddressPhase {
                        tag,
                        error,
                    });
                    return;
                }
                self.waiting += 1;
            }
        }

        if let Some(task) = self.data_active {
            if let Wake::Timeout = self.wait(Some(self.shared.config.data_timeout)) {
                tracing::warn!(task, "data phase still running");
            }
            return;
        }

        if self.waiting > 0 && self.shared.data_queue.is_empty() {
            self.poll_ready();
            return;
        }

        let wait = if self.try_park() {
            None
        } else {
            Some(self.shared.config.poll_interval)
        };
        self.wait(wait);
    }

    /// Finishes a write by waiting for the card to leave the programming
    /// state.
    fn post_process(&mut self, task: u8) -> Result<Option<RequestError>, CommandError> {
        let (direction, rca) = {
            let state = self.shared.state.lock();
            let entry = state
                .tagged
                .get(task)
                .expect("active task must be installed");
            (
                entry.request.direction,
                state.device.map_or(0, |device| device.rca),
            )
        };
        if direction == Direction::Read {
            return Ok(None);
        }

        let arg = SendStatusArg::new().with_rca(rca).into_bits();
        let deadline = Instant::now() + self.shared.config.status_timeout;
        let mut backoff = Backoff::new(
            self.shared.config.poll_spin,
            self.shared.config.poll_interval,
        );
        loop {
            let response = self.shared.issue(
                &Command::new(Opcode::SEND_STATUS, arg),
                self.shared.config.command_retries,
            )?;
            let status = CardStatus::from_bits(response);
            if status.wp_violation() {
                tracing::warn!(task, "write hit a write protected area");
                return Ok(Some(RequestError::WriteProtected));
            }
            if status.state() == CardState::TRAN {
                return Ok(None);
            }
            if Instant::now() >= deadline {
                return Err(CommandError::Timeout);
            }
            backoff.back_off();
        }
    }

    /// Starts the data phase of a ready task.
    fn execute(&mut self, task: u8) {
        let (command, tag) = {
            let state = self.shared.state.lock();
            let entry = state
                .tagged
                .get(task)
                .expect("ready task must be installed");
            let request = &entry.request;
            let opcode = match request.direction {
                Direction::Read => Opcode::EXECUTE_READ_TASK,
                Direction::Write => Opcode::EXECUTE_WRITE_TASK,
            };
            let command = Command::new(opcode, ExecuteTaskArg::new().with_task_id(task).into_bits())
                .with_data(DataTransfer {
                    direction: request.direction,
                    lba: request.lba,
                    block_count: request.block_count,
                    tag: task,
                });
            self.shared.record(
                &state,
                HistoryEvent::Execute { opcode, task },
                Some(request.tag),
                request.block_count,
            );
            (command, request.tag)
        };
        tracing::trace!(task, tag, "executing task");

        self.data_active = Some(task);
        let completion = CommandCompletion::new(self.shared.clone(), command.opcode, task);
        self.shared.transport.issue_data(command, completion);

        if !self.shared.transport.cqe_can_doorbell() {
            let deadline = Instant::now() + self.shared.config.data_timeout;
            while self.pending.is_none() {
                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(task, "timed out waiting for data phase");
                    break;
                }
                if let Wake::Shutdown = self.wait(Some(deadline - now)) {
                    break;
                }
            }
        }
    }

    /// Completes a finished task and frees its task id.
    fn retire(&mut self, task: u8, status: Option<RequestError>) {
        let entry = {
            let mut state = self.shared.state.lock();
            let entry = state.tagged.retire(task);
            self.shared.record(
                &state,
                HistoryEvent::Retire,
                Some(entry.request.tag),
                entry.request.block_count,
            );
            entry
        };
        let result = match status {
            None => Ok(()),
            Some(err) => Err(err),
        };
        // Refill the freed task id before running the continuation.
        self.shared.pump(PumpContext::Completion);
        self.shared.complete_request(entry.request, result);
    }

    /// Sends the address phase commands for a task.
    fn queue_task(&mut self, task: u8) -> Result<(), CommandError> {
        let extension = {
            let state = self.shared.state.lock();
            state
                .tagged
                .get(task)
                .expect("queued task must be installed")
                .extension
        };
        let response = self.shared.issue(
            &Command::new(Opcode::QUEUED_TASK_PARAMS, extension.params.into_bits()),
            0,
        )?;
        CommandError::check_status(response)?;
        let response = self.shared.issue(
            &Command::new(Opcode::QUEUED_TASK_ADDRESS, extension.address),
            0,
        )?;
        CommandError::check_status(response)?;
        self.shared
            .state
            .lock()
            .tagged
            .mark_queued_on_device(task);
        Ok(())
    }

    /// Asks the card which tasks are ready and queues their data phases.
    fn poll_ready(&mut self) {
        let rca = self
            .shared
            .state
            .lock()
            .device
            .map_or(0, |device| device.rca);
        let arg = SendStatusArg::new()
            .with_rca(rca)
            .with_queue_status(true)
            .into_bits();
        let bitmap = match self.shared.issue(
            &Command::new(Opcode::SEND_STATUS, arg),
            self.shared.config.command_retries,
        ) {
            Ok(bitmap) => bitmap,
            Err(error) => {
                self.recover(RecoveryCause::StatusPoll(error));
                return;
            }
        };

        let mut found = 0;
        {
            let mut state = self.shared.state.lock();
            for task in (0..MAX_TASKS as u8).filter(|task| bitmap & (1 << task) != 0) {
                if !state.tagged.is_queued_on_device(task) {
                    drop(state);
                    tracing::error!(task, bitmap, "card reported a task that is not queued");
                    self.recover(RecoveryCause::UnknownTask { bitmap });
                    return;
                }
                if self.data_active == Some(task) || state.tagged.is_data_phase_queued(task) {
                    continue;
                }
                state.tagged.mark_data_phase_queued(task);
                self.shared.data_queue.push(task);
                self.waiting -= 1;
                found += 1;
            }
        }

        if found > 0 {
            self.not_ready_since = None;
            self.backoff.reset();
            return;
        }

        let since = *self.not_ready_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.shared.config.stuck_threshold {
            tracing::error!(waiting = self.waiting, "card stopped reporting ready tasks");
            self.shared.history.dump_to_log("stuck card");
            self.recover(RecoveryCause::Stuck);
            return;
        }
        let delay = self.backoff.next_delay();
        if delay.is_zero() {
            std::thread::yield_now();
        } else {
            self.wait(Some(delay));
        }
    }

    /// Parks when no task is left. Returns false if there is still work.
    fn try_park(&mut self) -> bool {
        let mut state = self.shared.state.lock();
        if state.tagged.in_use() != 0
            || self.data_active.is_some()
            || !self.shared.command_queue.is_empty()
            || !self.shared.data_queue.is_empty()
        {
            return false;
        }
        if state.sequencer_active {
            state.sequencer_active = false;
            self.shared.record(&state, HistoryEvent::Park, None, 0);
            if !state.slots.is_empty() {
                self.shared.schedule_pump(&mut state);
            } else if state.hsq_active.is_none() {
                self.shared.set_timer(&mut state, false);
            }
            self.shared.changed.notify_all();
        }
        true
    }

    fn recover_task(
        &mut self,
        task: u8,
        error: CommandError,
        cause: impl FnOnce(u8, CommandError) -> RecoveryCause,
    ) {
        tracing::warn!(
            task,
            error = &error as &dyn std::error::Error,
            "task failed"
        );
        let tag = self
            .shared
            .state
            .lock()
            .tagged
            .get(task)
            .map(|entry| entry.request.tag);
        let cause = match tag {
            Some(tag) => cause(tag, error),
            None => RecoveryCause::StatusPoll(error),
        };
        self.recover(cause);
    }

    fn recover(&mut self, cause: RecoveryCause) {
        self.shared.recover(cause);
        self.pending = None;
        self.data_active = None;
        self.notify = None;
        self.waiting = 0;
        self.not_ready_since = None;
        self.backoff.reset();
    }
}
