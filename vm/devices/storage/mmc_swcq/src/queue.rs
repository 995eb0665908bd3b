// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The software command queue.
//!
//! Requests are recorded in an arrival slot and then pumped. In
//! single-outstanding mode the pump issues the oldest request directly. In
//! command queue mode it converts as many requests as there are free task
//! ids into queued tasks and hands them to the sequencer thread.

use crate::arbiter::run_timer;
use crate::arbiter::ArbiterTimer;
use crate::arbiter::Mode;
use crate::arbiter::ModeArbiter;
use crate::arbiter::Period;
use crate::arbiter::ReadSample;
use crate::config::SwcqConfig;
use crate::history::CommandHistory;
use crate::history::EventContext;
use crate::history::HistoryEntry;
use crate::history::HistoryEvent;
use crate::history::HistoryFlags;
use crate::node_pool::NodeQueue;
use crate::recovery::RecoveryCause;
use crate::recovery::RecoveryState;
use crate::request::Direction;
use crate::request::Request;
use crate::request::RequestError;
use crate::sequencer::Sequencer;
use crate::sequencer::SequencerEvent;
use crate::slot_table::Arrival;
use crate::slot_table::SlotTable;
use crate::tagged::TaggedExecutionTable;
use crate::tagged::TaskExtension;
use crate::transport::Command;
use crate::transport::CommandCompletion;
use crate::transport::CommandError;
use crate::transport::DataTransfer;
use crate::transport::HostTransport;
use crate::MAX_QUEUE_DEPTH;
use crate::NUM_SLOTS;
use anyhow::Context;
use mmc_spec::ext_csd;
use mmc_spec::switch_access;
use mmc_spec::Opcode;
use mmc_spec::QueuedTaskParams;
use mmc_spec::SwitchArg;
use mmc_spec::BLOCK_SHIFT;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

const EVENT_QUEUE_DEPTH: usize = 2 * MAX_QUEUE_DEPTH;

/// Properties of the card, read during card initialization.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Relative card address.
    pub rca: u16,
    /// Depth of the card's command queue. Zero if the card has none.
    pub cmdq_depth: usize,
    /// The card addresses data in blocks rather than bytes.
    pub block_addressed: bool,
    /// The card's `PART_CONFIG` extended CSD byte.
    pub part_config: u8,
    /// The card's command queue is currently enabled.
    pub cmdq_enabled: bool,
}

/// An error submitting a request. The request is handed back.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("queue is not enabled")]
    Shutdown(Request),
    #[error("queue is halted for recovery")]
    Busy(Request),
    #[error("tag {} is out of range", .0.tag())]
    InvalidTag(Request),
    #[error("tag {} is already in use", .0.tag())]
    TagInUse(Request),
}

impl SubmitError {
    pub fn into_request(self) -> Request {
        match self {
            Self::Shutdown(request)
            | Self::Busy(request)
            | Self::InvalidTag(request)
            | Self::TagInUse(request) => request,
        }
    }
}

#[derive(Debug, Error)]
pub enum EnableError {
    #[error("queue is already enabled")]
    Busy,
    #[error("queue was never given device information")]
    NoDevice,
}

#[derive(Debug, Error)]
pub enum DisableError {
    #[error("timed out waiting for {outstanding} outstanding requests")]
    Timeout { outstanding: u32 },
}

#[derive(Debug, Error)]
pub enum WaitIdleError {
    #[error("queue is halted for recovery")]
    RecoveryHalt,
}

/// The request currently issued as a direct transfer.
#[derive(Debug)]
pub(crate) struct HsqActive {
    pub request: Request,
    pub arrived: Arrival,
}

#[derive(Debug)]
pub(crate) struct SchedulerState {
    pub enabled: bool,
    pub device: Option<DeviceInfo>,
    pub slots: SlotTable,
    pub tagged: TaggedExecutionTable,
    pub hsq_active: Option<HsqActive>,
    /// Bitmap of tags owned by the queue, from submission until the
    /// continuation has returned.
    pub outstanding: u64,
    /// The mode the scheduler wants.
    pub mode: Mode,
    /// The mode the card is in.
    pub device_mode: Mode,
    pub transition_allowed: bool,
    pub switching: bool,
    pub pump_busy: bool,
    pub deferred_pump: bool,
    pub sequencer_active: bool,
    pub timer_running: bool,
    pub recovery_halt: bool,
    pub recovery: RecoveryState,
    pub arbiter: ModeArbiter,
    pub read_count: u32,
    pub write_count: u32,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self {
            enabled: false,
            device: None,
            slots: SlotTable::new(NUM_SLOTS),
            tagged: TaggedExecutionTable::new(MAX_QUEUE_DEPTH),
            hsq_active: None,
            outstanding: 0,
            mode: Mode::Hsq,
            device_mode: Mode::Hsq,
            transition_allowed: false,
            switching: false,
            pump_busy: false,
            deferred_pump: false,
            sequencer_active: false,
            timer_running: false,
            recovery_halt: false,
            recovery: RecoveryState::Normal,
            arbiter: ModeArbiter::default(),
            read_count: 0,
            write_count: 0,
        }
    }

    /// Requests not yet handed to the device queue.
    pub fn queued(&self) -> usize {
        self.slots.len() + usize::from(self.hsq_active.is_some())
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding == 0 && !self.sequencer_active && self.recovery == RecoveryState::Normal
    }

    fn flags(&self) -> HistoryFlags {
        HistoryFlags::new()
            .with_cmdq_mode(self.mode == Mode::Cmdq)
            .with_timer_running(self.timer_running)
            .with_switching(self.switching)
            .with_pump_busy(self.pump_busy)
            .with_enabled(self.enabled)
            .with_hsq_running(self.hsq_active.is_some())
            .with_sequencer_active(self.sequencer_active)
    }

    fn count_dispatch(&mut self, request: &Request, tracked_read_blocks: u16) {
        match request.direction {
            Direction::Read if request.block_count == tracked_read_blocks => self.read_count += 1,
            Direction::Read => {}
            Direction::Write => self.write_count += 1,
        }
    }

    fn card_address(&self, lba: u32) -> u32 {
        match self.device {
            Some(device) if !device.block_addressed => lba << BLOCK_SHIFT,
            _ => lba,
        }
    }
}

/// Work that must run on a thread that may block.
#[derive(Debug)]
pub(crate) enum DeferredWork {
    Pump,
    Recover(RecoveryCause),
    Shutdown,
}

/// Where a pump was started from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PumpContext {
    /// The caller may block on card commands.
    Caller,
    /// A completion path. Blocking work is deferred.
    Completion,
}

pub(crate) struct Shared {
    pub config: SwcqConfig,
    pub transport: Arc<dyn HostTransport>,
    pub state: Mutex<SchedulerState>,
    /// Signalled whenever the queue may have become idle.
    pub changed: Condvar,
    /// Tasks whose address phase has not been sent.
    pub command_queue: NodeQueue,
    /// Tasks the card reported ready for their data phase.
    pub data_queue: NodeQueue,
    pub events: flume::Sender<SequencerEvent>,
    deferred: flume::Sender<DeferredWork>,
    pub timer: ArbiterTimer,
    pub history: CommandHistory,
}

impl Shared {
    pub fn record(&self, state: &SchedulerState, event: HistoryEvent, tag: Option<u8>, blocks: u16) {
        self.history.record(
            event,
            EventContext {
                tag,
                blocks,
                queued: state.queued(),
                tagged: state.tagged.in_use(),
                flags: state.flags(),
            },
        );
    }

    /// Sends a command without a data phase, retrying transient failures.
    ///
    /// Must not be called with the state lock held.
    pub fn issue(&self, command: &Command, retries: u32) -> Result<u32, CommandError> {
        let mut attempt = 0;
        loop {
            let result = self.transport.issue(command);
            {
                let state = self.state.lock();
                self.record(
                    &state,
                    HistoryEvent::Command {
                        opcode: command.opcode,
                        arg: command.arg,
                        response: result.as_ref().ok().copied(),
                    },
                    None,
                    0,
                );
            }
            match result {
                Err(err) if err.is_retryable() && attempt < retries => {
                    tracing::debug!(
                        opcode = ?command.opcode,
                        attempt,
                        error = &err as &dyn std::error::Error,
                        "retrying command"
                    );
                    attempt += 1;
                }
                result => break result,
            }
        }
    }

    pub fn kick_sequencer(&self) {
        // A full channel already holds a wakeup.
        let _ = self.events.try_send(SequencerEvent::Kick);
    }

    pub fn schedule_pump(&self, state: &mut SchedulerState) {
        if !state.deferred_pump {
            state.deferred_pump = true;
            let _ = self.deferred.send(DeferredWork::Pump);
        }
    }

    pub fn schedule_recovery(&self, cause: RecoveryCause) {
        let _ = self.deferred.send(DeferredWork::Recover(cause));
    }

    pub fn set_timer(&self, state: &mut SchedulerState, run: bool) {
        if state.timer_running != run {
            state.timer_running = run;
            self.timer.set_armed(run);
        }
    }

    /// Invokes the request's continuation, then releases its tag.
    pub fn complete_request(&self, request: Request, result: Result<(), RequestError>) {
        let tag = request.tag;
        request.complete(result);
        let mut state = self.state.lock();
        state.outstanding &= !(1 << tag);
        self.changed.notify_all();
    }

    /// Moves queued requests toward the card.
    pub fn pump(self: &Arc<Self>, context: PumpContext) {
        let mut state = self.state.lock();
        if !state.enabled || state.recovery_halt || state.recovery != RecoveryState::Normal {
            return;
        }
        if state.pump_busy {
            self.record(&state, HistoryEvent::PumpBusy, None, 0);
            return;
        }
        if state.hsq_active.is_some() {
            return;
        }
        if state.slots.is_empty() {
            self.record(&state, HistoryEvent::PumpIdle, None, 0);
            return;
        }
        if state.mode != state.device_mode {
            // The card can only change modes once the departing mode has
            // drained. The sequencer pumps again when it parks.
            let drained = match state.mode {
                Mode::Cmdq => true,
                Mode::Hsq => state.tagged.in_use() == 0 && !state.sequencer_active,
            };
            if !drained {
                return;
            }
            if context == PumpContext::Completion {
                self.schedule_pump(&mut state);
                return;
            }
            let target = state.mode;
            if !self.switch_device_mode(&mut state, target) {
                return;
            }
        }
        let mode = state.mode;
        match mode {
            Mode::Cmdq => self.pump_cmdq(&mut state),
            Mode::Hsq => self.pump_hsq(state),
        }
    }

    fn switch_device_mode(
        self: &Arc<Self>,
        state: &mut MutexGuard<'_, SchedulerState>,
        target: Mode,
    ) -> bool {
        state.pump_busy = true;
        state.switching = true;
        let arg = SwitchArg::new()
            .with_access(switch_access::WRITE_BYTE)
            .with_index(ext_csd::CMDQ_MODE_EN)
            .with_value((target == Mode::Cmdq).into())
            .into_bits();
        let result = MutexGuard::unlocked(state, || {
            self.issue(&Command::new(Opcode::SWITCH, arg), self.config.command_retries)
                .and_then(CommandError::check_status)
        });
        state.pump_busy = false;
        state.switching = false;
        match result {
            Ok(_) => {
                tracing::info!(mode = ?target, "card execution mode changed");
                state.device_mode = target;
                true
            }
            Err(err) => {
                tracing::warn!(
                    mode = ?target,
                    error = &err as &dyn std::error::Error,
                    "card refused execution mode change, disabling automatic switching"
                );
                state.transition_allowed = false;
                state.recovery = RecoveryState::Discarding;
                MutexGuard::unlocked(state, || self.recover(RecoveryCause::ModeSwitch(err)));
                false
            }
        }
    }

    fn pump_cmdq(&self, state: &mut SchedulerState) {
        let mut queued_any = false;
        while let Some(tag) = state.slots.find_oldest() {
            let Some(task) = state.tagged.allocate() else {
                break;
            };
            let slot = state.slots.take(tag).expect("oldest slot is occupied");
            let request = slot.request;
            let params = QueuedTaskParams::new()
                .with_block_count(request.block_count)
                .with_task_id(task)
                .with_priority(request.flags.realtime)
                .with_data_tag(request.flags.data_tag)
                .with_read(request.direction == Direction::Read)
                .with_reliable_write(
                    request.direction == Direction::Write && request.flags.reliable_write,
                );
            let extension = TaskExtension {
                params,
                address: state.card_address(request.lba),
            };
            state.count_dispatch(&request, self.config.tracked_read_blocks);
            self.record(
                state,
                HistoryEvent::CmdqDispatch,
                Some(tag),
                request.block_count,
            );
            state.tagged.install(task, request, extension, slot.arrived);
            self.command_queue.push(task);
            queued_any = true;
        }
        if queued_any {
            state.sequencer_active = true;
            self.kick_sequencer();
        }
    }

    fn pump_hsq(self: &Arc<Self>, mut state: MutexGuard<'_, SchedulerState>) {
        let Some(tag) = state.slots.find_oldest() else {
            return;
        };
        let slot = state.slots.take(tag).expect("oldest slot is occupied");
        let request = &slot.request;
        let opcode = match request.direction {
            Direction::Read => Opcode::READ_MULTIPLE_BLOCK,
            Direction::Write => Opcode::WRITE_MULTIPLE_BLOCK,
        };
        let command = Command::new(opcode, state.card_address(request.lba)).with_data(DataTransfer {
            direction: request.direction,
            lba: request.lba,
            block_count: request.block_count,
            tag,
        });
        state.count_dispatch(request, self.config.tracked_read_blocks);
        self.record(
            &state,
            HistoryEvent::HsqDispatch,
            Some(tag),
            request.block_count,
        );
        state.hsq_active = Some(HsqActive {
            request: slot.request,
            arrived: slot.arrived,
        });
        drop(state);
        let completion = CommandCompletion::new(self.clone(), opcode, tag);
        self.transport.issue_data(command, completion);
    }

    /// Routes a data phase completion from the transport.
    pub fn data_completed(self: &Arc<Self>, opcode: Opcode, tag: u8, result: Result<(), CommandError>) {
        match opcode {
            Opcode::EXECUTE_READ_TASK | Opcode::EXECUTE_WRITE_TASK => {
                let _ = self.events.send(SequencerEvent::DataDone { task: tag, result });
            }
            _ => {
                self.finalize(tag, result);
            }
        }
    }

    /// Completes the direct transfer for `tag`. Returns false if no such
    /// transfer is active.
    pub fn finalize(self: &Arc<Self>, tag: u8, result: Result<(), CommandError>) -> bool {
        let mut state = self.state.lock();
        let Some(active) = state
            .hsq_active
            .take_if(|active| active.request.tag == tag)
        else {
            drop(state);
            tracing::warn!(tag, "completion for a request that is not active");
            return false;
        };
        match result {
            Ok(()) => {
                self.record(
                    &state,
                    HistoryEvent::Finish,
                    Some(tag),
                    active.request.block_count,
                );
                if state.slots.is_empty() {
                    self.set_timer(&mut state, false);
                }
                drop(state);
                self.pump(PumpContext::Completion);
                self.complete_request(active.request, Ok(()));
            }
            Err(error) => {
                tracing::warn!(
                    tag,
                    error = &error as &dyn std::error::Error,
                    "direct transfer failed"
                );
                // The request stays active, which holds off the pump until
                // recovery puts it back in its slot.
                state.hsq_active = Some(active);
                state.recovery = RecoveryState::Discarding;
                drop(state);
                self.schedule_recovery(RecoveryCause::Transfer { tag, error });
            }
        }
        true
    }

    /// Runs one arbiter period.
    pub fn evaluate_mode(&self) {
        let mut state = self.state.lock();
        if !state.enabled || state.recovery != RecoveryState::Normal {
            return;
        }
        let tracked = self.config.tracked_read_blocks;
        let mut reads: Vec<_> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.request.is_tracked_read(tracked))
            .map(|(_, slot)| ReadSample {
                lba: slot.request.lba,
                blocks: slot.request.block_count,
            })
            .collect();
        let current = state.mode;
        let period = Period {
            queued: state.queued(),
            reads: &mut reads,
            dispatched_reads: state.read_count,
        };
        let state = &mut *state;
        let vote = state
            .arbiter
            .vote(current, self.config.vote_threshold, period);
        state.read_count = 0;
        state.write_count = 0;
        let Some(target) = state
            .arbiter
            .decide(current, vote, state.transition_allowed)
        else {
            return;
        };
        tracing::info!(from = ?current, to = ?target, reason = ?vote.reason, "switching execution mode");
        state.mode = target;
        self.record(
            state,
            HistoryEvent::ModeChange {
                from: current,
                to: target,
            },
            None,
            0,
        );
        self.schedule_pump(state);
    }

    fn snapshot(&self) -> StateSnapshot {
        let state = self.state.lock();
        StateSnapshot {
            enabled: state.enabled,
            mode: state.mode,
            device_mode: state.device_mode,
            transition_allowed: state.transition_allowed,
            recovery: state.recovery,
            recovery_halt: state.recovery_halt,
            queued: state.queued(),
            tagged: state.tagged.in_use(),
            depth: state.tagged.depth(),
            sequencer_active: state.sequencer_active,
            timer_running: state.timer_running,
            command_queue_nodes: self.command_queue.nodes_in_use(),
            data_queue_nodes: self.data_queue.nodes_in_use(),
            read_count: state.read_count,
            write_count: state.write_count,
        }
    }
}

fn run_deferred(shared: Arc<Shared>, recv: flume::Receiver<DeferredWork>) {
    while let Ok(work) = recv.recv() {
        match work {
            DeferredWork::Pump => {
                shared.state.lock().deferred_pump = false;
                shared.pump(PumpContext::Caller);
            }
            DeferredWork::Recover(cause) => shared.recover(cause),
            DeferredWork::Shutdown => break,
        }
    }
    tracing::debug!("deferred worker stopped");
}

/// A software command queue for an eMMC card.
///
/// Owns a sequencer thread, a deferred work thread, and the mode arbiter
/// timer thread. Dropping the queue stops the threads and fails any request
/// that has not completed.
pub struct SoftwareQueue {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for SoftwareQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareQueue").finish()
    }
}

impl SoftwareQueue {
    pub fn new(transport: Arc<dyn HostTransport>, config: SwcqConfig) -> anyhow::Result<Self> {
        let (events_send, events_recv) = flume::bounded(EVENT_QUEUE_DEPTH);
        let (deferred_send, deferred_recv) = flume::unbounded();
        let shared = Arc::new(Shared {
            history: CommandHistory::new(config.history_depth),
            config,
            transport,
            state: Mutex::new(SchedulerState::new()),
            changed: Condvar::new(),
            command_queue: NodeQueue::new(MAX_QUEUE_DEPTH),
            data_queue: NodeQueue::new(MAX_QUEUE_DEPTH),
            events: events_send,
            deferred: deferred_send,
            timer: ArbiterTimer::default(),
        });

        let mut queue = Self {
            shared: shared.clone(),
            threads: Vec::new(),
        };
        let sequencer = Sequencer::new(shared.clone(), events_recv);
        queue.spawn("swcq-sequencer", move || sequencer.run())?;
        queue.spawn("swcq-deferred", {
            let shared = shared.clone();
            move || run_deferred(shared, deferred_recv)
        })?;
        queue.spawn("swcq-arbiter", move || run_timer(shared))?;
        Ok(queue)
    }

    fn spawn(&mut self, name: &str, f: impl FnOnce() + Send + 'static) -> anyhow::Result<()> {
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(f)
            .with_context(|| format!("failed to spawn {name} thread"))?;
        self.threads.push(thread);
        Ok(())
    }

    /// Enables the queue.
    ///
    /// The first call must provide the card's properties; the queue depth is
    /// latched then. Later calls (such as on resume) may pass `None`.
    pub fn enable(&self, device: Option<&DeviceInfo>) -> Result<(), EnableError> {
        let mut state = self.shared.state.lock();
        if state.enabled {
            return Err(EnableError::Busy);
        }
        match (device, state.device) {
            (Some(device), None) => {
                let depth = device.cmdq_depth.min(MAX_QUEUE_DEPTH);
                state.tagged.set_depth(depth);
                state.device = Some(*device);
                state.device_mode = if device.cmdq_enabled {
                    Mode::Cmdq
                } else {
                    Mode::Hsq
                };
                state.mode = state.device_mode;
                state.transition_allowed = depth > 0;
                tracing::info!(depth, rca = device.rca, mode = ?state.mode, "software queue configured");
            }
            (_, Some(_)) => {}
            (None, None) => return Err(EnableError::NoDevice),
        }
        state.arbiter.reset();
        state.enabled = true;
        Ok(())
    }

    /// Disables the queue once all outstanding work has completed.
    ///
    /// Gives up after the configured timeout without forcing anything.
    pub fn disable(&self) -> Result<(), DisableError> {
        let mut state = self.shared.state.lock();
        self.shared.changed.wait_while_for(
            &mut state,
            |state| !state.is_idle(),
            self.shared.config.disable_timeout,
        );
        if !state.is_idle() {
            let outstanding = state.outstanding.count_ones();
            tracing::warn!(outstanding, "timed out disabling software queue");
            return Err(DisableError::Timeout { outstanding });
        }
        state.enabled = false;
        self.shared.set_timer(&mut state, false);
        Ok(())
    }

    /// Accepts a request. Returns immediately; the request's continuation
    /// runs when it completes.
    pub fn submit(&self, request: Request) -> Result<(), SubmitError> {
        let tag = request.tag;
        {
            let mut state = self.shared.state.lock();
            if !state.enabled {
                return Err(SubmitError::Shutdown(request));
            }
            if usize::from(tag) >= NUM_SLOTS {
                return Err(SubmitError::InvalidTag(request));
            }
            if state.recovery_halt {
                return Err(SubmitError::Busy(request));
            }
            if state.outstanding & (1 << tag) != 0 {
                return Err(SubmitError::TagInUse(request));
            }
            state.outstanding |= 1 << tag;
            let blocks = request.block_count;
            state.slots.record(request);
            self.shared
                .record(&state, HistoryEvent::Submit, Some(tag), blocks);
            self.shared.set_timer(&mut state, true);
        }
        self.shared.pump(PumpContext::Caller);
        Ok(())
    }

    /// Waits for all outstanding requests to complete and the sequencer to
    /// park.
    pub fn wait_for_idle(&self) -> Result<(), WaitIdleError> {
        let mut state = self.shared.state.lock();
        loop {
            if state.recovery_halt {
                return Err(WaitIdleError::RecoveryHalt);
            }
            if state.is_idle() {
                return Ok(());
            }
            self.shared.changed.wait(&mut state);
        }
    }

    /// Reports completion of a direct transfer, for transports that track
    /// requests by tag rather than through [`CommandCompletion`].
    pub fn finalize(&self, tag: u8, result: Result<(), CommandError>) -> bool {
        self.shared.finalize(tag, result)
    }

    /// Stops accepting requests while the block layer recovers.
    pub fn recovery_start(&self) {
        self.shared.state.lock().recovery_halt = true;
        self.shared.changed.notify_all();
    }

    pub fn recovery_finish(&self) {
        self.shared.state.lock().recovery_halt = false;
        self.shared.changed.notify_all();
        self.shared.pump(PumpContext::Caller);
    }

    /// Called when the block layer times out a request. Dumps diagnostics;
    /// returns whether block-layer recovery is needed, which it never is.
    pub fn on_request_timeout(&self, tag: u8) -> bool {
        {
            let state = self.shared.state.lock();
            let age = state
                .slots
                .iter()
                .find(|(t, _)| *t == tag)
                .map(|(_, slot)| slot.arrived.at.elapsed());
            tracing::warn!(
                tag,
                ?age,
                queued = state.queued(),
                tagged = state.tagged.in_use(),
                mode = ?state.mode,
                recovery = ?state.recovery,
                "request timed out"
            );
        }
        self.shared.history.dump_to_log("request timeout");
        false
    }

    pub fn suspend(&self) -> Result<(), DisableError> {
        {
            let mut state = self.shared.state.lock();
            self.shared.set_timer(&mut state, false);
        }
        self.disable()
    }

    pub fn resume(&self) -> Result<(), EnableError> {
        self.enable(None)
    }

    /// Returns true when the block layer should hold off new requests.
    pub fn is_congested(&self) -> bool {
        let state = self.shared.state.lock();
        let in_flight = state.queued() + state.tagged.in_use();
        in_flight
            > state
                .tagged
                .depth()
                .saturating_sub(self.shared.config.congestion_margin)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for SoftwareQueue {
    fn drop(&mut self) {
        let _ = self.shared.events.send(SequencerEvent::Shutdown);
        let _ = self.shared.deferred.send(DeferredWork::Shutdown);
        self.shared.timer.shutdown();
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!("software queue worker panicked");
            }
        }

        let requests = {
            let mut state = self.shared.state.lock();
            state.enabled = false;
            let mut requests: Vec<_> = state
                .slots
                .drain()
                .into_iter()
                .map(|slot| slot.request)
                .collect();
            requests.extend(state.hsq_active.take().map(|active| active.request));
            requests.extend(
                state
                    .tagged
                    .drain()
                    .into_iter()
                    .map(|(_, entry)| entry.request),
            );
            requests
        };
        self.shared.command_queue.clear();
        self.shared.data_queue.clear();
        for request in requests {
            self.shared
                .complete_request(request, Err(RequestError::Shutdown));
        }
    }
}

/// A point-in-time view of the scheduler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub enabled: bool,
    pub mode: Mode,
    pub device_mode: Mode,
    pub transition_allowed: bool,
    pub recovery: RecoveryState,
    pub recovery_halt: bool,
    pub queued: usize,
    pub tagged: usize,
    pub depth: usize,
    pub sequencer_active: bool,
    pub timer_running: bool,
    pub command_queue_nodes: usize,
    pub data_queue_nodes: usize,
    pub read_count: u32,
    pub write_count: u32,
}

/// Administrative access to a [`SoftwareQueue`].
#[derive(Clone)]
pub struct Diagnostics {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics").finish()
    }
}

impl Diagnostics {
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared.history.entries()
    }

    pub fn dump_history(&self) {
        self.shared.history.dump_to_log("requested");
    }

    pub fn mode(&self) -> Mode {
        self.shared.state.lock().mode
    }

    /// Switches to `mode` without waiting for the arbiter, and pins it there
    /// until [`Diagnostics::set_auto_switch`] re-enables switching.
    ///
    /// Returns false if the card has no command queue.
    pub fn force_mode(&self, mode: Mode) -> bool {
        {
            let mut state = self.shared.state.lock();
            if mode == Mode::Cmdq && state.tagged.depth() == 0 {
                tracing::warn!("card has no command queue");
                return false;
            }
            state.transition_allowed = false;
            if state.mode != mode {
                tracing::info!(from = ?state.mode, to = ?mode, "forcing execution mode");
                let from = state.mode;
                state.mode = mode;
                self.shared
                    .record(&state, HistoryEvent::ModeChange { from, to: mode }, None, 0);
            }
        }
        self.shared.pump(PumpContext::Caller);
        true
    }

    pub fn set_auto_switch(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        state.transition_allowed = enabled && state.tagged.depth() > 0;
        state.arbiter.reset();
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.shared.snapshot()
    }
}
