// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ring buffer of recent scheduler events and card commands, dumped to the
//! log when something goes wrong.

use crate::arbiter::Mode;
use bitfield_struct::bitfield;
use mmc_spec::Opcode;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

/// Scheduler state flags captured with each history entry.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct HistoryFlags {
    pub cmdq_mode: bool,
    pub timer_running: bool,
    pub switching: bool,
    pub reserved: bool,
    pub pump_busy: bool,
    #[bits(3)]
    pub reserved2: u8,
    pub enabled: bool,
    #[bits(7)]
    pub reserved3: u8,
    pub hsq_running: bool,
    #[bits(7)]
    pub reserved4: u8,
    pub sequencer_active: bool,
    #[bits(7)]
    pub reserved5: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HistoryEvent {
    /// A request was accepted.
    Submit,
    /// A direct transfer completed.
    Finish,
    /// A queued task was completed and its task id freed.
    Retire,
    /// A request was issued as a direct transfer.
    HsqDispatch,
    /// A request was converted into a queued task.
    CmdqDispatch,
    /// A pump was skipped because another was in progress.
    PumpBusy,
    /// A pump found nothing to do.
    PumpIdle,
    /// The sequencer ran out of tasks.
    Park,
    /// A queued task's data phase was started.
    Execute { opcode: Opcode, task: u8 },
    /// A command was sent to the card. `response` is `None` if it failed.
    Command {
        opcode: Opcode,
        arg: u32,
        response: Option<u32>,
    },
    ModeChange {
        from: Mode,
        to: Mode,
    },
    Recovery,
}

impl HistoryEvent {
    fn collapses(&self) -> bool {
        match self {
            Self::Command { opcode, .. } => *opcode == Opcode::SEND_STATUS,
            Self::PumpBusy => true,
            _ => false,
        }
    }
}

impl fmt::Display for HistoryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command {
                opcode,
                arg,
                response: Some(response),
            } => write!(f, "{opcode} arg={arg:#010x} resp={response:#010x}"),
            Self::Command {
                opcode,
                arg,
                response: None,
            } => write!(f, "{opcode} arg={arg:#010x} failed"),
            Self::ModeChange { from, to } => write!(f, "mode {from:?}->{to:?}"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Time since the queue was created.
    pub time: Duration,
    pub event: HistoryEvent,
    pub tag: Option<u8>,
    pub blocks: u16,
    pub queued: usize,
    pub tagged: usize,
    pub flags: HistoryFlags,
    /// Number of identical entries folded into this one.
    pub skipped: u32,
}

impl fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>12.6}] {}", self.time.as_secs_f64(), self.event)?;
        if let Some(tag) = self.tag {
            write!(f, " tag={tag}")?;
        }
        if self.blocks != 0 {
            write!(f, " blocks={}", self.blocks)?;
        }
        write!(
            f,
            " q={} t={} flags={:#010x}",
            self.queued,
            self.tagged,
            self.flags.into_bits()
        )?;
        if self.skipped != 0 {
            write!(f, " skipped={}", self.skipped)?;
        }
        Ok(())
    }
}

/// The context recorded alongside an event.
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct EventContext {
    pub tag: Option<u8>,
    pub blocks: u16,
    pub queued: usize,
    pub tagged: usize,
    pub flags: HistoryFlags,
}

#[derive(Debug)]
pub(crate) struct CommandHistory {
    origin: Instant,
    depth: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl CommandHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            origin: Instant::now(),
            depth,
            entries: Mutex::new(VecDeque::with_capacity(depth)),
        }
    }

    pub fn record(&self, event: HistoryEvent, context: EventContext) {
        if self.depth == 0 {
            return;
        }
        let time = self.origin.elapsed();
        let mut entries = self.entries.lock();
        if event.collapses() {
            if let Some(last) = entries.back_mut() {
                if last.event == event {
                    last.time = time;
                    last.skipped += 1;
                    return;
                }
            }
        }
        if entries.len() == self.depth {
            entries.pop_front();
        }
        entries.push_back(HistoryEntry {
            time,
            event,
            tag: context.tag,
            blocks: context.blocks,
            queued: context.queued,
            tagged: context.tagged,
            flags: context.flags,
            skipped: 0,
        });
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.lock().iter().copied().collect()
    }

    pub fn dump_to_log(&self, reason: &str) {
        let entries = self.entries();
        tracing::info!(reason, count = entries.len(), "command history");
        for entry in &entries {
            tracing::info!("{entry}");
        }
    }
}
