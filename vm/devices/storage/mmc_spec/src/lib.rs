// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Definitions from the JEDEC eMMC specification (JESD84-B51) needed to drive
//! a card through the command queue task protocol.
//!
//! Only the commands, argument layouts, and status bits used by a host-side
//! scheduler are defined here.

#![no_std]

use bitfield_struct::bitfield;
use core::fmt;

/// A command index, as carried in the command token.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const GO_IDLE_STATE: Self = Self(0);
    pub const SWITCH: Self = Self(6);
    pub const STOP_TRANSMISSION: Self = Self(12);
    pub const SEND_STATUS: Self = Self(13);
    pub const READ_MULTIPLE_BLOCK: Self = Self(18);
    pub const WRITE_MULTIPLE_BLOCK: Self = Self(25);
    pub const QUEUED_TASK_PARAMS: Self = Self(44);
    pub const QUEUED_TASK_ADDRESS: Self = Self(45);
    pub const EXECUTE_READ_TASK: Self = Self(46);
    pub const EXECUTE_WRITE_TASK: Self = Self(47);
    pub const CMDQ_TASK_MGMT: Self = Self(48);

    fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::GO_IDLE_STATE => "GO_IDLE_STATE",
            Self::SWITCH => "SWITCH",
            Self::STOP_TRANSMISSION => "STOP_TRANSMISSION",
            Self::SEND_STATUS => "SEND_STATUS",
            Self::READ_MULTIPLE_BLOCK => "READ_MULTIPLE_BLOCK",
            Self::WRITE_MULTIPLE_BLOCK => "WRITE_MULTIPLE_BLOCK",
            Self::QUEUED_TASK_PARAMS => "QUEUED_TASK_PARAMS",
            Self::QUEUED_TASK_ADDRESS => "QUEUED_TASK_ADDRESS",
            Self::EXECUTE_READ_TASK => "EXECUTE_READ_TASK",
            Self::EXECUTE_WRITE_TASK => "EXECUTE_WRITE_TASK",
            Self::CMDQ_TASK_MGMT => "CMDQ_TASK_MGMT",
            _ => return None,
        };
        Some(name)
    }

    /// Returns true for the commands that carry a data phase.
    pub fn has_data(self) -> bool {
        matches!(
            self,
            Self::READ_MULTIPLE_BLOCK
                | Self::WRITE_MULTIPLE_BLOCK
                | Self::EXECUTE_READ_TASK
                | Self::EXECUTE_WRITE_TASK
        )
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "CMD{}", self.0),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CMD{}", self.0)
    }
}

/// Card state as reported in bits 9..12 of an R1 response.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct CardState(pub u8);

impl CardState {
    pub const IDLE: Self = Self(0);
    pub const READY: Self = Self(1);
    pub const IDENT: Self = Self(2);
    pub const STBY: Self = Self(3);
    pub const TRAN: Self = Self(4);
    pub const DATA: Self = Self(5);
    pub const RCV: Self = Self(6);
    pub const PRG: Self = Self(7);
    pub const DIS: Self = Self(8);
    pub const BTST: Self = Self(9);
    pub const SLP: Self = Self(10);
}

/// R1 card status.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct CardStatus {
    #[bits(3)]
    pub reserved: u8,
    pub ake_seq_error: bool,
    pub reserved2: bool,
    pub app_cmd: bool,
    pub exception_event: bool,
    pub switch_error: bool,
    pub ready_for_data: bool,
    #[bits(4)]
    pub current_state: u8,
    pub erase_reset: bool,
    pub reserved3: bool,
    pub wp_erase_skip: bool,
    pub cid_csd_overwrite: bool,
    #[bits(2)]
    pub reserved4: u8,
    pub error: bool,
    pub cc_error: bool,
    pub card_ecc_failed: bool,
    pub illegal_command: bool,
    pub com_crc_error: bool,
    pub lock_unlock_failed: bool,
    pub card_is_locked: bool,
    pub wp_violation: bool,
    pub erase_param: bool,
    pub erase_seq_error: bool,
    pub block_len_error: bool,
    pub address_misalign: bool,
    pub address_out_of_range: bool,
}

/// Status bits that indicate a failed data command.
pub const CARD_STATUS_COMMAND_ERRORS: u32 = CardStatus::new()
    .with_address_out_of_range(true)
    .with_address_misalign(true)
    .with_block_len_error(true)
    .with_wp_violation(true)
    .with_card_ecc_failed(true)
    .with_cc_error(true)
    .with_error(true)
    .into_bits();

impl CardStatus {
    pub fn state(&self) -> CardState {
        CardState(self.current_state())
    }

    pub fn has_command_error(&self) -> bool {
        self.into_bits() & CARD_STATUS_COMMAND_ERRORS != 0
    }
}

/// CMD44 argument: task parameters for the address phase.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct QueuedTaskParams {
    pub block_count: u16,
    #[bits(5)]
    pub task_id: u8,
    #[bits(2)]
    pub reserved: u8,
    pub priority: bool,
    #[bits(5)]
    pub reserved2: u8,
    pub data_tag: bool,
    pub read: bool,
    pub reliable_write: bool,
}

/// CMD46/CMD47 argument: the task to execute.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ExecuteTaskArg {
    pub reserved: u16,
    #[bits(5)]
    pub task_id: u8,
    #[bits(11)]
    pub reserved2: u16,
}

/// CMD13 argument.
///
/// With `queue_status` set the response is the queue status register, a
/// bitmap of tasks that are ready for execution.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct SendStatusArg {
    #[bits(15)]
    pub reserved: u16,
    pub queue_status: bool,
    pub rca: u16,
}

/// CMD48 task management operations.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct TaskMgmtOp(pub u8);

impl TaskMgmtOp {
    pub const DISCARD_QUEUE: Self = Self(1);
    pub const DISCARD_TASK: Self = Self(2);
}

/// CMD48 argument.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TaskMgmtArg {
    #[bits(4)]
    pub op: u8,
    #[bits(12)]
    pub reserved: u16,
    #[bits(5)]
    pub task_id: u8,
    #[bits(11)]
    pub reserved2: u16,
}

/// CMD6 argument.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct SwitchArg {
    #[bits(3)]
    pub cmd_set: u8,
    #[bits(5)]
    pub reserved: u8,
    pub value: u8,
    pub index: u8,
    #[bits(2)]
    pub access: u8,
    #[bits(6)]
    pub reserved2: u8,
}

/// CMD6 access modes.
pub mod switch_access {
    pub const COMMAND_SET: u8 = 0;
    pub const SET_BITS: u8 = 1;
    pub const CLEAR_BITS: u8 = 2;
    pub const WRITE_BYTE: u8 = 3;
}

/// Extended CSD byte indices and values.
pub mod ext_csd {
    pub const CMDQ_MODE_EN: u8 = 15;
    pub const PART_CONFIG: u8 = 179;

    /// Partition access bits of `PART_CONFIG`; zero selects the user area.
    pub const PART_CONFIG_ACCESS_MASK: u8 = 0x7;
}

/// Maximum number of tasks in the device queue.
pub const MAX_TASKS: usize = 32;

/// Block size used for byte addressed cards.
pub const BLOCK_SHIFT: u32 = 9;
