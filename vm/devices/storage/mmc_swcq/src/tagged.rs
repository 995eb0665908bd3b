// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Requests enrolled in the device command queue, indexed by task id.

use crate::request::Request;
use crate::slot_table::Arrival;
use mmc_spec::QueuedTaskParams;

/// The address-phase descriptor sent ahead of a task's data phase.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct TaskExtension {
    /// CMD44 argument.
    pub params: QueuedTaskParams,
    /// CMD45 argument.
    pub address: u32,
}

#[derive(Debug)]
pub(crate) struct TaggedEntry {
    pub request: Request,
    pub extension: TaskExtension,
    pub arrived: Arrival,
    queued_on_device: bool,
    data_phase_queued: bool,
}

#[derive(Debug)]
pub(crate) struct TaggedExecutionTable {
    entries: Vec<Option<TaggedEntry>>,
    reserved: u32,
    depth: usize,
}

impl TaggedExecutionTable {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= 32);
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            reserved: 0,
            depth: capacity,
        }
    }

    /// Limits allocation to the first `depth` task ids.
    pub fn set_depth(&mut self, depth: usize) {
        assert_eq!(self.reserved, 0, "depth changed with tasks in flight");
        self.depth = depth.min(self.entries.len());
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Reserves the lowest free task id.
    pub fn allocate(&mut self) -> Option<u8> {
        let task = (!self.reserved).trailing_zeros() as usize;
        if task >= self.depth {
            return None;
        }
        self.reserved |= 1 << task;
        Some(task as u8)
    }

    /// Binds a request and its descriptor to a reserved task id.
    pub fn install(
        &mut self,
        task: u8,
        request: Request,
        extension: TaskExtension,
        arrived: Arrival,
    ) {
        assert!(
            self.reserved & (1 << task) != 0,
            "task {task} installed without allocation"
        );
        let entry = &mut self.entries[usize::from(task)];
        assert!(entry.is_none(), "task {task} already installed");
        *entry = Some(TaggedEntry {
            request,
            extension,
            arrived,
            queued_on_device: false,
            data_phase_queued: false,
        });
    }

    /// Removes the entry and frees the task id.
    pub fn retire(&mut self, task: u8) -> TaggedEntry {
        let entry = self.entries[usize::from(task)]
            .take()
            .unwrap_or_else(|| panic!("task {task} retired while not installed"));
        self.reserved &= !(1 << task);
        entry
    }

    pub fn get(&self, task: u8) -> Option<&TaggedEntry> {
        self.entries.get(usize::from(task))?.as_ref()
    }

    pub fn is_data_phase_queued(&self, task: u8) -> bool {
        self.get(task).is_some_and(|entry| entry.data_phase_queued)
    }

    /// Records that the data phase for `task` has been queued. Returns false
    /// if it already was.
    pub fn mark_data_phase_queued(&mut self, task: u8) -> bool {
        let entry = self.entry_mut(task);
        !std::mem::replace(&mut entry.data_phase_queued, true)
    }

    pub fn is_queued_on_device(&self, task: u8) -> bool {
        self.get(task).is_some_and(|entry| entry.queued_on_device)
    }

    /// Records that the address phase for `task` was sent to the device.
    pub fn mark_queued_on_device(&mut self, task: u8) {
        let entry = self.entry_mut(task);
        assert!(!entry.queued_on_device, "task {task} queued on device twice");
        entry.queued_on_device = true;
    }

    pub fn in_use(&self) -> usize {
        self.reserved.count_ones() as usize
    }

    /// Removes every entry, returning them with their task ids.
    pub fn drain(&mut self) -> Vec<(u8, TaggedEntry)> {
        self.reserved = 0;
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(task, entry)| Some((task as u8, entry.take()?)))
            .collect()
    }

    fn entry_mut(&mut self, task: u8) -> &mut TaggedEntry {
        self.entries[usize::from(task)]
            .as_mut()
            .unwrap_or_else(|| panic!("task {task} is not installed"))
    }
}
