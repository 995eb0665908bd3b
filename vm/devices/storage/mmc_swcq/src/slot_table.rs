// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Arrival slots, one per request tag.

use crate::request::Request;
use std::time::Instant;

/// When a request was submitted. Orders by submission sequence so requests
/// recorded within the same clock tick keep their order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Arrival {
    seq: u64,
    pub at: Instant,
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub request: Request,
    pub arrived: Arrival,
}

/// Requests that have been submitted but not yet handed to the device,
/// indexed by tag.
#[derive(Debug)]
pub(crate) struct SlotTable {
    slots: Vec<Option<Slot>>,
    occupied: usize,
    next_seq: u64,
}

impl SlotTable {
    pub fn new(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| None).collect(),
            occupied: 0,
            next_seq: 0,
        }
    }

    pub fn record(&mut self, request: Request) {
        let arrived = Arrival {
            seq: self.next_seq,
            at: Instant::now(),
        };
        self.next_seq += 1;
        self.record_at(request, arrived);
    }

    /// Records a request with an explicit arrival time, used when restoring
    /// requests after a reset so they keep their place in line.
    pub fn record_at(&mut self, request: Request, arrived: Arrival) {
        let slot = &mut self.slots[usize::from(request.tag)];
        assert!(slot.is_none(), "slot {} already occupied", request.tag);
        *slot = Some(Slot { request, arrived });
        self.occupied += 1;
    }

    pub fn take(&mut self, tag: u8) -> Option<Slot> {
        let slot = self.slots.get_mut(usize::from(tag))?.take()?;
        self.occupied -= 1;
        Some(slot)
    }

    /// Returns the tag of the request that arrived first.
    pub fn find_oldest(&self) -> Option<u8> {
        if self.occupied == 0 {
            return None;
        }
        self.iter()
            .min_by_key(|(_, slot)| slot.arrived)
            .map(|(tag, _)| tag)
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(tag, slot)| Some((tag as u8, slot.as_ref()?)))
    }

    pub fn drain(&mut self) -> Vec<Slot> {
        self.occupied = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}
