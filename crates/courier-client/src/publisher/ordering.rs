// Per-ordering-key pause state and the tickets held back while paused.
use courier_common::{Error, Result};
use std::collections::{HashMap, VecDeque};

use super::{LaneKey, PublishTicket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Active,
    Paused,
}

#[derive(Debug)]
struct OrderingKeyState {
    state: KeyState,
    queued: VecDeque<PublishTicket>,
}

impl OrderingKeyState {
    fn new() -> Self {
        Self {
            state: KeyState::Active,
            queued: VecDeque::new(),
        }
    }
}

/// Tracks which ordering lanes are paused after a failed batch.
///
/// Entries are created on first use and live as long as the publisher. Callers
/// hold the publisher's state lock around every transition.
#[derive(Debug, Default)]
pub struct OrderingKeyRegistry {
    keys: HashMap<LaneKey, OrderingKeyState>,
}

impl OrderingKeyRegistry {
    pub fn check_active(&mut self, lane: &LaneKey) -> Result<()> {
        let entry = self
            .keys
            .entry(lane.clone())
            .or_insert_with(OrderingKeyState::new);
        match entry.state {
            KeyState::Active => Ok(()),
            KeyState::Paused => Err(paused_error(lane)),
        }
    }

    pub fn state(&self, lane: &LaneKey) -> KeyState {
        self.keys
            .get(lane)
            .map(|entry| entry.state)
            .unwrap_or(KeyState::Active)
    }

    /// Returns true on the Active -> Paused transition; pausing twice is a no-op.
    pub fn pause(&mut self, lane: &LaneKey) -> bool {
        let entry = self
            .keys
            .entry(lane.clone())
            .or_insert_with(OrderingKeyState::new);
        if entry.state == KeyState::Paused {
            return false;
        }
        entry.state = KeyState::Paused;
        true
    }

    /// Hold `ticket` until the lane is resumed.
    pub fn enqueue(&mut self, lane: &LaneKey, ticket: PublishTicket) {
        self.keys
            .entry(lane.clone())
            .or_insert_with(OrderingKeyState::new)
            .queued
            .push_back(ticket);
    }

    /// Reactivate the lane and hand back its queued tickets in submission order.
    /// Resuming an active lane returns nothing.
    pub fn resume(&mut self, lane: &LaneKey) -> Vec<PublishTicket> {
        match self.keys.get_mut(lane) {
            Some(entry) if entry.state == KeyState::Paused => {
                entry.state = KeyState::Active;
                entry.queued.drain(..).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn paused_lanes(&self) -> Vec<LaneKey> {
        self.keys
            .iter()
            .filter(|(_, entry)| entry.state == KeyState::Paused)
            .map(|(lane, _)| lane.clone())
            .collect()
    }

    /// Take every queued ticket, leaving the pause states untouched.
    pub fn drain_queued(&mut self) -> Vec<(LaneKey, PublishTicket)> {
        let mut drained = Vec::new();
        for (lane, entry) in &mut self.keys {
            drained.extend(entry.queued.drain(..).map(|ticket| (lane.clone(), ticket)));
        }
        drained
    }
}

pub(crate) fn paused_error(lane: &LaneKey) -> Error {
    Error::OrderingPaused {
        ordering_key: lane.ordering_key.clone().unwrap_or_default(),
    }
}
