// Lane accumulation: per-(topic, ordering key) pending batches and send order.
use std::collections::{HashMap, VecDeque};
use tokio::time::Instant;

use super::{LaneKey, PublishTicket};
use crate::config::PublisherSettings;

/// Tickets sharing one flush boundary and one lane.
#[derive(Debug)]
pub struct Batch {
    pub lane: LaneKey,
    pub tickets: Vec<PublishTicket>,
    pub bytes: usize,
    opened_at: Instant,
}

impl Batch {
    fn new(lane: LaneKey, now: Instant) -> Self {
        Self {
            lane,
            tickets: Vec::new(),
            bytes: 0,
            opened_at: now,
        }
    }

    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }
}

#[derive(Debug, Default)]
struct Lane {
    pending: Option<Batch>,
    // Sealed batches waiting for their turn to be sent.
    sealed: VecDeque<Batch>,
    in_flight: usize,
    // Listed in `MessageBatcher::ready`.
    queued: bool,
}

impl Lane {
    /// Move the pending batch to the send queue; `true` if there was one.
    fn seal(&mut self) -> bool {
        match self.pending.take() {
            Some(batch) if !batch.is_empty() => {
                self.sealed.push_back(batch);
                true
            }
            _ => false,
        }
    }

    fn is_idle(&self) -> bool {
        self.in_flight == 0 && self.sealed.is_empty() && self.pending.is_none()
    }
}

fn mark_ready(ready: &mut Vec<LaneKey>, key: &LaneKey, lane: &mut Lane) {
    if !lane.queued {
        lane.queued = true;
        ready.push(key.clone());
    }
}

/// Accumulates tickets into batches and decides which batches may be sent.
///
/// Keyed lanes allow one batch in flight; unkeyed lanes have no limit. The
/// batcher only tracks state; the publisher does the sending. Only busy lanes
/// are kept, and each call touches the lanes it concerns, so distinct ordering
/// keys do not accumulate cost.
#[derive(Debug)]
pub struct MessageBatcher {
    max_messages: usize,
    max_bytes: usize,
    max_latency: std::time::Duration,
    // Lanes with something pending, sealed or in flight.
    lanes: HashMap<LaneKey, Lane>,
    // Lanes that may have a sealed batch to send.
    ready: Vec<LaneKey>,
    // Open times of pending batches, oldest first. Entries for batches sealed
    // early are skipped when they reach the front.
    deadlines: VecDeque<(Instant, LaneKey)>,
}

impl MessageBatcher {
    pub fn new(settings: &PublisherSettings) -> Self {
        Self {
            max_messages: settings.batch_limit(),
            max_bytes: settings.max_bytes.max(1),
            max_latency: settings.max_latency,
            lanes: HashMap::new(),
            ready: Vec::new(),
            deadlines: VecDeque::new(),
        }
    }

    /// Append to the lane's pending batch, sealing on the count and byte thresholds.
    /// `now` must not go backwards between calls.
    pub fn add(&mut self, lane: LaneKey, ticket: PublishTicket, now: Instant) {
        let size = ticket.encoded_len();
        let state = self.lanes.entry(lane.clone()).or_default();
        let mut sealed = false;
        // A message that would overflow a non-empty batch starts the next one.
        if let Some(pending) = &state.pending
            && !pending.is_empty()
            && pending.bytes + size > self.max_bytes
        {
            sealed |= state.seal();
        }
        if state.pending.is_none() {
            self.deadlines.push_back((now, lane.clone()));
        }
        let pending = state
            .pending
            .get_or_insert_with(|| Batch::new(lane.clone(), now));
        pending.bytes += size;
        pending.tickets.push(ticket);
        if pending.len() >= self.max_messages || pending.bytes >= self.max_bytes {
            sealed |= state.seal();
        }
        if sealed {
            mark_ready(&mut self.ready, &lane, state);
        }
    }

    /// Seal pending batches whose oldest message has waited `max_latency`.
    pub fn seal_expired(&mut self, now: Instant) {
        while let Some((opened_at, _)) = self.deadlines.front() {
            if now.duration_since(*opened_at) < self.max_latency {
                break;
            }
            let Some((opened_at, key)) = self.deadlines.pop_front() else {
                break;
            };
            if let Some(lane) = self.lanes.get_mut(&key)
                && lane
                    .pending
                    .as_ref()
                    .is_some_and(|batch| batch.opened_at <= opened_at)
                && lane.seal()
            {
                mark_ready(&mut self.ready, &key, lane);
            }
        }
    }

    pub fn seal_all(&mut self) {
        for (key, lane) in &mut self.lanes {
            if lane.seal() {
                mark_ready(&mut self.ready, key, lane);
            }
        }
        self.deadlines.clear();
    }

    /// Batches that may be sent now, marked in flight.
    pub fn take_ready(&mut self) -> Vec<Batch> {
        let mut ready = Vec::new();
        for key in std::mem::take(&mut self.ready) {
            let Some(lane) = self.lanes.get_mut(&key) else {
                continue;
            };
            lane.queued = false;
            if key.ordering_key.is_some() {
                if lane.in_flight == 0
                    && let Some(batch) = lane.sealed.pop_front()
                {
                    lane.in_flight = 1;
                    ready.push(batch);
                }
            } else {
                lane.in_flight += lane.sealed.len();
                ready.extend(lane.sealed.drain(..));
            }
        }
        ready
    }

    /// A batch of `lane` finished, successfully or not.
    pub fn complete(&mut self, lane: &LaneKey) {
        let Some(state) = self.lanes.get_mut(lane) else {
            return;
        };
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.is_idle() {
            self.lanes.remove(lane);
        } else if !state.sealed.is_empty() {
            mark_ready(&mut self.ready, lane, state);
        }
    }

    /// Remove everything not yet sent on `lane`, oldest first.
    pub fn take_unsent(&mut self, lane: &LaneKey) -> Vec<PublishTicket> {
        let Some(state) = self.lanes.get_mut(lane) else {
            return Vec::new();
        };
        state.seal();
        let unsent = state
            .sealed
            .drain(..)
            .flat_map(|batch| batch.tickets)
            .collect();
        if state.is_idle() {
            self.lanes.remove(lane);
        }
        unsent
    }

    /// Remove everything not yet sent on every lane.
    pub fn drain_unsent(&mut self) -> Vec<PublishTicket> {
        let lanes: Vec<LaneKey> = self.lanes.keys().cloned().collect();
        lanes
            .iter()
            .flat_map(|lane| self.take_unsent(lane))
            .collect()
    }

    /// Nothing pending, sealed or in flight on any lane.
    pub fn is_idle(&self) -> bool {
        self.lanes.is_empty()
    }

    #[cfg(test)]
    fn lane_count(&self) -> usize {
        self.lanes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_common::Message;
    use std::time::Duration;

    fn settings(max_messages: usize, max_bytes: usize) -> PublisherSettings {
        PublisherSettings {
            max_messages,
            max_bytes,
            max_latency: Duration::from_millis(10),
            ..PublisherSettings::default()
        }
    }

    fn add(batcher: &mut MessageBatcher, lane: &LaneKey, data: &str, now: Instant) {
        let mut message = Message::new(data.to_string());
        if let Some(key) = &lane.ordering_key {
            message = message.with_ordering_key(key.clone());
        }
        let (ticket, _handle) = PublishTicket::new(message);
        batcher.add(lane.clone(), ticket, now);
    }

    fn sizes(batches: &[Batch]) -> Vec<usize> {
        batches.iter().map(Batch::len).collect()
    }

    #[test]
    fn count_threshold_seals() {
        let now = Instant::now();
        let mut batcher = MessageBatcher::new(&settings(2, 1024));
        let lane = LaneKey::new("t", None);
        for data in ["a", "b", "c"] {
            add(&mut batcher, &lane, data, now);
        }
        assert_eq!(sizes(&batcher.take_ready()), vec![2]);
        batcher.seal_all();
        assert_eq!(sizes(&batcher.take_ready()), vec![1]);
    }

    #[test]
    fn overflowing_message_starts_new_batch() {
        let now = Instant::now();
        let mut batcher = MessageBatcher::new(&settings(100, 10));
        let lane = LaneKey::new("t", None);
        add(&mut batcher, &lane, "123456", now);
        add(&mut batcher, &lane, "123456", now);
        assert_eq!(sizes(&batcher.take_ready()), vec![1]);
        // A lone oversized message still goes out, alone.
        add(&mut batcher, &lane, "12345678901234", now);
        assert_eq!(sizes(&batcher.take_ready()), vec![1, 1]);
    }

    #[test]
    fn latency_seals_only_old_batches() {
        let start = Instant::now();
        let mut batcher = MessageBatcher::new(&settings(100, 1024));
        add(&mut batcher, &LaneKey::new("old", None), "a", start);
        add(
            &mut batcher,
            &LaneKey::new("new", None),
            "b",
            start + Duration::from_millis(8),
        );
        batcher.seal_expired(start + Duration::from_millis(10));
        let ready = batcher.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].lane.topic, "old");
    }

    #[test]
    fn keyed_lane_has_one_batch_in_flight() {
        let now = Instant::now();
        let mut batcher = MessageBatcher::new(&settings(1, 1024));
        let lane = LaneKey::new("t", Some("k"));
        for data in ["a", "b", "c"] {
            add(&mut batcher, &lane, data, now);
        }
        let first = batcher.take_ready();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].tickets[0].message().data, "a");
        assert!(batcher.take_ready().is_empty());
        batcher.complete(&lane);
        let second = batcher.take_ready();
        assert_eq!(second[0].tickets[0].message().data, "b");
        assert!(!batcher.is_idle());
    }

    #[test]
    fn unsent_tickets_come_back_in_order() {
        let now = Instant::now();
        let mut batcher = MessageBatcher::new(&settings(2, 1024));
        let lane = LaneKey::new("t", Some("k"));
        for data in ["a", "b", "c", "d", "e"] {
            add(&mut batcher, &lane, data, now);
        }
        let in_flight = batcher.take_ready();
        assert_eq!(sizes(&in_flight), vec![2]);
        let unsent: Vec<_> = batcher
            .take_unsent(&lane)
            .iter()
            .map(|ticket| ticket.message().data.clone())
            .collect();
        assert_eq!(unsent, vec!["c", "d", "e"]);
        batcher.complete(&lane);
        assert!(batcher.is_idle());
    }

    #[test]
    fn finished_lanes_are_dropped() {
        let start = Instant::now();
        let mut batcher = MessageBatcher::new(&settings(1, 1024));
        for n in 0..20_000 {
            let lane = LaneKey::new("t", Some(format!("entity-{n}").as_str()));
            add(&mut batcher, &lane, "x", start);
            let ready = batcher.take_ready();
            assert_eq!(ready.len(), 1);
            batcher.complete(&lane);
        }
        assert_eq!(batcher.lane_count(), 0);
        assert!(batcher.is_idle());
        assert!(batcher.ready.is_empty());
    }

    #[test]
    fn latency_skips_batches_already_sealed() {
        let start = Instant::now();
        let mut batcher = MessageBatcher::new(&settings(2, 1024));
        let lane = LaneKey::new("t", None);
        add(&mut batcher, &lane, "a", start);
        add(&mut batcher, &lane, "b", start);
        assert_eq!(sizes(&batcher.take_ready()), vec![2]);
        add(&mut batcher, &lane, "c", start + Duration::from_millis(5));
        // The sealed batch's deadline has passed; the younger one's has not.
        batcher.seal_expired(start + Duration::from_millis(12));
        assert!(batcher.take_ready().is_empty());
        batcher.seal_expired(start + Duration::from_millis(15));
        assert_eq!(sizes(&batcher.take_ready()), vec![1]);
    }
}
