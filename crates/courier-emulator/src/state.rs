// Topic and subscription registry with lease bookkeeping.
use courier_common::{Error, MessageId, Result};
use courier_wire::{DeadlineModification, PublishOutcome, ReceivedWireMessage, WireMessage};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    message: WireMessage,
    // Attempt number the next delivery will carry.
    delivery_attempt: u32,
}

#[derive(Debug)]
struct Lease {
    message: StoredMessage,
    expires_at: Instant,
}

#[derive(Debug)]
struct SubscriptionState {
    topic: String,
    backlog: VecDeque<StoredMessage>,
    leases: HashMap<String, Lease>,
    acked: Vec<MessageId>,
    deadline_modifications: Vec<DeadlineModification>,
}

impl SubscriptionState {
    fn new(topic: String) -> Self {
        Self {
            topic,
            backlog: VecDeque::new(),
            leases: HashMap::new(),
            acked: Vec::new(),
            deadline_modifications: Vec::new(),
        }
    }

    // Returns the lease to the front of the backlog for another attempt.
    fn requeue(&mut self, ack_id: &str) -> bool {
        match self.leases.remove(ack_id) {
            Some(lease) => {
                let mut message = lease.message;
                message.delivery_attempt += 1;
                self.backlog.push_front(message);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct State {
    // Topic -> subscriptions attached to it, in creation order.
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, SubscriptionState>,
    next_message_id: u64,
    next_ack_id: u64,
}

impl State {
    pub(crate) fn create_topic(&mut self, topic: &str) -> bool {
        if self.topics.contains_key(topic) {
            return false;
        }
        self.topics.insert(topic.to_string(), Vec::new());
        true
    }

    pub(crate) fn create_subscription(&mut self, subscription: &str, topic: &str) -> Result<bool> {
        let Some(attached) = self.topics.get_mut(topic) else {
            return Err(Error::NotFound(format!("topic {topic}")));
        };
        if self.subscriptions.contains_key(subscription) {
            return Ok(false);
        }
        attached.push(subscription.to_string());
        self.subscriptions.insert(
            subscription.to_string(),
            SubscriptionState::new(topic.to_string()),
        );
        Ok(true)
    }

    /// Assign ids and fan out to every attached subscription. Oversized messages
    /// are rejected individually.
    pub(crate) fn publish(
        &mut self,
        topic: &str,
        messages: Vec<WireMessage>,
        max_message_bytes: usize,
    ) -> Result<Vec<PublishOutcome>> {
        let Some(attached) = self.topics.get(topic).cloned() else {
            return Err(Error::NotFound(format!("topic {topic}")));
        };
        let mut results = Vec::with_capacity(messages.len());
        for message in messages {
            if message.data.len() > max_message_bytes {
                results.push(PublishOutcome::Rejected {
                    error: Error::InvalidArgument(format!(
                        "message is {} bytes (max {max_message_bytes})",
                        message.data.len()
                    )),
                });
                continue;
            }
            self.next_message_id += 1;
            let message_id = self.next_message_id.to_string();
            for name in &attached {
                if let Some(subscription) = self.subscriptions.get_mut(name) {
                    subscription.backlog.push_back(StoredMessage {
                        message_id: message_id.clone(),
                        message: message.clone(),
                        delivery_attempt: 1,
                    });
                }
            }
            results.push(PublishOutcome::Published { message_id });
        }
        Ok(results)
    }

    /// Move up to `max` backlog messages into leases expiring after `ack_deadline`.
    pub(crate) fn lease(
        &mut self,
        subscription: &str,
        max: usize,
        ack_deadline: Duration,
        now: Instant,
    ) -> Vec<ReceivedWireMessage> {
        let Some(state) = self.subscriptions.get_mut(subscription) else {
            return Vec::new();
        };
        let count = max.min(state.backlog.len());
        let mut received = Vec::with_capacity(count);
        for message in state.backlog.drain(..count) {
            self.next_ack_id += 1;
            let ack_id = format!("{subscription}-{}", self.next_ack_id);
            received.push(ReceivedWireMessage {
                ack_id: ack_id.clone(),
                message_id: message.message_id.clone(),
                message: message.message.clone(),
                delivery_attempt: message.delivery_attempt,
            });
            state.leases.insert(
                ack_id,
                Lease {
                    message,
                    expires_at: now + ack_deadline,
                },
            );
        }
        received
    }

    pub(crate) fn ack(&mut self, subscription: &str, ack_ids: &[String]) -> usize {
        let Some(state) = self.subscriptions.get_mut(subscription) else {
            return 0;
        };
        let mut applied = 0;
        for ack_id in ack_ids {
            if let Some(lease) = state.leases.remove(ack_id) {
                state.acked.push(MessageId::new(lease.message.message_id));
                applied += 1;
            }
        }
        applied
    }

    pub(crate) fn nack(&mut self, subscription: &str, ack_ids: &[String]) -> usize {
        let Some(state) = self.subscriptions.get_mut(subscription) else {
            return 0;
        };
        // Reverse so the earliest nacked message ends up first in the backlog.
        ack_ids
            .iter()
            .rev()
            .filter(|ack_id| state.requeue(ack_id))
            .count()
    }

    pub(crate) fn modify_deadlines(
        &mut self,
        subscription: &str,
        modifications: &[DeadlineModification],
        now: Instant,
    ) {
        let Some(state) = self.subscriptions.get_mut(subscription) else {
            return;
        };
        for modification in modifications {
            state.deadline_modifications.push(modification.clone());
            if modification.deadline_ms == 0 {
                state.requeue(&modification.ack_id);
            } else if let Some(lease) = state.leases.get_mut(&modification.ack_id) {
                lease.expires_at = now + Duration::from_millis(modification.deadline_ms);
            }
        }
    }

    /// Requeue expired leases; returns how many were expired.
    pub(crate) fn expire(&mut self, subscription: &str, now: Instant) -> usize {
        let Some(state) = self.subscriptions.get_mut(subscription) else {
            return 0;
        };
        let mut expired: Vec<(String, String)> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(ack_id, lease)| (lease.message.message_id.clone(), ack_id.clone()))
            .collect();
        // Redeliver in publish order.
        expired.sort_by_key(|(message_id, _)| message_id.parse::<u64>().unwrap_or(u64::MAX));
        for (_, ack_id) in expired.iter().rev() {
            state.requeue(ack_id);
        }
        expired.len()
    }

    pub(crate) fn next_expiry(&self, subscription: &str) -> Option<Instant> {
        self.subscriptions
            .get(subscription)?
            .leases
            .values()
            .map(|lease| lease.expires_at)
            .min()
    }

    pub(crate) fn has_backlog(&self, subscription: &str) -> bool {
        self.subscriptions
            .get(subscription)
            .is_some_and(|state| !state.backlog.is_empty())
    }

    pub(crate) fn acked(&self, subscription: &str) -> Vec<MessageId> {
        self.subscriptions
            .get(subscription)
            .map(|state| state.acked.clone())
            .unwrap_or_default()
    }

    pub(crate) fn deadline_modifications(&self, subscription: &str) -> Vec<DeadlineModification> {
        self.subscriptions
            .get(subscription)
            .map(|state| state.deadline_modifications.clone())
            .unwrap_or_default()
    }

    pub(crate) fn outstanding_leases(&self, subscription: &str) -> usize {
        self.subscriptions
            .get(subscription)
            .map_or(0, |state| state.leases.len())
    }

    pub(crate) fn topic_of(&self, subscription: &str) -> Option<&str> {
        self.subscriptions
            .get(subscription)
            .map(|state| state.topic.as_str())
    }
}
