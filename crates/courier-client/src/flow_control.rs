// Outstanding-work ledger for subscribers.
use courier_common::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

use crate::config::{FlowControlSettings, LimitExceededBehavior};

/// Bounds the count and byte size of messages handed to the caller but not yet
/// acked or nacked.
///
/// A request larger than `max_outstanding_bytes` is charged as exactly that limit,
/// so it is admitted once nothing else holds bytes.
///
/// ```
/// use courier_client::config::{FlowControlSettings, LimitExceededBehavior};
/// use courier_client::flow_control::FlowController;
///
/// let flow = FlowController::new(FlowControlSettings {
///     max_outstanding_messages: 2,
///     max_outstanding_bytes: 100,
///     limit_exceeded_behavior: LimitExceededBehavior::Reject,
/// });
/// assert!(flow.try_acquire(60));
/// assert!(!flow.try_acquire(60));
/// flow.release(60);
/// assert!(flow.try_acquire(500));
/// assert_eq!(flow.outstanding(), (1, 100));
/// ```
#[derive(Debug)]
pub struct FlowController {
    max_messages: u64,
    max_bytes: u64,
    behavior: LimitExceededBehavior,
    outstanding_messages: AtomicU64,
    outstanding_bytes: AtomicU64,
    released: Notify,
}

impl FlowController {
    pub fn new(settings: FlowControlSettings) -> Self {
        Self {
            max_messages: settings.max_outstanding_messages.max(1),
            max_bytes: settings.max_outstanding_bytes.max(1),
            behavior: settings.limit_exceeded_behavior,
            outstanding_messages: AtomicU64::new(0),
            outstanding_bytes: AtomicU64::new(0),
            released: Notify::new(),
        }
    }

    /// Bytes actually charged for a request of `bytes`.
    fn charge_for(&self, bytes: u64) -> u64 {
        bytes.min(self.max_bytes)
    }

    /// Reserve one message of `bytes` if both limits allow it.
    pub fn try_acquire(&self, bytes: u64) -> bool {
        let charged = self.charge_for(bytes);
        let max_messages = self.max_messages;
        let reserved_count = self
            .outstanding_messages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max_messages).then_some(current + 1)
            })
            .is_ok();
        if !reserved_count {
            return false;
        }
        let max_bytes = self.max_bytes;
        let reserved_bytes = self
            .outstanding_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(charged)
                    .filter(|total| *total <= max_bytes)
            })
            .is_ok();
        if !reserved_bytes {
            self.outstanding_messages.fetch_sub(1, Ordering::AcqRel);
            // Another acquirer may have failed on the count we briefly held.
            self.released.notify_waiters();
            return false;
        }
        self.publish_gauges();
        true
    }

    /// Reserve capacity, waiting (`Block`) or failing (`Reject`) when full.
    /// Returns the charged byte count, which is what `release` must be given.
    pub async fn acquire(&self, bytes: u64) -> Result<u64> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.try_acquire(bytes) {
                return Ok(self.charge_for(bytes));
            }
            match self.behavior {
                LimitExceededBehavior::Reject => {
                    let (outstanding_messages, outstanding_bytes) = self.outstanding();
                    return Err(Error::FlowControlExceeded {
                        outstanding_messages,
                        outstanding_bytes,
                    });
                }
                LimitExceededBehavior::Block => released.await,
            }
        }
    }

    /// Return one message of `bytes` to the ledger.
    pub fn release(&self, bytes: u64) {
        let charged = self.charge_for(bytes);
        let _ = self
            .outstanding_messages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            });
        let _ = self
            .outstanding_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(charged))
            });
        self.publish_gauges();
        self.released.notify_waiters();
    }

    /// `(messages, bytes)` currently outstanding.
    pub fn outstanding(&self) -> (u64, u64) {
        (
            self.outstanding_messages.load(Ordering::Acquire),
            self.outstanding_bytes.load(Ordering::Acquire),
        )
    }

    fn publish_gauges(&self) {
        let (messages, bytes) = self.outstanding();
        metrics::gauge!("courier_client_flow_outstanding_messages").set(messages as f64);
        metrics::gauge!("courier_client_flow_outstanding_bytes").set(bytes as f64);
    }
}
