// Flow-controlled streaming subscriber with lease extension and reconnection.
use bytes::Bytes;
use courier_common::{LeaseId, MessageId, Result};
use courier_sim::SimulationLayer;
use courier_wire::ReceivedWireMessage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{RetrySettings, SubscriberSettings};
use crate::flow_control::FlowController;

mod leases;
mod stream;

use leases::LeaseTable;
use stream::{Command, Delivery, Shared, StreamWorker, run_lease_extension};

// Delivered-but-not-yet-taken messages. Flow control bounds the real backlog.
const DELIVERY_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Connecting,
    Streaming,
    Reconnecting,
    /// Terminal.
    Closed,
}

/// One delivery of a message. Settle it with `Subscriber::ack` or `Subscriber::nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub lease_id: LeaseId,
    pub message_id: MessageId,
    pub data: Bytes,
    pub attributes: BTreeMap<String, String>,
    pub ordering_key: Option<String>,
    pub delivery_attempt: u32,
}

impl ReceivedMessage {
    pub(crate) fn from_wire(received: ReceivedWireMessage) -> Self {
        Self {
            lease_id: LeaseId::new(received.ack_id),
            message_id: MessageId::new(received.message_id),
            data: received.message.data,
            attributes: received.message.attributes,
            ordering_key: received.message.ordering_key,
            delivery_attempt: received.delivery_attempt,
        }
    }

    /// Size charged against the flow-control byte limit.
    pub fn size(&self) -> usize {
        let attributes: usize = self
            .attributes
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum();
        self.data.len() + attributes + self.ordering_key.as_ref().map_or(0, String::len)
    }
}

/// A long-lived pull on one subscription.
///
/// A stream task owns the broker stream and reconnects with backoff; a second
/// task extends leases. Both stop on `close`. Every method takes `&self`, so one
/// task can wait in `next` while another acks or closes.
pub struct Subscriber {
    shared: Arc<Shared>,
    deliveries: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("subscription", &self.shared.subscription)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Start pulling `subscription`. Must be called inside a tokio runtime.
    pub fn new(
        sim: Arc<SimulationLayer>,
        subscription: &str,
        settings: SubscriberSettings,
        retry: RetrySettings,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (deliveries_tx, deliveries_rx) = mpsc::channel(DELIVERY_QUEUE_DEPTH);
        let (state, _) = watch::channel(SubscriberState::Connecting);
        let shared = Arc::new(Shared {
            subscription: subscription.to_string(),
            flow: FlowController::new(settings.flow_control.clone()),
            settings,
            leases: LeaseTable::default(),
            state,
            commands: commands_tx,
        });
        let cancel = CancellationToken::new();
        let extension = cancel.child_token();
        let worker = StreamWorker {
            shared: Arc::clone(&shared),
            sim,
            retry,
            client_id: uuid::Uuid::new_v4().to_string(),
            cancel: cancel.clone(),
            extension: extension.clone(),
            deliveries: deliveries_tx,
            commands: commands_rx,
        };
        let stream_task = tokio::spawn(worker.run());
        let extension_task =
            tokio::spawn(run_lease_extension(Arc::clone(&shared), extension));
        tracing::debug!(subscription, "subscriber started");
        Self {
            shared,
            deliveries: tokio::sync::Mutex::new(deliveries_rx),
            cancel,
            tasks: Mutex::new(vec![stream_task, extension_task]),
        }
    }

    pub fn subscription(&self) -> &str {
        &self.shared.subscription
    }

    /// Next message, waiting for one if necessary.
    ///
    /// `Ok(None)` means the stream is over: closed, or a terminal error was
    /// already reported by an earlier call.
    pub async fn next(&self) -> Result<Option<ReceivedMessage>> {
        if self.cancel.is_cancelled() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(None),
            delivery = async { self.deliveries.lock().await.recv().await } => match delivery {
                Some(Delivery::Message(message)) => Ok(Some(message)),
                Some(Delivery::Failed(err)) => Err(err),
                None => Ok(None),
            },
        }
    }

    /// Acknowledge a delivery. Unknown, settled and expired leases are ignored.
    pub fn ack(&self, lease_id: &LeaseId) {
        self.settle(lease_id, Command::Ack);
    }

    /// Ask for redelivery. Unknown, settled and expired leases are ignored.
    pub fn nack(&self, lease_id: &LeaseId) {
        self.settle(lease_id, Command::Nack);
    }

    fn settle(&self, lease_id: &LeaseId, command: fn(LeaseId) -> Command) {
        let Some(lease) = self.shared.leases.remove(lease_id) else {
            tracing::trace!(lease = %lease_id, "ignoring settle of unknown lease");
            return;
        };
        self.shared.flow.release(lease.charged_bytes);
        // The stream task may already be gone; the broker then redelivers on expiry.
        let _ = self.shared.commands.send(command(lease_id.clone()));
    }

    pub fn state(&self) -> SubscriberState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.shared.state.subscribe()
    }

    /// `(messages, bytes)` delivered and not yet settled.
    pub fn outstanding(&self) -> (u64, u64) {
        self.shared.flow.outstanding()
    }

    /// Stop both tasks, nack outstanding leases (best effort) and wait for the
    /// tasks to finish. Pending and later `next` calls return `Ok(None)`.
    pub async fn close(&self) {
        self.shared.set_state(SubscriberState::Closed);
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await
                && err.is_panic()
            {
                tracing::warn!(subscription = %self.shared.subscription, "subscriber task panicked");
            }
        }
        tracing::debug!(subscription = %self.shared.subscription, "subscriber closed");
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
