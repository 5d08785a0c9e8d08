// Batching publisher with per-ordering-key sequencing.
use courier_common::{Error, Message, MessageId, Result};
use courier_sim::SimulationLayer;
use courier_wire::{
    PUBLISH_PATH, PublishOutcome, PublishRequest, PublishResponse, WireMessage, decode_body,
    encode_body,
};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{Notify, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{PausedKeyPolicy, PublisherSettings, RetrySettings};

pub mod batcher;
pub mod ordering;

pub use batcher::{Batch, MessageBatcher};
pub use ordering::{KeyState, OrderingKeyRegistry};

/// Topic plus optional ordering key; the unit of batching and sequencing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaneKey {
    pub topic: String,
    pub ordering_key: Option<String>,
}

impl LaneKey {
    pub fn new(topic: &str, ordering_key: Option<&str>) -> Self {
        Self {
            topic: topic.to_string(),
            ordering_key: ordering_key.filter(|key| !key.is_empty()).map(str::to_string),
        }
    }
}

/// One submitted message and the sending half of its result channel.
#[derive(Debug)]
pub struct PublishTicket {
    message: Message,
    encoded_len: usize,
    result: oneshot::Sender<Result<MessageId>>,
}

impl PublishTicket {
    pub fn new(message: Message) -> (Self, PublishHandle) {
        let (result, rx) = oneshot::channel();
        let ticket = Self {
            encoded_len: message.encoded_len(),
            message,
            result,
        };
        (ticket, PublishHandle { rx })
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Deliver the outcome. The caller may have stopped waiting; that is fine.
    pub fn resolve(self, result: Result<MessageId>) {
        let _ = self.result.send(result);
    }
}

/// Resolves once with the broker-assigned id or the publish error.
#[derive(Debug)]
#[must_use = "the publish outcome is only observable through the handle"]
pub struct PublishHandle {
    rx: oneshot::Receiver<Result<MessageId>>,
}

impl Future for PublishHandle {
    type Output = Result<MessageId>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Closed)))
    }
}

struct PublisherState {
    batcher: MessageBatcher,
    ordering: OrderingKeyRegistry,
    closed: bool,
}

pub(crate) struct PublisherInner {
    sim: Arc<SimulationLayer>,
    settings: PublisherSettings,
    retry: RetrySettings,
    state: Mutex<PublisherState>,
    // Signalled whenever a batch completes.
    progress: Notify,
    cancel: CancellationToken,
    timer: Mutex<Option<JoinHandle<()>>>,
    sends: Mutex<JoinSet<()>>,
}

/// Batching publisher.
///
/// `submit` places the message in its lane and returns a handle. A periodic timer
/// seals batches older than `max_latency`; count and byte thresholds seal eagerly.
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("settings", &self.inner.settings)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(sim: Arc<SimulationLayer>, settings: PublisherSettings, retry: RetrySettings) -> Self {
        let inner = Arc::new(PublisherInner {
            sim,
            state: Mutex::new(PublisherState {
                batcher: MessageBatcher::new(&settings),
                ordering: OrderingKeyRegistry::default(),
                closed: false,
            }),
            settings,
            retry,
            progress: Notify::new(),
            cancel: CancellationToken::new(),
            timer: Mutex::new(None),
            sends: Mutex::new(JoinSet::new()),
        });
        let timer = tokio::spawn(run_flush_timer(
            Arc::downgrade(&inner),
            inner.cancel.clone(),
            inner.settings.tick_interval(),
        ));
        *inner.timer.lock() = Some(timer);
        Self { inner }
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.inner.settings
    }

    /// Queue `message` for `topic`.
    ///
    /// Validation failures, a closed publisher and (under `PausedKeyPolicy::Reject`)
    /// a paused ordering key are reported here; everything else resolves on the
    /// handle.
    pub fn submit(&self, topic: &str, message: Message) -> Result<PublishHandle> {
        message.validate()?;
        let lane = LaneKey::new(topic, message.ordering_key());
        let (ticket, handle) = PublishTicket::new(message);
        let ready = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(Error::Closed);
            }
            if lane.ordering_key.is_some()
                && let Err(err) = state.ordering.check_active(&lane)
            {
                match self.inner.settings.paused_key_policy {
                    PausedKeyPolicy::Reject => return Err(err),
                    PausedKeyPolicy::Queue => {
                        state.ordering.enqueue(&lane, ticket);
                        return Ok(handle);
                    }
                }
            }
            state.batcher.add(lane, ticket, Instant::now());
            state.batcher.take_ready()
        };
        self.inner.dispatch(ready);
        Ok(handle)
    }

    /// Send everything pending and wait until no batch is in flight. Tickets held
    /// behind paused ordering keys are not waited for.
    pub async fn flush(&self) -> Result<()> {
        let ready = {
            let mut state = self.inner.state.lock();
            state.batcher.seal_all();
            state.batcher.take_ready()
        };
        self.inner.dispatch(ready);
        loop {
            let progress = self.inner.progress.notified();
            tokio::pin!(progress);
            progress.as_mut().enable();
            {
                let mut state = self.inner.state.lock();
                if state.batcher.is_idle() {
                    return Ok(());
                }
                // Messages submitted during the flush are sent too.
                state.batcher.seal_all();
                let ready = state.batcher.take_ready();
                drop(state);
                self.inner.dispatch(ready);
            }
            progress.await;
        }
    }

    /// Unpause `ordering_key` on `topic` and send its queued messages in order.
    pub fn resume_ordering(&self, topic: &str, ordering_key: &str) {
        let lane = LaneKey::new(topic, Some(ordering_key));
        let ready = {
            let mut state = self.inner.state.lock();
            let queued = state.ordering.resume(&lane);
            let now = Instant::now();
            let count = queued.len();
            for ticket in queued {
                state.batcher.add(lane.clone(), ticket, now);
            }
            if count > 0 {
                tracing::info!(topic, ordering_key, replayed = count, "resumed ordering key");
            }
            state.batcher.take_ready()
        };
        self.inner.dispatch(ready);
    }

    /// Lanes currently paused by a failed batch.
    pub fn paused_keys(&self) -> Vec<LaneKey> {
        self.inner.state.lock().ordering.paused_lanes()
    }

    /// Stop the timer and flush with a bounded wait.
    ///
    /// Afterwards queued tickets of paused keys resolve with `OrderingPaused`,
    /// anything still unsent resolves with `Timeout`, and `submit` fails with
    /// `Closed`. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        self.inner.cancel.cancel();
        let timer = self.inner.timer.lock().take();
        if let Some(timer) = timer {
            let _ = timer.await;
        }

        let flushed =
            tokio::time::timeout(self.inner.settings.close_timeout, self.flush()).await;

        let (queued, unsent) = {
            let mut state = self.inner.state.lock();
            (state.ordering.drain_queued(), state.batcher.drain_unsent())
        };
        for (lane, ticket) in queued {
            ticket.resolve(Err(ordering::paused_error(&lane)));
        }
        let timed_out = Error::Timeout("publisher shutdown flush".into());
        for ticket in unsent {
            ticket.resolve(Err(timed_out.clone()));
        }

        let mut sends = std::mem::take(&mut *self.inner.sends.lock());
        if flushed.is_err() {
            tracing::warn!(
                close_timeout_ms = self.inner.settings.close_timeout.as_millis() as u64,
                "publisher flush did not finish before close timeout; abandoning in-flight batches"
            );
            sends.abort_all();
        }
        while sends.join_next().await.is_some() {}
        match flushed {
            Ok(result) => result,
            Err(_) => Err(timed_out),
        }
    }
}

impl PublisherInner {
    fn dispatch(self: &Arc<Self>, ready: Vec<Batch>) {
        if ready.is_empty() {
            return;
        }
        let mut sends = self.sends.lock();
        // Reap finished sends so the set does not grow.
        while sends.try_join_next().is_some() {}
        for batch in ready {
            sends.spawn(Arc::clone(self).send_batch(batch));
        }
    }

    async fn send_batch(self: Arc<Self>, batch: Batch) {
        let Batch { lane, tickets, .. } = batch;
        let batch_size = tickets.len();
        metrics::counter!("courier_client_publish_batches_total").increment(1);
        metrics::histogram!("courier_client_publish_batch_messages").record(batch_size as f64);
        let request = PublishRequest {
            topic: lane.topic.clone(),
            messages: tickets
                .iter()
                .map(|ticket| WireMessage::from(ticket.message()))
                .collect(),
        };
        let result = match encode_body(&request) {
            Ok(body) => self.publish_with_retry(&lane, body, batch_size).await,
            Err(err) => Err(Error::from(err)),
        };

        match result {
            Ok(outcomes) => {
                let ready = {
                    let mut state = self.state.lock();
                    state.batcher.complete(&lane);
                    state.batcher.take_ready()
                };
                for (ticket, outcome) in tickets.into_iter().zip(outcomes) {
                    match outcome {
                        PublishOutcome::Published { message_id } => {
                            ticket.resolve(Ok(MessageId::new(message_id)));
                        }
                        PublishOutcome::Rejected { error } => {
                            metrics::counter!("courier_client_publish_rejected_total")
                                .increment(1);
                            ticket.resolve(Err(Error::MessageRejected {
                                message: error.to_string(),
                            }));
                        }
                    }
                }
                self.dispatch(ready);
            }
            Err(err) => {
                metrics::counter!("courier_client_publish_batch_failures_total").increment(1);
                tracing::warn!(
                    topic = %lane.topic,
                    ordering_key = lane.ordering_key.as_deref().unwrap_or(""),
                    batch_size,
                    error = %err,
                    "publish batch failed"
                );
                // Pause before resolving so callers reacting to the failure see it.
                let ready = {
                    let mut state = self.state.lock();
                    state.batcher.complete(&lane);
                    if lane.ordering_key.is_some() {
                        if state.ordering.pause(&lane) {
                            tracing::warn!(
                                topic = %lane.topic,
                                ordering_key = lane.ordering_key.as_deref().unwrap_or(""),
                                "ordering key paused; call resume_ordering to continue"
                            );
                        }
                        for ticket in state.batcher.take_unsent(&lane) {
                            state.ordering.enqueue(&lane, ticket);
                        }
                    }
                    state.batcher.take_ready()
                };
                let failure = Error::batch_failed(batch_size, err);
                for ticket in tickets {
                    ticket.resolve(Err(failure.clone()));
                }
                self.dispatch(ready);
            }
        }
        self.progress.notify_waiters();
    }

    async fn publish_with_retry(
        &self,
        lane: &LaneKey,
        body: bytes::Bytes,
        batch_size: usize,
    ) -> Result<Vec<PublishOutcome>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .sim
                .send(PUBLISH_PATH, Some(&lane.topic), body.clone())
                .await
                .and_then(|response| decode_response(&response, batch_size));
            match result {
                Ok(outcomes) => return Ok(outcomes),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts.max(1) => {
                    let delay = self.retry.delay_for(attempt, &err);
                    metrics::counter!("courier_client_publish_retries_total").increment(1);
                    tracing::debug!(
                        topic = %lane.topic,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying publish"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn decode_response(body: &[u8], expected: usize) -> Result<Vec<PublishOutcome>> {
    let response: PublishResponse = decode_body(body)?;
    if response.results.len() != expected {
        return Err(Error::Internal(format!(
            "publish response has {} results for {expected} messages",
            response.results.len()
        )));
    }
    Ok(response.results)
}

async fn run_flush_timer(
    inner: Weak<PublisherInner>,
    cancel: CancellationToken,
    period: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let ready = {
                    let mut state = inner.state.lock();
                    state.batcher.seal_expired(Instant::now());
                    state.batcher.take_ready()
                };
                inner.dispatch(ready);
            }
        }
    }
}

impl Drop for PublisherInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
