// In-process broker emulator: topics, subscriptions, leases and fault injection.
//
// Implements `Transport` directly so clients can run against it without a network,
// and can be served over QUIC by the emulator service.
use async_trait::async_trait;
use bytes::Bytes;
use courier_common::{Error, MAX_DATA_BYTES, MessageId, Result};
use courier_transport::{BidiStream, Transport, frame_channel};
use courier_wire::{
    DeadlineModification, PUBLISH_PATH, PublishRequest, PublishResponse, STREAMING_PULL_PATH,
    StreamingPullRequest, decode_body, encode_body,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

mod session;
mod state;

use session::Session;
use state::State;

const DEFAULT_MAX_MESSAGES_PER_RESPONSE: usize = 100;
const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);
const DEFAULT_STREAM_CHANNEL_DEPTH: usize = 16;

#[derive(Debug, Clone)]
pub struct EmulatorConfig {
    /// Larger messages get a per-message `InvalidArgument` outcome.
    pub max_message_bytes: usize,
    pub max_messages_per_response: usize,
    /// Used when a pull stream does not ask for a deadline.
    pub default_ack_deadline: Duration,
    pub stream_channel_depth: usize,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: MAX_DATA_BYTES,
            max_messages_per_response: DEFAULT_MAX_MESSAGES_PER_RESPONSE,
            default_ack_deadline: DEFAULT_ACK_DEADLINE,
            stream_channel_depth: DEFAULT_STREAM_CHANNEL_DEPTH,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    publishes: VecDeque<Error>,
    stream_opens: VecDeque<Error>,
    publish_delay: Option<Duration>,
}

pub(crate) struct Inner {
    pub(crate) config: EmulatorConfig,
    pub(crate) state: Mutex<State>,
    // Wakes idle sessions after publishes and nacks.
    pub(crate) notify: Notify,
    // Bumped by `disconnect_streams`; every live session resets.
    pub(crate) disconnect: watch::Sender<u64>,
    pub(crate) shutdown: CancellationToken,
    faults: Mutex<Faults>,
    publish_requests: Mutex<Vec<PublishRequest>>,
    publish_calls: AtomicUsize,
    stream_opens: AtomicUsize,
    next_session: AtomicU64,
}

impl Inner {
    pub(crate) fn apply_request(&self, subscription: &str, request: &StreamingPullRequest) {
        if request.is_empty() {
            return;
        }
        let now = Instant::now();
        let (acked, nacked) = {
            let mut state = self.state.lock();
            let acked = state.ack(subscription, &request.ack_ids);
            let nacked = state.nack(subscription, &request.nack_ids);
            state.modify_deadlines(subscription, &request.deadline_modifications, now);
            (acked, nacked)
        };
        metrics::counter!("courier_emulator_acks_total").increment(acked as u64);
        if nacked > 0 || request.deadline_modifications.iter().any(|m| m.deadline_ms == 0) {
            metrics::counter!("courier_emulator_nacks_total").increment(nacked as u64);
            self.notify.notify_waiters();
        }
    }
}

/// In-memory broker.
///
/// ```
/// use courier_emulator::Emulator;
///
/// let emulator = Emulator::default();
/// assert!(emulator.create_topic("orders"));
/// emulator.create_subscription("orders-sub", "orders").expect("subscription");
/// assert_eq!(emulator.publish_call_count(), 0);
/// ```
#[derive(Clone)]
pub struct Emulator {
    inner: Arc<Inner>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(EmulatorConfig::default())
    }
}

impl std::fmt::Debug for Emulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emulator")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Self {
        let (disconnect, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                disconnect,
                shutdown: CancellationToken::new(),
                faults: Mutex::new(Faults::default()),
                publish_requests: Mutex::new(Vec::new()),
                publish_calls: AtomicUsize::new(0),
                stream_opens: AtomicUsize::new(0),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.inner.config
    }

    /// Returns false when the topic already exists.
    pub fn create_topic(&self, topic: &str) -> bool {
        self.inner.state.lock().create_topic(topic)
    }

    /// Attach a subscription to an existing topic. Only messages published afterwards
    /// are delivered to it.
    pub fn create_subscription(&self, subscription: &str, topic: &str) -> Result<bool> {
        self.inner
            .state
            .lock()
            .create_subscription(subscription, topic)
    }

    /// The next `count` publish calls fail with `error` before touching any state.
    pub fn fail_next_publishes(&self, count: usize, error: Error) {
        let mut faults = self.inner.faults.lock();
        faults
            .publishes
            .extend(std::iter::repeat_n(error, count));
    }

    /// The next `count` stream opens fail with `error`.
    pub fn fail_next_stream_opens(&self, count: usize, error: Error) {
        let mut faults = self.inner.faults.lock();
        faults
            .stream_opens
            .extend(std::iter::repeat_n(error, count));
    }

    /// Delay every publish call, to widen in-flight windows in tests.
    pub fn set_publish_delay(&self, delay: Option<Duration>) {
        self.inner.faults.lock().publish_delay = delay;
    }

    /// Reset every live pull stream with a retryable `Connection` error.
    pub fn disconnect_streams(&self) {
        self.inner.disconnect.send_modify(|generation| *generation += 1);
    }

    /// End every pull stream and refuse new ones.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Publish requests that were accepted, in arrival order.
    pub fn publish_requests(&self) -> Vec<PublishRequest> {
        self.inner.publish_requests.lock().clone()
    }

    /// Every publish call, including injected failures.
    pub fn publish_call_count(&self) -> usize {
        self.inner.publish_calls.load(Ordering::SeqCst)
    }

    pub fn stream_open_count(&self) -> usize {
        self.inner.stream_opens.load(Ordering::SeqCst)
    }

    pub fn acked_message_ids(&self, subscription: &str) -> Vec<MessageId> {
        self.inner.state.lock().acked(subscription)
    }

    pub fn deadline_modifications(&self, subscription: &str) -> Vec<DeadlineModification> {
        self.inner.state.lock().deadline_modifications(subscription)
    }

    pub fn outstanding_leases(&self, subscription: &str) -> usize {
        self.inner.state.lock().outstanding_leases(subscription)
    }

    async fn publish(&self, body: Bytes) -> Result<Bytes> {
        self.inner.publish_calls.fetch_add(1, Ordering::SeqCst);
        metrics::counter!("courier_emulator_publish_calls_total").increment(1);
        let (fault, delay) = {
            let mut faults = self.inner.faults.lock();
            (faults.publishes.pop_front(), faults.publish_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = fault {
            tracing::debug!(error = %error, "injected publish failure");
            return Err(error);
        }
        let request: PublishRequest =
            decode_body(&body).map_err(|err| Error::InvalidArgument(err.to_string()))?;
        let results = self.inner.state.lock().publish(
            &request.topic,
            request.messages.clone(),
            self.inner.config.max_message_bytes,
        )?;
        metrics::counter!("courier_emulator_messages_published_total")
            .increment(request.messages.len() as u64);
        tracing::trace!(topic = %request.topic, count = request.messages.len(), "publish accepted");
        self.inner.publish_requests.lock().push(request);
        self.inner.notify.notify_waiters();
        Ok(encode_body(&PublishResponse { results })?)
    }

    fn open_pull(&self, initial: Bytes) -> Result<BidiStream> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Connection("emulator is shut down".into()));
        }
        self.inner.stream_opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.inner.faults.lock().stream_opens.pop_front() {
            tracing::debug!(error = %error, "injected stream open failure");
            return Err(error);
        }
        let request: StreamingPullRequest =
            decode_body(&initial).map_err(|err| Error::InvalidArgument(err.to_string()))?;
        let subscription = request
            .subscription
            .clone()
            .ok_or_else(|| Error::InvalidArgument("first pull request names no subscription".into()))?;
        let topic = self
            .inner
            .state
            .lock()
            .topic_of(&subscription)
            .map(str::to_string)
            .ok_or_else(|| Error::NotFound(format!("subscription {subscription}")))?;
        self.inner.apply_request(&subscription, &request);

        let ack_deadline = request
            .stream_ack_deadline_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.inner.config.default_ack_deadline);
        let depth = self.inner.config.stream_channel_depth;
        let (client_sink, session_source) = frame_channel(depth);
        let (session_sink, client_source) = frame_channel(depth);
        let session = Session {
            id: self.inner.next_session.fetch_add(1, Ordering::Relaxed),
            subscription,
            ack_deadline,
            inner: Arc::clone(&self.inner),
            sink: session_sink,
            source: session_source,
        };
        metrics::counter!("courier_emulator_streams_opened_total").increment(1);
        tracing::debug!(session = session.id, subscription = %session.subscription, %topic, "pull stream opened");
        tokio::spawn(session.run());
        Ok(BidiStream::new(client_sink, client_source))
    }
}

#[async_trait]
impl Transport for Emulator {
    async fn send(&self, path: &str, body: Bytes) -> Result<Bytes> {
        match path {
            PUBLISH_PATH => self.publish(body).await,
            other => Err(Error::NotFound(format!("method {other}"))),
        }
    }

    async fn open_stream(&self, path: &str, initial: Bytes) -> Result<BidiStream> {
        match path {
            STREAMING_PULL_PATH => self.open_pull(initial),
            other => Err(Error::NotFound(format!("method {other}"))),
        }
    }
}
