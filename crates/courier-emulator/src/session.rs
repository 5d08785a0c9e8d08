// One streaming-pull session: leases messages out and applies acks coming back.
use bytes::Bytes;
use courier_common::{Error, Result};
use courier_transport::{ChannelSink, ChannelSource, FrameSink, FrameSource};
use courier_wire::{StreamingPullRequest, StreamingPullResponse, decode_body, encode_body};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::Inner;

// Upper bound on how long a session sleeps without re-checking lease expiry.
const IDLE_RECHECK: Duration = Duration::from_millis(250);

pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) subscription: String,
    pub(crate) ack_deadline: Duration,
    pub(crate) inner: Arc<Inner>,
    pub(crate) sink: ChannelSink,
    pub(crate) source: ChannelSource,
}

enum Event {
    Sent(Result<()>),
    Woke,
    Inbound(Result<Option<Bytes>>),
    Disconnected,
    Shutdown,
}

impl Session {
    pub(crate) async fn run(mut self) {
        let mut disconnect = self.inner.disconnect.subscribe();
        // Response waiting for room in the client's channel. Reads keep going meanwhile
        // so acks are never stuck behind a full outbound channel.
        let mut outgoing: Option<Bytes> = None;
        tracing::debug!(session = self.id, subscription = %self.subscription, "pull session started");
        let reason = loop {
            // Register interest before inspecting state so a publish in between is not missed.
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let now = Instant::now();
            let next_expiry = if outgoing.is_none() {
                let (received, next_expiry) = self.lease(now);
                if !received.is_empty() {
                    metrics::counter!("courier_emulator_messages_leased_total")
                        .increment(received.len() as u64);
                    let response = StreamingPullResponse {
                        received_messages: received,
                    };
                    match encode_body(&response) {
                        Ok(body) => outgoing = Some(body),
                        Err(err) => break format!("encode response: {err}"),
                    }
                }
                next_expiry
            } else {
                None
            };
            let wake_at = next_expiry
                .map(|at| at.min(now + IDLE_RECHECK))
                .unwrap_or(now + IDLE_RECHECK);

            let pending = outgoing.clone();
            let event = tokio::select! {
                sent = self.sink.send(pending.clone().unwrap_or_default()), if pending.is_some() => Event::Sent(sent),
                _ = &mut notified, if pending.is_none() => Event::Woke,
                _ = tokio::time::sleep_until(wake_at), if pending.is_none() => Event::Woke,
                frame = self.source.recv() => Event::Inbound(frame),
                _ = disconnect.changed() => Event::Disconnected,
                _ = self.inner.shutdown.cancelled() => Event::Shutdown,
            };

            match event {
                Event::Sent(Ok(())) => outgoing = None,
                Event::Sent(Err(_)) => break "client went away".to_string(),
                Event::Woke => {}
                Event::Inbound(Ok(Some(frame))) => self.apply(frame),
                Event::Inbound(Ok(None)) => break "client closed".to_string(),
                Event::Inbound(Err(err)) => break format!("client stream failed: {err}"),
                Event::Disconnected => {
                    let _ = self
                        .sink
                        .fail(Error::Connection("stream reset by emulator".into()))
                        .await;
                    break "disconnected".to_string();
                }
                Event::Shutdown => break "emulator shut down".to_string(),
            }
        };
        let _ = self.sink.close().await;
        tracing::debug!(session = self.id, subscription = %self.subscription, %reason, "pull session ended");
    }

    fn lease(&self, now: Instant) -> (Vec<courier_wire::ReceivedWireMessage>, Option<Instant>) {
        let mut state = self.inner.state.lock();
        let expired = state.expire(&self.subscription, now);
        if expired > 0 {
            tracing::debug!(session = self.id, expired, "lease deadlines passed; redelivering");
        }
        let received = state.lease(
            &self.subscription,
            self.inner.config.max_messages_per_response,
            self.ack_deadline,
            now,
        );
        (received, state.next_expiry(&self.subscription))
    }

    fn apply(&self, frame: Bytes) {
        match decode_body::<StreamingPullRequest>(&frame) {
            Ok(request) => self.inner.apply_request(&self.subscription, &request),
            Err(err) => {
                tracing::warn!(session = self.id, error = %err, "dropping undecodable pull request");
            }
        }
    }
}
