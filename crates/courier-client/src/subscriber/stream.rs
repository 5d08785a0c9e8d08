// Stream task: owns the pull stream, reconnects on transient failures, and is
// the only writer on the sink.
use courier_common::{Error, LeaseId, Result};
use courier_sim::SimulationLayer;
use courier_transport::{BidiStream, FrameSink, FrameSource};
use courier_wire::{
    DeadlineModification, STREAMING_PULL_PATH, StreamingPullRequest, StreamingPullResponse,
    decode_body, encode_body,
};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::leases::LeaseTable;
use super::{ReceivedMessage, SubscriberState};
use crate::config::{RetrySettings, SubscriberSettings};
use crate::flow_control::FlowController;

// Decoded responses the reader task may queue while the stream task is busy.
const READ_AHEAD_FRAMES: usize = 2;
// Ids per outbound request when coalescing queued commands.
const MAX_IDS_PER_REQUEST: usize = 1000;

#[derive(Debug)]
pub(crate) enum Command {
    Ack(LeaseId),
    Nack(LeaseId),
    ModifyDeadlines(Vec<DeadlineModification>),
}

#[derive(Debug)]
pub(crate) enum Delivery {
    Message(ReceivedMessage),
    Failed(Error),
}

/// State shared by the subscriber handle, the stream task and the extension task.
pub(crate) struct Shared {
    pub(crate) subscription: String,
    pub(crate) settings: SubscriberSettings,
    pub(crate) flow: FlowController,
    pub(crate) leases: LeaseTable,
    pub(crate) state: watch::Sender<SubscriberState>,
    pub(crate) commands: mpsc::UnboundedSender<Command>,
}

impl Shared {
    /// Move to `next` unless already there or already closed.
    pub(crate) fn set_state(&self, next: SubscriberState) {
        self.state.send_if_modified(|current| {
            if *current == SubscriberState::Closed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Forget every lease and return its flow-control charge.
    pub(crate) fn release_all(&self) -> Vec<LeaseId> {
        self.leases
            .drain()
            .into_iter()
            .map(|(lease_id, lease)| {
                self.flow.release(lease.charged_bytes);
                lease_id
            })
            .collect()
    }
}

enum StreamEnd {
    Cancelled,
    Failed(Error),
}

enum Admission {
    Admitted(u64),
    Refused,
    Cancelled,
}

pub(crate) struct StreamWorker {
    pub(crate) shared: Arc<Shared>,
    pub(crate) sim: Arc<SimulationLayer>,
    pub(crate) retry: RetrySettings,
    pub(crate) client_id: String,
    pub(crate) cancel: CancellationToken,
    /// Stops the extension task; a child of `cancel`.
    pub(crate) extension: CancellationToken,
    pub(crate) deliveries: mpsc::Sender<Delivery>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
}

impl StreamWorker {
    pub(crate) async fn run(mut self) {
        let subscription = self.shared.subscription.clone();
        let mut attempt = 0u32;
        let terminal = loop {
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break None,
                opened = self.open() => opened,
            };
            let err = match opened {
                Ok(stream) => {
                    attempt = 0;
                    self.shared.set_state(SubscriberState::Streaming);
                    tracing::debug!(%subscription, "pull stream open");
                    match self.pump(stream).await {
                        StreamEnd::Cancelled => break None,
                        StreamEnd::Failed(err) => err,
                    }
                }
                Err(err) => err,
            };
            if self.cancel.is_cancelled() {
                break None;
            }
            attempt += 1;
            if !err.is_retryable() || attempt >= self.retry.max_attempts.max(1) {
                break Some(err);
            }
            let delay = self.retry.delay_for(attempt, &err);
            metrics::counter!("courier_client_sub_reconnects_total").increment(1);
            tracing::warn!(
                %subscription,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "pull stream failed; reconnecting"
            );
            self.shared.set_state(SubscriberState::Reconnecting);
            tokio::select! {
                _ = self.cancel.cancelled() => break None,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        match terminal {
            Some(err) => {
                tracing::error!(%subscription, error = %err, "pull stream failed permanently");
                self.shared.set_state(SubscriberState::Closed);
                self.extension.cancel();
                let abandoned = self.shared.release_all();
                if !abandoned.is_empty() {
                    tracing::debug!(%subscription, leases = abandoned.len(), "released leases after stream failure");
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = self.deliveries.send(Delivery::Failed(err)) => {}
                }
            }
            None => {
                self.shared.set_state(SubscriberState::Closed);
                // Closed while no stream was open; the broker redelivers these later.
                let abandoned = self.shared.release_all();
                if !abandoned.is_empty() {
                    tracing::debug!(%subscription, leases = abandoned.len(), "released leases on close");
                }
            }
        }
    }

    async fn open(&self) -> Result<BidiStream> {
        let initial = StreamingPullRequest {
            subscription: Some(self.shared.subscription.clone()),
            stream_ack_deadline_ms: Some(self.shared.settings.ack_deadline.as_millis() as u64),
            client_id: Some(self.client_id.clone()),
            ..StreamingPullRequest::default()
        };
        let body = encode_body(&initial)?;
        self.sim
            .open_stream(STREAMING_PULL_PATH, Some(&self.shared.subscription), body)
            .await
    }

    async fn pump(&mut self, stream: BidiStream) -> StreamEnd {
        let BidiStream { mut sink, source } = stream;
        let (batch_tx, mut batches) = mpsc::channel(READ_AHEAD_FRAMES);
        let reader = tokio::spawn(read_frames(source, Arc::clone(&self.shared), batch_tx));
        let end = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StreamEnd::Cancelled,
                Some(command) = self.commands.recv() => {
                    if let Err(err) = self.send_commands(&mut sink, Some(command), Vec::new()).await {
                        break StreamEnd::Failed(err);
                    }
                }
                batch = batches.recv() => match batch {
                    Some(Ok(messages)) => {
                        let mut pending = VecDeque::from(messages);
                        if let Some(end) = self.deliver(&mut sink, &mut pending).await {
                            break end;
                        }
                    }
                    Some(Err(err)) => break StreamEnd::Failed(err),
                    None => break StreamEnd::Failed(Error::Connection("pull stream ended by broker".into())),
                },
            }
        };
        reader.abort();
        let _ = reader.await;
        match &end {
            StreamEnd::Cancelled => {
                // Hand outstanding messages back to the broker, along with queued acks.
                let nacks = self.shared.release_all();
                if let Err(err) = self.send_commands(&mut sink, None, nacks).await {
                    tracing::debug!(error = %err, "could not nack outstanding leases on close");
                }
            }
            StreamEnd::Failed(_) => {
                // Received on this stream but never handed out; the broker
                // redelivers them once their leases lapse.
                let dropped = self.shared.leases.drop_held();
                if dropped > 0 {
                    tracing::debug!(dropped, "forgot undelivered messages of the failed stream");
                }
            }
        }
        let _ = sink.close().await;
        end
    }

    async fn deliver(
        &mut self,
        sink: &mut Box<dyn FrameSink>,
        pending: &mut VecDeque<ReceivedMessage>,
    ) -> Option<StreamEnd> {
        while let Some(message) = pending.front() {
            let lease_id = message.lease_id.clone();
            let size = message.size() as u64;
            let charged = match self.admit(sink, size).await {
                Ok(Admission::Admitted(charged)) => charged,
                Ok(Admission::Refused) => {
                    pending.pop_front();
                    self.shared.leases.remove(&lease_id);
                    metrics::counter!("courier_client_sub_flow_rejections_total").increment(1);
                    if let Err(err) = self.send_commands(sink, None, vec![lease_id]).await {
                        return Some(StreamEnd::Failed(err));
                    }
                    continue;
                }
                Ok(Admission::Cancelled) => return Some(StreamEnd::Cancelled),
                Err(err) => return Some(StreamEnd::Failed(err)),
            };
            let Some(message) = pending.pop_front() else {
                break;
            };
            if !self.shared.leases.admit(&lease_id, charged) {
                // Held back past max_ack_extension.
                self.shared.flow.release(charged);
                continue;
            }
            metrics::counter!("courier_client_sub_messages_received_total").increment(1);
            if let Some(end) = self.hand_over(sink, message).await {
                if matches!(end, StreamEnd::Failed(_))
                    && let Some(lease) = self.shared.leases.remove(&lease_id)
                {
                    self.shared.flow.release(lease.charged_bytes);
                }
                return Some(end);
            }
        }
        None
    }

    /// Queue `message` for `next`. Acks and extensions keep flowing while the
    /// caller is slow to take it.
    async fn hand_over(
        &mut self,
        sink: &mut Box<dyn FrameSink>,
        message: ReceivedMessage,
    ) -> Option<StreamEnd> {
        loop {
            let command = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Some(StreamEnd::Cancelled),
                permit = self.deliveries.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(Delivery::Message(message));
                            None
                        }
                        // The subscriber handle is gone.
                        Err(_) => Some(StreamEnd::Cancelled),
                    };
                }
                Some(command) = self.commands.recv() => command,
            };
            if let Err(err) = self.send_commands(sink, Some(command), Vec::new()).await {
                return Some(StreamEnd::Failed(err));
            }
        }
    }

    /// Wait for flow-control capacity. Responses queue up in the reader meanwhile,
    /// already leased, and acks and lease extensions keep flowing.
    async fn admit(&mut self, sink: &mut Box<dyn FrameSink>, bytes: u64) -> Result<Admission> {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Admission::Cancelled),
                acquired = self.shared.flow.acquire(bytes) => {
                    return Ok(match acquired {
                        Ok(charged) => Admission::Admitted(charged),
                        Err(_) => Admission::Refused,
                    });
                }
                Some(command) = self.commands.recv() => {
                    self.send_commands(sink, Some(command), Vec::new()).await?;
                }
            }
        }
    }

    /// Coalesce `first`, anything already queued and `nacks` into one request.
    async fn send_commands(
        &mut self,
        sink: &mut Box<dyn FrameSink>,
        first: Option<Command>,
        nacks: Vec<LeaseId>,
    ) -> Result<()> {
        let mut request = StreamingPullRequest {
            nack_ids: nacks.into_iter().map(LeaseId::into_inner).collect(),
            ..StreamingPullRequest::default()
        };
        let mut next = first;
        loop {
            let command = match next.take() {
                Some(command) => command,
                None => match self.commands.try_recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            match command {
                Command::Ack(lease_id) => request.ack_ids.push(lease_id.into_inner()),
                Command::Nack(lease_id) => request.nack_ids.push(lease_id.into_inner()),
                Command::ModifyDeadlines(modifications) => {
                    request.deadline_modifications.extend(modifications);
                }
            }
            let ids = request.ack_ids.len()
                + request.nack_ids.len()
                + request.deadline_modifications.len();
            if ids >= MAX_IDS_PER_REQUEST {
                break;
            }
        }
        if request.is_empty() {
            return Ok(());
        }
        metrics::counter!("courier_client_sub_acks_sent_total").increment(request.ack_ids.len() as u64);
        metrics::counter!("courier_client_sub_nacks_sent_total").increment(request.nack_ids.len() as u64);
        sink.send(encode_body(&request)?).await
    }
}

/// Reader task: decodes pull responses and leases their messages on arrival, so
/// messages still queued here or waiting on flow control are extended.
async fn read_frames(
    mut source: Box<dyn FrameSource>,
    shared: Arc<Shared>,
    batches: mpsc::Sender<Result<Vec<ReceivedMessage>>>,
) {
    loop {
        let frame = match source.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                let _ = batches.send(Err(err)).await;
                return;
            }
        };
        let response: StreamingPullResponse = match decode_body(&frame) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable pull response");
                continue;
            }
        };
        let received_at = Instant::now();
        let messages: Vec<ReceivedMessage> = response
            .received_messages
            .into_iter()
            .map(ReceivedMessage::from_wire)
            .collect();
        for message in &messages {
            shared.leases.hold(message.lease_id.clone(), received_at);
        }
        if batches.send(Ok(messages)).await.is_err() {
            return;
        }
    }
}

/// Extension task: renews every live lease at 4/5 of the ack deadline and drops
/// leases held past `max_ack_extension`.
pub(crate) async fn run_lease_extension(shared: Arc<Shared>, cancel: CancellationToken) {
    let period = shared.settings.extension_interval();
    let deadline_ms = shared.settings.ack_deadline.as_millis() as u64;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let sweep = shared
            .leases
            .sweep(Instant::now(), shared.settings.max_ack_extension);
        if !sweep.expired.is_empty() {
            for lease in &sweep.expired {
                shared.flow.release(lease.charged_bytes);
            }
            metrics::counter!("courier_client_sub_leases_expired_total")
                .increment(sweep.expired.len() as u64);
            tracing::debug!(
                subscription = %shared.subscription,
                expired = sweep.expired.len(),
                "stopped extending leases past max_ack_extension"
            );
        }
        if sweep.live.is_empty() {
            continue;
        }
        metrics::counter!("courier_client_sub_lease_extensions_total")
            .increment(sweep.live.len() as u64);
        let modifications = sweep
            .live
            .into_iter()
            .map(|lease_id| DeadlineModification {
                ack_id: lease_id.into_inner(),
                deadline_ms,
            })
            .collect();
        if shared
            .commands
            .send(Command::ModifyDeadlines(modifications))
            .is_err()
        {
            break;
        }
    }
}
