// Stream wrappers for recording and replaying streaming calls.
use async_trait::async_trait;
use bytes::Bytes;
use courier_common::{Error, Result};
use courier_transport::{BidiStream, FrameSink, FrameSource};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::ReplayTiming;
use crate::record::{
    RecordEntry, RecordLog, RecordedFrame, RecordedOutcome, StreamEnd, StreamTranscript,
};

/// Transcript shared by both halves of a recorded stream.
///
/// Committed to the log once: when the broker ends the stream, or when the last
/// half is dropped.
struct Capture {
    log: Arc<Mutex<RecordLog>>,
    entry: Option<RecordEntry>,
    transcript: StreamTranscript,
    opened_at: Instant,
}

impl Capture {
    fn offset_ms(&self) -> u64 {
        self.opened_at.elapsed().as_millis() as u64
    }

    fn commit(&mut self, end: StreamEnd) {
        let Some(mut entry) = self.entry.take() else {
            return;
        };
        let mut transcript = std::mem::take(&mut self.transcript);
        transcript.end = end;
        tracing::debug!(
            id = entry.id,
            operation = %entry.operation,
            inbound = transcript.inbound.len(),
            outbound = transcript.outbound.len(),
            "recorded stream"
        );
        entry.outcome = RecordedOutcome::Stream(transcript);
        self.log.lock().commit(entry);
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        self.commit(StreamEnd::Closed);
    }
}

/// Wrap a live stream so every frame in both directions lands in `entry`.
pub(crate) fn record_stream(
    stream: BidiStream,
    log: Arc<Mutex<RecordLog>>,
    entry: RecordEntry,
    opened_at: Instant,
) -> BidiStream {
    let capture = Arc::new(Mutex::new(Capture {
        log,
        entry: Some(entry),
        transcript: StreamTranscript::default(),
        opened_at,
    }));
    BidiStream {
        sink: Box::new(RecordingSink {
            inner: stream.sink,
            capture: Arc::clone(&capture),
        }),
        source: Box::new(RecordingSource {
            inner: stream.source,
            capture,
        }),
    }
}

struct RecordingSink {
    inner: Box<dyn FrameSink>,
    capture: Arc<Mutex<Capture>>,
}

#[async_trait]
impl FrameSink for RecordingSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        {
            let mut capture = self.capture.lock();
            let offset_ms = capture.offset_ms();
            capture.transcript.outbound.push(RecordedFrame {
                offset_ms,
                body: frame.clone(),
            });
        }
        self.inner.send(frame).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

struct RecordingSource {
    inner: Box<dyn FrameSource>,
    capture: Arc<Mutex<Capture>>,
}

#[async_trait]
impl FrameSource for RecordingSource {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        let result = self.inner.recv().await;
        let mut capture = self.capture.lock();
        match &result {
            Ok(Some(frame)) => {
                let offset_ms = capture.offset_ms();
                capture.transcript.inbound.push(RecordedFrame {
                    offset_ms,
                    body: frame.clone(),
                });
            }
            Ok(None) => capture.commit(StreamEnd::Eof),
            Err(error) => capture.commit(StreamEnd::Error {
                error: error.clone(),
            }),
        }
        result
    }
}

/// Serve a recorded transcript back without touching the network.
pub(crate) fn replay_stream(transcript: StreamTranscript, timing: ReplayTiming) -> BidiStream {
    let closed = CancellationToken::new();
    BidiStream {
        sink: Box::new(ReplaySink {
            closed: closed.clone(),
        }),
        source: Box::new(ReplaySource {
            frames: transcript.inbound.into(),
            end: Some(transcript.end),
            timing,
            last_offset_ms: 0,
            closed,
        }),
    }
}

struct ReplaySink {
    closed: CancellationToken,
}

#[async_trait]
impl FrameSink for ReplaySink {
    async fn send(&mut self, _frame: Bytes) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

impl Drop for ReplaySink {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

struct ReplaySource {
    frames: VecDeque<RecordedFrame>,
    end: Option<StreamEnd>,
    timing: ReplayTiming,
    last_offset_ms: u64,
    closed: CancellationToken,
}

impl ReplaySource {
    fn delay_for(&mut self, offset_ms: u64) -> Duration {
        let delay = match self.timing {
            ReplayTiming::Instant => Duration::ZERO,
            ReplayTiming::Realistic => {
                Duration::from_millis(offset_ms.saturating_sub(self.last_offset_ms))
            }
            ReplayTiming::Fixed(delay) => delay,
        };
        self.last_offset_ms = offset_ms;
        delay
    }
}

#[async_trait]
impl FrameSource for ReplaySource {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        if let Some(frame) = self.frames.pop_front() {
            let delay = self.delay_for(frame.offset_ms);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            return Ok(Some(frame.body));
        }
        if matches!(self.end, Some(StreamEnd::Closed)) {
            // The recorded caller hung up first; hold the stream open until this one does.
            self.closed.cancelled().await;
            self.end = None;
            return Ok(None);
        }
        match self.end.take() {
            Some(StreamEnd::Error { error }) => Err(error),
            _ => Ok(None),
        }
    }
}
