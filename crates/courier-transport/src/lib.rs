// Transport abstraction shared by the client, the simulation layer and the emulator.
use async_trait::async_trait;
use bytes::Bytes;
use courier_common::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;

mod frame_io;
pub mod quic;
pub mod rpc;
pub mod tls;

pub use quic::{QuicEndpoint, TransportConfig};
pub use rpc::{QuicTransport, serve};

/// Outbound half of a bidirectional stream.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Half-close: the peer sees end-of-stream after the frames already sent.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a bidirectional stream.
///
/// `Ok(None)` is a clean end of stream. Implementations are not required to be
/// cancel-safe; callers that race `recv` against other futures should drive it
/// from a dedicated task.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<Option<Bytes>>;
}

pub struct BidiStream {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl BidiStream {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }
}

impl std::fmt::Debug for BidiStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BidiStream").finish_non_exhaustive()
    }
}

/// Request/response and streaming calls addressed by method path.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, path: &str, body: Bytes) -> Result<Bytes>;

    async fn open_stream(&self, path: &str, initial: Bytes) -> Result<BidiStream>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, path: &str, body: Bytes) -> Result<Bytes> {
        (**self).send(path, body).await
    }

    async fn open_stream(&self, path: &str, initial: Bytes) -> Result<BidiStream> {
        (**self).open_stream(path, initial).await
    }
}

/// In-memory frame channel. The sink can also terminate the stream with an error.
///
/// ```
/// use bytes::Bytes;
/// use courier_transport::{FrameSink, FrameSource, frame_channel};
///
/// # tokio_test_block(async {
/// let (mut sink, mut source) = frame_channel(4);
/// sink.send(Bytes::from_static(b"a")).await.expect("send");
/// sink.close().await.expect("close");
/// assert_eq!(source.recv().await.expect("recv"), Some(Bytes::from_static(b"a")));
/// assert_eq!(source.recv().await.expect("recv"), None);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().expect("rt").block_on(f)
/// # }
/// ```
pub fn frame_channel(capacity: usize) -> (ChannelSink, ChannelSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx: Some(tx) }, ChannelSource { rx })
}

#[derive(Debug)]
pub struct ChannelSink {
    tx: Option<mpsc::Sender<Result<Bytes>>>,
}

impl ChannelSink {
    /// End the stream with `err`; the source yields it once and then `Ok(None)`.
    pub async fn fail(&mut self, err: Error) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Err(Error::Closed);
        };
        tx.send(Err(err))
            .await
            .map_err(|_| Error::Connection("stream peer dropped".into()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(Error::Closed)?;
        tx.send(Ok(frame))
            .await
            .map_err(|_| Error::Connection("stream peer dropped".into()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}

#[derive(Debug)]
pub struct ChannelSource {
    rx: mpsc::Receiver<Result<Bytes>>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(err)) => {
                self.rx.close();
                Err(err)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_delivers_then_ends() {
        let (mut sink, mut source) = frame_channel(2);
        sink.send(Bytes::from_static(b"one")).await.expect("send");
        sink.send(Bytes::from_static(b"two")).await.expect("send");
        drop(sink);
        assert_eq!(source.recv().await.expect("recv"), Some(Bytes::from_static(b"one")));
        assert_eq!(source.recv().await.expect("recv"), Some(Bytes::from_static(b"two")));
        assert_eq!(source.recv().await.expect("recv"), None);
    }

    #[tokio::test]
    async fn channel_failure_is_terminal() {
        let (mut sink, mut source) = frame_channel(2);
        sink.fail(Error::Connection("reset".into()))
            .await
            .expect("fail");
        assert!(sink.is_closed());
        assert_eq!(
            source.recv().await,
            Err(Error::Connection("reset".into()))
        );
        assert_eq!(source.recv().await, Ok(None));
        assert_eq!(sink.send(Bytes::new()).await, Err(Error::Closed));
    }

    #[tokio::test]
    async fn send_to_dropped_source_is_connection_error() {
        let (mut sink, source) = frame_channel(1);
        drop(source);
        let err = sink.send(Bytes::from_static(b"x")).await.expect_err("send");
        assert!(err.is_retryable());
    }
}
