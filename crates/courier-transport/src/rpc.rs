// Transport calls carried over QUIC: client side and the server accept loop.
//
// Every call uses a fresh bidi stream. Unary: `call` then one `reply` or `status`.
// Streaming: `open_stream`, then `chunk`s both ways until the server finishes its
// send side or sends a terminal `status`.
use anyhow::{Context, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use courier_common::{Error, Result};
use courier_wire::Envelope;
use quinn::{Connection, RecvStream, SendStream};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::frame_io::{read_envelope, write_envelope};
use crate::quic::QuicEndpoint;
use crate::{BidiStream, FrameSink, FrameSource, Transport};

fn connection_error(err: anyhow::Error) -> Error {
    Error::Connection(format!("{err:#}"))
}

/// `Transport` over one QUIC connection.
#[derive(Debug)]
pub struct QuicTransport {
    // Keeps the endpoint driver alive for the connection.
    _endpoint: QuicEndpoint,
    connection: Connection,
    max_frame_bytes: usize,
}

impl QuicTransport {
    /// Dial `addr` from `endpoint`, which then serves only this transport.
    pub async fn connect(
        endpoint: QuicEndpoint,
        addr: SocketAddr,
        server_name: &str,
    ) -> anyhow::Result<Self> {
        let connection = endpoint.connect(addr, server_name).await?;
        tracing::debug!(
            conn = connection.stable_id(),
            peer = %connection.remote_address(),
            "quic transport connected"
        );
        let max_frame_bytes = endpoint.config().max_frame_bytes;
        Ok(Self {
            _endpoint: endpoint,
            connection,
            max_frame_bytes,
        })
    }

    async fn call(&self, path: &str, body: Bytes) -> anyhow::Result<Envelope> {
        let (mut send, mut recv) = self.connection.open_bi().await.context("open call stream")?;
        let request = Envelope::Call {
            path: path.to_string(),
            body,
        };
        write_envelope(&mut send, &request, self.max_frame_bytes).await?;
        send.finish().context("finish call stream")?;
        let mut scratch = BytesMut::new();
        read_envelope(&mut recv, &mut scratch, self.max_frame_bytes)
            .await?
            .context("stream closed before reply")
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn send(&self, path: &str, body: Bytes) -> Result<Bytes> {
        match self.call(path, body).await.map_err(connection_error)? {
            Envelope::Reply { body } => Ok(body),
            Envelope::Status { error } => Err(error),
            other => Err(Error::Internal(format!(
                "unexpected {} envelope in reply to {path}",
                other.kind()
            ))),
        }
    }

    async fn open_stream(&self, path: &str, initial: Bytes) -> Result<BidiStream> {
        let (mut send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|err| Error::Connection(format!("open stream: {err}")))?;
        let open = Envelope::OpenStream {
            path: path.to_string(),
            body: initial,
        };
        write_envelope(&mut send, &open, self.max_frame_bytes)
            .await
            .map_err(connection_error)?;
        // Open failures on the server side arrive as a `status` on the first read.
        Ok(BidiStream::new(
            QuicFrameSink {
                send,
                max_frame_bytes: self.max_frame_bytes,
            },
            QuicFrameSource {
                recv,
                scratch: BytesMut::new(),
                max_frame_bytes: self.max_frame_bytes,
                done: false,
            },
        ))
    }
}

struct QuicFrameSink {
    send: SendStream,
    max_frame_bytes: usize,
}

#[async_trait]
impl FrameSink for QuicFrameSink {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        write_envelope(
            &mut self.send,
            &Envelope::Chunk { body: frame },
            self.max_frame_bytes,
        )
        .await
        .map_err(connection_error)
    }

    async fn close(&mut self) -> Result<()> {
        // Finishing twice is harmless.
        let _ = self.send.finish();
        Ok(())
    }
}

struct QuicFrameSource {
    recv: RecvStream,
    scratch: BytesMut,
    max_frame_bytes: usize,
    done: bool,
}

#[async_trait]
impl FrameSource for QuicFrameSource {
    async fn recv(&mut self) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let message = read_envelope(&mut self.recv, &mut self.scratch, self.max_frame_bytes)
            .await
            .map_err(|err| {
                self.done = true;
                connection_error(err)
            })?;
        match message {
            Some(Envelope::Chunk { body }) => Ok(Some(body)),
            Some(Envelope::Status { error }) => {
                self.done = true;
                Err(error)
            }
            Some(other) => {
                self.done = true;
                Err(Error::Internal(format!(
                    "unexpected {} envelope on stream",
                    other.kind()
                )))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }
}

/// Serve `handler` to every connection accepted by `server`. Returns once the
/// endpoint is closed.
pub async fn serve(server: Arc<QuicEndpoint>, handler: Arc<dyn Transport>) {
    let max_frame_bytes = server.config().max_frame_bytes;
    while let Some(connection) = server.accept().await {
        let handler = Arc::clone(&handler);
        tokio::spawn(handle_connection(handler, connection, max_frame_bytes));
    }
    tracing::debug!("quic endpoint closed; serve loop exiting");
}

async fn handle_connection(
    handler: Arc<dyn Transport>,
    connection: Connection,
    max_frame_bytes: usize,
) {
    let conn = connection.stable_id();
    tracing::debug!(conn, peer = %connection.remote_address(), "quic connection accepted");
    loop {
        let (send, recv) = match connection.accept_bi().await {
            Ok(streams) => streams,
            Err(err) => {
                tracing::debug!(conn, error = %err, "quic connection closed");
                return;
            }
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(err) = handle_stream(handler, send, recv, max_frame_bytes).await {
                tracing::warn!(conn, error = %err, "quic stream handler failed");
            }
        });
    }
}

async fn handle_stream(
    handler: Arc<dyn Transport>,
    mut send: SendStream,
    mut recv: RecvStream,
    max_frame_bytes: usize,
) -> anyhow::Result<()> {
    let mut scratch = BytesMut::new();
    let Some(first) = read_envelope(&mut recv, &mut scratch, max_frame_bytes).await? else {
        return Ok(());
    };
    match first {
        Envelope::Call { path, body } => {
            let reply = match handler.send(&path, body).await {
                Ok(body) => Envelope::Reply { body },
                Err(error) => {
                    tracing::debug!(%path, error = %error, "call failed");
                    Envelope::Status { error }
                }
            };
            write_envelope(&mut send, &reply, max_frame_bytes).await?;
            send.finish().context("finish reply")?;
        }
        Envelope::OpenStream { path, body } => match handler.open_stream(&path, body).await {
            Ok(stream) => pump_stream(stream, send, recv, max_frame_bytes).await?,
            Err(error) => {
                tracing::debug!(%path, error = %error, "stream open failed");
                write_envelope(&mut send, &Envelope::Status { error }, max_frame_bytes)
                    .await?;
                send.finish().context("finish rejected stream")?;
            }
        },
        other => bail!("unexpected {} envelope opening a stream", other.kind()),
    }
    Ok(())
}

async fn pump_stream(
    stream: BidiStream,
    mut send: SendStream,
    mut recv: RecvStream,
    max_frame_bytes: usize,
) -> anyhow::Result<()> {
    let BidiStream {
        mut sink,
        mut source,
    } = stream;

    // Client -> handler. Ends with a half-close once the client finishes.
    let inbound = tokio::spawn(async move {
        let mut scratch = BytesMut::new();
        loop {
            match read_envelope(&mut recv, &mut scratch, max_frame_bytes).await {
                Ok(Some(Envelope::Chunk { body })) => {
                    if sink.send(body).await.is_err() {
                        break;
                    }
                }
                Ok(Some(other)) => {
                    tracing::debug!(kind = %other.kind(), "ignoring envelope on open stream");
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::debug!(error = %err, "stream inbound read ended");
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    // Handler -> client.
    let outbound = async {
        loop {
            match source.recv().await {
                Ok(Some(body)) => {
                    write_envelope(&mut send, &Envelope::Chunk { body }, max_frame_bytes)
                        .await?;
                }
                Ok(None) => break,
                Err(error) => {
                    write_envelope(&mut send, &Envelope::Status { error }, max_frame_bytes)
                        .await?;
                    break;
                }
            }
        }
        anyhow::Ok(())
    }
    .await;

    let _ = send.finish();
    inbound.abort();
    outbound
}
