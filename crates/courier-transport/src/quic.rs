// QUIC endpoints for courier connections. One endpoint type covers both roles:
// the emulator listens with `server`, clients dial out with `client`.
use anyhow::{Context, Result};
use quinn::{ClientConfig, Connection, Endpoint, ServerConfig, VarInt};
use std::net::SocketAddr;
use std::sync::Arc;

/// Limits applied to every courier connection.
///
/// ```
/// use courier_transport::TransportConfig;
///
/// let config = TransportConfig::default();
/// assert_eq!(config.max_frame_bytes, courier_wire::DEFAULT_MAX_FRAME_BYTES);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Largest envelope payload accepted or sent.
    pub max_frame_bytes: usize,
    /// Concurrent calls (unary or streaming) per connection.
    pub max_streams: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: courier_wire::DEFAULT_MAX_FRAME_BYTES,
            max_streams: 1024,
        }
    }
}

impl TransportConfig {
    fn to_quinn(&self) -> Arc<quinn::TransportConfig> {
        let mut config = quinn::TransportConfig::default();
        // A call is exactly one bidi stream.
        config.max_concurrent_bidi_streams(VarInt::from(self.max_streams));
        config.max_concurrent_uni_streams(VarInt::from(0u8));
        Arc::new(config)
    }
}

#[derive(Debug)]
pub struct QuicEndpoint {
    endpoint: Endpoint,
    config: TransportConfig,
}

impl QuicEndpoint {
    /// Listen on `addr` for incoming calls.
    pub fn server(addr: SocketAddr, mut tls: ServerConfig, config: TransportConfig) -> Result<Self> {
        tls.transport_config(config.to_quinn());
        let endpoint = Endpoint::server(tls, addr)
            .with_context(|| format!("bind QUIC listener on {addr}"))?;
        Ok(Self { endpoint, config })
    }

    /// Bind a local port for outgoing connections.
    pub fn client(addr: SocketAddr, mut tls: ClientConfig, config: TransportConfig) -> Result<Self> {
        tls.transport_config(config.to_quinn());
        let mut endpoint = Endpoint::client(addr)
            .with_context(|| format!("bind QUIC client on {addr}"))?;
        endpoint.set_default_client_config(tls);
        Ok(Self { endpoint, config })
    }

    /// Next established connection. Failed handshakes are skipped; `None` once
    /// the endpoint is closed.
    pub async fn accept(&self) -> Option<Connection> {
        while let Some(incoming) = self.endpoint.accept().await {
            let remote = incoming.remote_address();
            match incoming.await {
                Ok(connection) => return Some(connection),
                Err(err) => tracing::debug!(%remote, error = %err, "quic handshake failed"),
            }
        }
        None
    }

    pub async fn connect(&self, addr: SocketAddr, server_name: &str) -> Result<Connection> {
        self.endpoint
            .connect(addr, server_name)
            .context("initiate QUIC connection")?
            .await
            .with_context(|| format!("connect to {server_name} at {addr}"))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("read QUIC local address")
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Stop accepting and close every connection; pending `accept`s return `None`.
    pub fn close(&self) {
        self.endpoint.close(VarInt::from(0u8), b"shutdown");
    }
}
