use anyhow::{Context, Result};
use courier_emulator::{Emulator, EmulatorConfig};
use courier_transport::TransportConfig;
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

// Emulator service configuration sourced from environment variables, optionally
// overridden by a YAML file.
#[derive(Debug, Clone)]
pub struct EmulatorServiceConfig {
    // QUIC listener bind address.
    pub quic_bind: SocketAddr,
    // Metrics and health HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Max frame size accepted on QUIC streams.
    pub max_frame_bytes: usize,
    // Max concurrent bidi streams per connection.
    pub max_streams: u16,
    // Messages above this size get a per-message InvalidArgument outcome.
    pub max_message_bytes: usize,
    // Max messages leased per pull response.
    pub max_messages_per_response: usize,
    // Lease length for streams that do not ask for one.
    pub default_ack_deadline_ms: u64,
    // Outgoing frames buffered per pull session.
    pub stream_channel_depth: usize,
    // Topics and subscriptions created at startup.
    pub topics: Vec<TopicConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TopicConfig {
    pub name: String,
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

const DEFAULT_QUIC_BIND: &str = "127.0.0.1:8085";
const DEFAULT_METRICS_BIND: &str = "127.0.0.1:9095";
const DEFAULT_MAX_STREAMS: u16 = 1024;

#[derive(Debug, Deserialize)]
struct EmulatorServiceConfigOverride {
    quic_bind: Option<String>,
    metrics_bind: Option<String>,
    max_frame_bytes: Option<usize>,
    max_streams: Option<u16>,
    max_message_bytes: Option<usize>,
    max_messages_per_response: Option<usize>,
    default_ack_deadline_ms: Option<u64>,
    stream_channel_depth: Option<usize>,
    topics: Option<Vec<TopicConfig>>,
}

impl EmulatorServiceConfig {
    pub fn from_env() -> Result<Self> {
        let emulator = EmulatorConfig::default();
        let transport = TransportConfig::default();
        let quic_bind = std::env::var("COURIER_EMULATOR_QUIC_BIND")
            .unwrap_or_else(|_| DEFAULT_QUIC_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_EMULATOR_QUIC_BIND")?;
        let metrics_bind = std::env::var("COURIER_EMULATOR_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse COURIER_EMULATOR_METRICS_BIND")?;
        let max_frame_bytes =
            read_usize_env("COURIER_MAX_FRAME_BYTES").unwrap_or(transport.max_frame_bytes);
        let max_streams = std::env::var("COURIER_EMULATOR_MAX_STREAMS")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_STREAMS);
        let max_message_bytes = read_usize_env("COURIER_EMULATOR_MAX_MESSAGE_BYTES")
            .unwrap_or(emulator.max_message_bytes);
        let max_messages_per_response =
            read_usize_env("COURIER_EMULATOR_MAX_MESSAGES_PER_RESPONSE")
                .unwrap_or(emulator.max_messages_per_response);
        let default_ack_deadline_ms = read_u64_env("COURIER_EMULATOR_ACK_DEADLINE_MS")
            .unwrap_or(emulator.default_ack_deadline.as_millis() as u64);
        let stream_channel_depth = read_usize_env("COURIER_EMULATOR_STREAM_DEPTH")
            .unwrap_or(emulator.stream_channel_depth);
        Ok(Self {
            quic_bind,
            metrics_bind,
            max_frame_bytes,
            max_streams,
            max_message_bytes,
            max_messages_per_response,
            default_ack_deadline_ms,
            stream_channel_depth,
            topics: Vec::new(),
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("COURIER_EMULATOR_CONFIG") {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read COURIER_EMULATOR_CONFIG: {path}"))?;
            let override_cfg: EmulatorServiceConfigOverride = serde_yaml::from_str(&contents)
                .with_context(|| "parse emulator config yaml")?;
            override_cfg.apply(&mut config)?;
        }
        Ok(config)
    }

    pub fn emulator_config(&self) -> EmulatorConfig {
        EmulatorConfig {
            max_message_bytes: self.max_message_bytes,
            max_messages_per_response: self.max_messages_per_response,
            default_ack_deadline: Duration::from_millis(self.default_ack_deadline_ms),
            stream_channel_depth: self.stream_channel_depth,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_frame_bytes: self.max_frame_bytes,
            max_streams: self.max_streams,
        }
    }

    /// Create the configured topics and subscriptions on `emulator`.
    pub fn provision(&self, emulator: &Emulator) -> Result<()> {
        for topic in &self.topics {
            emulator.create_topic(&topic.name);
            for subscription in &topic.subscriptions {
                emulator
                    .create_subscription(subscription, &topic.name)
                    .with_context(|| format!("create subscription {subscription}"))?;
            }
            tracing::info!(
                topic = %topic.name,
                subscriptions = topic.subscriptions.len(),
                "provisioned topic"
            );
        }
        Ok(())
    }
}

impl EmulatorServiceConfigOverride {
    fn apply(self, config: &mut EmulatorServiceConfig) -> Result<()> {
        if let Some(value) = self.quic_bind {
            config.quic_bind = value.parse().with_context(|| "parse quic_bind")?;
        }
        if let Some(value) = self.metrics_bind {
            config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
        }
        if let Some(value) = self.max_frame_bytes
            && value > 0
        {
            config.max_frame_bytes = value;
        }
        if let Some(value) = self.max_streams
            && value > 0
        {
            config.max_streams = value;
        }
        if let Some(value) = self.max_message_bytes
            && value > 0
        {
            config.max_message_bytes = value;
        }
        if let Some(value) = self.max_messages_per_response
            && value > 0
        {
            config.max_messages_per_response = value;
        }
        if let Some(value) = self.default_ack_deadline_ms
            && value > 0
        {
            config.default_ack_deadline_ms = value;
        }
        if let Some(value) = self.stream_channel_depth
            && value > 0
        {
            config.stream_channel_depth = value;
        }
        if let Some(topics) = self.topics {
            config.topics = topics;
        }
        Ok(())
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
