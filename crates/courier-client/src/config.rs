// Client-side defaults and env/YAML configuration loading.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use courier_common::Error;

pub(crate) const DEFAULT_MAX_MESSAGES: usize = 100;
/// Hard cap on messages per publish call, whatever `max_messages` says.
pub const MAX_BATCH_MESSAGES: usize = 1000;
pub(crate) const DEFAULT_MAX_BYTES: usize = 1024 * 1024;
pub(crate) const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(10);
pub(crate) const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_OUTSTANDING_MESSAGES: u64 = 1000;
pub(crate) const DEFAULT_MAX_OUTSTANDING_BYTES: u64 = 100 * 1024 * 1024;
pub(crate) const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_MAX_ACK_EXTENSION: Duration = Duration::from_secs(60 * 60);
pub(crate) const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
pub(crate) const DEFAULT_RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

/// What happens to further submissions on an ordering key paused by a failed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PausedKeyPolicy {
    /// Hold them until `resume_ordering`.
    #[default]
    Queue,
    /// Fail `submit` with `OrderingPaused`.
    Reject,
}

/// What `FlowController::acquire` does when the ledger is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LimitExceededBehavior {
    #[default]
    Block,
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    pub max_messages: usize,
    pub max_bytes: usize,
    pub max_latency: Duration,
    pub paused_key_policy: PausedKeyPolicy,
    pub close_timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_bytes: DEFAULT_MAX_BYTES,
            max_latency: DEFAULT_MAX_LATENCY,
            paused_key_policy: PausedKeyPolicy::Queue,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl PublisherSettings {
    /// `max_messages` clamped to the per-call cap.
    pub fn batch_limit(&self) -> usize {
        self.max_messages.clamp(1, MAX_BATCH_MESSAGES)
    }

    /// Period of the publisher's latency timer: half the latency, at least 1ms.
    pub fn tick_interval(&self) -> Duration {
        (self.max_latency / 2).max(Duration::from_millis(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlSettings {
    pub max_outstanding_messages: u64,
    pub max_outstanding_bytes: u64,
    pub limit_exceeded_behavior: LimitExceededBehavior,
}

impl Default for FlowControlSettings {
    fn default() -> Self {
        Self {
            max_outstanding_messages: DEFAULT_MAX_OUTSTANDING_MESSAGES,
            max_outstanding_bytes: DEFAULT_MAX_OUTSTANDING_BYTES,
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberSettings {
    /// Ack deadline requested for the stream; also drives the lease-extension period.
    pub ack_deadline: Duration,
    /// Leases older than this stop being extended and are forgotten.
    pub max_ack_extension: Duration,
    pub flow_control: FlowControlSettings,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            ack_deadline: DEFAULT_ACK_DEADLINE,
            max_ack_extension: DEFAULT_MAX_ACK_EXTENSION,
            flow_control: FlowControlSettings::default(),
        }
    }
}

impl SubscriberSettings {
    /// Lease extensions are sent at 4/5 of the ack deadline.
    pub fn extension_interval(&self) -> Duration {
        (self.ack_deadline * 4 / 5).max(Duration::from_millis(1))
    }
}

/// Exponential backoff for transient publish and stream failures.
///
/// ```
/// use courier_client::config::RetrySettings;
/// use std::time::Duration;
///
/// let retry = RetrySettings::default();
/// assert_eq!(retry.backoff(1), Duration::from_millis(100));
/// assert_eq!(retry.backoff(2), Duration::from_millis(200));
/// assert_eq!(retry.backoff(30), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_RETRY_INITIAL_BACKOFF,
            max_backoff: DEFAULT_RETRY_MAX_BACKOFF,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
        }
    }
}

impl RetrySettings {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Backoff for `err`, stretched to the server's retry hint when that is longer.
    pub fn delay_for(&self, attempt: u32, err: &Error) -> Duration {
        let backoff = self.backoff(attempt);
        match err.retry_after() {
            Some(hint) if hint > backoff => hint,
            _ => backoff,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientConfig {
    pub publisher: PublisherSettings,
    pub subscriber: SubscriberSettings,
    pub retry: RetrySettings,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    max_messages: Option<usize>,
    max_bytes: Option<usize>,
    max_latency_ms: Option<u64>,
    paused_key_policy: Option<String>,
    close_timeout_ms: Option<u64>,
    ack_deadline_ms: Option<u64>,
    max_ack_extension_ms: Option<u64>,
    max_outstanding_messages: Option<u64>,
    max_outstanding_bytes: Option<u64>,
    limit_exceeded_behavior: Option<String>,
    retry_max_attempts: Option<u32>,
    retry_initial_backoff_ms: Option<u64>,
    retry_max_backoff_ms: Option<u64>,
    retry_multiplier: Option<f64>,
}

impl ClientConfig {
    /// Defaults, then `COURIER_*` environment variables, then the YAML file at
    /// `config_path` (or `COURIER_CLIENT_CONFIG`) when one is given.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_CLIENT_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => Some(
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?,
            ),
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    fn from_env() -> Self {
        let mut config = Self::default();
        let publisher = &mut config.publisher;
        if let Some(value) = read_usize_env("COURIER_PUB_MAX_MESSAGES") {
            publisher.max_messages = value;
        }
        if let Some(value) = read_usize_env("COURIER_PUB_MAX_BYTES") {
            publisher.max_bytes = value;
        }
        if let Some(value) = read_u64_env("COURIER_PUB_MAX_LATENCY_MS") {
            publisher.max_latency = Duration::from_millis(value);
        }
        if let Some(value) = read_string_env("COURIER_PUB_PAUSED_KEY_POLICY")
            .as_deref()
            .and_then(parse_paused_key_policy)
        {
            publisher.paused_key_policy = value;
        }
        if let Some(value) = read_u64_env("COURIER_PUB_CLOSE_TIMEOUT_MS") {
            publisher.close_timeout = Duration::from_millis(value);
        }

        let subscriber = &mut config.subscriber;
        if let Some(value) = read_u64_env("COURIER_SUB_ACK_DEADLINE_MS") {
            subscriber.ack_deadline = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("COURIER_SUB_MAX_ACK_EXTENSION_MS") {
            subscriber.max_ack_extension = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("COURIER_SUB_MAX_OUTSTANDING_MESSAGES") {
            subscriber.flow_control.max_outstanding_messages = value;
        }
        if let Some(value) = read_u64_env("COURIER_SUB_MAX_OUTSTANDING_BYTES") {
            subscriber.flow_control.max_outstanding_bytes = value;
        }
        if let Some(value) = read_string_env("COURIER_SUB_LIMIT_EXCEEDED_BEHAVIOR")
            .as_deref()
            .and_then(parse_limit_exceeded_behavior)
        {
            subscriber.flow_control.limit_exceeded_behavior = value;
        }

        let retry = &mut config.retry;
        if let Some(value) = read_u64_env("COURIER_RETRY_MAX_ATTEMPTS") {
            retry.max_attempts = value.min(u32::MAX as u64) as u32;
        }
        if let Some(value) = read_u64_env("COURIER_RETRY_INITIAL_BACKOFF_MS") {
            retry.initial_backoff = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("COURIER_RETRY_MAX_BACKOFF_MS") {
            retry.max_backoff = Duration::from_millis(value);
        }
        config
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.max_messages
            && value > 0
        {
            config.publisher.max_messages = value;
        }
        if let Some(value) = self.max_bytes
            && value > 0
        {
            config.publisher.max_bytes = value;
        }
        if let Some(value) = self.max_latency_ms
            && value > 0
        {
            config.publisher.max_latency = Duration::from_millis(value);
        }
        if let Some(value) = &self.paused_key_policy
            && let Some(parsed) = parse_paused_key_policy(value)
        {
            config.publisher.paused_key_policy = parsed;
        }
        if let Some(value) = self.close_timeout_ms
            && value > 0
        {
            config.publisher.close_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.ack_deadline_ms
            && value > 0
        {
            config.subscriber.ack_deadline = Duration::from_millis(value);
        }
        if let Some(value) = self.max_ack_extension_ms
            && value > 0
        {
            config.subscriber.max_ack_extension = Duration::from_millis(value);
        }
        if let Some(value) = self.max_outstanding_messages
            && value > 0
        {
            config.subscriber.flow_control.max_outstanding_messages = value;
        }
        if let Some(value) = self.max_outstanding_bytes
            && value > 0
        {
            config.subscriber.flow_control.max_outstanding_bytes = value;
        }
        if let Some(value) = &self.limit_exceeded_behavior
            && let Some(parsed) = parse_limit_exceeded_behavior(value)
        {
            config.subscriber.flow_control.limit_exceeded_behavior = parsed;
        }
        if let Some(value) = self.retry_max_attempts
            && value > 0
        {
            config.retry.max_attempts = value;
        }
        if let Some(value) = self.retry_initial_backoff_ms
            && value > 0
        {
            config.retry.initial_backoff = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_max_backoff_ms
            && value > 0
        {
            config.retry.max_backoff = Duration::from_millis(value);
        }
        if let Some(value) = self.retry_multiplier
            && value >= 1.0
        {
            config.retry.multiplier = value;
        }
    }
}

fn parse_paused_key_policy(value: &str) -> Option<PausedKeyPolicy> {
    match value.to_ascii_lowercase().as_str() {
        "queue" => Some(PausedKeyPolicy::Queue),
        "reject" => Some(PausedKeyPolicy::Reject),
        _ => None,
    }
}

fn parse_limit_exceeded_behavior(value: &str) -> Option<LimitExceededBehavior> {
    match value.to_ascii_lowercase().as_str() {
        "block" => Some(LimitExceededBehavior::Block),
        "reject" => Some(LimitExceededBehavior::Reject),
        _ => None,
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

fn read_string_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
