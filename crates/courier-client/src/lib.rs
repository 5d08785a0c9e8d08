// Caller-facing client: batching publisher and streaming subscriber over a
// simulation-aware transport.
use courier_common::{Message, MessageId, Result};
use courier_sim::{SimulationLayer, SimulationMode};
use courier_transport::Transport;
use std::sync::Arc;

pub mod config;
pub mod flow_control;
pub mod publisher;
pub mod subscriber;

pub use config::{
    ClientConfig, FlowControlSettings, LimitExceededBehavior, PausedKeyPolicy, PublisherSettings,
    RetrySettings, SubscriberSettings,
};
pub use flow_control::FlowController;
pub use publisher::{PublishHandle, Publisher};
pub use subscriber::{ReceivedMessage, Subscriber, SubscriberState};

/// Publish/subscribe client.
///
/// Every broker call goes through one `SimulationLayer`, so the same client can
/// run live, record, or replay. Must be created inside a tokio runtime.
///
/// ```no_run
/// use courier_client::{Client, ClientConfig};
/// use courier_common::Message;
/// use courier_emulator::Emulator;
/// use std::sync::Arc;
///
/// # async fn demo() -> courier_common::Result<()> {
/// let emulator = Emulator::default();
/// emulator.create_topic("orders");
/// emulator.create_subscription("orders-sub", "orders")?;
/// let client = Client::new(Arc::new(emulator), ClientConfig::default());
/// let id = client.publish("orders", Message::new("hello")).await?;
/// let subscriber = client.subscribe("orders-sub");
/// if let Some(message) = subscriber.next().await? {
///     subscriber.ack(&message.lease_id);
/// }
/// client.shutdown().await?;
/// # let _ = id;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    sim: Arc<SimulationLayer>,
    config: ClientConfig,
    publisher: Publisher,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("mode", &self.sim.mode())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Live client; simulation is disabled.
    pub fn new(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        let sim = Arc::new(SimulationLayer::new(transport, SimulationMode::Disabled));
        Self::with_simulation(sim, config)
    }

    /// Client whose calls go through an existing simulation layer.
    pub fn with_simulation(sim: Arc<SimulationLayer>, config: ClientConfig) -> Self {
        let publisher = Publisher::new(
            Arc::clone(&sim),
            config.publisher.clone(),
            config.retry.clone(),
        );
        tracing::debug!(mode = ?sim.mode(), "client started");
        Self {
            sim,
            config,
            publisher,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn simulation(&self) -> &Arc<SimulationLayer> {
        &self.sim
    }

    /// Publish one message and wait for its id.
    pub async fn publish(&self, topic: &str, message: Message) -> Result<MessageId> {
        self.publisher.submit(topic, message)?.await
    }

    /// Publish several messages; results are in input order.
    pub async fn publish_batch(&self, topic: &str, messages: Vec<Message>) -> Vec<Result<MessageId>> {
        let pending: Vec<_> = messages
            .into_iter()
            .map(|message| self.publisher.submit(topic, message))
            .collect();
        futures::future::join_all(pending.into_iter().map(|submitted| async move {
            match submitted {
                Ok(handle) => handle.await,
                Err(err) => Err(err),
            }
        }))
        .await
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub async fn flush(&self) -> Result<()> {
        self.publisher.flush().await
    }

    /// Start a streaming pull on `subscription`.
    pub fn subscribe(&self, subscription: &str) -> Subscriber {
        Subscriber::new(
            Arc::clone(&self.sim),
            subscription,
            self.config.subscriber.clone(),
            self.config.retry.clone(),
        )
    }

    /// Shut the publisher down and save recordings to the configured path, if any.
    /// Subscribers are closed by their owners.
    pub async fn shutdown(&self) -> Result<()> {
        let flushed = self.publisher.shutdown().await;
        if self.sim.mode() == SimulationMode::Recording {
            self.sim.persist()?;
        }
        flushed
    }
}
