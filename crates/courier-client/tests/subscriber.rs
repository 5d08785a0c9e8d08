mod common;

use common::{SUBSCRIPTION, TOPIC, emulator, eventually, fast_config};
use courier_client::{Client, ClientConfig, LimitExceededBehavior, ReceivedMessage, SubscriberState};
use courier_common::{Error, Message, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn next_message(subscriber: &courier_client::Subscriber) -> ReceivedMessage {
    timeout(Duration::from_secs(2), subscriber.next())
        .await
        .expect("message within two seconds")
        .expect("stream healthy")
        .expect("stream open")
}

async fn publish_all(client: &Client, payloads: &[&'static str]) -> Result<()> {
    let messages = payloads.iter().map(|payload| Message::new(*payload)).collect();
    for result in client.publish_batch(TOPIC, messages).await {
        result?;
    }
    Ok(())
}

#[tokio::test]
async fn receives_and_acks_published_messages() -> Result<()> {
    let emulator = emulator();
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    publish_all(&client, &["a", "b", "c"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let mut payloads = Vec::new();
    for _ in 0..3 {
        let message = next_message(&subscriber).await;
        assert_eq!(message.delivery_attempt, 1);
        payloads.push(String::from_utf8_lossy(&message.data).into_owned());
        subscriber.ack(&message.lease_id);
    }
    assert_eq!(payloads, vec!["a", "b", "c"]);
    assert_eq!(subscriber.state(), SubscriberState::Streaming);
    eventually("acks reach the broker", || {
        emulator.acked_message_ids(SUBSCRIPTION).len() == 3
    })
    .await;
    assert_eq!(subscriber.outstanding(), (0, 0));

    subscriber.close().await;
    client.shutdown().await
}

#[tokio::test]
async fn outstanding_limit_holds_back_the_next_message_until_ack() -> Result<()> {
    let emulator = emulator();
    let mut config = fast_config();
    config.subscriber.flow_control.max_outstanding_messages = 1;
    let client = Client::new(Arc::new(emulator.clone()), config);
    publish_all(&client, &["first", "second"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let first = next_message(&subscriber).await;
    assert_eq!(&first.data[..], b"first");
    assert!(
        timeout(Duration::from_millis(100), subscriber.next()).await.is_err(),
        "second message delivered past the outstanding limit"
    );
    assert_eq!(subscriber.outstanding().0, 1);

    subscriber.ack(&first.lease_id);
    let second = next_message(&subscriber).await;
    assert_eq!(&second.data[..], b"second");
    subscriber.close().await;
    client.shutdown().await
}

#[tokio::test]
async fn repeated_and_unknown_acks_are_ignored() -> Result<()> {
    let emulator = emulator();
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    publish_all(&client, &["a", "b"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let first = next_message(&subscriber).await;
    let second = next_message(&subscriber).await;
    assert_eq!(subscriber.outstanding().0, 2);

    subscriber.ack(&first.lease_id);
    subscriber.ack(&first.lease_id);
    subscriber.nack(&first.lease_id);
    subscriber.ack(&courier_common::LeaseId::new("no-such-lease"));
    assert_eq!(subscriber.outstanding().0, 1, "double settle released twice");

    subscriber.ack(&second.lease_id);
    assert_eq!(subscriber.outstanding(), (0, 0));
    eventually("both acks recorded", || {
        emulator.acked_message_ids(SUBSCRIPTION).len() == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(emulator.acked_message_ids(SUBSCRIPTION).len(), 2);
    subscriber.close().await;
    client.shutdown().await
}

#[tokio::test]
async fn nack_leads_to_redelivery() -> Result<()> {
    let emulator = emulator();
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    publish_all(&client, &["retry-me"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let first = next_message(&subscriber).await;
    subscriber.nack(&first.lease_id);
    let again = next_message(&subscriber).await;
    assert_eq!(again.message_id, first.message_id);
    assert_eq!(again.delivery_attempt, 2);
    subscriber.ack(&again.lease_id);
    subscriber.close().await;
    client.shutdown().await
}

#[tokio::test]
async fn reconnects_after_the_broker_drops_the_stream() -> Result<()> {
    let emulator = emulator();
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    publish_all(&client, &["before"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let before = next_message(&subscriber).await;

    emulator.disconnect_streams();
    eventually("stream reopened", || emulator.stream_open_count() >= 2).await;

    publish_all(&client, &["after"]).await?;
    let after = next_message(&subscriber).await;
    assert_eq!(&after.data[..], b"after");
    assert_eq!(subscriber.state(), SubscriberState::Streaming);

    // Leases from the dropped stream can still be settled on the new one.
    subscriber.ack(&before.lease_id);
    subscriber.ack(&after.lease_id);
    eventually("acks on the new stream", || {
        emulator.acked_message_ids(SUBSCRIPTION).len() == 2
    })
    .await;
    subscriber.close().await;
    client.shutdown().await
}

#[tokio::test]
async fn unknown_subscription_is_a_terminal_error() {
    let emulator = emulator();
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let subscriber = client.subscribe("missing");

    let err = timeout(Duration::from_secs(2), subscriber.next())
        .await
        .expect("terminal error reported")
        .expect_err("not found");
    assert!(matches!(err, Error::NotFound(_)));
    assert_eq!(subscriber.next().await, Ok(None));
    assert_eq!(subscriber.state(), SubscriberState::Closed);
    assert_eq!(emulator.stream_open_count(), 1, "non-retryable error was retried");
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let emulator = emulator();
    emulator.fail_next_stream_opens(10, Error::Connection("refused".into()));
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let subscriber = client.subscribe(SUBSCRIPTION);

    let err = timeout(Duration::from_secs(2), subscriber.next())
        .await
        .expect("terminal error reported")
        .expect_err("retries exhausted");
    assert_eq!(err, Error::Connection("refused".into()));
    assert_eq!(emulator.stream_open_count(), 4);
    assert_eq!(subscriber.next().await, Ok(None));
}

#[tokio::test]
async fn leases_are_extended_while_held() -> Result<()> {
    let emulator = emulator();
    let mut config = fast_config();
    config.subscriber.ack_deadline = Duration::from_millis(100);
    let client = Client::new(Arc::new(emulator.clone()), config);
    publish_all(&client, &["slow-work"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let message = next_message(&subscriber).await;
    tokio::time::sleep(Duration::from_millis(350)).await;

    let modifications = emulator.deadline_modifications(SUBSCRIPTION);
    assert!(
        modifications
            .iter()
            .any(|m| m.ack_id == message.lease_id.as_str() && m.deadline_ms == 100),
        "no extension recorded: {modifications:?}"
    );
    assert!(
        timeout(Duration::from_millis(50), subscriber.next()).await.is_err(),
        "extended message was redelivered"
    );
    subscriber.ack(&message.lease_id);
    subscriber.close().await;
    client.shutdown().await
}

#[tokio::test]
async fn messages_held_back_by_flow_control_keep_their_leases() -> Result<()> {
    let emulator = emulator();
    let mut config = fast_config();
    config.subscriber.ack_deadline = Duration::from_millis(200);
    config.subscriber.flow_control.max_outstanding_messages = 1;
    let client = Client::new(Arc::new(emulator.clone()), config);
    publish_all(&client, &["first", "second"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let first = next_message(&subscriber).await;
    assert_eq!(&first.data[..], b"first");
    // Hold "first" well past the broker lease on the waiting "second".
    tokio::time::sleep(Duration::from_millis(600)).await;
    subscriber.ack(&first.lease_id);

    let second = next_message(&subscriber).await;
    assert_eq!(&second.data[..], b"second");
    assert_eq!(second.delivery_attempt, 1);
    subscriber.ack(&second.lease_id);
    assert!(
        timeout(Duration::from_millis(300), subscriber.next()).await.is_err(),
        "held-back message was redelivered"
    );
    eventually("both acks recorded", || {
        emulator.acked_message_ids(SUBSCRIPTION).len() == 2
    })
    .await;
    subscriber.close().await;
    client.shutdown().await
}

#[tokio::test]
async fn terminal_failure_releases_outstanding_leases() -> Result<()> {
    let emulator = emulator();
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    publish_all(&client, &["delivered"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let delivered = next_message(&subscriber).await;
    assert_eq!(subscriber.outstanding().0, 1);

    emulator.fail_next_stream_opens(10, Error::Connection("refused".into()));
    emulator.disconnect_streams();
    let err = timeout(Duration::from_secs(2), subscriber.next())
        .await
        .expect("terminal error reported")
        .expect_err("retries exhausted");
    assert_eq!(err, Error::Connection("refused".into()));
    assert_eq!(subscriber.state(), SubscriberState::Closed);
    assert_eq!(subscriber.outstanding(), (0, 0));

    subscriber.ack(&delivered.lease_id);
    assert_eq!(subscriber.outstanding(), (0, 0));
    client.shutdown().await
}

#[tokio::test]
async fn extension_stops_at_max_ack_extension() -> Result<()> {
    let emulator = emulator();
    let mut config = fast_config();
    config.subscriber.ack_deadline = Duration::from_millis(100);
    config.subscriber.max_ack_extension = Duration::from_millis(200);
    let client = Client::new(Arc::new(emulator.clone()), config);
    publish_all(&client, &["forgotten"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let first = next_message(&subscriber).await;
    let again = next_message(&subscriber).await;
    assert_eq!(again.message_id, first.message_id);
    assert!(again.delivery_attempt >= 2);

    // The expired lease no longer counts, and settling it is a no-op.
    assert_eq!(subscriber.outstanding().0, 1);
    subscriber.ack(&first.lease_id);
    assert_eq!(subscriber.outstanding().0, 1);
    subscriber.ack(&again.lease_id);
    assert_eq!(subscriber.outstanding(), (0, 0));
    subscriber.close().await;
    client.shutdown().await
}

#[tokio::test]
async fn close_ends_pending_next_and_returns_leases() -> Result<()> {
    let emulator = emulator();
    let client = Arc::new(Client::new(Arc::new(emulator.clone()), fast_config()));
    publish_all(&client, &["held"]).await?;

    let subscriber = Arc::new(client.subscribe(SUBSCRIPTION));
    let held = next_message(&subscriber).await;
    let waiter = {
        let subscriber = Arc::clone(&subscriber);
        tokio::spawn(async move { subscriber.next().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    subscriber.close().await;
    assert_eq!(waiter.await.expect("join"), Ok(None));
    assert_eq!(subscriber.next().await, Ok(None));
    assert_eq!(subscriber.state(), SubscriberState::Closed);
    assert_eq!(subscriber.outstanding(), (0, 0));
    // Settling after close is harmless.
    subscriber.ack(&held.lease_id);

    let replacement = client.subscribe(SUBSCRIPTION);
    let redelivered = next_message(&replacement).await;
    assert_eq!(redelivered.message_id, held.message_id);
    assert_eq!(redelivered.delivery_attempt, 2);
    replacement.ack(&redelivered.lease_id);
    replacement.close().await;
    client.shutdown().await
}

#[tokio::test]
async fn reject_behavior_nacks_over_limit_messages() -> Result<()> {
    let emulator = emulator();
    let mut config: ClientConfig = fast_config();
    config.subscriber.flow_control.max_outstanding_messages = 1;
    config.subscriber.flow_control.limit_exceeded_behavior = LimitExceededBehavior::Reject;
    let client = Client::new(Arc::new(emulator.clone()), config);
    publish_all(&client, &["one", "two"]).await?;

    let subscriber = client.subscribe(SUBSCRIPTION);
    let first = next_message(&subscriber).await;
    assert_eq!(&first.data[..], b"one");
    subscriber.ack(&first.lease_id);

    let second = next_message(&subscriber).await;
    assert_eq!(&second.data[..], b"two");
    assert!(second.delivery_attempt >= 2, "over-limit message was not handed back");
    subscriber.ack(&second.lease_id);
    subscriber.close().await;
    client.shutdown().await
}
