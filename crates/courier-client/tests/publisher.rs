mod common;

use common::{TOPIC, emulator, emulator_with, fast_config};
use courier_client::{Client, PausedKeyPolicy};
use courier_common::{Error, Message, MessageId, Result};
use courier_emulator::EmulatorConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn request_payloads(emulator: &courier_emulator::Emulator) -> Vec<Vec<String>> {
    emulator
        .publish_requests()
        .iter()
        .map(|request| {
            request
                .messages
                .iter()
                .map(|message| String::from_utf8_lossy(&message.data).into_owned())
                .collect()
        })
        .collect()
}

#[tokio::test]
async fn count_threshold_splits_three_messages_into_two_calls() -> Result<()> {
    let emulator = emulator();
    let mut config = fast_config();
    config.publisher.max_messages = 2;
    let client = Client::new(Arc::new(emulator.clone()), config);

    let results = client
        .publish_batch(
            TOPIC,
            vec![Message::new("a"), Message::new("b"), Message::new("c")],
        )
        .await;
    let ids: Vec<MessageId> = results.into_iter().collect::<Result<_>>()?;
    assert_eq!(ids.len(), 3);
    assert_eq!(emulator.publish_call_count(), 2);
    assert_eq!(
        request_payloads(&emulator),
        vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
    );
    client.shutdown().await
}

#[tokio::test]
async fn flush_sends_below_thresholds() -> Result<()> {
    let emulator = emulator();
    let mut config = fast_config();
    config.publisher.max_latency = Duration::from_secs(30);
    let client = Client::new(Arc::new(emulator.clone()), config);

    let handle = client.publisher().submit(TOPIC, Message::new("lonely"))?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(emulator.publish_call_count(), 0, "latency timer fired early");
    client.flush().await?;
    assert_eq!(emulator.publish_call_count(), 1);
    assert_eq!(handle.await?, MessageId::new("1"));
    client.shutdown().await
}

#[tokio::test]
async fn latency_timer_flushes_without_explicit_flush() -> Result<()> {
    let emulator = emulator();
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let id = timeout(
        Duration::from_secs(1),
        client.publish(TOPIC, Message::new("x")),
    )
    .await
    .map_err(|_| Error::Timeout("latency flush".into()))??;
    assert_eq!(id, MessageId::new("1"));
    client.shutdown().await
}

#[tokio::test]
async fn transient_failures_are_retried() -> Result<()> {
    let emulator = emulator();
    emulator.fail_next_publishes(2, Error::Connection("reset".into()));
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let id = client.publish(TOPIC, Message::new("x")).await?;
    assert_eq!(id, MessageId::new("1"));
    assert_eq!(emulator.publish_call_count(), 3);
    client.shutdown().await
}

#[tokio::test]
async fn retry_hint_is_honoured() -> Result<()> {
    let emulator = emulator();
    emulator.fail_next_publishes(
        1,
        Error::ResourceExhausted {
            message: "slow down".into(),
            retry_after_ms: Some(60),
        },
    );
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let started = std::time::Instant::now();
    client.publish(TOPIC, Message::new("x")).await?;
    assert!(started.elapsed() >= Duration::from_millis(60));
    client.shutdown().await
}

#[tokio::test]
async fn exhausted_retries_fail_every_ticket_of_the_batch() -> Result<()> {
    let emulator = emulator();
    emulator.fail_next_publishes(10, Error::Timeout("publish".into()));
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let results = client
        .publish_batch(TOPIC, vec![Message::new("a"), Message::new("b")])
        .await;
    for result in results {
        let err = result.expect_err("batch failed");
        assert_eq!(
            err,
            Error::batch_failed(2, Error::Timeout("publish".into()))
        );
    }
    assert_eq!(emulator.publish_call_count(), 4);
    client.shutdown().await
}

#[tokio::test]
async fn non_retryable_failure_is_not_retried() -> Result<()> {
    let emulator = emulator();
    emulator.fail_next_publishes(1, Error::InvalidArgument("bad topic".into()));
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let err = client
        .publish(TOPIC, Message::new("x"))
        .await
        .expect_err("rejected");
    assert!(matches!(
        &err,
        Error::BatchFailed { batch_size: 1, source } if matches!(**source, Error::InvalidArgument(_))
    ));
    assert_eq!(emulator.publish_call_count(), 1);
    client.shutdown().await
}

#[tokio::test]
async fn per_message_rejection_leaves_the_rest_published() -> Result<()> {
    let emulator = emulator_with(EmulatorConfig {
        max_message_bytes: 4,
        ..EmulatorConfig::default()
    });
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let results = client
        .publish_batch(TOPIC, vec![Message::new("ok"), Message::new("way too big")])
        .await;
    assert_eq!(results[0], Ok(MessageId::new("1")));
    assert!(matches!(results[1], Err(Error::MessageRejected { .. })));
    client.shutdown().await
}

#[tokio::test]
async fn invalid_messages_fail_synchronously() -> Result<()> {
    let emulator = emulator();
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let err = client
        .publisher()
        .submit(TOPIC, Message::default())
        .expect_err("empty message");
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(emulator.publish_call_count(), 0);
    client.shutdown().await
}

#[tokio::test]
async fn keyed_messages_keep_submission_order_across_batches() -> Result<()> {
    let emulator = emulator();
    emulator.set_publish_delay(Some(Duration::from_millis(2)));
    let mut config = fast_config();
    config.publisher.max_messages = 1;
    let client = Client::new(Arc::new(emulator.clone()), config);

    let messages = (0..10)
        .map(|i| Message::new(format!("m{i}")).with_ordering_key("user-1"))
        .collect();
    let ids: Vec<u64> = client
        .publish_batch(TOPIC, messages)
        .await
        .into_iter()
        .map(|result| result.map(|id| id.as_str().parse::<u64>().expect("numeric id")))
        .collect::<Result<_>>()?;
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]), "ids {ids:?}");
    let sent: Vec<String> = request_payloads(&emulator).into_iter().flatten().collect();
    let expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    assert_eq!(sent, expected);
    client.shutdown().await
}

#[tokio::test]
async fn failed_key_pauses_and_resume_delivers_queue_in_order_once() -> Result<()> {
    let emulator = emulator();
    emulator.fail_next_publishes(1, Error::InvalidArgument("boom".into()));
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let publisher = client.publisher();

    let err = client
        .publish(TOPIC, Message::new("first").with_ordering_key("K"))
        .await
        .expect_err("injected failure");
    assert!(matches!(err, Error::BatchFailed { .. }));
    assert_eq!(publisher.paused_keys().len(), 1);

    let handles: Vec<_> = (0..5)
        .map(|i| publisher.submit(TOPIC, Message::new(format!("q{i}")).with_ordering_key("K")))
        .collect::<Result<_>>()?;
    // Unkeyed traffic is unaffected by the pause.
    client.publish(TOPIC, Message::new("free")).await?;
    client.flush().await?;
    assert_eq!(
        request_payloads(&emulator),
        vec![vec!["free".to_string()]],
        "paused key leaked"
    );

    publisher.resume_ordering(TOPIC, "K");
    let ids: Vec<u64> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|result| result.map(|id| id.as_str().parse::<u64>().expect("numeric id")))
        .collect::<Result<_>>()?;
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
    let sent: Vec<String> = request_payloads(&emulator).into_iter().flatten().collect();
    assert_eq!(sent, vec!["free", "q0", "q1", "q2", "q3", "q4"]);
    assert!(publisher.paused_keys().is_empty());
    client.shutdown().await
}

#[tokio::test]
async fn batches_queued_behind_a_failed_keyed_batch_wait_for_resume() -> Result<()> {
    let emulator = emulator();
    emulator.set_publish_delay(Some(Duration::from_millis(50)));
    emulator.fail_next_publishes(1, Error::InvalidArgument("boom".into()));
    let mut config = fast_config();
    config.publisher.max_messages = 1;
    let client = Client::new(Arc::new(emulator.clone()), config);
    let publisher = client.publisher();

    // k0 goes out first; k1..k3 are sealed behind it while it is in flight.
    let mut handles = (0..4)
        .map(|i| publisher.submit(TOPIC, Message::new(format!("k{i}")).with_ordering_key("K")))
        .collect::<Result<Vec<_>>>()?;
    let waiting = handles.split_off(1);
    let failed = handles.remove(0).await.expect_err("injected failure");
    assert_eq!(
        failed,
        Error::batch_failed(1, Error::InvalidArgument("boom".into()))
    );

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    for (index, handle) in waiting.into_iter().enumerate() {
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let _ = done_tx.send((index, handle.await));
        });
    }
    drop(done_tx);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(done_rx.try_recv().is_err(), "queued message resolved while paused");
    assert_eq!(emulator.publish_call_count(), 1);
    assert_eq!(publisher.paused_keys().len(), 1);

    emulator.set_publish_delay(None);
    publisher.resume_ordering(TOPIC, "K");
    let mut resolved = Vec::new();
    while let Some((index, result)) = timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("queued messages resolve after resume")
    {
        let id = result?.as_str().parse::<u64>().expect("numeric id");
        resolved.push((index, id));
    }
    let order: Vec<usize> = resolved.iter().map(|(index, _)| *index).collect();
    assert_eq!(order, vec![0, 1, 2]);
    assert!(resolved.windows(2).all(|pair| pair[0].1 < pair[1].1), "ids {resolved:?}");
    let sent: Vec<String> = request_payloads(&emulator).into_iter().flatten().collect();
    assert_eq!(sent, vec!["k1", "k2", "k3"]);
    assert!(publisher.paused_keys().is_empty());
    client.shutdown().await
}

#[tokio::test]
async fn reject_policy_fails_submissions_on_paused_key() -> Result<()> {
    let emulator = emulator();
    emulator.fail_next_publishes(1, Error::NotFound("topic".into()));
    let mut config = fast_config();
    config.publisher.paused_key_policy = PausedKeyPolicy::Reject;
    let client = Client::new(Arc::new(emulator.clone()), config);

    let _ = client
        .publish(TOPIC, Message::new("a").with_ordering_key("K"))
        .await;
    let err = client
        .publisher()
        .submit(TOPIC, Message::new("b").with_ordering_key("K"))
        .expect_err("paused");
    assert_eq!(
        err,
        Error::OrderingPaused {
            ordering_key: "K".into()
        }
    );
    client.publisher().resume_ordering(TOPIC, "K");
    client
        .publish(TOPIC, Message::new("c").with_ordering_key("K"))
        .await?;
    client.shutdown().await
}

#[tokio::test]
async fn shutdown_resolves_paused_queue_and_refuses_new_work() -> Result<()> {
    let emulator = emulator();
    emulator.fail_next_publishes(1, Error::Internal("boom".into()));
    let client = Client::new(Arc::new(emulator.clone()), fast_config());
    let _ = client
        .publish(TOPIC, Message::new("a").with_ordering_key("K"))
        .await;
    let queued = client
        .publisher()
        .submit(TOPIC, Message::new("b").with_ordering_key("K"))?;
    let pending = client.publisher().submit(TOPIC, Message::new("c"))?;

    client.shutdown().await?;
    assert_eq!(
        queued.await,
        Err(Error::OrderingPaused {
            ordering_key: "K".into()
        })
    );
    assert!(pending.await.is_ok(), "unkeyed message flushed on shutdown");
    let err = client
        .publisher()
        .submit(TOPIC, Message::new("late"))
        .expect_err("closed");
    assert_eq!(err, Error::Closed);
    // Idempotent.
    client.shutdown().await
}

#[tokio::test]
async fn shutdown_gives_up_after_close_timeout() -> Result<()> {
    let emulator = emulator();
    emulator.set_publish_delay(Some(Duration::from_secs(5)));
    let mut config = fast_config();
    config.publisher.close_timeout = Duration::from_millis(50);
    let client = Client::new(Arc::new(emulator.clone()), config);
    let handle = client.publisher().submit(TOPIC, Message::new("slow"))?;
    let err = client.shutdown().await.expect_err("timed out");
    assert!(matches!(err, Error::Timeout(_)));
    assert!(handle.await.is_err());
    Ok(())
}
