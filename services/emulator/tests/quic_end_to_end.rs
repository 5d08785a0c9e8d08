use anyhow::Result;
use courier_client::{Client, ClientConfig};
use courier_common::{Error, Message};
use courier_emulator::Emulator;
use courier_transport::tls::{client_config_with_root, self_signed_server_config};
use courier_transport::{QuicEndpoint, QuicTransport, TransportConfig, serve};
use emulator_service::config::{EmulatorServiceConfig, TopicConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct Served {
    emulator: Emulator,
    server: Arc<QuicEndpoint>,
    client: Client,
}

async fn serve_emulator() -> Result<Served> {
    let mut config = EmulatorServiceConfig::from_env()?;
    config.topics = vec![TopicConfig {
        name: "orders".into(),
        subscriptions: vec!["orders-sub".into()],
    }];
    let emulator = Emulator::new(config.emulator_config());
    config.provision(&emulator)?;

    let (server_config, cert) = self_signed_server_config(vec!["localhost".into()])?;
    let server = Arc::new(QuicEndpoint::server(
        "127.0.0.1:0".parse()?,
        server_config,
        config.transport_config(),
    )?);
    let addr = server.local_addr()?;
    tokio::spawn(serve(Arc::clone(&server), Arc::new(emulator.clone())));

    let quic = QuicEndpoint::client(
        "0.0.0.0:0".parse()?,
        client_config_with_root(cert)?,
        TransportConfig::default(),
    )?;
    let transport = QuicTransport::connect(quic, addr, "localhost").await?;
    let client = Client::new(Arc::new(transport), ClientConfig::default());
    Ok(Served {
        emulator,
        server,
        client,
    })
}

#[tokio::test]
async fn publish_and_pull_over_quic() -> Result<()> {
    let served = serve_emulator().await?;
    let id = served
        .client
        .publish("orders", Message::new("over-quic").with_attribute("kind", "test"))
        .await?;

    let subscriber = served.client.subscribe("orders-sub");
    let received = timeout(Duration::from_secs(5), subscriber.next())
        .await?
        .map_err(anyhow::Error::from)?
        .ok_or_else(|| anyhow::anyhow!("stream ended"))?;
    assert_eq!(received.message_id, id);
    assert_eq!(&received.data[..], b"over-quic");
    assert_eq!(received.attributes.get("kind").map(String::as_str), Some("test"));
    subscriber.ack(&received.lease_id);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while served.emulator.acked_message_ids("orders-sub") != vec![id.clone()] {
        assert!(tokio::time::Instant::now() < deadline, "ack never arrived");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    subscriber.close().await;
    served.client.shutdown().await?;
    served.server.close();
    Ok(())
}

#[tokio::test]
async fn broker_errors_cross_the_wire_intact() -> Result<()> {
    let served = serve_emulator().await?;
    served
        .emulator
        .fail_next_publishes(1, Error::InvalidArgument("rejected remotely".into()));
    let err = served
        .client
        .publish("orders", Message::new("x"))
        .await
        .expect_err("injected failure");
    assert_eq!(
        err,
        Error::batch_failed(1, Error::InvalidArgument("rejected remotely".into()))
    );

    let subscriber = served.client.subscribe("no-such-sub");
    let err = timeout(Duration::from_secs(5), subscriber.next())
        .await?
        .expect_err("unknown subscription");
    assert!(matches!(err, Error::NotFound(_)));

    served.client.shutdown().await?;
    served.server.close();
    Ok(())
}
