// Emulator service main entry point.
use anyhow::{Context, Result};
use courier_emulator::Emulator;
use courier_transport::tls::self_signed_server_config;
use courier_transport::{QuicEndpoint, serve};
use emulator_service::config::EmulatorServiceConfig;
use emulator_service::observability;
use std::future::Future;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    run_with_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability("courier-emulator")?;
    let config = EmulatorServiceConfig::from_env_or_yaml()?;

    let emulator = Emulator::new(config.emulator_config());
    config.provision(&emulator)?;
    tracing::info!(topics = config.topics.len(), "emulator started");

    let metrics_listener = observability::bind_metrics(config.metrics_bind).await?;
    tracing::info!(addr = %metrics_listener.local_addr()?, "metrics listener started");
    let metrics_task = tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_listener).await {
            tracing::warn!(error = %err, "metrics server exited");
        }
    });

    // Dev-only self-signed TLS; clients must trust the generated certificate.
    let (server_config, _cert) = self_signed_server_config(vec!["localhost".into()])
        .context("build QUIC server config")?;
    let quic_server = Arc::new(
        QuicEndpoint::server(config.quic_bind, server_config, config.transport_config())
            .context("bind QUIC listener")?,
    );
    tracing::info!(addr = %quic_server.local_addr()?, "quic listener started");

    let accept_task = {
        let quic_server = Arc::clone(&quic_server);
        let emulator = emulator.clone();
        tokio::spawn(serve(quic_server, Arc::new(emulator)))
    };

    shutdown.await;
    emulator.shutdown();
    quic_server.close();
    accept_task.abort();
    metrics_task.abort();
    let _ = accept_task.await;
    let _ = metrics_task.await;
    tracing::info!("emulator stopped");
    Ok(())
}
