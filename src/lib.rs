pub mod alarm;
pub mod challenge;
pub mod command;
pub mod config;
pub mod countdown;
pub mod error;
pub mod logging;
pub mod mqtt;
pub mod notify;
pub mod status;
pub mod trigger;

use alarm::Alarm;
use config::AlarmConfig;
use error::AlarmError;
use log::{error, info, warn};
use mqtt::{forward, poll_events, setup as mqtt_setup, WILL_QOS};
use status::Status;
use std::{future::Future, io, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Resolves once `signal` fires. A signal handler that cannot be installed
/// leaves the alarm running until the process is killed.
async fn wait_for_shutdown<F>(signal: F)
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("Ctrl+C pressed, shutting down"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[tokio::main]
pub async fn run() -> Result<(), AlarmError> {
    let config = Arc::new(AlarmConfig::load()?);
    let (client, eventloop) = mqtt_setup(&config.client_id(), &config.mqtt_params);

    let cancel = CancellationToken::new();
    let transport = CancellationToken::new();
    let (intents_tx, intents_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

    let alarm = Alarm::new(Arc::clone(&config), intents_tx.clone(), outbound_tx);
    let poller = tokio::spawn(poll_events(eventloop, intents_tx, transport.clone()));
    let forwarder = tokio::spawn(forward(client.clone(), outbound_rx));
    let worker = tokio::spawn(alarm.run(intents_rx, cancel.clone()));

    wait_for_shutdown(tokio::signal::ctrl_c()).await;
    cancel.cancel();
    if let Err(e) = worker.await {
        error!("Alarm worker failed: {}", e);
    }
    // The worker dropped its senders; pending dispatches finish their lookup
    // and the forwarder flushes them before returning.
    if let Err(e) = forwarder.await {
        error!("Outbound forwarder failed: {}", e);
    }

    // A graceful exit never fires the last will, so announce it ourselves.
    match client
        .publish(
            &config.mqtt_params.publish_topic,
            WILL_QOS,
            true,
            Status::unavailable().to_json(),
        )
        .await
    {
        Ok(_) => info!("Published UNAVAILABLE"),
        Err(e) => error!("Failed to publish UNAVAILABLE: {}", e),
    }
    client.disconnect().await?;
    if tokio::time::timeout(SHUTDOWN_GRACE, poller).await.is_err() {
        warn!("MQTT event loop did not stop in time");
        transport.cancel();
    }
    info!("Alarm shut down");
    Ok(())
}
