use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::alarm::{Intent, IntentSender};
use crate::config::MqttParams;
use crate::status::Status;

/// Subscriptions: command topic and trigger topics.
pub const QOS: QoS = QoS::AtMostOnce;
/// Status, start/stop actions and notifier commands.
pub const PUBLISH_QOS: QoS = QoS::ExactlyOnce;
pub const WILL_QOS: QoS = QoS::AtLeastOnce;

const KEEP_ALIVE: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 10;

/// A publish received from the broker, payload decoded lossily as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: String,
}

impl Message {
    pub fn new(topic: &str, payload: &str) -> Self {
        Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }
}

/// Requests the worker hands to the client. Drained in order by [`forward`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Publish {
        topic: String,
        payload: String,
        qos: QoS,
        retain: bool,
    },
    Subscribe(String),
    Unsubscribe(String),
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

pub fn enqueue(outbound: &OutboundSender, request: Outbound) {
    if let Err(e) = outbound.send(request) {
        error!("Outbound queue closed, dropping {:?}", e.0);
    }
}

pub fn setup(client_id: &str, params: &MqttParams) -> (AsyncClient, EventLoop) {
    info!(
        "Setting up MQTT client {} for {}:{}",
        client_id, params.address, params.port
    );
    let mut mqttoptions = MqttOptions::new(client_id, &params.address, params.port);
    mqttoptions.set_keep_alive(KEEP_ALIVE);
    if let Some(user) = &params.user {
        mqttoptions.set_credentials(user, params.password.as_deref().unwrap_or(""));
    }
    mqttoptions.set_last_will(LastWill::new(
        &params.publish_topic,
        Status::unavailable().to_json().into_bytes(),
        WILL_QOS,
        true,
    ));
    AsyncClient::new(mqttoptions, REQUEST_CAPACITY)
}

pub fn parse_event(event: Event) -> Option<Intent> {
    match event {
        Event::Incoming(Packet::ConnAck(connack)) => {
            info!("Connected to MQTT broker: {:?}", connack.code);
            Some(Intent::Connected)
        }
        Event::Incoming(Packet::Publish(publish)) => {
            debug!("Received message on topic: {}", publish.topic);
            debug!("Payload: {:?}", publish.payload);
            let payload = String::from_utf8_lossy(&publish.payload).into_owned();
            Some(Intent::Message(Message {
                topic: publish.topic,
                payload,
            }))
        }
        _ => None,
    }
}

/// Polls the client event loop and feeds the worker until cancelled or the
/// client disconnects. Reconnection is left to rumqttc: polling again after
/// an error reconnects.
pub async fn poll_events(mut eventloop: EventLoop, intents: IntentSender, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from MQTT broker");
                    break;
                }
                Ok(event) => {
                    if let Some(intent) = parse_event(event) {
                        if intents.send(intent).is_err() {
                            debug!("Alarm worker stopped, dropping inbound event");
                        }
                    }
                }
                Err(e) => {
                    error!("Error: {:?}", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    info!("MQTT event loop stopped");
}

/// Executes outbound requests on the client until every sender is dropped.
/// Requests still queued at that point are flushed first.
pub async fn forward(client: AsyncClient, mut outbound: OutboundReceiver) {
    while let Some(request) = outbound.recv().await {
        match request {
            Outbound::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                debug!("Publishing: {} => {}", topic, payload);
                match client.publish(&topic, qos, retain, payload).await {
                    Ok(_) => debug!("Published to {}", topic),
                    Err(e) => error!("Failed to publish to {}: {}", topic, e),
                }
            }
            Outbound::Subscribe(topic) => match client.subscribe(&topic, QOS).await {
                Ok(_) => info!("Subscribed to {}", topic),
                Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
            },
            Outbound::Unsubscribe(topic) => match client.unsubscribe(&topic).await {
                Ok(_) => info!("Unsubscribed from {}", topic),
                Err(e) => error!("Failed to unsubscribe from {}: {}", topic, e),
            },
        }
    }
    debug!("Outbound forwarder stopped");
}

/// MQTT topic filter matching: `+` matches one level, a trailing `#` matches
/// the parent level and everything below it. Wildcards never match topics
/// starting with `$` from the first level.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
