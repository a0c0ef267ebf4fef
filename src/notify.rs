use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::NotificationConfig;
use crate::error::LookupError;
use crate::mqtt::{enqueue, Message, Outbound, OutboundSender, PUBLISH_QOS};

const DEVICE_NAME: &str = "{device_name}";
const TEXT: &str = "{text}";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
}

/// Channels to alert on activation. Every list may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifySpec {
    #[serde(default)]
    pub sms: Vec<String>,
    #[serde(default)]
    pub phonecall: Vec<String>,
    #[serde(default)]
    pub im: Vec<String>,
    #[serde(default)]
    pub email: Option<EmailConfig>,
}

impl NotifySpec {
    /// The notifier command carrying `text` on every text channel.
    pub fn to_command(&self, text: &str) -> String {
        let email = self.email.as_ref().map(|email| {
            json!({
                "sender": email.from,
                "recipients": email.to,
                "subject": email.subject,
                "text": text,
            })
        });
        json!({
            "sms": { "recipients": self.sms, "text": text },
            "phonecall": self.phonecall,
            "im": { "recipients": self.im, "text": text },
            "email": email,
        })
        .to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceName {
    house: String,
    floor: String,
    room: String,
    item: String,
}

impl DeviceName {
    pub fn path(&self) -> String {
        format!("{}/{}/{}/{}", self.house, self.floor, self.room, self.item)
    }
}

pub fn render_message(template: &str, device_name: &str, text: &str) -> String {
    template.replace(DEVICE_NAME, device_name).replace(TEXT, text)
}

#[derive(Clone)]
pub struct Dispatcher {
    client: Client,
    config: NotificationConfig,
    outbound: OutboundSender,
}

impl Dispatcher {
    pub fn new(config: NotificationConfig, outbound: OutboundSender) -> Self {
        Dispatcher {
            client: Client::new(),
            config,
            outbound,
        }
    }

    pub async fn lookup(&self, url: &str, topic: &str) -> Result<DeviceName, LookupError> {
        let device = self
            .client
            .get(format!("{}{}", url, topic))
            .timeout(LOOKUP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json::<DeviceName>()
            .await?;
        Ok(device)
    }

    /// Alert text for `event`. A failed lookup leaves the template as is;
    /// without a lookup url the device is named by its topic.
    pub async fn compose(&self, event: &Message) -> String {
        let template = &self.config.message_template;
        let device_name = match &self.config.translation_url {
            Some(url) => match self.lookup(url, &event.topic).await {
                Ok(device) => device.path(),
                Err(e) => {
                    warn!("Device lookup for {} failed: {}", event.topic, e);
                    return template.clone();
                }
            },
            None => event.topic.clone(),
        };
        render_message(template, &device_name, &event.payload)
    }

    pub async fn send(&self, event: &Message, notify: &NotifySpec) {
        let text = self.compose(event).await;
        info!("Sending notification: {}", text);
        let payload = notify.to_command(&text);
        debug!("Notifier command: {}", payload);
        enqueue(
            &self.outbound,
            Outbound::Publish {
                topic: self.config.notifier_mqtt_publish.clone(),
                payload,
                qos: PUBLISH_QOS,
                retain: true,
            },
        );
    }

    /// Detached so the worker never waits on the lookup.
    pub fn dispatch(&self, event: Message, notify: NotifySpec) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.send(&event, &notify).await;
        });
    }
}
