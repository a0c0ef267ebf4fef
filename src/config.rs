use log::{error, info};
use regex::Regex;
use serde::Deserialize;
use std::{env::var, fs, sync::LazyLock};
use uuid::Uuid;

use crate::error::ConfigError;
use crate::notify::NotifySpec;
use crate::status::{ArmedState, Status, StatusMain};

pub static CONFIG_FILE: LazyLock<String> =
    LazyLock::new(|| var("ALARM_CONFIG").unwrap_or("data/alarm.json".to_string()));

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttParams {
    pub address: String,
    pub port: u16,
    pub subscribe_topic: String,
    pub publish_topic: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// A publish fired once when a profile is armed (start) or disarmed (stop).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PublishAction {
    pub topic: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawTrigger {
    topics: Vec<String>,
    regex: String,
    #[serde(default)]
    notify: Option<NotifySpec>,
}

#[derive(Debug, Clone)]
pub struct TriggerRule {
    pub topics: Vec<String>,
    pub regex: Regex,
    pub notify: Option<NotifySpec>,
}

impl TryFrom<RawTrigger> for TriggerRule {
    type Error = ConfigError;

    fn try_from(raw: RawTrigger) -> Result<Self, Self::Error> {
        let regex = Regex::new(&raw.regex).map_err(|source| ConfigError::InvalidRegex {
            pattern: raw.regex.clone(),
            source,
        })?;
        Ok(TriggerRule {
            topics: raw.topics,
            regex,
            notify: raw.notify,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawArmProfile")]
pub struct ArmProfile {
    pub start: Vec<PublishAction>,
    pub stop: Vec<PublishAction>,
    pub triggers: Vec<TriggerRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawArmProfile {
    #[serde(default)]
    start: Vec<PublishAction>,
    #[serde(default)]
    stop: Vec<PublishAction>,
    #[serde(default)]
    triggers: Vec<RawTrigger>,
}

impl TryFrom<RawArmProfile> for ArmProfile {
    type Error = ConfigError;

    fn try_from(raw: RawArmProfile) -> Result<Self, Self::Error> {
        let triggers = raw
            .triggers
            .into_iter()
            .map(TriggerRule::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ArmProfile {
            start: raw.start,
            stop: raw.stop,
            triggers,
        })
    }
}

impl ArmProfile {
    /// Every topic filter referenced by the profile's trigger rules, in
    /// configuration order.
    pub fn trigger_topics(&self) -> impl Iterator<Item = &str> {
        self.triggers
            .iter()
            .flat_map(|t| t.topics.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub notifier_mqtt_publish: String,
    pub message_template: String,
    #[serde(default)]
    pub translation_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitialStatus {
    pub main: StatusMain,
    #[serde(default)]
    pub countdown: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmConfig {
    pub arming_countdown: u32,
    pub triggered_countdown: u32,
    pub disarm_pin: String,
    #[serde(default)]
    pub mqtt_id: Option<String>,
    pub mqtt_params: MqttParams,
    pub armed_away: ArmProfile,
    pub armed_home: ArmProfile,
    pub notification: NotificationConfig,
    pub status: InitialStatus,
}

impl AlarmConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&CONFIG_FILE)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path);
        let content = fs::read_to_string(path).map_err(|source| {
            error!("Failed to read configuration file {}: {}", path, source);
            ConfigError::Read {
                path: path.to_string(),
                source,
            }
        })?;
        let mut config = Self::from_json(&content)?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: AlarmConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.disarm_pin.len() != 4 || !self.disarm_pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ConfigError::InvalidDisarmPin);
        }
        match self.status.main {
            StatusMain::Unarmed | StatusMain::ArmedHome | StatusMain::ArmedAway => Ok(()),
            other => Err(ConfigError::InvalidInitialStatus(other)),
        }
    }

    /// Broker overrides from the environment take precedence over the file.
    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(broker) = var("MQTT_BROKER") {
            self.mqtt_params.address = broker;
        }
        if let Ok(port) = var("MQTT_PORT") {
            self.mqtt_params.port = port.parse().map_err(|_| ConfigError::InvalidEnv {
                name: "MQTT_PORT",
                value: port.clone(),
            })?;
        }
        if let Ok(user) = var("MQTT_USER") {
            self.mqtt_params.user = Some(user);
        }
        if let Ok(password) = var("MQTT_PASSWORD") {
            self.mqtt_params.password = Some(password);
        }
        Ok(())
    }

    pub fn client_id(&self) -> String {
        match &self.mqtt_id {
            Some(id) => id.clone(),
            None => format!("mqtt-alarm-{}", Uuid::new_v4().simple()),
        }
    }

    pub fn profile(&self, armed: ArmedState) -> &ArmProfile {
        match armed {
            ArmedState::Home => &self.armed_home,
            ArmedState::Away => &self.armed_away,
        }
    }

    /// Countdowns are only meaningful while counting, so the configured
    /// initial countdown is dropped.
    pub fn initial_status(&self) -> Status {
        Status::new(self.status.main)
    }
}
