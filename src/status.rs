use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use crate::mqtt::{enqueue, Outbound, OutboundSender, PUBLISH_QOS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusMain {
    Unavailable,
    Unarmed,
    Arming,
    ArmedHome,
    ArmedAway,
    Triggered,
    Activated,
}

impl StatusMain {
    pub fn name(&self) -> &'static str {
        match self {
            StatusMain::Unavailable => "UNAVAILABLE",
            StatusMain::Unarmed => "UNARMED",
            StatusMain::Arming => "ARMING",
            StatusMain::ArmedHome => "ARMED_HOME",
            StatusMain::ArmedAway => "ARMED_AWAY",
            StatusMain::Triggered => "TRIGGERED",
            StatusMain::Activated => "ACTIVATED",
        }
    }

    pub fn is_armed(&self) -> bool {
        matches!(self, StatusMain::ArmedHome | StatusMain::ArmedAway)
    }

    /// Triggered or activated: the only states a challenge can be issued in.
    pub fn is_alerting(&self) -> bool {
        matches!(self, StatusMain::Triggered | StatusMain::Activated)
    }
}

impl fmt::Display for StatusMain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The two arm profiles. Remembered while armed so that triggering and
/// deactivation know which profile's topics and stop actions apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmedState {
    Home,
    Away,
}

impl ArmedState {
    pub fn main(&self) -> StatusMain {
        match self {
            ArmedState::Home => StatusMain::ArmedHome,
            ArmedState::Away => StatusMain::ArmedAway,
        }
    }

    pub fn from_main(main: StatusMain) -> Option<Self> {
        match main {
            StatusMain::ArmedHome => Some(ArmedState::Home),
            StatusMain::ArmedAway => Some(ArmedState::Away),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub main: StatusMain,
    pub countdown: u32,
    pub challenge_pin: String,
}

impl Status {
    pub fn new(main: StatusMain) -> Self {
        Status {
            main,
            countdown: 0,
            challenge_pin: String::new(),
        }
    }

    pub fn counting(main: StatusMain, countdown: u32) -> Self {
        Status {
            main,
            countdown,
            challenge_pin: String::new(),
        }
    }

    pub fn with_pin(mut self, pin: &str) -> Self {
        self.challenge_pin = pin.to_string();
        self
    }

    pub fn unavailable() -> Self {
        Status::new(StatusMain::Unavailable)
    }

    pub fn to_json(&self) -> String {
        json!({
            "main": self.main.name(),
            "countdown": self.countdown,
            "challengePin": self.challenge_pin,
        })
        .to_string()
    }
}

/// Owns the live status, the remembered armed profile and the countdown-run
/// epoch. Every replacement of the status is queued for publish in the same
/// call, so the publish order is the mutation order.
pub struct StatusStore {
    current: Status,
    armed: Option<ArmedState>,
    epoch: u64,
    topic: String,
    outbound: OutboundSender,
}

impl StatusStore {
    pub fn new(initial: Status, topic: &str, outbound: OutboundSender) -> Self {
        let armed = ArmedState::from_main(initial.main);
        StatusStore {
            current: initial,
            armed,
            epoch: 0,
            topic: topic.to_string(),
            outbound,
        }
    }

    pub fn current(&self) -> &Status {
        &self.current
    }

    pub fn main(&self) -> StatusMain {
        self.current.main
    }

    pub fn set(&mut self, status: Status) {
        debug!("Status {} -> {}", self.current.to_json(), status.to_json());
        self.current = status;
        self.publish();
    }

    /// Republishes the current status unchanged, e.g. after a reconnect.
    pub fn publish(&self) {
        enqueue(
            &self.outbound,
            Outbound::Publish {
                topic: self.topic.clone(),
                payload: self.current.to_json(),
                qos: PUBLISH_QOS,
                retain: true,
            },
        );
    }

    pub fn armed(&self) -> Option<ArmedState> {
        self.armed
    }

    pub fn remember_armed(&mut self, armed: ArmedState) {
        self.armed = Some(armed);
    }

    pub fn forget_armed(&mut self) -> Option<ArmedState> {
        self.armed.take()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Starts a new countdown run; ticks carrying an older epoch are stale.
    pub fn begin_run(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}
