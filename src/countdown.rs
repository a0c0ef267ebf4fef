//! One-second countdown ticks for arming and triggering.
//!
//! A tick is never cancelled. It remembers the main state it expects and the
//! epoch of the run that scheduled it; when the worker processes a tick that
//! no longer matches the live status, the tick does nothing and the run ends.

use log::debug;
use std::time::Duration;

use crate::alarm::{Intent, IntentSender};
use crate::mqtt::Message;
use crate::notify::NotifySpec;
use crate::status::{ArmedState, Status, StatusMain};

pub const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum Countdown {
    /// Arming towards a profile.
    Arming(ArmedState),
    /// Triggered by `event`; activation notifies with `notify`.
    Triggered { event: Message, notify: NotifySpec },
}

impl Countdown {
    pub fn expected(&self) -> StatusMain {
        match self {
            Countdown::Arming(_) => StatusMain::Arming,
            Countdown::Triggered { .. } => StatusMain::Triggered,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub epoch: u64,
    pub countdown: Countdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The run was superseded; drop the tick.
    Stale,
    /// Publish this countdown and schedule the next tick.
    Continue(u32),
    /// Countdown exhausted; run the terminal action.
    Finish,
}

pub fn step(status: &Status, epoch: u64, tick: &Tick) -> Step {
    if status.main != tick.countdown.expected() || epoch != tick.epoch {
        return Step::Stale;
    }
    match status.countdown {
        0 => Step::Finish,
        n => Step::Continue(n - 1),
    }
}

#[derive(Clone)]
pub struct Scheduler {
    intents: IntentSender,
    period: Duration,
}

impl Scheduler {
    pub fn new(intents: IntentSender) -> Self {
        Scheduler {
            intents,
            period: TICK,
        }
    }

    /// Queues `tick` on the worker after one period.
    pub fn schedule(&self, tick: Tick) {
        let intents = self.intents.clone();
        let period = self.period;
        tokio::spawn(async move {
            tokio::time::sleep(period).await;
            if intents.send(Intent::Tick(tick)).is_err() {
                debug!("Alarm worker gone, tick dropped");
            }
        });
    }
}
