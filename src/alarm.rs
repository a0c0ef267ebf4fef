//! The alarm worker.
//!
//! One task owns the status, the remembered armed profile and the
//! outstanding disarm challenge. Broker messages, connection events and
//! countdown ticks all reach it as [`Intent`]s on a single queue, so a
//! `DISARM` and a tick can never interleave inside a transition.

use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::challenge::{parse_response, Challenge};
use crate::command::Command;
use crate::config::{AlarmConfig, PublishAction};
use crate::countdown::{step, Countdown, Scheduler, Step, Tick};
use crate::mqtt::{enqueue, topic_matches, Message, Outbound, OutboundSender, PUBLISH_QOS};
use crate::notify::{Dispatcher, NotifySpec};
use crate::status::{ArmedState, Status, StatusMain, StatusStore};
use crate::trigger::find_match;

#[derive(Debug)]
pub enum Intent {
    /// The broker acknowledged a (re)connection.
    Connected,
    Message(Message),
    Tick(Tick),
}

pub type IntentSender = mpsc::UnboundedSender<Intent>;
pub type IntentReceiver = mpsc::UnboundedReceiver<Intent>;

pub struct Alarm {
    config: Arc<AlarmConfig>,
    store: StatusStore,
    challenge: Option<Challenge>,
    scheduler: Scheduler,
    dispatcher: Dispatcher,
    outbound: OutboundSender,
}

impl Alarm {
    pub fn new(config: Arc<AlarmConfig>, intents: IntentSender, outbound: OutboundSender) -> Self {
        let store = StatusStore::new(
            config.initial_status(),
            &config.mqtt_params.publish_topic,
            outbound.clone(),
        );
        let dispatcher = Dispatcher::new(config.notification.clone(), outbound.clone());
        Alarm {
            config,
            store,
            challenge: None,
            scheduler: Scheduler::new(intents),
            dispatcher,
            outbound,
        }
    }

    pub async fn run(mut self, mut intents: IntentReceiver, cancel: CancellationToken) {
        info!("Alarm started in {}", self.store.main());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                intent = intents.recv() => match intent {
                    Some(intent) => self.handle(intent),
                    None => break,
                },
            }
        }
        info!("Alarm stopped in {}", self.store.main());
    }

    pub fn handle(&mut self, intent: Intent) {
        match intent {
            Intent::Connected => self.on_connected(),
            Intent::Message(message) => self.on_message(message),
            Intent::Tick(tick) => self.on_tick(tick),
        }
    }

    fn on_connected(&mut self) {
        self.subscribe(&self.config.mqtt_params.subscribe_topic);
        if let Some(armed) = self.store.armed() {
            let config = Arc::clone(&self.config);
            for topic in config.profile(armed).trigger_topics() {
                self.subscribe(topic);
            }
        }
        self.store.publish();
    }

    fn on_message(&mut self, message: Message) {
        debug!("Received message \"{}\" on {}", message.payload, message.topic);
        if topic_matches(&self.config.mqtt_params.subscribe_topic, &message.topic) {
            match Command::parse(&message.payload) {
                Some(command) => self.on_command(command),
                None => warn!("Unknown command: [{}]", message.payload),
            }
        } else {
            self.on_event(message);
        }
    }

    fn on_command(&mut self, command: Command) {
        info!("Command {:?} in {}", command, self.store.main());
        match command {
            Command::ArmHome => self.arm(ArmedState::Home),
            Command::ArmAway => self.arm(ArmedState::Away),
            Command::DeactivateRequest => self.deactivate_request(),
            Command::Deactivate(payload) => self.deactivate(&payload),
            Command::Disarm => self.disarm(),
        }
    }

    fn arm(&mut self, armed: ArmedState) {
        if self.store.main() != StatusMain::Unarmed {
            info!("Not arming {}: alarm is {}", armed.main(), self.store.main());
            return;
        }
        self.store
            .set(Status::counting(StatusMain::Arming, self.config.arming_countdown));
        let epoch = self.store.begin_run();
        self.on_tick(Tick {
            epoch,
            countdown: Countdown::Arming(armed),
        });
    }

    fn finalize_arm(&mut self, armed: ArmedState) {
        info!("Arming countdown finished, arming {}", armed.main());
        let config = Arc::clone(&self.config);
        let profile = config.profile(armed);
        for topic in profile.trigger_topics() {
            self.subscribe(topic);
        }
        self.publish_actions(&profile.start);
        self.store.remember_armed(armed);
        self.store.set(Status::new(armed.main()));
    }

    fn deactivate_request(&mut self) {
        if !self.store.main().is_alerting() {
            info!("No deactivation needed in {}", self.store.main());
            return;
        }
        let challenge = Challenge::issue();
        info!("Issued challenge pin {}", challenge.pin());
        let status = self.store.current().clone().with_pin(challenge.pin());
        self.challenge = Some(challenge);
        self.store.set(status);
    }

    fn deactivate(&mut self, payload: &str) {
        if !self.store.main().is_alerting() {
            info!("Current status {}. Will not attempt deactivation.", self.store.main());
            return;
        }
        let Some(challenge) = &self.challenge else {
            info!("No challenge outstanding, request one with DEACTIVATE_REQUEST");
            return;
        };
        let response = match parse_response(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!("Invalid deactivation payload \"{}\": {}", payload, e);
                return;
            }
        };
        if !challenge.accepts(&response, &self.config.disarm_pin) {
            warn!("Wrong pin! Will not deactivate");
            return;
        }
        info!("Correct pin, deactivating");
        self.stand_down();
    }

    fn disarm(&mut self) {
        match self.store.main() {
            StatusMain::Arming | StatusMain::ArmedHome | StatusMain::ArmedAway => self.stand_down(),
            other => info!("Ignoring DISARM in {}", other),
        }
    }

    /// Leaves the remembered profile (trigger topics and stop actions) and
    /// returns to `UNARMED`.
    fn stand_down(&mut self) {
        if let Some(armed) = self.store.forget_armed() {
            let config = Arc::clone(&self.config);
            let profile = config.profile(armed);
            for topic in profile.trigger_topics() {
                enqueue(&self.outbound, Outbound::Unsubscribe(topic.to_string()));
            }
            self.publish_actions(&profile.stop);
        }
        self.challenge = None;
        self.store.set(Status::new(StatusMain::Unarmed));
    }

    fn on_event(&mut self, event: Message) {
        let main = self.store.main();
        if !main.is_armed() && !main.is_alerting() {
            debug!("Ignoring event on {} in {}", event.topic, main);
            return;
        }
        let Some(armed) = self.store.armed() else {
            debug!("No armed profile remembered, ignoring event on {}", event.topic);
            return;
        };
        let config = Arc::clone(&self.config);
        let Some(rule) = find_match(&config.profile(armed).triggers, &event) else {
            debug!("Event on {} matches no trigger", event.topic);
            return;
        };
        info!(
            "Alarm was triggered at [{}] by message <{}> \"{}\"",
            Utc::now(),
            event.topic,
            event.payload
        );
        if main.is_alerting() {
            info!("Already {}, countdown unchanged", main);
            return;
        }
        let notify = rule.notify.clone().unwrap_or_default();
        self.trigger(event, notify);
    }

    fn trigger(&mut self, event: Message, notify: NotifySpec) {
        self.store.set(Status::counting(
            StatusMain::Triggered,
            self.config.triggered_countdown,
        ));
        let epoch = self.store.begin_run();
        self.on_tick(Tick {
            epoch,
            countdown: Countdown::Triggered { event, notify },
        });
    }

    fn activate(&mut self, event: Message, notify: NotifySpec) {
        info!(
            "Alarm was ACTIVATED at [{}] by message <{}> \"{}\"",
            Utc::now(),
            event.topic,
            event.payload
        );
        let status = Status::new(StatusMain::Activated).with_pin(self.challenge_pin());
        self.store.set(status);
        self.dispatcher.dispatch(event, notify);
    }

    fn on_tick(&mut self, tick: Tick) {
        match step(self.store.current(), self.store.epoch(), &tick) {
            Step::Stale => debug!(
                "Dropping {:?} tick of run {}: alarm is {}",
                tick.countdown.expected(),
                tick.epoch,
                self.store.main()
            ),
            Step::Continue(countdown) => {
                let main = tick.countdown.expected();
                debug!("Countdown {} in {}", countdown, main);
                let status = Status::counting(main, countdown).with_pin(self.challenge_pin());
                self.store.set(status);
                self.scheduler.schedule(tick);
            }
            Step::Finish => match tick.countdown {
                Countdown::Arming(armed) => self.finalize_arm(armed),
                Countdown::Triggered { event, notify } => self.activate(event, notify),
            },
        }
    }

    fn challenge_pin(&self) -> &str {
        self.challenge.as_ref().map(Challenge::pin).unwrap_or("")
    }

    fn subscribe(&self, topic: &str) {
        enqueue(&self.outbound, Outbound::Subscribe(topic.to_string()));
    }

    fn publish_actions(&self, actions: &[PublishAction]) {
        for action in actions {
            enqueue(
                &self.outbound,
                Outbound::Publish {
                    topic: action.topic.clone(),
                    payload: action.command.clone(),
                    qos: PUBLISH_QOS,
                    retain: true,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::mqtt::OutboundReceiver;
    use std::time::Duration;
    use tokio::time::{sleep, Instant};

    const STATUS_TOPIC: &str = "alarm/status";
    const COMMAND_TOPIC: &str = "alarm/command";
    const NOTIFIER_TOPIC: &str = "notifier/command";
    const AWAY_TOPICS: [&str; 3] = ["home/+/door", "home/garage/#", "home/+/motion"];

    struct Harness {
        intents: IntentSender,
        outbound: OutboundReceiver,
        _cancel: CancellationToken,
    }

    impl Harness {
        fn start(initial: &str) -> Self {
            let content = SAMPLE.replace(
                "\"main\": \"UNARMED\"",
                &format!("\"main\": \"{}\"", initial),
            );
            let config = Arc::new(AlarmConfig::from_json(&content).unwrap());
            let (intents, intents_rx) = mpsc::unbounded_channel();
            let (outbound_tx, outbound) = mpsc::unbounded_channel();
            let alarm = Alarm::new(config, intents.clone(), outbound_tx);
            let cancel = CancellationToken::new();
            tokio::spawn(alarm.run(intents_rx, cancel.clone()));
            Harness {
                intents,
                outbound,
                _cancel: cancel,
            }
        }

        fn command(&self, payload: &str) {
            self.intents
                .send(Intent::Message(Message::new(COMMAND_TOPIC, payload)))
                .unwrap();
        }

        fn event(&self, topic: &str, payload: &str) {
            self.intents
                .send(Intent::Message(Message::new(topic, payload)))
                .unwrap();
        }

        async fn next(&mut self) -> Outbound {
            self.outbound.recv().await.unwrap()
        }

        async fn next_status(&mut self) -> Status {
            match self.next().await {
                Outbound::Publish { topic, payload, .. } if topic == STATUS_TOPIC => {
                    serde_json::from_str(&payload).unwrap()
                }
                other => panic!("expected a status publish, got {:?}", other),
            }
        }

        async fn next_status_skipping_requests(&mut self) -> Option<Status> {
            match self.next().await {
                Outbound::Publish { topic, payload, .. } if topic == STATUS_TOPIC => {
                    serde_json::from_str(&payload).ok()
                }
                _ => None,
            }
        }

        /// Lets every pending countdown run out and returns what was sent.
        async fn settle(&mut self) -> Vec<Outbound> {
            sleep(Duration::from_secs(30)).await;
            let mut sent = Vec::new();
            while let Ok(request) = self.outbound.try_recv() {
                sent.push(request);
            }
            sent
        }

        async fn trigger_away(&mut self) {
            self.event("home/kitchen/door", "OPEN");
            assert_eq!(self.next_status().await, Status::counting(StatusMain::Triggered, 2));
            assert_eq!(self.next_status().await, Status::counting(StatusMain::Triggered, 1));
        }
    }

    fn publish(topic: &str, payload: &str) -> Outbound {
        Outbound::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            qos: PUBLISH_QOS,
            retain: true,
        }
    }

    fn answer(challenge: &str, secret: &str) -> String {
        challenge
            .bytes()
            .zip(secret.bytes())
            .map(|(c, d)| char::from(b'0' + (c - b'0' + d - b'0') % 10))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn arming_run_counts_down_to_armed_away() {
        let mut alarm = Harness::start("UNARMED");
        let start = Instant::now();
        alarm.command("ARM_AWAY");
        for countdown in [3, 2, 1, 0] {
            assert_eq!(
                alarm.next_status().await,
                Status::counting(StatusMain::Arming, countdown)
            );
        }
        for topic in AWAY_TOPICS {
            assert_eq!(alarm.next().await, Outbound::Subscribe(topic.to_string()));
        }
        assert_eq!(alarm.next().await, publish("sensors/motion/set", "ON"));
        assert_eq!(alarm.next_status().await, Status::new(StatusMain::ArmedAway));
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(alarm.settle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn arm_is_ignored_unless_unarmed() {
        let mut alarm = Harness::start("ARMED_HOME");
        alarm.command("ARM_AWAY");
        alarm.command("ARM_HOME");
        assert!(alarm.settle().await.is_empty());

        let mut alarm = Harness::start("UNARMED");
        alarm.command("ARM_HOME");
        alarm.command("ARM_AWAY");
        let statuses: Vec<Status> = alarm
            .settle()
            .await
            .into_iter()
            .filter_map(|request| match request {
                Outbound::Publish { topic, payload, .. } if topic == STATUS_TOPIC => {
                    serde_json::from_str(&payload).ok()
                }
                _ => None,
            })
            .collect();
        assert_eq!(statuses.len(), 5);
        assert_eq!(statuses[4], Status::new(StatusMain::ArmedHome));
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_mid_countdown_stops_the_run() {
        let mut alarm = Harness::start("UNARMED");
        alarm.command("ARM_AWAY");
        assert_eq!(alarm.next_status().await, Status::counting(StatusMain::Arming, 3));
        assert_eq!(alarm.next_status().await, Status::counting(StatusMain::Arming, 2));
        alarm.command("DISARM");
        assert_eq!(alarm.next_status().await, Status::new(StatusMain::Unarmed));
        assert!(alarm.settle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_of_an_abandoned_run_do_not_leak_into_the_next() {
        let mut alarm = Harness::start("UNARMED");
        alarm.command("ARM_AWAY");
        alarm.next_status().await;
        alarm.next_status().await;
        alarm.command("DISARM");
        alarm.command("ARM_HOME");
        assert_eq!(alarm.next_status().await, Status::new(StatusMain::Unarmed));
        for countdown in [3, 2, 1, 0] {
            assert_eq!(
                alarm.next_status().await,
                Status::counting(StatusMain::Arming, countdown)
            );
        }
        assert_eq!(
            alarm.next().await,
            Outbound::Subscribe("home/front/door".to_string())
        );
        assert_eq!(alarm.next_status().await, Status::new(StatusMain::ArmedHome));
        assert!(alarm.settle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn matching_event_triggers_and_activates_once() {
        let mut alarm = Harness::start("ARMED_AWAY");
        alarm.trigger_away().await;
        assert_eq!(alarm.next_status().await, Status::counting(StatusMain::Triggered, 0));
        // A second matching event mid-countdown changes nothing.
        alarm.event("home/hall/motion", "ON");
        assert_eq!(alarm.next_status().await, Status::new(StatusMain::Activated));
        match alarm.next().await {
            Outbound::Publish {
                topic,
                payload,
                qos,
                retain,
            } => {
                assert_eq!(topic, NOTIFIER_TOPIC);
                assert_eq!(qos, PUBLISH_QOS);
                assert!(retain);
                let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
                assert_eq!(value["sms"]["text"], "home/kitchen/door: OPEN");
                assert_eq!(value["email"]["subject"], "Alarm");
            }
            other => panic!("expected a notifier command, got {:?}", other),
        }
        alarm.event("home/kitchen/door", "OPEN");
        assert!(alarm.settle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rule_without_notify_still_dispatches() {
        let mut alarm = Harness::start("ARMED_AWAY");
        alarm.event("home/hall/motion", "ON");
        let sent = alarm.settle().await;
        let notifier: Vec<_> = sent
            .iter()
            .filter(|request| matches!(request, Outbound::Publish { topic, .. } if topic == NOTIFIER_TOPIC))
            .collect();
        assert_eq!(notifier.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unrelated_events_are_ignored() {
        let mut alarm = Harness::start("ARMED_AWAY");
        alarm.event("home/kitchen/door", "CLOSED");
        alarm.event("garden/pump", "OPEN");
        alarm.event("home/hall/motion", "ONLINE");
        assert!(alarm.settle().await.is_empty());

        let mut alarm = Harness::start("UNARMED");
        alarm.event("home/kitchen/door", "OPEN");
        assert!(alarm.settle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn home_profile_only_watches_its_own_rules() {
        let mut alarm = Harness::start("ARMED_HOME");
        alarm.event("home/kitchen/door", "OPEN");
        assert!(alarm.settle().await.is_empty());
        alarm.event("home/front/door", "OPEN");
        assert_eq!(alarm.next_status().await, Status::counting(StatusMain::Triggered, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_response_deactivates_activated_alarm() {
        let mut alarm = Harness::start("ARMED_AWAY");
        alarm.trigger_away().await;
        let sent = alarm.settle().await;
        assert_eq!(sent.len(), 3);

        alarm.command("DEACTIVATE_REQUEST");
        let status = alarm.next_status().await;
        assert_eq!(status.main, StatusMain::Activated);
        assert_eq!(status.challenge_pin.len(), 4);

        let correct = answer(&status.challenge_pin, "9497");
        let wrong: String = correct
            .bytes()
            .enumerate()
            .map(|(i, b)| if i == 0 { char::from(b'0' + (b - b'0' + 1) % 10) } else { char::from(b) })
            .collect();
        alarm.command(&format!("{{\"pin\":\"{}\"}}", wrong));
        alarm.command("{\"pin\":\"12\"}");
        alarm.command("DEACTIVATE");
        assert!(alarm.settle().await.is_empty());

        alarm.command(&format!("{{\"pin\":\"{}\"}}", correct));
        for topic in AWAY_TOPICS {
            assert_eq!(alarm.next().await, Outbound::Unsubscribe(topic.to_string()));
        }
        assert_eq!(alarm.next().await, publish("sensors/motion/set", "OFF"));
        assert_eq!(alarm.next_status().await, Status::new(StatusMain::Unarmed));

        // The challenge was consumed.
        alarm.command(&format!("{{\"pin\":\"{}\"}}", correct));
        assert!(alarm.settle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_while_triggered_prevents_activation() {
        let mut alarm = Harness::start("ARMED_AWAY");
        alarm.trigger_away().await;
        alarm.command("DEACTIVATE_REQUEST");
        let status = alarm.next_status().await;
        assert_eq!(status.main, StatusMain::Triggered);
        assert_eq!(status.countdown, 1);
        let pin = status.challenge_pin.clone();

        let next = alarm.next_status().await;
        assert_eq!(next, Status::counting(StatusMain::Triggered, 0).with_pin(&pin));

        alarm.command(&format!("{{\"pin\":\"{}\"}}", answer(&pin, "9497")));
        let sent = alarm.settle().await;
        assert_eq!(sent.len(), 5);
        assert_eq!(
            sent[4],
            publish(STATUS_TOPIC, &Status::new(StatusMain::Unarmed).to_json())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn deactivation_is_ignored_outside_alerting_states() {
        let mut alarm = Harness::start("UNARMED");
        alarm.command("{\"pin\":\"0621\"}");
        alarm.command("DEACTIVATE_REQUEST");
        assert!(alarm.settle().await.is_empty());

        let mut alarm = Harness::start("ARMED_AWAY");
        alarm.command("DEACTIVATE_REQUEST");
        alarm.command("DISARM DISARM");
        assert!(alarm.settle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deactivate_without_challenge_is_ignored() {
        let mut alarm = Harness::start("ARMED_AWAY");
        alarm.trigger_away().await;
        alarm.settle().await;
        alarm.command("{\"pin\":\"0000\"}");
        alarm.command("DISARM");
        assert!(alarm.settle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disarm_leaves_armed_profile() {
        let mut alarm = Harness::start("ARMED_AWAY");
        alarm.command("DISARM");
        for topic in AWAY_TOPICS {
            assert_eq!(alarm.next().await, Outbound::Unsubscribe(topic.to_string()));
        }
        assert_eq!(alarm.next().await, publish("sensors/motion/set", "OFF"));
        assert_eq!(alarm.next_status().await, Status::new(StatusMain::Unarmed));
        alarm.command("DISARM");
        assert!(alarm.settle().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_subscribes_and_publishes_current_status() {
        let mut alarm = Harness::start("ARMED_AWAY");
        alarm.intents.send(Intent::Connected).unwrap();
        assert_eq!(
            alarm.next().await,
            Outbound::Subscribe(COMMAND_TOPIC.to_string())
        );
        for topic in AWAY_TOPICS {
            assert_eq!(alarm.next().await, Outbound::Subscribe(topic.to_string()));
        }
        assert_eq!(alarm.next_status().await, Status::new(StatusMain::ArmedAway));

        let mut alarm = Harness::start("UNARMED");
        alarm.intents.send(Intent::Connected).unwrap();
        assert_eq!(
            alarm.next().await,
            Outbound::Subscribe(COMMAND_TOPIC.to_string())
        );
        assert_eq!(alarm.next_status().await, Status::new(StatusMain::Unarmed));
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_is_zero_outside_counting_states() {
        let mut alarm = Harness::start("UNARMED");
        alarm.command("ARM_AWAY");
        let mut statuses = Vec::new();
        while statuses.last().map(|s: &Status| s.main) != Some(StatusMain::ArmedAway) {
            if let Some(status) = alarm.next_status_skipping_requests().await {
                statuses.push(status);
            }
        }
        alarm.event("home/garage/side", "OPEN");
        while statuses.last().map(|s: &Status| s.main) != Some(StatusMain::Activated) {
            if let Some(status) = alarm.next_status_skipping_requests().await {
                statuses.push(status);
            }
        }
        assert_eq!(statuses.len(), 9);
        for status in statuses {
            match status.main {
                StatusMain::Arming | StatusMain::Triggered => {}
                _ => assert_eq!(status.countdown, 0, "{:?}", status),
            }
        }
    }
}
