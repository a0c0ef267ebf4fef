use crate::config::TriggerRule;
use crate::mqtt::{topic_matches, Message};

/// The first rule with a topic filter matching the event topic and a regex
/// found in the payload.
pub fn find_match<'a>(rules: &'a [TriggerRule], event: &Message) -> Option<&'a TriggerRule> {
    rules.iter().find(|rule| {
        rule.topics
            .iter()
            .any(|filter| topic_matches(filter, &event.topic))
            && rule.regex.is_match(&event.payload)
    })
}
