//! Two-phase disarm: the alarm issues a random challenge and only a response
//! whose per-digit difference to the challenge (mod 10) equals the disarm
//! secret deactivates it.

use rand::Rng;
use serde_json::Value;

use crate::error::ChallengeError;

pub const PIN_LENGTH: usize = 4;

fn is_pin(pin: &str) -> bool {
    pin.len() == PIN_LENGTH && pin.bytes().all(|b| b.is_ascii_digit())
}

/// An outstanding challenge. It does not expire; it lives until the next
/// `DEACTIVATE` consumes it or the alarm is disarmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pin: String,
}

impl Challenge {
    pub fn issue() -> Self {
        let mut rng = rand::rng();
        let pin = (0..PIN_LENGTH)
            .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
            .collect();
        Challenge { pin }
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    /// `response` and `secret` must both be 4 ASCII digits, else rejected.
    pub fn accepts(&self, response: &str, secret: &str) -> bool {
        if !is_pin(response) || !is_pin(secret) {
            return false;
        }
        self.pin
            .bytes()
            .zip(response.bytes())
            .zip(secret.bytes())
            .all(|((c, r), d)| (10 + (r - b'0') - (c - b'0')) % 10 == d - b'0')
    }
}

#[cfg(test)]
impl From<&str> for Challenge {
    fn from(pin: &str) -> Self {
        Challenge {
            pin: pin.to_string(),
        }
    }
}

/// Extracts the response pin from a `DEACTIVATE` payload, `{"pin": "dddd"}`.
pub fn parse_response(payload: &str) -> Result<String, ChallengeError> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| ChallengeError::Malformed(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ChallengeError::Malformed(payload.to_string()))?;
    let pin = match object.get("pin") {
        Some(Value::String(pin)) => pin,
        Some(other) => return Err(ChallengeError::InvalidPin(other.to_string())),
        None => return Err(ChallengeError::MissingPin),
    };
    if !is_pin(pin) {
        return Err(ChallengeError::InvalidPin(pin.clone()));
    }
    Ok(pin.clone())
}
