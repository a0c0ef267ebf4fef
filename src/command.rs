use serde_json::Value;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ArmHome,
    ArmAway,
    DeactivateRequest,
    /// Carries the raw payload; the pin is extracted when the command is
    /// applied so that a malformed response aborts without a state change.
    Deactivate(String),
    Disarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    ArmHome,
    ArmAway,
    DeactivateRequest,
    Deactivate,
    Disarm,
}

impl FromStr for Token {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ARM_HOME" => Ok(Token::ArmHome),
            "ARM_AWAY" => Ok(Token::ArmAway),
            "DEACTIVATE_REQUEST" => Ok(Token::DeactivateRequest),
            "DEACTIVATE" => Ok(Token::Deactivate),
            "DISARM" => Ok(Token::Disarm),
            _ => Err(()),
        }
    }
}

impl Command {
    /// Plain payloads must equal a command token exactly (surrounding
    /// whitespace aside). JSON objects select a command with a `command`
    /// field; an object carrying only a `pin` is a `DEACTIVATE` response.
    pub fn parse(payload: &str) -> Option<Command> {
        let text = payload.trim();
        if let Ok(token) = text.parse::<Token>() {
            return Some(Command::from_token(token, payload));
        }
        let value: Value = serde_json::from_str(text).ok()?;
        let object = value.as_object()?;
        match object.get("command") {
            Some(Value::String(name)) => {
                let token = name.parse::<Token>().ok()?;
                Some(Command::from_token(token, payload))
            }
            Some(_) => None,
            None if object.contains_key("pin") => Some(Command::Deactivate(payload.to_string())),
            None => None,
        }
    }

    fn from_token(token: Token, payload: &str) -> Command {
        match token {
            Token::ArmHome => Command::ArmHome,
            Token::ArmAway => Command::ArmAway,
            Token::DeactivateRequest => Command::DeactivateRequest,
            Token::Deactivate => Command::Deactivate(payload.to_string()),
            Token::Disarm => Command::Disarm,
        }
    }
}
