use serde::Deserialize;
use thiserror::Error;

use crate::{
    topics::{home_topic, object_topic, TOPIC_COMMANDS},
    types::OperatingMode,
};

pub const MAX_PAYLOAD: usize = 256;

pub const CMD_OPEN: &str = "open";
pub const CMD_CLOSE: &str = "close";
pub const CMD_SET_MODE: &str = "set_mode";
pub const CMD_QUERY_OBJECTS: &str = "query_objects";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open,
    Close,
    SetMode(OperatingMode),
    QueryObjects,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte limit")]
    Oversized(usize),
    #[error("malformed command payload: {0}")]
    Malformed(String),
    #[error("set_mode without a recognised mode")]
    InvalidMode,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModeValue {
    Code(u8),
    Name(String),
}

impl ModeValue {
    fn resolve(&self) -> Option<OperatingMode> {
        match self {
            Self::Code(code) => OperatingMode::from_code(*code),
            Self::Name(name) => OperatingMode::parse(name),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommandEnvelope {
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    mode: Option<ModeValue>,
}

/// Decodes one inbound message. Device commands are only honoured on the
/// device's own topic and `query_objects` only on the shared one; anything
/// else yields `Ok(None)`.
pub fn parse_command(
    topic: &str,
    payload: &[u8],
    device_ip: &str,
) -> Result<Option<Command>, ProtocolError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(ProtocolError::Oversized(payload.len()));
    }

    let is_object = topic == object_topic(TOPIC_COMMANDS, device_ip);
    let is_home = topic == home_topic(TOPIC_COMMANDS);
    if !is_object && !is_home {
        return Ok(None);
    }

    let envelope: CommandEnvelope = serde_json::from_slice(payload)
        .map_err(|err| ProtocolError::Malformed(err.to_string()))?;

    let command = match (is_object, envelope.cmd.as_str()) {
        (true, CMD_OPEN) => Some(Command::Open),
        (true, CMD_CLOSE) => Some(Command::Close),
        (true, CMD_SET_MODE) => {
            let mode = envelope
                .mode
                .as_ref()
                .and_then(ModeValue::resolve)
                .ok_or(ProtocolError::InvalidMode)?;
            Some(Command::SetMode(mode))
        }
        (false, CMD_QUERY_OBJECTS) => Some(Command::QueryObjects),
        _ => None,
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: &str = "192.168.1.40";
    const OBJECT: &str = "/IOT3/COMMANDS/192.168.1.40";
    const HOME: &str = "/IOT3/COMMANDS";

    #[test]
    fn object_topic_carries_device_commands() {
        assert_eq!(
            parse_command(OBJECT, br#"{"cmd":"open"}"#, IP),
            Ok(Some(Command::Open))
        );
        assert_eq!(
            parse_command(OBJECT, br#"{"cmd":"close"}"#, IP),
            Ok(Some(Command::Close))
        );
        assert_eq!(
            parse_command(OBJECT, br#"{"cmd":"set_mode","mode":2}"#, IP),
            Ok(Some(Command::SetMode(OperatingMode::Automatic)))
        );
        assert_eq!(
            parse_command(OBJECT, br#"{"cmd":"set_mode","mode":"Manual"}"#, IP),
            Ok(Some(Command::SetMode(OperatingMode::Manual)))
        );
    }

    #[test]
    fn query_is_only_accepted_on_home_topic() {
        assert_eq!(
            parse_command(HOME, br#"{"cmd":"query_objects"}"#, IP),
            Ok(Some(Command::QueryObjects))
        );
        assert_eq!(
            parse_command(OBJECT, br#"{"cmd":"query_objects"}"#, IP),
            Ok(None)
        );
        assert_eq!(parse_command(HOME, br#"{"cmd":"open"}"#, IP), Ok(None));
    }

    #[test]
    fn other_devices_and_topics_are_ignored() {
        assert_eq!(
            parse_command("/IOT3/COMMANDS/10.0.0.9", br#"{"cmd":"open"}"#, IP),
            Ok(None)
        );
        assert_eq!(parse_command("/IOT3/STATES", b"not json", IP), Ok(None));
    }

    #[test]
    fn bad_payloads_are_reported() {
        assert!(matches!(
            parse_command(OBJECT, b"{open", IP),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            parse_command(OBJECT, br#"{"cmd":"set_mode","mode":7}"#, IP),
            Err(ProtocolError::InvalidMode)
        );
        assert_eq!(
            parse_command(OBJECT, br#"{"cmd":"set_mode"}"#, IP),
            Err(ProtocolError::InvalidMode)
        );
        let big = vec![b' '; MAX_PAYLOAD + 1];
        assert_eq!(
            parse_command(OBJECT, &big, IP),
            Err(ProtocolError::Oversized(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn unknown_command_is_ignored() {
        assert_eq!(parse_command(OBJECT, br#"{"cmd":"dance"}"#, IP), Ok(None));
        assert_eq!(parse_command(OBJECT, br#"{}"#, IP), Ok(None));
    }
}
