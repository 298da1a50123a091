//! OneBot message views
//!
//! The relay never interprets messages fully. It only looks at a handful of
//! fields:
//!
//! | Field                                      | Used for                      |
//! |--------------------------------------------|-------------------------------|
//! | `group_id` (events) / `params.group_id`    | authorization filter          |
//! | `post_type`, `meta_event_type`, `sub_type` | lifecycle / heartbeat detect  |
//! | `self_id`, `time`                          | bot identity, liveness        |
//! | `echo`                                     | response correlation          |
//!
//! Anything that is not a JSON object is rejected as malformed.

use serde_json::{json, Map, Value};
use thiserror::Error;

use super::frame::Frame;

/// Error for messages the relay refuses to interpret
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Payload is not a JSON object
    #[error("payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),

    /// A field the relay inspects holds a value it cannot use
    #[error("field `{field}` has an unusable value: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// Correlation token carried in `echo`
///
/// Strings are used verbatim; any other JSON value is keyed by its compact
/// JSON text so that numeric echoes round-trip as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Echo(String);

impl Echo {
    /// Create a token from a string
    pub fn new(token: impl Into<String>) -> Self {
        Echo(token.into())
    }

    /// Extract a token from a JSON value; `null` and `""` carry none
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(Echo(s.clone())),
            other => Some(Echo(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Echo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of upstream event, as far as the relay cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `meta_event` / `lifecycle` / `connect`
    LifecycleConnect,
    /// `meta_event` / `heartbeat`
    Heartbeat,
    /// Everything else (messages, notices, API responses, ...)
    Other,
}

/// View of a message received from the upstream endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub group_id: Option<i64>,
    pub self_id: Option<i64>,
    pub time: Option<i64>,
    pub echo: Option<Echo>,
}

impl Event {
    /// Parse the inspected fields of an upstream frame
    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        let object = parse_object(frame)?;

        let post_type = str_field(&object, "post_type");
        let kind = match (
            post_type,
            str_field(&object, "meta_event_type"),
            str_field(&object, "sub_type"),
        ) {
            (Some("meta_event"), Some("lifecycle"), Some("connect")) => EventKind::LifecycleConnect,
            (Some("meta_event"), Some("heartbeat"), _) => EventKind::Heartbeat,
            _ => EventKind::Other,
        };

        Ok(Self {
            kind,
            group_id: group_id(object.get("group_id"))?,
            self_id: object.get("self_id").and_then(lenient_i64),
            time: object.get("time").and_then(lenient_i64),
            echo: object.get("echo").and_then(Echo::from_value),
        })
    }
}

/// View of a command (API call) sent by a consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub action: Option<String>,
    pub group_id: Option<i64>,
    pub echo: Option<Echo>,
}

impl Command {
    /// Parse the inspected fields of a consumer frame
    ///
    /// Commands carry their target group under `params.group_id`, not at
    /// the top level like events do.
    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        let object = parse_object(frame)?;

        let group = object
            .get("params")
            .and_then(Value::as_object)
            .and_then(|params| params.get("group_id"));

        Ok(Self {
            action: str_field(&object, "action").map(str::to_owned),
            group_id: group_id(group)?,
            echo: object.get("echo").and_then(Echo::from_value),
        })
    }
}

/// Build the `lifecycle/connect` event sent to consumers joining late
pub fn lifecycle_connect(bot_id: i64, time: i64) -> Frame {
    let event = json!({
        "time": time,
        "self_id": bot_id,
        "post_type": "meta_event",
        "meta_event_type": "lifecycle",
        "sub_type": "connect",
    });
    Frame::text(event.to_string())
}

fn parse_object(frame: &Frame) -> Result<Map<String, Value>, ProtocolError> {
    Ok(serde_json::from_slice(frame.payload())?)
}

fn str_field<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    object.get(key).and_then(Value::as_str)
}

/// Group ids arrive as numbers or numeric strings; empty means absent
fn group_id(value: Option<&Value>) -> Result<Option<i64>, ProtocolError> {
    let invalid = |value: &Value| ProtocolError::InvalidField {
        field: "group_id",
        value: value.to_string(),
    };

    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v @ Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| invalid(v)),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(v @ Value::String(s)) => s.trim().parse().map(Some).map_err(|_| invalid(v)),
        Some(other) => Err(invalid(other)),
    }
}

fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lifecycle_connect() {
        let frame = Frame::text(
            r#"{"post_type":"meta_event","meta_event_type":"lifecycle","sub_type":"connect","self_id":123,"time":1000}"#,
        );
        let event = Event::parse(&frame).unwrap();

        assert_eq!(event.kind, EventKind::LifecycleConnect);
        assert_eq!(event.self_id, Some(123));
        assert_eq!(event.time, Some(1000));
        assert_eq!(event.group_id, None);
        assert_eq!(event.echo, None);
    }

    #[test]
    fn test_parse_lifecycle_other_subtype_is_not_connect() {
        let frame = Frame::text(
            r#"{"post_type":"meta_event","meta_event_type":"lifecycle","sub_type":"enable"}"#,
        );
        assert_eq!(Event::parse(&frame).unwrap().kind, EventKind::Other);
    }

    #[test]
    fn test_parse_heartbeat_with_string_numbers() {
        let frame = Frame::text(
            r#"{"post_type":"meta_event","meta_event_type":"heartbeat","self_id":"42","time":"1700000000"}"#,
        );
        let event = Event::parse(&frame).unwrap();

        assert_eq!(event.kind, EventKind::Heartbeat);
        assert_eq!(event.self_id, Some(42));
        assert_eq!(event.time, Some(1_700_000_000));
    }

    #[test]
    fn test_parse_group_message() {
        let frame = Frame::text(r#"{"post_type":"message","group_id":"555","raw_message":"hi"}"#);
        let event = Event::parse(&frame).unwrap();

        assert_eq!(event.kind, EventKind::Other);
        assert_eq!(event.group_id, Some(555));
    }

    #[test]
    fn test_parse_empty_group_id_is_absent() {
        let frame = Frame::text(r#"{"group_id":""}"#);
        assert_eq!(Event::parse(&frame).unwrap().group_id, None);

        let frame = Frame::text(r#"{"group_id":null}"#);
        assert_eq!(Event::parse(&frame).unwrap().group_id, None);
    }

    #[test]
    fn test_parse_non_numeric_group_id_is_malformed() {
        let frame = Frame::text(r#"{"group_id":"abc"}"#);
        let err = Event::parse(&frame).unwrap_err();

        assert!(matches!(err, ProtocolError::InvalidField { field: "group_id", .. }));
    }

    #[test]
    fn test_parse_non_object_is_malformed() {
        assert!(Event::parse(&Frame::text("[1,2,3]")).is_err());
        assert!(Event::parse(&Frame::text("not json")).is_err());
        assert!(Command::parse(&Frame::text("42")).is_err());
    }

    #[test]
    fn test_parse_command_reads_params_group_id() {
        let frame = Frame::text(r#"{"action":"send_msg","params":{"group_id":555},"echo":"abc"}"#);
        let command = Command::parse(&frame).unwrap();

        assert_eq!(command.action.as_deref(), Some("send_msg"));
        assert_eq!(command.group_id, Some(555));
        assert_eq!(command.echo, Some(Echo::new("abc")));
    }

    #[test]
    fn test_parse_command_ignores_top_level_group_id() {
        let frame = Frame::text(r#"{"action":"get_status","group_id":555}"#);
        let command = Command::parse(&frame).unwrap();

        assert_eq!(command.group_id, None);
        assert_eq!(command.echo, None);
    }

    #[test]
    fn test_echo_canonical_forms() {
        assert_eq!(Echo::from_value(&json!("abc")), Some(Echo::new("abc")));
        assert_eq!(Echo::from_value(&json!(17)), Some(Echo::new("17")));
        assert_eq!(
            Echo::from_value(&json!({"seq": 1})),
            Some(Echo::new(r#"{"seq":1}"#))
        );
        assert_eq!(Echo::from_value(&json!("")), None);
        assert_eq!(Echo::from_value(&Value::Null), None);
    }

    #[test]
    fn test_binary_frames_are_parsed_too() {
        let frame = Frame::binary(bytes::Bytes::from_static(br#"{"echo":"b1"}"#));
        assert_eq!(Event::parse(&frame).unwrap().echo, Some(Echo::new("b1")));
    }

    #[test]
    fn test_lifecycle_connect_round_trips() {
        let frame = lifecycle_connect(123, 1000);
        let event = Event::parse(&frame).unwrap();

        assert_eq!(event.kind, EventKind::LifecycleConnect);
        assert_eq!(event.self_id, Some(123));
        assert_eq!(event.time, Some(1000));
    }
}
