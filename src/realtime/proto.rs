use chrono::{SecondsFormat, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope `type` tags understood by the meeting service.
pub mod message_type {
    pub const AUTH: &str = "AUTH";
    pub const MESSAGE: &str = "MESSAGE";
    pub const PING: &str = "PING";
    pub const REQUEST_RECOGNITION: &str = "REQUEST_RECOGNITION";

    pub const CONNECTED: &str = "CONNECTED";
    pub const ERROR: &str = "ERROR";
    pub const USER_JOINED: &str = "USER_JOINED";
    pub const USER_LEFT: &str = "USER_LEFT";
    pub const PARTICIPANT_LIST: &str = "PARTICIPANT_LIST";
    pub const MEETING_ENDED: &str = "MEETING_ENDED";
    pub const PONG: &str = "PONG";

    /// Registry key matching every inbound envelope.
    pub const WILDCARD: &str = "*";
}

const UNKNOWN_ERROR: &str = "unknown error";

/// Wire message exchanged in both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Builds an outbound envelope stamped with the current UTC time.
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Some(now_timestamp()),
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Full envelope as a JSON object, as handed to wildcard handlers.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::String(self.kind.clone()));
        object.insert("payload".to_string(), self.payload.clone());
        if let Some(timestamp) = &self.timestamp {
            object.insert("timestamp".to_string(), Value::String(timestamp.clone()));
        }
        Value::Object(object)
    }
}

/// ISO-8601 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// AUTH handshake payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: String,
    pub meeting_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ChatMessage {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(default, deserialize_with = "string_or_number")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
}

impl Participant {
    /// Two entries refer to the same attendee when their ids match, or
    /// their names match when either id is missing.
    pub fn same_as(&self, other: &Participant) -> bool {
        match (&self.user_id, &other.user_id) {
            (Some(left), Some(right)) => left == right,
            _ => self.user_name.is_some() && self.user_name == other.user_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ParticipantList {
    #[serde(default)]
    pub participants: Vec<Participant>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) => Some(id),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    })
}

/// Decodes a payload sent either inline or as a JSON-encoded string.
///
/// An empty string decodes as `{}`.
pub fn decode_payload<T>(payload: &Value) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned,
{
    match payload {
        Value::String(text) if text.trim().is_empty() => serde_json::from_str("{}"),
        Value::String(text) => serde_json::from_str(text),
        other => T::deserialize(other),
    }
}

/// Extracts the server error string from an ERROR payload.
pub fn error_detail(payload: &Value) -> String {
    let from_object = |value: &Value| {
        value
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let detail = match payload {
        Value::String(text) => serde_json::from_str::<Value>(text)
            .ok()
            .and_then(|value| from_object(&value))
            .or_else(|| (!text.trim().is_empty()).then(|| text.clone())),
        other => from_object(other),
    };
    detail.unwrap_or_else(|| UNKNOWN_ERROR.to_string())
}

/// Inbound envelope decoded into a known shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Connected,
    Error { error: String },
    Message(ChatMessage),
    UserJoined(Participant),
    UserLeft(Participant),
    ParticipantList(ParticipantList),
    MeetingEnded,
    Pong,
    /// Unknown type, or a known type whose payload did not fit its shape.
    Other(Envelope),
}

impl ServerEvent {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let payload = &envelope.payload;
        let decoded = match envelope.kind.as_str() {
            message_type::CONNECTED => Some(Self::Connected),
            message_type::ERROR => Some(Self::Error {
                error: error_detail(payload),
            }),
            message_type::MESSAGE => decode_payload(payload).ok().map(Self::Message),
            message_type::USER_JOINED => decode_payload(payload).ok().map(Self::UserJoined),
            message_type::USER_LEFT => decode_payload(payload).ok().map(Self::UserLeft),
            message_type::PARTICIPANT_LIST => {
                decode_payload(payload).ok().map(Self::ParticipantList)
            }
            message_type::MEETING_ENDED => Some(Self::MeetingEnded),
            message_type::PONG => Some(Self::Pong),
            _ => None,
        };
        decoded.unwrap_or_else(|| Self::Other(envelope.clone()))
    }
}
