//! Host message protocol.
//!
//! On the wire every message is `{ "type", "messageId", "payload" }`. Inside
//! the engine it is an [`Envelope`] around the exhaustive [`Message`] enum;
//! unknown types are rejected when parsing rather than ignored.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::session::ActivitySession;
use crate::types::{ActivityKey, MessageId};

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },

    #[error("invalid message id: {0}")]
    InvalidMessageId(String),

    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageType {
    Enable,
    Disable,
    SetBlocklist,
    SessionFinalized,
    SessionHeartbeatSnapshot,
    StatusQuery,
    StatusReport,
}

impl MessageType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enable => "ENABLE",
            Self::Disable => "DISABLE",
            Self::SetBlocklist => "SET_BLOCKLIST",
            Self::SessionFinalized => "SESSION_FINALIZED",
            Self::SessionHeartbeatSnapshot => "SESSION_HEARTBEAT_SNAPSHOT",
            Self::StatusQuery => "STATUS_QUERY",
            Self::StatusReport => "STATUS_REPORT",
        }
    }

    /// Delivery class. Critical messages are retried, routine ones are best effort.
    pub const fn class(self) -> MessageClass {
        match self {
            Self::Enable | Self::Disable | Self::SetBlocklist | Self::SessionFinalized => {
                MessageClass::Critical
            }
            Self::SessionHeartbeatSnapshot | Self::StatusQuery | Self::StatusReport => {
                MessageClass::Routine
            }
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENABLE" => Ok(Self::Enable),
            "DISABLE" => Ok(Self::Disable),
            "SET_BLOCKLIST" => Ok(Self::SetBlocklist),
            "SESSION_FINALIZED" => Ok(Self::SessionFinalized),
            "SESSION_HEARTBEAT_SNAPSHOT" => Ok(Self::SessionHeartbeatSnapshot),
            "STATUS_QUERY" => Ok(Self::StatusQuery),
            "STATUS_REPORT" => Ok(Self::StatusReport),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageClass {
    Critical,
    Routine,
}

/// Circuit breaker state as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStateKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health snapshot answered to `STATUS_QUERY`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub circuit_state: CircuitStateKind,
    pub queue_depth: usize,
    /// Seconds since the current session's last heartbeat; `None` when idle.
    pub last_heartbeat_age_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_session: Option<ActivitySession>,
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct BlocklistPayload {
    keys: Vec<ActivityKey>,
}

/// A host message, one variant per wire type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Enable,
    Disable,
    SetBlocklist { keys: Vec<ActivityKey> },
    SessionFinalized(ActivitySession),
    SessionHeartbeatSnapshot(ActivitySession),
    StatusQuery,
    StatusReport(StatusReport),
}

impl Message {
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::Enable => MessageType::Enable,
            Self::Disable => MessageType::Disable,
            Self::SetBlocklist { .. } => MessageType::SetBlocklist,
            Self::SessionFinalized(_) => MessageType::SessionFinalized,
            Self::SessionHeartbeatSnapshot(_) => MessageType::SessionHeartbeatSnapshot,
            Self::StatusQuery => MessageType::StatusQuery,
            Self::StatusReport(_) => MessageType::StatusReport,
        }
    }

    pub const fn class(&self) -> MessageClass {
        self.kind().class()
    }

    /// Key under which pending posts replace one another.
    ///
    /// `ENABLE` and `DISABLE` share a key so only the latest state is sent.
    pub fn coalesce_key(&self) -> String {
        match self {
            Self::Enable | Self::Disable => "ENABLE_STATE".to_string(),
            Self::SetBlocklist { .. } => "SET_BLOCKLIST".to_string(),
            Self::SessionFinalized(session) => format!("SESSION_FINALIZED:{}", session.id),
            Self::SessionHeartbeatSnapshot(_) => "SESSION_HEARTBEAT_SNAPSHOT".to_string(),
            Self::StatusQuery | Self::StatusReport(_) => "STATUS".to_string(),
        }
    }

    fn payload(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Enable | Self::Disable | Self::StatusQuery => Ok(Value::Null),
            Self::SetBlocklist { keys } => serde_json::to_value(BlocklistPayload { keys: keys.clone() }),
            Self::SessionFinalized(session) | Self::SessionHeartbeatSnapshot(session) => {
                serde_json::to_value(session)
            }
            Self::StatusReport(report) => serde_json::to_value(report),
        }
    }

    fn from_payload(kind: MessageType, payload: Value) -> Result<Self, ProtocolError> {
        match kind {
            MessageType::Enable => empty(kind, &payload).map(|()| Self::Enable),
            MessageType::Disable => empty(kind, &payload).map(|()| Self::Disable),
            MessageType::StatusQuery => empty(kind, &payload).map(|()| Self::StatusQuery),
            MessageType::SetBlocklist => {
                decode::<BlocklistPayload>(kind, payload).map(|p| Self::SetBlocklist { keys: p.keys })
            }
            MessageType::SessionFinalized => decode(kind, payload).map(Self::SessionFinalized),
            MessageType::SessionHeartbeatSnapshot => {
                decode(kind, payload).map(Self::SessionHeartbeatSnapshot)
            }
            MessageType::StatusReport => decode(kind, payload).map(Self::StatusReport),
        }
    }
}

fn empty(kind: MessageType, payload: &Value) -> Result<(), ProtocolError> {
    match payload {
        Value::Null => Ok(()),
        Value::Object(map) if map.is_empty() => Ok(()),
        other => Err(ProtocolError::InvalidPayload {
            kind,
            reason: format!("expected an empty payload, got {other}"),
        }),
    }
}

fn decode<T: DeserializeOwned>(kind: MessageType, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

/// Untyped wire form of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: String,
    #[serde(default)]
    pub payload: Value,
}

/// A typed message with its delivery ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: MessageId,
    pub message: Message,
}

impl Envelope {
    /// Wraps a message under a fresh ID.
    pub fn new(message: Message) -> Self {
        Self {
            message_id: MessageId::generate(),
            message,
        }
    }

    pub const fn kind(&self) -> MessageType {
        self.message.kind()
    }

    pub const fn class(&self) -> MessageClass {
        self.message.class()
    }

    pub fn coalesce_key(&self) -> String {
        self.message.coalesce_key()
    }

    /// Parses a JSON envelope.
    pub fn parse(json: &str) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_str(json)?;
        Self::try_from(wire)
    }

    pub fn to_wire(&self) -> Result<WireEnvelope, ProtocolError> {
        Ok(WireEnvelope {
            kind: self.kind().as_str().to_string(),
            message_id: self.message_id.to_string(),
            payload: self.message.payload()?,
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(&self.to_wire()?)?)
    }
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let kind: MessageType = wire.kind.parse()?;
        let message_id =
            MessageId::new(wire.message_id).map_err(|e| ProtocolError::InvalidMessageId(e.to_string()))?;
        let message = Message::from_payload(kind, wire.payload)?;
        Ok(Self {
            message_id,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TimezoneContext;
    use chrono::{DateTime, Utc};

    fn session() -> ActivitySession {
        let start = DateTime::parse_from_rfc3339("2025-06-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        ActivitySession::open(ActivityKey::new("a.com").unwrap(), start, TimezoneContext::utc())
    }

    #[test]
    fn parses_blocklist() {
        let envelope =
            Envelope::parse(r#"{"type":"SET_BLOCKLIST","messageId":"m1","payload":{"keys":["x.com","y.com"]}}"#)
                .unwrap();
        assert_eq!(envelope.message_id.as_str(), "m1");
        assert_eq!(
            envelope.message,
            Message::SetBlocklist {
                keys: vec![ActivityKey::new("x.com").unwrap(), ActivityKey::new("y.com").unwrap()]
            }
        );
        assert_eq!(envelope.class(), MessageClass::Critical);
    }

    #[test]
    fn empty_payloads_accept_null_missing_or_empty_object() {
        for json in [
            r#"{"type":"ENABLE","messageId":"m1"}"#,
            r#"{"type":"ENABLE","messageId":"m1","payload":null}"#,
            r#"{"type":"ENABLE","messageId":"m1","payload":{}}"#,
        ] {
            assert_eq!(Envelope::parse(json).unwrap().message, Message::Enable);
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = Envelope::parse(r#"{"type":"DELETE_ALL","messageId":"m1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "DELETE_ALL"));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let err = Envelope::parse(r#"{"type":"SET_BLOCKLIST","messageId":"m1","payload":{"keys":[""]}}"#)
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPayload {
                kind: MessageType::SetBlocklist,
                ..
            }
        ));

        let err = Envelope::parse(r#"{"type":"DISABLE","messageId":"m1","payload":[1]}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn empty_message_id_is_rejected() {
        let err = Envelope::parse(r#"{"type":"ENABLE","messageId":" "}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessageId(_)));
    }

    #[test]
    fn finalized_session_survives_the_wire() {
        let envelope = Envelope::new(Message::SessionFinalized(session()));
        let parsed = Envelope::parse(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn classification_and_coalescing() {
        assert_eq!(Message::Enable.coalesce_key(), Message::Disable.coalesce_key());
        assert_eq!(Message::StatusQuery.class(), MessageClass::Routine);
        assert_eq!(
            Message::SessionHeartbeatSnapshot(session()).class(),
            MessageClass::Routine
        );
        let s = session();
        assert_eq!(
            Message::SessionFinalized(s.clone()).coalesce_key(),
            format!("SESSION_FINALIZED:{}", s.id)
        );
    }

    #[test]
    fn status_report_uses_camel_case() {
        let report = StatusReport {
            circuit_state: CircuitStateKind::HalfOpen,
            queue_depth: 2,
            last_heartbeat_age_seconds: Some(4),
            current_session: None,
            degraded: false,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["circuitState"], "half_open");
        assert_eq!(json["queueDepth"], 2);
        assert_eq!(json["lastHeartbeatAgeSeconds"], 4);
        assert!(json.get("currentSession").is_none());

        insta::assert_snapshot!(
            serde_json::to_string(&report).unwrap(),
            @r#"{"circuitState":"half_open","queueDepth":2,"lastHeartbeatAgeSeconds":4,"degraded":false}"#
        );
    }
}
