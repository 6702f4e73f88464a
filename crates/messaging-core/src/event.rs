use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Current state of a chat session as reported by `chat_session_status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatSessionState {
    /// Waiting in the queue for an agent.
    Queued,
    /// An agent is being connected.
    Connecting,
    /// An agent is connected.
    Connected,
    /// The session is handled by an IVR scenario.
    Ivr,
    /// The session failed; the client should assume it no longer exists.
    Failed,
    /// The session completed normally.
    Completed,
}

/// Kind of party taking part in a chat session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PartyType {
    /// Server-side scenario.
    Scenario,
    /// External (client) party.
    External,
    /// Internal (agent) party.
    Internal,
}

/// Which side of the conversation may originate an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDirection {
    ServerToClient,
    ClientToServer,
    Bidirectional,
}

/// Wire discriminator of an event payload (the `event` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStatus,
    CaseSet,
    Message,
    MessageDelivered,
    MessageRead,
    PartyJoined,
    PartyLeft,
    Typing,
    NotTyping,
    Location,
    TimeoutWarning,
    InactivityTimeout,
    SessionEnded,
    Disconnect,
    End,
    /// Missing or unrecognized discriminator. Never produces an event.
    Unknown,
}

impl EventKind {
    pub const ALL: [EventKind; 15] = [
        EventKind::SessionStatus,
        EventKind::CaseSet,
        EventKind::Message,
        EventKind::MessageDelivered,
        EventKind::MessageRead,
        EventKind::PartyJoined,
        EventKind::PartyLeft,
        EventKind::Typing,
        EventKind::NotTyping,
        EventKind::Location,
        EventKind::TimeoutWarning,
        EventKind::InactivityTimeout,
        EventKind::SessionEnded,
        EventKind::Disconnect,
        EventKind::End,
    ];

    pub fn from_wire(tag: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_wire() == tag)
            .unwrap_or(Self::Unknown)
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            Self::SessionStatus => "chat_session_status",
            Self::CaseSet => "chat_session_case_set",
            Self::Message => "chat_session_message",
            Self::MessageDelivered => "chat_session_message_delivered",
            Self::MessageRead => "chat_session_message_read",
            Self::PartyJoined => "chat_session_party_joined",
            Self::PartyLeft => "chat_session_party_left",
            Self::Typing => "chat_session_typing",
            Self::NotTyping => "chat_session_not_typing",
            Self::Location => "chat_session_location",
            Self::TimeoutWarning => "chat_session_timeout_warning",
            Self::InactivityTimeout => "chat_session_inactivity_timeout",
            Self::SessionEnded => "chat_session_ended",
            Self::Disconnect => "chat_session_disconnect",
            Self::End => "chat_session_end",
            Self::Unknown => "unknown",
        }
    }
}

/// Events exchanged with the contact center, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum ContactCenterEvent {
    /// A chat message. Client party ID always matches the chat ID.
    MessageReceived {
        message_id: Option<String>,
        party_id: Option<String>,
        message: String,
        timestamp: Option<DateTime<Utc>>,
    },
    /// A message has been delivered to a party.
    MessageDelivered {
        message_id: String,
        party_id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// A message has been read by a party.
    MessageRead {
        message_id: String,
        party_id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Session state update. `Failed` means the session no longer exists.
    SessionStatus {
        state: ChatSessionState,
        estimated_wait_seconds: u32,
    },
    /// A CRM case was set (or cleared when `case_id` is `None`).
    CaseSet {
        case_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// A party (usually an agent) joined the session.
    PartyJoined {
        party_id: String,
        first_name: Option<String>,
        last_name: Option<String>,
        display_name: Option<String>,
        party_type: PartyType,
        timestamp: DateTime<Utc>,
    },
    PartyLeft {
        party_id: String,
        timestamp: DateTime<Utc>,
    },
    Typing {
        party_id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    NotTyping {
        party_id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// A geographic location shared by a party.
    Location {
        party_id: Option<String>,
        url: Option<String>,
        latitude: f64,
        longitude: f64,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Message to display, typically an inactivity warning.
    TimeoutWarning {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// The session was ended because of user inactivity.
    InactivityTimeout {
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Normal termination; the session no longer exists.
    SessionEnded,
    /// Client ends the current conversation but keeps the session open.
    Disconnect,
    /// Client ends the session.
    End,
}

impl ContactCenterEvent {
    /// Build an outgoing chat message with a fresh message ID.
    pub fn outgoing_message(message: impl Into<String>) -> Self {
        Self::MessageReceived {
            message_id: Some(Uuid::new_v4().to_string()),
            party_id: None,
            message: message.into(),
            timestamp: None,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::MessageReceived { .. } => EventKind::Message,
            Self::MessageDelivered { .. } => EventKind::MessageDelivered,
            Self::MessageRead { .. } => EventKind::MessageRead,
            Self::SessionStatus { .. } => EventKind::SessionStatus,
            Self::CaseSet { .. } => EventKind::CaseSet,
            Self::PartyJoined { .. } => EventKind::PartyJoined,
            Self::PartyLeft { .. } => EventKind::PartyLeft,
            Self::Typing { .. } => EventKind::Typing,
            Self::NotTyping { .. } => EventKind::NotTyping,
            Self::Location { .. } => EventKind::Location,
            Self::TimeoutWarning { .. } => EventKind::TimeoutWarning,
            Self::InactivityTimeout { .. } => EventKind::InactivityTimeout,
            Self::SessionEnded => EventKind::SessionEnded,
            Self::Disconnect => EventKind::Disconnect,
            Self::End => EventKind::End,
        }
    }

    pub fn direction(&self) -> EventDirection {
        match self {
            Self::MessageReceived { .. }
            | Self::MessageDelivered { .. }
            | Self::MessageRead { .. }
            | Self::Typing { .. }
            | Self::NotTyping { .. }
            | Self::Location { .. } => EventDirection::Bidirectional,
            Self::Disconnect | Self::End => EventDirection::ClientToServer,
            _ => EventDirection::ServerToClient,
        }
    }

    /// Whether this event means the session is gone and must stop being polled.
    pub fn ends_session(&self) -> bool {
        matches!(self, Self::SessionEnded)
    }

    /// Render the event in its wire shape, discriminated by the `event` field.
    pub fn to_wire(&self) -> Value {
        let mut body = Map::new();
        body.insert("event".into(), json!(self.kind().as_wire()));
        let mut put = |key: &str, value: Value| {
            if !value.is_null() {
                body.insert(key.to_owned(), value);
            }
        };

        match self {
            Self::MessageReceived {
                message_id,
                party_id,
                message,
                timestamp,
            } => {
                put("msg_id", json!(message_id));
                put("party_id", json!(party_id));
                put("msg", json!(message));
                put("timestamp", wire_timestamp(timestamp.as_ref()));
            }
            Self::MessageDelivered {
                message_id,
                party_id,
                timestamp,
            } => {
                put("msg_id", json!(message_id));
                put("party_id", json!(party_id));
                put("timestamp", wire_timestamp(timestamp.as_ref()));
            }
            Self::MessageRead {
                message_id,
                party_id,
                timestamp,
            } => {
                put("ref_msg_id", json!(message_id));
                put("party_id", json!(party_id));
                put("timestamp", wire_timestamp(timestamp.as_ref()));
            }
            Self::SessionStatus {
                state,
                estimated_wait_seconds,
            } => {
                put("state", json!(state));
                put("ewt", json!(estimated_wait_seconds.to_string()));
            }
            Self::CaseSet { case_id, timestamp } => {
                put("case_id", json!(case_id));
                put("timestamp", wire_timestamp(Some(timestamp)));
            }
            Self::PartyJoined {
                party_id,
                first_name,
                last_name,
                display_name,
                party_type,
                timestamp,
            } => {
                put("party_id", json!(party_id));
                put("first_name", json!(first_name));
                put("last_name", json!(last_name));
                put("display_name", json!(display_name));
                put("type", json!(party_type));
                put("timestamp", wire_timestamp(Some(timestamp)));
            }
            Self::PartyLeft {
                party_id,
                timestamp,
            } => {
                put("party_id", json!(party_id));
                put("timestamp", wire_timestamp(Some(timestamp)));
            }
            Self::Typing {
                party_id,
                timestamp,
            }
            | Self::NotTyping {
                party_id,
                timestamp,
            } => {
                put("party_id", json!(party_id));
                put("timestamp", wire_timestamp(timestamp.as_ref()));
            }
            Self::Location {
                party_id,
                url,
                latitude,
                longitude,
                timestamp,
            } => {
                put("party_id", json!(party_id));
                put("url", json!(url));
                put("latitude", json!(latitude.to_string()));
                put("longitude", json!(longitude.to_string()));
                put("timestamp", wire_timestamp(timestamp.as_ref()));
            }
            Self::TimeoutWarning { message, timestamp }
            | Self::InactivityTimeout { message, timestamp } => {
                put("msg", json!(message));
                put("timestamp", wire_timestamp(Some(timestamp)));
            }
            Self::SessionEnded | Self::Disconnect | Self::End => {}
        }

        Value::Object(body)
    }
}

/// Render the `{"events": [...]}` envelope accepted by the events endpoint.
pub fn encode_events(events: &[ContactCenterEvent]) -> Value {
    json!({ "events": events.iter().map(ContactCenterEvent::to_wire).collect::<Vec<_>>() })
}

fn wire_timestamp(timestamp: Option<&DateTime<Utc>>) -> Value {
    match timestamp {
        Some(ts) if ts.timestamp_subsec_millis() == 0 => json!(ts.timestamp()),
        Some(ts) => json!(ts.timestamp_millis() as f64 / 1000.0),
        None => Value::Null,
    }
}
