//! Two-pass decoding of heterogeneous event batches.
//!
//! The first pass reads only the `event` discriminator of every payload; the
//! second pass parses each payload with the parser registered for its tag.
//! A payload that fails to parse is dropped without affecting its siblings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::value::RawValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    error::ContactCenterError,
    event::{ChatSessionState, ContactCenterEvent, EventKind, PartyType},
};

/// One not-yet-typed event payload, kept as the exact JSON text received.
pub type RawEvent = Box<RawValue>;

/// Body of an events response: `{"events": [...]}`.
#[derive(Debug, Deserialize)]
pub struct EventsEnvelope {
    #[serde(default)]
    pub events: Vec<RawEvent>,
}

impl EventsEnvelope {
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// A payload paired with the discriminator read in the tag pass.
#[derive(Debug, Clone, Copy)]
pub struct TaggedEvent<'a> {
    pub kind: EventKind,
    pub raw: &'a RawValue,
}

/// Failure to parse a single payload into its registered shape.
#[derive(Debug, Error)]
pub enum ItemDecodeError {
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("payload matches neither server ({server}) nor client ({client}) message shape")]
    MessageShape {
        server: serde_json::Error,
        client: serde_json::Error,
    },
}

type EventParser = fn(&RawValue) -> Result<ContactCenterEvent, ItemDecodeError>;

/// Decode a batch, preserving order and dropping unknown or malformed items.
///
/// Returns `DecodeFailed` only when the batch is non-empty and every item
/// failed to parse.
pub fn decode_events(batch: &[RawEvent]) -> Result<Vec<ContactCenterEvent>, ContactCenterError> {
    decode_tagged(&tag_events(batch))
}

/// Tag pass: read the discriminator of every payload without parsing the rest.
pub fn tag_events(batch: &[RawEvent]) -> Vec<TaggedEvent<'_>> {
    batch
        .iter()
        .map(|raw| TaggedEvent {
            kind: read_tag(raw),
            raw,
        })
        .collect()
}

/// Payload pass over already tagged items.
pub fn decode_tagged(tagged: &[TaggedEvent<'_>]) -> Result<Vec<ContactCenterEvent>, ContactCenterError> {
    let mut events = Vec::with_capacity(tagged.len());
    let mut causes = Vec::new();

    for (index, item) in tagged.iter().enumerate() {
        let Some(parser) = parser_for(item.kind) else {
            warn!(index, payload = item.raw.get(), "skipping event with unknown discriminator");
            continue;
        };

        match parser(item.raw) {
            Ok(event) => events.push(event),
            Err(err) => {
                warn!(index, event = item.kind.as_wire(), error = %err, "dropping malformed event");
                causes.push(format!("{}: {err}", item.kind.as_wire()));
            }
        }
    }

    if !tagged.is_empty() && causes.len() == tagged.len() {
        return Err(ContactCenterError::DecodeFailed { causes });
    }

    debug!(
        received = tagged.len(),
        decoded = events.len(),
        dropped = tagged.len() - events.len(),
        "decoded event batch"
    );
    Ok(events)
}

#[derive(Deserialize)]
struct TagProbe {
    #[serde(default)]
    event: Option<String>,
}

fn read_tag(raw: &RawValue) -> EventKind {
    match serde_json::from_str::<TagProbe>(raw.get()) {
        Ok(TagProbe { event: Some(tag) }) => EventKind::from_wire(&tag),
        Ok(TagProbe { event: None }) => EventKind::Unknown,
        Err(err) => {
            debug!(error = %err, "event payload has no readable discriminator");
            EventKind::Unknown
        }
    }
}

fn parser_for(kind: EventKind) -> Option<EventParser> {
    let parser: EventParser = match kind {
        EventKind::SessionStatus => parse_as::<SessionStatusDto>,
        EventKind::CaseSet => parse_as::<CaseSetDto>,
        EventKind::Message => parse_message,
        EventKind::MessageDelivered => parse_as::<MessageDeliveredDto>,
        EventKind::MessageRead => parse_as::<MessageReadDto>,
        EventKind::PartyJoined => parse_as::<PartyJoinedDto>,
        EventKind::PartyLeft => parse_as::<PartyLeftDto>,
        EventKind::Typing => |raw| {
            let dto = dto::<PresenceDto>(raw)?;
            Ok(ContactCenterEvent::Typing {
                party_id: dto.party_id,
                timestamp: dto.timestamp,
            })
        },
        EventKind::NotTyping => |raw| {
            let dto = dto::<PresenceDto>(raw)?;
            Ok(ContactCenterEvent::NotTyping {
                party_id: dto.party_id,
                timestamp: dto.timestamp,
            })
        },
        EventKind::Location => parse_as::<LocationDto>,
        EventKind::TimeoutWarning => |raw| {
            let dto = dto::<NoticeDto>(raw)?;
            Ok(ContactCenterEvent::TimeoutWarning {
                message: dto.msg,
                timestamp: dto.timestamp,
            })
        },
        EventKind::InactivityTimeout => |raw| {
            let dto = dto::<NoticeDto>(raw)?;
            Ok(ContactCenterEvent::InactivityTimeout {
                message: dto.msg,
                timestamp: dto.timestamp,
            })
        },
        EventKind::SessionEnded => |_| Ok(ContactCenterEvent::SessionEnded),
        EventKind::Disconnect => |_| Ok(ContactCenterEvent::Disconnect),
        EventKind::End => |_| Ok(ContactCenterEvent::End),
        EventKind::Unknown => return None,
    };
    Some(parser)
}

fn dto<D: DeserializeOwned>(raw: &RawValue) -> Result<D, serde_json::Error> {
    serde_json::from_str(raw.get())
}

fn parse_as<D>(raw: &RawValue) -> Result<ContactCenterEvent, ItemDecodeError>
where
    D: DeserializeOwned + Into<ContactCenterEvent>,
{
    Ok(dto::<D>(raw)?.into())
}

/// The message tag has a rich server shape and a lean client shape.
///
/// The server shape is tried first because the client shape is a subset of it
/// and would always match. Only a missing-field failure falls through.
fn parse_message(raw: &RawValue) -> Result<ContactCenterEvent, ItemDecodeError> {
    let server = match dto::<ServerMessageDto>(raw) {
        Ok(dto) => return Ok(dto.into()),
        Err(err) if is_missing_field(&err) => err,
        Err(err) => return Err(err.into()),
    };

    match dto::<ClientMessageDto>(raw) {
        Ok(dto) => Ok(dto.into()),
        Err(client) => Err(ItemDecodeError::MessageShape { server, client }),
    }
}

fn is_missing_field(err: &serde_json::Error) -> bool {
    err.is_data() && err.to_string().starts_with("missing field")
}

#[derive(Deserialize)]
struct ServerMessageDto {
    msg_id: String,
    party_id: String,
    msg: String,
    #[serde(deserialize_with = "wire::timestamp")]
    timestamp: DateTime<Utc>,
}

impl From<ServerMessageDto> for ContactCenterEvent {
    fn from(dto: ServerMessageDto) -> Self {
        Self::MessageReceived {
            message_id: Some(dto.msg_id),
            party_id: Some(dto.party_id),
            message: dto.msg,
            timestamp: Some(dto.timestamp),
        }
    }
}

#[derive(Deserialize)]
struct ClientMessageDto {
    msg_id: Option<String>,
    party_id: Option<String>,
    msg: String,
    #[serde(default, deserialize_with = "wire::optional_timestamp")]
    timestamp: Option<DateTime<Utc>>,
}

impl From<ClientMessageDto> for ContactCenterEvent {
    fn from(dto: ClientMessageDto) -> Self {
        Self::MessageReceived {
            message_id: dto.msg_id,
            party_id: dto.party_id,
            message: dto.msg,
            timestamp: dto.timestamp,
        }
    }
}

#[derive(Deserialize)]
struct MessageDeliveredDto {
    msg_id: String,
    party_id: Option<String>,
    #[serde(default, deserialize_with = "wire::optional_timestamp")]
    timestamp: Option<DateTime<Utc>>,
}

impl From<MessageDeliveredDto> for ContactCenterEvent {
    fn from(dto: MessageDeliveredDto) -> Self {
        Self::MessageDelivered {
            message_id: dto.msg_id,
            party_id: dto.party_id,
            timestamp: dto.timestamp,
        }
    }
}

#[derive(Deserialize)]
struct MessageReadDto {
    #[serde(alias = "msg_id")]
    ref_msg_id: String,
    party_id: Option<String>,
    #[serde(default, deserialize_with = "wire::optional_timestamp")]
    timestamp: Option<DateTime<Utc>>,
}

impl From<MessageReadDto> for ContactCenterEvent {
    fn from(dto: MessageReadDto) -> Self {
        Self::MessageRead {
            message_id: dto.ref_msg_id,
            party_id: dto.party_id,
            timestamp: dto.timestamp,
        }
    }
}

#[derive(Deserialize)]
struct SessionStatusDto {
    state: ChatSessionState,
    #[serde(deserialize_with = "wire::wait_seconds")]
    ewt: u32,
}

impl From<SessionStatusDto> for ContactCenterEvent {
    fn from(dto: SessionStatusDto) -> Self {
        Self::SessionStatus {
            state: dto.state,
            estimated_wait_seconds: dto.ewt,
        }
    }
}

#[derive(Deserialize)]
struct CaseSetDto {
    case_id: Option<String>,
    #[serde(deserialize_with = "wire::timestamp")]
    timestamp: DateTime<Utc>,
}

impl From<CaseSetDto> for ContactCenterEvent {
    fn from(dto: CaseSetDto) -> Self {
        Self::CaseSet {
            case_id: dto.case_id.filter(|id| !id.is_empty()),
            timestamp: dto.timestamp,
        }
    }
}

#[derive(Deserialize)]
struct PartyJoinedDto {
    party_id: String,
    first_name: Option<String>,
    last_name: Option<String>,
    display_name: Option<String>,
    #[serde(rename = "type")]
    party_type: PartyType,
    #[serde(deserialize_with = "wire::timestamp")]
    timestamp: DateTime<Utc>,
}

impl From<PartyJoinedDto> for ContactCenterEvent {
    fn from(dto: PartyJoinedDto) -> Self {
        Self::PartyJoined {
            party_id: dto.party_id,
            first_name: dto.first_name,
            last_name: dto.last_name,
            display_name: dto.display_name,
            party_type: dto.party_type,
            timestamp: dto.timestamp,
        }
    }
}

#[derive(Deserialize)]
struct PartyLeftDto {
    party_id: String,
    #[serde(deserialize_with = "wire::timestamp")]
    timestamp: DateTime<Utc>,
}

impl From<PartyLeftDto> for ContactCenterEvent {
    fn from(dto: PartyLeftDto) -> Self {
        Self::PartyLeft {
            party_id: dto.party_id,
            timestamp: dto.timestamp,
        }
    }
}

#[derive(Deserialize)]
struct PresenceDto {
    party_id: Option<String>,
    #[serde(default, deserialize_with = "wire::optional_timestamp")]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct LocationDto {
    party_id: Option<String>,
    url: Option<String>,
    #[serde(deserialize_with = "wire::coordinate")]
    latitude: f64,
    #[serde(deserialize_with = "wire::coordinate")]
    longitude: f64,
    #[serde(default, deserialize_with = "wire::optional_timestamp")]
    timestamp: Option<DateTime<Utc>>,
}

impl From<LocationDto> for ContactCenterEvent {
    fn from(dto: LocationDto) -> Self {
        Self::Location {
            party_id: dto.party_id,
            url: dto.url,
            latitude: dto.latitude,
            longitude: dto.longitude,
            timestamp: dto.timestamp,
        }
    }
}

#[derive(Deserialize)]
struct NoticeDto {
    msg: String,
    #[serde(deserialize_with = "wire::timestamp")]
    timestamp: DateTime<Utc>,
}

/// Lenient scalar readers: the backend is inconsistent about numbers vs strings.
mod wire {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, de::Error};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Int(i64),
        Float(f64),
        Text(String),
    }

    pub fn timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        scalar_to_timestamp(Scalar::deserialize(d)?).map_err(D::Error::custom)
    }

    pub fn optional_timestamp<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        Option::<Scalar>::deserialize(d)?
            .map(scalar_to_timestamp)
            .transpose()
            .map_err(D::Error::custom)
    }

    pub fn wait_seconds<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        Ok(match Scalar::deserialize(d)? {
            Scalar::Int(n) => n.clamp(0, i64::from(u32::MAX)) as u32,
            Scalar::Float(f) => f as u32,
            Scalar::Text(text) => text.trim().parse().unwrap_or(0),
        })
    }

    pub fn coordinate<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(match Scalar::deserialize(d)? {
            Scalar::Int(n) => n as f64,
            Scalar::Float(f) => f,
            Scalar::Text(text) => text.trim().parse().unwrap_or(0.0),
        })
    }

    fn scalar_to_timestamp(value: Scalar) -> Result<DateTime<Utc>, String> {
        match value {
            Scalar::Int(secs) => Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| format!("timestamp {secs} out of range")),
            Scalar::Float(secs) => from_fractional_secs(secs),
            Scalar::Text(text) => {
                let text = text.trim();
                if let Ok(secs) = text.parse::<f64>() {
                    return from_fractional_secs(secs);
                }
                DateTime::parse_from_rfc3339(text)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|err| format!("invalid timestamp '{text}': {err}"))
            }
        }
    }

    fn from_fractional_secs(secs: f64) -> Result<DateTime<Utc>, String> {
        if !secs.is_finite() {
            return Err(format!("timestamp {secs} is not finite"));
        }
        Utc.timestamp_millis_opt((secs * 1000.0).round() as i64)
            .single()
            .ok_or_else(|| format!("timestamp {secs} out of range"))
    }
}
