//! Core contract of the contact-center messaging SDK.
//!
//! This crate defines the event model and its two-pass decoder, the session
//! registry, the pure poll state machine, retry helpers, the transport
//! gateway trait and the command/event channels. It performs no I/O.

/// Async command/event channel primitives.
pub mod channel;
/// Tolerant two-pass decoding of event batches.
pub mod decode;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Closed event model and wire encoding.
pub mod event;
/// Transport seam consumed by the poll runtime.
pub mod gateway;
/// Fetch-outcome normalization into deliveries and registry feedback.
pub mod normalization;
/// Thread-safe set of polled chat sessions.
pub mod registry;
/// Backoff policy used by retry loops.
pub mod retry;
/// Poll scheduler state machine.
pub mod state_machine;
/// Runtime-facing protocol types (commands, events, configuration).
pub mod types;

pub use channel::{EventStream, PollChannelError, PollChannels};
pub use decode::{EventsEnvelope, ItemDecodeError, RawEvent, TaggedEvent, decode_events};
pub use error::{ContactCenterError, ErrorCategory, ServerErrorCode, classify_http_status};
pub use event::{
    ChatSessionState, ContactCenterEvent, EventDirection, EventKind, PartyType, encode_events,
};
pub use gateway::EventGateway;
pub use normalization::{FetchOutcome, SessionFeedback, normalize_fetch_outcome};
pub use registry::{RegistryChange, SessionRegistry};
pub use retry::{RetryPolicy, SessionBackoff};
pub use state_machine::{PollAction, PollStateMachine};
pub use types::{
    PollCommand, PollPhase, PollerConfig, PollerEvent, RemovalReason, SessionDelivery,
};
