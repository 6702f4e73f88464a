use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::ContactCenterError, event::ContactCenterEvent, registry::RegistryChange,
    retry::RetryPolicy,
};

/// Phase of the poll scheduler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PollPhase {
    /// Nothing to poll, or polling is not allowed right now.
    Idle,
    /// A wake-up is pending.
    Scheduled,
    /// One cycle's fetch requests are in flight.
    Polling,
}

/// Tuning values for the poll runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Delay between the end of one cycle and the start of the next.
    pub poll_interval: Duration,
    /// Delay before the first cycle after the scheduler leaves `Idle`.
    pub initial_delay: Duration,
    /// Optional per-session backoff after transient failures.
    ///
    /// When `None`, failed sessions are simply fetched again next cycle.
    pub retry: Option<RetryPolicy>,
    /// Capacity of the broadcast event stream.
    ///
    /// Subscribers that fall further behind skip events. Callbacks
    /// installed with `on_delivery` have their own unbounded queue.
    pub event_buffer: usize,
    /// Foreground state assumed at startup.
    pub foreground: bool,
    /// Reachability assumed at startup.
    pub network_reachable: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            initial_delay: Duration::ZERO,
            retry: None,
            event_buffer: 512,
            foreground: true,
            network_reachable: true,
        }
    }
}

/// Command channel input accepted by the poll runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollCommand {
    /// The session registry crossed the empty boundary.
    ///
    /// `Deactivated` always cancels in-flight work, even when the set was
    /// refilled before the runtime saw the command.
    SessionsChanged(RegistryChange),
    /// App moved to the foreground (`true`) or background (`false`).
    SetForeground(bool),
    /// Network became reachable (`true`) or unreachable (`false`).
    SetNetworkReachable(bool),
    /// Run the pending cycle now instead of waiting for the timer.
    PollNow,
    /// Stop the runtime.
    Shutdown,
}

/// Outcome of one session's fetch, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDelivery {
    pub chat_id: String,
    pub result: Result<Vec<ContactCenterEvent>, ContactCenterError>,
}

/// Why a session stopped being polled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemovalReason {
    /// The backend sent a session-ended event.
    Ended,
    /// The backend no longer knows the session.
    NotFound,
}

/// Broadcast output of the poll runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum PollerEvent {
    /// Decoded events or a failure for one session.
    Delivery(SessionDelivery),
    /// The scheduler moved to a new phase.
    PhaseChanged { phase: PollPhase },
    /// A session was deregistered because of backend feedback.
    SessionRemoved {
        chat_id: String,
        reason: RemovalReason,
    },
}
