use crate::{
    decode::{RawEvent, decode_events},
    error::ContactCenterError,
    types::{RemovalReason, SessionDelivery},
};

/// Raw result of one session's fetch before decoding.
#[derive(Debug)]
pub struct FetchOutcome {
    pub chat_id: String,
    pub result: Result<Vec<RawEvent>, ContactCenterError>,
}

/// What the scheduler should do with a session after its fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFeedback {
    /// Fetch succeeded; keep polling normally.
    Healthy,
    /// Transient failure; keep the session and optionally back off.
    Failed { retry_after_ms: Option<u64> },
    /// Stop polling the session.
    Deregister(RemovalReason),
}

/// Decode a fetch outcome into a subscriber delivery and registry feedback.
pub fn normalize_fetch_outcome(outcome: FetchOutcome) -> (SessionDelivery, SessionFeedback) {
    let FetchOutcome { chat_id, result } = outcome;

    let (result, feedback) = match result {
        Ok(raw) => match decode_events(&raw) {
            Ok(events) => {
                let feedback = if events.iter().any(|event| event.ends_session()) {
                    SessionFeedback::Deregister(RemovalReason::Ended)
                } else {
                    SessionFeedback::Healthy
                };
                (Ok(events), feedback)
            }
            Err(err) => (Err(err), SessionFeedback::Healthy),
        },
        Err(err) if err.is_session_not_found() => {
            (Err(err), SessionFeedback::Deregister(RemovalReason::NotFound))
        }
        Err(err) => {
            let retry_after_ms = err.retry_after_ms();
            (Err(err), SessionFeedback::Failed { retry_after_ms })
        }
    };

    (SessionDelivery { chat_id, result }, feedback)
}
