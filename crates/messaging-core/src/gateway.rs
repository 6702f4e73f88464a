use async_trait::async_trait;

use crate::{decode::RawEvent, error::ContactCenterError};

/// Transport seam used by the poll runtime.
///
/// Implementations perform one request per call and surface
/// `ContactCenterError::SessionNotFound` when the backend no longer knows the
/// session. Dropping the returned future must abort the request.
#[async_trait]
pub trait EventGateway: Send + Sync + 'static {
    /// Fetch the events queued for `chat_id` since the previous call.
    async fn fetch_new_events(&self, chat_id: &str) -> Result<Vec<RawEvent>, ContactCenterError>;
}
