use std::time::Duration;

use async_trait::async_trait;
use messaging_core::{
    ContactCenterError, EventGateway, EventsEnvelope, RawEvent, ServerErrorCode,
};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, RETRY_AFTER};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::GatewayConfig;

const USER_AGENT: &str = "MobileClient";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// `EventGateway` backed by the contact-center REST API.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    authorization: String,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, ContactCenterError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| ContactCenterError::InvalidRequest(err.to_string()))?;
        Ok(Self::with_client(client, config))
    }

    /// Use a preconfigured client. Its timeout replaces `request_timeout`.
    pub fn with_client(client: reqwest::Client, config: GatewayConfig) -> Self {
        let authorization = config.authorization();
        Self {
            client,
            config,
            authorization,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

#[async_trait]
impl EventGateway for HttpGateway {
    async fn fetch_new_events(&self, chat_id: &str) -> Result<Vec<RawEvent>, ContactCenterError> {
        let url = self.config.events_url(chat_id)?;
        debug!(chat_id, "fetching new events");

        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, &self.authorization)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let retry_after = retry_after(response.headers());
        let body = response.bytes().await.map_err(map_transport_error)?;

        if status.is_success() {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(Vec::new());
            }
            let envelope = EventsEnvelope::from_slice(&body)
                .map_err(|err| ContactCenterError::UnexpectedResponse(err.to_string()))?;
            debug!(chat_id, count = envelope.events.len(), "received events");
            return Ok(envelope.events);
        }

        let error = error_from_body(status.as_u16(), &body);
        if let ContactCenterError::Server {
            code: Some(ServerErrorCode::NoEvents),
            ..
        } = error
        {
            return Ok(Vec::new());
        }

        warn!(chat_id, status = status.as_u16(), code = error.code(), "event fetch failed");
        Err(match retry_after {
            Some(delay) => error.with_retry_after(delay),
            None => error,
        })
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error_code: serde_json::Value,
    #[serde(default)]
    error_message: Option<String>,
}

fn error_from_body(status: u16, body: &[u8]) -> ContactCenterError {
    let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body) else {
        return ContactCenterError::BadStatus {
            status,
            retry_after_ms: None,
        };
    };

    let code = match parsed.error_code {
        serde_json::Value::String(code) => code,
        serde_json::Value::Number(code) => code.to_string(),
        _ => {
            return ContactCenterError::BadStatus {
                status,
                retry_after_ms: None,
            };
        }
    };
    ContactCenterError::from_server(status, &code, parsed.error_message.unwrap_or_default())
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn map_transport_error(err: reqwest::Error) -> ContactCenterError {
    if err.is_timeout() {
        ContactCenterError::Timeout
    } else if err.is_builder() {
        ContactCenterError::InvalidRequest(err.to_string())
    } else {
        ContactCenterError::Network(err.to_string())
    }
}
