//! Environment-backed configuration for the HTTP gateway and poll runtime.

use std::{env, error::Error, fmt, time::Duration};

use messaging_core::{ContactCenterError, PollerConfig, RetryPolicy};
use url::Url;

const API_ROOT: &str = "clientweb/api/v2/";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Connection settings for one contact-center tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Server root, for example `https://contact.example.com`.
    pub base_url: Url,
    /// Tenant identifier sent as the `tenantUrl` query parameter.
    pub tenant_url: String,
    pub app_id: String,
    /// Per-device client identifier.
    pub client_id: String,
    /// Upper bound for one request, connect to last body byte.
    pub request_timeout: Duration,
}

impl GatewayConfig {
    pub fn new(
        base_url: Url,
        tenant_url: impl Into<String>,
        app_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            base_url,
            tenant_url: tenant_url.into(),
            app_id: app_id.into(),
            client_id: client_id.into(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// `<base_url>/clientweb/api/v2/`, tolerating a base path without trailing slash.
    pub fn api_root(&self) -> Result<Url, ContactCenterError> {
        let mut base = self.base_url.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.join(API_ROOT)
            .map_err(|err| ContactCenterError::InvalidRequest(err.to_string()))
    }

    /// `GET chats/<chat_id>/events?tenantUrl=<tenant_url>` endpoint.
    pub fn events_url(&self, chat_id: &str) -> Result<Url, ContactCenterError> {
        let mut url = self.api_root()?;
        url.path_segments_mut()
            .map_err(|()| {
                ContactCenterError::InvalidRequest(format!("{} cannot be a base URL", self.base_url))
            })?
            .pop_if_empty()
            .extend(["chats", chat_id, "events"]);
        url.query_pairs_mut()
            .append_pair("tenantUrl", &self.tenant_url);
        Ok(url)
    }

    /// Value of the `Authorization` header.
    pub fn authorization(&self) -> String {
        format!(
            "MOBILE-API-140-327-PLAIN appId={}, clientId={}",
            self.app_id, self.client_id
        )
    }

    /// `host:port` of the backend, for reachability probing.
    pub fn reachability_target(&self) -> Option<String> {
        let host = self.base_url.host_str()?;
        let port = self.base_url.port_or_known_default()?;
        Some(format!("{host}:{port}"))
    }
}

/// Full runtime configuration assembled from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingConfig {
    pub gateway: GatewayConfig,
    pub poller: PollerConfig,
}

impl MessagingConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let base_url = required_trimmed_env("MESSAGING_BASE_URL", &mut lookup)?;
        let base_url = parse_base_url("MESSAGING_BASE_URL", base_url)?;
        let tenant_url = required_trimmed_env("MESSAGING_TENANT_URL", &mut lookup)?;
        let app_id = required_trimmed_env("MESSAGING_APP_ID", &mut lookup)?;
        let client_id = required_trimmed_env("MESSAGING_CLIENT_ID", &mut lookup)?;

        let request_timeout_ms = parse_optional_u64(
            "MESSAGING_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
            &mut lookup,
        )?;
        if request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MESSAGING_REQUEST_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        let defaults = PollerConfig::default();
        let poll_interval = Duration::from_millis(parse_optional_u64(
            "MESSAGING_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
            &mut lookup,
        )?);

        let retry_base_ms = lookup_optional_u64("MESSAGING_RETRY_BASE_MS", &mut lookup)?;
        let retry_max_ms = lookup_optional_u64("MESSAGING_RETRY_MAX_MS", &mut lookup)?;
        let retry = match (retry_base_ms, retry_max_ms) {
            (None, None) => None,
            (Some(base), max) => {
                let max = max.unwrap_or(RetryPolicy::default().max_delay_ms());
                Some(RetryPolicy::new(base, max))
            }
            (None, Some(max)) => Some(RetryPolicy::new(
                RetryPolicy::default().base_delay_ms().min(max),
                max,
            )),
        };
        let poller = PollerConfig {
            poll_interval,
            retry,
            ..defaults
        };

        let gateway = GatewayConfig::new(base_url, tenant_url, app_id, client_id)
            .with_request_timeout(Duration::from_millis(request_timeout_ms));

        Ok(Self { gateway, poller })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is unset or blank.
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => write!(f, "missing required {key}"),
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn required_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Result<String, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    optional_trimmed_env(key, lookup).ok_or(ConfigError::Missing { key })
}

fn parse_base_url(key: &'static str, value: String) -> Result<Url, ConfigError> {
    let url = Url::parse(&value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.clone(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") || url.cannot_be_a_base() {
        return Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "must be an http or https URL".to_owned(),
        });
    }
    Ok(url)
}

fn lookup_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(lookup_optional_u64(key, lookup)?.unwrap_or(default))
}
