//! HTTP transport and poll runtime for the contact-center messaging SDK.
//!
//! [`HttpGateway`] implements the core `EventGateway` seam over the REST API;
//! [`spawn_poller`] starts the actor that drives poll cycles across every
//! registered chat session.

/// Environment-backed configuration.
pub mod config;
/// reqwest-backed `EventGateway`.
pub mod gateway;
/// Poll runtime actor and its handle.
pub mod runtime;

pub use config::{ConfigError, GatewayConfig, MessagingConfig};
pub use gateway::HttpGateway;
pub use runtime::{PollerHandle, spawn_poller, spawn_poller_with_lifecycle};
