use thiserror::Error;

use crate::syslog::SyslogError;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("transport does not handle {0} destinations")]
    UnsupportedDestination(&'static str),

    #[error("syslog delivery failed: {0}")]
    Syslog(#[from] SyslogError),
}
