use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::{HttpEndpoint, SyslogConfig};
use crate::telemetry::Level;

use super::DeliveryError;

/// Where a delivery request is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Http(HttpEndpoint),
    Syslog(SyslogConfig),
}

impl Destination {
    /// Short human readable target, used in logs
    pub fn describe(&self) -> String {
        match self {
            Destination::Http(endpoint) => format!("{} {}", endpoint.method, endpoint.url),
            Destination::Syslog(syslog) => format!("{}://{}", syslog.protocol, syslog.server),
        }
    }
}

/// Outcome written back to the submitter, exactly once
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryResponse {
    pub error: Option<String>,
    pub data: Option<Value>,
}

impl DeliveryResponse {
    pub fn success(data: Option<Value>) -> Self {
        Self { error: None, data }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

impl From<Result<Option<Value>, DeliveryError>> for DeliveryResponse {
    fn from(result: Result<Option<Value>, DeliveryError>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

/// A unit of work for the dispatcher.
///
/// The request owns the sending half of its response channel. Dropping the
/// request without calling [`respond`](Self::respond) closes the channel,
/// which the submitter observes as a dropped delivery.
#[derive(Debug)]
pub struct DeliveryRequest {
    /// `None` sends no body (HTTP) or an empty message (syslog)
    pub payload: Option<Value>,

    pub destination: Destination,

    /// Drives the syslog priority
    pub level: Level,

    /// Decode the response body as JSON and return it as `data`
    pub decode_response: bool,

    response_tx: oneshot::Sender<DeliveryResponse>,
}

impl DeliveryRequest {
    pub fn new(
        payload: Option<Value>,
        destination: Destination,
        level: Level,
        decode_response: bool,
    ) -> (Self, oneshot::Receiver<DeliveryResponse>) {
        let (response_tx, response_rx) = oneshot::channel();
        let request = Self {
            payload,
            destination,
            level,
            decode_response,
            response_tx,
        };
        (request, response_rx)
    }

    /// Write the response. Consumes the request, so a channel can only be
    /// written once.
    pub fn respond(self, response: DeliveryResponse) {
        // The submitter may have stopped waiting.
        let _ = self.response_tx.send(response);
    }
}
