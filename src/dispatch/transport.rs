use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{instrument, trace};

use crate::config::{Auth, HttpEndpoint, SyslogConfig};
use crate::syslog::SyslogClient;

use super::{DeliveryError, DeliveryRequest, Destination};

/// Performs the outbound call for one request.
///
/// Returns the decoded response body when the request asked for it.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<Option<Value>, DeliveryError>;
}

/// Build a client honouring the endpoint's timeout and TLS verification flag.
pub fn build_client(timeout_secs: u64, skip_verify: bool) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .danger_accept_invalid_certs(skip_verify)
        .build()
}

/// Start a request against `endpoint` with its method, headers, query and
/// credential applied.
pub fn prepare(client: &reqwest::Client, endpoint: &HttpEndpoint) -> reqwest::RequestBuilder {
    let mut builder = client.request(endpoint.method.into(), &endpoint.url);

    for header in &endpoint.headers {
        builder = builder.header(&header.key, &header.value);
    }

    if !endpoint.query.is_empty() {
        builder = builder.query(&endpoint.query);
    }

    match &endpoint.auth {
        Auth::None => builder,
        Auth::Bearer { token } => builder.bearer_auth(token),
        Auth::Basic { username, password } => builder.basic_auth(username, password.as_ref()),
        Auth::ApiKey { key, header } => builder.header(header, key),
    }
}

#[derive(Debug, Default)]
pub struct HttpTransport;

impl HttpTransport {
    #[instrument(skip(self, payload), fields(url = %endpoint.url))]
    async fn send(
        &self,
        endpoint: &HttpEndpoint,
        payload: Option<&Value>,
        decode_response: bool,
    ) -> Result<Option<Value>, DeliveryError> {
        let client =
            build_client(endpoint.timeout_secs, endpoint.skip_verify).map_err(DeliveryError::Client)?;

        let mut builder = prepare(&client, endpoint);
        if let Some(payload) = payload {
            builder = builder.json(payload);
        }

        let response = builder.send().await.map_err(DeliveryError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(DeliveryError::Transport)?;
        trace!("collector answered {status}");

        if !status.is_success() {
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if !decode_response || body.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&body)
            .map(Some)
            .map_err(|e| DeliveryError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<Option<Value>, DeliveryError> {
        match &request.destination {
            Destination::Http(endpoint) => {
                self.send(endpoint, request.payload.as_ref(), request.decode_response)
                    .await
            }
            Destination::Syslog(_) => Err(DeliveryError::UnsupportedDestination("syslog")),
        }
    }
}

/// Syslog delivery. One reconnecting client is kept per collector.
#[derive(Default)]
pub struct SyslogTransport {
    clients: Mutex<HashMap<String, Arc<Mutex<SyslogClient>>>>,
}

impl SyslogTransport {
    async fn client_for(&self, config: &SyslogConfig) -> Arc<Mutex<SyslogClient>> {
        let key = format!("{}://{}", config.protocol, config.server);
        self.clients
            .lock()
            .await
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(SyslogClient::new(config))))
            .clone()
    }

    async fn send(&self, config: &SyslogConfig, request: &DeliveryRequest) -> Result<(), DeliveryError> {
        let content = match &request.payload {
            None => String::new(),
            Some(Value::String(text)) => text.clone(),
            Some(other) => serde_json::to_string(other)?,
        };

        let client = self.client_for(config).await;
        let mut client = client.lock().await;
        client
            .write(request.level.syslog_severity(), Utc::now(), &config.tag, &content)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Transport for SyslogTransport {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<Option<Value>, DeliveryError> {
        match &request.destination {
            Destination::Syslog(config) => self.send(config, request).await.map(|_| None),
            Destination::Http(_) => Err(DeliveryError::UnsupportedDestination("http")),
        }
    }
}

/// Routes each request to the transport matching its destination
#[derive(Default)]
pub struct NetworkTransport {
    http: HttpTransport,
    syslog: SyslogTransport,
}

#[async_trait]
impl Transport for NetworkTransport {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<Option<Value>, DeliveryError> {
        match request.destination {
            Destination::Http(_) => self.http.deliver(request).await,
            Destination::Syslog(_) => self.syslog.deliver(request).await,
        }
    }
}
