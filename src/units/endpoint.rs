//! HTTP endpoint health monitor.
//!
//! All configured URLs are checked concurrently on each tick and the tick
//! only completes once every check has finished.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, trace};

use crate::config::WebMonitorConfig;
use crate::dispatch::build_client;
use crate::telemetry::Level;

use super::{MonitorUnit, UnitContext, UnitCore, UnitError, ticker};

const SOURCE: &str = "WebMonitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointStatus {
    /// Answered below 400 (and matched the body pattern, if any)
    Up,
    /// Answered with a success status but the body did not match
    Degraded,
    /// Answered with 400 or above
    Error,
    /// No answer
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointCheck {
    pub url: String,
    pub status: EndpointStatus,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EndpointCheck {
    fn level(&self) -> Level {
        match self.status {
            EndpointStatus::Up => Level::Info,
            EndpointStatus::Degraded | EndpointStatus::Error => Level::Warn,
            EndpointStatus::Down => Level::Error,
        }
    }

    fn summary(&self) -> String {
        match self.status {
            EndpointStatus::Up => format!(
                "{} is up (response time: {}ms)",
                self.url, self.response_time_ms
            ),
            EndpointStatus::Degraded => format!(
                "{} returned {} but the body did not match the expected pattern",
                self.url, self.status_code
            ),
            EndpointStatus::Error => match &self.error {
                Some(error) => format!(
                    "{} returned status code {} but the body could not be read: {error}",
                    self.url, self.status_code
                ),
                None => format!("{} returned status code {}", self.url, self.status_code),
            },
            EndpointStatus::Down => format!(
                "failed to connect to {}: {}",
                self.url,
                self.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
}

/// Classify a response
fn evaluate(status_code: u16, body: &str, pattern: Option<&Regex>) -> EndpointStatus {
    if status_code >= 400 {
        return EndpointStatus::Error;
    }
    match pattern {
        Some(re) if (200..300).contains(&status_code) && !re.is_match(body) => {
            EndpointStatus::Degraded
        }
        _ => EndpointStatus::Up,
    }
}

pub struct EndpointUnit {
    core: UnitCore,
    settings: WebMonitorConfig,
}

impl EndpointUnit {
    pub fn new(name: impl Into<String>, settings: WebMonitorConfig) -> Self {
        Self {
            core: UnitCore::new(name),
            settings,
        }
    }
}

impl MonitorUnit for EndpointUnit {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, context: UnitContext) -> Result<(), UnitError> {
        if self.settings.interval_secs == 0 {
            return Err(self.core.invalid("interval_secs must be greater than zero"));
        }
        if let Some(pattern) = &self.settings.body_pattern {
            Regex::new(pattern)
                .map_err(|e| self.core.invalid(format!("invalid body_pattern: {e}")))?;
        }
        self.core.bind(context);
        Ok(())
    }

    fn start(&mut self, tracker: &TaskTracker) -> Result<(), UnitError> {
        let client = build_client(self.settings.timeout_secs, self.settings.skip_verify)
            .map_err(|e| self.core.invalid(format!("failed to build HTTP client: {e}")))?;
        let pattern = self
            .settings
            .body_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| self.core.invalid(format!("invalid body_pattern: {e}")))?;

        let (context, token) = self.core.begin()?;
        let worker = EndpointWorker {
            unit: self.core.name().to_string(),
            settings: self.settings.clone(),
            client,
            pattern,
            context,
        };
        tracker.spawn(worker.run(token));
        Ok(())
    }

    fn stop(&self) {
        self.core.cancel();
    }
}

struct EndpointWorker {
    unit: String,
    settings: WebMonitorConfig,
    client: reqwest::Client,
    pattern: Option<Regex>,
    context: UnitContext,
}

impl EndpointWorker {
    #[instrument(skip_all, fields(unit = %self.unit))]
    async fn run(self, token: CancellationToken) {
        debug!("starting endpoint monitor");
        let mut ticker = ticker(Duration::from_secs(self.settings.interval_secs));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let checks = self.settings.urls.iter().map(|url| self.check(url, &token));
            tokio::select! {
                _ = token.cancelled() => break,
                _ = join_all(checks) => {}
            }
        }

        debug!("endpoint monitor stopped");
    }

    async fn check(&self, url: &str, token: &CancellationToken) {
        let result = self.probe(url).await;

        self.context.log(SOURCE, result.level(), result.summary());
        match serde_json::to_string(&result) {
            Ok(line) => self.context.log(SOURCE, Level::Info, line),
            Err(e) => {
                self.context.log(
                    SOURCE,
                    Level::Error,
                    format!("failed to encode status for {url}: {e}"),
                );
                return;
            }
        }

        if self.settings.forward {
            self.context
                .forward(&format!("status for {url}"), &result, token)
                .await;
        }
    }

    async fn probe(&self, url: &str) -> EndpointCheck {
        trace!("checking {url}");
        let start = Instant::now();

        let outcome = match self.client.get(url).send().await {
            Ok(response) => {
                let status_code = response.status().as_u16();
                match &self.pattern {
                    None => Ok((status_code, String::new())),
                    Some(_) => response
                        .text()
                        .await
                        .map(|body| (status_code, body))
                        .map_err(|e| (status_code, format!("error reading response: {e}"))),
                }
            }
            Err(e) => Err((0, e.to_string())),
        };
        let response_time_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok((status_code, body)) => EndpointCheck {
                url: url.to_string(),
                status: evaluate(status_code, &body, self.pattern.as_ref()),
                status_code,
                response_time_ms,
                timestamp: Utc::now(),
                error: None,
            },
            Err((status_code, error)) => EndpointCheck {
                url: url.to_string(),
                // an answer whose body could not be read is an error, no answer is down
                status: if status_code == 0 {
                    EndpointStatus::Down
                } else {
                    EndpointStatus::Error
                },
                status_code,
                response_time_ms,
                timestamp: Utc::now(),
                error: Some(error),
            },
        }
    }
}
