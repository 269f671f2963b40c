//! Monitor units.
//!
//! A unit is constructed once, bound to the shared [`UnitContext`] by
//! `init`, started once and stopped at most once. Every task a unit spawns
//! goes through the tracker handed to `start`, so the coordinator can wait
//! for all of them during shutdown.

mod endpoint;
mod eventlog;
mod service;
mod system;
mod webapi;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::trace;

pub use endpoint::{EndpointCheck, EndpointStatus, EndpointUnit};
pub use eventlog::{EventLogUnit, EventSource, JournalEvent, JournalSource, level_name, parse_journal_entry};
pub use service::{ServiceProbe, ServiceState, ServiceStatus, ServiceUnit, SystemdProbe};
pub use system::{SystemSample, SystemUnit};
pub use webapi::{ApiCheck, WebApiUnit};

use crate::config::Config;
use crate::dispatch::{DeliveryOutcome, Destination, Dispatcher, RESPONSE_TIMEOUT, await_delivery};
use crate::sink::LogSink;
use crate::telemetry::{Envelope, Level};

#[derive(Debug, Error)]
pub enum UnitError {
    #[error("unit '{0}' has not been initialized")]
    NotInitialized(String),

    #[error("unit '{0}' was already started")]
    AlreadyStarted(String),

    #[error("invalid settings for unit '{unit}': {reason}")]
    InvalidSettings { unit: String, reason: String },
}

/// Contract shared by built-in and plugin units
pub trait MonitorUnit: Send {
    fn name(&self) -> &str;

    /// Bind the unit to the shared context. Called once before `start`.
    fn init(&mut self, context: UnitContext) -> Result<(), UnitError>;

    /// Begin periodic work. Every spawned task must be registered with
    /// `tracker`. A second call fails with [`UnitError::AlreadyStarted`].
    fn start(&mut self, tracker: &TaskTracker) -> Result<(), UnitError>;

    /// Request cooperative cancellation. Safe to call more than once.
    fn stop(&self);
}

/// Everything a unit needs from the agent
#[derive(Clone)]
pub struct UnitContext {
    pub config: Arc<Config>,
    pub sink: LogSink,
    pub dispatcher: Dispatcher,
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for UnitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitContext")
            .field("agent", &self.config.agent.id)
            .field("dispatcher_closed", &self.dispatcher.is_closed())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl UnitContext {
    pub fn new(
        config: Arc<Config>,
        sink: LogSink,
        dispatcher: Dispatcher,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            sink,
            dispatcher,
            shutdown,
        }
    }

    pub fn log(&self, source: &str, level: Level, message: impl Into<String>) {
        self.sink.log(source, level, message);
    }

    /// The collector endpoint, when delivery is configured
    pub fn delivery_destination(&self) -> Option<Destination> {
        let delivery = &self.config.delivery;
        delivery
            .enabled
            .then(|| Destination::Http(delivery.endpoint.clone()))
    }

    pub fn envelope(
        &self,
        source: &str,
        kind: &str,
        level: &str,
        message: impl Into<String>,
    ) -> Envelope {
        Envelope::new(&self.config.agent, source, kind, level, message)
    }

    /// Submit `payload` to the collector and wait for the outcome, logging
    /// failures to the sink under `API`. Returns `None` when delivery is not
    /// configured.
    pub async fn forward(
        &self,
        what: &str,
        payload: impl Serialize,
        token: &CancellationToken,
    ) -> Option<DeliveryOutcome> {
        let Some(destination) = self.delivery_destination() else {
            trace!("delivery not configured, not forwarding {what}");
            return None;
        };

        let response_rx = self.dispatcher.submit(payload, destination, Level::Info);
        let outcome = await_delivery(response_rx, token, RESPONSE_TIMEOUT).await;

        match &outcome {
            DeliveryOutcome::Delivered(_) | DeliveryOutcome::Cancelled => {}
            DeliveryOutcome::Failed(e) => {
                self.log("API", Level::Error, format!("failed to send {what}: {e}"));
            }
            DeliveryOutcome::Dropped => {
                self.log("API", Level::Warn, format!("delivery of {what} skipped"));
            }
            DeliveryOutcome::TimedOut => {
                self.log("API", Level::Error, "timeout waiting for API response");
            }
        }
        Some(outcome)
    }
}

/// Init/start/stop bookkeeping shared by the unit implementations
pub struct UnitCore {
    name: String,
    context: Option<UnitContext>,
    token: Option<CancellationToken>,
    started: bool,
}

impl UnitCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            context: None,
            token: None,
            started: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind(&mut self, context: UnitContext) {
        self.token = Some(context.shutdown.child_token());
        self.context = Some(context);
    }

    /// Mark the unit started and hand out what its tasks need.
    pub fn begin(&mut self) -> Result<(UnitContext, CancellationToken), UnitError> {
        if self.started {
            return Err(UnitError::AlreadyStarted(self.name.clone()));
        }
        let (Some(context), Some(token)) = (&self.context, &self.token) else {
            return Err(UnitError::NotInitialized(self.name.clone()));
        };
        self.started = true;
        Ok((context.clone(), token.clone()))
    }

    pub fn cancel(&self) {
        if let Some(token) = &self.token {
            token.cancel();
        }
    }

    pub fn invalid(&self, reason: impl Into<String>) -> UnitError {
        UnitError::InvalidSettings {
            unit: self.name.clone(),
            reason: reason.into(),
        }
    }
}

pub(crate) fn ticker(period: Duration) -> Interval {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Units enabled in the configuration file
pub fn from_config(config: &Config) -> Vec<Box<dyn MonitorUnit>> {
    let mut units: Vec<Box<dyn MonitorUnit>> = Vec::new();

    if config.service_monitor.enabled {
        units.push(Box::new(ServiceUnit::new(
            "ServiceMonitor",
            config.service_monitor.clone(),
        )));
    }

    if config.system_monitor.enabled {
        units.push(Box::new(SystemUnit::new(
            "SystemMonitor",
            config.system_monitor.clone(),
        )));
    }

    if config.web_monitor.enabled {
        units.push(Box::new(EndpointUnit::new(
            "WebMonitor",
            config.web_monitor.clone(),
        )));
    }

    let apis: Vec<_> = config.web_api.iter().filter(|api| api.enabled).cloned().collect();
    if !apis.is_empty() {
        units.push(Box::new(WebApiUnit::new("WebApi", apis)));
    }

    if config.event_log.enabled {
        units.push(Box::new(EventLogUnit::new(
            "EventLog",
            config.event_log.clone(),
        )));
    }

    units
}
