//! Service-state monitor.
//!
//! Queries the service manager for every configured service on each tick
//! and records the state as a JSON line.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, trace};

use crate::config::ServiceMonitorConfig;
use crate::telemetry::Level;

use super::{MonitorUnit, UnitContext, UnitCore, UnitError, ticker};

const SOURCE: &str = "Service";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Reloading,
    Failed,
    Unknown,
}

impl ServiceState {
    /// Map a systemd `ActiveState` value.
    pub fn from_active_state(state: &str) -> Self {
        match state.trim() {
            "active" => ServiceState::Running,
            "inactive" => ServiceState::Stopped,
            "activating" => ServiceState::Starting,
            "deactivating" => ServiceState::Stopping,
            "reloading" => ServiceState::Reloading,
            "failed" => ServiceState::Failed,
            _ => ServiceState::Unknown,
        }
    }

    pub fn level(self) -> Level {
        match self {
            ServiceState::Stopped | ServiceState::Failed => Level::Warn,
            _ => Level::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub status: ServiceState,
    pub timestamp: DateTime<Utc>,
}

/// Source of service states
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn query(&self, service: &str) -> Result<ServiceState>;
}

/// Asks systemd through `systemctl show`
#[derive(Debug, Default)]
pub struct SystemdProbe;

#[async_trait]
impl ServiceProbe for SystemdProbe {
    async fn query(&self, service: &str) -> Result<ServiceState> {
        let output = Command::new("systemctl")
            .args(["show", service, "--property=ActiveState", "--value"])
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to run systemctl")?;

        if !output.status.success() {
            bail!(
                "systemctl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        Ok(ServiceState::from_active_state(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }
}

pub struct ServiceUnit {
    core: UnitCore,
    settings: ServiceMonitorConfig,
    probe: Arc<dyn ServiceProbe>,
}

impl ServiceUnit {
    pub fn new(name: impl Into<String>, settings: ServiceMonitorConfig) -> Self {
        Self::with_probe(name, settings, Arc::new(SystemdProbe))
    }

    pub fn with_probe(
        name: impl Into<String>,
        settings: ServiceMonitorConfig,
        probe: Arc<dyn ServiceProbe>,
    ) -> Self {
        Self {
            core: UnitCore::new(name),
            settings,
            probe,
        }
    }
}

impl MonitorUnit for ServiceUnit {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, context: UnitContext) -> Result<(), UnitError> {
        if self.settings.interval_secs == 0 {
            return Err(self.core.invalid("interval_secs must be greater than zero"));
        }
        self.core.bind(context);
        Ok(())
    }

    fn start(&mut self, tracker: &TaskTracker) -> Result<(), UnitError> {
        let (context, token) = self.core.begin()?;
        let worker = ServiceWorker {
            unit: self.core.name().to_string(),
            settings: self.settings.clone(),
            probe: Arc::clone(&self.probe),
            context,
        };
        tracker.spawn(worker.run(token));
        Ok(())
    }

    fn stop(&self) {
        self.core.cancel();
    }
}

struct ServiceWorker {
    unit: String,
    settings: ServiceMonitorConfig,
    probe: Arc<dyn ServiceProbe>,
    context: UnitContext,
}

impl ServiceWorker {
    #[instrument(skip_all, fields(unit = %self.unit))]
    async fn run(self, token: CancellationToken) {
        debug!("starting service monitor");
        let mut ticker = ticker(Duration::from_secs(self.settings.interval_secs));

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.check_all(&token).await,
            }
        }

        debug!("service monitor stopped");
    }

    async fn check_all(&self, token: &CancellationToken) {
        for service in &self.settings.services {
            if token.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = self.check(service, token) => {}
            }
        }
    }

    async fn check(&self, service: &str, token: &CancellationToken) {
        trace!("querying {service}");

        let state = match self.probe.query(service).await {
            Ok(state) => state,
            Err(e) => {
                self.context.log(
                    SOURCE,
                    Level::Error,
                    format!("failed to query service {service}: {e:#}"),
                );
                return;
            }
        };

        let status = ServiceStatus {
            name: service.to_string(),
            status: state,
            timestamp: Utc::now(),
        };

        match serde_json::to_string(&status) {
            Ok(line) => self.context.log(SOURCE, state.level(), line),
            Err(e) => {
                self.context.log(
                    SOURCE,
                    Level::Error,
                    format!("failed to encode status for {service}: {e}"),
                );
                return;
            }
        }

        if self.settings.forward {
            self.context
                .forward(&format!("status for {service}"), &status, token)
                .await;
        }
    }
}
