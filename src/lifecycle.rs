//! Process lifecycle.
//!
//! ```text
//! Starting ──▶ Running ──▶ ShuttingDown ──▶ Terminated
//!                 │              │
//!        termination or    cancel + stop every unit,
//!        all units done    then race the grace timer
//! ```
//!
//! The coordinator owns the shutdown token, the task tracker and the plugin
//! registry. Units never see the tracker after `start`; they only observe
//! their child of the shutdown token.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::plugins::PluginRegistry;
use crate::sink::LogSink;
use crate::telemetry::Level;
use crate::units::{self, MonitorUnit, UnitContext};

const SOURCE: &str = "Agent";

/// Exit code for configuration and other startup failures
pub const FATAL_EXIT_CODE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every task finished within the grace period
    Clean,
    /// The grace period elapsed with tasks still running
    TimedOut,
}

impl ShutdownOutcome {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownOutcome::Clean => 0,
            ShutdownOutcome::TimedOut => 1,
        }
    }
}

pub struct Coordinator {
    config: Arc<Config>,
    units: Vec<Box<dyn MonitorUnit>>,
    registry: PluginRegistry,
    sink: Option<LogSink>,
    shutdown: CancellationToken,
    state: watch::Sender<LifecycleState>,
}

impl Coordinator {
    /// Coordinator for the units enabled in `config`.
    pub fn new(config: Config) -> Self {
        let units = units::from_config(&config);
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            config: Arc::new(config),
            units,
            registry: PluginRegistry::with_builtin_kinds(),
            sink: None,
            shutdown: CancellationToken::new(),
            state,
        }
    }

    /// Use `registry` for plugin discovery, e.g. one with extra factories.
    pub fn with_registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Write records to `sink` instead of the one described by the config.
    pub fn with_sink(mut self, sink: LogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Add a unit next to the configured ones.
    pub fn with_unit(mut self, unit: Box<dyn MonitorUnit>) -> Self {
        self.units.push(unit);
        self
    }

    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Cancelling this token has the same effect as `termination` resolving.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn enter(&self, state: LifecycleState) {
        debug!(?state, "lifecycle transition");
        self.state.send_replace(state);
    }

    /// Start every unit, wait for `termination` and shut down within the
    /// configured grace period.
    ///
    /// Errors are returned only for startup failures, before any unit runs.
    #[instrument(skip_all, fields(agent = %self.config.agent.id))]
    pub async fn run<F>(mut self, termination: F) -> Result<ShutdownOutcome>
    where
        F: Future<Output = ()>,
    {
        let config = Arc::clone(&self.config);
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => LogSink::from_config(&config).context("failed to open the log sink")?,
        };
        let dispatcher = Dispatcher::from_config(&config.delivery, &self.shutdown);
        let context = UnitContext::new(
            Arc::clone(&config),
            sink.clone(),
            dispatcher.clone(),
            self.shutdown.clone(),
        );

        if let Err(e) = self.register_units(&context) {
            self.shutdown.cancel();
            dispatcher.close().await;
            sink.close().await;
            self.enter(LifecycleState::Terminated);
            return Err(e);
        }
        self.discover_plugins(&context, &sink);

        let tracker = TaskTracker::new();
        for (unit, e) in self.registry.start_all(&tracker) {
            sink.log(SOURCE, Level::Error, format!("failed to start {unit}: {e}"));
        }
        tracker.close();

        self.enter(LifecycleState::Running);
        sink.log(
            SOURCE,
            Level::Info,
            format!(
                "agent {} started with {} delivery workers and units: {}",
                config.agent.name,
                dispatcher.worker_count(),
                self.registry.names().join(", ")
            ),
        );

        let idle = tracker.is_empty();
        tokio::select! {
            _ = termination => info!("termination requested"),
            _ = self.shutdown.cancelled() => info!("shutdown token cancelled"),
            _ = tracker.wait(), if !idle => info!("all units finished"),
        }

        self.enter(LifecycleState::ShuttingDown);
        sink.log(SOURCE, Level::Info, "shutting down");
        self.shutdown.cancel();
        self.registry.stop_all();

        let grace = Duration::from_secs(config.agent.shutdown_grace_secs);
        let quiesced = async {
            tracker.wait().await;
            dispatcher.close().await;
        };

        let outcome = match tokio::time::timeout(grace, quiesced).await {
            Ok(()) => {
                sink.log(SOURCE, Level::Info, "all units stopped");
                sink.close().await;
                ShutdownOutcome::Clean
            }
            Err(_) => {
                warn!(
                    remaining = tracker.len(),
                    "shutdown did not complete within {}s",
                    grace.as_secs()
                );
                sink.log(
                    SOURCE,
                    Level::Error,
                    format!(
                        "shutdown timed out after {}s with {} tasks still running",
                        grace.as_secs(),
                        tracker.len()
                    ),
                );
                ShutdownOutcome::TimedOut
            }
        };

        self.enter(LifecycleState::Terminated);
        Ok(outcome)
    }

    fn register_units(&mut self, context: &UnitContext) -> Result<()> {
        for mut unit in std::mem::take(&mut self.units) {
            unit.init(context.clone())
                .with_context(|| format!("failed to initialize {}", unit.name()))?;
            self.registry.register(unit)?;
        }
        Ok(())
    }

    fn discover_plugins(&mut self, context: &UnitContext, sink: &LogSink) {
        let Some(directory) = &self.config.plugins.directory else {
            return;
        };

        match self.registry.discover(directory, context) {
            Ok(report) => {
                for (path, e) in &report.failures {
                    sink.log(
                        "Plugins",
                        Level::Error,
                        format!("failed to load {}: {e}", path.display()),
                    );
                }
                if !report.loaded.is_empty() {
                    sink.log(
                        "Plugins",
                        Level::Info,
                        format!("loaded plugins: {}", report.loaded.join(", ")),
                    );
                }
            }
            Err(e) => sink.log(
                "Plugins",
                Level::Error,
                format!(
                    "failed to read plugin directory {}: {e}",
                    directory.display()
                ),
            ),
        }
    }
}

/// Run `coordinator` until `termination` resolves and map the result to a
/// process exit code. Termination listeners that could not be installed are
/// a startup failure; no unit is started then.
pub async fn run_agent<F>(coordinator: Coordinator, termination: std::io::Result<F>) -> i32
where
    F: Future<Output = ()>,
{
    let termination = match termination {
        Ok(termination) => termination,
        Err(e) => {
            error!("failed to listen for termination signals: {e}");
            return FATAL_EXIT_CODE;
        }
    };

    match coordinator.run(termination).await {
        Ok(outcome) => {
            info!(?outcome, "agent stopped");
            outcome.exit_code()
        }
        Err(e) => {
            error!("{e:#}");
            FATAL_EXIT_CODE
        }
    }
}
