//! Plugin registry.
//!
//! Additional units are described by `*.toml` files in the plugin
//! directory:
//!
//! ```toml
//! name = "edge-proxy"
//! kind = "web_monitor"
//!
//! [settings]
//! urls = ["https://proxy.internal/health"]
//! interval_secs = 15
//! ```
//!
//! `kind` selects a factory from the registry's table; `settings` is handed
//! to that factory. Static units from the main configuration are registered
//! alongside, so start and stop treat both alike.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::config::{
    EventLogConfig, ServiceMonitorConfig, SystemMonitorConfig, WebApiConfig, WebMonitorConfig,
};
use crate::units::{
    EndpointUnit, EventLogUnit, MonitorUnit, ServiceUnit, SystemUnit, UnitContext, UnitError,
    WebApiUnit,
};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("failed to read plugin descriptor: {0}")]
    Read(#[from] std::io::Error),

    #[error("malformed plugin descriptor: {0}")]
    Malformed(#[from] toml::de::Error),

    #[error("unknown plugin kind '{0}'")]
    UnknownKind(String),

    #[error("invalid settings for plugin '{name}': {reason}")]
    InvalidSettings { name: String, reason: String },

    #[error("a unit named '{0}' is already registered")]
    Duplicate(String),

    #[error(transparent)]
    Unit(#[from] UnitError),
}

/// Builds a unit from a descriptor's name and settings table
pub type UnitFactory = fn(&str, toml::Table) -> Result<Box<dyn MonitorUnit>, PluginError>;

#[derive(Debug, Clone, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    pub kind: String,
    #[serde(default)]
    pub settings: toml::Table,
}

/// Result of a directory scan
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Names of the units registered from the directory
    pub loaded: Vec<String>,
    pub failures: Vec<(PathBuf, PluginError)>,
}

fn settings<T: DeserializeOwned>(name: &str, table: toml::Table) -> Result<T, PluginError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| PluginError::InvalidSettings {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

fn service_factory(name: &str, table: toml::Table) -> Result<Box<dyn MonitorUnit>, PluginError> {
    let config: ServiceMonitorConfig = settings(name, table)?;
    Ok(Box::new(ServiceUnit::new(name, config)))
}

fn system_factory(name: &str, table: toml::Table) -> Result<Box<dyn MonitorUnit>, PluginError> {
    let config: SystemMonitorConfig = settings(name, table)?;
    Ok(Box::new(SystemUnit::new(name, config)))
}

fn web_monitor_factory(name: &str, table: toml::Table) -> Result<Box<dyn MonitorUnit>, PluginError> {
    let config: WebMonitorConfig = settings(name, table)?;
    Ok(Box::new(EndpointUnit::new(name, config)))
}

fn web_api_factory(name: &str, mut table: toml::Table) -> Result<Box<dyn MonitorUnit>, PluginError> {
    table
        .entry("name")
        .or_insert_with(|| toml::Value::String(name.to_string()));
    let config: WebApiConfig = settings(name, table)?;
    Ok(Box::new(WebApiUnit::new(name, vec![config])))
}

fn event_log_factory(name: &str, table: toml::Table) -> Result<Box<dyn MonitorUnit>, PluginError> {
    let config: EventLogConfig = settings(name, table)?;
    Ok(Box::new(EventLogUnit::new(name, config)))
}

pub struct PluginRegistry {
    factories: HashMap<String, UnitFactory>,
    units: Vec<Box<dyn MonitorUnit>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtin_kinds()
    }
}

impl PluginRegistry {
    /// Registry without any factory
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            units: Vec::new(),
        }
    }

    /// Registry knowing the five built-in unit kinds
    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::empty();
        registry.register_factory("service_monitor", service_factory);
        registry.register_factory("system_monitor", system_factory);
        registry.register_factory("web_monitor", web_monitor_factory);
        registry.register_factory("web_api", web_api_factory);
        registry.register_factory("event_log", event_log_factory);
        registry
    }

    /// Add or replace the factory for `kind`
    pub fn register_factory(&mut self, kind: impl Into<String>, factory: UnitFactory) {
        self.factories.insert(kind.into(), factory);
    }

    /// Register an initialized unit. Names must be unique.
    pub fn register(&mut self, unit: Box<dyn MonitorUnit>) -> Result<(), PluginError> {
        if self.contains(unit.name()) {
            return Err(PluginError::Duplicate(unit.name().to_string()));
        }
        debug!(unit = unit.name(), "registered unit");
        self.units.push(unit);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.units.iter().any(|unit| unit.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.units.iter().map(|unit| unit.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Build, initialize and register the unit described by `path`.
    pub fn load_descriptor(&mut self, path: &Path, context: &UnitContext) -> Result<String, PluginError> {
        let content = std::fs::read_to_string(path)?;
        let descriptor: PluginDescriptor = toml::from_str(&content)?;

        if self.contains(&descriptor.name) {
            return Err(PluginError::Duplicate(descriptor.name));
        }

        let factory = self
            .factories
            .get(&descriptor.kind)
            .ok_or_else(|| PluginError::UnknownKind(descriptor.kind.clone()))?;

        let mut unit = factory(&descriptor.name, descriptor.settings)?;
        unit.init(context.clone())?;
        self.register(unit)?;
        Ok(descriptor.name)
    }

    /// Load every `*.toml` descriptor in `directory`, in file name order.
    /// A failing descriptor is reported and does not affect the others.
    #[instrument(skip(self, context))]
    pub fn discover(&mut self, directory: &Path, context: &UnitContext) -> Result<LoadReport, PluginError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(directory)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
            })
            .collect();
        paths.sort();

        let mut report = LoadReport::default();
        for path in paths {
            match self.load_descriptor(&path, context) {
                Ok(name) => {
                    info!(unit = %name, path = %path.display(), "loaded plugin");
                    report.loaded.push(name);
                }
                Err(e) => {
                    warn!(path = %path.display(), "failed to load plugin: {e}");
                    report.failures.push((path, e));
                }
            }
        }
        Ok(report)
    }

    /// Start every registered unit. Returns the names of the units that
    /// failed to start together with the reason.
    pub fn start_all(&mut self, tracker: &TaskTracker) -> Vec<(String, UnitError)> {
        let mut failures = Vec::new();
        for unit in &mut self.units {
            match unit.start(tracker) {
                Ok(()) => debug!(unit = unit.name(), "started unit"),
                Err(e) => failures.push((unit.name().to_string(), e)),
            }
        }
        failures
    }

    pub fn stop_all(&self) {
        for unit in &self.units {
            unit.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::testing;
    use assert_matches::assert_matches;

    fn write(dir: &Path, file: &str, content: &str) {
        std::fs::write(dir.join(file), content).unwrap();
    }

    #[tokio::test]
    async fn test_discover_reports_failures_per_file() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a-proxy.toml",
            r#"
            name = "edge-proxy"
            kind = "web_monitor"

            [settings]
            urls = ["http://127.0.0.1:9/health"]
            interval_secs = 15
            "#,
        );
        write(dir.path(), "b-broken.toml", "name = \"oops\"\nkind = ");
        write(
            dir.path(),
            "c-unknown.toml",
            "name = \"mystery\"\nkind = \"quantum_monitor\"\n",
        );
        write(
            dir.path(),
            "d-bad-settings.toml",
            "name = \"bad\"\nkind = \"system_monitor\"\n[settings]\ninterval_secs = \"often\"\n",
        );
        write(
            dir.path(),
            "e-duplicate.toml",
            "name = \"edge-proxy\"\nkind = \"web_monitor\"\n",
        );
        write(dir.path(), "notes.txt", "not a descriptor");

        let (context, _) = testing::context(testing::empty_config());
        let mut registry = PluginRegistry::with_builtin_kinds();
        let report = registry.discover(dir.path(), &context).unwrap();

        assert_eq!(report.loaded, vec!["edge-proxy".to_string()]);
        assert_eq!(report.failures.len(), 4);
        assert_matches!(report.failures[0].1, PluginError::Malformed(_));
        assert_matches!(&report.failures[1].1, PluginError::UnknownKind(kind) if kind == "quantum_monitor");
        assert_matches!(report.failures[2].1, PluginError::InvalidSettings { .. });
        assert_matches!(report.failures[3].1, PluginError::Duplicate(_));
        assert_eq!(registry.names(), vec!["edge-proxy"]);
    }

    #[tokio::test]
    async fn test_init_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "events.toml",
            "name = \"journal\"\nkind = \"event_log\"\n[settings]\nchannels = []\n",
        );

        let (context, _) = testing::context(testing::empty_config());
        let mut registry = PluginRegistry::with_builtin_kinds();
        let report = registry.discover(dir.path(), &context).unwrap();

        assert!(report.loaded.is_empty());
        assert_matches!(report.failures[0].1, PluginError::Unit(UnitError::InvalidSettings { .. }));
    }

    #[tokio::test]
    async fn test_web_api_descriptor_takes_plugin_name() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "status.toml",
            "name = \"status-api\"\nkind = \"web_api\"\n[settings]\nendpoint = \"http://127.0.0.1:9/\"\n",
        );

        let (context, _) = testing::context(testing::empty_config());
        let mut registry = PluginRegistry::with_builtin_kinds();
        let report = registry.discover(dir.path(), &context).unwrap();
        assert_eq!(report.loaded, vec!["status-api".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let (context, _) = testing::context(testing::empty_config());
        let mut registry = PluginRegistry::with_builtin_kinds();
        let result = registry.discover(Path::new("/no/such/plugin/dir"), &context);
        assert_matches!(result, Err(PluginError::Read(_)));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut registry = PluginRegistry::empty();
        let unit = || -> Box<dyn MonitorUnit> {
            Box::new(SystemUnit::new("SystemMonitor", SystemMonitorConfig::default()))
        };
        registry.register(unit()).unwrap();
        assert_matches!(registry.register(unit()), Err(PluginError::Duplicate(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_custom_factory() {
        fn quiet(name: &str, _: toml::Table) -> Result<Box<dyn MonitorUnit>, PluginError> {
            Ok(Box::new(SystemUnit::new(
                name,
                SystemMonitorConfig {
                    cpu: false,
                    ..Default::default()
                },
            )))
        }

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "q.toml", "name = \"q\"\nkind = \"quiet\"\n");

        let (context, _) = testing::context(testing::empty_config());
        let mut registry = PluginRegistry::empty();
        registry.register_factory("quiet", quiet);
        let report = registry.discover(dir.path(), &context).unwrap();

        assert_eq!(report.loaded, vec!["q".to_string()]);

        let tracker = TaskTracker::new();
        assert!(registry.start_all(&tracker).is_empty());
        let again = registry.start_all(&tracker);
        assert_matches!(again[0].1, UnitError::AlreadyStarted(_));
        registry.stop_all();
        registry.stop_all();
        tracker.close();
        tracker.wait().await;
    }
}
