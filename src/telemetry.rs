//! Record types shared by the sink, the dispatcher and the monitor units.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::AgentConfig;

/// Severity of a telemetry record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }

    /// Syslog severity used in the `<priority>` header.
    pub fn syslog_severity(self) -> u8 {
        match self {
            Level::Error => 3,
            Level::Warn => 4,
            Level::Info => 6,
            Level::Debug => 7,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown log level '{0}'")]
pub struct UnknownLevel(pub String);

impl FromStr for Level {
    type Err = UnknownLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "ERROR" => Ok(Level::Error),
            _ => Err(UnknownLevel(s.to_string())),
        }
    }
}

/// A single line written to the local log sink
///
/// Records are immutable once created. The timestamp is taken when the
/// producer creates the record, not when the sink writes it.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub source: String,
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(source: impl Into<String>, level: Level, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn format_line(&self) -> String {
        format!(
            "{} [{}][{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.source,
            self.level,
            self.message
        )
    }
}

/// Wire body for event-style telemetry forwarded to the collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub agent_name: String,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl Envelope {
    pub fn new(
        agent: &AgentConfig,
        source: impl Into<String>,
        kind: impl Into<String>,
        level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_id: agent.id.clone(),
            agent_name: agent.name.clone(),
            source: source.into(),
            kind: kind.into(),
            level: level.into(),
            message: message.into(),
            data: Map::new(),
        }
    }

    /// Attach a serializable value under `key`. Values that fail to
    /// serialize are stored as `null`.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.data.insert(key.into(), value);
        self
    }
}
