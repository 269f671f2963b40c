//! System event-log monitor.
//!
//! Follows the systemd journal for each configured channel (a journal
//! unit) and records every new entry. Each channel runs in its own task.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument};

use crate::config::EventLogConfig;
use crate::telemetry::Level;

use super::{MonitorUnit, UnitContext, UnitCore, UnitError};

const SOURCE: &str = "EventLog";

/// Raw entries of one channel, oldest first
pub type EventStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<EventStream>;
}

/// Reads `journalctl --follow` output. The child process is killed when
/// the stream is dropped.
#[derive(Debug, Default)]
pub struct JournalSource;

#[async_trait]
impl EventSource for JournalSource {
    async fn subscribe(&self, channel: &str) -> Result<EventStream> {
        let mut child = Command::new("journalctl")
            .args(["--follow", "--lines=0", "--output=json", "--unit", channel])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to start journalctl")?;
        let stdout = child
            .stdout
            .take()
            .context("journalctl stdout is not available")?;

        let lines = BufReader::new(stdout).lines();
        let stream = futures::stream::unfold(Some((child, lines)), |state| async move {
            let (child, mut lines) = state?;
            match lines.next_line().await {
                Ok(Some(line)) => Some((Ok(line), Some((child, lines)))),
                Ok(None) => None,
                Err(e) => Some((Err(anyhow::Error::new(e).context("failed to read journal")), None)),
            }
        });
        Ok(stream.boxed())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalEvent {
    pub channel: String,
    pub level: &'static str,
    pub message: String,
    pub computer: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub event_data: Map<String, Value>,
}

/// Name for a syslog-style journal `PRIORITY`
pub fn level_name(priority: Option<u64>) -> &'static str {
    match priority {
        Some(0..=2) => "Critical",
        Some(3) => "Error",
        Some(4) => "Warning",
        Some(5 | 6) => "Information",
        Some(7) => "Verbose",
        _ => "Unknown",
    }
}

/// Parse one line of `journalctl --output=json`.
pub fn parse_journal_entry(channel: &str, line: &str) -> serde_json::Result<JournalEvent> {
    let data: Map<String, Value> = serde_json::from_str(line)?;

    let priority = data.get("PRIORITY").and_then(|value| match value {
        Value::String(s) => s.parse().ok(),
        other => other.as_u64(),
    });
    let text = |key: &str| {
        data.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Ok(JournalEvent {
        channel: channel.to_string(),
        level: level_name(priority),
        message: text("MESSAGE"),
        computer: text("_HOSTNAME"),
        event_data: data,
    })
}

pub struct EventLogUnit {
    core: UnitCore,
    settings: EventLogConfig,
    source: Arc<dyn EventSource>,
}

impl EventLogUnit {
    pub fn new(name: impl Into<String>, settings: EventLogConfig) -> Self {
        Self::with_source(name, settings, Arc::new(JournalSource))
    }

    pub fn with_source(
        name: impl Into<String>,
        settings: EventLogConfig,
        source: Arc<dyn EventSource>,
    ) -> Self {
        Self {
            core: UnitCore::new(name),
            settings,
            source,
        }
    }
}

impl MonitorUnit for EventLogUnit {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, context: UnitContext) -> Result<(), UnitError> {
        if self.settings.channels.is_empty() {
            return Err(self.core.invalid("no channels configured"));
        }
        self.core.bind(context);
        Ok(())
    }

    fn start(&mut self, tracker: &TaskTracker) -> Result<(), UnitError> {
        let (context, token) = self.core.begin()?;
        for channel in &self.settings.channels {
            tracker.spawn(follow_channel(
                channel.clone(),
                self.settings.forward,
                Arc::clone(&self.source),
                context.clone(),
                token.clone(),
            ));
        }
        Ok(())
    }

    fn stop(&self) {
        self.core.cancel();
    }
}

#[instrument(skip(source, context, token))]
async fn follow_channel(
    channel: String,
    forward: bool,
    source: Arc<dyn EventSource>,
    context: UnitContext,
    token: CancellationToken,
) {
    let subscribed = tokio::select! {
        _ = token.cancelled() => return,
        subscribed = source.subscribe(&channel) => subscribed,
    };
    let mut events = match subscribed {
        Ok(events) => events,
        Err(e) => {
            context.log(
                SOURCE,
                Level::Error,
                format!("failed to subscribe to channel {channel}: {e:#}"),
            );
            return;
        }
    };

    context.log(
        SOURCE,
        Level::Info,
        format!("starting monitoring of channel: {channel}"),
    );

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = events.next() => next,
        };

        match next {
            Some(Ok(line)) => {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = process(&channel, &line, forward, &context, &token) => {}
                }
            }
            Some(Err(e)) => {
                context.log(SOURCE, Level::Error, format!("{e:#}"));
            }
            None => {
                context.log(
                    SOURCE,
                    Level::Warn,
                    format!("event stream for channel {channel} ended"),
                );
                return;
            }
        }
    }

    context.log(
        SOURCE,
        Level::Info,
        format!("stopping monitor for channel: {channel}"),
    );
    debug!("channel monitor stopped");
}

async fn process(
    channel: &str,
    line: &str,
    forward: bool,
    context: &UnitContext,
    token: &CancellationToken,
) {
    let event = match parse_journal_entry(channel, line) {
        Ok(event) => event,
        Err(e) => {
            context.log(SOURCE, Level::Error, format!("failed to process event: {e}"));
            return;
        }
    };

    match serde_json::to_string(&event) {
        Ok(json) => context.log(SOURCE, Level::Info, json),
        Err(e) => {
            context.log(SOURCE, Level::Error, format!("failed to encode event: {e}"));
            return;
        }
    }

    if forward {
        let envelope = context
            .envelope("event_log", "event", event.level, event.computer.clone())
            .with_data("event", &event);
        context
            .forward(&format!("event from {channel}"), &envelope, token)
            .await;
    }
}
