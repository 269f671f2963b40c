//! Local log sink.
//!
//! Producers call [`LogSink::log`], which never blocks: records go into a
//! bounded channel drained by a single consumer that owns the writer. When
//! the channel is full the line is written straight to the fallback writer
//! (stderr) with a `(buffer full)` suffix instead of being lost.
//!
//! With syslog enabled every record is also offered to a second bounded
//! channel feeding a forwarder task. Records that do not fit are dropped.

mod rotation;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub use rotation::{RotatingFile, open_rotating};

use crate::config::{Config, SyslogConfig};
use crate::syslog::SyslogClient;
use crate::telemetry::{Level, LogRecord};

pub const DEFAULT_CAPACITY: usize = 1000;

/// Where the consumer writes formatted records
pub enum SinkOutput {
    Stdout,
    File {
        path: PathBuf,
        max_size: u64,
        keep: usize,
    },
    Writer(Box<dyn Write + Send>),
}

impl SinkOutput {
    fn open(self) -> io::Result<Box<dyn Write + Send>> {
        Ok(match self {
            SinkOutput::Stdout => Box::new(io::stdout()),
            SinkOutput::File {
                path,
                max_size,
                keep,
            } => Box::new(RotatingFile::open(path, max_size, keep)?),
            SinkOutput::Writer(writer) => writer,
        })
    }
}

pub struct LogSinkBuilder {
    capacity: usize,
    output: SinkOutput,
    fallback: Box<dyn Write + Send>,
    syslog: Option<SyslogConfig>,
}

impl Default for LogSinkBuilder {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            output: SinkOutput::Stdout,
            fallback: Box::new(io::stderr()),
            syslog: None,
        }
    }
}

impl LogSinkBuilder {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn output(mut self, output: SinkOutput) -> Self {
        self.output = output;
        self
    }

    /// Writer used when the channel is full
    pub fn fallback(mut self, fallback: Box<dyn Write + Send>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn syslog(mut self, syslog: SyslogConfig) -> Self {
        self.syslog = Some(syslog);
        self
    }

    /// Open the output and spawn the consumer tasks. Must be called from
    /// within a tokio runtime.
    pub fn build(self) -> io::Result<LogSink> {
        let writer = self.output.open()?;

        let (tx, rx) = mpsc::channel(self.capacity);
        let mut tasks = vec![tokio::task::spawn_blocking(move || consume(rx, writer))];

        let forward = self.syslog.map(|config| {
            let (forward_tx, forward_rx) = mpsc::channel(DEFAULT_CAPACITY);
            tasks.push(tokio::spawn(forward_to_syslog(config, forward_rx)));
            forward_tx
        });

        Ok(LogSink {
            inner: Arc::new(Inner {
                records: Mutex::new(Some(tx)),
                forward: Mutex::new(forward),
                fallback: Mutex::new(self.fallback),
                tasks: Mutex::new(tasks),
            }),
        })
    }
}

struct Inner {
    records: Mutex<Option<mpsc::Sender<LogRecord>>>,
    forward: Mutex<Option<mpsc::Sender<LogRecord>>>,
    fallback: Mutex<Box<dyn Write + Send>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap-to-clone handle to the sink
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<Inner>,
}

impl LogSink {
    pub fn builder() -> LogSinkBuilder {
        LogSinkBuilder::default()
    }

    pub fn from_config(config: &Config) -> io::Result<Self> {
        let mut builder = Self::builder();
        if let Some(path) = &config.log.file {
            builder = builder.output(SinkOutput::File {
                path: path.clone(),
                max_size: config.log.max_size_bytes,
                keep: config.log.keep_files,
            });
        }
        if config.syslog.enabled {
            builder = builder.syslog(config.syslog.clone());
        }
        builder.build()
    }

    pub fn log(&self, source: &str, level: Level, message: impl Into<String>) {
        self.record(LogRecord::new(source, level, message));
    }

    pub fn record(&self, record: LogRecord) {
        if let Some(forward) = lock(&self.inner.forward).as_ref() {
            if forward.try_send(record.clone()).is_err() {
                trace!("syslog forwarding queue full, dropping record");
            }
        }

        let outcome = match lock(&self.inner.records).as_ref() {
            Some(records) => records.try_send(record),
            None => Err(TrySendError::Closed(record)),
        };

        match outcome {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => self.write_fallback(&record, "(buffer full)"),
            Err(TrySendError::Closed(record)) => self.write_fallback(&record, "(sink closed)"),
        }
    }

    fn write_fallback(&self, record: &LogRecord, suffix: &str) {
        let mut fallback = lock(&self.inner.fallback);
        let _ = writeln!(fallback, "{} {suffix}", record.format_line());
    }

    /// Stop accepting records and wait until everything buffered is written.
    pub async fn close(&self) {
        lock(&self.inner.records).take();
        lock(&self.inner.forward).take();

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("log sink task failed: {e}");
            }
        }
        debug!("log sink closed");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn consume(mut rx: mpsc::Receiver<LogRecord>, mut writer: Box<dyn Write + Send>) {
    while let Some(record) = rx.blocking_recv() {
        if let Err(e) = writeln!(writer, "{}", record.format_line()).and_then(|_| writer.flush()) {
            warn!("failed to write log record: {e}");
        }
    }
    let _ = writer.flush();
}

async fn forward_to_syslog(config: SyslogConfig, mut rx: mpsc::Receiver<LogRecord>) {
    let mut client = SyslogClient::new(&config);

    while let Some(record) = rx.recv().await {
        let tag = format!("{}/{}", config.tag, record.source);
        if let Err(e) = client
            .write(
                record.level.syslog_severity(),
                record.timestamp,
                &tag,
                &record.message,
            )
            .await
        {
            warn!("failed to forward record to syslog: {e}");
        }
    }

    client.close().await;
}
