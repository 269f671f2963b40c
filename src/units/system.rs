//! System metrics monitor backed by `sysinfo`.
//!
//! Sampling blocks for the CPU measurement window, so every sample runs on
//! the blocking pool. The `System` handle moves into the blocking task and
//! back out again between ticks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{Components, Disks, Networks, System};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument};

use crate::config::SystemMonitorConfig;
use crate::telemetry::Level;

use super::{MonitorUnit, UnitContext, UnitCore, UnitError, ticker};

const SOURCE: &str = "Metrics";

#[derive(Debug, Clone, Serialize)]
pub struct CpuSample {
    pub usage_percent: Vec<f32>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemorySample {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskSample {
    pub mount: String,
    pub total: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NetworkSample {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemperatureSample {
    pub sensor: String,
    pub celsius: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemSample {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemorySample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disks: Option<Vec<DiskSample>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Vec<TemperatureSample>>,
}

/// Take one sample of the enabled categories.
pub fn sample(sys: &mut System, settings: &SystemMonitorConfig) -> SystemSample {
    let cpu = settings.cpu.then(|| {
        sys.refresh_cpu_usage();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        sys.refresh_cpu_usage();

        let cpus = sys.cpus();
        CpuSample {
            usage_percent: cpus.iter().map(|cpu| cpu.cpu_usage()).collect(),
            count: cpus.len(),
        }
    });

    let memory = settings.memory.then(|| {
        sys.refresh_memory();
        let total = sys.total_memory();
        let used = sys.used_memory();
        MemorySample {
            total,
            used,
            free: sys.free_memory(),
            usage_percent: percent(used, total),
        }
    });

    let disks = settings.disk.then(|| {
        Disks::new_with_refreshed_list()
            .iter()
            .map(|disk| DiskSample {
                mount: disk.mount_point().display().to_string(),
                total: disk.total_space(),
                available: disk.available_space(),
            })
            .collect()
    });

    let network = settings.network.then(|| {
        Networks::new_with_refreshed_list().iter().fold(
            NetworkSample::default(),
            |mut sum, (_, data)| {
                sum.bytes_sent += data.total_transmitted();
                sum.bytes_recv += data.total_received();
                sum.packets_sent += data.total_packets_transmitted();
                sum.packets_recv += data.total_packets_received();
                sum
            },
        )
    });

    let temperature = settings.temperature.then(|| {
        Components::new_with_refreshed_list()
            .iter()
            .filter_map(|component| {
                let celsius = component.temperature()?;
                // sensors without a reading report zero or NaN
                (celsius > 0.0).then(|| TemperatureSample {
                    sensor: component.label().to_string(),
                    celsius,
                })
            })
            .collect()
    });

    SystemSample {
        timestamp: Utc::now(),
        cpu,
        memory,
        disks,
        network,
        temperature,
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

pub struct SystemUnit {
    core: UnitCore,
    settings: SystemMonitorConfig,
}

impl SystemUnit {
    pub fn new(name: impl Into<String>, settings: SystemMonitorConfig) -> Self {
        Self {
            core: UnitCore::new(name),
            settings,
        }
    }
}

impl MonitorUnit for SystemUnit {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn init(&mut self, context: UnitContext) -> Result<(), UnitError> {
        if self.settings.interval_secs == 0 {
            return Err(self.core.invalid("interval_secs must be greater than zero"));
        }
        if !self.settings.any_category() {
            return Err(self.core.invalid("no metric category enabled"));
        }
        self.core.bind(context);
        Ok(())
    }

    fn start(&mut self, tracker: &TaskTracker) -> Result<(), UnitError> {
        let (context, token) = self.core.begin()?;
        tracker.spawn(run(
            self.core.name().to_string(),
            self.settings.clone(),
            context,
            token,
        ));
        Ok(())
    }

    fn stop(&self) {
        self.core.cancel();
    }
}

#[instrument(skip_all, fields(unit = %unit))]
async fn run(
    unit: String,
    settings: SystemMonitorConfig,
    context: UnitContext,
    token: CancellationToken,
) {
    debug!("starting system monitor");
    let mut ticker = ticker(Duration::from_secs(settings.interval_secs));
    let mut sys = Some(System::new());

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut taken = sys.take().unwrap_or_else(System::new);
        let categories = settings.clone();
        let sampling = tokio::task::spawn_blocking(move || {
            let sample = sample(&mut taken, &categories);
            (taken, sample)
        });

        let sample = tokio::select! {
            _ = token.cancelled() => break,
            joined = sampling => match joined {
                Ok((returned, sample)) => {
                    sys = Some(returned);
                    sample
                }
                Err(e) => {
                    context.log(SOURCE, Level::Error, format!("failed to collect metrics: {e}"));
                    continue;
                }
            },
        };

        match serde_json::to_string(&sample) {
            Ok(line) => context.log(SOURCE, Level::Info, line),
            Err(e) => {
                context.log(SOURCE, Level::Error, format!("failed to encode metrics: {e}"));
                continue;
            }
        }

        if settings.forward {
            context.forward("system metrics", &sample, &token).await;
        }
    }

    debug!("system monitor stopped");
}
