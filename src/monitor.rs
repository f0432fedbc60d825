//! Resource usage of the server under test.
//!
//! A [`ResourceSampler`] polls one external process on a fixed interval
//! between `start` and `stop` and reduces the series to min/avg/max figures.
//! A [`PidResolver`] finds that process from the framework name and the
//! address it listens on.

use crate::benchmark::BenchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Sampling configuration
#[derive(Debug, Clone)]
pub struct SampleOptions {
    pub interval: Duration,
}

/// One reading of the watched process
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    /// Percent of one core; may exceed 100 on multi-threaded servers
    pub cpu_percent: f32,
    pub rss_bytes: u64,
    /// Cumulative since process start
    pub total_read_bytes: u64,
    /// Cumulative since process start
    pub total_written_bytes: u64,
}

/// Aggregate of a sampling window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub cpu_min: f64,
    pub cpu_avg: f64,
    pub cpu_max: f64,
    pub rss_min: u64,
    pub rss_avg: u64,
    pub rss_max: u64,
    /// Bytes read by the process during the window
    pub read_bytes: u64,
    /// Bytes written by the process during the window
    pub written_bytes: u64,
    pub samples: usize,
}

impl ResourceSummary {
    pub fn from_samples(samples: &[ResourceSample]) -> Self {
        let (first, last) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Self::default(),
        };
        let n = samples.len();

        let cpu = samples.iter().map(|s| f64::from(s.cpu_percent));
        let cpu_min = cpu.clone().fold(f64::INFINITY, f64::min);
        let cpu_max = cpu.clone().fold(f64::NEG_INFINITY, f64::max);
        let cpu_avg = cpu.sum::<f64>() / n as f64;

        let rss = samples.iter().map(|s| s.rss_bytes);
        let rss_min = rss.clone().min().unwrap_or(0);
        let rss_max = rss.clone().max().unwrap_or(0);
        let rss_avg = (rss.map(u128::from).sum::<u128>() / n as u128) as u64;

        Self {
            cpu_min,
            cpu_avg,
            cpu_max,
            rss_min,
            rss_avg,
            rss_max,
            read_bytes: last.total_read_bytes.saturating_sub(first.total_read_bytes),
            written_bytes: last
                .total_written_bytes
                .saturating_sub(first.total_written_bytes),
            samples: n,
        }
    }
}

/// Periodic resource sampler bracketing a measurement window
#[async_trait]
pub trait ResourceSampler: Send {
    /// Begin sampling in the background.
    async fn start(&mut self, options: SampleOptions) -> Result<(), BenchError>;

    /// End sampling and summarize the window. Returns an empty summary if
    /// sampling never started.
    async fn stop(&mut self) -> ResourceSummary;
}

struct Running {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Vec<ResourceSample>>,
}

/// Samples one OS process through `sysinfo`.
pub struct ProcessSampler {
    pid: Pid,
    running: Option<Running>,
}

impl ProcessSampler {
    /// Verify `pid` exists and can be read.
    pub fn attach(pid: u32) -> Result<Self, BenchError> {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        refresh(&mut system, pid);
        if system.process(pid).is_none() {
            return Err(BenchError::SamplerAttach {
                pid: pid.as_u32(),
                reason: "process not found".to_string(),
            });
        }
        Ok(Self { pid, running: None })
    }
}

fn refresh_kind() -> ProcessRefreshKind {
    ProcessRefreshKind::new()
        .with_cpu()
        .with_memory()
        .with_disk_usage()
}

fn refresh(system: &mut System, pid: Pid) {
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), true, refresh_kind());
}

fn read_sample(system: &System, pid: Pid) -> Option<ResourceSample> {
    let process = system.process(pid)?;
    let disk = process.disk_usage();
    Some(ResourceSample {
        cpu_percent: process.cpu_usage(),
        rss_bytes: process.memory(),
        total_read_bytes: disk.total_read_bytes,
        total_written_bytes: disk.total_written_bytes,
    })
}

#[async_trait]
impl ResourceSampler for ProcessSampler {
    async fn start(&mut self, options: SampleOptions) -> Result<(), BenchError> {
        if self.running.is_some() {
            return Ok(());
        }
        if options.interval.is_zero() {
            return Err(BenchError::InvalidConfig(
                "sampling interval must be greater than zero".to_string(),
            ));
        }

        let pid = self.pid;
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut system = System::new();
            // CPU usage is a delta between refreshes; prime the first one.
            refresh(&mut system, pid);

            let mut ticker =
                tokio::time::interval_at(Instant::now() + options.interval, options.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut samples = Vec::new();
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        refresh(&mut system, pid);
                        match read_sample(&system, pid) {
                            Some(sample) => samples.push(sample),
                            None => debug!("Process {} not visible in this sample", pid),
                        }
                    }
                }
            }
            samples
        });

        debug!("Sampling pid {} every {:?}", self.pid, options.interval);
        self.running = Some(Running { stop, handle });
        Ok(())
    }

    async fn stop(&mut self) -> ResourceSummary {
        let Some(running) = self.running.take() else {
            return ResourceSummary::default();
        };
        let _ = running.stop.send(());
        match running.handle.await {
            Ok(samples) => ResourceSummary::from_samples(&samples),
            Err(e) => {
                warn!("Resource sampler for pid {} failed: {}", self.pid, e);
                ResourceSummary::default()
            }
        }
    }
}

/// Maps a framework identifier and listen address to an OS process id.
pub trait PidResolver: Send + Sync {
    fn resolve(&self, framework: &str, host: &str) -> Result<u32, BenchError>;
}

/// Always resolves to the given pid.
#[derive(Debug, Clone, Copy)]
pub struct FixedPidResolver(pub u32);

impl PidResolver for FixedPidResolver {
    fn resolve(&self, _framework: &str, _host: &str) -> Result<u32, BenchError> {
        Ok(self.0)
    }
}

/// Searches the OS process table.
///
/// A process matches when its name or any command-line argument contains the
/// framework identifier. With several matches, those whose command line
/// mentions the target port win; the lowest pid breaks any remaining tie.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTableResolver;

impl PidResolver for ProcessTableResolver {
    fn resolve(&self, framework: &str, host: &str) -> Result<u32, BenchError> {
        let failure = |reason: &str| BenchError::PidResolution {
            framework: framework.to_string(),
            host: host.to_string(),
            reason: reason.to_string(),
        };
        if framework.is_empty() {
            return Err(failure("no framework given"));
        }

        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::OnlyIfNotSet),
        );
        let own = sysinfo::get_current_pid().ok();

        let mut candidates: Vec<(u32, String)> = system
            .processes()
            .iter()
            .filter(|(pid, _)| Some(**pid) != own)
            .filter_map(|(pid, process)| {
                let name = process.name().to_string_lossy().into_owned();
                let cmdline = process
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" ");
                (name.contains(framework) || cmdline.contains(framework))
                    .then(|| (pid.as_u32(), cmdline))
            })
            .collect();

        if candidates.len() > 1 {
            if let Some(port) = host.rsplit(':').next().filter(|p| !p.is_empty()) {
                let with_port: Vec<_> = candidates
                    .iter()
                    .filter(|(_, cmdline)| cmdline.contains(port))
                    .cloned()
                    .collect();
                if !with_port.is_empty() {
                    candidates = with_port;
                }
            }
        }

        candidates.sort_by_key(|(pid, _)| *pid);
        match candidates.first() {
            Some((pid, _)) => {
                if candidates.len() > 1 {
                    warn!(
                        "{} processes match '{}'; using pid {}",
                        candidates.len(),
                        framework,
                        pid
                    );
                }
                Ok(*pid)
            }
            None => Err(failure("no matching process")),
        }
    }
}
