//! # Benchmark Sessions
//!
//! A session binds a [`BenchmarkConfig`] to a live [`ConnectionPool`], runs
//! one load model against it and produces a [`Report`].
//!
//! ## Load Models
//!
//! - [`EchoBenchmark`]: closed loop. Every worker borrows a connection,
//!   sends one frame, waits for the echo and verifies it byte for byte.
//!   A warmup pass runs first and its figures are thrown away.
//! - [`RateBenchmark`]: open loop. Each worker owns a fixed team of
//!   connections and writes a pre-built batch to every member on each tick,
//!   skipping members whose unacknowledged backlog is too deep. Replies are
//!   counted by a per-connection dispatch task.
//!
//! ## Session Lifecycle
//!
//! 1. **Setup**: resolve the server process and attach the resource sampler.
//!    Any failure here aborts the session before traffic is generated.
//! 2. **Warmup** (echo only): prime the server and the connections.
//! 3. **Sampling start**: begin sampling, then wait one interval so the first
//!    reading is not a cold one.
//! 4. **Measurement**: run the load model.
//! 5. **Teardown**: stop sampling and assemble the report.

pub mod echo;
pub mod rate;

pub use echo::EchoBenchmark;
pub use rate::RateBenchmark;

use crate::{
    cli::{Args, BenchMode},
    defaults,
    monitor::{FixedPidResolver, PidResolver, ProcessSampler, ProcessTableResolver, ResourceSampler, SampleOptions},
    pool::ConnectionPool,
    results::Report,
    utils,
    ws::CodecError,
};
use anyhow::Result;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Fatal setup and configuration errors. Per-call failures never end up
/// here; they are counted in the report instead.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no connections to benchmark")]
    NoConnections,

    #[error("cannot find the server process for '{framework}' at {host}: {reason}")]
    PidResolution {
        framework: String,
        host: String,
        reason: String,
    },

    #[error("cannot sample process {pid}: {reason}")]
    SamplerAttach { pid: u32, reason: String },

    #[error("cannot build send batch: {0}")]
    Batch(#[from] CodecError),
}

/// A helper struct to provide a consistent, single source of truth for
/// displaying the session configuration.
pub struct BenchmarkConfigDisplay<'a> {
    pub config: &'a BenchmarkConfig,
    pub connections: usize,
}

impl std::fmt::Display for BenchmarkConfigDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config;
        let concurrency_str = match config.concurrency {
            Some(_) => format!("{} (User-provided)", config.concurrency_for(self.connections)),
            None => format!("{} (Automatic)", config.concurrency_for(self.connections)),
        };

        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Starting {} Benchmark for: {}", config.mode, config.framework)?;
        writeln!(f, "  Targets:            {}", config.hosts.join(", "))?;
        writeln!(f, "  Connections:        {}", self.connections)?;
        writeln!(f, "  Concurrency:        {}", concurrency_str)?;
        writeln!(f, "  Payload Size:       {} bytes", config.payload)?;
        match config.mode {
            BenchMode::Echo => {
                writeln!(f, "  Total Calls:        {}", config.total)?;
                writeln!(f, "  Warmup Calls:       {}", config.warmup_for(self.connections))?;
                if config.overlap > 1 {
                    writeln!(f, "  Connection Overlap: {}", config.overlap)?;
                }
                writeln!(f, "  Call Timeout:       {:?}", config.call_timeout)?;
            }
            BenchMode::Rate => {
                writeln!(f, "  Test Duration:      {:?}", config.duration)?;
                writeln!(f, "  Send Rate:          {} msg/s per connection", config.send_rate)?;
            }
        }
        let limit_str = config
            .limit
            .map_or("Not set".to_string(), |l| format!("{} msg/s", l));
        writeln!(f, "  Send Limit:         {}", limit_str)?;
        let pid_str = config
            .pid
            .map_or("Process table lookup".to_string(), |p| p.to_string());
        writeln!(f, "  Server Process:     {}", pid_str)?;
        writeln!(f, "  Sample Interval:    {:?}", config.sample_interval)?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Configuration for one benchmark session
#[derive(Clone, Debug)]
pub struct BenchmarkConfig {
    pub mode: BenchMode,

    /// Identifier of the server under test; used for process lookup and
    /// carried into the report
    pub framework: String,

    /// Target addresses; connections are spread over them round-robin
    pub hosts: Vec<String>,

    /// Request path for the upgrade
    pub path: String,

    /// Connections to open before the session starts
    pub connections: usize,

    /// Worker count; `None` picks the mode's default. Clamped to the
    /// connection count, times `overlap` in echo mode.
    pub concurrency: Option<usize>,

    /// Measured round trips (echo)
    pub total: u64,

    /// Measurement window (rate)
    pub duration: Duration,

    pub payload: usize,

    /// Messages per second per connection (rate)
    pub send_rate: u32,

    /// Global token-bucket cap on sends per second
    pub limit: Option<u32>,

    /// Warmup round trips; `None` means 5 per connection
    pub warmup: Option<u64>,

    pub percentiles: Vec<f64>,

    pub sample_interval: Duration,

    /// Times each connection appears in the echo checkout queue
    pub overlap: usize,

    /// Deadline for one echo round trip; a late reply is a failed call
    pub call_timeout: Duration,

    /// Server pid, bypassing the process table lookup
    pub pid: Option<u32>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            mode: BenchMode::Echo,
            framework: String::new(),
            hosts: vec![defaults::HOST.to_string()],
            path: defaults::PATH.to_string(),
            connections: defaults::CONNECTIONS,
            concurrency: None,
            total: defaults::TOTAL,
            duration: defaults::DURATION,
            payload: defaults::PAYLOAD_SIZE,
            send_rate: defaults::SEND_RATE,
            limit: None,
            warmup: None,
            percentiles: defaults::PERCENTILES.to_vec(),
            sample_interval: defaults::SAMPLE_INTERVAL,
            overlap: 1,
            call_timeout: defaults::CALL_TIMEOUT,
            pid: None,
        }
    }
}

impl BenchmarkConfig {
    /// Create a validated configuration from CLI arguments
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            mode: args.mode,
            framework: args.framework.clone(),
            hosts: args.hosts.clone(),
            path: args.path.clone(),
            connections: args.connections,
            concurrency: args.concurrency,
            total: args.total,
            duration: args.duration,
            payload: args.payload,
            send_rate: args.send_rate,
            limit: args.limit,
            warmup: args.warmup,
            percentiles: args.percentiles.clone(),
            sample_interval: args.sample_interval,
            overlap: args.overlap,
            call_timeout: args.call_timeout,
            pid: args.pid,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations no session could run with
    pub fn validate(&self) -> Result<(), BenchError> {
        let invalid = |e: anyhow::Error| BenchError::InvalidConfig(e.to_string());

        utils::validate_payload_size(self.payload).map_err(invalid)?;
        utils::validate_percentiles(&self.percentiles).map_err(invalid)?;
        utils::validate_hosts(&self.hosts).map_err(invalid)?;
        if let Some(concurrency) = self.concurrency {
            utils::validate_concurrency(concurrency).map_err(invalid)?;
        }
        if self.connections == 0 {
            return Err(BenchError::InvalidConfig(
                "connection count must be greater than zero".to_string(),
            ));
        }
        if self.sample_interval.is_zero() {
            return Err(BenchError::InvalidConfig(
                "sampling interval must be greater than zero".to_string(),
            ));
        }
        if self.overlap == 0 {
            return Err(BenchError::InvalidConfig(
                "overlap must be at least 1".to_string(),
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(BenchError::InvalidConfig(
                "call timeout must be greater than zero".to_string(),
            ));
        }
        match self.mode {
            BenchMode::Echo if self.total == 0 => Err(BenchError::InvalidConfig(
                "total calls must be greater than zero".to_string(),
            )),
            BenchMode::Rate if self.send_rate == 0 => Err(BenchError::InvalidConfig(
                "send rate must be greater than zero".to_string(),
            )),
            BenchMode::Rate if self.duration.is_zero() => Err(BenchError::InvalidConfig(
                "duration must be greater than zero".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Worker count for a pool of `connections`
    pub fn concurrency_for(&self, connections: usize) -> usize {
        let requested = self.concurrency.unwrap_or(match self.mode {
            BenchMode::Echo => utils::get_cpu_cores() * defaults::ECHO_CONCURRENCY_PER_CORE,
            BenchMode::Rate => defaults::RATE_CONCURRENCY,
        });
        requested.clamp(1, self.worker_ceiling(connections))
    }

    /// Most workers that can hold a connection at once: every checkout slot
    /// in echo mode, one team member per worker in rate mode.
    fn worker_ceiling(&self, connections: usize) -> usize {
        let connections = connections.max(1);
        match self.mode {
            BenchMode::Echo => connections.saturating_mul(self.overlap.max(1)),
            BenchMode::Rate => connections,
        }
    }

    /// Warmup round trips for a pool of `connections`
    pub fn warmup_for(&self, connections: usize) -> u64 {
        self.warmup.unwrap_or_else(|| {
            (connections as u64 * defaults::WARMUP_PER_CONNECTION).min(defaults::WARMUP_CAP)
        })
    }

    /// Address used for process lookup and reporting
    pub fn primary_host(&self) -> &str {
        self.hosts.first().map(String::as_str).unwrap_or(defaults::HOST)
    }

    /// The resolver implied by the configuration
    pub fn resolver(&self) -> Box<dyn PidResolver> {
        match self.pid {
            Some(pid) => Box::new(FixedPidResolver(pid)),
            None => Box::new(ProcessTableResolver),
        }
    }

    pub(crate) fn effective_concurrency(&self, connections: usize) -> usize {
        let concurrency = self.concurrency_for(connections);
        if let Some(requested) = self.concurrency {
            if requested > concurrency {
                warn!(
                    "Concurrency {} exceeds {} connections (overlap {}); using {}",
                    requested, connections, self.overlap, concurrency
                );
            }
        }
        concurrency
    }
}

/// Run the session described by `config` against `pool`.
pub async fn run(config: BenchmarkConfig, pool: ConnectionPool) -> Result<Report> {
    println!(
        "{}",
        BenchmarkConfigDisplay {
            config: &config,
            connections: pool.len(),
        }
    );
    match config.mode {
        BenchMode::Echo => EchoBenchmark::new(config, pool).run().await,
        BenchMode::Rate => RateBenchmark::new(config, pool).run().await,
    }
}

/// Find the server process and attach a sampler to it.
pub(crate) fn resolve_subject(
    config: &BenchmarkConfig,
    resolver: &dyn PidResolver,
) -> Result<(u32, Box<dyn ResourceSampler>), BenchError> {
    let pid = resolver.resolve(&config.framework, config.primary_host())?;
    let sampler = ProcessSampler::attach(pid)?;
    info!("Server process for '{}' is pid {}", config.framework, pid);
    Ok((pid, Box::new(sampler)))
}

/// Start sampling and let one interval pass before measurement begins.
pub(crate) async fn begin_sampling(
    sampler: &mut dyn ResourceSampler,
    interval: Duration,
) -> Result<(), BenchError> {
    sampler.start(SampleOptions { interval }).await?;
    tokio::time::sleep(interval).await;
    Ok(())
}
