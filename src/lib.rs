//! # WS Loadgen Library
//!
//! A load generator for message-framed request/response servers. It drives
//! many persistent connections against one target and measures both what the
//! client observes and what the server process consumes while serving it.
//!
//! ## Load Models
//!
//! - **Echo**: closed loop. Each worker borrows a connection, sends one frame,
//!   waits for the echoed reply and verifies it byte for byte. Reports TPS and
//!   nearest-rank latency percentiles.
//! - **Rate**: open loop. Each connection is fed fixed-size batches of frames
//!   on a ticker for a fixed duration, with a per-connection backpressure
//!   ceiling. Reports messages and bytes sent and received.
//!
//! ## Architecture Overview
//!
//! - `ws`: frame codec, batch builder, connection wrapper and dialer
//! - `pool`: connection checkout queue, team partitioning, buffer reuse
//! - `rate`: pacing ticker, optional token-bucket limiter, done signal
//! - `metrics`: counters, latency collection and percentile calculation
//! - `monitor`: server process resolution and CPU/RSS/IO sampling
//! - `benchmark`: session configuration and the two session drivers
//! - `results`: the final report and its JSON/console output
//! - `cli`, `logging`, `utils`: binary plumbing
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use ws_loadgen::{benchmark, pool::ConnectionPool, ws, BenchmarkConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BenchmarkConfig {
//!         framework: "nbio_std".to_string(),
//!         connections: 100,
//!         total: 100_000,
//!         ..Default::default()
//!     };
//!
//!     let conns = ws::dial_all(&config.hosts, &config.path, config.connections).await?;
//!     let report = benchmark::run(config, ConnectionPool::new(conns)).await?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

/// Session configuration and the echo/rate drivers
pub mod benchmark;

/// Command-line interface and argument parsing
pub mod cli;

pub mod logging;

/// Counters, latency collection and percentile analysis
pub mod metrics;

/// Server process resolution and resource sampling
pub mod monitor;

pub mod pool;

/// Pacing, rate limiting and cooperative shutdown
pub mod rate;

/// Final report and output handling
pub mod results;

pub mod utils;

/// Frame codec, connections and dialing
pub mod ws;

pub use benchmark::{BenchError, BenchmarkConfig, EchoBenchmark, RateBenchmark};
pub use cli::{Args, BenchMode};
pub use metrics::{CounterSnapshot, LatencyMetrics};
pub use monitor::{PidResolver, ResourceSampler, ResourceSummary};
pub use results::{Report, ReportDetails, ResultsManager};

/// Crate version recorded in every results file
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values and tuning constants
pub mod defaults {
    use std::time::Duration;

    /// Target address when `--host` is not given
    pub const HOST: &str = "127.0.0.1:28001";

    /// Upgrade request path
    pub const PATH: &str = "/ws";

    pub const CONNECTIONS: usize = 1000;

    /// Measured calls in echo mode
    pub const TOTAL: u64 = 1_000_000;

    /// Rate mode run length
    pub const DURATION: Duration = Duration::from_secs(10);

    /// Payload bytes per message
    pub const PAYLOAD_SIZE: usize = 1024;

    /// Messages per second per connection in rate mode
    pub const SEND_RATE: u32 = 1;

    pub const PERCENTILES: [f64; 5] = [50.0, 75.0, 90.0, 95.0, 99.0];

    /// Resource sampling period
    pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

    pub const OUTPUT_FILE: &str = "benchmark_results.json";

    /// Echo workers per logical core when concurrency is not given
    pub const ECHO_CONCURRENCY_PER_CORE: usize = 1000;

    /// Rate workers when concurrency is not given
    pub const RATE_CONCURRENCY: usize = 50_000;

    /// Warmup calls per connection
    pub const WARMUP_PER_CONNECTION: u64 = 5;

    /// Upper bound on warmup calls
    pub const WARMUP_CAP: u64 = 2_000_000;

    /// Largest batch written in one go in rate mode
    pub const BATCH_MAX_BYTES: usize = 8 * 1024;

    /// A connection is skipped once this many batches are unanswered
    pub const BACKPRESSURE_BATCHES: u64 = 5;

    /// Pre-generated echo payloads
    pub const PAYLOAD_VARIANTS: usize = 1024;

    /// Memory ceiling for the pre-generated echo payloads
    pub const PAYLOAD_VARIANT_BUDGET: usize = 64 * 1024 * 1024;

    /// Deadline for one echo round trip
    pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

    /// Deadline for one batch write in rate mode
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
}
