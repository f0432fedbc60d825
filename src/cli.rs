use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// WebSocket load generator - closed-loop echo and open-loop rate benchmarks
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Load model to run
    #[clap(short = 'm', long, value_enum, default_value_t = BenchMode::Echo, help_heading = "Core Options")]
    pub mode: BenchMode,

    /// Framework identifier of the server under test, used to find its process
    #[clap(short = 'f', long, help_heading = "Core Options")]
    pub framework: String,

    /// Server address(es) as ip:port; connections are spread round-robin
    #[clap(long = "host", default_values_t = vec![crate::defaults::HOST.to_string()], num_args = 1.., help_heading = "Core Options")]
    pub hosts: Vec<String>,

    /// Request path used for the upgrade
    #[clap(long, default_value = crate::defaults::PATH)]
    pub path: String,

    /// Number of connections to open before the run
    #[clap(short = 'n', long, default_value_t = crate::defaults::CONNECTIONS)]
    pub connections: usize,

    /// Concurrent workers (defaults depend on the mode; clamped to connections x overlap)
    #[clap(short = 'c', long)]
    pub concurrency: Option<usize>,

    /// Total round trips in echo mode
    #[clap(short = 't', long, default_value_t = crate::defaults::TOTAL)]
    pub total: u64,

    /// Run duration in rate mode (e.g. "10s", "500ms", "2m")
    #[clap(short = 'd', long, value_parser = parse_duration, default_value = "10s")]
    pub duration: Duration,

    /// Payload size in bytes
    #[clap(short = 'b', long, default_value_t = crate::defaults::PAYLOAD_SIZE)]
    pub payload: usize,

    /// Messages per second per connection in rate mode
    #[clap(short = 'r', long, default_value_t = crate::defaults::SEND_RATE)]
    pub send_rate: u32,

    /// Global cap on sends per second across all workers
    #[clap(short = 'l', long)]
    pub limit: Option<u32>,

    /// Warmup round trips in echo mode (default: 5 per connection)
    #[clap(short = 'w', long)]
    pub warmup: Option<u64>,

    /// Percentiles to report for latency
    #[clap(long, value_delimiter = ',', default_values_t = crate::defaults::PERCENTILES.to_vec())]
    pub percentiles: Vec<f64>,

    /// Interval between resource samples of the server process
    #[clap(long, value_parser = parse_duration, default_value = "1s")]
    pub sample_interval: Duration,

    /// How many workers may share one connection in echo mode
    #[clap(long, default_value_t = 1)]
    pub overlap: usize,

    /// Deadline for one echo round trip (e.g. "10s", "500ms")
    #[clap(long, value_parser = parse_duration, default_value = "10s")]
    pub call_timeout: Duration,

    /// Server process id; skips the process table lookup
    #[clap(long)]
    pub pid: Option<u32>,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE)]
    pub output_file: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Also write logs to this file
    #[clap(long)]
    pub log_file: Option<PathBuf>,
}

/// Load models
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BenchMode {
    /// Closed loop: one request in flight per worker, latency measured
    #[clap(name = "echo")]
    Echo,

    /// Open loop: batches pushed at a fixed rate regardless of replies
    #[clap(name = "rate")]
    Rate,
}

impl std::fmt::Display for BenchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchMode::Echo => write!(f, "Echo"),
            BenchMode::Rate => write!(f, "Rate"),
        }
    }
}

/// Parse duration from string (e.g., "10s", "500ms", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s")
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Invalid duration: {}", s));
    }

    let secs = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_bench_mode_display() {
        assert_eq!(BenchMode::Echo.to_string(), "Echo");
        assert_eq!(BenchMode::Rate.to_string(), "Rate");
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["ws-loadgen", "--framework", "nbio"]);
        assert_eq!(args.mode, BenchMode::Echo);
        assert_eq!(args.hosts, vec![crate::defaults::HOST.to_string()]);
        assert_eq!(args.payload, 1024);
        assert_eq!(args.percentiles, vec![50.0, 75.0, 90.0, 95.0, 99.0]);
        assert_eq!(args.duration, Duration::from_secs(10));
        assert_eq!(args.sample_interval, Duration::from_secs(1));
        assert_eq!(args.call_timeout, crate::defaults::CALL_TIMEOUT);
        assert!(args.concurrency.is_none());
        assert!(args.warmup.is_none());
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn test_args_rate_mode() {
        let args = Args::parse_from([
            "ws-loadgen",
            "-m",
            "rate",
            "-f",
            "nbio",
            "--host",
            "10.0.0.1:9000",
            "10.0.0.2:9000",
            "-r",
            "200",
            "-d",
            "2s",
            "--percentiles",
            "50,99.9",
            "-vv",
        ]);
        assert_eq!(args.mode, BenchMode::Rate);
        assert_eq!(args.hosts.len(), 2);
        assert_eq!(args.send_rate, 200);
        assert_eq!(args.duration, Duration::from_secs(2));
        assert_eq!(args.percentiles, vec![50.0, 99.9]);
        assert_eq!(args.verbose, 2);
    }
}
