use crate::{
    cli::BenchMode,
    metrics::{Calculator, CounterSnapshot, LatencyMetrics},
    monitor::ResourceSummary,
    utils,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Final, immutable record of one benchmark session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub run_id: String,
    pub framework: String,
    pub mode: BenchMode,
    pub host: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub connections: usize,
    pub concurrency: usize,
    pub payload: usize,
    /// Calls attempted (echo) or messages sent (rate)
    pub total: u64,
    /// Measurement window
    pub elapsed_ns: u64,
    pub server_pid: u32,
    pub resources: ResourceSummary,
    pub details: ReportDetails,
}

/// Mode-specific part of a [`Report`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReportDetails {
    Echo(EchoSummary),
    Rate(RateSummary),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoSummary {
    pub success: u64,
    pub failed: u64,
    pub tps: f64,
    /// Warmup calls run before measurement; not part of any figure here
    pub warmup: u64,
    pub latency: LatencyMetrics,
}

impl EchoSummary {
    pub fn new(calculator: Calculator, warmup: u64) -> Self {
        Self {
            success: calculator.success,
            failed: calculator.failed,
            tps: calculator.tps,
            warmup,
            latency: calculator.latency,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateSummary {
    pub duration_ns: u64,
    /// Requested messages per second per connection
    pub send_rate: u32,
    pub limit: Option<u32>,
    /// Frames per batch
    pub batch_count: usize,
    pub batch_bytes: usize,
    /// Batches per second per connection
    pub tick_rate: u32,
    pub counters: CounterSnapshot,
    pub send_per_sec: f64,
    pub recv_per_sec: f64,
}

impl Report {
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} Benchmark Report: {}", self.mode, self.framework)?;
        writeln!(f, "  Run ID:             {}", self.run_id)?;
        writeln!(f, "  Target:             {} (pid {})", self.host, self.server_pid)?;
        writeln!(f, "  Connections:        {}", self.connections)?;
        writeln!(f, "  Concurrency:        {}", self.concurrency)?;
        writeln!(f, "  Payload:            {} bytes", self.payload)?;
        writeln!(f, "  Elapsed:            {}", utils::format_duration(self.elapsed()))?;

        match &self.details {
            ReportDetails::Echo(echo) => {
                writeln!(f, "  Total Calls:        {}", self.total)?;
                writeln!(f, "  Success:            {}", echo.success)?;
                writeln!(f, "  Failed:             {}", echo.failed)?;
                writeln!(f, "  TPS:                {:.2}", echo.tps)?;
                writeln!(
                    f,
                    "  Latency:            min {} / avg {} / max {} (std dev {})",
                    utils::format_duration_ns(echo.latency.min_ns),
                    utils::format_duration_ns(echo.latency.mean_ns as u64),
                    utils::format_duration_ns(echo.latency.max_ns),
                    utils::format_duration_ns(echo.latency.std_dev_ns as u64),
                )?;
                for p in &echo.latency.percentiles {
                    writeln!(
                        f,
                        "  TP{:<17} {}",
                        p.percentile,
                        utils::format_duration_ns(p.value_ns)
                    )?;
                }
            }
            ReportDetails::Rate(rate) => {
                writeln!(
                    f,
                    "  Batch:              {} messages, {} every {}",
                    rate.batch_count,
                    utils::format_bytes(rate.batch_bytes as u64),
                    utils::format_duration(Duration::from_secs_f64(1.0 / f64::from(rate.tick_rate.max(1)))),
                )?;
                writeln!(
                    f,
                    "  Sent:               {} ({}, {})",
                    rate.counters.send_count,
                    utils::format_bytes(rate.counters.send_bytes),
                    utils::format_message_rate(rate.send_per_sec)
                )?;
                writeln!(
                    f,
                    "  Received:           {} ({}, {})",
                    rate.counters.recv_count,
                    utils::format_bytes(rate.counters.recv_bytes),
                    utils::format_message_rate(rate.recv_per_sec)
                )?;
            }
        }

        let r = &self.resources;
        writeln!(
            f,
            "  Server CPU:         min {:.2}% / avg {:.2}% / max {:.2}%",
            r.cpu_min, r.cpu_avg, r.cpu_max
        )?;
        writeln!(
            f,
            "  Server RSS:         min {} / avg {} / max {}",
            utils::format_bytes(r.rss_min),
            utils::format_bytes(r.rss_avg),
            utils::format_bytes(r.rss_max)
        )?;
        write!(
            f,
            "  Server IO:          read {} / written {} ({} samples)",
            utils::format_bytes(r.read_bytes),
            utils::format_bytes(r.written_bytes),
            r.samples
        )
    }
}

/// Host details recorded next to the results for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub memory_gb: f64,
    pub benchmark_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BenchmarkMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_runs: usize,
    pub system_info: SystemInfo,
}

/// On-disk document written by [`ResultsManager::finalize`]
#[derive(Debug, Serialize, Deserialize)]
pub struct FinalBenchmarkResults {
    pub metadata: BenchmarkMetadata,
    pub reports: Vec<Report>,
}

/// Collects the reports of one invocation and writes them out.
pub struct ResultsManager {
    output_file: PathBuf,
    reports: Vec<Report>,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
            reports: Vec::new(),
        }
    }

    pub fn add_report(&mut self, report: Report) {
        info!("Adding {} report for {}", report.mode, report.framework);
        self.reports.push(report);
    }

    /// Write every collected report as one pretty JSON document.
    pub fn finalize(&self) -> Result<()> {
        info!("Finalizing benchmark results");
        let document = FinalBenchmarkResults {
            metadata: BenchmarkMetadata {
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                total_runs: self.reports.len(),
                system_info: Self::get_system_info(),
            },
            reports: self.reports.clone(),
        };

        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("Failed to write results to {:?}", self.output_file))?;

        info!("Results written to: {:?}", self.output_file);
        Ok(())
    }

    /// Print a one-line-per-report table to stdout.
    pub fn print_summary(&self) {
        let widths = [18, 6, 12, 12, 12, 10, 10];
        utils::print_table_separator(&widths);
        utils::print_table_row(
            &["Framework", "Mode", "Total", "OK / Recv", "Failed", "CPU avg", "RSS max"],
            &widths,
        );
        utils::print_table_separator(&widths);
        for report in &self.reports {
            let (ok, failed) = match &report.details {
                ReportDetails::Echo(echo) => (echo.success.to_string(), echo.failed.to_string()),
                ReportDetails::Rate(rate) => (rate.counters.recv_count.to_string(), "-".to_string()),
            };
            let mode = report.mode.to_string();
            let total = report.total.to_string();
            let cpu = format!("{:.2}%", report.resources.cpu_avg);
            let rss = utils::format_bytes(report.resources.rss_max);
            utils::print_table_row(
                &[&report.framework, &mode, &total, &ok, &failed, &cpu, &rss],
                &widths,
            );
        }
        utils::print_table_separator(&widths);
    }

    fn get_system_info() -> SystemInfo {
        SystemInfo {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: utils::get_cpu_cores(),
            memory_gb: Self::get_memory_gb(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }

    fn get_memory_gb() -> f64 {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let gb = system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        debug!("Total memory: {:.2} GB", gb);
        gb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PercentileValue;

    fn echo_report() -> Report {
        Report {
            run_id: "run-1".to_string(),
            framework: "nbio_std".to_string(),
            mode: BenchMode::Echo,
            host: "127.0.0.1:28001".to_string(),
            started_at: chrono::Utc::now(),
            connections: 10,
            concurrency: 10,
            payload: 16,
            total: 1000,
            elapsed_ns: 2_000_000_000,
            server_pid: 4242,
            resources: ResourceSummary::default(),
            details: ReportDetails::Echo(EchoSummary {
                success: 999,
                failed: 1,
                tps: 500.0,
                warmup: 50,
                latency: LatencyMetrics {
                    min_ns: 1_000,
                    max_ns: 9_000,
                    mean_ns: 2_500.0,
                    std_dev_ns: 300.0,
                    percentiles: vec![PercentileValue {
                        percentile: 99.0,
                        value_ns: 8_000,
                    }],
                    total_samples: 999,
                },
            }),
        }
    }

    fn rate_report() -> Report {
        Report {
            mode: BenchMode::Rate,
            total: 400,
            details: ReportDetails::Rate(RateSummary {
                duration_ns: 2_000_000_000,
                send_rate: 100,
                limit: None,
                batch_count: 100,
                batch_bytes: 2200,
                tick_rate: 1,
                counters: CounterSnapshot {
                    send_count: 400,
                    send_bytes: 6400,
                    recv_count: 0,
                    recv_bytes: 0,
                },
                send_per_sec: 200.0,
                recv_per_sec: 0.0,
            }),
            ..echo_report()
        }
    }

    #[test]
    fn test_report_display() {
        let echo = echo_report().to_string();
        assert!(echo.contains("Echo Benchmark Report: nbio_std"));
        assert!(echo.contains("Success:            999"));
        assert!(echo.contains("TP99"));

        let rate = rate_report().to_string();
        assert!(rate.contains("Rate Benchmark Report"));
        assert!(rate.contains("Sent:               400"));
    }

    #[test]
    fn test_details_are_tagged_by_kind() {
        let json = serde_json::to_value(rate_report()).unwrap();
        assert_eq!(json["mode"], "rate");
        assert_eq!(json["details"]["kind"], "rate");
        assert_eq!(json["details"]["counters"]["send_count"], 400);
    }

    #[test]
    fn test_finalize_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");

        let mut manager = ResultsManager::new(&path);
        manager.add_report(echo_report());
        manager.add_report(rate_report());
        manager.finalize().unwrap();

        let written: FinalBenchmarkResults =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written.metadata.total_runs, 2);
        assert_eq!(written.metadata.version, crate::VERSION);
        assert_eq!(written.reports.len(), 2);
        assert_eq!(written.reports[0].run_id, "run-1");
        assert!(matches!(written.reports[1].details, ReportDetails::Rate(_)));
    }

    #[test]
    fn test_finalize_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ResultsManager::new(&dir.path().join("missing").join("results.json"));
        assert!(manager.finalize().is_err());
    }
}
