use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Session-wide send/receive counters.
///
/// Written concurrently by every worker and by the receive dispatch tasks;
/// read once all of them have stopped.
#[derive(Debug, Default)]
pub struct SessionCounters {
    send_count: AtomicU64,
    send_bytes: AtomicU64,
    recv_count: AtomicU64,
    recv_bytes: AtomicU64,
}

/// Point-in-time copy of [`SessionCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub send_count: u64,
    pub send_bytes: u64,
    pub recv_count: u64,
    pub recv_bytes: u64,
}

impl SessionCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_send(&self, messages: u64, bytes: u64) {
        self.send_count.fetch_add(messages, Ordering::Relaxed);
        self.send_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_recv(&self, messages: u64, bytes: u64) {
        self.recv_count.fetch_add(messages, Ordering::Relaxed);
        self.recv_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            send_count: self.send_count.load(Ordering::Acquire),
            send_bytes: self.send_bytes.load(Ordering::Acquire),
            recv_count: self.recv_count.load(Ordering::Acquire),
            recv_bytes: self.recv_bytes.load(Ordering::Acquire),
        }
    }
}

/// Comprehensive latency metrics including percentiles and statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub std_dev_ns: f64,
    pub percentiles: Vec<PercentileValue>,
    pub total_samples: usize,
}

/// Percentile value pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    pub percentile: f64,
    pub value_ns: u64,
}

/// Per-call latency samples.
///
/// Keeps every sample so percentiles are exact nearest-rank values; the HDR
/// histogram alongside supplies the standard deviation.
pub struct LatencyCollector {
    samples: Vec<u64>,
    histogram: Histogram<u64>,
}

impl LatencyCollector {
    /// Create a collector pre-sized for `capacity` samples
    pub fn new(capacity: usize) -> Result<Self> {
        // 3 significant figures, auto-resizing
        let histogram = Histogram::<u64>::new(3)?;
        Ok(Self {
            samples: Vec::with_capacity(capacity),
            histogram,
        })
    }

    /// Record a latency measurement
    pub fn record(&mut self, latency: Duration) -> Result<()> {
        let latency_ns = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.histogram.record(latency_ns)?;
        self.samples.push(latency_ns);
        Ok(())
    }

    /// Fold another worker's samples into this collector
    pub fn merge(&mut self, other: LatencyCollector) -> Result<()> {
        self.histogram.add(&other.histogram)?;
        self.samples.extend(other.samples);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Consume the sample set and compute the final statistics.
    pub fn into_metrics(mut self, percentiles: &[f64]) -> LatencyMetrics {
        if self.samples.is_empty() {
            return LatencyMetrics {
                percentiles: percentiles
                    .iter()
                    .map(|&p| PercentileValue {
                        percentile: p,
                        value_ns: 0,
                    })
                    .collect(),
                ..LatencyMetrics::default()
            };
        }

        self.samples.sort_unstable();
        let total: u128 = self.samples.iter().map(|&v| u128::from(v)).sum();
        let n = self.samples.len();

        LatencyMetrics {
            min_ns: self.samples[0],
            max_ns: self.samples[n - 1],
            mean_ns: total as f64 / n as f64,
            std_dev_ns: self.histogram.stdev(),
            percentiles: percentiles
                .iter()
                .map(|&p| PercentileValue {
                    percentile: p,
                    value_ns: nearest_rank(&self.samples, p),
                })
                .collect(),
            total_samples: n,
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
///
/// Rank is `ceil(p / 100 * n)` clamped to `1..=n`. Returns 0 for an empty
/// slice.
pub fn nearest_rank(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

/// Outcome tally of one closed-loop worker (or, after merging, of all).
pub struct CallStats {
    pub success: u64,
    pub failed: u64,
    pub latency: LatencyCollector,
}

impl CallStats {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            success: 0,
            failed: 0,
            latency: LatencyCollector::new(capacity)?,
        })
    }

    /// Successful calls contribute a latency sample; failures do not.
    pub fn record_success(&mut self, latency: Duration) -> Result<()> {
        self.success += 1;
        self.latency.record(latency)
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn merge(&mut self, other: CallStats) -> Result<()> {
        self.success += other.success;
        self.failed += other.failed;
        self.latency.merge(other.latency)
    }

    pub fn total(&self) -> u64 {
        self.success + self.failed
    }
}

/// Final closed-loop figures: outcome counts, latency and TPS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calculator {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub elapsed_ns: u64,
    pub tps: f64,
    pub latency: LatencyMetrics,
}

impl Calculator {
    pub fn new(stats: CallStats, elapsed: Duration, percentiles: &[f64]) -> Self {
        let total = stats.total();
        let secs = elapsed.as_secs_f64();
        let tps = if secs > 0.0 { total as f64 / secs } else { 0.0 };
        Self {
            total,
            success: stats.success,
            failed: stats.failed,
            elapsed_ns: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
            tps,
            latency: stats.latency.into_metrics(percentiles),
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed_ns)
    }
}

/// Messages per second, 0 for an empty window
pub fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_rank() {
        let sorted: Vec<u64> = (1..=10).collect();
        assert_eq!(nearest_rank(&sorted, 50.0), 5);
        assert_eq!(nearest_rank(&sorted, 90.0), 9);
        assert_eq!(nearest_rank(&sorted, 95.0), 10);
        assert_eq!(nearest_rank(&sorted, 99.0), 10);
        assert_eq!(nearest_rank(&sorted, 100.0), 10);
        assert_eq!(nearest_rank(&sorted, 0.0), 1);
        assert_eq!(nearest_rank(&[], 50.0), 0);
        assert_eq!(nearest_rank(&[7], 75.0), 7);
    }

    #[test]
    fn test_latency_collector() {
        let mut collector = LatencyCollector::new(3).unwrap();
        collector.record(Duration::from_millis(3)).unwrap();
        collector.record(Duration::from_millis(1)).unwrap();
        collector.record(Duration::from_millis(2)).unwrap();

        let metrics = collector.into_metrics(&[50.0, 99.0]);
        assert_eq!(metrics.total_samples, 3);
        assert_eq!(metrics.min_ns, 1_000_000);
        assert_eq!(metrics.max_ns, 3_000_000);
        assert_eq!(metrics.mean_ns, 2_000_000.0);
        assert!(metrics.std_dev_ns > 0.0);
        assert_eq!(metrics.percentiles[0].value_ns, 2_000_000);
        assert_eq!(metrics.percentiles[1].value_ns, 3_000_000);
    }

    #[test]
    fn test_empty_collector_reports_zeroes() {
        let metrics = LatencyCollector::new(0).unwrap().into_metrics(&[50.0]);
        assert_eq!(metrics.total_samples, 0);
        assert_eq!(metrics.percentiles, vec![PercentileValue { percentile: 50.0, value_ns: 0 }]);
    }

    #[test]
    fn test_call_stats_merge() {
        let mut a = CallStats::new(4).unwrap();
        a.record_success(Duration::from_micros(10)).unwrap();
        a.record_failure();

        let mut b = CallStats::new(4).unwrap();
        b.record_success(Duration::from_micros(30)).unwrap();
        b.record_success(Duration::from_micros(20)).unwrap();

        a.merge(b).unwrap();
        assert_eq!(a.success, 3);
        assert_eq!(a.failed, 1);
        assert_eq!(a.total(), 4);
        assert_eq!(a.latency.len(), 3);
    }

    #[test]
    fn test_calculator_tps_and_bounds() {
        let mut stats = CallStats::new(100).unwrap();
        for i in 1..=100u64 {
            stats.record_success(Duration::from_micros(i)).unwrap();
        }
        let calc = Calculator::new(stats, Duration::from_secs(2), &[50.0, 75.0, 90.0, 95.0, 99.0]);
        assert_eq!(calc.total, 100);
        assert_eq!(calc.tps, 50.0);
        for p in &calc.latency.percentiles {
            assert!(p.value_ns >= calc.latency.min_ns && p.value_ns <= calc.latency.max_ns);
        }
        assert_eq!(calc.latency.percentiles[0].value_ns, 50_000);
        assert_eq!(calc.elapsed(), Duration::from_secs(2));
    }

    #[test]
    fn test_session_counters() {
        let counters = SessionCounters::new();
        counters.record_send(10, 1000);
        counters.record_send(5, 500);
        counters.record_recv(3, 300);

        let snap = counters.snapshot();
        assert_eq!(snap.send_count, 15);
        assert_eq!(snap.send_bytes, 1500);
        assert_eq!(snap.recv_count, 3);
        assert_eq!(snap.recv_bytes, 300);
    }

    #[test]
    fn test_per_second() {
        assert_eq!(per_second(100, Duration::from_secs(4)), 25.0);
        assert_eq!(per_second(100, Duration::ZERO), 0.0);
    }
}
