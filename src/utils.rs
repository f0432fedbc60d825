//! # Utility Functions
//!
//! Formatters for human-readable console output and validators for
//! configuration parameters.
//!
//! ```rust
//! use ws_loadgen::utils::*;
//! use std::time::Duration;
//!
//! let duration_str = format_duration(Duration::from_micros(1500));
//! assert_eq!(duration_str, "1.50ms");
//!
//! let rate_str = format_rate(1048576.0);
//! assert_eq!(rate_str, "1.00 MB/s");
//!
//! # fn main() -> anyhow::Result<()> {
//! validate_payload_size(1024)?;
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;

/// Format nanoseconds in a human-readable way
///
/// ```rust
/// # use ws_loadgen::utils::format_duration_ns;
/// assert_eq!(format_duration_ns(500), "500ns");
/// assert_eq!(format_duration_ns(1500), "1.50μs");
/// assert_eq!(format_duration_ns(1500000), "1.50ms");
/// ```
pub fn format_duration_ns(ns: u64) -> String {
    format_duration(Duration::from_nanos(ns))
}

/// Format a duration in a human-readable way
///
/// The unit is picked by magnitude: ns, μs, ms and s carry two decimals,
/// anything from a minute up uses a compound `1h 2m 3s` form.
///
/// ```rust
/// # use ws_loadgen::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_nanos(1250)), "1.25μs");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format bytes with binary (1024-based) units
///
/// ```rust
/// # use ws_loadgen::utils::format_bytes;
/// assert_eq!(format_bytes(512), "512 B");
/// assert_eq!(format_bytes(1536), "1.50 KB");
/// assert_eq!(format_bytes(2621440), "2.50 MB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    format_bytes_f64(bytes as f64)
}

pub fn format_bytes_f64(bytes: f64) -> String {
    if bytes < 1024.0 {
        format!("{:.0} B", bytes)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a byte rate with a "/s" suffix
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes_f64(bytes_per_second))
}

/// Format a message rate with decimal scaling
///
/// ```rust
/// # use ws_loadgen::utils::format_message_rate;
/// assert_eq!(format_message_rate(750.0), "750 msg/s");
/// assert_eq!(format_message_rate(15500.0), "15.50K msg/s");
/// assert_eq!(format_message_rate(2300000.0), "2.30M msg/s");
/// ```
pub fn format_message_rate(messages_per_second: f64) -> String {
    if messages_per_second < 1000.0 {
        format!("{:.0} msg/s", messages_per_second)
    } else if messages_per_second < 1_000_000.0 {
        format!("{:.2}K msg/s", messages_per_second / 1000.0)
    } else {
        format!("{:.2}M msg/s", messages_per_second / 1_000_000.0)
    }
}

/// Validate that a payload size is between 1 byte and 16 MB
pub fn validate_payload_size(payload: usize) -> Result<()> {
    if payload == 0 {
        anyhow::bail!("Payload size cannot be zero");
    }
    if payload > 16 * 1024 * 1024 {
        anyhow::bail!("Payload size {} is too large (maximum 16MB)", payload);
    }
    Ok(())
}

/// Validate a worker count
pub fn validate_concurrency(concurrency: usize) -> Result<()> {
    if concurrency == 0 {
        anyhow::bail!("Concurrency cannot be zero");
    }
    Ok(())
}

/// Every percentile must lie in (0, 100]
pub fn validate_percentiles(percentiles: &[f64]) -> Result<()> {
    if percentiles.is_empty() {
        anyhow::bail!("At least one percentile is required");
    }
    if let Some(p) = percentiles.iter().find(|p| !(**p > 0.0 && **p <= 100.0)) {
        anyhow::bail!("Percentile {} is out of range (0, 100]", p);
    }
    Ok(())
}

/// Each target must be `ip:port` or `name:port`
pub fn validate_hosts(hosts: &[String]) -> Result<()> {
    if hosts.is_empty() {
        anyhow::bail!("At least one host is required");
    }
    for host in hosts {
        if host.parse::<SocketAddr>().is_ok() {
            continue;
        }
        let valid = host
            .rsplit_once(':')
            .map(|(name, port)| !name.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            anyhow::bail!("Host '{}' is not a valid host:port address", host);
        }
    }
    Ok(())
}

/// Number of logical CPU cores available to this process
pub fn get_cpu_cores() -> usize {
    num_cpus::get()
}

/// Print one table row with padded columns
pub fn print_table_row(columns: &[&str], widths: &[usize]) {
    print!("|");
    for (i, column) in columns.iter().enumerate() {
        let width = widths.get(i).copied().unwrap_or(10);
        print!(" {:width$} |", column, width = width);
    }
    println!();
}

/// Print a `+----+` separator matching `widths`
pub fn print_table_separator(widths: &[usize]) {
    print!("+");
    for &width in widths {
        print!("{}", "-".repeat(width + 2));
        print!("+");
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_nanos(500)), "500ns");
        assert_eq!(format_duration(Duration::from_micros(1500)), "1.50ms");
        assert_eq!(format_duration(Duration::from_secs(2)), "2.00s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_rate(1536.0), "1.50 KB/s");
    }

    #[test]
    fn test_validate_payload_size() {
        assert!(validate_payload_size(1).is_ok());
        assert!(validate_payload_size(16 * 1024 * 1024).is_ok());
        assert!(validate_payload_size(0).is_err());
        assert!(validate_payload_size(16 * 1024 * 1024 + 1).is_err());
    }

    #[test]
    fn test_validate_percentiles() {
        assert!(validate_percentiles(&[50.0, 99.9, 100.0]).is_ok());
        assert!(validate_percentiles(&[]).is_err());
        assert!(validate_percentiles(&[0.0]).is_err());
        assert!(validate_percentiles(&[100.1]).is_err());
        assert!(validate_percentiles(&[f64::NAN]).is_err());
    }

    #[test]
    fn test_validate_hosts() {
        assert!(validate_hosts(&["127.0.0.1:28001".to_string()]).is_ok());
        assert!(validate_hosts(&[]).is_err());
        assert!(validate_hosts(&["localhost:8080".to_string()]).is_ok());
        assert!(validate_hosts(&["localhost".to_string()]).is_err());
        assert!(validate_hosts(&[":8080".to_string()]).is_err());
    }

    #[test]
    fn test_validate_concurrency() {
        assert!(validate_concurrency(50_000).is_ok());
        assert!(validate_concurrency(0).is_err());
    }
}
