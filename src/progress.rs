//! Phase timing, throughput lines and process memory readouts.

use std::time::{Duration, Instant};

use tracing::info;

/// Wall-clock timer for one phase, with an optional expected row count used
/// for ETA estimation.
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
    expected: u64,
}

/// Snapshot of a timer against a processed row count.
#[derive(Debug, Clone, Copy)]
pub struct Report {
    pub elapsed: Duration,
    /// Rows per second over the elapsed window.
    pub speed: f64,
    /// Estimated remaining time, when the expected total is known.
    pub eta: Option<Duration>,
}

impl Timer {
    pub fn new() -> Self {
        Timer {
            start: Instant::now(),
            expected: 0,
        }
    }

    pub fn with_expected(expected: u64) -> Self {
        Timer {
            start: Instant::now(),
            expected,
        }
    }

    pub fn reset(&mut self, expected: u64) {
        self.start = Instant::now();
        self.expected = expected;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn report(&self, processed: u64) -> Report {
        let elapsed = self.start.elapsed();
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { processed as f64 / secs } else { 0.0 };
        let eta = if processed > 0 && self.expected > processed && speed > 0.0 {
            Some(Duration::from_secs_f64(
                (self.expected - processed) as f64 / speed,
            ))
        } else {
            None
        };
        Report {
            elapsed,
            speed,
            eta,
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

/// Renders a duration as up to three coarse components (`1h 2m 3s`).
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    let parts = [
        (millis / 3_600_000, "h"),
        (millis % 3_600_000 / 60_000, "m"),
        (millis % 60_000 / 1_000, "s"),
        (millis % 1_000, "ms"),
    ];
    let mut out = String::new();
    let mut used = 0;
    for (amount, unit) in parts {
        if (amount > 0 || !out.is_empty()) && used < 3 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&format!("{amount}{unit}"));
            used += 1;
        }
    }
    if out.is_empty() {
        out.push_str("0ms");
    }
    out
}

fn format_speed(rows_per_sec: f64) -> String {
    if rows_per_sec >= 1.0 {
        format!("{rows_per_sec:.0} rows/sec")
    } else {
        format!("{:.1} rows/min", rows_per_sec * 60.0)
    }
}

/// Emits one progress line for a table phase. The ETA is included when the
/// expected total is known and not yet reached.
pub fn progress(table: &str, timer: &Timer, label: &str, count: u64, total: Option<u64>) {
    let report = timer.report(count);
    match total {
        Some(total) if total > 0 => {
            let eta = report
                .eta
                .map(|d| format!(" [eta {}]", format_duration(d)))
                .unwrap_or_default();
            info!(
                "`{table}` {label} {count}/{total} [{}] [elapsed {}]{eta}",
                format_speed(report.speed),
                format_duration(report.elapsed),
            );
        }
        _ => {
            info!(
                "`{table}` {label} {count} [{}] [elapsed {}]",
                format_speed(report.speed),
                format_duration(report.elapsed),
            );
        }
    }
}

/// Current resident set size in KiB, from the per-process accounting surface.
pub fn rss_kb() -> Option<u64> {
    proc_status_kb("VmRSS:")
}

/// Peak resident set size in KiB.
pub fn peak_rss_kb() -> Option<u64> {
    proc_status_kb("VmHWM:")
}

fn proc_status_kb(field: &str) -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with(field))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Formats a KiB amount as `N Kb`, `N.NN Mb` or `N.NN Gb`.
pub fn memory_string(kb: u64) -> String {
    if kb < 1024 {
        return format!("{kb} Kb");
    }
    let mb = kb as f64 / 1024.0;
    if mb < 1024.0 {
        return format!("{mb:.2} Mb");
    }
    format!("{:.2} Gb", mb / 1024.0)
}

/// Current RSS formatted for log lines.
pub fn memory_usage() -> String {
    rss_kb().map(memory_string).unwrap_or_else(|| "n/a".into())
}

/// Peak RSS formatted for the run summary.
pub fn peak_memory_usage() -> String {
    peak_rss_kb()
        .map(memory_string)
        .unwrap_or_else(|| "n/a".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_use_up_to_three_components() {
        assert_eq!(format_duration(Duration::from_millis(0)), "0ms");
        assert_eq!(format_duration(Duration::from_millis(450)), "450ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5s 0ms");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s 0ms");
        assert_eq!(
            format_duration(Duration::from_secs(3600 + 120 + 3)),
            "1h 2m 3s"
        );
    }

    #[test]
    fn memory_units_scale() {
        assert_eq!(memory_string(512), "512 Kb");
        assert_eq!(memory_string(2048), "2.00 Mb");
        assert_eq!(memory_string(3 * 1024 * 1024), "3.00 Gb");
    }

    #[test]
    fn speed_unit_switches_below_one_row_per_second() {
        assert_eq!(format_speed(120.0), "120 rows/sec");
        assert_eq!(format_speed(0.5), "30.0 rows/min");
    }

    #[test]
    fn report_estimates_remaining_time() {
        let timer = Timer::with_expected(100);
        std::thread::sleep(Duration::from_millis(20));
        let report = timer.report(50);
        assert!(report.speed > 0.0);
        assert!(report.eta.is_some());
        let done = timer.report(100);
        assert!(done.eta.is_none());
    }

    #[test]
    fn rss_is_readable_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(rss_kb().unwrap_or(0) > 0);
            assert!(peak_rss_kb().unwrap_or(0) > 0);
        }
    }
}
