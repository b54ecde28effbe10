//! Live status table and throughput statistics.

use crate::options::{PerfTestOptions, Phase};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Sum of per-worker rates.
///
/// Workers publish elapsed time at slightly different moments, so each worker's rate is
/// computed on its own clock and the rates are added. Workers with no elapsed time yet
/// contribute nothing.
pub fn aggregate_ops_per_second<I>(samples: I) -> f64
where
    I: IntoIterator<Item = (u64, f64)>,
{
    samples
        .into_iter()
        .filter(|(_, elapsed)| *elapsed > 0.0)
        .map(|(count, elapsed)| count as f64 / elapsed)
        .sum()
}

/// Throughput figures for a finished phase
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseStats {
    pub total_operations: u64,
    pub ops_per_second: f64,
    pub seconds_per_op: f64,
    pub weighted_avg_seconds: f64,
}

impl PhaseStats {
    /// Compute totals from `(count, elapsed_seconds)` pairs, one per worker
    pub fn from_samples<I>(samples: I) -> Result<Self, StatsError>
    where
        I: IntoIterator<Item = (u64, f64)>,
    {
        let samples: Vec<(u64, f64)> = samples.into_iter().collect();
        let total_operations = samples.iter().map(|(count, _)| count).sum();
        let ops_per_second = aggregate_ops_per_second(samples);

        if ops_per_second == 0.0 {
            return Err(StatsError::NoOperations);
        }

        Ok(Self {
            total_operations,
            ops_per_second,
            seconds_per_op: 1.0 / ops_per_second,
            weighted_avg_seconds: total_operations as f64 / ops_per_second,
        })
    }

    pub fn for_phase(workers: &[Arc<PerfTestOptions>], phase: Phase) -> Result<Self, StatsError> {
        Self::from_samples(phase_samples(workers, phase))
    }

    /// One-line summary, e.g. `Completed 1,200 operations in a weighted-average of 10.00s ...`
    pub fn summary(&self, what: &str) -> String {
        format!(
            "Completed {} {} in a weighted-average of {}s ({} ops/s, {} s/op)",
            format_count(self.total_operations),
            what,
            format_float(self.weighted_avg_seconds, 2),
            format_float(self.ops_per_second, 3),
            format_float(self.seconds_per_op, 5),
        )
    }
}

fn phase_samples(workers: &[Arc<PerfTestOptions>], phase: Phase) -> Vec<(u64, f64)> {
    workers
        .iter()
        .map(|w| (w.count(phase), w.elapsed(phase)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    NoOperations,
}

impl std::fmt::Display for StatsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsError::NoOperations => {
                write!(f, "No operations completed; cannot compute statistics")
            }
        }
    }
}

impl std::error::Error for StatsError {}

/// Periodic status printer.
///
/// Only the reporter touches its trackers; worker state is read through atomics.
pub struct StatusReporter {
    workers: Vec<Arc<PerfTestOptions>>,
    warmup_header_printed: bool,
    warmup_ticked: bool,
    warmup_done: bool,
    test_header_printed: bool,
    operation_status_tracker: u64,
    warmup_operation_status_tracker: u64,
}

impl StatusReporter {
    pub fn new(workers: Vec<Arc<PerfTestOptions>>, warmup_enabled: bool) -> Self {
        Self {
            workers,
            warmup_header_printed: false,
            warmup_ticked: false,
            warmup_done: !warmup_enabled,
            test_header_printed: false,
            operation_status_tracker: 0,
            warmup_operation_status_tracker: 0,
        }
    }

    pub fn warmup_finished(&self) -> bool {
        self.warmup_done
    }

    /// Print one tick worth of status to `out`
    pub fn tick<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if !self.warmup_done {
            return self.warmup_tick(out);
        }

        if !self.test_header_printed {
            write_header(out, "=== Test ===")?;
            self.test_header_printed = true;
        }

        let total: u64 = self.workers.iter().map(|w| w.run_count()).sum();
        let current = total.saturating_sub(self.operation_status_tracker);
        let average =
            aggregate_ops_per_second(phase_samples(&self.workers, Phase::Measurement));
        write_row(out, current, total, average)?;
        self.operation_status_tracker = total;
        Ok(())
    }

    fn warmup_tick<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        if !self.warmup_header_printed {
            write_header(out, "=== Warm Up ===")?;
            self.warmup_header_printed = true;
        }

        let total: u64 = self.workers.iter().map(|w| w.warmup_count()).sum();
        if self.warmup_ticked && total == self.warmup_operation_status_tracker {
            self.warmup_done = true;
            match PhaseStats::for_phase(&self.workers, Phase::Warmup) {
                Ok(stats) => writeln!(out, "{}", stats.summary("warm-up operations"))?,
                Err(_) => writeln!(out, "Completed warm-up with no operations")?,
            }
            writeln!(out)?;
            write_header(out, "=== Test ===")?;
            self.test_header_printed = true;
            return Ok(());
        }

        let current = total.saturating_sub(self.warmup_operation_status_tracker);
        let average = aggregate_ops_per_second(phase_samples(&self.workers, Phase::Warmup));
        write_row(out, current, total, average)?;
        self.warmup_operation_status_tracker = total;
        self.warmup_ticked = true;
        Ok(())
    }

    /// Print a status tick every `interval` until `done` fires
    pub async fn run(mut self, interval: Duration, mut done: watch::Receiver<bool>) -> Self {
        let mut ticker = tokio::time::interval(interval);
        // interval fires immediately; the first row belongs one period in
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.print_tick() {
                        warn!("Failed to write status: {}", e);
                    }
                }
                changed = done.changed() => {
                    if changed.is_err() || *done.borrow() {
                        break;
                    }
                }
            }
        }

        self
    }

    fn print_tick(&mut self) -> io::Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.tick(&mut out)?;
        out.flush()
    }
}

fn write_header<W: Write>(out: &mut W, title: &str) -> io::Result<()> {
    writeln!(out, "{}", title)?;
    writeln!(out, "{:<16}{:<16}{:<16}", "Current", "Total", "Average")
}

fn write_row<W: Write>(out: &mut W, current: u64, total: u64, average: f64) -> io::Result<()> {
    writeln!(
        out,
        "{:<16}{:<16}{:<16}",
        format_count(current),
        format_count(total),
        format_float(average, 2)
    )
}

/// `1234567` -> `"1,234,567"`
pub fn format_count(n: u64) -> String {
    group_thousands(&n.to_string())
}

/// `1234.5678, 2` -> `"1,234.57"`
pub fn format_float(value: f64, decimals: usize) -> String {
    if !value.is_finite() {
        return value.to_string();
    }
    let formatted = format!("{:.*}", decimals, value.abs());
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted.as_str(), None),
    };

    let mut result = String::new();
    if value.is_sign_negative() && formatted.chars().any(|c| c != '0' && c != '.') {
        result.push('-');
    }
    result.push_str(&group_thousands(int_part));
    if let Some(frac) = frac_part {
        result.push('.');
        result.push_str(frac);
    }
    result
}

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (len - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestArgs;
    use crate::recording::Transport;

    fn workers(n: usize) -> Vec<Arc<PerfTestOptions>> {
        let client = reqwest::Client::new();
        (0..n)
            .map(|i| {
                Arc::new(PerfTestOptions::new(
                    "suite",
                    i,
                    Transport::Direct(client.clone()),
                    Arc::new(TestArgs::new()),
                ))
            })
            .collect()
    }

    fn render(reporter: &mut StatusReporter) -> String {
        let mut out = Vec::new();
        reporter.tick(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn aggregate_is_sum_of_rates() {
        let rate = aggregate_ops_per_second([(100, 2.0), (300, 3.0)]);
        assert!((rate - 150.0).abs() < 1e-9);
    }

    #[test]
    fn aggregate_skips_workers_without_elapsed_time() {
        assert_eq!(aggregate_ops_per_second([(10, 0.0)]), 0.0);
        assert!((aggregate_ops_per_second([(10, 0.0), (20, 2.0)]) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn phase_stats_weighted_average() {
        let stats = PhaseStats::from_samples([(100, 2.0), (300, 3.0)]).unwrap();
        assert_eq!(stats.total_operations, 400);
        assert!((stats.ops_per_second - 150.0).abs() < 1e-9);
        assert!((stats.seconds_per_op - 1.0 / 150.0).abs() < 1e-12);
        assert!((stats.weighted_avg_seconds - 400.0 / 150.0).abs() < 1e-9);
    }

    #[test]
    fn phase_stats_without_operations_is_an_error() {
        assert_eq!(
            PhaseStats::from_samples([(0, 2.0), (0, 3.0)]),
            Err(StatsError::NoOperations)
        );
        assert_eq!(
            PhaseStats::from_samples(std::iter::empty()),
            Err(StatsError::NoOperations)
        );
    }

    #[test]
    fn formats_with_thousands_separators() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1_000), "1,000");
        assert_eq!(format_count(1_234_567), "1,234,567");
        assert_eq!(format_float(1234.5678, 2), "1,234.57");
        assert_eq!(format_float(0.00012, 5), "0.00012");
        assert_eq!(format_float(-9876543.0, 1), "-9,876,543.0");
        assert_eq!(format_float(12.0, 0), "12");
    }

    #[test]
    fn summary_line_mentions_all_figures() {
        let stats = PhaseStats::from_samples([(1000, 1.0)]).unwrap();
        assert_eq!(
            stats.summary("operations"),
            "Completed 1,000 operations in a weighted-average of 1.00s (1,000.000 ops/s, 0.00100 s/op)"
        );
    }

    #[test]
    fn measurement_rows_report_deltas() {
        let workers = workers(2);
        let mut reporter = StatusReporter::new(workers.clone(), false);

        workers[0].set_phase_totals(Phase::Measurement, 100, 2.0);
        workers[1].set_phase_totals(Phase::Measurement, 300, 3.0);
        let first = render(&mut reporter);
        let lines: Vec<_> = first.lines().collect();
        assert_eq!(lines[0], "=== Test ===");
        assert!(lines[1].starts_with("Current"));
        let cols: Vec<_> = lines[2].split_whitespace().collect();
        assert_eq!(cols, vec!["400", "400", "150.00"]);

        workers[0].set_phase_totals(Phase::Measurement, 150, 3.0);
        let second = render(&mut reporter);
        let cols: Vec<_> = second.lines().next().unwrap().split_whitespace().collect();
        assert_eq!(cols, vec!["50", "450", "150.00"]);
    }

    #[test]
    fn warmup_rows_stop_once_total_stalls() {
        let workers = workers(2);
        let mut reporter = StatusReporter::new(workers.clone(), true);

        workers[0].set_phase_totals(Phase::Warmup, 10, 1.0);
        workers[1].set_phase_totals(Phase::Warmup, 20, 1.0);
        let first = render(&mut reporter);
        assert!(first.starts_with("=== Warm Up ===\n"));
        assert_eq!(first.lines().count(), 3);
        assert!(!reporter.warmup_finished());

        workers[0].set_phase_totals(Phase::Warmup, 30, 2.0);
        let second = render(&mut reporter);
        let cols: Vec<_> = second.lines().next().unwrap().split_whitespace().collect();
        assert_eq!(cols, vec!["20", "50", "35.00"]);
        assert!(!reporter.warmup_finished());

        // no progress since the last tick
        let third = render(&mut reporter);
        assert!(reporter.warmup_finished());
        let completed: Vec<_> = third
            .lines()
            .filter(|l| l.starts_with("Completed"))
            .collect();
        assert_eq!(completed.len(), 1);
        assert!(completed[0].contains("50 warm-up operations"));
        assert!(third.contains("=== Test ==="));
        assert!(!third.contains("=== Warm Up ==="));

        workers[0].set_phase_totals(Phase::Measurement, 5, 1.0);
        let fourth = render(&mut reporter);
        assert!(!fourth.contains("Completed"));
        assert!(!fourth.contains("==="));
        let cols: Vec<_> = fourth.lines().next().unwrap().split_whitespace().collect();
        assert_eq!(cols, vec!["5", "5", "5.00"]);
    }

    #[test]
    fn first_warmup_tick_never_completes_warmup() {
        let workers = workers(1);
        let mut reporter = StatusReporter::new(workers, true);
        let first = render(&mut reporter);
        assert!(!reporter.warmup_finished());
        assert!(!first.contains("Completed"));

        let second = render(&mut reporter);
        assert!(reporter.warmup_finished());
        assert!(second.contains("Completed warm-up with no operations"));
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_task_stops_on_done_signal() {
        let workers = workers(1);
        let reporter = StatusReporter::new(workers, false);
        let (done_tx, done_rx) = watch::channel(false);
        let handle = tokio::spawn(reporter.run(Duration::from_secs(1), done_rx));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        done_tx.send(true).unwrap();
        let reporter = handle.await.unwrap();
        assert!(reporter.test_header_printed);
    }
}
