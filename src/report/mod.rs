use crate::config::{format_duration, RunnerConfig};
use crate::metrics::LatencySnapshot;
use crate::status::{format_count, format_float, PhaseStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Result of one measured iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub test_name: String,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub parallel: usize,
    pub duration: Duration,
    pub warmup: Duration,
    pub results: RunResults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResults {
    pub total_operations: u64,
    pub ops_per_second: f64,
    pub seconds_per_op: f64,
    pub weighted_avg_seconds: f64,
    pub latency: LatencyResults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyResults {
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
}

impl From<&LatencySnapshot> for LatencyResults {
    fn from(snapshot: &LatencySnapshot) -> Self {
        Self {
            min_us: snapshot.min.as_micros() as u64,
            max_us: snapshot.max.as_micros() as u64,
            mean_us: snapshot.mean.as_micros() as u64,
            p50_us: snapshot.p50.as_micros() as u64,
            p90_us: snapshot.p90.as_micros() as u64,
            p99_us: snapshot.p99.as_micros() as u64,
        }
    }
}

impl RunReport {
    pub fn new(
        test_name: &str,
        iteration: u32,
        config: &RunnerConfig,
        stats: PhaseStats,
        latency: LatencySnapshot,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            test_name: test_name.to_string(),
            iteration,
            started_at,
            ended_at: Utc::now(),
            parallel: config.parallel,
            duration: config.duration,
            warmup: config.warmup,
            results: RunResults {
                total_operations: stats.total_operations,
                ops_per_second: stats.ops_per_second,
                seconds_per_op: stats.seconds_per_op,
                weighted_avg_seconds: stats.weighted_avg_seconds,
                latency: LatencyResults::from(&latency),
            },
        }
    }

    /// Line the runner prints after each iteration
    pub fn summary(&self) -> String {
        format!(
            "Completed {} operations in a weighted-average of {}s ({} ops/s, {} s/op)",
            format_count(self.results.total_operations),
            format_float(self.results.weighted_avg_seconds, 2),
            format_float(self.results.ops_per_second, 3),
            format_float(self.results.seconds_per_op, 5),
        )
    }

    /// Export report to JSON
    pub fn to_json(&self) -> Result<String, ReportError> {
        serde_json::to_string_pretty(self).map_err(|e| ReportError::Serialization(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, ReportError> {
        serde_json::from_str(content).map_err(|e| ReportError::Serialization(e.to_string()))
    }

    /// Export report to CSV
    pub fn to_csv(&self) -> Result<String, ReportError> {
        reports_to_csv(std::slice::from_ref(self))
    }

    fn csv_row(&self) -> [String; 14] {
        [
            self.test_name.clone(),
            self.iteration.to_string(),
            self.parallel.to_string(),
            format_duration(self.duration),
            format_duration(self.warmup),
            self.results.total_operations.to_string(),
            format!("{:.3}", self.results.ops_per_second),
            format!("{:.6}", self.results.seconds_per_op),
            format!("{:.3}", self.results.weighted_avg_seconds),
            self.results.latency.min_us.to_string(),
            self.results.latency.mean_us.to_string(),
            self.results.latency.p50_us.to_string(),
            self.results.latency.p99_us.to_string(),
            self.results.latency.max_us.to_string(),
        ]
    }

    pub fn render_text(&self) -> String {
        let latency = &self.results.latency;
        let mut out = String::new();
        out.push_str("=== Results ===\n");
        out.push_str(&self.summary());
        out.push('\n');
        out.push_str(&format!(
            "Latency: min {}, mean {}, p50 {}, p90 {}, p99 {}, max {}\n",
            format_duration_us(latency.min_us),
            format_duration_us(latency.mean_us),
            format_duration_us(latency.p50_us),
            format_duration_us(latency.p90_us),
            format_duration_us(latency.p99_us),
            format_duration_us(latency.max_us),
        ));
        out
    }

    /// Print report to console
    pub fn print_text(&self) {
        println!();
        print!("{}", self.render_text());
        println!();
    }
}

const CSV_HEADER: [&str; 14] = [
    "test_name",
    "iteration",
    "parallel",
    "duration",
    "warmup",
    "total_operations",
    "ops_per_second",
    "seconds_per_op",
    "weighted_avg_seconds",
    "latency_min_us",
    "latency_mean_us",
    "latency_p50_us",
    "latency_p99_us",
    "latency_max_us",
];

/// One header, one row per report
pub fn reports_to_csv(reports: &[RunReport]) -> Result<String, ReportError> {
    let mut writer = csv::Writer::from_writer(vec![]);

    writer
        .write_record(CSV_HEADER)
        .map_err(|e| ReportError::Csv(e.to_string()))?;
    for report in reports {
        writer
            .write_record(report.csv_row())
            .map_err(|e| ReportError::Csv(e.to_string()))?;
    }

    let data = writer
        .into_inner()
        .map_err(|e| ReportError::Csv(e.to_string()))?;
    String::from_utf8(data).map_err(|e| ReportError::Csv(e.to_string()))
}

/// Render `reports` in `format`, ready to write to stdout or a file
pub fn render_reports(reports: &[RunReport], format: OutputFormat) -> Result<String, ReportError> {
    match format {
        OutputFormat::Text => Ok(reports.iter().map(RunReport::render_text).collect()),
        OutputFormat::Json => serde_json::to_string_pretty(reports)
            .map_err(|e| ReportError::Serialization(e.to_string())),
        OutputFormat::Csv => reports_to_csv(reports),
    }
}

/// Load reports written with `--output json`; accepts one report or a list
pub fn load_reports(content: &str) -> Result<Vec<RunReport>, ReportError> {
    if let Ok(list) = serde_json::from_str::<Vec<RunReport>>(content) {
        return Ok(list);
    }
    RunReport::from_json(content).map(|r| vec![r])
}

fn format_duration_us(us: u64) -> String {
    if us >= 1_000_000 {
        format!("{:.2}s", us as f64 / 1_000_000.0)
    } else if us >= 1_000 {
        format!("{:.2}ms", us as f64 / 1_000.0)
    } else {
        format!("{}µs", us)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
    Csv,
}

impl FromStr for OutputFormat {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "csv" => Ok(OutputFormat::Csv),
            other => Err(ReportError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum ReportError {
    Serialization(String),
    Csv(String),
    UnknownFormat(String),
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Serialization(e) => write!(f, "Serialization error: {}", e),
            ReportError::Csv(e) => write!(f, "CSV error: {}", e),
            ReportError::UnknownFormat(s) => {
                write!(f, "Unknown output format: {}. Use text, json, or csv", s)
            }
        }
    }
}

impl std::error::Error for ReportError {}

/// Compare two reports of the same test
pub fn compare_reports(baseline: &RunReport, current: &RunReport) -> ComparisonResult {
    ComparisonResult {
        baseline_name: baseline.test_name.clone(),
        current_name: current.test_name.clone(),
        ops_change: percentage_change(
            baseline.results.ops_per_second,
            current.results.ops_per_second,
        ),
        p50_change: percentage_change(
            baseline.results.latency.p50_us as f64,
            current.results.latency.p50_us as f64,
        ),
        p99_change: percentage_change(
            baseline.results.latency.p99_us as f64,
            current.results.latency.p99_us as f64,
        ),
    }
}

fn percentage_change(baseline: f64, current: f64) -> f64 {
    if baseline == 0.0 {
        if current == 0.0 {
            0.0
        } else {
            100.0
        }
    } else {
        ((current - baseline) / baseline) * 100.0
    }
}

#[derive(Debug, Clone)]
pub struct ComparisonResult {
    pub baseline_name: String,
    pub current_name: String,
    pub ops_change: f64,
    pub p50_change: f64,
    pub p99_change: f64,
}

impl ComparisonResult {
    /// Higher throughput and lower latency both count as improvements
    pub fn verdict(&self) -> &'static str {
        let improvements = [
            self.ops_change > 0.0,
            self.p50_change < 0.0,
            self.p99_change < 0.0,
        ]
        .iter()
        .filter(|&&x| x)
        .count();

        match improvements {
            3 => "IMPROVEMENT",
            0 => "REGRESSION",
            _ => "MIXED RESULTS",
        }
    }

    pub fn print(&self) {
        println!();
        println!("=== Comparison: {} vs {} ===", self.baseline_name, self.current_name);
        println!("Ops/sec:       {:+.2}%", self.ops_change);
        println!("p50 Latency:   {:+.2}%", self.p50_change);
        println!("p99 Latency:   {:+.2}%", self.p99_change);
        println!("Overall: {}", self.verdict());
    }
}
