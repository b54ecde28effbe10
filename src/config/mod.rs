use crate::recording::RecordMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

/// Environment variable selecting the proxy mode
pub const RECORD_MODE_ENV: &str = "AZURE_RECORD_MODE";

/// Environment variable locating the proxy's TLS certificate
pub const PROXY_CERT_ENV: &str = "PROXY_CERT";

const PROXY_CERT_REPO_PATH: [&str; 4] = ["eng", "common", "testproxy", "dotnet-devcert.crt"];

/// Configuration for one perf run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Registered test to run
    #[serde(default)]
    pub test: String,

    /// Measurement duration per iteration
    #[serde(default = "default_duration", with = "duration_serde")]
    pub duration: Duration,

    /// Number of warm-up + measurement cycles
    #[serde(default = "default_iterations")]
    pub iterations: u32,

    /// Number of parallel workers
    #[serde(default = "default_parallel")]
    pub parallel: usize,

    /// Warm-up duration (0 disables warm-up)
    #[serde(default = "default_warmup", with = "duration_serde")]
    pub warmup: Duration,

    /// Skip per-test and global cleanup
    #[serde(default)]
    pub no_cleanup: bool,

    /// Skip TLS verification on direct connections
    #[serde(default)]
    pub insecure: bool,

    /// Test-proxy endpoints, assigned to workers round robin
    #[serde(default)]
    pub test_proxies: Vec<String>,

    /// Proxy mode; falls back to the environment, then playback
    #[serde(default)]
    pub record_mode: Option<RecordMode>,

    /// Proxy certificate path; falls back to the environment, then the git checkout
    #[serde(default)]
    pub proxy_cert: Option<PathBuf>,

    /// Variables stored with each recording when it is stopped
    #[serde(default)]
    pub proxy_variables: serde_json::Map<String, serde_json::Value>,

    /// Test-specific arguments
    #[serde(default)]
    pub args: TestArgs,

    /// Output configuration
    #[serde(default)]
    pub output: OutputConfig,
}

fn default_duration() -> Duration {
    Duration::from_secs(10)
}

fn default_iterations() -> u32 {
    1
}

fn default_parallel() -> usize {
    1
}

fn default_warmup() -> Duration {
    Duration::from_secs(5)
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output format: text, json, csv
    #[serde(default = "default_output_format")]
    pub format: String,

    /// Output file path (stdout if not set)
    #[serde(default)]
    pub file: Option<String>,

    /// Show the live status table
    #[serde(default = "default_true")]
    pub progress: bool,

    /// Status table update interval
    #[serde(default = "default_progress_interval", with = "duration_serde")]
    pub progress_interval: Duration,
}

fn default_output_format() -> String {
    "text".to_string()
}

fn default_true() -> bool {
    true
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(1)
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            file: None,
            progress: true,
            progress_interval: default_progress_interval(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Create a configuration for `test` with default timings
    pub fn for_test(test: impl Into<String>) -> Self {
        Self {
            test: test.into(),
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test.is_empty() {
            return Err(ConfigError::ValidationError(
                "Test name is required".to_string(),
            ));
        }

        if self.parallel == 0 {
            return Err(ConfigError::ValidationError(
                "Parallel must be at least 1".to_string(),
            ));
        }

        if self.iterations == 0 {
            return Err(ConfigError::ValidationError(
                "Iterations must be at least 1".to_string(),
            ));
        }

        if self.duration.is_zero() {
            return Err(ConfigError::ValidationError(
                "Duration must be greater than zero".to_string(),
            ));
        }

        self.proxy_urls()?;
        Ok(())
    }

    /// Parse the configured proxy endpoints
    pub fn proxy_urls(&self) -> Result<Vec<Url>, ConfigError> {
        self.test_proxies
            .iter()
            .map(|raw| {
                let url = Url::parse(raw).map_err(|e| {
                    ConfigError::ValidationError(format!("Invalid test proxy {}: {}", raw, e))
                })?;
                if url.host_str().is_none() {
                    return Err(ConfigError::ValidationError(format!(
                        "Test proxy {} has no host",
                        raw
                    )));
                }
                Ok(url)
            })
            .collect()
    }

    /// Mode the proxy should run in, resolving the environment when unset
    pub fn effective_record_mode(&self) -> Result<RecordMode, ConfigError> {
        match self.record_mode {
            Some(mode) => Ok(mode),
            None => record_mode_from_env(),
        }
    }

    /// Fill unset environment-backed fields
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if self.record_mode.is_none() {
            self.record_mode = Some(record_mode_from_env()?);
        }
        if self.proxy_cert.is_none() && !self.test_proxies.is_empty() {
            self.proxy_cert = find_proxy_cert();
        }
        Ok(())
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            test: String::new(),
            duration: default_duration(),
            iterations: default_iterations(),
            parallel: default_parallel(),
            warmup: default_warmup(),
            no_cleanup: false,
            insecure: false,
            test_proxies: Vec::new(),
            record_mode: None,
            proxy_cert: None,
            proxy_variables: serde_json::Map::new(),
            args: TestArgs::default(),
            output: OutputConfig::default(),
        }
    }
}

/// Split a `;`-separated proxy list, dropping empty entries
pub fn parse_proxy_list(s: &str) -> Vec<String> {
    s.split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read the proxy mode from the environment, defaulting to playback
pub fn record_mode_from_env() -> Result<RecordMode, ConfigError> {
    match std::env::var(RECORD_MODE_ENV) {
        Ok(value) if !value.trim().is_empty() => RecordMode::from_str(value.trim())
            .map_err(|_| {
                ConfigError::EnvError(format!(
                    "{} was not understood, options are record, playback, or live. Received: {}",
                    RECORD_MODE_ENV, value
                ))
            }),
        _ => {
            info!("{} was not set, defaulting to playback", RECORD_MODE_ENV);
            Ok(RecordMode::Playback)
        }
    }
}

/// Locate the proxy certificate via `PROXY_CERT` or the enclosing git checkout
pub fn find_proxy_cert() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(PROXY_CERT_ENV) {
        return Some(PathBuf::from(path));
    }

    let output = Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .output();
    match output {
        Ok(out) if out.status.success() => {
            let top_level = String::from_utf8_lossy(&out.stdout).trim().to_string();
            let mut path = PathBuf::from(top_level);
            path.extend(PROXY_CERT_REPO_PATH);
            Some(path)
        }
        _ => {
            warn!(
                "Could not find {} or the top level of a git repository; set {} to the test proxy certificate",
                PROXY_CERT_ENV, PROXY_CERT_ENV
            );
            None
        }
    }
}

/// Free-form `key=value` arguments handed to the selected test
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestArgs(BTreeMap<String, String>);

impl TestArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` pairs
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut args = Self::new();
        for pair in pairs {
            let (key, value) = parse_arg(pair.as_ref())?;
            args.insert(key, value);
        }
        Ok(args)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key)
            .ok_or_else(|| ConfigError::ValidationError(format!("Missing test argument: {}", key)))
    }

    /// Parse `key`, or return `default` when it is absent
    pub fn parse_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| {
                ConfigError::ValidationError(format!("Invalid value for {}: {}", key, e))
            }),
            None => Ok(default),
        }
    }

    pub fn duration_or(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        match self.get(key) {
            Some(raw) => parse_duration(raw).map_err(|e| {
                ConfigError::ValidationError(format!("Invalid value for {}: {}", key, e))
            }),
            None => Ok(default),
        }
    }

    /// Overlay `other` on top of these arguments
    pub fn merge(&mut self, other: TestArgs) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn parse_arg(s: &str) -> Result<(String, String), ConfigError> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(ConfigError::ParseError(format!(
            "Invalid argument format: {}. Use 'key=value'",
            s
        ))),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    ValidationError(String),
    EnvError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(e) => write!(f, "Validation error: {}", e),
            ConfigError::EnvError(e) => write!(f, "Environment error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Duration serialization/deserialization as human strings ("500ms", "10s", "5m")
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        }
    }

    pub fn format_duration(d: Duration) -> String {
        let millis = d.as_millis();
        if millis % 1000 != 0 {
            return format!("{}ms", millis);
        }
        let secs = d.as_secs();
        if secs >= 3600 && secs % 3600 == 0 {
            format!("{}h", secs / 3600)
        } else if secs >= 60 && secs % 60 == 0 {
            format!("{}m", secs / 60)
        } else {
            format!("{}s", secs)
        }
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let (num_str, unit) = if let Some(n) = s.strip_suffix("ms") {
            (n, "ms")
        } else if let Some(n) = s.strip_suffix('s') {
            (n, "s")
        } else if let Some(n) = s.strip_suffix('m') {
            (n, "m")
        } else if let Some(n) = s.strip_suffix('h') {
            (n, "h")
        } else {
            // bare numbers are seconds
            (s, "s")
        };

        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| format!("Invalid number in duration: {}", num_str))?;

        let scale = |factor: u64| {
            num.checked_mul(factor)
                .map(Duration::from_secs)
                .ok_or_else(|| format!("Duration too large: {}", s))
        };

        let duration = match unit {
            "ms" => Duration::from_millis(num),
            "s" => Duration::from_secs(num),
            "m" => scale(60)?,
            "h" => scale(3600)?,
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

pub fn parse_duration(s: &str) -> Result<Duration, String> {
    duration_serde::parse_duration(s)
}

pub fn format_duration(d: Duration) -> String {
    duration_serde::format_duration(d)
}
