//! Configuration management for slotfill
//!
//! Handles loading and validation of `slotfill.toml`. Every section is
//! optional; missing keys fall back to the defaults below.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::retry::RetryPolicy;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub slots: SlotsConfig,

    /// Storage areas, consulted in order
    #[serde(default = "default_areas")]
    pub areas: Vec<AreaConfig>,

    #[serde(default)]
    pub gap: GapConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub run: RunConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            slots: SlotsConfig::default(),
            areas: default_areas(),
            gap: GapConfig::default(),
            fetch: FetchConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            run: RunConfig::default(),
        }
    }
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file, appended to alongside stderr
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Pretty,
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Slot partitioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotsConfig {
    #[serde(default = "default_width_minutes")]
    pub width_minutes: u32,

    /// Offset used to render slot keys and directory layout (JST by default)
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    #[serde(default = "default_file_extension")]
    pub file_extension: String,
}

impl Default for SlotsConfig {
    fn default() -> Self {
        Self {
            width_minutes: default_width_minutes(),
            utc_offset_minutes: default_utc_offset_minutes(),
            file_extension: default_file_extension(),
        }
    }
}

fn default_width_minutes() -> u32 {
    10
}

fn default_utc_offset_minutes() -> i32 {
    9 * 60
}

fn default_file_extension() -> String {
    "jsonl".to_string()
}

/// What a storage area is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaRole {
    /// Consulted for gap detection; never written
    Source,
    /// Receives complement artifacts; also consulted for gap detection
    Output,
}

/// A named storage area rooted on the local filesystem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaConfig {
    pub name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub prefix: String,
    pub role: AreaRole,
}

fn default_areas() -> Vec<AreaConfig> {
    vec![
        AreaConfig {
            name: "data".to_string(),
            root: PathBuf::from("data"),
            prefix: String::new(),
            role: AreaRole::Source,
        },
        AreaConfig {
            name: "data_complement".to_string(),
            root: PathBuf::from("data_complement"),
            prefix: String::new(),
            role: AreaRole::Output,
        },
    ]
}

/// Record-count thresholds for the gap detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GapConfig {
    /// At or below this many records a slot is treated as placeholder content
    #[serde(default = "default_min_records")]
    pub min_records: usize,

    /// At or above this many records a slot is treated as over-capture
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            min_records: default_min_records(),
            max_records: default_max_records(),
        }
    }
}

fn default_min_records() -> usize {
    100
}

fn default_max_records() -> usize {
    10_000
}

/// Which upstream capability to page through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    /// `notes/search`, anchored by record identifiers
    #[default]
    Search,
    /// `notes/*timeline`, anchored by timestamps
    Timeline,
}

impl fmt::Display for FetchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Search => write!(f, "search"),
            Self::Timeline => write!(f, "timeline"),
        }
    }
}

impl FromStr for FetchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "search" => Ok(Self::Search),
            "timeline" => Ok(Self::Timeline),
            _ => Err(format!("unknown fetch mode: {s}. Expected search or timeline")),
        }
    }
}

/// Upstream API and pagination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub mode: FetchMode,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// API token; `MISSKEY_TOKEN` is used when unset
    #[serde(default)]
    pub token: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub query: Option<String>,

    #[serde(default = "default_limit")]
    pub limit: u32,

    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Delay between consecutive page requests
    #[serde(default)]
    pub page_delay_ms: u64,

    #[serde(default = "default_early_coverage_seconds")]
    pub early_coverage_seconds: u32,

    /// Split each slot into windows of this many seconds
    #[serde(default)]
    pub sub_slot_seconds: Option<u32>,

    /// Explicit lower anchor, overriding the one derived from slot start
    #[serde(default)]
    pub since_id: Option<String>,

    /// Explicit upper anchor, overriding the one derived from slot end
    #[serde(default)]
    pub until_id: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// When false, only records with Japanese text are persisted
    #[serde(default = "default_true")]
    pub keep_non_japanese: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            mode: FetchMode::Search,
            base_url: default_base_url(),
            endpoint: default_endpoint(),
            token: None,
            host: None,
            query: None,
            limit: default_limit(),
            max_pages: default_max_pages(),
            page_delay_ms: 0,
            early_coverage_seconds: default_early_coverage_seconds(),
            sub_slot_seconds: None,
            since_id: None,
            until_id: None,
            request_timeout_secs: default_request_timeout_secs(),
            keep_non_japanese: true,
        }
    }
}

fn default_base_url() -> String {
    "https://misskey.io".to_string()
}

fn default_endpoint() -> String {
    "notes/search".to_string()
}

fn default_limit() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    50
}

fn default_early_coverage_seconds() -> u32 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Backoff applied to throttled or failed requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            jitter_percent: default_jitter_percent(),
        }
    }
}

impl RetryConfig {
    /// Build the runtime retry policy.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.backoff_factor,
            self.jitter_percent,
            Some(self.max_attempts.max(1)),
        )
    }
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_jitter_percent() -> f64 {
    0.1
}

/// Shared request budget across all slot workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_bucket_capacity")]
    pub capacity: f64,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_bucket_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

fn default_bucket_capacity() -> f64 {
    5.0
}

fn default_refill_per_sec() -> f64 {
    1.0
}

/// Run-level knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Replace existing complement artifacts instead of merging into them
    #[serde(default)]
    pub overwrite: bool,

    /// Report gaps without fetching or writing
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub max_slots: Option<usize>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_secs: None,
            overwrite: false,
            dry_run: false,
            max_slots: None,
        }
    }
}

fn default_concurrency() -> usize {
    1
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()).into());

        if self.slots.width_minutes == 0 {
            return invalid("slots.width_minutes must be positive");
        }
        if self.slots.utc_offset_minutes.abs() >= 24 * 60 {
            return invalid("slots.utc_offset_minutes must be within +/-24h");
        }
        if self.gap.min_records >= self.gap.max_records {
            return invalid("gap.min_records must be below gap.max_records");
        }
        if self.fetch.limit == 0 {
            return invalid("fetch.limit must be positive");
        }
        if self.fetch.max_pages == 0 {
            return invalid("fetch.max_pages must be positive");
        }
        if self.fetch.sub_slot_seconds == Some(0) {
            return invalid("fetch.sub_slot_seconds must be positive");
        }
        if self.run.concurrency == 0 {
            return invalid("run.concurrency must be at least 1");
        }
        let positive = |x: f64| x.is_finite() && x > 0.0;
        if !positive(self.rate_limit.capacity) || !positive(self.rate_limit.refill_per_sec) {
            return invalid("rate_limit capacity and refill_per_sec must be positive");
        }
        let outputs = self
            .areas
            .iter()
            .filter(|a| a.role == AreaRole::Output)
            .count();
        if outputs != 1 {
            return invalid("exactly one area must have role = \"output\"");
        }
        let mut names: Vec<&str> = self.areas.iter().map(|a| a.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.areas.len() {
            return invalid("area names must be unique");
        }
        Ok(())
    }

    /// The single output area
    #[must_use]
    pub fn output_area(&self) -> Option<&AreaConfig> {
        self.areas.iter().find(|a| a.role == AreaRole::Output)
    }

    /// Token from config, falling back to `MISSKEY_TOKEN`
    #[must_use]
    pub fn resolved_token(&self) -> Option<String> {
        self.fetch
            .token
            .clone()
            .or_else(|| std::env::var("MISSKEY_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.slots.width_minutes, 10);
        assert_eq!(config.gap.min_records, 100);
        assert_eq!(config.gap.max_records, 10_000);
        assert_eq!(config.fetch.early_coverage_seconds, 30);
        assert_eq!(config.output_area().unwrap().name, "data_complement");
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.areas.len(), 2);
        assert_eq!(config.fetch.mode, FetchMode::Search);
    }

    #[test]
    fn partial_toml_overrides_fields() {
        let raw = r#"
            [gap]
            min_records = 10
            max_records = 500

            [fetch]
            mode = "timeline"
            early_coverage_seconds = 5

            [[areas]]
            name = "primary"
            root = "/srv/primary"
            role = "source"

            [[areas]]
            name = "backup"
            root = "/srv/backup"
            prefix = "jp"
            role = "source"

            [[areas]]
            name = "complement"
            root = "/srv/complement"
            role = "output"
        "#;
        let config = Config::from_toml(raw).unwrap();
        assert_eq!(config.gap.min_records, 10);
        assert_eq!(config.fetch.mode, FetchMode::Timeline);
        assert_eq!(config.fetch.early_coverage_seconds, 5);
        assert_eq!(config.areas.len(), 3);
        assert_eq!(config.areas[1].prefix, "jp");
        assert_eq!(config.fetch.limit, 100);
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let raw = "[gap]\nmin_records = 500\nmax_records = 100\n";
        let err = Config::from_toml(raw).unwrap_err();
        assert!(err.to_string().contains("min_records"));
    }

    #[test]
    fn missing_output_area_rejected() {
        let raw = r#"
            [[areas]]
            name = "primary"
            root = "data"
            role = "source"
        "#;
        assert!(Config::from_toml(raw).is_err());
    }

    #[test]
    fn zero_width_rejected() {
        assert!(Config::from_toml("[slots]\nwidth_minutes = 0\n").is_err());
    }

    #[test]
    fn non_finite_rate_limits_rejected() {
        for raw in [
            "[rate_limit]\ncapacity = nan\n",
            "[rate_limit]\nrefill_per_sec = nan\n",
            "[rate_limit]\ncapacity = inf\n",
            "[rate_limit]\nrefill_per_sec = -1.0\n",
        ] {
            let err = Config::from_toml(raw).unwrap_err();
            assert!(err.to_string().contains("rate_limit"), "{raw}: {err}");
        }
        let ok = Config::from_toml("[rate_limit]\ncapacity = 2.5\nrefill_per_sec = 0.5\n").unwrap();
        assert!((ok.rate_limit.capacity - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn load_from_missing_file() {
        let err = Config::load_from(Path::new("/nonexistent/slotfill.toml")).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Config(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn retry_config_builds_policy() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.max_attempts, Some(4));
        assert_eq!(policy.initial_delay, Duration::from_secs(5));
    }
}
