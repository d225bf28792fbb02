//! Error types for slotfill-core

use std::fmt::Write;
use std::time::Duration;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for slotfill-core
#[derive(Error, Debug)]
pub enum Error {
    /// The requested slot range or width is unusable
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Upstream search/timeline API errors
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The run was interrupted or hit its deadline
    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::InvalidRange(_) => Some(
                Remediation::new("Pass --end at or after --start and a positive slot width.")
                    .command("Example", "slotfill scan --start 2025-08-01T00:00 --end 2025-08-01T06:00"),
            ),
            Self::Storage(err) => Some(err.remediation()),
            Self::Api(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data and complement roots exist and are writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("A stored slot file or API response is not valid JSON.")
                    .command("Inspect slot", "slotfill inspect <SLOT_KEY>"),
            ),
            Self::Cancelled(_) => Some(
                Remediation::new("The run stopped early; re-run the failed and partial slots.")
                    .alternative("Raise --timeout-secs if the deadline was too tight."),
            ),
        }
    }
}

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Listing or reading an area failed; the inventory cannot be trusted
    #[error("Storage area {area} unavailable: {reason}")]
    Unavailable { area: String, reason: String },

    /// Writing a slot artifact failed
    #[error("Failed to persist {key}: {reason}")]
    Persistence { key: String, reason: String },

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Key escapes the area root or is otherwise malformed
    #[error("Invalid object key: {0}")]
    InvalidKey(String),
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Unavailable { area, .. } => Remediation::new(format!(
                "Storage area '{area}' could not be listed. Check that its root exists and is readable."
            ))
            .alternative("Configure a redundant source area so one outage does not block the run."),
            Self::Persistence { key, .. } => {
                Remediation::new(format!("Could not write {key}. Check free space and permissions."))
                    .alternative("Failed slots are listed in the run summary; re-run just those.")
            }
            Self::NotFound(_) => Remediation::new("The object disappeared between listing and reading.")
                .alternative("Re-run; the inventory is rebuilt on every run."),
            Self::InvalidKey(_) => {
                Remediation::new("Object keys must be relative paths without '..' components.")
            }
        }
    }
}

/// Upstream API errors
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// A single request was throttled (HTTP 429)
    #[error("Rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// Throttling persisted past the retry budget
    #[error("Rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    /// Network failure or 5xx; worth retrying
    #[error("Transient network error: {0}")]
    Transient(String),

    /// Non-retryable HTTP failure
    #[error("Request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Response was not a list of records
    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::RateLimited { .. } | Self::RateLimitExceeded { .. } => Remediation::new(
                "The upstream API is throttling requests. Slow down and re-run the failed slots.",
            )
            .command("Slower run", "slotfill complement --page-delay-ms 2000 ...")
            .alternative("Lower --concurrency or the rate_limit refill rate."),
            Self::Transient(_) => Remediation::new("Network failure talking to the API; retry later.")
                .alternative("Raise [retry] max_attempts for flaky links."),
            Self::Rejected { status, .. } => Remediation::new(format!(
                "The API rejected the request (HTTP {status}). Check the token and endpoint."
            ))
            .command("Set token", "export MISSKEY_TOKEN=...")
            .alternative("notes/search requires a token on most instances."),
            Self::Decode(_) => Remediation::new("The API returned an unexpected payload.")
                .alternative("Verify --base-url points at a Misskey instance."),
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or drop --config: {path}"))
            }
            Self::ReadFailed(path, _) => {
                Remediation::new(format!("Check permissions on the config file: {path}"))
            }
            Self::ParseFailed(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Every section is optional; delete keys you do not need."),
            Self::ValidationError(_) => {
                Remediation::new("Adjust the offending value; defaults are documented in config.rs.")
            }
        }
    }
}
