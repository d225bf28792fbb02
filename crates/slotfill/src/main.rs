//! slotfill - find and backfill missing slots in a time-sliced post archive
//!
//! Thin wrapper over `slotfill-core`: loads configuration, applies flag
//! overrides, wires the Misskey client and renders results.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use slotfill_core::config::{Config, FetchMode, LogFormat};
use slotfill_core::logging::{LogConfig, init_logging};
use slotfill_core::paginator::Shutdown;
use slotfill_core::pipeline::{Archive, Pipeline};
use slotfill_core::slot::SlotLayout;
use slotfill_core::verify::VerifySummary;

mod misskey;
mod output;

use misskey::MisskeyClient;

const LOCAL_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M:%S"];

/// slotfill - find and backfill missing slots in a time-sliced post archive
#[derive(Parser, Debug)]
#[command(name = "slotfill")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "SLOTFILL_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify every slot in a range without fetching
    Scan {
        #[command(flatten)]
        range: RangeArgs,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Backfill missing and incomplete slots, then verify them
    Complement(Box<ComplementArgs>),

    /// Check coverage of every slot in a range
    Verify {
        #[command(flatten)]
        range: RangeArgs,

        /// Buffer after slot start that counts as full coverage
        #[arg(long)]
        early_coverage_seconds: Option<u32>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show what every area holds for one slot
    Inspect {
        /// Slot key (YYYY-MM-DD_HH-MM) or a datetime inside the slot
        slot: String,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RangeArgs {
    /// Range start, YYYY-MM-DDTHH:MM in the archive offset or RFC 3339
    #[arg(long)]
    start: String,

    /// Range end, inclusive of the slot it falls in
    #[arg(long)]
    end: String,
}

#[derive(Args, Debug)]
struct ComplementArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Upstream API flavor (search, timeline)
    #[arg(long)]
    mode: Option<FetchMode>,

    /// Instance base URL, e.g. https://misskey.io
    #[arg(long)]
    base_url: Option<String>,

    /// API endpoint below /api/
    #[arg(long)]
    endpoint: Option<String>,

    /// Access token
    #[arg(long, env = "MISSKEY_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Restrict results to one host
    #[arg(long)]
    host: Option<String>,

    /// Search text
    #[arg(long)]
    query: Option<String>,

    /// Records per page
    #[arg(long)]
    limit: Option<u32>,

    /// Page budget per window
    #[arg(long)]
    max_pages: Option<u32>,

    /// Pause between pages
    #[arg(long)]
    page_delay_ms: Option<u64>,

    /// Buffer after slot start that counts as full coverage
    #[arg(long)]
    early_coverage_seconds: Option<u32>,

    /// Split each slot into windows of this many seconds
    #[arg(long)]
    sub_slot_seconds: Option<u32>,

    /// Explicit lower anchor for every window
    #[arg(long)]
    since_id: Option<String>,

    /// Explicit upper anchor for every window's first page
    #[arg(long)]
    until_id: Option<String>,

    /// List target slots without fetching or writing
    #[arg(long)]
    dry_run: bool,

    /// Refetch every slot, including complete ones
    #[arg(long)]
    overwrite: bool,

    /// Keep records without Japanese text
    #[arg(long, conflicts_with = "japanese_only")]
    keep_non_japanese: bool,

    /// Persist only records with Japanese text
    #[arg(long)]
    japanese_only: bool,

    /// Slots processed in parallel
    #[arg(long)]
    concurrency: Option<usize>,

    /// Stop issuing requests after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Process at most this many slots
    #[arg(long)]
    max_slots: Option<usize>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,

    /// Also write the run report as JSON to this file
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

impl ComplementArgs {
    fn apply(&self, config: &mut Config) {
        let fetch = &mut config.fetch;
        if let Some(mode) = self.mode {
            fetch.mode = mode;
        }
        if let Some(url) = &self.base_url {
            fetch.base_url.clone_from(url);
        }
        if let Some(endpoint) = &self.endpoint {
            fetch.endpoint.clone_from(endpoint);
        }
        if self.token.is_some() {
            fetch.token.clone_from(&self.token);
        }
        if self.host.is_some() {
            fetch.host.clone_from(&self.host);
        }
        if self.query.is_some() {
            fetch.query.clone_from(&self.query);
        }
        if let Some(limit) = self.limit {
            fetch.limit = limit;
        }
        if let Some(max_pages) = self.max_pages {
            fetch.max_pages = max_pages;
        }
        if let Some(delay) = self.page_delay_ms {
            fetch.page_delay_ms = delay;
        }
        if let Some(early) = self.early_coverage_seconds {
            fetch.early_coverage_seconds = early;
        }
        if self.sub_slot_seconds.is_some() {
            fetch.sub_slot_seconds = self.sub_slot_seconds;
        }
        if self.since_id.is_some() {
            fetch.since_id.clone_from(&self.since_id);
        }
        if self.until_id.is_some() {
            fetch.until_id.clone_from(&self.until_id);
        }
        if self.keep_non_japanese {
            fetch.keep_non_japanese = true;
        }
        if self.japanese_only {
            fetch.keep_non_japanese = false;
        }

        let run = &mut config.run;
        run.dry_run |= self.dry_run;
        run.overwrite |= self.overwrite;
        if let Some(concurrency) = self.concurrency {
            run.concurrency = concurrency;
        }
        if self.timeout_secs.is_some() {
            run.timeout_secs = self.timeout_secs;
        }
        if self.max_slots.is_some() {
            run.max_slots = self.max_slots;
        }
    }
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<slotfill_core::Error>()
                .and_then(slotfill_core::Error::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let mut config = load_config(cli.config.as_deref())?;

    let mut log = LogConfig::from(&config.general);
    if let Some(level) = cli.log_level {
        log.level = level;
    }
    if let Some(format) = cli.log_format {
        log.format = format;
    }
    init_logging(&log).context("failed to initialize logging")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    match cli.command {
        Commands::Scan { range, json } => runtime.block_on(scan(&config, &range, json)),
        Commands::Complement(args) => {
            args.apply(&mut config);
            config.validate()?;
            runtime.block_on(complement(&config, &args))
        }
        Commands::Verify {
            range,
            early_coverage_seconds,
            json,
        } => {
            if let Some(early) = early_coverage_seconds {
                config.fetch.early_coverage_seconds = early;
            }
            runtime.block_on(verify(&config, &range, json))
        }
        Commands::Inspect { slot, json } => runtime.block_on(inspect(&config, &slot, json)),
    }
}

/// Explicit path, then the per-user config file, then built-in defaults.
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    if let Some(path) = explicit {
        return Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()));
    }
    if let Some(path) = dirs::config_dir().map(|d| d.join("slotfill").join("config.toml")) {
        if path.exists() {
            return Config::load_from(&path)
                .with_context(|| format!("failed to load config from {}", path.display()));
        }
    }
    Ok(Config::default())
}

fn parse_time(layout: &SlotLayout, raw: &str) -> Result<DateTime<Utc>> {
    for format in LOCAL_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(layout.from_local(naive)?);
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid datetime '{raw}'; expected YYYY-MM-DDTHH:MM"))
}

fn parse_range(layout: &SlotLayout, range: &RangeArgs) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let start = parse_time(layout, &range.start).context("bad --start")?;
    let end = parse_time(layout, &range.end).context("bad --end")?;
    Ok((start, end))
}

async fn scan(config: &Config, range: &RangeArgs, json: bool) -> Result<i32> {
    let archive = Archive::from_config(config)?;
    let (start, end) = parse_range(archive.layout(), range)?;
    let report = archive.scan(start, end).await?;
    if json {
        println!("{}", output::json(&report)?);
    } else {
        print!("{}", output::render_scan(&report));
    }
    Ok(0)
}

async fn complement(config: &Config, args: &ComplementArgs) -> Result<i32> {
    let flag = Arc::new(AtomicBool::new(false));
    let deadline = config
        .run
        .timeout_secs
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));
    let shutdown = Shutdown::new(Arc::clone(&flag), deadline);

    let client = MisskeyClient::new(&config.fetch, config.resolved_token())
        .context("failed to build HTTP client")?;
    if config.resolved_token().is_none() && !config.run.dry_run {
        warn!("No access token configured; requests are sent anonymously");
    }
    let pipeline = Pipeline::from_config(config, Arc::new(client), shutdown.clone())?;
    let (start, end) = parse_range(pipeline.archive().layout(), &args.range)?;

    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing in-flight slots");
            interrupt.trigger();
        }
    });

    let report = pipeline.run(start, end).await?;
    if let Some(path) = &args.report {
        report
            .write_to(path)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "Run report written");
    }
    if args.json {
        println!("{}", output::json(&report)?);
    } else {
        print!("{}", output::render_run(&report));
    }
    Ok(report.summary.exit_code())
}

async fn verify(config: &Config, range: &RangeArgs, json: bool) -> Result<i32> {
    let archive = Archive::from_config(config)?;
    let (start, end) = parse_range(archive.layout(), range)?;
    let early = TimeDelta::seconds(i64::from(config.fetch.early_coverage_seconds));
    let results = archive.verify(start, end, early).await?;
    if json {
        println!("{}", output::json(&results)?);
    } else {
        print!("{}", output::render_verify(&results));
    }
    let summary = VerifySummary::from_results(&results);
    Ok(if summary.failed > 0 {
        1
    } else if summary.warning > 0 {
        2
    } else {
        0
    })
}

async fn inspect(config: &Config, slot: &str, json: bool) -> Result<i32> {
    let archive = Archive::from_config(config)?;
    let layout = archive.layout();
    let slot_key = if layout.parse_slot_key(slot).is_ok() {
        slot.to_string()
    } else {
        let ts = parse_time(layout, slot)
            .with_context(|| format!("'{slot}' is neither a slot key nor a datetime"))?;
        layout.containing_slot_key(ts, archive.width())
    };
    let inspection = archive.inspect(&slot_key).await?;
    if json {
        println!("{}", output::json(&inspection)?);
    } else {
        print!("{}", output::render_inspection(&inspection));
    }
    Ok(0)
}
