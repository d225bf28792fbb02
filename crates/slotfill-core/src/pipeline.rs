//! Run orchestration: inventory, gap detection, pagination, merge, verify.
//!
//! [`Archive`] bundles the read-only view of the storage areas and answers
//! `scan`, `verify` and `inspect` without touching the upstream API.
//! [`Pipeline`] adds the paginator and runs a complement pass:
//!
//! ```text
//! enumerate -> Inventory::build -> detect_gaps -> per slot:
//!     fetch_slot_after -> merge_slot      (bounded by `concurrency`)
//! -> Inventory::build (targeted slots) -> verify_slots -> RunReport
//! ```
//!
//! Slot workers share the inventory snapshot, the rate gate and the
//! shutdown signal. Failures stay inside their slot. The snapshot also
//! indexes the slot just before the range so the first slot can anchor on
//! its newest archived identifier.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Semaphore;
use tracing::{Instrument, error, info, warn};

use crate::config::Config;
use crate::error::{ConfigError, Result};
use crate::gap::{GapPolicy, SlotAssessment, assess, detect_gaps};
use crate::inventory::Inventory;
use crate::merge::{MergeOptions, merge_slot};
use crate::paginator::{Paginator, PaginatorSettings, Shutdown};
use crate::report::{FetchSummary, RunReport, RunSummary, ScanReport, SlotOutcome, SlotRun};
use crate::retry::RetryPolicy;
use crate::search::SearchApi;
use crate::slot::{Slot, SlotLayout, enumerate_slots};
use crate::storage::StorageArea;
use crate::token_bucket::RateGate;
use crate::verify::{CoverageResult, SlotInspection, inspect_slot, verify_slots};

/// The storage side of a run.
#[derive(Debug, Clone)]
pub struct Archive {
    layout: SlotLayout,
    areas: Vec<StorageArea>,
    policy: GapPolicy,
    width: TimeDelta,
    max_slots: Option<usize>,
}

impl Archive {
    #[must_use]
    pub fn new(
        layout: SlotLayout,
        areas: Vec<StorageArea>,
        policy: GapPolicy,
        width: TimeDelta,
    ) -> Self {
        Self {
            layout,
            areas,
            policy,
            width,
            max_slots: None,
        }
    }

    /// Filesystem-backed archive for a validated config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let layout = SlotLayout::from_config(&config.slots)?;
        let areas = config.areas.iter().map(StorageArea::from_config).collect();
        Ok(Self::new(
            layout,
            areas,
            GapPolicy::from_config(&config.gap),
            TimeDelta::minutes(i64::from(config.slots.width_minutes)),
        )
        .with_max_slots(config.run.max_slots))
    }

    #[must_use]
    pub fn with_max_slots(mut self, max_slots: Option<usize>) -> Self {
        self.max_slots = max_slots;
        self
    }

    #[must_use]
    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    #[must_use]
    pub fn areas(&self) -> &[StorageArea] {
        &self.areas
    }

    #[must_use]
    pub fn width(&self) -> TimeDelta {
        self.width
    }

    pub fn output_area(&self) -> Result<&StorageArea> {
        self.areas.iter().find(|a| a.is_output()).ok_or_else(|| {
            ConfigError::ValidationError("no storage area has role = \"output\"".into()).into()
        })
    }

    /// Slots covering `[start, end]`, truncated to `max_slots`.
    pub fn enumerate(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Slot>> {
        let mut slots = enumerate_slots(start, end, self.width)?;
        if let Some(max) = self.max_slots {
            if slots.len() > max {
                info!(total = slots.len(), max_slots = max, "Truncating slot range");
                slots.truncate(max);
            }
        }
        Ok(slots)
    }

    /// Classify every slot in the range without fetching.
    pub async fn scan(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<ScanReport> {
        let slots = self.enumerate(start, end)?;
        let inventory = Inventory::build(&self.areas, &self.layout, &slots).await?;
        let assessments = assess(&inventory, &self.layout, &self.policy, &slots);
        Ok(ScanReport {
            range_start: start,
            range_end: end,
            total_slots: slots.len(),
            listing_calls: inventory.listing_calls(),
            unavailable_areas: inventory.unavailable_areas(),
            assessments,
        })
    }

    /// Verify every slot in the range against current storage.
    pub async fn verify(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        early_coverage: TimeDelta,
    ) -> Result<Vec<CoverageResult>> {
        let slots = self.enumerate(start, end)?;
        self.verify_slots(&slots, early_coverage).await
    }

    async fn verify_slots(
        &self,
        slots: &[Slot],
        early_coverage: TimeDelta,
    ) -> Result<Vec<CoverageResult>> {
        let inventory = Inventory::build(&self.areas, &self.layout, slots).await?;
        Ok(verify_slots(
            &inventory,
            &self.layout,
            &self.policy,
            slots,
            early_coverage,
        ))
    }

    pub async fn inspect(&self, slot_key: &str) -> Result<SlotInspection> {
        inspect_slot(&self.areas, &self.layout, slot_key, self.width).await
    }
}

/// Per-slot work shared by every spawned task.
#[derive(Debug)]
struct SlotWorker {
    paginator: Paginator,
    output: StorageArea,
    layout: SlotLayout,
    inventory: Arc<Inventory>,
    options: MergeOptions,
    shutdown: Shutdown,
}

impl SlotWorker {
    async fn process(&self, assessment: SlotAssessment) -> SlotRun {
        let mut run = SlotRun::pending(&assessment);
        if self.shutdown.is_triggered() {
            info!(slot = %assessment.slot_key, "Shutdown requested; slot skipped");
            run.settle();
            return run;
        }

        let slot = assessment.slot;
        let key = assessment.slot_key;
        let previous_key = self.layout.slot_key(&slot.previous());
        let boundary = self.inventory.newest_id(&previous_key);
        info!(status = ?assessment.status, "Complementing slot");

        match self.paginator.fetch_slot_after(&slot, &key, boundary).await {
            Ok(fetch) => {
                run.fetch = Some(FetchSummary::from(&fetch));
                let merged = merge_slot(
                    &self.output,
                    &self.layout,
                    &self.inventory,
                    &slot,
                    fetch.records,
                    self.options,
                )
                .await;
                match merged {
                    Ok(result) => run.merge = Some(result),
                    Err(e) => {
                        error!(error = %e, "Slot write failed");
                        run.error = Some(e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Slot fetch failed");
                run.error = Some(e.to_string());
            }
        }
        run.settle();
        run
    }
}

/// A complement run over one archive and one search backend.
pub struct Pipeline {
    archive: Archive,
    settings: PaginatorSettings,
    api: Arc<dyn SearchApi>,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
    options: MergeOptions,
    dry_run: bool,
    concurrency: usize,
    shutdown: Shutdown,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("archive", &self.archive)
            .field("settings", &self.settings)
            .field("options", &self.options)
            .field("dry_run", &self.dry_run)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(
        archive: Archive,
        api: Arc<dyn SearchApi>,
        gate: Arc<RateGate>,
        retry: RetryPolicy,
        settings: PaginatorSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            archive,
            settings,
            api,
            gate,
            retry,
            options: MergeOptions::default(),
            dry_run: false,
            concurrency: 1,
            shutdown,
        }
    }

    /// Wire a pipeline from a validated config.
    pub fn from_config(
        config: &Config,
        api: Arc<dyn SearchApi>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        Ok(Self::new(
            Archive::from_config(config)?,
            api,
            Arc::new(RateGate::from_config(&config.rate_limit)),
            config.retry.policy(),
            PaginatorSettings::from_config(&config.fetch),
            shutdown,
        )
        .with_options(MergeOptions {
            overwrite: config.run.overwrite,
            keep_non_japanese: config.fetch.keep_non_japanese,
        })
        .with_dry_run(config.run.dry_run)
        .with_concurrency(config.run.concurrency))
    }

    #[must_use]
    pub fn with_options(mut self, options: MergeOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    #[must_use]
    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    #[must_use]
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Complement every gap in `[start, end]` and verify the result.
    ///
    /// Only range and inventory errors abort the run; everything after gap
    /// detection is reported per slot.
    pub async fn run(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<RunReport> {
        let started_at = Utc::now();
        let archive = &self.archive;
        let slots = archive.enumerate(start, end)?;
        let indexed: Vec<Slot> = slots
            .first()
            .map(Slot::previous)
            .into_iter()
            .chain(slots.iter().copied())
            .collect();
        let inventory = Arc::new(Inventory::build(archive.areas(), archive.layout(), &indexed).await?);
        let unavailable_areas = inventory.unavailable_areas();
        let gaps = detect_gaps(
            &inventory,
            archive.layout(),
            &archive.policy,
            &slots,
            self.options.overwrite,
        );

        let mut runs = if self.dry_run {
            gaps.iter()
                .map(|assessment| {
                    info!(slot = %assessment.slot_key, status = ?assessment.status, "Dry run: would complement");
                    let mut run = SlotRun::pending(assessment);
                    run.outcome = SlotOutcome::Planned;
                    run
                })
                .collect()
        } else {
            self.complement(gaps, Arc::clone(&inventory)).await?
        };

        let mut verification_error = None;
        if !self.dry_run {
            let touched: Vec<Slot> = runs
                .iter()
                .filter(|r| r.fetch.is_some())
                .filter_map(|r| slots.iter().find(|s| archive.layout().slot_key(s) == r.slot_key))
                .copied()
                .collect();
            if !touched.is_empty() {
                match archive
                    .verify_slots(&touched, self.settings.early_coverage)
                    .await
                {
                    Ok(results) => attach_coverage(&mut runs, results),
                    Err(e) => {
                        warn!(error = %e, "Post-run verification unavailable");
                        verification_error = Some(e.to_string());
                    }
                }
            }
        }

        let summary = RunSummary::from_slots(slots.len(), &runs);
        let gate = self.gate.stats().await;
        info!(
            total = summary.total_slots,
            targeted = summary.targeted,
            completed = summary.completed,
            partial = summary.partial,
            failed = summary.failed,
            skipped = summary.skipped,
            new_records = summary.new_records,
            requests = gate.total_consumed,
            throttled = gate.total_denied,
            unavailable_areas = unavailable_areas.len(),
            "Run finished"
        );
        Ok(RunReport {
            started_at,
            finished_at: Utc::now(),
            range_start: start,
            range_end: end,
            dry_run: self.dry_run,
            overwrite: self.options.overwrite,
            cancelled: self.shutdown.is_triggered(),
            unavailable_areas,
            verification_error,
            slots: runs,
            summary,
        })
    }

    async fn complement(
        &self,
        gaps: Vec<SlotAssessment>,
        inventory: Arc<Inventory>,
    ) -> Result<Vec<SlotRun>> {
        let worker = Arc::new(SlotWorker {
            paginator: Paginator::new(
                Arc::clone(&self.api),
                Arc::clone(&self.gate),
                self.retry.clone(),
                self.settings.clone(),
                self.shutdown.clone(),
            ),
            output: self.archive.output_area()?.clone(),
            layout: self.archive.layout().clone(),
            inventory,
            options: self.options,
            shutdown: self.shutdown.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let mut handles = Vec::with_capacity(gaps.len());
        for assessment in gaps {
            let pending = SlotRun::pending(&assessment);
            let worker = Arc::clone(&worker);
            let semaphore = Arc::clone(&semaphore);
            let span = crate::slot_span!("slot", slot = %assessment.slot_key);
            let handle = tokio::spawn(
                async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return SlotRun::pending(&assessment);
                    };
                    worker.process(assessment).await
                }
                .instrument(span),
            );
            handles.push((pending, handle));
        }

        // Awaiting in spawn order keeps the report chronological.
        let mut runs = Vec::with_capacity(handles.len());
        for (mut pending, handle) in handles {
            match handle.await {
                Ok(run) => runs.push(run),
                Err(e) => {
                    error!(slot = %pending.slot_key, error = %e, "Slot task aborted");
                    pending.error = Some(format!("slot task aborted: {e}"));
                    pending.settle();
                    runs.push(pending);
                }
            }
        }
        Ok(runs)
    }
}

fn attach_coverage(runs: &mut [SlotRun], results: Vec<CoverageResult>) {
    for result in results {
        if let Some(run) = runs.iter_mut().find(|r| r.slot_key == result.slot_key) {
            run.coverage = Some(result);
            run.settle();
        }
    }
}
