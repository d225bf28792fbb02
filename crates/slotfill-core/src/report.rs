//! Run reports: per-slot before/after state and the run summary.
//!
//! Reports serialize to JSON so a follow-up run can target exactly the
//! failed and partial slots. Those slots are also grouped into contiguous
//! periods, one `--start/--end` pair each.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::gap::{AreaState, SlotAssessment, SlotPeriod, SlotStatus, group_periods};
use crate::inventory::UnavailableArea;
use crate::merge::MergeResult;
use crate::paginator::{IncompleteCoverageWarning, SlotFetch, StopReason, WindowFetch};
use crate::slot::Slot;
use crate::verify::{CoverageResult, Verdict};

/// Final state of one slot in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotOutcome {
    Completed,
    Partial,
    Failed,
    /// Never started because the run was cancelled.
    Skipped,
    /// Dry run: would have been fetched.
    Planned,
}

/// Pagination summary kept in the report.
#[derive(Debug, Clone, Serialize)]
pub struct FetchSummary {
    pub records: usize,
    pub pages: u32,
    pub stop: Option<StopReason>,
    pub windows: Vec<WindowFetch>,
    pub warnings: Vec<IncompleteCoverageWarning>,
    /// Previous-slot identifier used as the lower anchor.
    pub since_boundary: Option<String>,
}

impl From<&SlotFetch> for FetchSummary {
    fn from(fetch: &SlotFetch) -> Self {
        Self {
            records: fetch.records.len(),
            pages: fetch.pages(),
            stop: fetch.stop(),
            windows: fetch.windows.clone(),
            warnings: fetch.warnings.clone(),
            since_boundary: fetch.since_boundary.clone(),
        }
    }
}

/// Everything that happened to one slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotRun {
    #[serde(skip)]
    pub slot: Slot,
    pub slot_key: String,
    pub pre_status: SlotStatus,
    pub pre_areas: Vec<AreaState>,
    pub fetch: Option<FetchSummary>,
    pub merge: Option<MergeResult>,
    pub coverage: Option<CoverageResult>,
    pub error: Option<String>,
    pub outcome: SlotOutcome,
}

impl SlotRun {
    #[must_use]
    pub fn pending(assessment: &SlotAssessment) -> Self {
        Self {
            slot: assessment.slot,
            slot_key: assessment.slot_key.clone(),
            pre_status: assessment.status,
            pre_areas: assessment.areas.clone(),
            fetch: None,
            merge: None,
            coverage: None,
            error: None,
            outcome: SlotOutcome::Skipped,
        }
    }

    /// Derive the outcome from what was recorded so far.
    pub fn settle(&mut self) {
        self.outcome = if self.error.is_some() {
            SlotOutcome::Failed
        } else if self.fetch.is_none() {
            SlotOutcome::Skipped
        } else {
            let partial_fetch = self.fetch.as_ref().is_some_and(|f| !f.warnings.is_empty());
            match self.coverage.as_ref().map(CoverageResult::verdict) {
                Some(Verdict::Failed) => SlotOutcome::Failed,
                Some(Verdict::Warning) => SlotOutcome::Partial,
                _ if partial_fetch => SlotOutcome::Partial,
                _ => SlotOutcome::Completed,
            }
        };
    }

    #[must_use]
    pub fn new_records(&self) -> usize {
        self.merge.as_ref().map_or(0, |m| m.new_records)
    }

    #[must_use]
    pub fn needs_rerun(&self) -> bool {
        matches!(
            self.outcome,
            SlotOutcome::Failed | SlotOutcome::Partial | SlotOutcome::Skipped
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub total_slots: usize,
    pub targeted: usize,
    pub completed: usize,
    pub partial: usize,
    pub failed: usize,
    pub skipped: usize,
    pub planned: usize,
    pub new_records: usize,
    pub failed_slots: Vec<String>,
    pub partial_slots: Vec<String>,
    pub skipped_slots: Vec<String>,
    /// Contiguous runs of failed, partial and skipped slots.
    pub rerun_periods: Vec<SlotPeriod>,
}

impl RunSummary {
    #[must_use]
    pub fn from_slots(total_slots: usize, slots: &[SlotRun]) -> Self {
        let mut summary = Self {
            total_slots,
            targeted: slots.len(),
            ..Self::default()
        };
        for slot in slots {
            summary.new_records += slot.new_records();
            match slot.outcome {
                SlotOutcome::Completed => summary.completed += 1,
                SlotOutcome::Partial => {
                    summary.partial += 1;
                    summary.partial_slots.push(slot.slot_key.clone());
                }
                SlotOutcome::Failed => {
                    summary.failed += 1;
                    summary.failed_slots.push(slot.slot_key.clone());
                }
                SlotOutcome::Skipped => {
                    summary.skipped += 1;
                    summary.skipped_slots.push(slot.slot_key.clone());
                }
                SlotOutcome::Planned => summary.planned += 1,
            }
        }
        summary.rerun_periods = group_periods(
            slots
                .iter()
                .filter(|s| s.needs_rerun())
                .map(|s| (s.slot, s.slot_key.as_str())),
        );
        summary
    }

    /// 0 when everything completed, 2 with partial slots only, 1 when any
    /// slot failed or was skipped.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.failed > 0 || self.skipped > 0 {
            1
        } else if self.partial > 0 {
            2
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub dry_run: bool,
    pub overwrite: bool,
    pub cancelled: bool,
    /// Source areas the run proceeded without.
    pub unavailable_areas: Vec<UnavailableArea>,
    /// Set when the post-run inventory could not be rebuilt.
    pub verification_error: Option<String>,
    pub slots: Vec<SlotRun>,
    pub summary: RunSummary,
}

impl RunReport {
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as pretty JSON, creating parent directories.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }
}

/// Result of `scan`: classification without fetching.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub total_slots: usize,
    pub listing_calls: usize,
    /// Source areas that could not be read; their copies were not considered.
    pub unavailable_areas: Vec<UnavailableArea>,
    pub assessments: Vec<SlotAssessment>,
}

impl ScanReport {
    #[must_use]
    pub fn gaps(&self) -> Vec<&SlotAssessment> {
        self.assessments.iter().filter(|a| a.needs_work()).collect()
    }

    /// Gaps grouped into contiguous periods.
    #[must_use]
    pub fn gap_periods(&self) -> Vec<SlotPeriod> {
        group_periods(
            self.assessments
                .iter()
                .filter(|a| a.needs_work())
                .map(|a| (a.slot, a.slot_key.as_str())),
        )
    }

    #[must_use]
    pub fn count(&self, status: SlotStatus) -> usize {
        self.assessments.iter().filter(|a| a.status == status).count()
    }
}
