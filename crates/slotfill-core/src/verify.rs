//! Post-run verification and single-slot inspection.
//!
//! Verification works off a freshly built [`Inventory`], so it sees exactly
//! what storage holds after the complement pass. Coverage is judged on the
//! union of every area: a slot whose records were all archived already
//! needs no output artifact. Coverage near the slot end is not checked:
//! with newest-first pagination the tail is always fetched first, and the
//! start is what the walk can fall short of.

use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::config::AreaRole;
use crate::error::{Error, Result, StorageError};
use crate::gap::{GapPolicy, SlotStatus};
use crate::inventory::Inventory;
use crate::record::parse_artifact;
use crate::slot::{Slot, SlotLayout};
use crate::storage::StorageArea;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverageStatus {
    Ok,
    /// No area holds any record for the slot.
    Missing,
    /// Records exist but none within the early-coverage buffer.
    Partial,
    /// The output repeats an identifier held by a source area.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Ok,
    Warning,
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Warning => write!(f, "warning"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoverageResult {
    pub slot_key: String,
    pub has_early_coverage: bool,
    /// Unique identifiers across every area.
    pub note_count: usize,
    pub oldest_ts: Option<DateTime<Utc>>,
    pub newest_ts: Option<DateTime<Utc>>,
    pub status: CoverageStatus,
    pub output_exists: bool,
    pub output_count: usize,
    /// Identifiers present both in the output and in a source area.
    pub collisions: usize,
    /// No output needed: a source area already holds a complete copy.
    pub covered_by_source: bool,
}

impl CoverageResult {
    #[must_use]
    pub fn verdict(&self) -> Verdict {
        match self.status {
            CoverageStatus::Ok => Verdict::Ok,
            CoverageStatus::Partial => Verdict::Warning,
            CoverageStatus::Missing | CoverageStatus::Error => Verdict::Failed,
        }
    }
}

/// Check each slot against the post-run inventory.
#[must_use]
pub fn verify_slots(
    inventory: &Inventory,
    layout: &SlotLayout,
    policy: &GapPolicy,
    slots: &[Slot],
    early_coverage: TimeDelta,
) -> Vec<CoverageResult> {
    slots
        .iter()
        .map(|slot| verify_one(inventory, layout, policy, slot, early_coverage))
        .collect()
}

fn verify_one(
    inventory: &Inventory,
    layout: &SlotLayout,
    policy: &GapPolicy,
    slot: &Slot,
    early_coverage: TimeDelta,
) -> CoverageResult {
    let slot_key = layout.slot_key(slot);
    let output = inventory.output_entry(&slot_key);
    let sources: Vec<_> = inventory
        .entries_with_role(&slot_key, AreaRole::Source)
        .collect();

    let source_ids: HashSet<&str> = sources
        .iter()
        .flat_map(|e| e.ids.iter().map(String::as_str))
        .collect();
    let collisions = output.map_or(0, |o| {
        o.ids
            .iter()
            .filter(|id| source_ids.contains(id.as_str()))
            .count()
    });
    let covered_by_source = sources
        .iter()
        .any(|e| policy.classify(Some(e)).status() == SlotStatus::Complete);

    let all = inventory.entries_for(&slot_key);
    let (mut oldest_ts, mut newest_ts) = (None::<DateTime<Utc>>, None::<DateTime<Utc>>);
    for entry in all {
        if let Some(o) = entry.oldest {
            oldest_ts = Some(oldest_ts.map_or(o, |cur| cur.min(o)));
        }
        if let Some(n) = entry.newest {
            newest_ts = Some(newest_ts.map_or(n, |cur| cur.max(n)));
        }
    }
    let note_count = inventory.known_ids(&slot_key).len();
    let has_early_coverage = oldest_ts.is_some_and(|o| o <= slot.start + early_coverage);
    let output_exists = output.is_some_and(|o| o.record_count > 0);
    let output_count = output.map_or(0, |o| o.record_count);

    let status = if collisions > 0 {
        CoverageStatus::Error
    } else if note_count == 0 {
        CoverageStatus::Missing
    } else if has_early_coverage || covered_by_source {
        CoverageStatus::Ok
    } else {
        CoverageStatus::Partial
    };

    if status != CoverageStatus::Ok {
        tracing::warn!(
            slot = %slot_key,
            status = ?status,
            collisions,
            note_count,
            oldest = ?oldest_ts,
            "Slot failed verification"
        );
    }

    CoverageResult {
        slot_key,
        has_early_coverage,
        note_count,
        oldest_ts,
        newest_ts,
        status,
        output_exists,
        output_count,
        collisions,
        covered_by_source,
    }
}

/// Counts by verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VerifySummary {
    pub ok: usize,
    pub warning: usize,
    pub failed: usize,
}

impl VerifySummary {
    #[must_use]
    pub fn from_results(results: &[CoverageResult]) -> Self {
        results.iter().fold(Self::default(), |mut acc, r| {
            match r.verdict() {
                Verdict::Ok => acc.ok += 1,
                Verdict::Warning => acc.warning += 1,
                Verdict::Failed => acc.failed += 1,
            }
            acc
        })
    }
}

/// One area's artifact for an inspected slot.
#[derive(Debug, Clone, Serialize)]
pub struct AreaInspection {
    pub area: String,
    pub object_key: String,
    pub exists: bool,
    pub lines: usize,
    pub invalid_lines: usize,
    pub unique_ids: usize,
    /// Identifiers appearing more than once in this artifact.
    pub duplicate_ids: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotInspection {
    pub slot_key: String,
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
    pub areas: Vec<AreaInspection>,
    pub total_lines: usize,
    /// Unique identifiers across every area.
    pub total_unique_ids: usize,
    /// Identifiers present in more than one area.
    pub cross_area_duplicates: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub covers_start: bool,
    pub covers_end: bool,
}

/// Read every area's artifact for `slot_key` directly from storage.
pub async fn inspect_slot(
    areas: &[StorageArea],
    layout: &SlotLayout,
    slot_key: &str,
    width: TimeDelta,
) -> Result<SlotInspection> {
    let slot = Slot::new(layout.parse_slot_key(slot_key)?, width);
    let mut inspections = Vec::with_capacity(areas.len());
    let mut area_count: HashMap<String, usize> = HashMap::new();

    for area in areas {
        let object_key = layout.object_key(&area.prefix, &slot);
        let bytes = match area.backend.get(&object_key).await {
            Ok(bytes) => Some(bytes),
            Err(Error::Storage(StorageError::NotFound(_))) => None,
            Err(e) => return Err(area.unavailable(e).into()),
        };
        let Some(bytes) = bytes else {
            inspections.push(AreaInspection {
                area: area.name.clone(),
                object_key,
                exists: false,
                lines: 0,
                invalid_lines: 0,
                unique_ids: 0,
                duplicate_ids: 0,
                oldest: None,
                newest: None,
            });
            continue;
        };

        let parsed = parse_artifact(&bytes);
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for record in &parsed.records {
            *counts.entry(record.id.as_str()).or_default() += 1;
        }
        for id in counts.keys() {
            *area_count.entry((*id).to_string()).or_default() += 1;
        }
        inspections.push(AreaInspection {
            area: area.name.clone(),
            object_key,
            exists: true,
            lines: parsed.line_count,
            invalid_lines: parsed.invalid_lines,
            unique_ids: counts.len(),
            duplicate_ids: counts.values().filter(|c| **c > 1).count(),
            oldest: parsed.records.iter().map(|r| r.created_at).min(),
            newest: parsed.records.iter().map(|r| r.created_at).max(),
        });
    }

    let oldest = inspections.iter().filter_map(|a| a.oldest).min();
    let newest = inspections.iter().filter_map(|a| a.newest).max();
    Ok(SlotInspection {
        slot_key: slot_key.to_string(),
        slot_start: slot.start,
        slot_end: slot.end(),
        total_lines: inspections.iter().map(|a| a.lines).sum(),
        total_unique_ids: area_count.len(),
        cross_area_duplicates: area_count.values().filter(|c| **c > 1).count(),
        covers_start: oldest.is_some_and(|o| o <= slot.start),
        covers_end: newest.is_some_and(|n| n >= slot.end() - TimeDelta::seconds(1)),
        oldest,
        newest,
        areas: inspections,
    })
}
