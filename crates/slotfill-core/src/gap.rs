//! Gap detection: which slots need a complement pass.
//!
//! An artifact existing under the expected key proves nothing on its own;
//! captured rate-limit bodies look like valid objects. Each area's artifact
//! is therefore classified by its record count, and a slot is skipped only
//! when some area holds a complete copy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GapConfig;
use crate::inventory::{Inventory, SlotInventoryEntry};
use crate::slot::{Slot, SlotLayout};

/// Coarse state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Complete,
    Missing,
    Incomplete,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Missing => write!(f, "missing"),
            Self::Incomplete => write!(f, "incomplete"),
        }
    }
}

/// Why an area's artifact got its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Classification {
    Absent,
    /// No line parsed as a record.
    ErrorOnly { lines: usize },
    TooFew { records: usize },
    TooMany { records: usize },
    Complete { records: usize },
}

impl Classification {
    #[must_use]
    pub fn status(self) -> SlotStatus {
        match self {
            Self::Absent | Self::ErrorOnly { .. } => SlotStatus::Missing,
            Self::TooFew { .. } | Self::TooMany { .. } => SlotStatus::Incomplete,
            Self::Complete { .. } => SlotStatus::Complete,
        }
    }
}

/// Record-count thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapPolicy {
    pub min_records: usize,
    pub max_records: usize,
}

impl Default for GapPolicy {
    fn default() -> Self {
        Self::from_config(&GapConfig::default())
    }
}

impl GapPolicy {
    #[must_use]
    pub fn from_config(config: &GapConfig) -> Self {
        Self {
            min_records: config.min_records,
            max_records: config.max_records,
        }
    }

    #[must_use]
    pub fn classify(&self, entry: Option<&SlotInventoryEntry>) -> Classification {
        let Some(entry) = entry else {
            return Classification::Absent;
        };
        let records = entry.record_count;
        if entry.is_error_only {
            Classification::ErrorOnly {
                lines: entry.line_count,
            }
        } else if records <= self.min_records {
            Classification::TooFew { records }
        } else if records >= self.max_records {
            Classification::TooMany { records }
        } else {
            Classification::Complete { records }
        }
    }
}

/// One area's view of a slot.
#[derive(Debug, Clone, Serialize)]
pub struct AreaState {
    pub area: String,
    pub object_key: Option<String>,
    pub size: Option<u64>,
    pub line_count: Option<usize>,
    pub classification: Classification,
}

/// A slot with its combined status and per-area evidence.
#[derive(Debug, Clone, Serialize)]
pub struct SlotAssessment {
    #[serde(skip)]
    pub slot: Slot,
    pub slot_key: String,
    pub status: SlotStatus,
    pub areas: Vec<AreaState>,
}

impl SlotAssessment {
    #[must_use]
    pub fn needs_work(&self) -> bool {
        self.status != SlotStatus::Complete
    }
}

/// Classify every slot across every area, in slot order.
///
/// The combined status is `complete` if any area is complete, otherwise
/// `incomplete` if any area is, otherwise `missing`.
#[must_use]
pub fn assess(
    inventory: &Inventory,
    layout: &SlotLayout,
    policy: &GapPolicy,
    slots: &[Slot],
) -> Vec<SlotAssessment> {
    slots
        .iter()
        .map(|slot| {
            let slot_key = layout.slot_key(slot);
            let areas: Vec<AreaState> = inventory
                .area_names()
                .into_iter()
                .map(|area| {
                    let entry = inventory.entry(area, &slot_key);
                    AreaState {
                        area: area.to_string(),
                        object_key: entry.map(|e| e.object_key.clone()),
                        size: entry.map(|e| e.size),
                        line_count: entry.map(|e| e.line_count),
                        classification: policy.classify(entry),
                    }
                })
                .collect();
            let statuses: Vec<SlotStatus> =
                areas.iter().map(|a| a.classification.status()).collect();
            let status = if statuses.contains(&SlotStatus::Complete) {
                SlotStatus::Complete
            } else if statuses.contains(&SlotStatus::Incomplete) {
                SlotStatus::Incomplete
            } else {
                SlotStatus::Missing
            };
            SlotAssessment {
                slot: *slot,
                slot_key,
                status,
                areas,
            }
        })
        .collect()
}

/// A run of adjacent slots, such as one collector outage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotPeriod {
    pub start: DateTime<Utc>,
    /// Exclusive end of the last slot.
    pub end: DateTime<Utc>,
    pub first_key: String,
    pub last_key: String,
    pub slots: usize,
}

/// Group chronologically ordered slots into maximal contiguous periods.
///
/// A slot joins the current period when it starts where the period ends.
#[must_use]
pub fn group_periods<'a>(slots: impl IntoIterator<Item = (Slot, &'a str)>) -> Vec<SlotPeriod> {
    let mut periods: Vec<SlotPeriod> = Vec::new();
    for (slot, key) in slots {
        match periods.last_mut() {
            Some(period) if period.end == slot.start => {
                period.end = slot.end();
                period.last_key = key.to_string();
                period.slots += 1;
            }
            _ => periods.push(SlotPeriod {
                start: slot.start,
                end: slot.end(),
                first_key: key.to_string(),
                last_key: key.to_string(),
                slots: 1,
            }),
        }
    }
    periods
}

/// Slots requiring a complement pass, in chronological order.
///
/// With `overwrite` every slot is returned regardless of its status.
#[must_use]
pub fn detect_gaps(
    inventory: &Inventory,
    layout: &SlotLayout,
    policy: &GapPolicy,
    slots: &[Slot],
    overwrite: bool,
) -> Vec<SlotAssessment> {
    let gaps: Vec<SlotAssessment> = assess(inventory, layout, policy, slots)
        .into_iter()
        .filter(|a| overwrite || a.needs_work())
        .collect();
    tracing::info!(
        total = slots.len(),
        gaps = gaps.len(),
        overwrite,
        "Gap detection finished"
    );
    gaps
}
