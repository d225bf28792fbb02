//! Per-run snapshot of what each storage area already holds.
//!
//! Construction lists every configured area once per local calendar day and
//! reads the slot artifacts inside the requested range. After that every
//! lookup is answered from memory, so the snapshot can be shared read-only
//! between slot workers.
//!
//! A source area that cannot be listed or read is kept in the snapshot as
//! unavailable and contributes no entries, as long as another source area
//! answered. The output area must always be readable.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AreaRole;
use crate::error::{Result, StorageError};
use crate::record::{Record, parse_artifact};
use crate::slot::{Slot, SlotLayout};
use crate::storage::StorageArea;

/// What one area holds for one slot.
#[derive(Debug, Clone, Serialize)]
pub struct SlotInventoryEntry {
    pub slot_key: String,
    pub area: String,
    pub object_key: String,
    pub size: u64,
    /// Non-blank lines in the artifact.
    pub line_count: usize,
    /// Lines that parsed as records.
    pub record_count: usize,
    #[serde(skip)]
    pub ids: BTreeSet<String>,
    pub duplicate_ids: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub is_error_only: bool,
    /// Parsed records; kept for the output area only so merges need no re-read.
    #[serde(skip)]
    pub records: Vec<Record>,
}

impl SlotInventoryEntry {
    fn from_bytes(area: &StorageArea, slot_key: &str, object_key: &str, size: u64, bytes: &[u8]) -> Self {
        let parsed = parse_artifact(bytes);
        let mut ids = BTreeSet::new();
        let mut duplicate_ids = 0;
        for record in &parsed.records {
            if !ids.insert(record.id.clone()) {
                duplicate_ids += 1;
            }
        }
        let oldest = parsed.records.iter().map(|r| r.created_at).min();
        let newest = parsed.records.iter().map(|r| r.created_at).max();
        let is_error_only = parsed.is_error_only();
        Self {
            slot_key: slot_key.to_string(),
            area: area.name.clone(),
            object_key: object_key.to_string(),
            size,
            line_count: parsed.line_count,
            record_count: parsed.records.len(),
            ids,
            duplicate_ids,
            oldest,
            newest,
            is_error_only,
            records: if area.is_output() {
                parsed.records
            } else {
                Vec::new()
            },
        }
    }
}

/// A source area left out of the snapshot because storage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnavailableArea {
    pub area: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct AreaSnapshot {
    name: String,
    role: AreaRole,
    entries: HashMap<String, SlotInventoryEntry>,
    /// Set when the area could not be read; `entries` is then empty.
    unavailable: Option<String>,
}

/// Read-only index of slot artifacts across every area.
#[derive(Debug, Clone)]
pub struct Inventory {
    areas: Vec<AreaSnapshot>,
    listing_calls: usize,
}

impl Inventory {
    /// Scan `areas` for the artifacts of `slots`.
    ///
    /// A failing source area is recorded as unavailable and skipped. The
    /// build fails with [`StorageError::Unavailable`] when the output area
    /// fails, or when every configured source area does.
    pub async fn build(areas: &[StorageArea], layout: &SlotLayout, slots: &[Slot]) -> Result<Self> {
        let wanted: HashSet<String> = slots.iter().map(|s| layout.slot_key(s)).collect();
        let days = layout.days_covering(slots);
        let mut snapshots = Vec::with_capacity(areas.len());
        let mut listing_calls = 0;
        let mut last_source_failure = None;

        for area in areas {
            let scanned = scan_area(area, layout, &wanted, &days, &mut listing_calls).await;
            let (entries, unavailable) = match scanned {
                Ok(entries) => {
                    info!(area = %area.name, slots_present = entries.len(), "Inventory built");
                    (entries, None)
                }
                Err(e) if area.is_output() => return Err(e.into()),
                Err(e) => {
                    warn!(area = %area.name, error = %e, "Source area unavailable; continuing without it");
                    let reason = e.to_string();
                    last_source_failure = Some(e);
                    (HashMap::new(), Some(reason))
                }
            };
            snapshots.push(AreaSnapshot {
                name: area.name.clone(),
                role: area.role,
                entries,
                unavailable,
            });
        }

        let any_source_usable = snapshots
            .iter()
            .any(|a| a.role == AreaRole::Source && a.unavailable.is_none());
        if let Some(e) = last_source_failure {
            if !any_source_usable {
                return Err(e.into());
            }
        }

        Ok(Self {
            areas: snapshots,
            listing_calls,
        })
    }

    /// Number of backend listing calls made during construction.
    #[must_use]
    pub fn listing_calls(&self) -> usize {
        self.listing_calls
    }

    /// Names of the areas that answered, in configuration order.
    #[must_use]
    pub fn area_names(&self) -> Vec<&str> {
        self.areas
            .iter()
            .filter(|a| a.unavailable.is_none())
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Source areas skipped because storage failed.
    #[must_use]
    pub fn unavailable_areas(&self) -> Vec<UnavailableArea> {
        self.areas
            .iter()
            .filter_map(|a| {
                a.unavailable.as_ref().map(|reason| UnavailableArea {
                    area: a.name.clone(),
                    reason: reason.clone(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn entry<'a>(&'a self, area: &str, slot_key: &str) -> Option<&'a SlotInventoryEntry> {
        self.areas
            .iter()
            .find(|a| a.name == area)
            .and_then(|a| a.entries.get(slot_key))
    }

    /// Every area's entry for a slot, in area order.
    pub fn entries_for<'a>(&'a self, slot_key: &'a str) -> impl Iterator<Item = &'a SlotInventoryEntry> + 'a {
        self.areas.iter().filter_map(move |a| a.entries.get(slot_key))
    }

    /// Entries for a slot in areas with the given role.
    pub fn entries_with_role<'a>(
        &'a self,
        slot_key: &'a str,
        role: AreaRole,
    ) -> impl Iterator<Item = &'a SlotInventoryEntry> + 'a {
        self.areas
            .iter()
            .filter(move |a| a.role == role)
            .filter_map(move |a| a.entries.get(slot_key))
    }

    #[must_use]
    pub fn output_entry<'a>(&'a self, slot_key: &str) -> Option<&'a SlotInventoryEntry> {
        self.areas
            .iter()
            .filter(|a| a.role == AreaRole::Output)
            .find_map(|a| a.entries.get(slot_key))
    }

    /// Union of identifiers held for a slot across all areas.
    #[must_use]
    pub fn known_ids<'a>(&'a self, slot_key: &str) -> HashSet<&'a str> {
        self.areas
            .iter()
            .filter_map(|a| a.entries.get(slot_key))
            .flat_map(|e| e.ids.iter().map(String::as_str))
            .collect()
    }

    /// Greatest identifier any area holds for a slot.
    ///
    /// Aids sort in creation order, so for an archived slot this is its
    /// newest record.
    #[must_use]
    pub fn newest_id<'a>(&'a self, slot_key: &str) -> Option<&'a str> {
        self.areas
            .iter()
            .filter_map(|a| a.entries.get(slot_key))
            .filter_map(|e| e.ids.last())
            .max()
            .map(String::as_str)
    }
}

/// List and read one area's artifacts for the wanted slots.
async fn scan_area(
    area: &StorageArea,
    layout: &SlotLayout,
    wanted: &HashSet<String>,
    days: &BTreeSet<NaiveDate>,
    listing_calls: &mut usize,
) -> std::result::Result<HashMap<String, SlotInventoryEntry>, StorageError> {
    let mut entries = HashMap::new();
    for day in days {
        let prefix = layout.day_prefix(&area.prefix, *day);
        *listing_calls += 1;
        let listed = area
            .backend
            .list(&prefix)
            .await
            .map_err(|e| area.unavailable(e))?;
        debug!(area = %area.name, prefix = %prefix, objects = listed.len(), "Listed day");

        for object in listed {
            let Some(slot_key) = layout.slot_key_of_object(&object.key) else {
                continue;
            };
            if !wanted.contains(&slot_key) {
                continue;
            }
            let bytes = area
                .backend
                .get(&object.key)
                .await
                .map_err(|e| area.unavailable(e))?;
            let entry = SlotInventoryEntry::from_bytes(area, &slot_key, &object.key, object.size, &bytes);
            entries.insert(slot_key, entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::record::render_artifact;
    use crate::slot::enumerate_slots;
    use crate::storage::MemoryStorage;
    use chrono::TimeDelta;
    use std::sync::Arc;

    fn layout() -> SlotLayout {
        SlotLayout::new(540, "jsonl").unwrap()
    }

    fn slots(layout: &SlotLayout, from: &str, to: &str) -> Vec<Slot> {
        enumerate_slots(
            layout.parse_slot_key(from).unwrap(),
            layout.parse_slot_key(to).unwrap(),
            TimeDelta::minutes(10),
        )
        .unwrap()
    }

    fn artifact(slot: &Slot, n: usize) -> Vec<u8> {
        let records: Vec<Record> = (0..n)
            .map(|i| {
                Record::synthetic(
                    format!("id{i:05}"),
                    slot.start + TimeDelta::seconds(i as i64 % 600),
                    "x",
                )
            })
            .collect();
        render_artifact(&records).unwrap()
    }

    #[tokio::test]
    async fn one_listing_per_day_per_area() {
        let layout = layout();
        let slots = slots(&layout, "2025-08-01_23-40", "2025-08-02_00-20");
        let primary = Arc::new(MemoryStorage::new());
        let output = Arc::new(MemoryStorage::new());
        primary.insert(layout.object_key("", &slots[0]), artifact(&slots[0], 3));
        let areas = vec![
            StorageArea::new("data", "", AreaRole::Source, primary.clone()),
            StorageArea::new("data_complement", "", AreaRole::Output, output.clone()),
        ];

        let inventory = Inventory::build(&areas, &layout, &slots).await.unwrap();
        assert_eq!(inventory.listing_calls(), 4);
        assert_eq!(primary.list_calls(), 2);
        assert_eq!(output.list_calls(), 2);

        let key = layout.slot_key(&slots[0]);
        let entry = inventory.entry("data", &key).unwrap();
        assert_eq!(entry.record_count, 3);
        assert!(entry.records.is_empty());
        assert!(inventory.entry("data_complement", &key).is_none());

        // Lookups are memory-only.
        let before = primary.get_calls();
        let _ = inventory.known_ids(&key);
        assert_eq!(primary.get_calls(), before);
    }

    #[tokio::test]
    async fn error_only_artifact_flagged() {
        let layout = layout();
        let slots = slots(&layout, "2025-08-01_00-40", "2025-08-01_00-40");
        let storage = Arc::new(MemoryStorage::new());
        storage.insert(
            layout.object_key("", &slots[0]),
            "{\"error\":{\"code\":\"RATE_LIMIT_EXCEEDED\"}}\n".repeat(5),
        );
        let areas = vec![StorageArea::new("data", "", AreaRole::Source, storage)];
        let inventory = Inventory::build(&areas, &layout, &slots).await.unwrap();
        let entry = inventory.entry("data", &layout.slot_key(&slots[0])).unwrap();
        assert!(entry.is_error_only);
        assert_eq!(entry.line_count, 5);
        assert_eq!(entry.record_count, 0);
    }

    #[tokio::test]
    async fn output_records_are_retained() {
        let layout = layout();
        let slots = slots(&layout, "2025-08-01_00-40", "2025-08-01_00-40");
        let storage = Arc::new(MemoryStorage::new());
        storage.insert(layout.object_key("out", &slots[0]), artifact(&slots[0], 2));
        let areas = vec![StorageArea::new("out", "out", AreaRole::Output, storage)];
        let inventory = Inventory::build(&areas, &layout, &slots).await.unwrap();
        let key = layout.slot_key(&slots[0]);
        let entry = inventory.output_entry(&key).unwrap();
        assert_eq!(entry.records.len(), 2);
        assert!(entry.object_key.starts_with("out/"));
    }

    #[tokio::test]
    async fn listing_failure_is_unavailable() {
        let layout = layout();
        let slots = slots(&layout, "2025-08-01_00-40", "2025-08-01_00-40");
        let storage = Arc::new(MemoryStorage::new());
        storage.set_fail_list(true);
        let areas = vec![StorageArea::new("data", "", AreaRole::Source, storage)];
        let err = Inventory::build(&areas, &layout, &slots).await.unwrap_err();
        match err {
            Error::Storage(crate::error::StorageError::Unavailable { area, .. }) => {
                assert_eq!(area, "data");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failing_redundant_source_is_marked_unavailable() {
        let layout = layout();
        let slots = slots(&layout, "2025-08-01_00-40", "2025-08-01_00-40");
        let primary = Arc::new(MemoryStorage::new());
        primary.insert(layout.object_key("", &slots[0]), artifact(&slots[0], 3));
        let backup = Arc::new(MemoryStorage::new());
        backup.set_fail_list(true);
        let areas = vec![
            StorageArea::new("data", "", AreaRole::Source, primary),
            StorageArea::new("backup", "", AreaRole::Source, backup),
            StorageArea::new("out", "out", AreaRole::Output, Arc::new(MemoryStorage::new())),
        ];
        let inventory = Inventory::build(&areas, &layout, &slots).await.unwrap();
        assert_eq!(inventory.area_names(), vec!["data", "out"]);
        let unavailable = inventory.unavailable_areas();
        assert_eq!(unavailable.len(), 1);
        assert_eq!(unavailable[0].area, "backup");
        let key = layout.slot_key(&slots[0]);
        assert_eq!(inventory.known_ids(&key).len(), 3);
        assert!(inventory.entry("backup", &key).is_none());
    }

    #[tokio::test]
    async fn failing_output_area_aborts() {
        let layout = layout();
        let slots = slots(&layout, "2025-08-01_00-40", "2025-08-01_00-40");
        let output = Arc::new(MemoryStorage::new());
        output.set_fail_list(true);
        let areas = vec![
            StorageArea::new("data", "", AreaRole::Source, Arc::new(MemoryStorage::new())),
            StorageArea::new("out", "out", AreaRole::Output, output),
        ];
        let err = Inventory::build(&areas, &layout, &slots).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Storage(StorageError::Unavailable { ref area, .. }) if area == "out"
        ));
    }

    #[tokio::test]
    async fn newest_id_spans_areas() {
        let layout = layout();
        let slots = slots(&layout, "2025-08-01_00-40", "2025-08-01_00-40");
        let primary = Arc::new(MemoryStorage::new());
        let output = Arc::new(MemoryStorage::new());
        primary.insert(layout.object_key("", &slots[0]), artifact(&slots[0], 3));
        output.insert(layout.object_key("out", &slots[0]), artifact(&slots[0], 5));
        let areas = vec![
            StorageArea::new("data", "", AreaRole::Source, primary),
            StorageArea::new("out", "out", AreaRole::Output, output),
        ];
        let inventory = Inventory::build(&areas, &layout, &slots).await.unwrap();
        let key = layout.slot_key(&slots[0]);
        assert_eq!(inventory.newest_id(&key), Some("id00004"));
        assert_eq!(inventory.newest_id("2025-08-01_00-50"), None);
    }

    #[tokio::test]
    async fn objects_outside_range_ignored() {
        let layout = layout();
        let all = slots(&layout, "2025-08-01_00-00", "2025-08-01_00-50");
        let storage = Arc::new(MemoryStorage::new());
        for slot in &all {
            storage.insert(layout.object_key("", slot), artifact(slot, 1));
        }
        let areas = vec![StorageArea::new("data", "", AreaRole::Source, storage.clone())];
        let inventory = Inventory::build(&areas, &layout, &all[2..3]).await.unwrap();
        assert_eq!(storage.get_calls(), 1);
        assert!(inventory.entry("data", &layout.slot_key(&all[0])).is_none());
    }
}
