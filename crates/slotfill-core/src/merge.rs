//! Merge fetched records into the slot's output artifact.
//!
//! The identifier is the only dedup key. A fetched record is dropped when
//! any area already holds its id, so the output only ever gains records the
//! archive lacks. Existing output content is kept unless overwrite is on.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::AreaRole;
use crate::error::{Error, Result, StorageError};
use crate::inventory::Inventory;
use crate::language::is_japanese_record;
use crate::record::{Record, render_artifact};
use crate::slot::{Slot, SlotLayout};
use crate::storage::{Metadata, StorageArea};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOptions {
    /// Replace the existing output artifact instead of extending it.
    pub overwrite: bool,
    pub keep_non_japanese: bool,
}

/// What happened to the output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Written,
    /// Nothing new to add; the artifact was left untouched.
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub object_key: String,
    /// Records carried over from the existing output artifact.
    pub existing: usize,
    pub fetched: usize,
    /// Fetched records not present anywhere before.
    pub new_records: usize,
    pub skipped_known: usize,
    pub skipped_language: usize,
    /// Records in the artifact after the merge.
    pub total: usize,
    pub outcome: WriteOutcome,
}

/// Merge `fetched` into `output` for one slot.
///
/// Any write failure comes back as
/// [`StorageError::Persistence`](crate::error::StorageError::Persistence)
/// for this slot only.
pub async fn merge_slot(
    output: &StorageArea,
    layout: &SlotLayout,
    inventory: &Inventory,
    slot: &Slot,
    fetched: Vec<Record>,
    options: MergeOptions,
) -> Result<MergeResult> {
    let slot_key = layout.slot_key(slot);
    let object_key = layout.object_key(&output.prefix, slot);

    // Existing output, deduplicated by id.
    let mut ids: HashSet<String> = HashSet::new();
    let mut merged: Vec<Record> = Vec::new();
    if !options.overwrite {
        if let Some(entry) = inventory.output_entry(&slot_key) {
            for record in &entry.records {
                if ids.insert(record.id.clone()) {
                    merged.push(record.clone());
                }
            }
        }
    }
    let existing = merged.len();

    let source_ids: HashSet<&str> = inventory
        .entries_with_role(&slot_key, AreaRole::Source)
        .flat_map(|e| e.ids.iter().map(String::as_str))
        .collect();

    let fetched_count = fetched.len();
    let mut skipped_known = 0;
    let mut skipped_language = 0;
    for record in fetched {
        if !options.keep_non_japanese && !is_japanese_record(&record) {
            skipped_language += 1;
            continue;
        }
        if source_ids.contains(record.id.as_str()) || !ids.insert(record.id.clone()) {
            skipped_known += 1;
            continue;
        }
        merged.push(record);
    }
    let new_records = merged.len() - existing;

    let mut result = MergeResult {
        object_key: object_key.clone(),
        existing,
        fetched: fetched_count,
        new_records,
        skipped_known,
        skipped_language,
        total: merged.len(),
        outcome: WriteOutcome::Unchanged,
    };

    // Overwrite never replaces content with an empty artifact.
    if new_records == 0 {
        debug!(slot = %slot_key, fetched = fetched_count, "Nothing new to write");
        return Ok(result);
    }
    merged.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    let bytes = render_artifact(&merged)?;
    let mut metadata = Metadata::new();
    metadata.insert("content-type".into(), "application/x-ndjson".into());
    metadata.insert("slot".into(), slot_key.clone());
    metadata.insert("records".into(), merged.len().to_string());

    output
        .backend
        .put(&object_key, &bytes, &metadata)
        .await
        .map_err(|e| match e {
            Error::Storage(StorageError::Persistence { .. }) => e,
            other => Error::Storage(StorageError::Persistence {
                key: object_key.clone(),
                reason: other.to_string(),
            }),
        })?;

    result.outcome = WriteOutcome::Written;
    info!(
        slot = %slot_key,
        area = %output.name,
        key = %object_key,
        new_records,
        total = result.total,
        "Slot written"
    );
    Ok(result)
}
