//! Fixed-width time slots and the keys that address them.
//!
//! A run enumerates slots once from `(range_start, range_end, width)`. Each
//! slot's storage key is derived from its start time rendered in the
//! archive's fixed UTC offset:
//!
//! ```text
//! slot key     2025-08-01_00-40
//! object key   {prefix}/2025/08/01/00/2025-08-01_00-40.jsonl
//! day prefix   {prefix}/2025/08/01/
//! ```

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SlotsConfig;
use crate::error::{Error, Result};

const SLOT_KEY_FORMAT: &str = "%Y-%m-%d_%H-%M";

/// One fixed time window `[start, start + width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub start: DateTime<Utc>,
    #[serde(rename = "width_secs", with = "width_secs")]
    pub width: TimeDelta,
}

mod width_secs {
    use chrono::TimeDelta;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(width: &TimeDelta, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(width.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TimeDelta, D::Error> {
        let secs = i64::deserialize(d)?;
        TimeDelta::try_seconds(secs).ok_or_else(|| serde::de::Error::custom("slot width out of range"))
    }
}

impl Slot {
    #[must_use]
    pub fn new(start: DateTime<Utc>, width: TimeDelta) -> Self {
        Self { start, width }
    }

    /// Exclusive end of the window.
    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.width
    }

    /// The slot of the same width ending where this one starts.
    #[must_use]
    pub fn previous(&self) -> Self {
        Self::new(self.start - self.width, self.width)
    }

    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end()
    }

    /// Split the slot into consecutive windows of at most `step`.
    ///
    /// The last window is clipped to the slot end.
    pub fn sub_windows(&self, step: TimeDelta) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        if step <= TimeDelta::zero() {
            return Err(Error::InvalidRange("sub-slot step must be positive".into()));
        }
        let end = self.end();
        let mut windows = Vec::new();
        let mut current = self.start;
        while current < end {
            let next = (current + step).min(end);
            windows.push((current, next));
            current = next;
        }
        Ok(windows)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end().to_rfc3339())
    }
}

/// Enumerate the slots tiling `[range_start, range_end]`.
///
/// The first slot starts at `range_start`; slots step by `width` while their
/// start is `<= range_end`, so the last slot covers `range_end`.
pub fn enumerate_slots(
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    width: TimeDelta,
) -> Result<Vec<Slot>> {
    if range_end < range_start {
        return Err(Error::InvalidRange(format!(
            "end {range_end} is before start {range_start}"
        )));
    }
    if width <= TimeDelta::zero() {
        return Err(Error::InvalidRange("slot width must be positive".into()));
    }
    // Keys have minute resolution; sub-minute or ragged widths would collide.
    if width.num_seconds() % 60 != 0 || width.subsec_nanos() != 0 {
        return Err(Error::InvalidRange(
            "slot width must be a whole number of minutes".into(),
        ));
    }

    let mut slots = Vec::new();
    let mut current = range_start;
    while current <= range_end {
        slots.push(Slot::new(current, width));
        current += width;
    }
    Ok(slots)
}

/// How slots map onto storage keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotLayout {
    offset: FixedOffset,
    extension: String,
}

impl SlotLayout {
    /// Layout from the `[slots]` config section.
    pub fn from_config(config: &SlotsConfig) -> Result<Self> {
        Self::new(config.utc_offset_minutes, config.file_extension.clone())
    }

    pub fn new(utc_offset_minutes: i32, extension: impl Into<String>) -> Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
            Error::InvalidRange(format!("utc offset {utc_offset_minutes}m out of range"))
        })?;
        Ok(Self {
            offset,
            extension: extension.into().trim_start_matches('.').to_string(),
        })
    }

    #[must_use]
    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    #[must_use]
    pub fn extension(&self) -> &str {
        &self.extension
    }

    /// Injective, lexicographically time-sortable key for a slot.
    #[must_use]
    pub fn slot_key(&self, slot: &Slot) -> String {
        self.key_for(slot.start)
    }

    fn key_for(&self, ts: DateTime<Utc>) -> String {
        ts.with_timezone(&self.offset).format(SLOT_KEY_FORMAT).to_string()
    }

    /// Start time encoded in a slot key.
    pub fn parse_slot_key(&self, key: &str) -> Result<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(key, SLOT_KEY_FORMAT)
            .map_err(|e| Error::InvalidRange(format!("bad slot key '{key}': {e}")))?;
        self.from_local(naive)
    }

    /// Interpret a wall-clock time in the archive offset.
    pub fn from_local(&self, naive: NaiveDateTime) -> Result<DateTime<Utc>> {
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .ok_or_else(|| Error::InvalidRange(format!("ambiguous local time {naive}")))
    }

    /// Calendar day of a slot in the archive offset.
    #[must_use]
    pub fn local_day(&self, slot: &Slot) -> NaiveDate {
        slot.start.with_timezone(&self.offset).date_naive()
    }

    /// Listing prefix for one calendar day, always ending in `/`.
    #[must_use]
    pub fn day_prefix(&self, prefix: &str, day: NaiveDate) -> String {
        join_prefix(prefix, &day.format("%Y/%m/%d/").to_string())
    }

    /// Full object key of a slot artifact.
    #[must_use]
    pub fn object_key(&self, prefix: &str, slot: &Slot) -> String {
        let local = slot.start.with_timezone(&self.offset);
        let relative = format!(
            "{}/{}.{}",
            local.format("%Y/%m/%d/%H"),
            self.slot_key(slot),
            self.extension
        );
        join_prefix(prefix, &relative)
    }

    /// Slot key of an object key, if the object looks like a slot artifact.
    #[must_use]
    pub fn slot_key_of_object(&self, object_key: &str) -> Option<String> {
        let file_name = object_key.rsplit('/').next()?;
        let stem = file_name.strip_suffix(&format!(".{}", self.extension))?;
        NaiveDateTime::parse_from_str(stem, SLOT_KEY_FORMAT).ok()?;
        Some(stem.to_string())
    }

    /// Key of the `width`-aligned slot containing `ts`.
    ///
    /// Alignment is on the local wall clock, so 00:47 with a 10 minute width
    /// lands in the 00:40 slot.
    #[must_use]
    pub fn containing_slot_key(&self, ts: DateTime<Utc>, width: TimeDelta) -> String {
        let local = ts.with_timezone(&self.offset);
        let width_minutes = width.num_minutes().max(1);
        let minute_of_day = i64::from(local.hour()) * 60 + i64::from(local.minute());
        let aligned = minute_of_day - minute_of_day % width_minutes;
        let floored = local.date_naive().and_hms_opt(
            (aligned / 60) as u32,
            (aligned % 60) as u32,
            0,
        );
        match floored {
            Some(naive) => naive.format(SLOT_KEY_FORMAT).to_string(),
            None => self.key_for(ts),
        }
    }

    /// Distinct local calendar days touched by `slots`, in order.
    #[must_use]
    pub fn days_covering(&self, slots: &[Slot]) -> BTreeSet<NaiveDate> {
        slots.iter().map(|s| self.local_day(s)).collect()
    }
}

fn join_prefix(prefix: &str, relative: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}
