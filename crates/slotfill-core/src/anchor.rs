//! Pagination anchors.
//!
//! Search mode bounds queries by Misskey "aid" identifiers: eight base-36
//! digits of milliseconds since 2000-01-01T00:00:00Z followed by a two
//! character suffix. Identifiers of equal length sort lexicographically in
//! time order, which is what lets the paginator synthesize anchors from slot
//! boundaries. Timeline mode bounds queries by timestamps instead.

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};

use crate::config::FetchMode;
use crate::record::Record;

/// 2000-01-01T00:00:00Z in Unix milliseconds.
const AID_EPOCH_MS: i64 = 946_684_800_000;
const AID_TIME_LEN: usize = 8;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// One side of a query window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anchor {
    Id(String),
    Time(DateTime<Utc>),
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => f.write_str(id),
            Self::Time(ts) => write!(f, "{}", ts.timestamp_millis()),
        }
    }
}

/// How anchors are derived for a fetch mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorScheme {
    Aid,
    Timestamp,
}

impl From<FetchMode> for AnchorScheme {
    fn from(mode: FetchMode) -> Self {
        match mode {
            FetchMode::Search => Self::Aid,
            FetchMode::Timeline => Self::Timestamp,
        }
    }
}

impl AnchorScheme {
    /// Exclusive lower bound admitting every record created at or after `t`.
    #[must_use]
    pub fn floor(self, t: DateTime<Utc>) -> Anchor {
        let before = t - TimeDelta::milliseconds(1);
        match self {
            Self::Aid => Anchor::Id(format!("{}zz", encode_aid_time(before))),
            Self::Timestamp => Anchor::Time(before),
        }
    }

    /// Exclusive upper bound admitting every record created before `t`.
    #[must_use]
    pub fn ceiling(self, t: DateTime<Utc>) -> Anchor {
        match self {
            Self::Aid => Anchor::Id(format!("{}00", encode_aid_time(t))),
            Self::Timestamp => Anchor::Time(t),
        }
    }

    /// Anchor that excludes `record` and everything newer.
    #[must_use]
    pub fn of_record(self, record: &Record) -> Anchor {
        match self {
            Self::Aid => Anchor::Id(record.id.clone()),
            Self::Timestamp => Anchor::Time(record.created_at),
        }
    }
}

/// The eight-character time component of an aid.
#[must_use]
pub fn encode_aid_time(t: DateTime<Utc>) -> String {
    let mut value = u64::try_from(t.timestamp_millis() - AID_EPOCH_MS).unwrap_or(0);
    let mut digits = [b'0'; AID_TIME_LEN];
    for slot in digits.iter_mut().rev() {
        *slot = BASE36[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8_lossy(&digits).into_owned()
}

/// Creation time encoded in an aid, if it is one.
#[must_use]
pub fn decode_aid_time(id: &str) -> Option<DateTime<Utc>> {
    let time_part = id.get(..AID_TIME_LEN)?;
    let mut value: i64 = 0;
    for ch in time_part.chars() {
        let digit = ch.to_digit(36)?;
        value = value.checked_mul(36)?.checked_add(i64::from(digit))?;
    }
    DateTime::from_timestamp_millis(value + AID_EPOCH_MS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, h, m, s).unwrap()
    }

    #[test]
    fn aid_time_round_trips() {
        let ts = t(0, 40, 10) + TimeDelta::milliseconds(123);
        let encoded = encode_aid_time(ts);
        assert_eq!(encoded.len(), 8);
        assert_eq!(decode_aid_time(&format!("{encoded}ab")), Some(ts));
    }

    #[test]
    fn aid_epoch_is_all_zeros() {
        let epoch = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(encode_aid_time(epoch), "00000000");
        assert_eq!(encode_aid_time(epoch - TimeDelta::days(1)), "00000000");
    }

    #[test]
    fn aid_order_follows_time() {
        let a = encode_aid_time(t(0, 40, 0));
        let b = encode_aid_time(t(0, 40, 1));
        let c = encode_aid_time(t(23, 0, 0));
        assert!(a < b && b < c);
    }

    #[test]
    fn floor_and_ceiling_bracket_the_window() {
        let scheme = AnchorScheme::Aid;
        let start = t(0, 40, 0);
        let end = t(0, 50, 0);
        let (Anchor::Id(floor), Anchor::Id(ceiling)) = (scheme.floor(start), scheme.ceiling(end))
        else {
            panic!("aid scheme must produce id anchors");
        };
        let first = format!("{}00", encode_aid_time(start));
        let last = format!("{}zz", encode_aid_time(end - TimeDelta::milliseconds(1)));
        let next = format!("{}00", encode_aid_time(end));
        assert!(floor < first);
        assert!(last < ceiling);
        assert!(next >= ceiling);
    }

    #[test]
    fn timestamp_scheme_uses_times() {
        let scheme = AnchorScheme::from(FetchMode::Timeline);
        assert_eq!(scheme.ceiling(t(1, 0, 0)), Anchor::Time(t(1, 0, 0)));
        let record = Record::synthetic("x", t(0, 45, 0), "");
        assert_eq!(scheme.of_record(&record), Anchor::Time(t(0, 45, 0)));
        assert_eq!(AnchorScheme::Aid.of_record(&record), Anchor::Id("x".into()));
    }
}
