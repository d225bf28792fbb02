//! Backward pagination over one slot.
//!
//! The upstream API answers `(since, until, limit)` with the newest `limit`
//! records inside the window. Re-asking the same window returns the same
//! tail, so the walk moves `until` back to the oldest record of every page
//! until the start of the window is reached:
//!
//! ```text
//!   slot_start                                        slot_end
//!       |<----------------------- window ---------------->|
//!       |                              [ page 1 .........]| until = ceiling(end)
//!       |                [ page 2 ....]                   | until = oldest(page 1)
//!       |   [ page 3 ...]                                 | until = oldest(page 2)
//!       ^ stop once the oldest kept record is <= start + early_coverage
//! ```
//!
//! `since` stays fixed for the whole walk: the window floor, or for the
//! first window the newest identifier already archived for the previous
//! slot. Windows from sub-slot partitioning each run their own walk and
//! share one `seen_ids` set.
//!
//! Pages shorter than `limit` are normal mid-window (visibility filtering
//! happens after the limit is applied), so only an empty page ends a walk
//! as exhausted.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::anchor::{Anchor, AnchorScheme, decode_aid_time};
use crate::config::FetchConfig;
use crate::error::{Error, Result};
use crate::record::Record;
use crate::retry::{RetryPolicy, with_retry_outcome};
use crate::search::{PageQuery, SearchApi};
use crate::slot::Slot;
use crate::token_bucket::RateGate;

/// Run-wide stop signal: an interrupt flag plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Shutdown {
    #[must_use]
    pub fn new(flag: Arc<AtomicBool>, deadline: Option<Instant>) -> Self {
        Self { flag, deadline }
    }

    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether new requests must not be issued.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

/// Why a window's walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Oldest kept record is within the early-coverage buffer of the start.
    EarlyCoverage,
    /// Empty page, or the walk went past the window start.
    Exhausted,
    /// Page budget spent before reaching the start.
    MaxPages,
    /// The next anchor equals the current one.
    NoProgress,
    Cancelled,
}

impl StopReason {
    /// Stops that leave the window short of its start.
    #[must_use]
    pub fn is_partial(self) -> bool {
        matches!(self, Self::MaxPages | Self::Cancelled)
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EarlyCoverage => "early_coverage",
            Self::Exhausted => "exhausted",
            Self::MaxPages => "max_pages",
            Self::NoProgress => "no_progress",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Non-fatal: a window stopped before reaching its start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteCoverageWarning {
    pub window_start: DateTime<Utc>,
    pub oldest_collected: Option<DateTime<Utc>>,
    pub pages: u32,
    pub reason: StopReason,
}

impl fmt::Display for IncompleteCoverageWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.oldest_collected {
            Some(oldest) => write!(
                f,
                "window from {} stopped ({}) after {} pages; oldest record {}",
                self.window_start, self.reason, self.pages, oldest
            ),
            None => write!(
                f,
                "window from {} stopped ({}) after {} pages with no records",
                self.window_start, self.reason, self.pages
            ),
        }
    }
}

/// Per-window walk summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowFetch {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub pages: u32,
    pub added: usize,
    pub oldest_collected: Option<DateTime<Utc>>,
    pub stop: StopReason,
}

/// Everything fetched for one slot.
#[derive(Debug, Clone)]
pub struct SlotFetch {
    /// Deduplicated in-window records, oldest first.
    pub records: Vec<Record>,
    pub windows: Vec<WindowFetch>,
    pub warnings: Vec<IncompleteCoverageWarning>,
    /// Previous-slot identifier used as the lower anchor, if any.
    pub since_boundary: Option<String>,
}

impl SlotFetch {
    #[must_use]
    pub fn pages(&self) -> u32 {
        self.windows.iter().map(|w| w.pages).sum()
    }

    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.windows.iter().any(|w| w.stop == StopReason::Cancelled)
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Stop reason of the first window; the one that must reach the slot start.
    #[must_use]
    pub fn stop(&self) -> Option<StopReason> {
        self.windows.first().map(|w| w.stop)
    }
}

/// Knobs for one walk.
#[derive(Debug, Clone)]
pub struct PaginatorSettings {
    pub scheme: AnchorScheme,
    pub limit: u32,
    pub max_pages: u32,
    pub page_delay: Duration,
    pub early_coverage: TimeDelta,
    pub sub_slot: Option<TimeDelta>,
    pub text: Option<String>,
    pub host: Option<String>,
    /// Replaces the synthesized lower anchor of every window.
    pub since_override: Option<String>,
    /// Replaces the synthesized upper anchor of every window's first page.
    pub until_override: Option<String>,
}

impl Default for PaginatorSettings {
    fn default() -> Self {
        Self::from_config(&FetchConfig::default())
    }
}

impl PaginatorSettings {
    #[must_use]
    pub fn from_config(config: &FetchConfig) -> Self {
        Self {
            scheme: AnchorScheme::from(config.mode),
            limit: config.limit,
            max_pages: config.max_pages,
            page_delay: Duration::from_millis(config.page_delay_ms),
            early_coverage: TimeDelta::seconds(i64::from(config.early_coverage_seconds)),
            sub_slot: config
                .sub_slot_seconds
                .map(|s| TimeDelta::seconds(i64::from(s))),
            text: config.query.clone(),
            host: config.host.clone(),
            since_override: config.since_id.clone(),
            until_override: config.until_id.clone(),
        }
    }

    /// Lower anchor: explicit override, then a previous-slot boundary, then
    /// the synthesized floor. Identifier anchors only apply to the aid scheme.
    fn since_for(&self, window_start: DateTime<Utc>, boundary: Option<&str>) -> Anchor {
        if self.scheme != AnchorScheme::Aid {
            return self.scheme.floor(window_start);
        }
        match (&self.since_override, boundary) {
            (Some(id), _) => Anchor::Id(id.clone()),
            (None, Some(id)) => Anchor::Id(id.to_string()),
            (None, None) => self.scheme.floor(window_start),
        }
    }

    fn until_for(&self, window_end: DateTime<Utc>) -> Anchor {
        match (&self.until_override, self.scheme) {
            (Some(id), AnchorScheme::Aid) => Anchor::Id(id.clone()),
            _ => self.scheme.ceiling(window_end),
        }
    }
}

/// Walks slots backward against a search backend.
///
/// Holds only shared, read-only collaborators; per-slot state lives in
/// [`Paginator::fetch_slot`].
pub struct Paginator {
    api: Arc<dyn SearchApi>,
    gate: Arc<RateGate>,
    retry: RetryPolicy,
    settings: PaginatorSettings,
    shutdown: Shutdown,
}

impl fmt::Debug for Paginator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Paginator")
            .field("settings", &self.settings)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Paginator {
    #[must_use]
    pub fn new(
        api: Arc<dyn SearchApi>,
        gate: Arc<RateGate>,
        retry: RetryPolicy,
        settings: PaginatorSettings,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            api,
            gate,
            retry,
            settings,
            shutdown,
        }
    }

    #[must_use]
    pub fn settings(&self) -> &PaginatorSettings {
        &self.settings
    }

    fn windows(&self, slot: &Slot) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
        match self.settings.sub_slot {
            Some(step) if step < slot.width => slot.sub_windows(step),
            _ => Ok(vec![(slot.start, slot.end())]),
        }
    }

    /// Fetch one slot.
    ///
    /// A request that still fails after the retry budget fails the whole
    /// slot. Cancellation is not an error: the walk stops and whatever was
    /// collected is returned.
    pub async fn fetch_slot(&self, slot: &Slot, slot_key: &str) -> Result<SlotFetch> {
        self.fetch_slot_after(slot, slot_key, None).await
    }

    /// Fetch one slot, bounding the first window below by `boundary`, the
    /// newest identifier archived for the preceding slot.
    ///
    /// A boundary that does not decode to a time before the slot start is
    /// ignored and the synthesized floor is used.
    pub async fn fetch_slot_after(
        &self,
        slot: &Slot,
        slot_key: &str,
        boundary: Option<&str>,
    ) -> Result<SlotFetch> {
        let boundary = boundary.filter(|id| {
            self.settings.scheme == AnchorScheme::Aid
                && self.settings.since_override.is_none()
                && decode_aid_time(id).is_some_and(|t| t < slot.start)
        });
        if let Some(id) = boundary {
            debug!(slot = %slot_key, boundary = %id, "Using previous-slot boundary as since anchor");
        }

        let mut seen_ids = HashSet::new();
        let mut records = Vec::new();
        let mut windows = Vec::new();
        let mut warnings = Vec::new();

        for (start, end) in self.windows(slot)? {
            let since = self
                .settings
                .since_for(start, boundary.filter(|_| start == slot.start));
            let window = self
                .walk_window(slot_key, since, start, end, &mut seen_ids, &mut records)
                .await?;
            if window.stop.is_partial() {
                let warning = IncompleteCoverageWarning {
                    window_start: start,
                    oldest_collected: window.oldest_collected,
                    pages: window.pages,
                    reason: window.stop,
                };
                warn!(slot = %slot_key, warning = %warning, "Incomplete coverage");
                warnings.push(warning);
            }
            let stop = window.stop;
            windows.push(window);
            if stop == StopReason::Cancelled {
                break;
            }
        }

        records.sort_by(|a: &Record, b: &Record| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        });
        info!(
            slot = %slot_key,
            records = records.len(),
            windows = windows.len(),
            pages = windows.iter().map(|w| w.pages).sum::<u32>(),
            "Slot fetched"
        );
        Ok(SlotFetch {
            records,
            windows,
            warnings,
            since_boundary: boundary.map(str::to_string),
        })
    }

    async fn walk_window(
        &self,
        slot_key: &str,
        since: Anchor,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        seen_ids: &mut HashSet<String>,
        records: &mut Vec<Record>,
    ) -> Result<WindowFetch> {
        let settings = &self.settings;
        let early_threshold = start + settings.early_coverage;
        let mut query = PageQuery {
            since,
            until: settings.until_for(end),
            text: settings.text.clone(),
            host: settings.host.clone(),
            limit: settings.limit,
        };
        let mut pages = 0u32;
        let mut added = 0usize;
        let mut oldest_collected: Option<DateTime<Utc>> = None;

        let stop = loop {
            if self.shutdown.is_triggered() {
                break StopReason::Cancelled;
            }

            let api = &self.api;
            let gate = &self.gate;
            let shutdown = &self.shutdown;
            let current = &query;
            let outcome = with_retry_outcome(&self.retry, || async move {
                if shutdown.is_triggered() {
                    return Err(Error::Cancelled("shutdown during retry backoff".into()));
                }
                gate.acquire().await;
                api.fetch_page(current).await
            })
            .await;
            let page = match outcome.result {
                Ok(page) => page,
                Err(Error::Cancelled(reason)) => {
                    debug!(slot = %slot_key, reason = %reason, "Walk interrupted");
                    break StopReason::Cancelled;
                }
                Err(e) => return Err(e),
            };
            pages += 1;

            let Some(page_oldest) = page
                .iter()
                .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
                .cloned()
            else {
                debug!(slot = %slot_key, page = pages, until_anchor = %query.until, "Empty page");
                break StopReason::Exhausted;
            };

            let returned = page.len();
            let mut page_added = 0usize;
            for record in page {
                if record.created_at < start || record.created_at >= end {
                    continue;
                }
                if !seen_ids.insert(record.id.clone()) {
                    continue;
                }
                oldest_collected = Some(
                    oldest_collected.map_or(record.created_at, |o| o.min(record.created_at)),
                );
                records.push(record);
                page_added += 1;
            }
            added += page_added;
            debug!(
                slot = %slot_key,
                page = pages,
                until_anchor = %query.until,
                returned,
                added = page_added,
                oldest = %page_oldest.created_at,
                "Page fetched"
            );

            if oldest_collected.is_some_and(|o| o <= early_threshold) {
                break StopReason::EarlyCoverage;
            }
            if page_oldest.created_at < start {
                break StopReason::Exhausted;
            }
            if pages >= settings.max_pages {
                break StopReason::MaxPages;
            }
            let next = settings.scheme.of_record(&page_oldest);
            if next == query.until {
                break StopReason::NoProgress;
            }
            query.until = next;

            if !settings.page_delay.is_zero() {
                tokio::time::sleep(settings.page_delay).await;
            }
        };

        debug!(slot = %slot_key, pages, added, stop = %stop, "Window finished");
        Ok(WindowFetch {
            start,
            end,
            pages,
            added,
            oldest_collected,
            stop,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::encode_aid_time;
    use crate::error::ApiError;
    use crate::search::InMemorySearch;
    use crate::token_bucket::TokenBucket;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn slot() -> Slot {
        Slot::new(
            Utc.with_ymd_and_hms(2025, 7, 31, 15, 40, 0).unwrap(),
            TimeDelta::minutes(10),
        )
    }

    fn note(ts: DateTime<Utc>, n: usize) -> Record {
        Record::synthetic(format!("{}{:02}", encode_aid_time(ts), n % 100), ts, "テスト")
    }

    /// `n` records spread evenly over `[start + offset, end)`.
    fn even_corpus(slot: &Slot, n: usize, offset_secs: i64) -> Vec<Record> {
        let span = 600 - offset_secs;
        (0..n)
            .map(|i| {
                let ms = offset_secs * 1000 + (i as i64 * span * 1000) / n as i64;
                note(slot.start + TimeDelta::milliseconds(ms), i)
            })
            .collect()
    }

    fn settings(limit: u32, max_pages: u32) -> PaginatorSettings {
        PaginatorSettings {
            scheme: AnchorScheme::Aid,
            limit,
            max_pages,
            page_delay: Duration::ZERO,
            early_coverage: TimeDelta::seconds(30),
            sub_slot: None,
            text: None,
            host: None,
            since_override: None,
            until_override: None,
        }
    }

    fn paginator(api: Arc<dyn SearchApi>, settings: PaginatorSettings) -> Paginator {
        Paginator::new(
            api,
            Arc::new(RateGate::unlimited()),
            RetryPolicy::immediate(4),
            settings,
            Shutdown::default(),
        )
    }

    #[tokio::test]
    async fn walks_back_to_early_coverage() {
        let slot = slot();
        let api = Arc::new(InMemorySearch::new(even_corpus(&slot, 600, 0)));
        let fetch = paginator(api.clone(), settings(100, 50))
            .fetch_slot(&slot, "2025-08-01_00-40")
            .await
            .unwrap();
        assert_eq!(fetch.stop(), Some(StopReason::EarlyCoverage));
        // 600 records at one per second: the sixth page reaches 00:40:00.
        assert_eq!(fetch.pages(), 6);
        assert_eq!(fetch.records.len(), 600);
        assert_eq!(api.calls(), 6);
        assert!(!fetch.is_partial());
    }

    #[tokio::test]
    async fn stops_without_paging_past_threshold() {
        let slot = slot();
        // Pages of 116 at one record per second: the fifth page ends at
        // 00:40:20, inside the 30s buffer, leaving 00:40:00..00:40:19 unfetched.
        let api = Arc::new(InMemorySearch::new(even_corpus(&slot, 600, 0)));
        let fetch = paginator(api.clone(), settings(116, 50))
            .fetch_slot(&slot, "k")
            .await
            .unwrap();
        assert_eq!(fetch.stop(), Some(StopReason::EarlyCoverage));
        assert_eq!(api.calls(), 5);
        assert_eq!(fetch.records.len(), 580);
        let oldest = fetch.records.first().unwrap().created_at;
        assert_eq!(oldest, slot.start + TimeDelta::seconds(20));
    }

    #[tokio::test]
    async fn records_are_sorted_and_unique() {
        let slot = slot();
        let api = Arc::new(InMemorySearch::new(even_corpus(&slot, 250, 0)));
        let fetch = paginator(api, settings(40, 50))
            .fetch_slot(&slot, "k")
            .await
            .unwrap();
        let ids: HashSet<&str> = fetch.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), fetch.records.len());
        assert!(fetch.records.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn max_pages_yields_warning() {
        let slot = slot();
        let api = Arc::new(InMemorySearch::new(even_corpus(&slot, 600, 0)));
        let fetch = paginator(api, settings(100, 2))
            .fetch_slot(&slot, "k")
            .await
            .unwrap();
        assert_eq!(fetch.stop(), Some(StopReason::MaxPages));
        assert_eq!(fetch.records.len(), 200);
        assert!(fetch.is_partial());
        assert_eq!(fetch.warnings[0].reason, StopReason::MaxPages);
    }

    #[tokio::test]
    async fn sparse_slot_exhausts_on_empty_page() {
        let slot = slot();
        let records = vec![
            note(slot.start + TimeDelta::seconds(200), 1),
            note(slot.start + TimeDelta::seconds(400), 2),
        ];
        let api = Arc::new(InMemorySearch::new(records));
        let fetch = paginator(api.clone(), settings(100, 50))
            .fetch_slot(&slot, "k")
            .await
            .unwrap();
        assert_eq!(fetch.stop(), Some(StopReason::Exhausted));
        assert_eq!(fetch.records.len(), 2);
        // The short first page does not end the walk; the empty second one does.
        assert_eq!(api.calls(), 2);
        assert_eq!(fetch.windows[0].pages, 2);
    }

    /// Hides the newest record of every page, like upstream visibility
    /// filtering applied after the limit.
    #[derive(Debug)]
    struct FilteringApi {
        inner: InMemorySearch,
    }

    #[async_trait]
    impl SearchApi for FilteringApi {
        async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Record>> {
            let mut page = self.inner.fetch_page(query).await?;
            if !page.is_empty() {
                page.remove(0);
            }
            Ok(page)
        }
    }

    #[tokio::test]
    async fn short_pages_keep_walking() {
        let slot = slot();
        let api = Arc::new(FilteringApi {
            inner: InMemorySearch::new(even_corpus(&slot, 600, 0)),
        });
        let fetch = paginator(api.clone(), settings(100, 50))
            .fetch_slot(&slot, "k")
            .await
            .unwrap();
        // Every page holds 99 of 100; the walk still reaches 00:40:00.
        assert_eq!(fetch.stop(), Some(StopReason::EarlyCoverage));
        assert_eq!(fetch.pages(), 6);
        assert_eq!(api.inner.calls(), 6);
        assert_eq!(fetch.records.len(), 594);
        assert_eq!(fetch.records[0].created_at, slot.start);
        assert!(!fetch.is_partial());
    }

    #[tokio::test]
    async fn out_of_window_records_advance_anchor() {
        let slot = slot();
        // Ignores anchors and serves records after the slot end first.
        #[derive(Debug)]
        struct LeakyApi {
            pages: Mutex<Vec<Vec<Record>>>,
        }
        #[async_trait]
        impl SearchApi for LeakyApi {
            async fn fetch_page(&self, _query: &PageQuery) -> Result<Vec<Record>> {
                Ok(self.pages.lock().unwrap().pop().unwrap_or_default())
            }
        }
        let late: Vec<Record> = (0..3)
            .map(|i| note(slot.end() + TimeDelta::seconds(30 - i * 10), i as usize))
            .collect();
        let inside = vec![note(slot.start + TimeDelta::seconds(5), 7)];
        let api = Arc::new(LeakyApi {
            pages: Mutex::new(vec![inside, late]),
        });
        let fetch = paginator(api, settings(3, 50))
            .fetch_slot(&slot, "k")
            .await
            .unwrap();
        assert_eq!(fetch.records.len(), 1);
        assert_eq!(fetch.pages(), 2);
        assert_eq!(fetch.stop(), Some(StopReason::EarlyCoverage));
    }

    #[tokio::test]
    async fn repeated_page_is_no_progress() {
        let slot = slot();
        #[derive(Debug)]
        struct StuckApi(Vec<Record>);
        #[async_trait]
        impl SearchApi for StuckApi {
            async fn fetch_page(&self, _query: &PageQuery) -> Result<Vec<Record>> {
                Ok(self.0.clone())
            }
        }
        let page: Vec<Record> = (0..2)
            .map(|i| note(slot.start + TimeDelta::seconds(300 + i), i as usize))
            .collect();
        let fetch = paginator(Arc::new(StuckApi(page)), settings(2, 50))
            .fetch_slot(&slot, "k")
            .await
            .unwrap();
        assert_eq!(fetch.stop(), Some(StopReason::NoProgress));
        assert_eq!(fetch.pages(), 2);
        assert_eq!(fetch.records.len(), 2);
    }

    #[tokio::test]
    async fn sub_windows_each_walk_back() {
        let slot = slot();
        let api = Arc::new(InMemorySearch::new(even_corpus(&slot, 600, 0)));
        let mut s = settings(100, 50);
        s.sub_slot = Some(TimeDelta::seconds(300));
        let fetch = paginator(api, s).fetch_slot(&slot, "k").await.unwrap();
        assert_eq!(fetch.windows.len(), 2);
        assert!(
            fetch
                .windows
                .iter()
                .all(|w| w.stop == StopReason::EarlyCoverage)
        );
        assert_eq!(fetch.windows[1].start, slot.start + TimeDelta::seconds(300));
        assert_eq!(fetch.records.len(), 600);
    }

    #[tokio::test]
    async fn rate_limit_budget_fails_slot() {
        let slot = slot();
        let api = Arc::new(
            InMemorySearch::new(even_corpus(&slot, 10, 0))
                .with_failures(vec![ApiError::RateLimited { retry_after: None }; 4]),
        );
        let err = paginator(api.clone(), settings(100, 50))
            .fetch_slot(&slot, "k")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Api(ApiError::RateLimitExceeded { attempts: 4 })
        ));
        assert_eq!(api.calls(), 4);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let slot = slot();
        let api = Arc::new(
            InMemorySearch::new(even_corpus(&slot, 10, 0))
                .with_failures([ApiError::Transient("reset".into())]),
        );
        let fetch = paginator(api.clone(), settings(100, 50))
            .fetch_slot(&slot, "k")
            .await
            .unwrap();
        assert_eq!(fetch.records.len(), 10);
        assert_eq!(api.calls(), 2);
    }

    #[tokio::test]
    async fn cancellation_keeps_collected_records() {
        let slot = slot();
        let shutdown = Shutdown::default();
        #[derive(Debug)]
        struct TriggerAfterFirst {
            inner: InMemorySearch,
            shutdown: Shutdown,
        }
        #[async_trait]
        impl SearchApi for TriggerAfterFirst {
            async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Record>> {
                let page = self.inner.fetch_page(query).await;
                self.shutdown.trigger();
                page
            }
        }
        let api = Arc::new(TriggerAfterFirst {
            inner: InMemorySearch::new(even_corpus(&slot, 600, 0)),
            shutdown: shutdown.clone(),
        });
        let paginator = Paginator::new(
            api,
            Arc::new(RateGate::unlimited()),
            RetryPolicy::immediate(1),
            settings(100, 50),
            shutdown,
        );
        let fetch = paginator.fetch_slot(&slot, "k").await.unwrap();
        assert!(fetch.cancelled());
        assert_eq!(fetch.records.len(), 100);
        assert!(fetch.is_partial());
    }

    #[tokio::test]
    async fn shutdown_during_backoff_cancels_instead_of_failing() {
        let slot = slot();
        let shutdown = Shutdown::default();
        #[derive(Debug)]
        struct ThrottleThenInterrupt {
            shutdown: Shutdown,
        }
        #[async_trait]
        impl SearchApi for ThrottleThenInterrupt {
            async fn fetch_page(&self, _query: &PageQuery) -> Result<Vec<Record>> {
                self.shutdown.trigger();
                Err(ApiError::RateLimited { retry_after: None }.into())
            }
        }
        let paginator = Paginator::new(
            Arc::new(ThrottleThenInterrupt {
                shutdown: shutdown.clone(),
            }),
            Arc::new(RateGate::unlimited()),
            RetryPolicy::immediate(4),
            settings(100, 50),
            shutdown,
        );
        let fetch = paginator.fetch_slot(&slot, "k").await.unwrap();
        assert!(fetch.cancelled());
        assert_eq!(fetch.pages(), 0);
        assert!(fetch.records.is_empty());
    }

    #[tokio::test]
    async fn timestamp_scheme_walks_back() {
        let slot = slot();
        let api = Arc::new(InMemorySearch::new(even_corpus(&slot, 300, 0)));
        let mut s = settings(100, 50);
        s.scheme = AnchorScheme::Timestamp;
        let fetch = paginator(api, s).fetch_slot(&slot, "k").await.unwrap();
        assert_eq!(fetch.stop(), Some(StopReason::EarlyCoverage));
        assert_eq!(fetch.records.len(), 300);
    }

    #[test]
    fn since_override_replaces_floor() {
        let slot = slot();
        let mut s = settings(100, 50);
        s.since_override = Some("0000000000".into());
        assert_eq!(s.since_for(slot.start, None), Anchor::Id("0000000000".into()));
        assert_eq!(
            s.since_for(slot.start, Some("a9x0k1m2zz")),
            Anchor::Id("0000000000".into())
        );
        s.scheme = AnchorScheme::Timestamp;
        assert!(matches!(s.since_for(slot.start, None), Anchor::Time(_)));
    }

    #[test]
    fn boundary_replaces_floor() {
        let slot = slot();
        let s = settings(100, 50);
        assert_eq!(s.since_for(slot.start, None), AnchorScheme::Aid.floor(slot.start));
        assert_eq!(
            s.since_for(slot.start, Some("a9x0k1m2zz")),
            Anchor::Id("a9x0k1m2zz".into())
        );
    }

    /// Records the `since` anchor of every query.
    #[derive(Debug)]
    struct SinceRecorder {
        inner: InMemorySearch,
        seen: Mutex<Vec<Anchor>>,
    }

    #[async_trait]
    impl SearchApi for SinceRecorder {
        async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Record>> {
            self.seen.lock().unwrap().push(query.since.clone());
            self.inner.fetch_page(query).await
        }
    }

    #[tokio::test]
    async fn previous_slot_boundary_anchors_first_window() {
        let slot = slot();
        let previous = note(slot.start - TimeDelta::seconds(3), 9);
        let mut corpus = even_corpus(&slot, 60, 0);
        corpus.push(previous.clone());
        let api = Arc::new(SinceRecorder {
            inner: InMemorySearch::new(corpus),
            seen: Mutex::new(Vec::new()),
        });
        let mut s = settings(100, 50);
        s.sub_slot = Some(TimeDelta::seconds(300));
        let fetch = paginator(api.clone(), s)
            .fetch_slot_after(&slot, "k", Some(previous.id.as_str()))
            .await
            .unwrap();
        assert_eq!(fetch.since_boundary.as_deref(), Some(previous.id.as_str()));
        assert_eq!(fetch.records.len(), 60);
        assert!(fetch.records.iter().all(|r| r.id != previous.id));

        let seen = api.seen.lock().unwrap();
        assert_eq!(seen[0], Anchor::Id(previous.id.clone()));
        // The second window starts mid-slot and keeps its own floor.
        assert_eq!(
            seen.last().unwrap(),
            &AnchorScheme::Aid.floor(slot.start + TimeDelta::seconds(300))
        );
    }

    #[tokio::test]
    async fn boundary_inside_slot_is_ignored() {
        let slot = slot();
        let api = Arc::new(InMemorySearch::new(even_corpus(&slot, 60, 0)));
        let inside = note(slot.start + TimeDelta::seconds(120), 1);
        let fetch = paginator(api, settings(100, 50))
            .fetch_slot_after(&slot, "k", Some(inside.id.as_str()))
            .await
            .unwrap();
        assert!(fetch.since_boundary.is_none());
        assert_eq!(fetch.records.len(), 60);

        let fetch = paginator(
            Arc::new(InMemorySearch::new(even_corpus(&slot, 60, 0))),
            settings(100, 50),
        )
        .fetch_slot_after(&slot, "k", Some("not-an-aid"))
        .await
        .unwrap();
        assert!(fetch.since_boundary.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_gate_throttles_pages() {
        let slot = slot();
        let api = Arc::new(InMemorySearch::new(even_corpus(&slot, 300, 0)));
        let paginator = Paginator::new(
            api,
            Arc::new(RateGate::new(TokenBucket::new(1.0, 1.0))),
            RetryPolicy::immediate(1),
            settings(100, 50),
            Shutdown::default(),
        );
        let started = Instant::now();
        let fetch = paginator.fetch_slot(&slot, "k").await.unwrap();
        assert_eq!(fetch.pages(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
