//! The upstream search/timeline capability.
//!
//! The production client lives in the CLI crate (HTTP). [`InMemorySearch`]
//! reproduces the upstream window semantics over a fixed corpus and backs
//! the pagination tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::anchor::Anchor;
use crate::error::{ApiError, Result};
use crate::record::Record;

/// One page request: records strictly between `since` and `until`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    pub since: Anchor,
    pub until: Anchor,
    pub text: Option<String>,
    pub host: Option<String>,
    pub limit: u32,
}

/// Returns up to `limit` records inside the window, newest first.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Record>>;
}

/// Scripted search backend over an in-memory corpus.
#[derive(Debug, Default)]
pub struct InMemorySearch {
    corpus: Vec<Record>,
    failures: Mutex<VecDeque<ApiError>>,
    calls: AtomicUsize,
}

impl InMemorySearch {
    #[must_use]
    pub fn new(mut corpus: Vec<Record>) -> Self {
        corpus.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Self {
            corpus,
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next calls with these errors, in order.
    #[must_use]
    pub fn with_failures(self, failures: impl IntoIterator<Item = ApiError>) -> Self {
        if let Ok(mut queue) = self.failures.lock() {
            queue.extend(failures);
        }
        self
    }

    /// Number of `fetch_page` calls served so far, failures included.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn admits(record: &Record, since: &Anchor, until: &Anchor) -> bool {
        let after_since = match since {
            Anchor::Id(id) => record.id.as_str() > id.as_str(),
            Anchor::Time(ts) => record.created_at > *ts,
        };
        let before_until = match until {
            Anchor::Id(id) => record.id.as_str() < id.as_str(),
            Anchor::Time(ts) => record.created_at < *ts,
        };
        after_since && before_until
    }
}

#[async_trait]
impl SearchApi for InMemorySearch {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Record>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.failures.lock().ok().and_then(|mut q| q.pop_front());
        if let Some(err) = scripted {
            return Err(err.into());
        }
        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        Ok(self
            .corpus
            .iter()
            .filter(|r| Self::admits(r, &query.since, &query.until))
            .take(limit)
            .cloned()
            .collect())
    }
}
