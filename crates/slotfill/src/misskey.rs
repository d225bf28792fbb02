//! Misskey HTTP client for the search and timeline endpoints.
//!
//! Every endpoint is a JSON `POST {base_url}/api/{endpoint}`. The access token
//! travels in the body as `i`. Search mode bounds pages with `sinceId` and
//! `untilId`; timeline mode with `sinceDate` and `untilDate` in epoch ms.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use slotfill_core::anchor::Anchor;
use slotfill_core::config::{FetchConfig, FetchMode};
use slotfill_core::error::{ApiError, Result};
use slotfill_core::record::Record;
use slotfill_core::search::{PageQuery, SearchApi};

const USER_AGENT: &str = concat!("slotfill/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone)]
pub struct MisskeyClient {
    http: reqwest::Client,
    url: String,
    mode: FetchMode,
    token: Option<String>,
}

impl MisskeyClient {
    pub fn new(config: &FetchConfig, token: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: endpoint_url(&config.base_url, &config.endpoint),
            mode: config.mode,
            token,
        })
    }

    fn body(&self, query: &PageQuery) -> Value {
        request_body(self.mode, self.token.as_deref(), query)
    }
}

fn endpoint_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/api/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

fn request_body(mode: FetchMode, token: Option<&str>, query: &PageQuery) -> Value {
    let mut body = Map::new();
    body.insert("limit".into(), json!(query.limit));
    if let Some(token) = token {
        body.insert("i".into(), json!(token));
    }
    match mode {
        FetchMode::Search => {
            body.insert("query".into(), json!(query.text.clone().unwrap_or_default()));
        }
        FetchMode::Timeline => {
            if let Some(text) = &query.text {
                body.insert("query".into(), json!(text));
            }
        }
    }
    if let Some(host) = &query.host {
        body.insert("host".into(), json!(host));
    }
    insert_anchor(&mut body, "since", &query.since);
    insert_anchor(&mut body, "until", &query.until);
    Value::Object(body)
}

fn insert_anchor(body: &mut Map<String, Value>, side: &str, anchor: &Anchor) {
    match anchor {
        Anchor::Id(id) => {
            body.insert(format!("{side}Id"), json!(id));
        }
        Anchor::Time(ts) => {
            body.insert(format!("{side}Date"), json!(ts.timestamp_millis()));
        }
    }
}

/// Convert a page of note objects, dropping notes without a usable `id` or
/// `createdAt`. Returns the records and the number dropped.
fn decode_page(items: Vec<Value>) -> (Vec<Record>, usize) {
    let total = items.len();
    let records: Vec<Record> = items
        .into_iter()
        .filter_map(|item| match Record::from_value(item) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(error = %e, "Dropping undecodable note");
                None
            }
        })
        .collect();
    let skipped = total - records.len();
    (records, skipped)
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}

#[async_trait]
impl SearchApi for MisskeyClient {
    async fn fetch_page(&self, query: &PageQuery) -> Result<Vec<Record>> {
        let response = self
            .http
            .post(&self.url)
            .json(&self.body(query))
            .send()
            .await
            .map_err(|e| ApiError::Transient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ApiError::RateLimited {
                retry_after: retry_after(&response),
            }
            .into());
        }
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Transient(format!("{status}: {}", truncate(body))).into());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                body: truncate(body),
            }
            .into());
        }

        let value: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(ApiError::Decode(format!(
                    "expected a JSON array, got {}",
                    truncate(other.to_string())
                ))
                .into());
            }
        };
        debug!(returned = items.len(), until_anchor = %query.until, "Upstream page");
        let (records, skipped) = decode_page(items);
        if skipped > 0 {
            warn!(skipped, kept = records.len(), until_anchor = %query.until, "Skipped notes without id or createdAt");
        }
        Ok(records)
    }
}
