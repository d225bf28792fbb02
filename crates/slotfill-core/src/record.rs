//! Fetched records and the NDJSON artifacts that hold them.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{ApiError, Result};

/// A fetched post. `payload` is the full upstream JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

impl Record {
    /// Build a record from an upstream note object.
    ///
    /// Requires a string `id` and an RFC 3339 `createdAt`.
    pub fn from_value(payload: Value) -> Result<Self> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ApiError::Decode("record without id".into()))?
            .to_string();
        let created_raw = payload
            .get("createdAt")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::Decode(format!("record {id} without createdAt")))?;
        let created_at = DateTime::parse_from_rfc3339(created_raw)
            .map_err(|e| ApiError::Decode(format!("record {id}: bad createdAt: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            id,
            created_at,
            payload,
        })
    }

    /// Minimal record for tests and stubs.
    #[must_use]
    pub fn synthetic(id: impl Into<String>, created_at: DateTime<Utc>, text: &str) -> Self {
        let id = id.into();
        let payload = serde_json::json!({
            "id": id,
            "createdAt": created_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            "text": text,
        });
        Self {
            id,
            created_at,
            payload,
        }
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(Value::as_str)
    }

    /// One NDJSON line, without the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

/// Result of reading one slot artifact line by line.
#[derive(Debug, Clone, Default)]
pub struct ParsedArtifact {
    /// Non-blank lines in the object.
    pub line_count: usize,
    /// Lines that parsed as records.
    pub records: Vec<Record>,
    /// Lines that were not records (error bodies, truncated JSON).
    pub invalid_lines: usize,
}

impl ParsedArtifact {
    /// Every line was garbage; typically a captured error response.
    #[must_use]
    pub fn is_error_only(&self) -> bool {
        self.records.is_empty()
    }
}

/// Parse NDJSON bytes, tolerating malformed lines.
#[must_use]
pub fn parse_artifact(bytes: &[u8]) -> ParsedArtifact {
    let text = String::from_utf8_lossy(bytes);
    let mut parsed = ParsedArtifact::default();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        parsed.line_count += 1;
        let record = serde_json::from_str::<Value>(line)
            .ok()
            .and_then(|value| Record::from_value(value).ok());
        match record {
            Some(record) => parsed.records.push(record),
            None => parsed.invalid_lines += 1,
        }
    }
    parsed
}

/// Serialize records as NDJSON, one per line with a trailing newline.
pub fn render_artifact(records: &[Record]) -> Result<Vec<u8>> {
    let mut out = String::new();
    for record in records {
        out.push_str(&record.to_line()?);
        out.push('\n');
    }
    Ok(out.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn from_value_reads_id_and_created_at() {
        let value = serde_json::json!({
            "id": "a9x0k1m2zz",
            "createdAt": "2025-08-01T00:40:10.000Z",
            "text": "こんにちは",
        });
        let record = Record::from_value(value).unwrap();
        assert_eq!(record.id, "a9x0k1m2zz");
        assert_eq!(
            record.created_at,
            Utc.with_ymd_and_hms(2025, 8, 1, 0, 40, 10).unwrap()
        );
        assert_eq!(record.text(), Some("こんにちは"));
    }

    #[test]
    fn from_value_rejects_error_bodies() {
        let value = serde_json::json!({
            "error": {"message": "Rate limit exceeded", "code": "RATE_LIMIT_EXCEEDED"}
        });
        assert!(Record::from_value(value).is_err());
    }

    #[test]
    fn parse_artifact_counts_invalid_lines() {
        let t = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let mut bytes = render_artifact(&[Record::synthetic("a", t, "x")]).unwrap();
        bytes.extend_from_slice(b"{\"error\":{\"code\":\"RATE_LIMIT_EXCEEDED\"}}\n");
        bytes.extend_from_slice(b"not json\n\n");
        let parsed = parse_artifact(&bytes);
        assert_eq!(parsed.line_count, 3);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.invalid_lines, 2);
        assert!(!parsed.is_error_only());
    }

    #[test]
    fn render_artifact_is_newline_terminated() {
        let t = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let bytes = render_artifact(&[
            Record::synthetic("a", t, "x"),
            Record::synthetic("b", t, "y"),
        ])
        .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }
}
