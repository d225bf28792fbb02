//! Japanese-text filter applied before persisting.

use crate::record::Record;

/// Hiragana and katakana, then CJK unified ideographs.
const JAPANESE_RANGES: [(u32, u32); 2] = [(0x3040, 0x30FF), (0x4E00, 0x9FFF)];

/// Whether `text` contains at least one kana or kanji character.
#[must_use]
pub fn contains_japanese(text: &str) -> bool {
    text.chars().any(|ch| {
        let code = u32::from(ch);
        JAPANESE_RANGES
            .iter()
            .any(|(lo, hi)| (*lo..=*hi).contains(&code))
    })
}

/// Records with no `text` field never pass.
#[must_use]
pub fn is_japanese_record(record: &Record) -> bool {
    record.text().is_some_and(contains_japanese)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn detects_kana_and_kanji() {
        assert!(contains_japanese("ひらがな"));
        assert!(contains_japanese("カタカナ"));
        assert!(contains_japanese("漢字"));
        assert!(contains_japanese("mixed テキスト text"));
    }

    #[test]
    fn rejects_other_scripts() {
        assert!(!contains_japanese(""));
        assert!(!contains_japanese("hello world"));
        assert!(!contains_japanese("안녕하세요"));
        // Full-width punctuation alone is outside the ranges.
        assert!(!contains_japanese("！？"));
    }

    #[test]
    fn record_without_text_is_not_japanese() {
        let mut record = Record::synthetic("a", Utc::now(), "テスト");
        assert!(is_japanese_record(&record));
        record.payload["text"] = serde_json::Value::Null;
        assert!(!is_japanese_record(&record));
    }
}
