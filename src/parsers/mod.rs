pub mod quickbooks;
pub mod rootfi;

use serde_json::Value;

use crate::error::{FinsightError, Result};
use crate::schema::{AccountDraft, RecordDraft, SourceType, ValueDraft};
use crate::validation::ValidationIssue;

pub use quickbooks::QuickBooksParser;
pub use rootfi::RootfiParser;

/// Intermediate output shared by both parsers: candidate records, the
/// account forest they reference, per-period account values, and any
/// quality issues raised while reading the raw file.
#[derive(Debug, Default)]
pub struct ParsedFile {
    pub records: Vec<RecordDraft>,
    pub accounts: Vec<AccountDraft>,
    pub values: Vec<ValueDraft>,
    pub issues: Vec<ValidationIssue>,
}

/// Decide which dialect a decoded JSON document is in.
///
/// A filename hint wins when unambiguous; otherwise the top-level shape
/// decides: a Header/Columns/Rows report is a QuickBooks P&L export, a
/// `data` array of period records with category arrays is a Rootfi export.
pub fn detect_source(file_name: Option<&str>, json: &Value) -> Result<SourceType> {
    if let Some(name) = file_name {
        let lowered = name.to_lowercase();
        if lowered.contains("quickbooks") || lowered.contains("qb") {
            return Ok(SourceType::QuickBooks);
        }
        if lowered.contains("rootfi") || lowered.contains("rf") {
            return Ok(SourceType::Rootfi);
        }
    }

    let data = json.get("data").unwrap_or(json);

    if data.is_object()
        && data.get("Header").is_some()
        && data.get("Columns").is_some()
        && data.get("Rows").is_some()
    {
        return Ok(SourceType::QuickBooks);
    }

    if let Some(entries) = data.as_array() {
        let looks_like_rootfi = entries.iter().any(|entry| {
            entry.get("period_start").is_some()
                && (entry.get("revenue").is_some()
                    || entry.get("operating_expenses").is_some()
                    || entry.get("rootfi_id").is_some())
        });
        if looks_like_rootfi {
            return Ok(SourceType::Rootfi);
        }
    }

    Err(FinsightError::UnknownDialect(
        "document matches neither the QuickBooks report shape nor the Rootfi period-record shape"
            .to_string(),
    ))
}

/// Run the parser for `source` over a decoded document.
pub fn parse_json(source: SourceType, json: &Value) -> Result<ParsedFile> {
    match source {
        SourceType::QuickBooks => QuickBooksParser::new().parse(json),
        SourceType::Rootfi => RootfiParser::new().parse(json),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_quickbooks_shape() {
        let doc = json!({
            "data": {
                "Header": {"Currency": "USD"},
                "Columns": {"Column": []},
                "Rows": {"Row": []}
            }
        });
        assert_eq!(detect_source(None, &doc).unwrap(), SourceType::QuickBooks);
    }

    #[test]
    fn test_detect_rootfi_shape() {
        let doc = json!({
            "data": [
                {"rootfi_id": 1, "period_start": "2024-01-01", "period_end": "2024-01-31", "revenue": []}
            ]
        });
        assert_eq!(detect_source(None, &doc).unwrap(), SourceType::Rootfi);
    }

    #[test]
    fn test_detect_by_filename_hint() {
        let doc = json!({});
        assert_eq!(
            detect_source(Some("acme_quickbooks_2024.json"), &doc).unwrap(),
            SourceType::QuickBooks
        );
        assert_eq!(
            detect_source(Some("rootfi_export.json"), &doc).unwrap(),
            SourceType::Rootfi
        );
    }

    #[test]
    fn test_detect_unknown_shape_fails() {
        let doc = json!({"rows": [1, 2, 3]});
        assert!(matches!(
            detect_source(None, &doc),
            Err(FinsightError::UnknownDialect(_))
        ));
    }
}
