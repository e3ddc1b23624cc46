use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use tracing::debug;

use crate::error::{FinsightError, Result};
use crate::parsers::ParsedFile;
use crate::schema::{
    stable_record_id, AccountDraft, AccountType, RecordDraft, SourceType, ValueDraft,
};
use crate::utils::{parse_iso_date, slugify};
use crate::validation::{Severity, ValidationIssue};

/// The five category arrays every Rootfi period record may carry, with the
/// unified account type each one maps to.
const CATEGORIES: [(&str, AccountType); 5] = [
    ("revenue", AccountType::Revenue),
    ("cost_of_goods_sold", AccountType::Expense),
    ("operating_expenses", AccountType::Expense),
    ("non_operating_revenue", AccountType::Revenue),
    ("non_operating_expenses", AccountType::Expense),
];

/// Parser for the Rootfi export: a `data` array of period-major records,
/// each carrying explicit period bounds and nested line-item trees.
///
/// Line-item trees are read as a partition: a node's own `value` belongs to
/// that node alone, and category totals are the sum over every node.
pub struct RootfiParser {
    accounts: BTreeMap<String, AccountDraft>,
    values: Vec<ValueDraft>,
    issues: Vec<ValidationIssue>,
    used_ids: HashMap<String, u32>,
}

impl Default for RootfiParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RootfiParser {
    pub fn new() -> Self {
        Self {
            accounts: BTreeMap::new(),
            values: Vec::new(),
            issues: Vec::new(),
            used_ids: HashMap::new(),
        }
    }

    pub fn parse(mut self, doc: &Value) -> Result<ParsedFile> {
        let entries = doc
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| FinsightError::Parse("expected 'data' to be an array".to_string()))?;

        let mut records = Vec::new();
        for entry in entries {
            if let Some(record) = self.parse_period_record(entry) {
                records.push(record);
            }
        }

        debug!(
            periods = records.len(),
            accounts = self.accounts.len(),
            values = self.values.len(),
            "parsed Rootfi export"
        );

        Ok(ParsedFile {
            records,
            accounts: self.accounts.into_values().collect(),
            values: self.values,
            issues: self.issues,
        })
    }

    fn parse_period_record(&mut self, entry: &Value) -> Option<RecordDraft> {
        let rootfi_id = entry.get("rootfi_id").cloned().unwrap_or(Value::Null);

        let (start_raw, end_raw) = match (
            entry.get("period_start").and_then(Value::as_str),
            entry.get("period_end").and_then(Value::as_str),
        ) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                self.issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        "PERIOD_MISSING",
                        format!("Record {rootfi_id} is missing period_start/period_end, skipped"),
                    )
                    .field("period_start"),
                );
                return None;
            }
        };

        let (period_start, period_end) = match (
            parse_iso_date(start_raw, "period_start"),
            parse_iso_date(end_raw, "period_end"),
        ) {
            (Ok(start), Ok(end)) => (start, end),
            _ => {
                self.issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        "PERIOD_MISSING",
                        format!("Record {rootfi_id} has unparseable period dates, skipped"),
                    )
                    .field("period_start")
                    .value(format!("{start_raw}..{end_raw}")),
                );
                return None;
            }
        };

        let currency = match entry.get("currency_id").and_then(Value::as_str) {
            Some(code) if !code.trim().is_empty() => code.trim().to_uppercase(),
            _ => {
                self.issues.push(
                    ValidationIssue::new(
                        Severity::Info,
                        "CUR_DEFAULTED",
                        format!("Record {rootfi_id} carries no currency_id, defaulting to USD"),
                    )
                    .field("currency_id")
                    .value("USD"),
                );
                "USD".to_string()
            }
        };

        let disambiguator = match &rootfi_id {
            Value::Null => None,
            other => Some(other.to_string()),
        };
        let record_id = stable_record_id(
            SourceType::Rootfi,
            period_start,
            period_end,
            &currency,
            disambiguator.as_deref(),
        );

        let mut revenue = Decimal::ZERO;
        let mut expenses = Decimal::ZERO;

        for (category, account_type) in CATEGORIES {
            let Some(items) = entry.get(category).and_then(Value::as_array) else {
                continue;
            };
            let total = self.parse_line_items(items, account_type, &record_id, category, None);
            match account_type {
                AccountType::Revenue => revenue += total,
                _ => expenses += total,
            }
        }

        let net_profit = entry
            .get("net_profit")
            .and_then(json_decimal)
            .map(|v| v.round_dp(2));

        Some(RecordDraft {
            source: SourceType::Rootfi,
            period_start,
            period_end,
            currency,
            revenue,
            expenses,
            net_profit,
            raw_data: serde_json::json!({
                "rootfi_id": rootfi_id,
                "platform_id": entry.get("platform_id").cloned().unwrap_or(Value::Null),
                "gross_profit": entry.get("gross_profit").cloned().unwrap_or(Value::Null),
                "operating_profit": entry.get("operating_profit").cloned().unwrap_or(Value::Null),
                "net_profit": entry.get("net_profit").cloned().unwrap_or(Value::Null),
                "record_id": record_id,
            }),
        })
    }

    /// Walk a line-item tree, returning the sum of every node's own value.
    fn parse_line_items(
        &mut self,
        items: &[Value],
        account_type: AccountType,
        record_id: &str,
        category: &str,
        parent_id: Option<&str>,
    ) -> Decimal {
        let mut total = Decimal::ZERO;

        for item in items {
            let Some(item) = item.as_object() else {
                continue;
            };

            let name = item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            if name.is_empty() {
                continue;
            }

            let value = match item.get("value") {
                None => Decimal::ZERO,
                Some(raw) => match json_decimal(raw) {
                    Some(value) => value,
                    None => {
                        self.issues.push(
                            ValidationIssue::new(
                                Severity::Warning,
                                "VALUE_UNPARSEABLE",
                                format!("Value {:?} for line item '{name}' is not numeric, using 0", raw),
                            )
                            .field("value"),
                        );
                        Decimal::ZERO
                    }
                },
            };
            total += value;

            let account_id = match item.get("account_id").and_then(Value::as_str) {
                Some(id) if !id.trim().is_empty() => format!("rootfi_{}", id.trim()),
                _ => self.generate_account_id(&name, category, parent_id),
            };

            self.accounts
                .entry(account_id.clone())
                .or_insert_with(|| AccountDraft {
                    account_id: account_id.clone(),
                    name: name.clone(),
                    account_type,
                    parent_account_id: parent_id.map(|p| p.to_string()),
                    source: SourceType::Rootfi,
                    description: Some(format!("Rootfi {category} account")),
                    is_active: true,
                });

            if value != Decimal::ZERO {
                self.values.push(ValueDraft {
                    financial_record_id: record_id.to_string(),
                    account_id: account_id.clone(),
                    value,
                });
            }

            if let Some(children) = item.get("line_items").and_then(Value::as_array) {
                total += self.parse_line_items(
                    children,
                    account_type,
                    record_id,
                    category,
                    Some(&account_id),
                );
            }
        }

        total
    }

    /// Generated ids are slug-based; a repeated slug gets `_2`, `_3`, ...
    fn generate_account_id(&mut self, name: &str, category: &str, parent_id: Option<&str>) -> String {
        let base = match parent_id {
            Some(parent) => format!("{parent}_{}", slugify(name)),
            None => format!("rootfi_{category}_{}", slugify(name)),
        };

        let seen = self.used_ids.entry(base.clone()).or_insert(0);
        *seen += 1;

        if *seen == 1 {
            base
        } else {
            format!("{base}_{seen}")
        }
    }
}

fn json_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}
