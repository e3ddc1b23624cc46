use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;

use crate::error::{FinsightError, Result};
use crate::parsers::ParsedFile;
use crate::schema::{
    stable_record_id, AccountDraft, AccountType, RecordDraft, SourceType, ValueDraft,
};
use crate::utils::{parse_iso_date, slugify};
use crate::validation::{Severity, ValidationIssue};

/// One money column of the report: a reporting period.
#[derive(Debug, Clone)]
struct PeriodColumn {
    title: String,
    start: NaiveDate,
    end: NaiveDate,
    col_key: String,
}

/// Parser for the QuickBooks P&L export: a column-major report where each
/// money column is a period and the row tree nests account groups.
pub struct QuickBooksParser {
    currency: String,
    periods: Vec<PeriodColumn>,
    accounts: BTreeMap<String, AccountDraft>,
    values: Vec<ValueDraft>,
    issues: Vec<ValidationIssue>,
}

impl Default for QuickBooksParser {
    fn default() -> Self {
        Self::new()
    }
}

impl QuickBooksParser {
    pub fn new() -> Self {
        Self {
            currency: "USD".to_string(),
            periods: Vec::new(),
            accounts: BTreeMap::new(),
            values: Vec::new(),
            issues: Vec::new(),
        }
    }

    pub fn parse(mut self, doc: &Value) -> Result<ParsedFile> {
        let data = doc.get("data").unwrap_or(doc);
        if !data.is_object() {
            return Err(FinsightError::Parse(
                "QuickBooks document root is not an object".to_string(),
            ));
        }

        self.parse_header(data.get("Header"));
        self.parse_columns(data.get("Columns").and_then(|c| c.get("Column")));

        if self.periods.is_empty() {
            return Err(FinsightError::Parse(
                "QuickBooks report defines no money columns with period metadata".to_string(),
            ));
        }

        if let Some(rows) = data.get("Rows").and_then(|r| r.get("Row")).and_then(Value::as_array) {
            self.parse_rows(rows, None, None, 0);
        }

        let records = self.build_records();

        debug!(
            periods = self.periods.len(),
            accounts = self.accounts.len(),
            values = self.values.len(),
            "parsed QuickBooks report"
        );

        Ok(ParsedFile {
            records,
            accounts: self.accounts.into_values().collect(),
            values: self.values,
            issues: self.issues,
        })
    }

    fn parse_header(&mut self, header: Option<&Value>) {
        match header.and_then(|h| h.get("Currency")).and_then(Value::as_str) {
            Some(currency) => self.currency = currency.to_uppercase(),
            None => {
                self.issues.push(
                    ValidationIssue::new(
                        Severity::Info,
                        "CUR_DEFAULTED",
                        "Report header carries no currency, defaulting to USD",
                    )
                    .field("currency")
                    .value("USD"),
                );
            }
        }
    }

    fn parse_columns(&mut self, columns: Option<&Value>) {
        let Some(columns) = columns.and_then(Value::as_array) else {
            return;
        };

        for column in columns {
            if column.get("ColType").and_then(Value::as_str) != Some("Money") {
                continue;
            }

            let title = column
                .get("ColTitle")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let metadata: BTreeMap<&str, &str> = column
                .get("MetaData")
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|entry| {
                            Some((
                                entry.get("Name")?.as_str()?,
                                entry.get("Value")?.as_str()?,
                            ))
                        })
                        .collect()
                })
                .unwrap_or_default();

            let (Some(start_raw), Some(end_raw)) =
                (metadata.get("StartDate"), metadata.get("EndDate"))
            else {
                self.issues.push(
                    ValidationIssue::new(
                        Severity::Error,
                        "COLUMN_PERIOD_MISSING",
                        format!("Money column '{title}' has no StartDate/EndDate metadata"),
                    )
                    .field("Columns"),
                );
                continue;
            };

            match (
                parse_iso_date(start_raw, "StartDate"),
                parse_iso_date(end_raw, "EndDate"),
            ) {
                (Ok(start), Ok(end)) => self.periods.push(PeriodColumn {
                    title,
                    start,
                    end,
                    col_key: metadata.get("ColKey").unwrap_or(&"").to_string(),
                }),
                _ => {
                    self.issues.push(
                        ValidationIssue::new(
                            Severity::Error,
                            "COLUMN_PERIOD_MISSING",
                            format!("Money column '{title}' has unparseable period dates"),
                        )
                        .field("Columns")
                        .value(format!("{start_raw}..{end_raw}")),
                    );
                }
            }
        }
    }

    fn parse_rows(
        &mut self,
        rows: &[Value],
        parent_id: Option<&str>,
        group_type: Option<AccountType>,
        level: usize,
    ) {
        for row in rows {
            let header = row.get("Header").or_else(|| {
                // Leaf rows carry ColData directly instead of a Header block.
                if row.get("ColData").is_some() {
                    Some(row)
                } else {
                    None
                }
            });

            let mut row_account_id = None;
            let mut row_type = group_type;

            if let Some(header) = header {
                if let Some((account_id, account_type)) =
                    self.parse_account_row(header, parent_id, group_type, level)
                {
                    row_account_id = Some(account_id);
                    row_type = Some(account_type);
                }
            }

            if let Some(children) = row
                .get("Rows")
                .and_then(|r| r.get("Row"))
                .and_then(Value::as_array)
            {
                self.parse_rows(children, row_account_id.as_deref(), row_type, level + 1);
            }
        }
    }

    /// Returns the account id and resolved type so nested rows can inherit
    /// both the parent link and the enclosing group classification.
    fn parse_account_row(
        &mut self,
        header: &Value,
        parent_id: Option<&str>,
        group_type: Option<AccountType>,
        level: usize,
    ) -> Option<(String, AccountType)> {
        let col_data = header.get("ColData").and_then(Value::as_array)?;
        let account_col = col_data.first()?;

        let name = account_col
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        // Summary and blank rows carry no account of their own.
        if name.is_empty() || name.eq_ignore_ascii_case("total") || name.starts_with("Total ") {
            return None;
        }

        let account_id = match account_col.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => format!("qb_{id}"),
            _ => match parent_id {
                Some(parent) => format!("{parent}_{}", slugify(&name)),
                None => format!("qb_{}", slugify(&name)),
            },
        };

        let account_type = classify_account(&name, group_type, level);

        self.accounts
            .entry(account_id.clone())
            .or_insert_with(|| AccountDraft {
                account_id: account_id.clone(),
                name: name.clone(),
                account_type,
                parent_account_id: parent_id.map(|p| p.to_string()),
                source: SourceType::QuickBooks,
                description: Some(format!("QuickBooks account at level {level}")),
                is_active: true,
            });

        self.parse_account_values(&account_id, &name, &col_data[1..]);

        Some((account_id, account_type))
    }

    fn parse_account_values(&mut self, account_id: &str, name: &str, value_cols: &[Value]) {
        for (i, col) in value_cols.iter().enumerate() {
            let Some(period) = self.periods.get(i) else {
                break;
            };

            let raw = col
                .get("value")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            if raw.is_empty() {
                continue;
            }

            let value = match Decimal::from_str(&raw) {
                Ok(value) => value,
                Err(_) => {
                    self.issues.push(
                        ValidationIssue::new(
                            Severity::Warning,
                            "VALUE_UNPARSEABLE",
                            format!("Value '{raw}' for account '{name}' is not numeric, using 0"),
                        )
                        .field("ColData")
                        .value(&raw),
                    );
                    Decimal::ZERO
                }
            };

            self.values.push(ValueDraft {
                financial_record_id: stable_record_id(
                    SourceType::QuickBooks,
                    period.start,
                    period.end,
                    &self.currency,
                    None,
                ),
                account_id: account_id.to_string(),
                value,
            });
        }
    }

    fn build_records(&self) -> Vec<RecordDraft> {
        let mut records = Vec::with_capacity(self.periods.len());

        for period in &self.periods {
            let record_id = stable_record_id(
                SourceType::QuickBooks,
                period.start,
                period.end,
                &self.currency,
                None,
            );

            let mut revenue = Decimal::ZERO;
            let mut expenses = Decimal::ZERO;

            for value in self
                .values
                .iter()
                .filter(|v| v.financial_record_id == record_id)
            {
                match self.accounts.get(&value.account_id).map(|a| a.account_type) {
                    Some(AccountType::Revenue) => revenue += value.value,
                    Some(AccountType::Expense) => expenses += value.value,
                    _ => {}
                }
            }

            records.push(RecordDraft {
                source: SourceType::QuickBooks,
                period_start: period.start,
                period_end: period.end,
                currency: self.currency.clone(),
                revenue,
                expenses,
                net_profit: None,
                raw_data: serde_json::json!({
                    "period_title": period.title,
                    "col_key": period.col_key,
                    "record_id": record_id,
                }),
            });
        }

        records
    }
}

const LIABILITY_KEYWORDS: [&str; 5] = ["payable", "loan", "debt", "liability", "accrued"];
const REVENUE_KEYWORDS: [&str; 5] = ["income", "revenue", "sales", "service", "consulting"];
const EXPENSE_KEYWORDS: [&str; 5] = ["expense", "cost", "payroll", "rent", "marketing"];
const ASSET_KEYWORDS: [&str; 5] = ["cash", "bank", "receivable", "inventory", "equipment"];

/// Keyword table first (liabilities checked ahead of revenue so that
/// "Interest Payable" does not classify as income), then the enclosing
/// group's class, then a level-based default.
fn classify_account(name: &str, group_type: Option<AccountType>, level: usize) -> AccountType {
    let lowered = name.to_lowercase();

    if LIABILITY_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return AccountType::Liability;
    }
    if REVENUE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return AccountType::Revenue;
    }
    if EXPENSE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return AccountType::Expense;
    }
    if ASSET_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        return AccountType::Asset;
    }

    if let Some(group) = group_type {
        return group;
    }

    if level == 0 && lowered.contains("income") {
        AccountType::Revenue
    } else {
        AccountType::Expense
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn month_column(title: &str, start: &str, end: &str) -> Value {
        json!({
            "ColType": "Money",
            "ColTitle": title,
            "MetaData": [
                {"Name": "StartDate", "Value": start},
                {"Name": "EndDate", "Value": end},
                {"Name": "ColKey", "Value": title}
            ]
        })
    }

    fn report(columns: Vec<Value>, rows: Vec<Value>) -> Value {
        json!({
            "data": {
                "Header": {"Currency": "USD", "ReportName": "ProfitAndLoss"},
                "Columns": {"Column": columns},
                "Rows": {"Row": rows}
            }
        })
    }

    #[test]
    fn test_parse_simple_report() {
        let doc = report(
            vec![
                month_column("Jan 2024", "2024-01-01", "2024-01-31"),
                month_column("Feb 2024", "2024-02-01", "2024-02-29"),
            ],
            vec![json!({
                "Header": {"ColData": [{"value": "Income", "id": "1"}]},
                "Rows": {"Row": [
                    {"ColData": [
                        {"value": "Consulting Income", "id": "11"},
                        {"value": "10000.00"},
                        {"value": "12000.00"}
                    ]}
                ]}
            }),
            json!({
                "Header": {"ColData": [{"value": "Expenses", "id": "2"}]},
                "Rows": {"Row": [
                    {"ColData": [
                        {"value": "Rent", "id": "21"},
                        {"value": "6000.00"},
                        {"value": "6000.00"}
                    ]}
                ]}
            })],
        );

        let parsed = QuickBooksParser::new().parse(&doc).unwrap();

        assert_eq!(parsed.records.len(), 2);
        let jan = &parsed.records[0];
        assert_eq!(jan.revenue, dec!(10000.00));
        assert_eq!(jan.expenses, dec!(6000.00));
        assert_eq!(jan.currency, "USD");

        // Group rows and leaf rows all become accounts, linked by parent.
        let leaf = parsed
            .accounts
            .iter()
            .find(|a| a.name == "Consulting Income")
            .unwrap();
        assert_eq!(leaf.account_type, AccountType::Revenue);
        assert_eq!(leaf.parent_account_id.as_deref(), Some("qb_1"));
    }

    #[test]
    fn test_missing_currency_defaults_with_info() {
        let doc = json!({
            "data": {
                "Header": {},
                "Columns": {"Column": [month_column("Jan", "2024-01-01", "2024-01-31")]},
                "Rows": {"Row": []}
            }
        });
        let parsed = QuickBooksParser::new().parse(&doc).unwrap();
        assert!(parsed
            .issues
            .iter()
            .any(|i| i.code == "CUR_DEFAULTED" && i.severity == Severity::Info));
        assert_eq!(parsed.records[0].currency, "USD");
    }

    #[test]
    fn test_unparseable_value_becomes_zero_with_warning() {
        let doc = report(
            vec![month_column("Jan", "2024-01-01", "2024-01-31")],
            vec![json!({
                "ColData": [{"value": "Sales"}, {"value": "n/a"}]
            })],
        );
        let parsed = QuickBooksParser::new().parse(&doc).unwrap();
        assert!(parsed.issues.iter().any(|i| i.code == "VALUE_UNPARSEABLE"));
        assert_eq!(parsed.records[0].revenue, Decimal::ZERO);
    }

    #[test]
    fn test_column_without_period_metadata_is_skipped_with_error() {
        let doc = report(
            vec![
                json!({"ColType": "Money", "ColTitle": "Broken", "MetaData": []}),
                month_column("Jan", "2024-01-01", "2024-01-31"),
            ],
            vec![],
        );
        let parsed = QuickBooksParser::new().parse(&doc).unwrap();
        assert!(parsed
            .issues
            .iter()
            .any(|i| i.code == "COLUMN_PERIOD_MISSING" && i.severity == Severity::Error));
        assert_eq!(parsed.records.len(), 1);
    }

    #[test]
    fn test_no_periods_is_fatal() {
        let doc = report(vec![], vec![]);
        assert!(matches!(
            QuickBooksParser::new().parse(&doc),
            Err(FinsightError::Parse(_))
        ));
    }

    #[test]
    fn test_classify_account_keyword_order() {
        assert_eq!(classify_account("Accounts Payable", None, 1), AccountType::Liability);
        assert_eq!(classify_account("Service Revenue", None, 1), AccountType::Revenue);
        assert_eq!(classify_account("Payroll", None, 1), AccountType::Expense);
        assert_eq!(classify_account("Cash at Bank", None, 1), AccountType::Asset);
        // No keyword hit: inherit the enclosing group.
        assert_eq!(
            classify_account("Miscellaneous", Some(AccountType::Revenue), 2),
            AccountType::Revenue
        );
        assert_eq!(classify_account("Miscellaneous", None, 1), AccountType::Expense);
    }
}
