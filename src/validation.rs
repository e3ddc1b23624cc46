use chrono::{Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use crate::schema::{balance_tolerance, Account, AccountType, AccountValue, FinancialRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Penalty applied to the quality score per issue of this severity.
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Info => 0.05,
            Severity::Warning => 0.15,
            Severity::Error => 0.35,
            Severity::Critical => 0.50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            field: None,
            value: None,
            suggestion: None,
        }
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn value(mut self, value: impl ToString) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub quality_score: f64,
    pub issues: Vec<ValidationIssue>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            is_valid: true,
            quality_score: 1.0,
            issues: Vec::new(),
        }
    }

    pub fn push(&mut self, issue: ValidationIssue) {
        if matches!(issue.severity, Severity::Error | Severity::Critical) {
            self.is_valid = false;
        }
        self.issues.push(issue);
        self.quality_score = quality_score(&self.issues);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        for issue in other.issues {
            self.push(issue);
        }
    }

    pub fn has_blocking_issues(&self) -> bool {
        !self.is_valid
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

/// score = clamp(1 − 0.05·info − 0.15·warning − 0.35·error − 0.50·critical)
pub fn quality_score(issues: &[ValidationIssue]) -> f64 {
    let penalty: f64 = issues.iter().map(|i| i.severity.weight()).sum();
    let score = (1.0 - penalty).clamp(0.0, 1.0);
    (score * 100.0).round() / 100.0
}

const COMMON_CURRENCIES: [&str; 8] = ["USD", "EUR", "GBP", "JPY", "CAD", "AUD", "CHF", "CNY"];

/// Rule-set validator for normalized entities. `today` is injectable so the
/// date rules stay deterministic under test.
#[derive(Debug, Clone)]
pub struct Validator {
    tolerance: Decimal,
    high_value_threshold: Decimal,
    today: NaiveDate,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self::with_today(Utc::now().date_naive())
    }

    pub fn with_today(today: NaiveDate) -> Self {
        Self {
            tolerance: balance_tolerance(),
            high_value_threshold: Decimal::from_str("1000000000000").unwrap(),
            today,
        }
    }

    /// Financial accuracy, date consistency, balance equation, and currency
    /// rules for a single record.
    pub fn validate_record(&self, record: &FinancialRecord) -> ValidationResult {
        let mut result = ValidationResult::new();

        if record.revenue < Decimal::ZERO {
            result.push(
                ValidationIssue::new(
                    Severity::Warning,
                    "NEG_REV",
                    format!("Revenue is negative: {}", record.revenue),
                )
                .field("revenue")
                .value(record.revenue)
                .suggestion("Verify whether negative revenue is expected (returns/refunds)"),
            );
        }

        if record.expenses < Decimal::ZERO {
            result.push(
                ValidationIssue::new(
                    Severity::Warning,
                    "NEG_EXP",
                    format!("Expenses are negative: {}", record.expenses),
                )
                .field("expenses")
                .value(record.expenses)
                .suggestion("Verify whether negative expenses are expected (reversals)"),
            );
        }

        for (field, amount) in [
            ("revenue", record.revenue),
            ("expenses", record.expenses),
            ("net_profit", record.net_profit),
        ] {
            if amount.abs() > self.high_value_threshold {
                result.push(
                    ValidationIssue::new(
                        Severity::Warning,
                        "HIGH_VAL",
                        format!("{field} is unusually high: {amount}"),
                    )
                    .field(field)
                    .value(amount)
                    .suggestion("Verify the amount is not a data entry error"),
                );
            }
        }

        if record.period_end < record.period_start {
            result.push(
                ValidationIssue::new(
                    Severity::Error,
                    "DATE_RANGE",
                    format!(
                        "Period end ({}) is before period start ({})",
                        record.period_end, record.period_start
                    ),
                )
                .field("period_end")
                .value(record.period_end),
            );
        }

        if record.period_end > self.today {
            result.push(
                ValidationIssue::new(
                    Severity::Warning,
                    "FUTURE_PERIOD",
                    format!("Period end ({}) is in the future", record.period_end),
                )
                .field("period_end")
                .value(record.period_end)
                .suggestion("Verify whether future periods are expected"),
            );
        }

        let very_old = self
            .today
            .checked_sub_days(Days::new(365 * 10))
            .unwrap_or(self.today);
        if record.period_end < very_old {
            result.push(
                ValidationIssue::new(
                    Severity::Info,
                    "OLD_PERIOD",
                    format!("Period end ({}) is more than 10 years old", record.period_end),
                )
                .field("period_end")
                .value(record.period_end)
                .suggestion("Verify whether historical data is expected"),
            );
        }

        let expected = record.revenue - record.expenses;
        if (record.net_profit - expected).abs() > self.tolerance {
            result.push(
                ValidationIssue::new(
                    Severity::Error,
                    "BAL_EQ",
                    format!(
                        "Net profit ({}) does not equal revenue - expenses ({expected})",
                        record.net_profit
                    ),
                )
                .field("net_profit")
                .value(record.net_profit)
                .suggestion(format!("Net profit should be {expected}")),
            );
        }

        if record.currency.len() != 3 || !record.currency.chars().all(|c| c.is_ascii_uppercase()) {
            result.push(
                ValidationIssue::new(
                    Severity::Error,
                    "CUR_FMT",
                    format!("Currency '{}' is not a 3-letter uppercase code", record.currency),
                )
                .field("currency")
                .value(&record.currency)
                .suggestion("Use standard 3-letter currency codes (USD, EUR, GBP)"),
            );
        } else if !COMMON_CURRENCIES.contains(&record.currency.as_str()) {
            result.push(
                ValidationIssue::new(
                    Severity::Info,
                    "CUR_UNCOMMON",
                    format!("Currency '{}' is not commonly used", record.currency),
                )
                .field("currency")
                .value(&record.currency)
                .suggestion("Verify the currency code is correct"),
            );
        }

        result
    }

    /// Cycle, orphan, and family-mixing checks over the account forest.
    pub fn validate_hierarchy(&self, accounts: &[Account]) -> ValidationResult {
        let mut result = ValidationResult::new();
        let lookup: HashMap<&str, &Account> = accounts
            .iter()
            .map(|a| (a.account_id.as_str(), a))
            .collect();

        for account in accounts {
            let Some(parent_id) = account.parent_account_id.as_deref() else {
                continue;
            };

            if has_cycle(account.account_id.as_str(), &lookup) {
                result.push(
                    ValidationIssue::new(
                        Severity::Error,
                        "ACC_CYCLE",
                        format!(
                            "Account '{}' participates in a parent-chain cycle",
                            account.account_id
                        ),
                    )
                    .field("parent_account_id")
                    .value(parent_id),
                );
                continue;
            }

            match lookup.get(parent_id) {
                None => {
                    result.push(
                        ValidationIssue::new(
                            Severity::Error,
                            "ACC_ORPHAN",
                            format!(
                                "Parent account '{parent_id}' not found for account '{}'",
                                account.account_id
                            ),
                        )
                        .field("parent_account_id")
                        .value(parent_id)
                        .suggestion("Ensure the parent exists or clear the reference"),
                    );
                }
                Some(parent) => {
                    if parent.account_type.family() != account.account_type.family() {
                        result.push(
                            ValidationIssue::new(
                                Severity::Warning,
                                "ACC_TYPE_MIX",
                                format!(
                                    "Account '{}' ({}) nests under '{}' ({})",
                                    account.account_id,
                                    account.account_type,
                                    parent.account_id,
                                    parent.account_type
                                ),
                            )
                            .field("account_type")
                            .value(account.account_type),
                        );
                    }
                }
            }
        }

        result
    }

    /// Reconcile per-account values against the record totals. Skipped when
    /// no values accompany the record (nothing to reconcile).
    pub fn validate_values(
        &self,
        values: &[AccountValue],
        record: &FinancialRecord,
        accounts: &[Account],
    ) -> ValidationResult {
        let mut result = ValidationResult::new();
        if values.is_empty() {
            return result;
        }

        let lookup: HashMap<&str, &Account> = accounts
            .iter()
            .map(|a| (a.account_id.as_str(), a))
            .collect();

        let mut revenue_total = Decimal::ZERO;
        let mut expense_total = Decimal::ZERO;

        for value in values {
            if let Some(account) = lookup.get(value.account_id.as_str()) {
                match account.account_type {
                    AccountType::Revenue => revenue_total += value.value,
                    AccountType::Expense => expense_total += value.value,
                    _ => {}
                }
            }
        }

        if (revenue_total - record.revenue).abs() > self.tolerance {
            result.push(
                ValidationIssue::new(
                    Severity::Error,
                    "SUM_MISMATCH",
                    format!(
                        "Revenue account values ({revenue_total}) do not match record revenue ({})",
                        record.revenue
                    ),
                )
                .field("revenue")
                .value(revenue_total),
            );
        }

        if (expense_total - record.expenses).abs() > self.tolerance {
            result.push(
                ValidationIssue::new(
                    Severity::Error,
                    "SUM_MISMATCH",
                    format!(
                        "Expense account values ({expense_total}) do not match record expenses ({})",
                        record.expenses
                    ),
                )
                .field("expenses")
                .value(expense_total),
            );
        }

        result
    }
}

fn has_cycle(start: &str, lookup: &HashMap<&str, &Account>) -> bool {
    let mut visited = HashSet::new();
    let mut current = start.to_string();

    loop {
        if !visited.insert(current.clone()) {
            return true;
        }
        match lookup.get(current.as_str()).and_then(|a| a.parent_account_id.clone()) {
            Some(parent) => current = parent,
            None => return false,
        }
    }
}
