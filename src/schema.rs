use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::{FinsightError, Result};

/// Tolerance for the balance equation and for value-sum reconciliation.
pub const BALANCE_TOLERANCE: &str = "0.01";

pub fn balance_tolerance() -> Decimal {
    Decimal::from_str(BALANCE_TOLERANCE).unwrap_or_default()
}

/// Round a monetary amount to two fractional digits, banker's rounding.
/// The result always carries exactly two fractional digits so serialized
/// amounts compare textually.
pub fn round_money(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(2);
    rounded
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    QuickBooks,
    Rootfi,
}

impl SourceType {
    /// Prefix used when minting globally-unique account and record ids.
    pub fn prefix(&self) -> &'static str {
        match self {
            SourceType::QuickBooks => "qb",
            SourceType::Rootfi => "rootfi",
        }
    }

    pub fn all() -> [SourceType; 2] {
        [SourceType::QuickBooks, SourceType::Rootfi]
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceType::QuickBooks => write!(f, "quickbooks"),
            SourceType::Rootfi => write!(f, "rootfi"),
        }
    }
}

impl FromStr for SourceType {
    type Err = FinsightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "quickbooks" | "qb" => Ok(SourceType::QuickBooks),
            "rootfi" | "rf" => Ok(SourceType::Rootfi),
            other => Err(FinsightError::Validation(format!(
                "unknown source '{other}', expected 'quickbooks' or 'rootfi'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Revenue,
    Expense,
    Asset,
    Liability,
    Other,
}

/// Broad family used when checking parent/child compatibility. A revenue
/// account may only nest under another income-family account, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountFamily {
    Income,
    Spending,
    Assets,
    Liabilities,
    Other,
}

impl AccountType {
    pub fn family(&self) -> AccountFamily {
        match self {
            AccountType::Revenue => AccountFamily::Income,
            AccountType::Expense => AccountFamily::Spending,
            AccountType::Asset => AccountFamily::Assets,
            AccountType::Liability => AccountFamily::Liabilities,
            AccountType::Other => AccountFamily::Other,
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccountType::Revenue => "revenue",
            AccountType::Expense => "expense",
            AccountType::Asset => "asset",
            AccountType::Liability => "liability",
            AccountType::Other => "other",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AccountType {
    type Err = FinsightError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "revenue" => Ok(AccountType::Revenue),
            "expense" => Ok(AccountType::Expense),
            "asset" => Ok(AccountType::Asset),
            "liability" => Ok(AccountType::Liability),
            "other" => Ok(AccountType::Other),
            other => Err(FinsightError::Validation(format!(
                "unknown account type '{other}'"
            ))),
        }
    }
}

/// Unified financial record: one aggregate per (source, period, currency).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialRecord {
    pub id: String,
    pub source: SourceType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub currency: String,
    pub revenue: Decimal,
    pub expenses: Decimal,
    pub net_profit: Decimal,
    pub raw_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Node in the account forest. `account_id` is globally unique because it
/// carries the source prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub name: String,
    pub account_type: AccountType,
    pub parent_account_id: Option<String>,
    pub source: SourceType,
    pub description: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Contribution of one account to one financial record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountValue {
    pub financial_record_id: String,
    pub account_id: String,
    pub value: Decimal,
}

/// Parser output before normalization. `net_profit` is only set when the
/// source reports it explicitly; otherwise it is derived downstream.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub source: SourceType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub currency: String,
    pub revenue: Decimal,
    pub expenses: Decimal,
    pub net_profit: Option<Decimal>,
    pub raw_data: serde_json::Value,
}

impl RecordDraft {
    pub fn record_id(&self) -> String {
        stable_record_id(
            self.source,
            self.period_start,
            self.period_end,
            &self.currency,
            None,
        )
    }
}

#[derive(Debug, Clone)]
pub struct AccountDraft {
    pub account_id: String,
    pub name: String,
    pub account_type: AccountType,
    pub parent_account_id: Option<String>,
    pub source: SourceType,
    pub description: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct ValueDraft {
    pub financial_record_id: String,
    pub account_id: String,
    pub value: Decimal,
}

/// Deterministic record id: source prefix plus a truncated digest over the
/// natural key, so re-parsing the same period always yields the same id.
pub fn stable_record_id(
    source: SourceType,
    period_start: NaiveDate,
    period_end: NaiveDate,
    currency: &str,
    disambiguator: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}|{}",
        source.prefix(),
        period_start,
        period_end,
        currency.to_uppercase(),
        disambiguator.unwrap_or("")
    ));
    let digest = hasher.finalize();
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("{}-{}", source.prefix(), hex)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    PeriodStart,
    PeriodEnd,
    Revenue,
    Expenses,
    NetProfit,
    CreatedAt,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::PeriodStart => "period_start",
            SortField::PeriodEnd => "period_end",
            SortField::Revenue => "revenue",
            SortField::Expenses => "expenses",
            SortField::NetProfit => "net_profit",
            SortField::CreatedAt => "created_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFilter {
    pub source: Option<SourceType>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub currency: Option<String>,
    pub min_revenue: Option<Decimal>,
    pub max_revenue: Option<Decimal>,
    pub min_expenses: Option<Decimal>,
    pub max_expenses: Option<Decimal>,
    pub sort_by: SortField,
    pub sort_order: SortOrder,
    pub page: u32,
    pub page_size: u32,
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self {
            source: None,
            period_start: None,
            period_end: None,
            currency: None,
            min_revenue: None,
            max_revenue: None,
            min_expenses: None,
            max_expenses: None,
            sort_by: SortField::PeriodStart,
            sort_order: SortOrder::Asc,
            page: 1,
            page_size: 20,
        }
    }
}

impl RecordFilter {
    /// Clamp pagination to sane bounds; page is 1-based.
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        if let Some(c) = self.currency.take() {
            self.currency = Some(c.to_uppercase());
        }
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountFilter {
    pub account_type: Option<AccountType>,
    pub source: Option<SourceType>,
    pub is_active: Option<bool>,
    pub name_contains: Option<String>,
    pub parent_account_id: Option<String>,
    pub page: u32,
    pub page_size: u32,
}

impl AccountFilter {
    pub fn normalized(mut self) -> Self {
        self.page = self.page.max(1);
        if self.page_size == 0 {
            self.page_size = 50;
        }
        self.page_size = self.page_size.min(MAX_PAGE_SIZE);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

/// Subtree of the account forest returned by hierarchy queries.
#[derive(Debug, Clone, Serialize)]
pub struct AccountNode {
    #[serde(flatten)]
    pub account: Account,
    pub children: Vec<AccountNode>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stable_record_id_is_deterministic() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();

        let a = stable_record_id(SourceType::QuickBooks, start, end, "USD", None);
        let b = stable_record_id(SourceType::QuickBooks, start, end, "USD", None);
        assert_eq!(a, b);
        assert!(a.starts_with("qb-"));

        let c = stable_record_id(SourceType::Rootfi, start, end, "USD", Some("42"));
        assert!(c.starts_with("rootfi-"));
        assert_ne!(a, c);
    }

    #[test]
    fn test_round_money_half_even() {
        assert_eq!(round_money(dec!(1.005)), dec!(1.00));
        assert_eq!(round_money(dec!(1.015)), dec!(1.02));
        assert_eq!(round_money(dec!(-2.675)), dec!(-2.68));
    }

    #[test]
    fn test_source_type_round_trip() {
        assert_eq!("quickbooks".parse::<SourceType>().unwrap(), SourceType::QuickBooks);
        assert_eq!("RF".parse::<SourceType>().unwrap(), SourceType::Rootfi);
        assert!("xero".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_account_family_partition() {
        assert_eq!(AccountType::Revenue.family(), AccountFamily::Income);
        assert_eq!(AccountType::Expense.family(), AccountFamily::Spending);
        assert_ne!(
            AccountType::Revenue.family(),
            AccountType::Expense.family()
        );
    }

    #[test]
    fn test_record_filter_normalization() {
        let filter = RecordFilter {
            page: 0,
            page_size: 500,
            currency: Some("usd".to_string()),
            ..Default::default()
        }
        .normalized();

        assert_eq!(filter.page, 1);
        assert_eq!(filter.page_size, MAX_PAGE_SIZE);
        assert_eq!(filter.currency.as_deref(), Some("USD"));
    }
}
