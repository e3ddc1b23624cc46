use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{FinsightError, Result};
use crate::store::Store;
use crate::tools::params::{DateRangeParams, Metric, PeriodQueryParams};
use crate::tools::{monthly_series, MonthlyPoint};

#[derive(Debug, Serialize)]
pub struct ExpenseReport {
    pub total_expenses: Decimal,
    pub record_count: usize,
    pub period_start: String,
    pub period_end: String,
    pub source_breakdown: BTreeMap<String, Decimal>,
    pub periods: Vec<crate::tools::revenue::PeriodBreakdown>,
    /// Per-account split, present when account values were ingested.
    pub categories: Vec<CategoryShare>,
}

#[derive(Debug, Serialize)]
pub struct CategoryShare {
    pub name: String,
    pub total: Decimal,
    /// Share of all categorized expenses, 0..=1, two decimals.
    pub share: Decimal,
}

pub async fn get_expenses_by_period(
    store: &Store,
    params: &PeriodQueryParams,
) -> Result<ExpenseReport> {
    let (start, end) = params.range()?;
    let source = params.source_filter()?;
    let currency = params.currency.as_ref().map(|c| c.to_uppercase());

    let records = store
        .records_in_range(start, end, source, currency.as_deref())
        .await?;

    if records.is_empty() {
        return Err(FinsightError::NotFound(format!(
            "no financial records between {start} and {end}"
        )));
    }

    let mut total = Decimal::ZERO;
    let mut source_breakdown: BTreeMap<String, Decimal> = BTreeMap::new();
    let mut periods = Vec::with_capacity(records.len());

    for record in &records {
        total += record.expenses;
        *source_breakdown
            .entry(record.source.to_string())
            .or_insert(Decimal::ZERO) += record.expenses;
        periods.push(crate::tools::revenue::PeriodBreakdown {
            period_start: record.period_start.to_string(),
            period_end: record.period_end.to_string(),
            source: record.source.to_string(),
            value: record.expenses,
        });
    }

    let categories = category_shares(store, start, end, source).await?;

    Ok(ExpenseReport {
        total_expenses: total,
        record_count: records.len(),
        period_start: start.to_string(),
        period_end: end.to_string(),
        source_breakdown,
        periods,
        categories,
    })
}

#[derive(Debug, Serialize)]
pub struct ExpenseCategoriesReport {
    pub period_start: String,
    pub period_end: String,
    pub total: Decimal,
    pub categories: Vec<CategoryShare>,
}

pub async fn get_expense_categories(
    store: &Store,
    params: &DateRangeParams,
) -> Result<ExpenseCategoriesReport> {
    let (start, end) = params.range()?;
    let categories = category_shares(store, start, end, None).await?;

    if categories.is_empty() {
        return Err(FinsightError::NotFound(format!(
            "no categorized expenses between {start} and {end}"
        )));
    }

    let total = categories.iter().map(|c| c.total).sum();
    Ok(ExpenseCategoriesReport {
        period_start: start.to_string(),
        period_end: end.to_string(),
        total,
        categories,
    })
}

async fn category_shares(
    store: &Store,
    start: chrono::NaiveDate,
    end: chrono::NaiveDate,
    source: Option<crate::schema::SourceType>,
) -> Result<Vec<CategoryShare>> {
    let totals = store.expense_totals_by_account(start, end, source).await?;
    let grand_total: Decimal = totals.iter().map(|(_, v)| *v).sum();

    Ok(totals
        .into_iter()
        .map(|(name, total)| {
            let share = if grand_total.is_zero() {
                Decimal::ZERO
            } else {
                (total / grand_total).round_dp(4)
            };
            CategoryShare { name, total, share }
        })
        .collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Rising,
    Falling,
    Flat,
}

#[derive(Debug, Serialize)]
pub struct TrendSegment {
    pub from: String,
    pub to: String,
    pub direction: TrendDirection,
    pub change: Decimal,
}

#[derive(Debug, Serialize)]
pub struct ExpenseTrendReport {
    pub period_start: String,
    pub period_end: String,
    pub monthly: Vec<MonthlyPoint>,
    /// Maximal runs of months moving in one direction.
    pub segments: Vec<TrendSegment>,
    /// Months where the direction flipped.
    pub inflection_points: Vec<String>,
}

/// Monthly expense series split into monotonic segments.
pub async fn analyze_expense_trends(
    store: &Store,
    params: &DateRangeParams,
) -> Result<ExpenseTrendReport> {
    let (start, end) = params.range()?;
    let records = store.records_in_range(start, end, None, None).await?;

    if records.is_empty() {
        return Err(FinsightError::NotFound(format!(
            "no financial records between {start} and {end}"
        )));
    }

    let monthly = monthly_series(&records, Metric::Expenses);

    let mut segments: Vec<TrendSegment> = Vec::new();
    let mut inflection_points = Vec::new();
    let mut previous_direction: Option<TrendDirection> = None;

    for window in monthly.windows(2) {
        let (prev, next) = (&window[0], &window[1]);
        let change = next.value - prev.value;
        let direction = if change > Decimal::ZERO {
            TrendDirection::Rising
        } else if change < Decimal::ZERO {
            TrendDirection::Falling
        } else {
            TrendDirection::Flat
        };

        let label_prev = format!("{}-{:02}", prev.year, prev.month);
        let label_next = format!("{}-{:02}", next.year, next.month);

        match segments.last_mut() {
            Some(last) if last.direction == direction => {
                last.to = label_next.clone();
                last.change += change;
            }
            _ => {
                if previous_direction.is_some_and(|d| d != direction) {
                    inflection_points.push(label_prev.clone());
                }
                segments.push(TrendSegment {
                    from: label_prev,
                    to: label_next,
                    direction,
                    change,
                });
            }
        }
        previous_direction = Some(direction);
    }

    Ok(ExpenseTrendReport {
        period_start: start.to_string(),
        period_end: end.to_string(),
        monthly,
        segments,
        inflection_points,
    })
}
