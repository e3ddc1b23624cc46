use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::{FinsightError, Result};
use crate::store::Store;
use crate::tools::params::PeriodQueryParams;

#[derive(Debug, Serialize)]
pub struct PeriodBreakdown {
    pub period_start: String,
    pub period_end: String,
    pub source: String,
    pub value: Decimal,
}

#[derive(Debug, Serialize)]
pub struct RevenueReport {
    pub total_revenue: Decimal,
    pub record_count: usize,
    pub period_start: String,
    pub period_end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub source_breakdown: BTreeMap<String, Decimal>,
    pub periods: Vec<PeriodBreakdown>,
}

/// Revenue over a date range with per-source and per-period breakdowns.
pub async fn get_revenue_by_period(
    store: &Store,
    params: &PeriodQueryParams,
) -> Result<RevenueReport> {
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
        total += record.revenue;
        *source_breakdown
            .entry(record.source.to_string())
            .or_insert(Decimal::ZERO) += record.revenue;
        periods.push(PeriodBreakdown {
            period_start: record.period_start.to_string(),
            period_end: record.period_end.to_string(),
            source: record.source.to_string(),
            value: record.revenue,
        });
    }

    Ok(RevenueReport {
        total_revenue: total,
        record_count: records.len(),
        period_start: start.to_string(),
        period_end: end.to_string(),
        currency,
        source_breakdown,
        periods,
    })
}
