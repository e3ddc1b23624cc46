use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{FinsightError, Result};
use crate::store::Store;
use crate::tools::params::GrowthRateParams;

#[derive(Debug, Serialize)]
pub struct GrowthStep {
    pub from_period: String,
    pub to_period: String,
    pub from_value: Decimal,
    pub to_value: Decimal,
    /// Percent growth from one period to the next; absent when the base is zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub growth_pct: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct GrowthReport {
    pub metric: &'static str,
    pub steps: Vec<GrowthStep>,
    /// Total growth from first to last period, percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overall_growth_pct: Option<f64>,
    /// Compound per-period growth rate across the series, percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compound_growth_pct: Option<f64>,
}

/// Pairwise growth across an ordered list of periods plus a compound-rate
/// summary over the whole span.
pub async fn calculate_growth_rate(
    store: &Store,
    params: &GrowthRateParams,
) -> Result<GrowthReport> {
    let specs = params.parsed_periods()?;

    let mut values = Vec::with_capacity(specs.len());
    for spec in &specs {
        let (start, end) = spec.bounds();
        let records = store.records_in_range(start, end, None, None).await?;
        let total: Decimal = records.iter().map(|r| params.metric.of(r)).sum();
        values.push((spec.label(), total, records.len()));
    }

    if values.iter().all(|(_, _, count)| *count == 0) {
        return Err(FinsightError::NotFound(
            "none of the requested periods contain financial records".to_string(),
        ));
    }

    let steps: Vec<GrowthStep> = values
        .windows(2)
        .map(|pair| {
            let (from_label, from_value, _) = &pair[0];
            let (to_label, to_value, _) = &pair[1];
            GrowthStep {
                from_period: from_label.clone(),
                to_period: to_label.clone(),
                from_value: *from_value,
                to_value: *to_value,
                growth_pct: percent_change(*from_value, *to_value),
            }
        })
        .collect();

    let first = values.first().map(|(_, v, _)| *v).unwrap_or_default();
    let last = values.last().map(|(_, v, _)| *v).unwrap_or_default();
    let overall_growth_pct = percent_change(first, last);

    // Geometric mean of the period-to-period ratios; needs positive totals.
    let compound_growth_pct = if values.len() >= 2 && first > Decimal::ZERO && last > Decimal::ZERO
    {
        let periods = (values.len() - 1) as f64;
        let ratio = last.to_f64().unwrap_or(0.0) / first.to_f64().unwrap_or(1.0);
        Some(round2((ratio.powf(1.0 / periods) - 1.0) * 100.0))
    } else {
        None
    };

    Ok(GrowthReport {
        metric: params.metric.label(),
        steps,
        overall_growth_pct,
        compound_growth_pct,
    })
}

fn percent_change(from: Decimal, to: Decimal) -> Option<f64> {
    if from.is_zero() {
        return None;
    }
    ((to - from) / from.abs()).to_f64().map(|f| round2(f * 100.0))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{stable_record_id, FinancialRecord, SourceType};
    use crate::tools::params::Metric;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn seeded(revenues: &[Decimal]) -> Arc<Store> {
        let store = Arc::new(Store::in_memory().await.unwrap());
        for (i, revenue) in revenues.iter().enumerate() {
            let month = i as u32 + 1;
            let start = NaiveDate::from_ymd_opt(2024, month, 1).unwrap();
            let end = crate::utils::last_day_of_month(2024, month);
            let record = FinancialRecord {
                id: stable_record_id(SourceType::QuickBooks, start, end, "USD", None),
                source: SourceType::QuickBooks,
                period_start: start,
                period_end: end,
                currency: "USD".to_string(),
                revenue: *revenue,
                expenses: dec!(0),
                net_profit: *revenue,
                raw_data: serde_json::Value::Null,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            store.upsert_record(&record, &[], &[]).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_growth_steps_and_summary() {
        let store = seeded(&[dec!(100.00), dec!(110.00), dec!(121.00)]).await;
        let params = GrowthRateParams {
            metric: Metric::Revenue,
            periods: vec![
                "2024-01".to_string(),
                "2024-02".to_string(),
                "2024-03".to_string(),
            ],
        };

        let report = calculate_growth_rate(&store, &params).await.unwrap();
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[0].growth_pct, Some(10.0));
        assert_eq!(report.steps[1].growth_pct, Some(10.0));
        assert_eq!(report.overall_growth_pct, Some(21.0));
        assert_eq!(report.compound_growth_pct, Some(10.0));
    }

    #[tokio::test]
    async fn test_growth_with_no_data_is_not_found() {
        let store = seeded(&[]).await;
        let params = GrowthRateParams {
            metric: Metric::Revenue,
            periods: vec!["2023-01".to_string(), "2023-02".to_string()],
        };
        assert!(matches!(
            calculate_growth_rate(&store, &params).await,
            Err(FinsightError::NotFound(_))
        ));
    }
}
