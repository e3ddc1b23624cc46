use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{FinsightError, Result};
use crate::store::Store;
use crate::tools::monthly_series;
use crate::tools::params::{QuarterlyParams, SeasonalParams};
use crate::utils::{quarter_bounds, PeriodSpec};

#[derive(Debug, Serialize)]
pub struct MonthProfile {
    pub month: u32,
    /// Average of the metric over the requested years; months with no data
    /// in a given year simply do not contribute to that year's sample.
    pub average: Decimal,
    pub samples: usize,
}

#[derive(Debug, Serialize)]
pub struct SeasonalReport {
    pub metric: &'static str,
    pub years: Vec<i32>,
    pub months: Vec<MonthProfile>,
    pub peak_month: Option<u32>,
    pub trough_month: Option<u32>,
}

/// Per-calendar-month averages across the requested years, with the peak
/// and trough months called out.
pub async fn analyze_seasonal_patterns(
    store: &Store,
    params: &SeasonalParams,
) -> Result<SeasonalReport> {
    let mut sums = [Decimal::ZERO; 12];
    let mut counts = [0usize; 12];
    let mut any = false;

    for year in &params.years {
        let (start, end) = PeriodSpec::Year(*year).bounds();
        let records = store.records_in_range(start, end, None, None).await?;
        if records.is_empty() {
            continue;
        }
        any = true;
        for point in monthly_series(&records, params.metric) {
            let index = (point.month - 1) as usize;
            sums[index] += point.value;
            counts[index] += 1;
        }
    }

    if !any {
        return Err(FinsightError::NotFound(format!(
            "no financial records in years {:?}",
            params.years
        )));
    }

    let months: Vec<MonthProfile> = (0..12)
        .filter(|i| counts[*i] > 0)
        .map(|i| MonthProfile {
            month: i as u32 + 1,
            average: (sums[i] / Decimal::from(counts[i])).round_dp(2),
            samples: counts[i],
        })
        .collect();

    let peak_month = months
        .iter()
        .max_by(|a, b| a.average.cmp(&b.average))
        .map(|m| m.month);
    let trough_month = months
        .iter()
        .min_by(|a, b| a.average.cmp(&b.average))
        .map(|m| m.month);

    Ok(SeasonalReport {
        metric: params.metric.label(),
        years: params.years.clone(),
        months,
        peak_month,
        trough_month,
    })
}

#[derive(Debug, Serialize)]
pub struct QuarterSummary {
    pub quarter: String,
    pub value: Decimal,
    pub record_count: usize,
    /// Change against the same quarter a year earlier, percent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yoy_change_pct: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct QuarterlyReport {
    pub year: i32,
    pub metric: &'static str,
    pub quarters: Vec<QuarterSummary>,
}

/// Four quarter summaries for a year; when the previous year holds data
/// for a quarter, the year-over-year change is included.
pub async fn get_quarterly_performance(
    store: &Store,
    params: &QuarterlyParams,
) -> Result<QuarterlyReport> {
    let mut quarters = Vec::with_capacity(4);
    let mut any = false;

    for quarter in 1..=4u32 {
        let (start, end) = quarter_bounds(params.year, quarter)?;
        let records = store.records_in_range(start, end, None, None).await?;
        let value: Decimal = records.iter().map(|r| params.metric.of(r)).sum();
        if !records.is_empty() {
            any = true;
        }

        let (prev_start, prev_end) = quarter_bounds(params.year - 1, quarter)?;
        let prev_records = store
            .records_in_range(prev_start, prev_end, None, None)
            .await?;
        let yoy_change_pct = if prev_records.is_empty() {
            None
        } else {
            let prev: Decimal = prev_records.iter().map(|r| params.metric.of(r)).sum();
            if prev.is_zero() {
                None
            } else {
                ((value - prev) / prev.abs())
                    .to_f64()
                    .map(|f| (f * 10000.0).round() / 100.0)
            }
        };

        quarters.push(QuarterSummary {
            quarter: format!("{}-Q{quarter}", params.year),
            value,
            record_count: records.len(),
            yoy_change_pct,
        });
    }

    if !any {
        return Err(FinsightError::NotFound(format!(
            "no financial records in {}",
            params.year
        )));
    }

    Ok(QuarterlyReport {
        year: params.year,
        metric: params.metric.label(),
        quarters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{stable_record_id, FinancialRecord, SourceType};
    use crate::tools::params::Metric;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn seed_month(store: &Store, year: i32, month: u32, revenue: Decimal) {
        let start = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
        let end = crate::utils::last_day_of_month(year, month);
        let record = FinancialRecord {
            id: stable_record_id(SourceType::QuickBooks, start, end, "USD", None),
            source: SourceType::QuickBooks,
            period_start: start,
            period_end: end,
            currency: "USD".to_string(),
            revenue,
            expenses: dec!(0),
            net_profit: revenue,
            raw_data: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_record(&record, &[], &[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_seasonal_peak_and_trough() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        for year in [2023, 2024] {
            for month in 1..=12u32 {
                let revenue = if month == 12 { dec!(500.00) } else { dec!(100.00) };
                seed_month(&store, year, month, revenue).await;
            }
        }

        let params = SeasonalParams {
            metric: Metric::Revenue,
            years: vec![2023, 2024],
        };
        let report = analyze_seasonal_patterns(&store, &params).await.unwrap();
        assert_eq!(report.months.len(), 12);
        assert_eq!(report.peak_month, Some(12));
        assert_eq!(report.months[11].average, dec!(500.00));
        assert_eq!(report.months[11].samples, 2);
        assert_eq!(report.trough_month, Some(1));
    }

    #[tokio::test]
    async fn test_quarterly_with_yoy() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        for month in 1..=3u32 {
            seed_month(&store, 2023, month, dec!(100.00)).await;
            seed_month(&store, 2024, month, dec!(120.00)).await;
        }

        let params = QuarterlyParams {
            year: 2024,
            metric: Metric::Revenue,
        };
        let report = get_quarterly_performance(&store, &params).await.unwrap();
        assert_eq!(report.quarters.len(), 4);
        assert_eq!(report.quarters[0].value, dec!(360.00));
        assert_eq!(report.quarters[0].yoy_change_pct, Some(20.0));
        // No data for Q2 in either year.
        assert_eq!(report.quarters[1].record_count, 0);
        assert_eq!(report.quarters[1].yoy_change_pct, None);
    }

    #[tokio::test]
    async fn test_empty_year_is_not_found() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let params = QuarterlyParams {
            year: 2024,
            metric: Metric::Revenue,
        };
        assert!(matches!(
            get_quarterly_performance(&store, &params).await,
            Err(FinsightError::NotFound(_))
        ));
    }
}
