use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::error::{FinsightError, Result};
use crate::schema::FinancialRecord;
use crate::store::Store;
use crate::tools::params::{ComparisonParams, Metric};

#[derive(Debug, Serialize)]
pub struct MetricComparison {
    pub metric: &'static str,
    pub period1_value: Decimal,
    pub period2_value: Decimal,
    pub absolute_change: Decimal,
    /// Percent change from period 1 to period 2; absent when period 1 is zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent_change: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ComparisonReport {
    pub period1: PeriodSummary,
    pub period2: PeriodSummary,
    pub comparisons: Vec<MetricComparison>,
}

#[derive(Debug, Serialize)]
pub struct PeriodSummary {
    pub start: String,
    pub end: String,
    pub record_count: usize,
}

/// Absolute and percent change per metric between two periods. Swapping
/// the periods negates the changes but preserves their magnitudes.
pub async fn compare_financial_metrics(
    store: &Store,
    params: &ComparisonParams,
) -> Result<ComparisonReport> {
    let ((start1, end1), (start2, end2)) = params.ranges()?;

    let records1 = store.records_in_range(start1, end1, None, None).await?;
    let records2 = store.records_in_range(start2, end2, None, None).await?;

    if records1.is_empty() && records2.is_empty() {
        return Err(FinsightError::NotFound(format!(
            "no financial records in either period ({start1}..{end1}, {start2}..{end2})"
        )));
    }

    let comparisons = params
        .effective_metrics()
        .into_iter()
        .map(|metric| {
            let value1 = sum_metric(&records1, metric);
            let value2 = sum_metric(&records2, metric);
            let absolute_change = value2 - value1;
            let percent_change = if value1.is_zero() {
                None
            } else {
                (absolute_change / value1.abs())
                    .to_f64()
                    .map(|f| (f * 10000.0).round() / 100.0)
            };
            MetricComparison {
                metric: metric.label(),
                period1_value: value1,
                period2_value: value2,
                absolute_change,
                percent_change,
            }
        })
        .collect();

    Ok(ComparisonReport {
        period1: PeriodSummary {
            start: start1.to_string(),
            end: end1.to_string(),
            record_count: records1.len(),
        },
        period2: PeriodSummary {
            start: start2.to_string(),
            end: end2.to_string(),
            record_count: records2.len(),
        },
        comparisons,
    })
}

fn sum_metric(records: &[FinancialRecord], metric: Metric) -> Decimal {
    records.iter().map(|r| metric.of(r)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{stable_record_id, SourceType};
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn seeded() -> Arc<Store> {
        let store = Arc::new(Store::in_memory().await.unwrap());
        for (month, revenue) in [(1u32, dec!(1000.00)), (2, dec!(1500.00))] {
            let start = NaiveDate::from_ymd_opt(2024, month, 1).unwrap();
            let end = crate::utils::last_day_of_month(2024, month);
            let record = crate::schema::FinancialRecord {
                id: stable_record_id(SourceType::QuickBooks, start, end, "USD", None),
                source: SourceType::QuickBooks,
                period_start: start,
                period_end: end,
                currency: "USD".to_string(),
                revenue,
                expenses: dec!(500.00),
                net_profit: revenue - dec!(500.00),
                raw_data: serde_json::Value::Null,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            store.upsert_record(&record, &[], &[]).await.unwrap();
        }
        store
    }

    fn params(start1: &str, end1: &str, start2: &str, end2: &str) -> ComparisonParams {
        ComparisonParams {
            start1: start1.to_string(),
            end1: end1.to_string(),
            start2: start2.to_string(),
            end2: end2.to_string(),
            metrics: vec![Metric::Revenue],
        }
    }

    #[tokio::test]
    async fn test_comparison_change_and_percent() {
        let store = seeded().await;
        let report = compare_financial_metrics(
            &store,
            &params("2024-01-01", "2024-01-31", "2024-02-01", "2024-02-29"),
        )
        .await
        .unwrap();

        let revenue = &report.comparisons[0];
        assert_eq!(revenue.period1_value, dec!(1000.00));
        assert_eq!(revenue.period2_value, dec!(1500.00));
        assert_eq!(revenue.absolute_change, dec!(500.00));
        assert_eq!(revenue.percent_change, Some(50.0));
    }

    #[tokio::test]
    async fn test_comparison_is_antisymmetric() {
        let store = seeded().await;
        let forward = compare_financial_metrics(
            &store,
            &params("2024-01-01", "2024-01-31", "2024-02-01", "2024-02-29"),
        )
        .await
        .unwrap();
        let backward = compare_financial_metrics(
            &store,
            &params("2024-02-01", "2024-02-29", "2024-01-01", "2024-01-31"),
        )
        .await
        .unwrap();

        assert_eq!(
            forward.comparisons[0].absolute_change,
            -backward.comparisons[0].absolute_change
        );
        assert_eq!(
            forward.comparisons[0].absolute_change.abs(),
            backward.comparisons[0].absolute_change.abs()
        );
    }
}
