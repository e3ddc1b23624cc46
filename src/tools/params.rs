use chrono::NaiveDate;
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{FinsightError, Result};
use crate::schema::{FinancialRecord, SourceType};
use crate::utils::{parse_iso_date, PeriodSpec};

/// Metric a tool operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Revenue,
    Expenses,
    NetProfit,
}

impl Metric {
    pub fn of(&self, record: &FinancialRecord) -> Decimal {
        match self {
            Metric::Revenue => record.revenue,
            Metric::Expenses => record.expenses,
            Metric::NetProfit => record.net_profit,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Metric::Revenue => "revenue",
            Metric::Expenses => "expenses",
            Metric::NetProfit => "net_profit",
        }
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PeriodQueryParams {
    #[schemars(description = "Start date in YYYY-MM-DD format (inclusive)")]
    pub start_date: String,

    #[schemars(description = "End date in YYYY-MM-DD format (inclusive)")]
    pub end_date: String,

    #[schemars(description = "Optional source filter: 'quickbooks' or 'rootfi'")]
    #[serde(default)]
    pub source: Option<String>,

    #[schemars(description = "Optional 3-letter currency filter, e.g. 'USD'")]
    #[serde(default)]
    pub currency: Option<String>,
}

impl PeriodQueryParams {
    pub fn range(&self) -> Result<(NaiveDate, NaiveDate)> {
        date_range(&self.start_date, &self.end_date)
    }

    pub fn source_filter(&self) -> Result<Option<SourceType>> {
        parse_source(self.source.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ComparisonParams {
    #[schemars(description = "First period start date, YYYY-MM-DD")]
    pub start1: String,

    #[schemars(description = "First period end date, YYYY-MM-DD")]
    pub end1: String,

    #[schemars(description = "Second period start date, YYYY-MM-DD")]
    pub start2: String,

    #[schemars(description = "Second period end date, YYYY-MM-DD")]
    pub end2: String,

    #[schemars(description = "Metrics to compare; defaults to all three")]
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

impl ComparisonParams {
    pub fn ranges(&self) -> Result<((NaiveDate, NaiveDate), (NaiveDate, NaiveDate))> {
        Ok((
            date_range(&self.start1, &self.end1)?,
            date_range(&self.start2, &self.end2)?,
        ))
    }

    pub fn effective_metrics(&self) -> Vec<Metric> {
        if self.metrics.is_empty() {
            vec![Metric::Revenue, Metric::Expenses, Metric::NetProfit]
        } else {
            self.metrics.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct GrowthRateParams {
    #[schemars(description = "Metric to measure growth for")]
    pub metric: Metric,

    #[schemars(
        description = "Ordered list of periods to compare pairwise. Each entry is YYYY, YYYY-Qn, YYYY-MM, or YYYY-MM-DD."
    )]
    pub periods: Vec<String>,
}

impl GrowthRateParams {
    pub fn parsed_periods(&self) -> Result<Vec<PeriodSpec>> {
        if self.periods.len() < 2 {
            return Err(FinsightError::Validation(
                "growth rate needs at least two periods".to_string(),
            ));
        }
        self.periods.iter().map(|p| PeriodSpec::parse(p)).collect()
    }
}

fn default_threshold() -> f64 {
    0.2
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AnomalyParams {
    #[schemars(description = "Metric to scan for outliers")]
    pub metric: Metric,

    #[schemars(
        description = "Relative deviation from the mean that counts as anomalous, e.g. 0.2 for 20%. Must be positive."
    )]
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    #[schemars(description = "How many months back to scan, between 1 and 120")]
    pub lookback_months: u32,
}

impl AnomalyParams {
    pub fn validate(&self) -> Result<()> {
        if self.threshold <= 0.0 {
            return Err(FinsightError::Validation(format!(
                "threshold must be positive, got {}",
                self.threshold
            )));
        }
        if !(1..=120).contains(&self.lookback_months) {
            return Err(FinsightError::Validation(format!(
                "lookback_months must be within 1..=120, got {}",
                self.lookback_months
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct DateRangeParams {
    #[schemars(description = "Start date in YYYY-MM-DD format (inclusive)")]
    pub start_date: String,

    #[schemars(description = "End date in YYYY-MM-DD format (inclusive)")]
    pub end_date: String,
}

impl DateRangeParams {
    pub fn range(&self) -> Result<(NaiveDate, NaiveDate)> {
        date_range(&self.start_date, &self.end_date)
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SeasonalParams {
    #[schemars(description = "Metric to analyze across calendar months")]
    pub metric: Metric,

    #[schemars(description = "Calendar years to include, e.g. [2023, 2024]")]
    pub years: Vec<i32>,
}

impl SeasonalParams {
    pub fn validate(&self) -> Result<()> {
        if self.years.is_empty() {
            return Err(FinsightError::Validation(
                "at least one year is required".to_string(),
            ));
        }
        for year in &self.years {
            if !(1000..=9999).contains(year) {
                return Err(FinsightError::Validation(format!("invalid year {year}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct QuarterlyParams {
    #[schemars(description = "Calendar year, e.g. 2024")]
    pub year: i32,

    #[schemars(description = "Metric to summarize per quarter")]
    pub metric: Metric,
}

impl QuarterlyParams {
    pub fn validate(&self) -> Result<()> {
        if !(1000..=9999).contains(&self.year) {
            return Err(FinsightError::Validation(format!(
                "invalid year {}",
                self.year
            )));
        }
        Ok(())
    }
}

pub fn date_range(start: &str, end: &str) -> Result<(NaiveDate, NaiveDate)> {
    let start = parse_iso_date(start, "start_date")?;
    let end = parse_iso_date(end, "end_date")?;
    if start > end {
        return Err(FinsightError::Validation(format!(
            "start_date {start} is after end_date {end}"
        )));
    }
    Ok((start, end))
}

pub fn parse_source(source: Option<&str>) -> Result<Option<SourceType>> {
    source
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse())
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_date_range_rejects_inversion() {
        assert!(date_range("2024-03-01", "2024-01-01").is_err());
        assert!(date_range("2024-01-01", "2024-01-01").is_ok());
        assert!(date_range("2024/01/01", "2024-02-01").is_err());
    }

    #[test]
    fn test_anomaly_bounds() {
        let params = AnomalyParams {
            metric: Metric::Revenue,
            threshold: 0.2,
            lookback_months: 12,
        };
        assert!(params.validate().is_ok());

        assert!(AnomalyParams {
            threshold: 0.0,
            ..params.clone()
        }
        .validate()
        .is_err());
        assert!(AnomalyParams {
            lookback_months: 121,
            ..params.clone()
        }
        .validate()
        .is_err());
        assert!(AnomalyParams {
            lookback_months: 0,
            ..params
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_growth_requires_two_periods() {
        let params = GrowthRateParams {
            metric: Metric::Revenue,
            periods: vec!["2024-01".to_string()],
        };
        assert!(params.parsed_periods().is_err());

        let params = GrowthRateParams {
            metric: Metric::Revenue,
            periods: vec!["2024-01".to_string(), "2024-Q2".to_string()],
        };
        assert_eq!(params.parsed_periods().unwrap().len(), 2);
    }

    #[test]
    fn test_metric_deserializes_snake_case() {
        let metric: Metric = serde_json::from_str("\"net_profit\"").unwrap();
        assert_eq!(metric, Metric::NetProfit);
        assert!(serde_json::from_str::<Metric>("\"profit\"").is_err());
    }
}
