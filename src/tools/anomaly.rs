use chrono::{Datelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::error::{FinsightError, Result};
use crate::store::Store;
use crate::tools::monthly_series;
use crate::tools::params::AnomalyParams;
use crate::utils::{first_day_of_month, last_day_of_month};

#[derive(Debug, Serialize)]
pub struct AnomalousPeriod {
    pub period: String,
    pub value: f64,
    /// Deviation from the mean relative to the mean's magnitude.
    pub deviation_ratio: f64,
    /// Standard-score of the value within the window.
    pub z_score: f64,
}

#[derive(Debug, Serialize)]
pub struct AnomalyReport {
    pub metric: &'static str,
    pub window_start: String,
    pub window_end: String,
    pub months_analyzed: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub threshold: f64,
    pub anomalies: Vec<AnomalousPeriod>,
}

/// Flag months whose metric deviates from the window mean by more than
/// `threshold` of the mean, with a z-score alongside for context.
pub async fn detect_anomalies(store: &Store, params: &AnomalyParams) -> Result<AnomalyReport> {
    let today = Utc::now().date_naive();
    let window_end = last_day_of_month(today.year(), today.month());

    let mut year = today.year();
    let mut month = today.month() as i32 - (params.lookback_months as i32 - 1);
    while month < 1 {
        month += 12;
        year -= 1;
    }
    let window_start = first_day_of_month(year, month as u32)?;

    let records = store
        .records_in_range(window_start, window_end, None, None)
        .await?;
    if records.is_empty() {
        return Err(FinsightError::NotFound(format!(
            "no financial records in the last {} months",
            params.lookback_months
        )));
    }

    let series = monthly_series(&records, params.metric);
    let values: Vec<f64> = series
        .iter()
        .map(|p| p.value.to_f64().unwrap_or(0.0))
        .collect();

    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let std_dev = variance.sqrt();

    let anomalies = series
        .iter()
        .zip(&values)
        .filter_map(|(point, value)| {
            let deviation_ratio = if mean.abs() < f64::EPSILON {
                0.0
            } else {
                (value - mean) / mean.abs()
            };
            if deviation_ratio.abs() <= params.threshold {
                return None;
            }
            let z_score = if std_dev < f64::EPSILON {
                0.0
            } else {
                (value - mean) / std_dev
            };
            Some(AnomalousPeriod {
                period: format!("{}-{:02}", point.year, point.month),
                value: *value,
                deviation_ratio: round4(deviation_ratio),
                z_score: round4(z_score),
            })
        })
        .collect();

    Ok(AnomalyReport {
        metric: params.metric.label(),
        window_start: window_start.to_string(),
        window_end: window_end.to_string(),
        months_analyzed: series.len(),
        mean: round4(mean),
        std_dev: round4(std_dev),
        threshold: params.threshold,
        anomalies,
    })
}

fn round4(value: f64) -> f64 {
    (value * 10000.0).round() / 10000.0
}
