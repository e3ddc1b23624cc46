use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{FinsightError, Result};
use crate::llm::prompts::insight_prompt;
use crate::llm::types::ChatMessage;
use crate::llm::LlmClient;
use crate::tools::ToolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsightKind {
    RevenueTrends,
    ExpenseAnalysis,
    CashFlow,
    SeasonalPatterns,
    QuarterlyPerformance,
    ComprehensiveSummary,
}

impl InsightKind {
    pub fn all() -> [InsightKind; 6] {
        [
            InsightKind::RevenueTrends,
            InsightKind::ExpenseAnalysis,
            InsightKind::CashFlow,
            InsightKind::SeasonalPatterns,
            InsightKind::QuarterlyPerformance,
            InsightKind::ComprehensiveSummary,
        ]
    }

    pub fn label(&self) -> &'static str {
        match self {
            InsightKind::RevenueTrends => "revenue-trends",
            InsightKind::ExpenseAnalysis => "expense-analysis",
            InsightKind::CashFlow => "cash-flow",
            InsightKind::SeasonalPatterns => "seasonal-patterns",
            InsightKind::QuarterlyPerformance => "quarterly-performance",
            InsightKind::ComprehensiveSummary => "comprehensive-summary",
        }
    }
}

impl fmt::Display for InsightKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl FromStr for InsightKind {
    type Err = FinsightError;

    fn from_str(s: &str) -> Result<Self> {
        InsightKind::all()
            .into_iter()
            .find(|kind| kind.label() == s)
            .ok_or_else(|| {
                FinsightError::Validation(format!(
                    "unknown insight kind '{s}'; expected one of: {}",
                    InsightKind::all().map(|k| k.label()).join(", ")
                ))
            })
    }
}

/// Parameters accepted by every composition; defaults cover the current
/// calendar year.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InsightParams {
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    pub insight_type: String,
    pub period: String,
    pub narrative: String,
    pub key_findings: Vec<String>,
    pub recommendations: Vec<String>,
    pub data_points: Value,
    pub generated_at: DateTime<Utc>,
}

/// Canned compositions of registry tools plus an LLM narrative, cached by
/// (kind, normalized parameters).
pub struct InsightsEngine {
    registry: Arc<ToolRegistry>,
    llm: Option<LlmClient>,
    cache: Mutex<HashMap<String, (Instant, Insight)>>,
    ttl: Duration,
}

impl InsightsEngine {
    pub fn new(registry: Arc<ToolRegistry>, llm: Option<LlmClient>, cache_ttl_s: u64) -> Self {
        Self {
            registry,
            llm,
            cache: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(cache_ttl_s),
        }
    }

    pub async fn generate(&self, kind: InsightKind, params: &InsightParams) -> Result<Insight> {
        let (start, end, year) = normalize_params(params);
        let cache_key = format!("{kind}|{start}|{end}|{year}");

        {
            let cache = self.cache.lock().await;
            if let Some((at, insight)) = cache.get(&cache_key) {
                if at.elapsed() < self.ttl {
                    debug!(kind = %kind, "serving insight from cache");
                    return Ok(insight.clone());
                }
            }
        }

        let (data_points, key_findings, recommendations) =
            self.collect_data(kind, &start, &end, year).await?;

        let period = format!("{start}..{end}");
        let narrative = self
            .narrative_for(kind, &period, &data_points)
            .await
            .unwrap_or_else(|err| {
                warn!(kind = %kind, error = %err, "narrative generation failed, using summary");
                fallback_narrative(kind, &key_findings)
            });

        let insight = Insight {
            insight_type: kind.label().to_string(),
            period,
            narrative,
            key_findings,
            recommendations,
            data_points,
            generated_at: Utc::now(),
        };

        self.cache
            .lock()
            .await
            .insert(cache_key, (Instant::now(), insight.clone()));

        info!(kind = %kind, "generated insight");
        Ok(insight)
    }

    pub async fn clear_cache(&self) -> usize {
        let mut cache = self.cache.lock().await;
        let cleared = cache.len();
        cache.clear();
        cleared
    }

    /// Run the tool sequence for one composition and derive findings from
    /// the numbers; the narrative is layered on top.
    async fn collect_data(
        &self,
        kind: InsightKind,
        start: &str,
        end: &str,
        year: i32,
    ) -> Result<(Value, Vec<String>, Vec<String>)> {
        let range_args = json!({"start_date": start, "end_date": end});

        match kind {
            InsightKind::RevenueTrends => {
                let revenue = self
                    .registry
                    .execute("get_revenue_by_period", &range_args)
                    .await?;
                let growth = self
                    .registry
                    .execute(
                        "calculate_growth_rate",
                        &json!({"metric": "revenue", "periods": month_periods(year)}),
                    )
                    .await
                    .ok();

                let total = revenue["total_revenue"].clone();
                let mut findings = vec![format!("Total revenue for the period: {total}")];
                let mut recommendations = Vec::new();
                if let Some(growth) = &growth {
                    if let Some(pct) = growth["overall_growth_pct"].as_f64() {
                        findings.push(format!("Overall revenue growth: {pct}%"));
                        if pct < 0.0 {
                            recommendations.push(
                                "Revenue is contracting; review pricing and pipeline".to_string(),
                            );
                        }
                    }
                }
                Ok((
                    json!({"revenue": revenue, "growth": growth}),
                    findings,
                    recommendations,
                ))
            }
            InsightKind::ExpenseAnalysis => {
                let expenses = self
                    .registry
                    .execute("get_expenses_by_period", &range_args)
                    .await?;
                let categories = self
                    .registry
                    .execute("get_expense_categories", &range_args)
                    .await
                    .ok();
                let trends = self
                    .registry
                    .execute("analyze_expense_trends", &range_args)
                    .await
                    .ok();

                let mut findings =
                    vec![format!("Total expenses: {}", expenses["total_expenses"])];
                let mut recommendations = Vec::new();
                if let Some(categories) = &categories {
                    if let Some(top) = categories["categories"].get(0) {
                        findings.push(format!(
                            "Largest expense category: {} ({})",
                            top["name"], top["total"]
                        ));
                        recommendations
                            .push("Review the largest category for savings".to_string());
                    }
                }
                Ok((
                    json!({"expenses": expenses, "categories": categories, "trends": trends}),
                    findings,
                    recommendations,
                ))
            }
            InsightKind::CashFlow => {
                let revenue = self
                    .registry
                    .execute("get_revenue_by_period", &range_args)
                    .await?;
                let expenses = self
                    .registry
                    .execute("get_expenses_by_period", &range_args)
                    .await?;

                let net = decimal_field(&revenue, "total_revenue")
                    - decimal_field(&expenses, "total_expenses");
                let findings = vec![format!("Net cash position for the period: {net}")];
                let recommendations = if net < rust_decimal::Decimal::ZERO {
                    vec!["Expenses exceed revenue; tighten spending".to_string()]
                } else {
                    Vec::new()
                };
                Ok((
                    json!({"revenue": revenue, "expenses": expenses, "net": net.to_string()}),
                    findings,
                    recommendations,
                ))
            }
            InsightKind::SeasonalPatterns => {
                let seasonal = self
                    .registry
                    .execute(
                        "analyze_seasonal_patterns",
                        &json!({"metric": "revenue", "years": [year - 1, year]}),
                    )
                    .await?;

                let mut findings = Vec::new();
                if let Some(peak) = seasonal["peak_month"].as_u64() {
                    findings.push(format!("Peak revenue month: {peak}"));
                }
                if let Some(trough) = seasonal["trough_month"].as_u64() {
                    findings.push(format!("Weakest revenue month: {trough}"));
                }
                Ok((
                    json!({"seasonal": seasonal}),
                    findings,
                    vec!["Plan inventory and staffing around the peak month".to_string()],
                ))
            }
            InsightKind::QuarterlyPerformance => {
                let quarterly = self
                    .registry
                    .execute(
                        "get_quarterly_performance",
                        &json!({"year": year, "metric": "revenue"}),
                    )
                    .await?;

                let findings = quarterly["quarters"]
                    .as_array()
                    .map(|quarters| {
                        quarters
                            .iter()
                            .map(|q| format!("{}: {}", q["quarter"], q["value"]))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok((json!({"quarterly": quarterly}), findings, Vec::new()))
            }
            InsightKind::ComprehensiveSummary => {
                let revenue = self
                    .registry
                    .execute("get_revenue_by_period", &range_args)
                    .await?;
                let expenses = self
                    .registry
                    .execute("get_expenses_by_period", &range_args)
                    .await?;
                let anomalies = self
                    .registry
                    .execute(
                        "detect_anomalies",
                        &json!({"metric": "revenue", "threshold": 0.3, "lookback_months": 12}),
                    )
                    .await
                    .ok();

                let net = decimal_field(&revenue, "total_revenue")
                    - decimal_field(&expenses, "total_expenses");
                let findings = vec![
                    format!("Revenue: {}", revenue["total_revenue"]),
                    format!("Expenses: {}", expenses["total_expenses"]),
                    format!("Net profit: {net}"),
                ];
                Ok((
                    json!({
                        "revenue": revenue,
                        "expenses": expenses,
                        "net_profit": net.to_string(),
                        "anomalies": anomalies,
                    }),
                    findings,
                    Vec::new(),
                ))
            }
        }
    }

    async fn narrative_for(
        &self,
        kind: InsightKind,
        period: &str,
        data_points: &Value,
    ) -> Result<String> {
        let Some(llm) = &self.llm else {
            return Err(FinsightError::LlmUnavailable(
                "no LLM configured".to_string(),
            ));
        };

        let prompt = insight_prompt(kind.label(), period, &data_points.to_string());
        let response = llm.chat(&[ChatMessage::user(prompt)], &[]).await?;
        response
            .content
            .ok_or_else(|| FinsightError::LlmUnavailable("empty narrative".to_string()))
    }
}

fn normalize_params(params: &InsightParams) -> (String, String, i32) {
    let current_year = Utc::now().year();
    let year = params.year.unwrap_or(current_year);
    let start = params
        .start_date
        .clone()
        .unwrap_or_else(|| format!("{year}-01-01"));
    let end = params
        .end_date
        .clone()
        .unwrap_or_else(|| format!("{year}-12-31"));
    (start, end, year)
}

fn month_periods(year: i32) -> Vec<String> {
    (1..=12).map(|m| format!("{year}-{m:02}")).collect()
}

fn decimal_field(value: &Value, field: &str) -> rust_decimal::Decimal {
    value[field]
        .as_str()
        .and_then(|s| rust_decimal::Decimal::from_str(s).ok())
        .or_else(|| {
            value[field]
                .as_f64()
                .and_then(|f| rust_decimal::Decimal::try_from(f).ok())
        })
        .unwrap_or_default()
}

fn fallback_narrative(kind: InsightKind, findings: &[String]) -> String {
    if findings.is_empty() {
        format!("No narrative available for {kind}; see data_points for raw figures.")
    } else {
        format!(
            "Summary for {kind}: {}. See data_points for raw figures.",
            findings.join("; ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{stable_record_id, FinancialRecord, SourceType};
    use crate::store::Store;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    #[test]
    fn test_kind_parse_round_trip() {
        for kind in InsightKind::all() {
            assert_eq!(kind.label().parse::<InsightKind>().unwrap(), kind);
        }
        assert!("weekly-report".parse::<InsightKind>().is_err());
    }

    async fn seeded_engine(year: i32) -> InsightsEngine {
        let store = Arc::new(Store::in_memory().await.unwrap());
        for month in 1..=12u32 {
            let start = NaiveDate::from_ymd_opt(year, month, 1).unwrap();
            let end = crate::utils::last_day_of_month(year, month);
            let record = FinancialRecord {
                id: stable_record_id(SourceType::QuickBooks, start, end, "USD", None),
                source: SourceType::QuickBooks,
                period_start: start,
                period_end: end,
                currency: "USD".to_string(),
                revenue: dec!(10000.00),
                expenses: dec!(6000.00),
                net_profit: dec!(4000.00),
                raw_data: serde_json::Value::Null,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            store.upsert_record(&record, &[], &[]).await.unwrap();
        }
        InsightsEngine::new(Arc::new(ToolRegistry::new(store)), None, 3600)
    }

    #[tokio::test]
    async fn test_cash_flow_insight_without_llm() {
        let engine = seeded_engine(2024).await;
        let params = InsightParams {
            start_date: Some("2024-01-01".to_string()),
            end_date: Some("2024-12-31".to_string()),
            year: Some(2024),
        };

        let insight = engine.generate(InsightKind::CashFlow, &params).await.unwrap();
        assert_eq!(insight.insight_type, "cash-flow");
        assert!(insight
            .key_findings
            .iter()
            .any(|f| f.contains("48000")));
        assert!(!insight.narrative.is_empty());
    }

    #[tokio::test]
    async fn test_insight_caching() {
        let engine = seeded_engine(2024).await;
        let params = InsightParams {
            start_date: Some("2024-01-01".to_string()),
            end_date: Some("2024-12-31".to_string()),
            year: Some(2024),
        };

        let first = engine
            .generate(InsightKind::QuarterlyPerformance, &params)
            .await
            .unwrap();
        let second = engine
            .generate(InsightKind::QuarterlyPerformance, &params)
            .await
            .unwrap();
        assert_eq!(first.generated_at, second.generated_at);

        assert_eq!(engine.clear_cache().await, 1);
        let third = engine
            .generate(InsightKind::QuarterlyPerformance, &params)
            .await
            .unwrap();
        assert!(third.generated_at >= first.generated_at);
    }
}
