pub mod anomaly;
pub mod comparison;
pub mod expenses;
pub mod growth;
pub mod params;
pub mod revenue;
pub mod seasonal;

use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::{FinsightError, Result};
use crate::llm::types::ToolSpec;
use crate::schema::FinancialRecord;
use crate::store::Store;
use params::{
    AnomalyParams, ComparisonParams, DateRangeParams, GrowthRateParams, Metric,
    PeriodQueryParams, QuarterlyParams, SeasonalParams,
};

/// Declarative catalog of read-only analysis tools over the store.
/// Parameter schemas come from the typed parameter structs; arguments are
/// validated here at the registry boundary, never inside handlers.
pub struct ToolRegistry {
    store: Arc<Store>,
    specs: Vec<ToolSpec>,
}

impl ToolRegistry {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            specs: build_catalog(),
        }
    }

    pub fn catalog(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn names(&self) -> Vec<String> {
        self.specs.iter().map(|s| s.name.clone()).collect()
    }

    pub async fn execute(&self, name: &str, arguments: &Value) -> Result<Value> {
        debug!(tool = name, "executing tool");

        match name {
            "get_revenue_by_period" => {
                let params: PeriodQueryParams = parse_args(name, arguments)?;
                params.range()?;
                params.source_filter()?;
                to_value(revenue::get_revenue_by_period(&self.store, &params).await?)
            }
            "get_expenses_by_period" => {
                let params: PeriodQueryParams = parse_args(name, arguments)?;
                params.range()?;
                params.source_filter()?;
                to_value(expenses::get_expenses_by_period(&self.store, &params).await?)
            }
            "compare_financial_metrics" => {
                let params: ComparisonParams = parse_args(name, arguments)?;
                params.ranges()?;
                to_value(comparison::compare_financial_metrics(&self.store, &params).await?)
            }
            "calculate_growth_rate" => {
                let params: GrowthRateParams = parse_args(name, arguments)?;
                params.parsed_periods()?;
                to_value(growth::calculate_growth_rate(&self.store, &params).await?)
            }
            "detect_anomalies" => {
                let params: AnomalyParams = parse_args(name, arguments)?;
                params.validate()?;
                to_value(anomaly::detect_anomalies(&self.store, &params).await?)
            }
            "analyze_expense_trends" => {
                let params: DateRangeParams = parse_args(name, arguments)?;
                params.range()?;
                to_value(expenses::analyze_expense_trends(&self.store, &params).await?)
            }
            "get_expense_categories" => {
                let params: DateRangeParams = parse_args(name, arguments)?;
                params.range()?;
                to_value(expenses::get_expense_categories(&self.store, &params).await?)
            }
            "analyze_seasonal_patterns" => {
                let params: SeasonalParams = parse_args(name, arguments)?;
                params.validate()?;
                to_value(seasonal::analyze_seasonal_patterns(&self.store, &params).await?)
            }
            "get_quarterly_performance" => {
                let params: QuarterlyParams = parse_args(name, arguments)?;
                params.validate()?;
                to_value(seasonal::get_quarterly_performance(&self.store, &params).await?)
            }
            other => Err(FinsightError::Validation(format!(
                "unknown tool '{other}'; available tools: {}",
                self.names().join(", ")
            ))),
        }
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, arguments: &Value) -> Result<T> {
    serde_json::from_value(arguments.clone()).map_err(|e| {
        FinsightError::Validation(format!("invalid arguments for '{tool}': {e}"))
    })
}

fn to_value<T: serde::Serialize>(result: T) -> Result<Value> {
    serde_json::to_value(result).map_err(FinsightError::from)
}

fn build_catalog() -> Vec<ToolSpec> {
    vec![
        spec_for::<PeriodQueryParams>(
            "get_revenue_by_period",
            "Total revenue for a date range with per-period and per-source breakdowns.",
        ),
        spec_for::<PeriodQueryParams>(
            "get_expenses_by_period",
            "Total expenses for a date range with per-period, per-source, and category breakdowns.",
        ),
        spec_for::<ComparisonParams>(
            "compare_financial_metrics",
            "Compare metrics between two periods: absolute and percent change per metric.",
        ),
        spec_for::<GrowthRateParams>(
            "calculate_growth_rate",
            "Growth between consecutive periods plus a compound-rate summary.",
        ),
        spec_for::<AnomalyParams>(
            "detect_anomalies",
            "Outlier months for a metric over a lookback window, with z-scores.",
        ),
        spec_for::<DateRangeParams>(
            "analyze_expense_trends",
            "Monthly expense trend: monotonic segments and inflection points.",
        ),
        spec_for::<DateRangeParams>(
            "get_expense_categories",
            "Expense totals by account category with each category's share.",
        ),
        spec_for::<SeasonalParams>(
            "analyze_seasonal_patterns",
            "Per-calendar-month averages across years, with peak and trough months.",
        ),
        spec_for::<QuarterlyParams>(
            "get_quarterly_performance",
            "Four quarter summaries for a year, with year-over-year change when available.",
        ),
    ]
}

fn spec_for<T: JsonSchema>(name: &str, description: &str) -> ToolSpec {
    let root = schemars::schema_for!(T);
    ToolSpec {
        name: name.to_string(),
        description: description.to_string(),
        parameters: clean_schema(root),
    }
}

/// Flatten a schemars root schema into the self-contained object schema the
/// provider dialects expect: definitions inlined, generator metadata
/// stripped, nullable unions collapsed.
fn clean_schema(root: schemars::schema::RootSchema) -> Value {
    let mut value = serde_json::to_value(root).unwrap_or_else(|_| serde_json::json!({}));

    let definitions = value
        .get("definitions")
        .cloned()
        .unwrap_or(serde_json::json!({}));

    process_schema_node(&mut value, &definitions);

    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
        map.remove("definitions");
        map.remove("$defs");
    }

    value
}

fn process_schema_node(node: &mut Value, definitions: &Value) {
    match node {
        Value::Object(map) => {
            if let Some(Value::String(ref_path)) = map.get("$ref") {
                let def_name = ref_path.split('/').next_back().unwrap_or_default();
                if let Some(def) = definitions.get(def_name) {
                    let mut inlined = def.clone();
                    process_schema_node(&mut inlined, definitions);
                    *node = inlined;
                    return;
                }
            }

            map.remove("title");
            map.remove("format");

            // Collapse {"type": ["string", "null"]} into a plain type.
            if let Some(Value::Array(types)) = map.get("type") {
                if types.len() == 2 && types.contains(&serde_json::json!("null")) {
                    if let Some(real) = types.iter().find(|t| *t != &serde_json::json!("null")) {
                        let real = real.clone();
                        map.insert("type".to_string(), real);
                    }
                } else if types.len() == 1 {
                    let single = types[0].clone();
                    map.insert("type".to_string(), single);
                }
            }

            for key in ["items", "allOf", "anyOf", "oneOf", "not"] {
                if let Some(child) = map.get_mut(key) {
                    process_schema_node(child, definitions);
                }
            }

            if let Some(Value::Object(props)) = map.get_mut("properties") {
                for (_, child) in props.iter_mut() {
                    process_schema_node(child, definitions);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                process_schema_node(item, definitions);
            }
        }
        _ => {}
    }
}

/// One month of an aggregated metric, used by the analytics tools.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MonthlyPoint {
    pub year: i32,
    pub month: u32,
    pub value: Decimal,
}

/// Collapse records into a per-month series for a metric, keyed and
/// ordered by the month of `period_start`.
pub(crate) fn monthly_series(records: &[FinancialRecord], metric: Metric) -> Vec<MonthlyPoint> {
    use chrono::Datelike;

    let mut series: Vec<MonthlyPoint> = Vec::new();
    for record in records {
        let year = record.period_start.year();
        let month = record.period_start.month();
        match series.iter_mut().find(|p| p.year == year && p.month == month) {
            Some(point) => point.value += metric.of(record),
            None => series.push(MonthlyPoint {
                year,
                month,
                value: metric.of(record),
            }),
        }
    }
    series.sort_by_key(|p| (p.year, p.month));
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_catalog_lists_all_nine_tools() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let registry = ToolRegistry::new(store);
        let names = registry.names();

        for expected in [
            "get_revenue_by_period",
            "get_expenses_by_period",
            "compare_financial_metrics",
            "calculate_growth_rate",
            "detect_anomalies",
            "analyze_expense_trends",
            "get_expense_categories",
            "analyze_seasonal_patterns",
            "get_quarterly_performance",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_is_rejected() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let registry = ToolRegistry::new(store);
        let err = registry
            .execute("forecast_revenue", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, FinsightError::Validation(_)));
    }

    #[tokio::test]
    async fn test_boundary_validation_rejects_bad_arguments() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let registry = ToolRegistry::new(store);

        // Wrong date order is caught before the handler runs.
        let err = registry
            .execute(
                "get_revenue_by_period",
                &serde_json::json!({"start_date": "2024-06-01", "end_date": "2024-01-01"}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FinsightError::Validation(_)));

        // Unknown metric enum value fails deserialization.
        let err = registry
            .execute(
                "detect_anomalies",
                &serde_json::json!({"metric": "profit margin", "lookback_months": 12}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FinsightError::Validation(_)));
    }

    #[test]
    fn test_clean_schema_inlines_definitions() {
        let spec = spec_for::<AnomalyParams>("detect_anomalies", "test");
        let text = spec.parameters.to_string();
        assert!(!text.contains("$ref"));
        assert!(!text.contains("$schema"));
        assert!(text.contains("lookback_months"));
        // The Metric enum inlines as a string enum.
        assert!(text.contains("revenue"));
    }

    #[test]
    fn test_monthly_series_groups_and_orders() {
        let make = |year: i32, month: u32, revenue| FinancialRecord {
            id: format!("r-{year}-{month}"),
            source: crate::schema::SourceType::QuickBooks,
            period_start: NaiveDate::from_ymd_opt(year, month, 1).unwrap(),
            period_end: crate::utils::last_day_of_month(year, month),
            currency: "USD".to_string(),
            revenue,
            expenses: dec!(0),
            net_profit: revenue,
            raw_data: serde_json::Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let records = vec![
            make(2024, 2, dec!(10)),
            make(2024, 1, dec!(5)),
            make(2024, 2, dec!(3)),
        ];
        let series = monthly_series(&records, Metric::Revenue);
        assert_eq!(series.len(), 2);
        assert_eq!((series[0].year, series[0].month), (2024, 1));
        assert_eq!(series[1].value, dec!(13));
    }
}
