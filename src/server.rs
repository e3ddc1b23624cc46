use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::agent::Agent;
use crate::config::Config;
use crate::error::FinsightError;
use crate::ingestion::IngestionService;
use crate::insights::{InsightKind, InsightParams, InsightsEngine};
use crate::schema::{AccountFilter, RecordFilter, SortField, SortOrder, SourceType};
use crate::store::Store;
use crate::utils::PeriodSpec;

/// Process-lifetime components injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub ingestion: Arc<IngestionService>,
    pub agent: Option<Arc<Agent>>,
    pub insights: Arc<InsightsEngine>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/data/ingest", post(ingest))
        .route("/data/ingest/batch", post(ingest_batch))
        .route("/data/status", get(ingest_status))
        .route("/financial-data", get(financial_data))
        .route("/financial-data/:period", get(financial_data_aggregate))
        .route("/accounts", get(accounts))
        .route("/accounts/:id", get(account_by_id))
        .route("/accounts/:id/hierarchy", get(account_hierarchy))
        .route("/query", post(query))
        .route("/insights/:kind", get(insights))
        .route("/insights/cache", delete(clear_insight_cache))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let bind_addr = format!("{}:{}", state.config.host, state.config.port);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP server listening on {bind_addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Boundary error envelope: stable kind, human message, correlation id.
struct ApiError(FinsightError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = match &err {
            FinsightError::Validation(_)
            | FinsightError::UnknownDialect(_)
            | FinsightError::Parse(_) => StatusCode::BAD_REQUEST,
            FinsightError::NotFound(_) => StatusCode::NOT_FOUND,
            FinsightError::Conflict(_) => StatusCode::CONFLICT,
            FinsightError::LlmRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            FinsightError::StoreUnavailable(_) | FinsightError::LlmUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            FinsightError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let correlation_id = match &err {
            FinsightError::Internal { correlation_id, .. } => correlation_id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };

        let body = json!({
            "error": {
                "kind": err.kind(),
                "message": err.to_string(),
                "correlation_id": correlation_id,
            }
        });

        (status, Json(body)).into_response()
    }
}

impl From<FinsightError> for ApiError {
    fn from(err: FinsightError) -> Self {
        ApiError(err)
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn health_detailed(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let store_ok = state.store.ping().await.is_ok();
    let record_count = state.store.record_count().await.unwrap_or(0);

    Ok(Json(json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "store": {"reachable": store_ok, "records": record_count},
        "llm": {
            "configured": state.agent.is_some(),
            "provider": state.config.llm.provider.to_string(),
        },
    })))
}

#[derive(Deserialize)]
struct IngestRequest {
    file_path: String,
    source_type: Option<String>,
}

async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let hint = parse_hint(request.source_type.as_deref())?;
    let result = state.ingestion.ingest_file(&request.file_path, hint).await;
    Ok(Json(serde_json::to_value(result).map_err(FinsightError::from)?))
}

#[derive(Deserialize)]
struct BatchIngestRequest {
    file_paths: Vec<String>,
    source_types: Option<Vec<Option<String>>>,
    #[serde(default)]
    r#async: bool,
}

async fn ingest_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchIngestRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let hints = match &request.source_types {
        Some(raw) => Some(
            raw.iter()
                .map(|s| parse_hint(s.as_deref()))
                .collect::<std::result::Result<Vec<_>, _>>()?,
        ),
        None => None,
    };

    if request.r#async {
        let batch_id = state
            .ingestion
            .ingest_batch_async(request.file_paths, hints)
            .await;
        return Ok(Json(json!({"batch_id": batch_id, "status": "pending"})));
    }

    let result = state.ingestion.ingest_batch(request.file_paths, hints).await;
    Ok(Json(serde_json::to_value(result).map_err(FinsightError::from)?))
}

#[derive(Deserialize)]
struct StatusQuery {
    batch_id: Option<String>,
}

async fn ingest_status(
    State(state): State<AppState>,
    Query(params): Query<StatusQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let report = state.ingestion.status(params.batch_id.as_deref()).await?;
    Ok(Json(serde_json::to_value(report).map_err(FinsightError::from)?))
}

#[derive(Deserialize)]
struct RecordQuery {
    source: Option<String>,
    period_start: Option<chrono::NaiveDate>,
    period_end: Option<chrono::NaiveDate>,
    currency: Option<String>,
    min_revenue: Option<rust_decimal::Decimal>,
    max_revenue: Option<rust_decimal::Decimal>,
    min_expenses: Option<rust_decimal::Decimal>,
    max_expenses: Option<rust_decimal::Decimal>,
    sort_by: Option<SortField>,
    sort_order: Option<SortOrder>,
    page: Option<u32>,
    page_size: Option<u32>,
}

async fn financial_data(
    State(state): State<AppState>,
    Query(params): Query<RecordQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let source = match params.source.as_deref() {
        Some(raw) => Some(raw.parse::<SourceType>()?),
        None => None,
    };

    let filter = RecordFilter {
        source,
        period_start: params.period_start,
        period_end: params.period_end,
        currency: params.currency,
        min_revenue: params.min_revenue,
        max_revenue: params.max_revenue,
        min_expenses: params.min_expenses,
        max_expenses: params.max_expenses,
        sort_by: params.sort_by.unwrap_or(SortField::PeriodStart),
        sort_order: params.sort_order.unwrap_or(SortOrder::Asc),
        page: params.page.unwrap_or(1),
        page_size: params.page_size.unwrap_or(20),
    };

    let page = state.store.find_records(&filter).await?;
    Ok(Json(serde_json::to_value(page).map_err(FinsightError::from)?))
}

async fn financial_data_aggregate(
    State(state): State<AppState>,
    Path(period): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let spec = PeriodSpec::parse(&period)?;
    let aggregate = state.store.aggregate_period(&spec).await?;
    Ok(Json(serde_json::to_value(aggregate).map_err(FinsightError::from)?))
}

#[derive(Deserialize)]
struct AccountQuery {
    account_type: Option<String>,
    source: Option<String>,
    is_active: Option<bool>,
    name_contains: Option<String>,
    parent_account_id: Option<String>,
    page: Option<u32>,
    page_size: Option<u32>,
}

async fn accounts(
    State(state): State<AppState>,
    Query(params): Query<AccountQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let filter = AccountFilter {
        account_type: params
            .account_type
            .as_deref()
            .map(|t| t.parse())
            .transpose()?,
        source: params.source.as_deref().map(|s| s.parse()).transpose()?,
        is_active: params.is_active,
        name_contains: params.name_contains,
        parent_account_id: params.parent_account_id,
        page: params.page.unwrap_or(1),
        page_size: params.page_size.unwrap_or(50),
    };

    let page = state.store.find_accounts(&filter).await?;
    Ok(Json(serde_json::to_value(page).map_err(FinsightError::from)?))
}

async fn account_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let account = state.store.get_account(&id).await?;
    Ok(Json(serde_json::to_value(account).map_err(FinsightError::from)?))
}

async fn account_hierarchy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let tree = state.store.account_hierarchy(&id).await?;
    Ok(Json(serde_json::to_value(tree).map_err(FinsightError::from)?))
}

#[derive(Deserialize)]
struct QueryRequest {
    query: String,
    conversation_id: Option<String>,
    max_iterations: Option<u32>,
}

async fn query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let agent = state.agent.as_ref().ok_or_else(|| {
        FinsightError::Configuration(
            "no LLM provider configured; natural-language queries are disabled".to_string(),
        )
    })?;

    if request.query.trim().is_empty() {
        return Err(FinsightError::Validation("query must not be empty".to_string()).into());
    }

    let max_iterations = request.max_iterations.unwrap_or(5).min(20);
    let deadline = Duration::from_secs(state.config.query_timeout_s);

    let reply = tokio::time::timeout(
        deadline,
        agent.process_query(
            &request.query,
            request.conversation_id.as_deref(),
            max_iterations,
        ),
    )
    .await
    .map_err(|_| {
        FinsightError::Internal {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            message: format!("query exceeded the {}s deadline", deadline.as_secs()),
        }
    })??;

    Ok(Json(serde_json::to_value(reply).map_err(FinsightError::from)?))
}

async fn insights(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(params): Query<InsightParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind: InsightKind = kind.parse()?;
    let insight = state.insights.generate(kind, &params).await?;
    Ok(Json(serde_json::to_value(insight).map_err(FinsightError::from)?))
}

async fn clear_insight_cache(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cleared = state.insights.clear_cache().await;
    Json(json!({"cleared": cleared}))
}

fn parse_hint(raw: Option<&str>) -> std::result::Result<Option<SourceType>, ApiError> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<SourceType>())
        .transpose()
        .map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (
                FinsightError::Validation("x".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                FinsightError::NotFound("x".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (
                FinsightError::Conflict("x".to_string()),
                StatusCode::CONFLICT,
            ),
            (
                FinsightError::LlmRateLimited { retry_after_s: None },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                FinsightError::StoreUnavailable("x".to_string()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                FinsightError::Configuration("x".to_string()),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (FinsightError::internal("x"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            let response = ApiError(err).into_response();
            assert_eq!(response.status(), expected);
        }
    }
}
