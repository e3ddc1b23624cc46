use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::IngestConfig;
use crate::error::{FinsightError, Result};
use crate::normalizer::{NormalizedRecord, Normalizer};
use crate::parsers::{detect_source, parse_json};
use crate::schema::SourceType;
use crate::store::{AuditEntry, Store, UpsertOutcome};
use crate::validation::{Severity, ValidationIssue, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    PartiallyCompleted,
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IngestionStatus::Pending => "pending",
            IngestionStatus::Processing => "processing",
            IngestionStatus::Completed => "completed",
            IngestionStatus::Failed => "failed",
            IngestionStatus::PartiallyCompleted => "partially_completed",
        };
        write!(f, "{s}")
    }
}

/// Outcome of processing one file.
#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub file_name: String,
    pub source: Option<SourceType>,
    pub status: IngestionStatus,
    pub records_processed: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_rejected: usize,
    pub validation: ValidationResult,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

impl FileResult {
    fn failed(file_name: String, source: Option<SourceType>, message: String) -> Self {
        Self {
            file_name,
            source,
            status: IngestionStatus::Failed,
            records_processed: 0,
            records_created: 0,
            records_updated: 0,
            records_rejected: 0,
            validation: ValidationResult::new(),
            error_message: Some(message),
            duration_ms: 0,
        }
    }
}

/// Outcome of a batch of files.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub status: IngestionStatus,
    pub files_processed: usize,
    pub files_successful: usize,
    pub files_failed: usize,
    pub total_records_processed: usize,
    pub total_records_created: usize,
    pub total_records_updated: usize,
    pub file_results: Vec<FileResult>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub batch: Option<BatchResult>,
    pub recent_audit: Vec<AuditEntry>,
}

/// Drives detect -> parse -> validate -> normalize -> persist for single
/// files and batches, with bounded parallelism and per-file isolation.
pub struct IngestionService {
    store: Arc<Store>,
    normalizer: Normalizer,
    config: IngestConfig,
    batches: Arc<RwLock<HashMap<String, BatchResult>>>,
}

impl IngestionService {
    pub fn new(store: Arc<Store>, normalizer: Normalizer, config: IngestConfig) -> Self {
        Self {
            store,
            normalizer,
            config,
            batches: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Ingest one file. Parse and validation failures surface in the
    /// result; only transient store errors are retried.
    pub async fn ingest_file(
        &self,
        path: impl AsRef<Path>,
        source_hint: Option<SourceType>,
    ) -> FileResult {
        self.ingest_file_inner(path.as_ref(), source_hint, "single").await
    }

    async fn ingest_file_inner(
        &self,
        path: &Path,
        source_hint: Option<SourceType>,
        batch_id: &str,
    ) -> FileResult {
        let started = Utc::now();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());

        info!(file = %file_name, "starting ingestion");

        let mut result = match self.process_file(path, source_hint).await {
            Ok(result) => result,
            Err(err) => {
                error!(file = %file_name, error = %err, "ingestion failed");
                FileResult::failed(file_name.clone(), source_hint, err.to_string())
            }
        };

        result.file_name = file_name.clone();
        result.duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;

        let audit = AuditEntry {
            batch_id: batch_id.to_string(),
            file: file_name.clone(),
            phase: "ingest".to_string(),
            started_at: started,
            ended_at: Utc::now(),
            outcome: result.status.to_string(),
            issues_json: serde_json::json!({
                "processed": result.records_processed,
                "created": result.records_created,
                "updated": result.records_updated,
                "rejected": result.records_rejected,
                "quality_score": result.validation.quality_score,
                "issues": result.validation.issues.len(),
                "error": result.error_message,
            }),
        };
        if let Err(err) = self.store.append_audit(&audit).await {
            warn!(file = %file_name, error = %err, "failed to append audit entry");
        }

        info!(
            file = %file_name,
            status = ?result.status,
            created = result.records_created,
            updated = result.records_updated,
            rejected = result.records_rejected,
            duration_ms = result.duration_ms,
            "completed ingestion"
        );

        result
    }

    async fn process_file(
        &self,
        path: &Path,
        source_hint: Option<SourceType>,
    ) -> Result<FileResult> {
        let raw = tokio::fs::read_to_string(path).await?;
        let json: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| FinsightError::Parse(format!("malformed JSON in {}: {e}", path.display())))?;

        let file_name = path.file_name().and_then(|n| n.to_str());
        let source = match source_hint {
            Some(source) => source,
            None => detect_source(file_name, &json)?,
        };

        let parsed = parse_json(source, &json)?;
        let normalized = self.normalizer.normalize(&parsed);

        let mut result = FileResult {
            file_name: String::new(),
            source: Some(source),
            status: IngestionStatus::Processing,
            records_processed: normalized.len(),
            records_created: 0,
            records_updated: 0,
            records_rejected: 0,
            validation: ValidationResult::new(),
            error_message: None,
            duration_ms: 0,
        };

        // File-level parser issues (skipped subtrees, defaulted currency)
        // are reported once here; they do not gate individual records.
        for issue in &parsed.issues {
            result.validation.push(issue.clone());
        }

        // Accepted records commit even when later records in the same file
        // are rejected; failures are reported per record.
        for bundle in &normalized {
            for issue in &bundle.validation.issues {
                result.validation.push(issue.clone());
            }

            if bundle.validation.has_blocking_issues() {
                result.records_rejected += 1;
                continue;
            }

            match self.persist_with_retry(bundle).await {
                Ok(UpsertOutcome::Created) => result.records_created += 1,
                Ok(UpsertOutcome::Updated { issues, .. }) => {
                    result.records_updated += 1;
                    for issue in issues {
                        result.validation.push(issue);
                    }
                }
                Err(err) => {
                    result.records_rejected += 1;
                    result.validation.push(
                        ValidationIssue::new(
                            Severity::Error,
                            "PERSIST_FAILED",
                            format!(
                                "Record {}..{} could not be stored: {err}",
                                bundle.record.period_start, bundle.record.period_end
                            ),
                        )
                        .field("store"),
                    );
                }
            }
        }

        result.status = if normalized.is_empty() {
            result.error_message = Some("file contained no financial records".to_string());
            IngestionStatus::Failed
        } else if result.records_rejected == 0 {
            IngestionStatus::Completed
        } else if result.records_created + result.records_updated > 0 {
            IngestionStatus::PartiallyCompleted
        } else {
            result.error_message = Some(format!(
                "all {} records failed validation or persistence",
                result.records_processed
            ));
            IngestionStatus::Failed
        };

        Ok(result)
    }

    /// Exponential backoff applies only to transient store errors; parse
    /// and validation failures never retry.
    async fn persist_with_retry(&self, bundle: &NormalizedRecord) -> Result<UpsertOutcome> {
        let max_attempts = self.config.retry_max.max(1);

        for attempt in 1..=max_attempts {
            match self
                .store
                .upsert_record(&bundle.record, &bundle.accounts, &bundle.values)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_transient_store() && attempt < max_attempts => {
                    let delay = self.config.backoff_base_ms * 2u64.pow(attempt - 1);
                    warn!(
                        attempt,
                        delay_ms = delay,
                        error = %err,
                        "transient store error, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(FinsightError::StoreUnavailable(format!(
            "store still unavailable after {max_attempts} attempts"
        )))
    }

    /// Ingest several files with a bounded worker pool. Per-file failures
    /// never abort the batch.
    pub async fn ingest_batch(
        &self,
        paths: Vec<String>,
        source_hints: Option<Vec<Option<SourceType>>>,
    ) -> BatchResult {
        let batch_id = uuid::Uuid::new_v4().to_string();
        self.run_batch(batch_id, paths, source_hints).await
    }

    /// Enqueue a batch for background processing and return its id
    /// immediately; progress is visible through `status`.
    pub async fn ingest_batch_async(
        self: &Arc<Self>,
        paths: Vec<String>,
        source_hints: Option<Vec<Option<SourceType>>>,
    ) -> String {
        let batch_id = uuid::Uuid::new_v4().to_string();

        let pending = BatchResult {
            batch_id: batch_id.clone(),
            status: IngestionStatus::Pending,
            files_processed: paths.len(),
            files_successful: 0,
            files_failed: 0,
            total_records_processed: 0,
            total_records_created: 0,
            total_records_updated: 0,
            file_results: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error_summary: None,
        };
        self.batches.write().await.insert(batch_id.clone(), pending);

        let service = Arc::clone(self);
        let id = batch_id.clone();
        tokio::spawn(async move {
            service.run_batch(id, paths, source_hints).await;
        });

        batch_id
    }

    async fn run_batch(
        &self,
        batch_id: String,
        paths: Vec<String>,
        source_hints: Option<Vec<Option<SourceType>>>,
    ) -> BatchResult {
        let started_at = Utc::now();
        info!(batch_id = %batch_id, files = paths.len(), "starting batch ingestion");

        {
            let mut batches = self.batches.write().await;
            if let Some(entry) = batches.get_mut(&batch_id) {
                entry.status = IngestionStatus::Processing;
            }
        }

        let jobs: Vec<(usize, String, Option<SourceType>)> = paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| {
                let hint = source_hints
                    .as_ref()
                    .and_then(|hints| hints.get(i).copied())
                    .flatten();
                (i, path, hint)
            })
            .collect();

        let mut indexed: Vec<(usize, FileResult)> = stream::iter(jobs)
            .map(|(i, path, hint)| {
                let batch_id = batch_id.clone();
                async move {
                    let result = self
                        .ingest_file_inner(Path::new(&path), hint, &batch_id)
                        .await;
                    (i, result)
                }
            })
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;
        indexed.sort_by_key(|(i, _)| *i);

        let file_results: Vec<FileResult> = indexed.into_iter().map(|(_, r)| r).collect();

        let files_successful = file_results
            .iter()
            .filter(|r| {
                matches!(
                    r.status,
                    IngestionStatus::Completed | IngestionStatus::PartiallyCompleted
                )
            })
            .count();
        let files_failed = file_results.len() - files_successful;

        let status = if file_results.is_empty() {
            IngestionStatus::Completed
        } else if files_failed == 0 {
            IngestionStatus::Completed
        } else if files_successful == 0 {
            IngestionStatus::Failed
        } else {
            IngestionStatus::PartiallyCompleted
        };

        let error_summary = match status {
            IngestionStatus::Failed => {
                Some(format!("all {files_failed} files failed to process"))
            }
            IngestionStatus::PartiallyCompleted => Some(format!(
                "{files_failed} of {} files failed",
                file_results.len()
            )),
            _ => None,
        };

        let result = BatchResult {
            batch_id: batch_id.clone(),
            status,
            files_processed: file_results.len(),
            files_successful,
            files_failed,
            total_records_processed: file_results.iter().map(|r| r.records_processed).sum(),
            total_records_created: file_results.iter().map(|r| r.records_created).sum(),
            total_records_updated: file_results.iter().map(|r| r.records_updated).sum(),
            file_results,
            started_at,
            completed_at: Some(Utc::now()),
            error_summary,
        };

        self.batches
            .write()
            .await
            .insert(batch_id.clone(), result.clone());

        info!(
            batch_id = %batch_id,
            status = ?result.status,
            successful = result.files_successful,
            failed = result.files_failed,
            "completed batch ingestion"
        );

        result
    }

    pub async fn status(&self, batch_id: Option<&str>) -> Result<StatusReport> {
        let batch = match batch_id {
            Some(id) => {
                let batches = self.batches.read().await;
                Some(batches.get(id).cloned().ok_or_else(|| {
                    FinsightError::NotFound(format!("batch '{id}' is not known"))
                })?)
            }
            None => None,
        };

        let recent_audit = self.store.recent_audit(10).await?;
        Ok(StatusReport {
            batch,
            recent_audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourcePriority;
    use serde_json::json;
    use std::io::Write;

    fn service(store: Arc<Store>) -> Arc<IngestionService> {
        Arc::new(IngestionService::new(
            store,
            Normalizer::new(SourcePriority::default()),
            IngestConfig {
                workers: 4,
                retry_max: 3,
                backoff_base_ms: 10,
            },
        ))
    }

    fn write_temp(dir: &tempfile::TempDir, name: &str, value: &serde_json::Value) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(value.to_string().as_bytes()).unwrap();
        path.to_string_lossy().to_string()
    }

    fn rootfi_doc(month: u32, revenue: f64) -> serde_json::Value {
        let end = crate::utils::last_day_of_month(2024, month);
        json!({
            "data": [{
                "rootfi_id": month,
                "period_start": format!("2024-{month:02}-01"),
                "period_end": end.format("%Y-%m-%d").to_string(),
                "currency_id": "USD",
                "revenue": [{"name": "Sales", "value": revenue}],
                "operating_expenses": [{"name": "Rent", "value": 100.0}]
            }]
        })
    }

    #[tokio::test]
    async fn test_ingest_file_counts_add_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let service = service(store.clone());

        let path = write_temp(&dir, "rootfi_jan.json", &rootfi_doc(1, 1000.0));
        let result = service.ingest_file(&path, None).await;

        assert_eq!(result.status, IngestionStatus::Completed);
        assert_eq!(
            result.records_processed,
            result.records_created + result.records_updated + result.records_rejected
        );
        assert_eq!(result.records_created, 1);
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reingest_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let service = service(store.clone());

        let path = write_temp(&dir, "rootfi_jan.json", &rootfi_doc(1, 1000.0));
        let first = service.ingest_file(&path, None).await;
        assert_eq!(first.records_created, 1);

        let second = service.ingest_file(&path, None).await;
        assert_eq!(second.records_created, 0);
        assert_eq!(second.records_updated, 1);
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_record_is_rejected_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let service = service(store.clone());

        // Reported net profit of 50 disagrees with 100 - 40.
        let doc = json!({
            "data": [{
                "rootfi_id": 9,
                "period_start": "2024-01-01",
                "period_end": "2024-01-31",
                "currency_id": "USD",
                "revenue": [{"name": "Sales", "value": 100.0}],
                "operating_expenses": [{"name": "Rent", "value": 40.0}],
                "net_profit": 50.0
            }]
        });
        let path = write_temp(&dir, "rootfi_bad.json", &doc);
        let result = service.ingest_file(&path, None).await;

        assert_eq!(result.status, IngestionStatus::Failed);
        assert_eq!(result.records_rejected, 1);
        assert!(result.validation.issues.iter().any(|i| i.code == "BAL_EQ"));
        assert_eq!(store.record_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_fails_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let service = service(store);

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let result = service.ingest_file(&path, None).await;
        assert_eq!(result.status, IngestionStatus::Failed);
        assert!(result.error_message.unwrap().contains("malformed JSON"));
    }

    #[tokio::test]
    async fn test_batch_mixes_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let service = service(store);

        let good = write_temp(&dir, "rootfi_feb.json", &rootfi_doc(2, 2000.0));
        let bad = dir.path().join("missing.json").to_string_lossy().to_string();

        let batch = service.ingest_batch(vec![good, bad], None).await;
        assert_eq!(batch.status, IngestionStatus::PartiallyCompleted);
        assert_eq!(batch.files_successful, 1);
        assert_eq!(batch.files_failed, 1);
        assert!(batch.error_summary.unwrap().contains("1 of 2"));
    }

    #[tokio::test]
    async fn test_empty_batch_completes_with_zero_totals() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let service = service(store);

        let batch = service.ingest_batch(Vec::new(), None).await;
        assert_eq!(batch.status, IngestionStatus::Completed);
        assert_eq!(batch.files_processed, 0);
        assert_eq!(batch.total_records_created, 0);
    }

    #[tokio::test]
    async fn test_async_batch_is_trackable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().await.unwrap());
        let service = service(store);

        let path = write_temp(&dir, "rootfi_mar.json", &rootfi_doc(3, 3000.0));
        let batch_id = service.ingest_batch_async(vec![path], None).await;

        // Poll until the background task finishes.
        for _ in 0..50 {
            let report = service.status(Some(&batch_id)).await.unwrap();
            if let Some(batch) = &report.batch {
                if batch.status == IngestionStatus::Completed {
                    assert_eq!(batch.total_records_created, 1);
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("async batch never completed");
    }

    #[tokio::test]
    async fn test_status_unknown_batch_errors() {
        let store = Arc::new(Store::in_memory().await.unwrap());
        let service = service(store);
        assert!(service.status(Some("nope")).await.is_err());
    }
}
