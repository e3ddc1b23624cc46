use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::SourcePriority;
use crate::error::{FinsightError, Result};
use crate::normalizer::{Normalizer, Resolution};
use crate::schema::{
    Account, AccountFilter, AccountNode, AccountValue, FinancialRecord, Page, RecordFilter,
    SortOrder, SourceType,
};
use crate::utils::PeriodSpec;
use crate::validation::ValidationIssue;

/// How an upsert landed.
#[derive(Debug, Clone)]
pub enum UpsertOutcome {
    Created,
    Updated {
        prior: FinancialRecord,
        issues: Vec<ValidationIssue>,
    },
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PeriodAggregate {
    pub period: String,
    pub revenue: Decimal,
    pub expenses: Decimal,
    pub net_profit: Decimal,
    pub count: u64,
    pub sources: Vec<SourceType>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEntry {
    pub batch_id: String,
    pub file: String,
    pub phase: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: String,
    pub issues_json: serde_json::Value,
}

/// Relational persistence for records, accounts, values, and the ingestion
/// audit trail. The store owns all writes; everything else only reads.
///
/// Upserts take a process-wide write lock: SQLite serializes writers
/// anyway, and the lock makes the read-resolve-write inside `upsert_record`
/// atomic when two ingestion workers target the same period.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    normalizer: Normalizer,
    write_lock: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl Store {
    pub async fn connect(
        db_url: &str,
        pool_size: u32,
        timeout_s: u64,
        priority: SourcePriority,
    ) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(|e| FinsightError::Configuration(format!("invalid db_url: {e}")))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(timeout_s));

        let pool = SqlitePoolOptions::new()
            .max_connections(pool_size)
            .acquire_timeout(Duration::from_secs(timeout_s))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            normalizer: Normalizer::new(priority),
            write_lock: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        };
        store.init_schema().await?;
        info!(db_url, pool_size, "store initialized");
        Ok(store)
    }

    /// In-memory store for tests. A single connection keeps the database
    /// alive for the pool's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| FinsightError::Configuration(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            normalizer: Normalizer::new(SourcePriority::default()),
            write_lock: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Additive schema setup: safe to run on every start.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .ok();

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS financial_records (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                period_start DATE NOT NULL,
                period_end DATE NOT NULL,
                currency TEXT NOT NULL,
                revenue TEXT NOT NULL,
                expenses TEXT NOT NULL,
                net_profit TEXT NOT NULL,
                raw_data TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(source, period_start, period_end, currency)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                account_type TEXT NOT NULL,
                parent_account_id TEXT,
                source TEXT NOT NULL,
                description TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_values (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                financial_record_id TEXT NOT NULL REFERENCES financial_records(id) ON DELETE CASCADE,
                account_id TEXT NOT NULL REFERENCES accounts(account_id),
                value TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE(financial_record_id, account_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingestion_audit (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id TEXT NOT NULL,
                file TEXT NOT NULL,
                phase TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                outcome TEXT NOT NULL,
                issues_json TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_records_period ON financial_records(period_start, period_end)",
            "CREATE INDEX IF NOT EXISTS idx_records_source ON financial_records(source)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_type ON accounts(account_type)",
            "CREATE INDEX IF NOT EXISTS idx_accounts_parent ON accounts(parent_account_id)",
            "CREATE INDEX IF NOT EXISTS idx_values_record ON account_values(financial_record_id)",
            "CREATE INDEX IF NOT EXISTS idx_values_account ON account_values(account_id)",
            "CREATE INDEX IF NOT EXISTS idx_audit_batch ON ingestion_audit(batch_id)",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Insert or update one record with its accounts and values in a single
    /// transaction. Cross-source writes to the same period resolve via the
    /// configured source priority; the losing side is retained as conflict
    /// attribution on the surviving row.
    pub async fn upsert_record(
        &self,
        record: &FinancialRecord,
        accounts: &[Account],
        values: &[AccountValue],
    ) -> Result<UpsertOutcome> {
        let _write_guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(
            r#"
            SELECT id, source, period_start, period_end, currency, revenue, expenses,
                   net_profit, raw_data, created_at, updated_at
            FROM financial_records
            WHERE period_start = ? AND period_end = ? AND currency = ?
            "#,
        )
        .bind(record.period_start)
        .bind(record.period_end)
        .bind(&record.currency)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| record_from_row(&row))
        .transpose()?;

        let outcome = match existing {
            None => {
                upsert_accounts(&mut tx, accounts).await?;
                insert_record_row(&mut tx, record).await?;
                replace_values(&mut tx, &record.id, values).await?;
                UpsertOutcome::Created
            }
            Some(prior) => {
                upsert_accounts(&mut tx, accounts).await?;
                match self.normalizer.resolve(record, &prior) {
                    Resolution::Replace { record: winner, issues } => {
                        // The winner takes over the row identity so batch
                        // outcomes do not depend on file order; the first
                        // write's created_at is preserved.
                        sqlx::query("DELETE FROM financial_records WHERE id = ?")
                            .bind(&prior.id)
                            .execute(&mut *tx)
                            .await?;
                        sqlx::query("DELETE FROM account_values WHERE financial_record_id = ?")
                            .bind(&prior.id)
                            .execute(&mut *tx)
                            .await?;

                        let mut winner = winner;
                        winner.created_at = prior.created_at;
                        winner.updated_at = Utc::now();
                        insert_record_row(&mut tx, &winner).await?;

                        let rehomed: Vec<AccountValue> = values
                            .iter()
                            .map(|v| AccountValue {
                                financial_record_id: winner.id.clone(),
                                account_id: v.account_id.clone(),
                                value: v.value,
                            })
                            .collect();
                        replace_values(&mut tx, &winner.id, &rehomed).await?;

                        UpsertOutcome::Updated { prior, issues }
                    }
                    Resolution::KeepExisting { record: kept, issues } => {
                        // Only the conflict attribution changes; the losing
                        // side's values are not persisted.
                        sqlx::query(
                            "UPDATE financial_records SET raw_data = ?, updated_at = ? WHERE id = ?",
                        )
                        .bind(kept.raw_data.to_string())
                        .bind(Utc::now())
                        .bind(&kept.id)
                        .execute(&mut *tx)
                        .await?;

                        UpsertOutcome::Updated { prior, issues }
                    }
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn find_records(&self, filter: &RecordFilter) -> Result<Page<FinancialRecord>> {
        let filter = filter.clone().normalized();

        let mut count_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM financial_records WHERE 1=1");
        push_record_filters(&mut count_builder, &filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .get("n");

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, source, period_start, period_end, currency, revenue, expenses, \
             net_profit, raw_data, created_at, updated_at FROM financial_records WHERE 1=1",
        );
        push_record_filters(&mut builder, &filter);

        // Sort column comes from a fixed enum, never from caller input.
        builder.push(format!(
            " ORDER BY {} {}",
            filter.sort_by.column(),
            match filter.sort_order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            }
        ));
        builder.push(" LIMIT ");
        builder.push_bind(filter.page_size as i64);
        builder.push(" OFFSET ");
        builder.push_bind(((filter.page - 1) * filter.page_size) as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            page: filter.page,
            page_size: filter.page_size,
            total: total as u64,
        })
    }

    /// Every record whose period falls inside [start, end]. Used by tools
    /// and aggregates, where pagination would only get in the way.
    pub async fn records_in_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        source: Option<SourceType>,
        currency: Option<&str>,
    ) -> Result<Vec<FinancialRecord>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, source, period_start, period_end, currency, revenue, expenses, \
             net_profit, raw_data, created_at, updated_at FROM financial_records \
             WHERE period_start >= ",
        );
        builder.push_bind(start);
        builder.push(" AND period_end <= ");
        builder.push_bind(end);
        if let Some(source) = source {
            builder.push(" AND source = ");
            builder.push_bind(source.to_string());
        }
        if let Some(currency) = currency {
            builder.push(" AND currency = ");
            builder.push_bind(currency.to_uppercase());
        }
        builder.push(" ORDER BY period_start ASC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn aggregate_period(&self, spec: &PeriodSpec) -> Result<PeriodAggregate> {
        let (start, end) = spec.bounds();
        let records = self.records_in_range(start, end, None, None).await?;

        let mut revenue = Decimal::ZERO;
        let mut expenses = Decimal::ZERO;
        let mut sources: Vec<SourceType> = Vec::new();

        for record in &records {
            revenue += record.revenue;
            expenses += record.expenses;
            if !sources.contains(&record.source) {
                sources.push(record.source);
            }
        }

        Ok(PeriodAggregate {
            period: spec.label(),
            revenue,
            expenses,
            net_profit: revenue - expenses,
            count: records.len() as u64,
            sources,
        })
    }

    pub async fn find_accounts(&self, filter: &AccountFilter) -> Result<Page<Account>> {
        let filter = filter.clone().normalized();

        let mut count_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM accounts WHERE 1=1");
        push_account_filters(&mut count_builder, &filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .get("n");

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT account_id, name, account_type, parent_account_id, source, description, \
             is_active, created_at, updated_at FROM accounts WHERE 1=1",
        );
        push_account_filters(&mut builder, &filter);
        builder.push(" ORDER BY account_id ASC LIMIT ");
        builder.push_bind(filter.page_size as i64);
        builder.push(" OFFSET ");
        builder.push_bind(((filter.page - 1) * filter.page_size) as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(account_from_row)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            page: filter.page,
            page_size: filter.page_size,
            total: total as u64,
        })
    }

    pub async fn get_account(&self, account_id: &str) -> Result<Account> {
        let row = sqlx::query(
            "SELECT account_id, name, account_type, parent_account_id, source, description, \
             is_active, created_at, updated_at FROM accounts WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FinsightError::NotFound(format!("account '{account_id}'")))?;

        account_from_row(&row)
    }

    /// Subtree rooted at `root_id`, expanded iteratively level by level.
    /// A visited set makes stray cycles in stored data harmless.
    pub async fn account_hierarchy(&self, root_id: &str) -> Result<AccountNode> {
        let root = self.get_account(root_id).await?;

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root.account_id.clone());

        // BFS collects (parents before children), then one backward pass
        // nests the flat list into a tree.
        let mut flat: Vec<AccountNode> = vec![AccountNode {
            account: root,
            children: Vec::new(),
        }];
        let mut cursor = 0;

        while cursor < flat.len() {
            let parent_id = flat[cursor].account.account_id.clone();
            let rows = sqlx::query(
                "SELECT account_id, name, account_type, parent_account_id, source, description, \
                 is_active, created_at, updated_at FROM accounts WHERE parent_account_id = ? \
                 ORDER BY account_id",
            )
            .bind(&parent_id)
            .fetch_all(&self.pool)
            .await?;

            for row in &rows {
                let child = account_from_row(row)?;
                if !visited.insert(child.account_id.clone()) {
                    continue;
                }
                flat.push(AccountNode {
                    account: child,
                    children: Vec::new(),
                });
            }
            cursor += 1;
        }

        Ok(assemble_tree(flat))
    }

    /// Expense totals grouped by account for [start, end], largest first.
    pub async fn expense_totals_by_account(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        source: Option<SourceType>,
    ) -> Result<Vec<(String, Decimal)>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT a.name AS name, v.value AS value FROM account_values v \
             JOIN accounts a ON a.account_id = v.account_id \
             JOIN financial_records r ON r.id = v.financial_record_id \
             WHERE a.account_type = 'expense' AND r.period_start >= ",
        );
        builder.push_bind(start);
        builder.push(" AND r.period_end <= ");
        builder.push_bind(end);
        if let Some(source) = source {
            builder.push(" AND r.source = ");
            builder.push_bind(source.to_string());
        }

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut totals: Vec<(String, Decimal)> = Vec::new();
        for row in rows {
            let name: String = row.get("name");
            let value = decimal_column(&row, "value")?;
            match totals.iter_mut().find(|(n, _)| *n == name) {
                Some((_, total)) => *total += value,
                None => totals.push((name, value)),
            }
        }
        totals.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(totals)
    }

    pub async fn values_for_record(&self, record_id: &str) -> Result<Vec<AccountValue>> {
        let rows = sqlx::query(
            "SELECT financial_record_id, account_id, value FROM account_values \
             WHERE financial_record_id = ? ORDER BY account_id",
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AccountValue {
                    financial_record_id: row.get("financial_record_id"),
                    account_id: row.get("account_id"),
                    value: decimal_column(row, "value")?,
                })
            })
            .collect()
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingestion_audit (batch_id, file, phase, started_at, ended_at, outcome, issues_json) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.batch_id)
        .bind(&entry.file)
        .bind(&entry.phase)
        .bind(entry.started_at)
        .bind(entry.ended_at)
        .bind(&entry.outcome)
        .bind(entry.issues_json.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_audit(&self, limit: u32) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT batch_id, file, phase, started_at, ended_at, outcome, issues_json \
             FROM ingestion_audit ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let issues_raw: Option<String> = row.get("issues_json");
                Ok(AuditEntry {
                    batch_id: row.get("batch_id"),
                    file: row.get("file"),
                    phase: row.get("phase"),
                    started_at: row.get("started_at"),
                    ended_at: row.get("ended_at"),
                    outcome: row.get("outcome"),
                    issues_json: issues_raw
                        .and_then(|raw| serde_json::from_str(&raw).ok())
                        .unwrap_or(serde_json::Value::Null),
                })
            })
            .collect()
    }

    pub async fn record_count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM financial_records")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.get("n");
        Ok(n as u64)
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn push_record_filters(builder: &mut QueryBuilder<Sqlite>, filter: &RecordFilter) {
    if let Some(source) = filter.source {
        builder.push(" AND source = ");
        builder.push_bind(source.to_string());
    }
    if let Some(start) = filter.period_start {
        builder.push(" AND period_start >= ");
        builder.push_bind(start);
    }
    if let Some(end) = filter.period_end {
        builder.push(" AND period_end <= ");
        builder.push_bind(end);
    }
    if let Some(currency) = &filter.currency {
        builder.push(" AND currency = ");
        builder.push_bind(currency.clone());
    }
    // Decimal columns are stored as text; compare numerically on both sides.
    if let Some(min) = filter.min_revenue {
        builder.push(" AND CAST(revenue AS REAL) >= ");
        builder.push_bind(decimal_to_f64(min));
    }
    if let Some(max) = filter.max_revenue {
        builder.push(" AND CAST(revenue AS REAL) <= ");
        builder.push_bind(decimal_to_f64(max));
    }
    if let Some(min) = filter.min_expenses {
        builder.push(" AND CAST(expenses AS REAL) >= ");
        builder.push_bind(decimal_to_f64(min));
    }
    if let Some(max) = filter.max_expenses {
        builder.push(" AND CAST(expenses AS REAL) <= ");
        builder.push_bind(decimal_to_f64(max));
    }
}

fn decimal_to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

fn push_account_filters(builder: &mut QueryBuilder<Sqlite>, filter: &AccountFilter) {
    if let Some(account_type) = filter.account_type {
        builder.push(" AND account_type = ");
        builder.push_bind(account_type.to_string());
    }
    if let Some(source) = filter.source {
        builder.push(" AND source = ");
        builder.push_bind(source.to_string());
    }
    if let Some(active) = filter.is_active {
        builder.push(" AND is_active = ");
        builder.push_bind(active as i64);
    }
    if let Some(fragment) = &filter.name_contains {
        builder.push(" AND LOWER(name) LIKE ");
        builder.push_bind(format!("%{}%", fragment.to_lowercase()));
    }
    if let Some(parent) = &filter.parent_account_id {
        builder.push(" AND parent_account_id = ");
        builder.push_bind(parent.clone());
    }
}

async fn insert_record_row(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record: &FinancialRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO financial_records
            (id, source, period_start, period_end, currency, revenue, expenses,
             net_profit, raw_data, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(record.source.to_string())
    .bind(record.period_start)
    .bind(record.period_end)
    .bind(&record.currency)
    .bind(record.revenue.to_string())
    .bind(record.expenses.to_string())
    .bind(record.net_profit.to_string())
    .bind(record.raw_data.to_string())
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn upsert_accounts(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    accounts: &[Account],
) -> Result<()> {
    for account in accounts {
        sqlx::query(
            r#"
            INSERT INTO accounts
                (account_id, name, account_type, parent_account_id, source, description,
                 is_active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                name = excluded.name,
                account_type = excluded.account_type,
                parent_account_id = excluded.parent_account_id,
                description = excluded.description,
                is_active = excluded.is_active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&account.account_id)
        .bind(&account.name)
        .bind(account.account_type.to_string())
        .bind(&account.parent_account_id)
        .bind(account.source.to_string())
        .bind(&account.description)
        .bind(account.is_active as i64)
        .bind(account.created_at)
        .bind(account.updated_at)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn replace_values(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    record_id: &str,
    values: &[AccountValue],
) -> Result<()> {
    sqlx::query("DELETE FROM account_values WHERE financial_record_id = ?")
        .bind(record_id)
        .execute(&mut **tx)
        .await?;

    for value in values {
        sqlx::query(
            "INSERT INTO account_values (financial_record_id, account_id, value, created_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(financial_record_id, account_id) DO UPDATE SET value = excluded.value",
        )
        .bind(record_id)
        .bind(&value.account_id)
        .bind(value.value.to_string())
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

fn decimal_column(row: &SqliteRow, column: &str) -> Result<Decimal> {
    let raw: String = row.get(column);
    Decimal::from_str(&raw)
        .map_err(|_| FinsightError::Store(format!("column {column} holds non-decimal '{raw}'")))
}

fn record_from_row(row: &SqliteRow) -> Result<FinancialRecord> {
    let source_raw: String = row.get("source");
    let raw_data: Option<String> = row.get("raw_data");

    Ok(FinancialRecord {
        id: row.get("id"),
        source: source_raw.parse()?,
        period_start: row.get("period_start"),
        period_end: row.get("period_end"),
        currency: row.get("currency"),
        revenue: decimal_column(row, "revenue")?,
        expenses: decimal_column(row, "expenses")?,
        net_profit: decimal_column(row, "net_profit")?,
        raw_data: raw_data
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn account_from_row(row: &SqliteRow) -> Result<Account> {
    let type_raw: String = row.get("account_type");
    let source_raw: String = row.get("source");
    let is_active: i64 = row.get("is_active");

    Ok(Account {
        account_id: row.get("account_id"),
        name: row.get("name"),
        account_type: type_raw.parse()?,
        parent_account_id: row.get("parent_account_id"),
        source: source_raw.parse()?,
        description: row.get("description"),
        is_active: is_active != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// Nest a BFS-ordered flat list (parents strictly before children) into a
/// tree. Walking backwards means every node's children are already attached
/// when the node itself moves under its parent.
fn assemble_tree(mut flat: Vec<AccountNode>) -> AccountNode {
    let mut index_of = std::collections::HashMap::new();
    for (i, node) in flat.iter().enumerate() {
        index_of.insert(node.account.account_id.clone(), i);
    }

    for i in (1..flat.len()).rev() {
        let node = flat.remove(i);
        let parent_index = node
            .account
            .parent_account_id
            .as_ref()
            .and_then(|p| index_of.get(p))
            .copied();
        match parent_index {
            Some(p) if p < i => flat[p].children.insert(0, node),
            // The queried root's own parent sits outside the subtree.
            _ => debug!(
                account = %node.account.account_id,
                "dropping node with unreachable parent during tree assembly"
            ),
        }
    }

    flat.remove(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AccountType;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn record(source: SourceType, month: u32, revenue: Decimal) -> FinancialRecord {
        let start = NaiveDate::from_ymd_opt(2024, month, 1).unwrap();
        let end = crate::utils::last_day_of_month(2024, month);
        FinancialRecord {
            id: crate::schema::stable_record_id(source, start, end, "USD", None),
            source,
            period_start: start,
            period_end: end,
            currency: "USD".to_string(),
            revenue,
            expenses: dec!(6000.00),
            net_profit: revenue - dec!(6000.00),
            raw_data: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn account(id: &str, account_type: AccountType, parent: Option<&str>) -> Account {
        Account {
            account_id: id.to_string(),
            name: id.to_string(),
            account_type,
            parent_account_id: parent.map(|p| p.to_string()),
            source: SourceType::QuickBooks,
            description: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_create_then_update() {
        let store = Store::in_memory().await.unwrap();
        let r = record(SourceType::QuickBooks, 1, dec!(10000.00));

        let outcome = store.upsert_record(&r, &[], &[]).await.unwrap();
        assert!(matches!(outcome, UpsertOutcome::Created));

        let outcome = store.upsert_record(&r, &[], &[]).await.unwrap();
        match outcome {
            UpsertOutcome::Updated { prior, .. } => {
                assert_eq!(prior.revenue, dec!(10000.00));
            }
            UpsertOutcome::Created => panic!("second write must be an update"),
        }
        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cross_source_conflict_prefers_priority() {
        let store = Store::in_memory().await.unwrap();

        let rootfi = record(SourceType::Rootfi, 1, dec!(14500.00));
        store.upsert_record(&rootfi, &[], &[]).await.unwrap();

        let qb = record(SourceType::QuickBooks, 1, dec!(15000.00));
        store.upsert_record(&qb, &[], &[]).await.unwrap();

        let page = store.find_records(&RecordFilter::default()).await.unwrap();
        assert_eq!(page.total, 1);
        let stored = &page.items[0];
        assert_eq!(stored.revenue, dec!(15000.00));
        assert_eq!(stored.source, SourceType::QuickBooks);

        let conflicts = stored.raw_data["conflicts"].as_array().unwrap();
        assert_eq!(conflicts[0]["source"], "rootfi");
        assert_eq!(conflicts[0]["revenue"], "14500.00");
    }

    #[tokio::test]
    async fn test_lower_priority_is_kept_out() {
        let store = Store::in_memory().await.unwrap();

        let qb = record(SourceType::QuickBooks, 1, dec!(15000.00));
        store.upsert_record(&qb, &[], &[]).await.unwrap();

        let rootfi = record(SourceType::Rootfi, 1, dec!(14500.00));
        let outcome = store.upsert_record(&rootfi, &[], &[]).await.unwrap();

        match outcome {
            UpsertOutcome::Updated { issues, .. } => {
                assert!(issues.iter().any(|i| i.code == "CONFLICT_KEPT_EXISTING"));
            }
            UpsertOutcome::Created => panic!("expected conflict handling"),
        }

        let page = store.find_records(&RecordFilter::default()).await.unwrap();
        assert_eq!(page.items[0].revenue, dec!(15000.00));
        assert_eq!(page.items[0].source, SourceType::QuickBooks);
    }

    #[tokio::test]
    async fn test_find_records_filters_and_pagination() {
        let store = Store::in_memory().await.unwrap();
        for month in 1..=6 {
            let r = record(SourceType::QuickBooks, month, dec!(1000.00) * Decimal::from(month));
            store.upsert_record(&r, &[], &[]).await.unwrap();
        }

        let filter = RecordFilter {
            min_revenue: Some(dec!(3000.00)),
            page_size: 2,
            ..Default::default()
        };
        let page = store.find_records(&filter).await.unwrap();
        assert_eq!(page.total, 4);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].revenue, dec!(3000.00));

        let page2 = store
            .find_records(&RecordFilter { page: 2, ..filter })
            .await
            .unwrap();
        assert_eq!(page2.items[0].revenue, dec!(5000.00));
    }

    #[tokio::test]
    async fn test_aggregate_period_quarter() {
        let store = Store::in_memory().await.unwrap();
        for month in 1..=12 {
            let r = record(SourceType::QuickBooks, month, dec!(10000.00));
            store.upsert_record(&r, &[], &[]).await.unwrap();
        }

        let spec = PeriodSpec::parse("2024-Q2").unwrap();
        let aggregate = store.aggregate_period(&spec).await.unwrap();
        assert_eq!(aggregate.period, "2024-Q2");
        assert_eq!(aggregate.revenue, dec!(30000.00));
        assert_eq!(aggregate.expenses, dec!(18000.00));
        assert_eq!(aggregate.net_profit, dec!(12000.00));
        assert_eq!(aggregate.count, 3);
        assert_eq!(aggregate.sources, vec![SourceType::QuickBooks]);
    }

    #[tokio::test]
    async fn test_account_hierarchy_is_cycle_safe() {
        let store = Store::in_memory().await.unwrap();
        let r = record(SourceType::QuickBooks, 1, dec!(100.00));
        let accounts = vec![
            account("qb_root", AccountType::Expense, None),
            account("qb_mid", AccountType::Expense, Some("qb_root")),
            account("qb_leaf", AccountType::Expense, Some("qb_mid")),
        ];
        store.upsert_record(&r, &accounts, &[]).await.unwrap();

        let tree = store.account_hierarchy("qb_root").await.unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].account.account_id, "qb_mid");
        assert_eq!(tree.children[0].children[0].account.account_id, "qb_leaf");

        assert!(store.account_hierarchy("qb_missing").await.is_err());
    }

    #[tokio::test]
    async fn test_values_visible_only_with_record() {
        let store = Store::in_memory().await.unwrap();
        let r = record(SourceType::QuickBooks, 1, dec!(100.00));
        let accounts = vec![account("qb_sales", AccountType::Revenue, None)];
        let values = vec![AccountValue {
            financial_record_id: r.id.clone(),
            account_id: "qb_sales".to_string(),
            value: dec!(100.00),
        }];

        store.upsert_record(&r, &accounts, &values).await.unwrap();
        let stored = store.values_for_record(&r.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, dec!(100.00));
    }

    #[tokio::test]
    async fn test_expense_totals_by_account() {
        let store = Store::in_memory().await.unwrap();
        let r = record(SourceType::QuickBooks, 1, dec!(0.00));
        let accounts = vec![
            account("qb_rent", AccountType::Expense, None),
            account("qb_payroll", AccountType::Expense, None),
        ];
        let values = vec![
            AccountValue {
                financial_record_id: r.id.clone(),
                account_id: "qb_rent".to_string(),
                value: dec!(2000.00),
            },
            AccountValue {
                financial_record_id: r.id.clone(),
                account_id: "qb_payroll".to_string(),
                value: dec!(4000.00),
            },
        ];
        store.upsert_record(&r, &accounts, &values).await.unwrap();

        let totals = store
            .expense_totals_by_account(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(totals[0].0, "qb_payroll");
        assert_eq!(totals[0].1, dec!(4000.00));
    }

    #[tokio::test]
    async fn test_audit_round_trip() {
        let store = Store::in_memory().await.unwrap();
        let entry = AuditEntry {
            batch_id: "batch-1".to_string(),
            file: "a.json".to_string(),
            phase: "persist".to_string(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
            outcome: "completed".to_string(),
            issues_json: json!({"issues": 0}),
        };
        store.append_audit(&entry).await.unwrap();

        let entries = store.recent_audit(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].batch_id, "batch-1");
        assert_eq!(entries[0].outcome, "completed");
    }
}
