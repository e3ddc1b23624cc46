use chrono::Utc;
use serde_json::json;
use tracing::info;

use crate::config::SourcePriority;
use crate::parsers::ParsedFile;
use crate::schema::{
    balance_tolerance, round_money, Account, AccountValue, FinancialRecord,
};
use crate::validation::{Severity, ValidationIssue, ValidationResult, Validator};

/// One persistence-ready record with the accounts and values it references
/// and the validation verdict that decides whether it may be stored.
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    pub record: FinancialRecord,
    pub accounts: Vec<Account>,
    pub values: Vec<AccountValue>,
    pub validation: ValidationResult,
}

/// Why two records covering the same period disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictKind {
    Revenue,
    Expenses,
    Currency,
}

#[derive(Debug, Clone)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub message: String,
}

/// Maps parser output into unified entities and decides between records
/// that cover the same (period_start, period_end, currency) key.
#[derive(Debug, Clone)]
pub struct Normalizer {
    priority: SourcePriority,
    validator: Validator,
}

impl Normalizer {
    pub fn new(priority: SourcePriority) -> Self {
        Self {
            priority,
            validator: Validator::new(),
        }
    }

    pub fn priority(&self) -> &SourcePriority {
        &self.priority
    }

    /// Turn one parsed file into per-record normalized bundles. Each record
    /// is validated against the rule set together with the accounts and
    /// values it references.
    pub fn normalize(&self, parsed: &ParsedFile) -> Vec<NormalizedRecord> {
        let now = Utc::now();

        let accounts: Vec<Account> = parsed
            .accounts
            .iter()
            .map(|draft| Account {
                account_id: draft.account_id.clone(),
                name: draft.name.clone(),
                account_type: draft.account_type,
                parent_account_id: draft.parent_account_id.clone(),
                source: draft.source,
                description: draft.description.clone(),
                is_active: draft.is_active,
                created_at: now,
                updated_at: now,
            })
            .collect();

        let hierarchy_validation = self.validator.validate_hierarchy(&accounts);

        parsed
            .records
            .iter()
            .map(|draft| {
                let id = match draft.raw_data.get("record_id").and_then(|v| v.as_str()) {
                    Some(id) => id.to_string(),
                    None => draft.record_id(),
                };

                let revenue = round_money(draft.revenue);
                let expenses = round_money(draft.expenses);
                let net_profit = draft
                    .net_profit
                    .map(round_money)
                    .unwrap_or(revenue - expenses);

                let record = FinancialRecord {
                    id: id.clone(),
                    source: draft.source,
                    period_start: draft.period_start,
                    period_end: draft.period_end,
                    currency: draft.currency.to_uppercase(),
                    revenue,
                    expenses,
                    net_profit,
                    raw_data: draft.raw_data.clone(),
                    created_at: now,
                    updated_at: now,
                };

                let values: Vec<AccountValue> = parsed
                    .values
                    .iter()
                    .filter(|v| v.financial_record_id == id)
                    .map(|v| AccountValue {
                        financial_record_id: v.financial_record_id.clone(),
                        account_id: v.account_id.clone(),
                        value: round_money(v.value),
                    })
                    .collect();

                let referenced: Vec<Account> = accounts
                    .iter()
                    .filter(|a| {
                        values.iter().any(|v| v.account_id == a.account_id)
                            || is_ancestor_of_referenced(a, &values, &accounts)
                    })
                    .cloned()
                    .collect();

                // File-level parser issues are reported once by the
                // orchestrator; a skipped subtree elsewhere in the file must
                // not reject this record.
                let mut validation = ValidationResult::new();
                validation.merge(self.validator.validate_record(&record));
                validation.merge(hierarchy_validation.clone());
                validation.merge(self.validator.validate_values(&values, &record, &accounts));

                NormalizedRecord {
                    record,
                    accounts: referenced,
                    values,
                    validation,
                }
            })
            .collect()
    }

    /// Two records covering the same key conflict when their totals differ
    /// beyond tolerance or their currencies disagree after normalization.
    pub fn detect_conflicts(a: &FinancialRecord, b: &FinancialRecord) -> Vec<Conflict> {
        let tolerance = balance_tolerance();
        let mut conflicts = Vec::new();

        if (a.revenue - b.revenue).abs() > tolerance {
            conflicts.push(Conflict {
                kind: ConflictKind::Revenue,
                message: format!(
                    "revenue conflict: {}={}, {}={}",
                    a.source, a.revenue, b.source, b.revenue
                ),
            });
        }

        if (a.expenses - b.expenses).abs() > tolerance {
            conflicts.push(Conflict {
                kind: ConflictKind::Expenses,
                message: format!(
                    "expense conflict: {}={}, {}={}",
                    a.source, a.expenses, b.source, b.expenses
                ),
            });
        }

        if a.currency != b.currency {
            conflicts.push(Conflict {
                kind: ConflictKind::Currency,
                message: format!(
                    "currency conflict: {}={}, {}={}",
                    a.source, a.currency, b.source, b.currency
                ),
            });
        }

        conflicts
    }

    /// Resolve an incoming record against one already persisted for the
    /// same key. The higher-priority source wins; the loser is retained as
    /// an attribution entry under `raw_data.conflicts`.
    pub fn resolve(
        &self,
        incoming: &FinancialRecord,
        existing: &FinancialRecord,
    ) -> Resolution {
        if incoming.source == existing.source {
            return Resolution::Replace {
                record: carry_conflicts(incoming.clone(), existing),
                issues: Vec::new(),
            };
        }

        let conflicts = Self::detect_conflicts(incoming, existing);
        let incoming_priority = self.priority.of(incoming.source);
        let existing_priority = self.priority.of(existing.source);

        if incoming_priority > existing_priority {
            let mut winner = carry_conflicts(incoming.clone(), existing);
            push_conflict_entry(&mut winner, existing, incoming, &conflicts);
            reconcile_net_profit(&mut winner);
            info!(
                period_start = %winner.period_start,
                winner = %incoming.source,
                loser = %existing.source,
                conflicts = conflicts.len(),
                "conflict resolved toward incoming source"
            );
            Resolution::Replace {
                record: winner,
                issues: conflict_issues(&conflicts, incoming.source),
            }
        } else {
            let mut kept = existing.clone();
            push_conflict_entry(&mut kept, incoming, existing, &conflicts);
            let mut issues = conflict_issues(&conflicts, existing.source);
            issues.push(
                ValidationIssue::new(
                    Severity::Info,
                    "CONFLICT_KEPT_EXISTING",
                    format!(
                        "Kept {} record for {}..{} over lower-priority {} data",
                        existing.source, existing.period_start, existing.period_end, incoming.source
                    ),
                )
                .field("source")
                .value(incoming.source),
            );
            Resolution::KeepExisting {
                record: kept,
                issues,
            }
        }
    }
}

/// Outcome of resolving an incoming record against a persisted one.
#[derive(Debug, Clone)]
pub enum Resolution {
    Replace {
        record: FinancialRecord,
        issues: Vec<ValidationIssue>,
    },
    KeepExisting {
        record: FinancialRecord,
        issues: Vec<ValidationIssue>,
    },
}

fn is_ancestor_of_referenced(
    account: &Account,
    values: &[AccountValue],
    accounts: &[Account],
) -> bool {
    // Walk up from every valued account; parents of referenced accounts
    // ride along so the stored forest stays connected.
    for value in values {
        let mut current = accounts.iter().find(|a| a.account_id == value.account_id);
        let mut hops = 0;
        while let Some(node) = current {
            if node
                .parent_account_id
                .as_deref()
                .is_some_and(|p| p == account.account_id)
            {
                return true;
            }
            hops += 1;
            if hops > accounts.len() {
                break;
            }
            current = node
                .parent_account_id
                .as_deref()
                .and_then(|p| accounts.iter().find(|a| a.account_id == p));
        }
    }
    false
}

/// Preserve any conflict attributions already accumulated on the record
/// being replaced.
fn carry_conflicts(mut incoming: FinancialRecord, existing: &FinancialRecord) -> FinancialRecord {
    if let Some(prior) = existing.raw_data.get("conflicts").and_then(|c| c.as_array()) {
        if !prior.is_empty() {
            let entries = incoming.raw_data["conflicts"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            let mut merged = prior.clone();
            merged.extend(entries);
            incoming.raw_data["conflicts"] = serde_json::Value::Array(merged);
        }
    }
    incoming
}

fn push_conflict_entry(
    winner: &mut FinancialRecord,
    loser: &FinancialRecord,
    winner_values: &FinancialRecord,
    conflicts: &[Conflict],
) {
    if conflicts.is_empty() {
        return;
    }

    let entry = json!({
        "source": loser.source,
        "revenue": loser.revenue.to_string(),
        "expenses": loser.expenses.to_string(),
        "net_profit": loser.net_profit.to_string(),
        "currency": loser.currency,
        "revenue_delta": (winner_values.revenue - loser.revenue).to_string(),
        "expenses_delta": (winner_values.expenses - loser.expenses).to_string(),
        "kinds": conflicts.iter().map(|c| c.message.clone()).collect::<Vec<_>>(),
    });

    match winner.raw_data.get_mut("conflicts") {
        Some(serde_json::Value::Array(entries)) => entries.push(entry),
        _ => {
            winner.raw_data["conflicts"] = json!([entry]);
        }
    }
}

/// Conflict findings as validation issues, tagged with the source whose
/// values were kept.
fn conflict_issues(
    conflicts: &[Conflict],
    winning_source: crate::schema::SourceType,
) -> Vec<ValidationIssue> {
    conflicts
        .iter()
        .map(|conflict| {
            let (severity, code) = match conflict.kind {
                ConflictKind::Revenue => (Severity::Warning, "REVENUE_CONFLICT"),
                ConflictKind::Expenses => (Severity::Warning, "EXPENSE_CONFLICT"),
                ConflictKind::Currency => (Severity::Error, "CURRENCY_CONFLICT"),
            };
            ValidationIssue::new(severity, code, conflict.message.clone())
                .suggestion(format!("Using {winning_source} values"))
        })
        .collect()
}

/// A winner whose net profit disagrees with its own totals is corrected
/// toward the balance equation.
fn reconcile_net_profit(record: &mut FinancialRecord) {
    let expected = record.revenue - record.expenses;
    if (record.net_profit - expected).abs() > balance_tolerance() {
        record.net_profit = expected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parsers::parse_json;
    use crate::schema::SourceType;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn record(source: SourceType, revenue: Decimal) -> FinancialRecord {
        FinancialRecord {
            id: format!("{}-test", source.prefix()),
            source,
            period_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            period_end: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            currency: "USD".to_string(),
            revenue,
            expenses: dec!(6000),
            net_profit: revenue - dec!(6000),
            raw_data: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_rootfi_file() {
        let doc = json!({
            "data": [{
                "rootfi_id": 1,
                "period_start": "2024-01-01",
                "period_end": "2024-01-31",
                "currency_id": "usd",
                "revenue": [{"name": "Sales", "value": 100.0}],
                "operating_expenses": [{"name": "Rent", "value": 40.0}]
            }]
        });
        let parsed = parse_json(SourceType::Rootfi, &doc).unwrap();
        let normalizer = Normalizer::new(SourcePriority::default());
        let normalized = normalizer.normalize(&parsed);

        assert_eq!(normalized.len(), 1);
        let bundle = &normalized[0];
        assert_eq!(bundle.record.net_profit, dec!(60));
        assert_eq!(bundle.record.currency, "USD");
        assert!(bundle.validation.is_valid);
        assert_eq!(bundle.values.len(), 2);
        assert_eq!(bundle.accounts.len(), 2);
    }

    #[test]
    fn test_reported_net_profit_survives_for_validation() {
        let doc = json!({
            "data": [{
                "rootfi_id": 2,
                "period_start": "2024-01-01",
                "period_end": "2024-01-31",
                "currency_id": "USD",
                "revenue": [{"name": "Sales", "value": 100.0}],
                "operating_expenses": [{"name": "Rent", "value": 40.0}],
                "net_profit": 50.0
            }]
        });
        let parsed = parse_json(SourceType::Rootfi, &doc).unwrap();
        let normalized = Normalizer::new(SourcePriority::default()).normalize(&parsed);

        let bundle = &normalized[0];
        assert_eq!(bundle.record.net_profit, dec!(50));
        assert!(!bundle.validation.is_valid);
        assert!(bundle
            .validation
            .issues
            .iter()
            .any(|i| i.code == "BAL_EQ"));
    }

    #[test]
    fn test_detect_conflicts() {
        let a = record(SourceType::QuickBooks, dec!(15000));
        let b = record(SourceType::Rootfi, dec!(14500));
        let conflicts = Normalizer::detect_conflicts(&a, &b);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::Revenue);

        let mut c = record(SourceType::Rootfi, dec!(15000));
        c.currency = "EUR".to_string();
        let conflicts = Normalizer::detect_conflicts(&a, &c);
        assert!(conflicts.iter().any(|x| x.kind == ConflictKind::Currency));
    }

    #[test]
    fn test_higher_priority_incoming_replaces() {
        let normalizer = Normalizer::new(SourcePriority::default());
        let existing = record(SourceType::Rootfi, dec!(14500));
        let incoming = record(SourceType::QuickBooks, dec!(15000));

        match normalizer.resolve(&incoming, &existing) {
            Resolution::Replace { record, .. } => {
                assert_eq!(record.revenue, dec!(15000));
                let conflicts = record.raw_data["conflicts"].as_array().unwrap();
                assert_eq!(conflicts[0]["source"], "rootfi");
                assert_eq!(conflicts[0]["revenue"], "14500");
                assert_eq!(conflicts[0]["revenue_delta"], "500");
            }
            Resolution::KeepExisting { .. } => panic!("expected replacement"),
        }
    }

    #[test]
    fn test_lower_priority_incoming_keeps_existing_with_info() {
        let normalizer = Normalizer::new(SourcePriority::default());
        let existing = record(SourceType::QuickBooks, dec!(15000));
        let incoming = record(SourceType::Rootfi, dec!(14500));

        match normalizer.resolve(&incoming, &existing) {
            Resolution::KeepExisting { record, issues } => {
                assert_eq!(record.revenue, dec!(15000));
                assert!(issues
                    .iter()
                    .any(|i| i.code == "CONFLICT_KEPT_EXISTING" && i.severity == Severity::Info));
                assert!(record.raw_data["conflicts"].as_array().is_some());
            }
            Resolution::Replace { .. } => panic!("expected keep-existing"),
        }
    }

    #[test]
    fn test_same_source_rewrite_is_plain_update() {
        let normalizer = Normalizer::new(SourcePriority::default());
        let existing = record(SourceType::QuickBooks, dec!(15000));
        let incoming = record(SourceType::QuickBooks, dec!(15500));

        match normalizer.resolve(&incoming, &existing) {
            Resolution::Replace { record, issues } => {
                assert_eq!(record.revenue, dec!(15500));
                assert!(issues.is_empty());
            }
            Resolution::KeepExisting { .. } => panic!("expected replacement"),
        }
    }

    #[test]
    fn test_winner_net_profit_reconciled() {
        let normalizer = Normalizer::new(SourcePriority::default());
        let existing = record(SourceType::Rootfi, dec!(14500));
        let mut incoming = record(SourceType::QuickBooks, dec!(15000));
        incoming.net_profit = dec!(1.00);

        match normalizer.resolve(&incoming, &existing) {
            Resolution::Replace { record, .. } => {
                assert_eq!(record.net_profit, dec!(9000));
            }
            Resolution::KeepExisting { .. } => panic!("expected replacement"),
        }
    }

}
