use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::config::SeverityWeights;
use crate::entity::lists::AddressLists;
use crate::error::RuleEvaluationError;
use crate::transactions::types::{Direction, TransactionRecord};

use super::catalog::RuleCatalog;
use super::types::Category;

/// Rule scores for one transaction. `score_detail` only holds rules that matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionEvaluation {
    pub address: String,
    pub chain: String,
    pub tx_hash: String,
    pub timestamp: i64,
    pub usd_value: Option<f64>,
    pub direction: Direction,
    pub counterparty: String,
    pub total_risk_score: f64,
    pub compliance_score: f64,
    pub exposure_score: f64,
    pub behavior_score: f64,
    pub score_detail: BTreeMap<String, f64>,
}

impl TransactionEvaluation {
    /// Sum of the per-rule contributions.
    pub fn detail_sum(&self) -> f64 {
        self.score_detail.values().sum()
    }
}

/// A rule that could not be evaluated on one row.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleFailure {
    pub tx_hash: String,
    pub rule_id: String,
    pub error: RuleEvaluationError,
}

#[derive(Debug, Default)]
pub struct EvaluationBatch {
    pub rows: Vec<TransactionEvaluation>,
    pub failures: Vec<RuleFailure>,
}

/// Scores transactions against every rule in the catalog.
///
/// Rules are pure functions of the record and the read-only address lists,
/// so clones of the engine can run on any number of threads.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    catalog: Arc<RuleCatalog>,
    lists: Arc<AddressLists>,
    weights: SeverityWeights,
}

impl RuleEngine {
    pub fn new(catalog: Arc<RuleCatalog>, lists: Arc<AddressLists>, weights: SeverityWeights) -> Self {
        Self {
            catalog,
            lists,
            weights,
        }
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    /// Evaluate all rules on one record. A rule that fails is treated as
    /// non-matching and reported in the returned failures.
    pub fn evaluate(&self, tx: &TransactionRecord) -> (TransactionEvaluation, Vec<RuleFailure>) {
        let mut score_detail = BTreeMap::new();
        let mut failures = Vec::new();
        let (mut compliance, mut exposure, mut behavior) = (0.0, 0.0, 0.0);

        for rule in self.catalog.rules() {
            match rule.matches(tx, self.lists.as_ref()) {
                Ok(true) => {
                    let score = self.weights.weight(rule.severity);
                    match rule.category {
                        Category::Compliance => compliance += score,
                        Category::Exposure => exposure += score,
                        Category::Behavior => behavior += score,
                    }
                    score_detail.insert(rule.id.clone(), score);
                }
                Ok(false) => {}
                Err(error) => {
                    tracing::debug!(
                        tx_hash = %tx.tx_hash,
                        rule_id = %rule.id,
                        error = %error,
                        "Rule evaluation failed, treating as non-matching"
                    );
                    failures.push(RuleFailure {
                        tx_hash: tx.tx_hash.clone(),
                        rule_id: rule.id.clone(),
                        error,
                    });
                }
            }
        }

        let evaluation = TransactionEvaluation {
            address: tx.subject.clone(),
            chain: tx.chain.clone(),
            tx_hash: tx.tx_hash.clone(),
            timestamp: tx.timestamp,
            usd_value: tx.usd_value,
            direction: tx.direction,
            counterparty: tx.counterparty.clone(),
            total_risk_score: compliance + exposure + behavior,
            compliance_score: compliance,
            exposure_score: exposure,
            behavior_score: behavior,
            score_detail,
        };
        (evaluation, failures)
    }

    /// Evaluate a whole history, preserving input order.
    pub fn evaluate_all(&self, records: &[TransactionRecord]) -> EvaluationBatch {
        let mut batch = EvaluationBatch {
            rows: Vec::with_capacity(records.len()),
            failures: Vec::new(),
        };
        for tx in records {
            let (row, failures) = self.evaluate(tx);
            batch.rows.push(row);
            batch.failures.extend(failures);
        }
        batch
    }
}
