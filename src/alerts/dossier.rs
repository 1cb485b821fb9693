use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entity::lists::AddressLists;
use crate::graph::hops::HopSets;
use crate::rules::catalog::RuleCatalog;
use crate::rules::engine::TransactionEvaluation;
use crate::rules::types::{Category, Severity};
use crate::transactions::types::Direction;

/// Scores of one address aggregated over all of its evaluated transactions.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressRiskProfile {
    pub address: String,
    pub chain: String,
    pub total: f64,
    pub compliance: f64,
    pub exposure: f64,
    pub behavior: f64,
    /// Per triggered rule: the highest single-transaction score, and how many
    /// transactions triggered it. Repeated triggering does not compound.
    pub rule_hits: BTreeMap<String, RuleHit>,
    pub transactions: usize,
    /// Highest-scoring transactions first, by score-detail sum.
    pub representative: Vec<TransactionEvaluation>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleHit {
    pub max_score: f64,
    pub count: u64,
}

impl AddressRiskProfile {
    /// Aggregate the rows of `address` on `chain`; other rows are ignored.
    pub fn build(
        address: &str,
        chain: &str,
        rows: &[TransactionEvaluation],
        tx_limit: usize,
    ) -> Self {
        let address = address.trim().to_lowercase();
        let mut profile = Self {
            address: address.clone(),
            chain: chain.to_string(),
            total: 0.0,
            compliance: 0.0,
            exposure: 0.0,
            behavior: 0.0,
            rule_hits: BTreeMap::new(),
            transactions: 0,
            representative: Vec::new(),
        };

        let mut own: Vec<&TransactionEvaluation> = Vec::new();
        for row in rows {
            if row.chain != chain || row.address.to_lowercase() != address {
                continue;
            }
            profile.total += row.total_risk_score;
            profile.compliance += row.compliance_score;
            profile.exposure += row.exposure_score;
            profile.behavior += row.behavior_score;

            for (rule_id, &score) in &row.score_detail {
                let hit = profile.rule_hits.entry(rule_id.clone()).or_insert(RuleHit {
                    max_score: score,
                    count: 0,
                });
                hit.max_score = hit.max_score.max(score);
                hit.count += 1;
            }
            own.push(row);
        }

        profile.transactions = own.len();
        own.sort_by(|a, b| b.detail_sum().total_cmp(&a.detail_sum()));
        profile.representative = own.into_iter().take(tx_limit).cloned().collect();
        profile
    }
}

// ============================================================
// Dossier document
// ============================================================

#[derive(Debug, Clone, Serialize)]
pub struct AddressDossier {
    pub address: String,
    pub chain: String,
    pub analyzed_at: DateTime<Utc>,
    pub scores: DossierScores,
    pub rules: Vec<DossierRule>,
    pub evidence: Evidence,
    pub tx_recent: Vec<DossierTransaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DossierScores {
    pub total: f64,
    #[serde(rename = "C")]
    pub compliance: f64,
    #[serde(rename = "E")]
    pub exposure: f64,
    #[serde(rename = "B")]
    pub behavior: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DossierRule {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub category: Option<Category>,
    pub score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evidence {
    pub sdn: bool,
    /// 0 for a seed address, 1 or 2 inside the hop sets, otherwise null.
    pub hop: Option<u8>,
    pub mixer: bool,
    pub cex_internal: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DossierTransaction {
    pub tx_hash: String,
    pub ts: i64,
    pub usd_value: Option<f64>,
    pub dir: Direction,
    pub counterparty: String,
    pub rules: Vec<String>,
}

/// Explicit read-only inputs for dossier evidence.
pub struct EvidenceSources<'a> {
    pub lists: &'a AddressLists,
    pub hops: Option<&'a HopSets>,
}

impl EvidenceSources<'_> {
    fn evidence_for(&self, address: &str) -> Evidence {
        let seeds: &HashSet<String> = &self.lists.sdn;
        let hop = match self.hops {
            Some(hops) => hops.distance(address, seeds),
            None => seeds.contains(address).then_some(0),
        };
        Evidence {
            sdn: seeds.contains(address),
            hop,
            mixer: self.lists.mixer.contains(address),
            cex_internal: self.lists.cex.contains(address),
        }
    }
}

/// Assemble the evidence dossier for one address on one chain.
pub fn build_address_dossier(
    address: &str,
    chain: &str,
    rows: &[TransactionEvaluation],
    catalog: &RuleCatalog,
    sources: &EvidenceSources<'_>,
    tx_limit: usize,
    analyzed_at: DateTime<Utc>,
) -> AddressDossier {
    let profile = AddressRiskProfile::build(address, chain, rows, tx_limit);

    let mut rules: Vec<DossierRule> = profile
        .rule_hits
        .iter()
        .map(|(rule_id, hit)| {
            let rule = catalog.get(rule_id);
            if rule.is_none() {
                tracing::debug!(rule_id = %rule_id, "Rule id not in catalog, using defaults");
            }
            DossierRule {
                id: rule_id.clone(),
                name: rule.map(|r| r.name.clone()).unwrap_or_else(|| rule_id.clone()),
                severity: rule.map(|r| r.severity).unwrap_or(Severity::Low),
                category: rule.map(|r| r.category),
                score: hit.max_score,
                reason: format!(
                    "triggered on {} of {} transactions",
                    hit.count, profile.transactions
                ),
            }
        })
        .collect();
    // rule_hits iterates by id, so equal scores stay in id order.
    rules.sort_by(|a, b| b.score.total_cmp(&a.score));

    let tx_recent = profile
        .representative
        .iter()
        .map(|row| DossierTransaction {
            tx_hash: row.tx_hash.clone(),
            ts: row.timestamp,
            usd_value: row.usd_value,
            dir: row.direction,
            counterparty: row.counterparty.clone(),
            rules: row.score_detail.keys().cloned().collect(),
        })
        .collect();

    AddressDossier {
        evidence: sources.evidence_for(&profile.address),
        address: profile.address,
        chain: profile.chain,
        analyzed_at,
        scores: DossierScores {
            total: profile.total,
            compliance: profile.compliance,
            exposure: profile.exposure,
            behavior: profile.behavior,
        },
        rules,
        tx_recent,
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn row(tx_hash: &str, detail: &[(&str, f64, Category)]) -> TransactionEvaluation {
        let mut score_detail = BTreeMap::new();
        let (mut c, mut e, mut b) = (0.0, 0.0, 0.0);
        for (id, score, category) in detail {
            score_detail.insert(id.to_string(), *score);
            match category {
                Category::Compliance => c += score,
                Category::Exposure => e += score,
                Category::Behavior => b += score,
            }
        }
        TransactionEvaluation {
            address: "0xsubject".to_string(),
            chain: "ethereum".to_string(),
            tx_hash: tx_hash.to_string(),
            timestamp: 1_700_000_000,
            usd_value: Some(10.0),
            direction: Direction::Outbound,
            counterparty: "0xpeer".to_string(),
            total_risk_score: c + e + b,
            compliance_score: c,
            exposure_score: e,
            behavior_score: b,
            score_detail,
        }
    }

    fn catalog() -> RuleCatalog {
        RuleCatalog::from_yaml_str(
            r#"
rules:
  - id: R1
    name: Mixer exposure
    severity: HIGH
    axis: E
    condition: { flag: is_mixer }
  - id: R2
    name: High value
    severity: LOW
    axis: C
    condition: { threshold: { field: usd_value, op: gt, value: 10 } }
"#,
            Path::new("rules.yaml"),
        )
        .unwrap()
    }

    #[test]
    fn test_rule_contribution_is_max_not_sum() {
        let rows = vec![
            row("0x1", &[("R1", 5.0, Category::Exposure)]),
            row("0x2", &[("R1", 8.0, Category::Exposure), ("R2", 1.0, Category::Compliance)]),
            row("0x3", &[]),
        ];
        let lists = AddressLists::default();
        let sources = EvidenceSources {
            lists: &lists,
            hops: None,
        };

        let dossier =
            build_address_dossier("0xSubject", "ethereum", &rows, &catalog(), &sources, 10, Utc::now());

        assert_eq!(dossier.address, "0xsubject");
        assert_eq!(dossier.scores.total, 14.0);
        assert_eq!(dossier.scores.exposure, 13.0);
        assert_eq!(dossier.scores.compliance, 1.0);

        assert_eq!(dossier.rules.len(), 2);
        let r1 = &dossier.rules[0];
        assert_eq!(r1.id, "R1");
        assert_eq!(r1.score, 8.0);
        assert_eq!(r1.name, "Mixer exposure");
        assert_eq!(r1.severity, Severity::High);
        assert_eq!(r1.reason, "triggered on 2 of 3 transactions");

        let hashes: Vec<&str> = dossier.tx_recent.iter().map(|t| t.tx_hash.as_str()).collect();
        assert_eq!(hashes, vec!["0x2", "0x1", "0x3"]);
        assert_eq!(dossier.tx_recent[0].rules, vec!["R1", "R2"]);
    }

    #[test]
    fn test_representative_transactions_capped() {
        let rows: Vec<_> = (0..15)
            .map(|i| row(&format!("0x{i:02}"), &[("R2", i as f64, Category::Compliance)]))
            .collect();
        let profile = AddressRiskProfile::build("0xsubject", "ethereum", &rows, 10);
        assert_eq!(profile.transactions, 15);
        assert_eq!(profile.representative.len(), 10);
        assert_eq!(profile.representative[0].tx_hash, "0x14");
        assert_eq!(profile.rule_hits["R2"].max_score, 14.0);
    }

    #[test]
    fn test_evidence_hop_distance() {
        let mut lists = AddressLists::default();
        lists.sdn.insert("0xseed".to_string());
        lists.mixer.insert("0xsubject".to_string());
        let hops = HopSets {
            chain: "ethereum".to_string(),
            hop1: ["0xsubject".to_string()].into_iter().collect(),
            hop2: Default::default(),
        };
        let sources = EvidenceSources {
            lists: &lists,
            hops: Some(&hops),
        };

        let evidence = sources.evidence_for("0xsubject");
        assert_eq!(
            evidence,
            Evidence {
                sdn: false,
                hop: Some(1),
                mixer: true,
                cex_internal: false,
            }
        );
        assert_eq!(sources.evidence_for("0xseed").hop, Some(0));
        assert_eq!(sources.evidence_for("0xnobody").hop, None);

        let json = serde_json::to_value(sources.evidence_for("0xnobody")).unwrap();
        assert!(json["hop"].is_null());
    }

    #[test]
    fn test_unknown_rule_falls_back_to_id() {
        let rows = vec![row("0x1", &[("X-9", 3.0, Category::Behavior)])];
        let lists = AddressLists::default();
        let sources = EvidenceSources {
            lists: &lists,
            hops: None,
        };
        let dossier =
            build_address_dossier("0xsubject", "ethereum", &rows, &catalog(), &sources, 10, Utc::now());
        assert_eq!(dossier.rules[0].name, "X-9");
        assert_eq!(dossier.rules[0].severity, Severity::Low);
        assert_eq!(dossier.rules[0].category, None);
    }
}
