use std::collections::HashMap;

use serde::Serialize;

use crate::rules::engine::TransactionEvaluation;

/// One entry of the ranked alert list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub address: String,
    pub score: f64,
    #[serde(rename = "C")]
    pub compliance: f64,
    #[serde(rename = "E")]
    pub exposure: f64,
    #[serde(rename = "B")]
    pub behavior: f64,
}

/// Sum scores per address over `rows` (any mix of files, shards and chains),
/// rank descending by total score and keep the top `top_k`.
///
/// Addresses without rows never appear. Equal totals keep the order in which
/// each address was first seen.
pub fn build_alerts(rows: &[TransactionEvaluation], top_k: usize) -> Vec<Alert> {
    let mut alerts: Vec<Alert> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let address = row.address.trim().to_lowercase();
        if address.is_empty() {
            continue;
        }
        let slot = *index.entry(address.clone()).or_insert_with(|| {
            alerts.push(Alert {
                address,
                score: 0.0,
                compliance: 0.0,
                exposure: 0.0,
                behavior: 0.0,
            });
            alerts.len() - 1
        });
        let alert = &mut alerts[slot];
        alert.score += row.total_risk_score;
        alert.compliance += row.compliance_score;
        alert.exposure += row.exposure_score;
        alert.behavior += row.behavior_score;
    }

    alerts.sort_by(|a, b| b.score.total_cmp(&a.score));
    alerts.truncate(top_k);
    alerts
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::transactions::types::Direction;

    fn row(address: &str, c: f64, e: f64, b: f64) -> TransactionEvaluation {
        TransactionEvaluation {
            address: address.to_string(),
            chain: "ethereum".to_string(),
            tx_hash: format!("0x{address}{c}{e}{b}"),
            timestamp: 0,
            usd_value: None,
            direction: Direction::Inbound,
            counterparty: "0xpeer".to_string(),
            total_risk_score: c + e + b,
            compliance_score: c,
            exposure_score: e,
            behavior_score: b,
            score_detail: BTreeMap::new(),
        }
    }

    #[test]
    fn test_alerts_sum_and_rank() {
        let rows = vec![
            row("0xa", 10.0, 0.0, 0.0),
            row("0xb", 0.0, 20.0, 5.0),
            row("0xA", 0.0, 0.0, 30.0),
            row("0xc", 0.0, 0.0, 0.0),
        ];

        let alerts = build_alerts(&rows, 5);
        assert_eq!(alerts.len(), 3);
        assert_eq!(alerts[0].address, "0xa");
        assert_eq!(alerts[0].score, 40.0);
        assert_eq!((alerts[0].compliance, alerts[0].behavior), (10.0, 30.0));
        assert_eq!(alerts[1].address, "0xb");
        assert_eq!(alerts[2].address, "0xc");
        assert!(alerts.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_alerts_truncate_to_k() {
        let rows: Vec<_> = (0..6)
            .map(|i| row(&format!("0x{i}"), i as f64, 0.0, 0.0))
            .collect();
        let alerts = build_alerts(&rows, 2);
        let addresses: Vec<&str> = alerts.iter().map(|a| a.address.as_str()).collect();
        assert_eq!(addresses, vec!["0x5", "0x4"]);

        assert!(build_alerts(&[], 3).is_empty());
    }

    #[test]
    fn test_alert_serializes_axis_keys() {
        let alerts = build_alerts(&[row("0xa", 1.0, 2.0, 3.0)], 1);
        let json = serde_json::to_value(&alerts[0]).unwrap();
        assert_eq!(json["score"], 6.0);
        assert_eq!(json["C"], 1.0);
        assert_eq!(json["E"], 2.0);
        assert_eq!(json["B"], 3.0);
    }
}
