use std::collections::{HashMap, HashSet};

use crate::config::SurgeConfig;
use crate::transactions::types::TransactionRecord;

use super::types::{SurgeCandidate, SurgeReport};

/// Flags sources whose distinct-counterparty count grew sharply between a
/// baseline window and the most recent window of a transaction log.
pub struct SurgeDetector {
    config: SurgeConfig,
}

#[derive(Default)]
struct FanOut<'a> {
    baseline: HashSet<&'a str>,
    recent: HashSet<&'a str>,
}

impl SurgeDetector {
    pub fn new(config: SurgeConfig) -> Self {
        Self { config }
    }

    /// Split `records` at the configured timestamp quantile and rank surging sources.
    ///
    /// Records need not be sorted. Sources with no baseline activity have no
    /// defined growth ratio and are excluded unless `include_new_sources` is set,
    /// in which case they rank ahead of every finite ratio.
    pub fn detect(&self, chain: &str, records: &[TransactionRecord]) -> SurgeReport {
        let mut ordered: Vec<&TransactionRecord> = records.iter().collect();
        ordered.sort_by_key(|r| r.timestamp);

        let timestamps: Vec<f64> = ordered.iter().map(|r| r.timestamp as f64).collect();
        let Some(split) = quantile(&timestamps, self.config.split_quantile) else {
            return SurgeReport::empty(chain);
        };

        // Source iteration order = first appearance in time order.
        let mut sources: Vec<&str> = Vec::new();
        let mut fan_out: HashMap<&str, FanOut> = HashMap::new();
        for record in &ordered {
            let source = record.from_address.as_str();
            let entry = fan_out.entry(source).or_insert_with(|| {
                sources.push(source);
                FanOut::default()
            });
            if record.timestamp as f64 <= split {
                entry.baseline.insert(&record.to_address);
            } else {
                entry.recent.insert(&record.to_address);
            }
        }

        let mut candidates = Vec::new();
        let mut new_sources = 0u64;
        for source in sources {
            let counts = &fan_out[source];
            let baseline = counts.baseline.len() as u64;
            let recent = counts.recent.len() as u64;

            if baseline == 0 {
                if recent == 0 {
                    continue;
                }
                new_sources += 1;
                if self.config.include_new_sources {
                    candidates.push(SurgeCandidate {
                        address: source.to_string(),
                        baseline_fanout: 0,
                        recent_fanout: recent,
                        delta_pct: None,
                    });
                }
                continue;
            }

            let delta_pct = (recent as f64 - baseline as f64) / baseline as f64;
            if delta_pct > self.config.min_delta_pct {
                candidates.push(SurgeCandidate {
                    address: source.to_string(),
                    baseline_fanout: baseline,
                    recent_fanout: recent,
                    delta_pct: Some(delta_pct),
                });
            }
        }

        // Stable: equal ratios keep source iteration order.
        candidates.sort_by(|a, b| b.rank_key().total_cmp(&a.rank_key()));

        let top_accounts = candidates
            .iter()
            .take(self.config.top_n)
            .map(|c| c.address.clone())
            .collect();

        if !candidates.is_empty() {
            tracing::info!(
                chain,
                split_timestamp = split,
                candidates = candidates.len(),
                new_sources,
                "Fan-out surge detected"
            );
        }

        SurgeReport {
            chain: chain.to_string(),
            split_timestamp: Some(split),
            alert: !candidates.is_empty(),
            top_accounts,
            candidates,
            new_sources,
        }
    }
}

/// Quantile of ascending `sorted` values with linear interpolation between
/// closest ranks. `None` for an empty slice.
pub fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let position = q.clamp(0.0, 1.0) * last as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}
