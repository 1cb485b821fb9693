use serde::Serialize;

/// A source address whose fan-out grew past the surge threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurgeCandidate {
    pub address: String,
    pub baseline_fanout: u64,
    pub recent_fanout: u64,
    /// `(recent - baseline) / baseline`; `None` when there was no baseline activity.
    pub delta_pct: Option<f64>,
}

impl SurgeCandidate {
    /// Sort key: a missing baseline ranks as unbounded growth.
    pub fn rank_key(&self) -> f64 {
        self.delta_pct.unwrap_or(f64::INFINITY)
    }
}

/// Fan-out surge result for one chain's transaction log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurgeReport {
    pub chain: String,
    pub split_timestamp: Option<f64>,
    pub alert: bool,
    pub top_accounts: Vec<String>,
    pub candidates: Vec<SurgeCandidate>,
    /// Sources active only in the recent window.
    pub new_sources: u64,
}

impl SurgeReport {
    pub fn empty(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            split_timestamp: None,
            alert: false,
            top_accounts: Vec::new(),
            candidates: Vec::new(),
            new_sources: 0,
        }
    }
}
