use serde::Deserialize;
use std::path::PathBuf;

use crate::rules::types::Severity;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub inputs: InputsConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub surge: SurgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ============================================================
// Inputs
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct InputsConfig {
    pub rules_path: PathBuf,
    pub sdn_path: PathBuf,
    pub mixer_list_path: Option<PathBuf>,
    pub cex_list_path: Option<PathBuf>,
    pub bridge_list_path: Option<PathBuf>,
    /// Per-address histories: `<transactions_dir>/<chain>/<address>.csv`.
    #[serde(default = "default_transactions_dir")]
    pub transactions_dir: PathBuf,
    /// Edge shards: `<edges_dir>/<chain>/*.csv`. Defaults to `transactions_dir`.
    pub edges_dir: Option<PathBuf>,
    pub chains: Vec<String>,
}

fn default_transactions_dir() -> PathBuf {
    PathBuf::from("data/address_transactions")
}

impl InputsConfig {
    pub fn edges_dir(&self) -> &PathBuf {
        self.edges_dir.as_ref().unwrap_or(&self.transactions_dir)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("result")
}

// ============================================================
// Scoring
// ============================================================

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScoringConfig {
    #[serde(default)]
    pub severity_weights: SeverityWeights,
}

/// Score contributed by a matching rule, by severity. Must increase with severity.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct SeverityWeights {
    #[serde(default = "default_weight_low")]
    pub low: f64,
    #[serde(default = "default_weight_medium")]
    pub medium: f64,
    #[serde(default = "default_weight_high")]
    pub high: f64,
    #[serde(default = "default_weight_critical")]
    pub critical: f64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            low: default_weight_low(),
            medium: default_weight_medium(),
            high: default_weight_high(),
            critical: default_weight_critical(),
        }
    }
}

fn default_weight_low() -> f64 {
    5.0
}

fn default_weight_medium() -> f64 {
    10.0
}

fn default_weight_high() -> f64 {
    20.0
}

fn default_weight_critical() -> f64 {
    30.0
}

impl SeverityWeights {
    pub fn weight(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Low => self.low,
            Severity::Medium => self.medium,
            Severity::High => self.high,
            Severity::Critical => self.critical,
        }
    }

    fn validate(&self) -> eyre::Result<()> {
        let ordered = [self.low, self.medium, self.high, self.critical];
        if ordered.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(eyre::eyre!(
                "Severity weights must be finite and non-negative: {:?}",
                ordered
            ));
        }
        if !ordered.windows(2).all(|pair| pair[0] < pair[1]) {
            return Err(eyre::eyre!(
                "Severity weights must strictly increase LOW < MEDIUM < HIGH < CRITICAL: {:?}",
                ordered
            ));
        }
        Ok(())
    }
}

// ============================================================
// Alerts & Surge
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct AlertsConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_dossier_tx_limit")]
    pub dossier_tx_limit: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            dossier_tx_limit: default_dossier_tx_limit(),
        }
    }
}

fn default_top_k() -> usize {
    5
}

fn default_dossier_tx_limit() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SurgeConfig {
    #[serde(default = "default_split_quantile")]
    pub split_quantile: f64,
    /// Sources whose fan-out growth ratio exceeds this are candidates.
    #[serde(default = "default_min_delta_pct")]
    pub min_delta_pct: f64,
    #[serde(default = "default_surge_top_n")]
    pub top_n: usize,
    /// Rank sources with no baseline activity ahead of all others instead of
    /// excluding them. Off by default.
    #[serde(default)]
    pub include_new_sources: bool,
}

impl Default for SurgeConfig {
    fn default() -> Self {
        Self {
            split_quantile: default_split_quantile(),
            min_delta_pct: default_min_delta_pct(),
            top_n: default_surge_top_n(),
            include_new_sources: false,
        }
    }
}

fn default_split_quantile() -> f64 {
    0.8
}

fn default_min_delta_pct() -> f64 {
    1.0
}

fn default_surge_top_n() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.inputs.chains.is_empty() {
            return Err(eyre::eyre!("At least one chain must be configured"));
        }
        for chain in &self.inputs.chains {
            if chain.trim().is_empty() || chain.contains(['/', '\\']) {
                return Err(eyre::eyre!("Invalid chain name '{}'", chain));
            }
        }
        self.scoring.severity_weights.validate()?;
        if self.alerts.top_k == 0 {
            return Err(eyre::eyre!("alerts.top_k must be at least 1"));
        }
        let q = self.surge.split_quantile;
        if !(0.0..=1.0).contains(&q) {
            return Err(eyre::eyre!(
                "surge.split_quantile must be within [0, 1], got {}",
                q
            ));
        }
        if !self.surge.min_delta_pct.is_finite() {
            return Err(eyre::eyre!("surge.min_delta_pct must be finite"));
        }
        Ok(())
    }
}
