use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use eyre::WrapErr;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::alerts::aggregate::{self, Alert};
use crate::alerts::dossier::{self, EvidenceSources};
use crate::anomaly::surge::SurgeDetector;
use crate::config::Config;
use crate::entity::lists::AddressLists;
use crate::graph::hops::{self, HopSets, ScanStats};
use crate::output::{prune_artifacts, write_json_atomic};
use crate::rules::catalog::RuleCatalog;
use crate::rules::engine::{RuleEngine, RuleFailure, TransactionEvaluation};
use crate::transactions::normalizer::{self, AddressHistory, NormalizeStats};
use crate::transactions::types::TransactionRecord;

/// Per-chain files replaced on every successful screening of that chain.
const CHAIN_ARTIFACTS: [&str; 4] = [
    "rule_evaluations.json",
    "sdn_hop1.json",
    "sdn_hop2.json",
    "fanout_surge.json",
];

const DOSSIER_PREFIX: &str = "address_detail_";

fn dossier_file_name(address: &str) -> String {
    format!("{DOSSIER_PREFIX}{address}.json")
}

/// Per-chain counters reported at the end of a run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ChainSummary {
    pub chain: String,
    pub files_read: u64,
    pub files_skipped: u64,
    pub rows: NormalizeStats,
    pub rows_evaluated: u64,
    pub rule_failures: u64,
    pub rule_failures_by_rule: BTreeMap<String, u64>,
    pub hop_scan: ScanStats,
    pub hop1: usize,
    pub hop2: usize,
    pub surge_candidates: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainFailure {
    pub chain: String,
    pub error: String,
}

/// Outcome of a full run, written to `run_summary.json`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunSummary {
    pub rules_loaded: usize,
    pub chains: Vec<ChainSummary>,
    pub failed_chains: Vec<ChainFailure>,
    pub alerts: usize,
    pub dossiers: usize,
    /// Earlier runs' files removed: dossiers of addresses no longer alerted
    /// and per-chain files of chains that failed this run.
    pub stale_artifacts_removed: usize,
}

impl RunSummary {
    pub fn rows_dropped(&self) -> u64 {
        self.chains.iter().map(|c| c.rows.rows_dropped()).sum()
    }

    pub fn rule_failures(&self) -> u64 {
        self.chains.iter().map(|c| c.rule_failures).sum()
    }

    pub fn files_skipped(&self) -> u64 {
        self.chains.iter().map(|c| c.files_skipped).sum()
    }
}

/// Everything one chain contributes to the cross-chain alert step.
struct ChainOutcome {
    summary: ChainSummary,
    rows: Vec<TransactionEvaluation>,
    hops: HopSets,
}

/// Orchestrates a screening run:
/// 1. Normalize per-address histories and score them against the rule catalog
/// 2. Propagate sanctions hop sets over the chain's edge shards
/// 3. Detect fan-out surges over the chain cohort
/// 4. Rank alerts across chains and build a dossier per alerted address
pub struct ScreeningPipeline {
    config: Config,
    engine: RuleEngine,
    lists: Arc<AddressLists>,
    seeds: Arc<HashSet<String>>,
    surge: SurgeDetector,
}

impl ScreeningPipeline {
    /// Load the rule catalog and address lists. Failures here abort the run.
    pub fn init(config: Config) -> eyre::Result<Self> {
        let catalog = RuleCatalog::load(&config.inputs.rules_path)
            .wrap_err("Failed to load rule catalog")?;

        let inputs = &config.inputs;
        let lists = AddressLists::load(
            &inputs.sdn_path,
            inputs.mixer_list_path.as_deref(),
            inputs.cex_list_path.as_deref(),
            inputs.bridge_list_path.as_deref(),
        )
        .wrap_err("Failed to load address lists")?;

        let lists = Arc::new(lists);
        let seeds = Arc::new(lists.sdn.clone());
        let engine = RuleEngine::new(
            Arc::new(catalog),
            lists.clone(),
            config.scoring.severity_weights,
        );
        let surge = SurgeDetector::new(config.surge.clone());

        Ok(Self {
            config,
            engine,
            lists,
            seeds,
            surge,
        })
    }

    /// Screen every configured chain, then write alerts and dossiers.
    /// Nothing cross-chain is written once `shutdown` has been cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> eyre::Result<RunSummary> {
        let mut summary = RunSummary {
            rules_loaded: self.engine.catalog().len(),
            ..RunSummary::default()
        };

        let mut tasks = JoinSet::new();
        for (position, chain) in self.config.inputs.chains.iter().enumerate() {
            let pipeline = self.clone();
            let shutdown = shutdown.clone();
            let chain = chain.clone();
            tasks.spawn(async move {
                let result = tokio::select! {
                    _ = shutdown.cancelled() => Err(eyre::eyre!("cancelled")),
                    outcome = pipeline.screen_chain(&chain) => outcome,
                };
                (position, chain, result)
            });
        }

        let mut outcomes: Vec<(usize, ChainOutcome)> = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (position, chain, result) = joined?;
            match result {
                Ok(outcome) => outcomes.push((position, outcome)),
                Err(e) => {
                    tracing::error!(chain = %chain, error = %e, "Chain screening failed");
                    summary.failed_chains.push(ChainFailure {
                        chain,
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        if shutdown.is_cancelled() {
            return Err(eyre::eyre!(
                "Run cancelled; alert list and dossiers were not written"
            ));
        }

        // Keep configured chain order so artifacts do not depend on task timing.
        outcomes.sort_by_key(|(position, _)| *position);

        let all_rows: Vec<TransactionEvaluation> = outcomes
            .iter()
            .flat_map(|(_, o)| o.rows.iter().cloned())
            .collect();
        let alerts = aggregate::build_alerts(&all_rows, self.config.alerts.top_k);
        write_json_atomic(&self.output_dir().join("alerts_today.json"), &alerts)?;
        summary.alerts = alerts.len();

        let written = self.write_dossiers(&alerts, &outcomes)?;
        summary.dossiers = written.values().map(HashSet::len).sum();
        summary.stale_artifacts_removed =
            self.remove_stale_artifacts(&written, &summary.failed_chains)?;
        summary.chains = outcomes.into_iter().map(|(_, o)| o.summary).collect();

        write_json_atomic(&self.output_dir().join("run_summary.json"), &summary)?;

        tracing::info!(
            chains = summary.chains.len(),
            failed_chains = summary.failed_chains.len(),
            files_skipped = summary.files_skipped(),
            rows_dropped = summary.rows_dropped(),
            rule_failures = summary.rule_failures(),
            alerts = summary.alerts,
            dossiers = summary.dossiers,
            stale_artifacts_removed = summary.stale_artifacts_removed,
            "Screening run complete"
        );

        Ok(summary)
    }

    fn output_dir(&self) -> &Path {
        &self.config.output.dir
    }

    async fn screen_chain(&self, chain: &str) -> eyre::Result<ChainOutcome> {
        let mut summary = ChainSummary {
            chain: chain.to_string(),
            ..ChainSummary::default()
        };

        // Step 1: normalize and score per-address histories
        let tx_dir = self.config.inputs.transactions_dir.join(chain);
        let files = hops::list_shards(&tx_dir)
            .wrap_err_with(|| format!("Failed to list transactions in '{}'", tx_dir.display()))?;
        let (histories, rows) = self.evaluate_files(chain, files, &mut summary).await?;

        // Step 2: sanctions hop sets
        let edge_dir = self.config.inputs.edges_dir().join(chain);
        let shards = hops::list_shards(&edge_dir)
            .wrap_err_with(|| format!("Failed to list edge shards in '{}'", edge_dir.display()))?;
        let (hop_sets, scan) = hops::propagate_hops(chain, self.seeds.clone(), &shards).await?;
        summary.hop1 = hop_sets.hop1.len();
        summary.hop2 = hop_sets.hop2.len();
        summary.hop_scan = scan;

        // Step 3: fan-out surge over the whole chain cohort
        let cohort = dedup_cohort(&histories);
        let surge = self.surge.detect(chain, &cohort);
        summary.surge_candidates = surge.candidates.len();

        let chain_dir = self.output_dir().join(chain);
        let [evaluations_file, hop1_file, hop2_file, surge_file] = CHAIN_ARTIFACTS;
        write_json_atomic(&chain_dir.join(evaluations_file), &rows)?;
        write_json_atomic(&chain_dir.join(hop1_file), &hop_sets.hop1)?;
        write_json_atomic(&chain_dir.join(hop2_file), &hop_sets.hop2)?;
        write_json_atomic(&chain_dir.join(surge_file), &surge)?;

        tracing::info!(
            chain,
            files = summary.files_read,
            files_skipped = summary.files_skipped,
            rows_kept = summary.rows.rows_kept,
            rows_dropped = summary.rows.rows_dropped(),
            missing_usd_value = summary.rows.missing_usd_value,
            rule_failures = summary.rule_failures,
            hop1 = summary.hop1,
            hop2 = summary.hop2,
            edges_dropped = summary.hop_scan.edges_dropped,
            surge_candidates = summary.surge_candidates,
            "Chain screened"
        );

        Ok(ChainOutcome {
            summary,
            rows,
            hops: hop_sets,
        })
    }

    /// Normalize and evaluate each address file on the blocking pool.
    /// Files with input-format errors are skipped and counted.
    async fn evaluate_files(
        &self,
        chain: &str,
        files: Vec<PathBuf>,
        summary: &mut ChainSummary,
    ) -> eyre::Result<(Vec<AddressHistory>, Vec<TransactionEvaluation>)> {
        let mut tasks = JoinSet::new();
        for path in files {
            let engine = self.engine.clone();
            let chain = chain.to_string();
            tasks.spawn_blocking(move || {
                let result = normalizer::load_address_history(&path, &chain).map(|history| {
                    let batch = engine.evaluate_all(&history.records);
                    (history, batch.rows, batch.failures)
                });
                (path, result)
            });
        }

        let mut evaluated = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (path, result) = joined?;
            match result {
                Ok(done) => {
                    summary.files_read += 1;
                    evaluated.push(done);
                }
                Err(e) => {
                    summary.files_skipped += 1;
                    tracing::warn!(path = %path.display(), error = %e, "Skipping transaction file");
                }
            }
        }

        // Join order is arbitrary; order by subject for reproducible artifacts.
        evaluated.sort_by(|a, b| a.0.subject.cmp(&b.0.subject));

        let mut histories = Vec::with_capacity(evaluated.len());
        let mut rows = Vec::new();
        for (history, history_rows, failures) in evaluated {
            summary.rows.merge(&history.stats);
            summary.rows_evaluated += history_rows.len() as u64;
            record_failures(summary, &failures);
            rows.extend(history_rows);
            histories.push(history);
        }

        if summary.rule_failures > 0 {
            tracing::warn!(
                chain,
                failures = summary.rule_failures,
                by_rule = ?summary.rule_failures_by_rule,
                "Some rules could not be evaluated and were treated as non-matching"
            );
        }

        Ok((histories, rows))
    }

    fn write_dossiers(
        &self,
        alerts: &[Alert],
        outcomes: &[(usize, ChainOutcome)],
    ) -> eyre::Result<BTreeMap<String, HashSet<String>>> {
        let analyzed_at = Utc::now();
        let mut written: BTreeMap<String, HashSet<String>> = BTreeMap::new();

        for alert in alerts {
            for (_, outcome) in outcomes {
                if !outcome.rows.iter().any(|r| r.address == alert.address) {
                    continue;
                }
                let sources = EvidenceSources {
                    lists: &self.lists,
                    hops: Some(&outcome.hops),
                };
                let dossier = dossier::build_address_dossier(
                    &alert.address,
                    &outcome.summary.chain,
                    &outcome.rows,
                    self.engine.catalog(),
                    &sources,
                    self.config.alerts.dossier_tx_limit,
                    analyzed_at,
                );
                let chain = &outcome.summary.chain;
                let file_name = dossier_file_name(&alert.address);
                write_json_atomic(&self.output_dir().join(chain).join(&file_name), &dossier)?;
                written.entry(chain.clone()).or_default().insert(file_name);
            }
        }

        Ok(written)
    }

    /// Every run fully replaces the output tree: drop dossiers not written by
    /// this run, and the per-chain files of chains that failed this run.
    fn remove_stale_artifacts(
        &self,
        written: &BTreeMap<String, HashSet<String>>,
        failed: &[ChainFailure],
    ) -> eyre::Result<usize> {
        let no_dossiers = HashSet::new();
        let mut removed = 0;

        for chain in &self.config.inputs.chains {
            let keep = written.get(chain).unwrap_or(&no_dossiers);
            let chain_failed = failed.iter().any(|f| &f.chain == chain);
            let chain_dir = self.output_dir().join(chain);

            removed += prune_artifacts(&chain_dir, |name| {
                let stale_dossier = name.starts_with(DOSSIER_PREFIX)
                    && name.ends_with(".json")
                    && !keep.contains(name);
                stale_dossier || (chain_failed && CHAIN_ARTIFACTS.iter().any(|a| *a == name))
            })?;
        }

        if removed > 0 {
            tracing::info!(removed, "Removed artifacts left by an earlier run");
        }
        Ok(removed)
    }
}

fn record_failures(summary: &mut ChainSummary, failures: &[RuleFailure]) {
    for failure in failures {
        summary.rule_failures += 1;
        *summary
            .rule_failures_by_rule
            .entry(failure.rule_id.clone())
            .or_insert(0) += 1;
    }
}

/// The chain's records with each tx_hash kept once (first file wins).
fn dedup_cohort(histories: &[AddressHistory]) -> Vec<TransactionRecord> {
    let mut seen = HashSet::new();
    histories
        .iter()
        .flat_map(|h| h.records.iter())
        .filter(|r| seen.insert(r.tx_hash.clone()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RULES: &str = r#"
rules:
  - id: C-001
    name: Sanctioned counterparty
    severity: CRITICAL
    axis: C
    condition: { flag: is_sanctioned }
  - id: C-003
    name: High-value transfer
    severity: MEDIUM
    axis: C
    condition:
      threshold: { field: usd_value, op: gte, value: 1000 }
  - id: E-101
    name: Mixer exposure
    severity: HIGH
    axis: E
    condition:
      any:
        - flag: is_mixer
        - entity_type: [mixer]
"#;

    const HEADER: &str =
        "tx_hash,timestamp,from,to,usd_value,entity_type,is_sanctioned,is_known_scam,is_mixer,is_bridge\n";

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture(root: &Path) -> Config {
        write(&root.join("rules.yaml"), RULES);
        write(&root.join("sdn.json"), r#"["0xSDN"]"#);

        let tx_dir = root.join("txs").join("ethereum");
        write(
            &tx_dir.join("0xrisky.csv"),
            &format!(
                "{HEADER}\
                 0x01,100,0xsdn,0xrisky,1234.56,mixer,true,false,true,false\n\
                 0x02,200,0xrisky,0xpeer,,unknown,false,false,false,false\n\
                 0x03,300,0xrisky,0xrisky,5,unknown,false,false,false,false\n"
            ),
        );
        write(
            &tx_dir.join("0xbenign.csv"),
            &format!(
                "{HEADER}\
                 0x10,100,0xbenign,0xshop,50.0,exchange,false,false,false,false\n\
                 0x11,200,0xpeer,0xbenign,20.0,exchange,false,false,false,false\n"
            ),
        );
        write(&tx_dir.join("0xbroken.csv"), "hash,when\n0x1,1\n");

        let toml_str = format!(
            r#"
[inputs]
rules_path = "{root}/rules.yaml"
sdn_path = "{root}/sdn.json"
transactions_dir = "{root}/txs"
chains = ["ethereum"]

[output]
dir = "{root}/out"

[alerts]
top_k = 5
"#,
            root = root.display()
        );
        toml::from_str(&toml_str).unwrap()
    }

    #[tokio::test]
    async fn test_end_to_end_run() {
        let dir = TempDir::new().unwrap();
        let config = fixture(dir.path());
        let out = config.output.dir.clone();

        let pipeline = Arc::new(ScreeningPipeline::init(config).unwrap());
        let summary = pipeline.run(CancellationToken::new()).await.unwrap();

        assert!(summary.failed_chains.is_empty());
        let chain = &summary.chains[0];
        assert_eq!(chain.files_read, 2);
        assert_eq!(chain.files_skipped, 1);
        assert_eq!(chain.rows.dropped.get("self_loop"), Some(&1));
        assert_eq!(chain.rows.missing_usd_value, 1);
        assert_eq!(chain.rule_failures_by_rule.get("C-003"), Some(&1));

        let alerts: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(out.join("alerts_today.json")).unwrap())
                .unwrap();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0]["address"], "0xrisky");
        assert_eq!(alerts[0]["score"], 60.0);
        assert_eq!(alerts[1]["address"], "0xbenign");
        assert_eq!(alerts[1]["score"], 0.0);

        let hop1: Vec<String> = serde_json::from_str(
            &std::fs::read_to_string(out.join("ethereum").join("sdn_hop1.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(hop1, vec!["0xrisky"]);
        let hop2: Vec<String> = serde_json::from_str(
            &std::fs::read_to_string(out.join("ethereum").join("sdn_hop2.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(hop2, vec!["0xpeer"]);

        let detail: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(out.join("ethereum").join("address_detail_0xrisky.json"))
                .unwrap(),
        )
        .unwrap();
        assert_eq!(detail["evidence"]["hop"], 1);
        assert_eq!(detail["evidence"]["sdn"], false);
        assert_eq!(detail["rules"][0]["id"], "C-001");
        assert_eq!(detail["tx_recent"][0]["tx_hash"], "0x01");

        assert!(out.join("ethereum").join("fanout_surge.json").exists());
        assert!(out.join("run_summary.json").exists());
    }

    #[tokio::test]
    async fn test_rerun_replaces_previous_dossiers() {
        let dir = TempDir::new().unwrap();
        let config = fixture(dir.path());
        let out = config.output.dir.clone();
        let tx_dir = config.inputs.transactions_dir.join("ethereum");

        let first = Arc::new(ScreeningPipeline::init(config.clone()).unwrap());
        first.run(CancellationToken::new()).await.unwrap();
        assert!(out.join("ethereum").join("address_detail_0xrisky.json").exists());

        // Second batch: 0xrisky is gone, 0xfresh takes its place.
        std::fs::remove_file(tx_dir.join("0xrisky.csv")).unwrap();
        write(
            &tx_dir.join("0xfresh.csv"),
            &format!("{HEADER}0x20,100,0xsdn,0xfresh,10.0,unknown,true,false,false,false\n"),
        );

        let second = Arc::new(ScreeningPipeline::init(config).unwrap());
        let summary = second.run(CancellationToken::new()).await.unwrap();

        let chain_dir = out.join("ethereum");
        assert!(!chain_dir.join("address_detail_0xrisky.json").exists());
        assert!(chain_dir.join("address_detail_0xfresh.json").exists());
        assert!(chain_dir.join("address_detail_0xbenign.json").exists());
        assert_eq!(summary.stale_artifacts_removed, 1);

        let alerts: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(out.join("alerts_today.json")).unwrap())
                .unwrap();
        let alerted: Vec<&str> = alerts.iter().map(|a| a["address"].as_str().unwrap()).collect();
        assert_eq!(alerted, vec!["0xfresh", "0xbenign"]);
    }

    #[tokio::test]
    async fn test_failed_chain_loses_previous_artifacts() {
        let dir = TempDir::new().unwrap();
        let config = fixture(dir.path());
        let out = config.output.dir.clone();

        let first = Arc::new(ScreeningPipeline::init(config.clone()).unwrap());
        first.run(CancellationToken::new()).await.unwrap();
        assert!(out.join("ethereum").join("sdn_hop1.json").exists());

        std::fs::remove_dir_all(config.inputs.transactions_dir.join("ethereum")).unwrap();
        let second = Arc::new(ScreeningPipeline::init(config).unwrap());
        let summary = second.run(CancellationToken::new()).await.unwrap();

        assert_eq!(summary.failed_chains.len(), 1);
        let chain_dir = out.join("ethereum");
        for name in CHAIN_ARTIFACTS {
            assert!(!chain_dir.join(name).exists(), "{name} left behind");
        }
        assert!(!chain_dir.join("address_detail_0xrisky.json").exists());
        assert_eq!(std::fs::read_to_string(out.join("alerts_today.json")).unwrap().trim(), "[]");
    }

    #[tokio::test]
    async fn test_cancelled_run_writes_no_alerts() {
        let dir = TempDir::new().unwrap();
        let config = fixture(dir.path());
        let out = config.output.dir.clone();

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let pipeline = Arc::new(ScreeningPipeline::init(config).unwrap());

        assert!(pipeline.run(shutdown).await.is_err());
        assert!(!out.join("alerts_today.json").exists());
    }

    #[test]
    fn test_duplicate_rule_ids_abort_init() {
        let dir = TempDir::new().unwrap();
        let config = fixture(dir.path());
        write(
            &config.inputs.rules_path,
            "rules:\n  - id: A\n    condition: { flag: is_mixer }\n  - id: A\n    condition: { flag: is_bridge }\n",
        );
        assert!(ScreeningPipeline::init(config).is_err());
    }
}
