use std::collections::{BTreeSet, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::error::InputFormatError;

/// First- and second-degree neighbours of the sanctioned seed set on one chain.
/// The two sets are disjoint from each other and from the seeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HopSets {
    pub chain: String,
    pub hop1: BTreeSet<String>,
    pub hop2: BTreeSet<String>,
}

impl HopSets {
    /// Hop distance of `address`: 0 for a seed, 1 or 2 for the hop sets, else `None`.
    pub fn distance(&self, address: &str, seeds: &HashSet<String>) -> Option<u8> {
        if seeds.contains(address) {
            Some(0)
        } else if self.hop1.contains(address) {
            Some(1)
        } else if self.hop2.contains(address) {
            Some(2)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStats {
    pub shards: u64,
    pub shard_reads: u64,
    pub shards_skipped: u64,
    pub edges_read: u64,
    /// Edge rows skipped across both passes (empty endpoint or unparseable).
    pub edges_dropped: u64,
}

/// List the `*.csv` shards in a chain directory, sorted by path.
pub fn list_shards(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut shards = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if path.is_file() && is_csv {
            shards.push(path);
        }
    }
    shards.sort();
    Ok(shards)
}

/// Compute hop1/hop2 for `chain` by streaming every shard exactly twice.
///
/// Pass 1 collects every address sharing an edge (either direction) with a
/// seed; pass 2 does the same for hop1. Within a pass, shards are read
/// concurrently on the blocking pool and their partial sets merged once the
/// pass completes, so the result does not depend on read order.
pub async fn propagate_hops(
    chain: &str,
    seeds: Arc<HashSet<String>>,
    shards: &[PathBuf],
) -> eyre::Result<(HopSets, ScanStats)> {
    let mut stats = ScanStats {
        shards: shards.len() as u64,
        ..ScanStats::default()
    };

    let mut hop1 = scan_pass(shards, seeds.clone(), &mut stats).await?;
    hop1.retain(|a| !seeds.contains(a));
    let hop1 = Arc::new(hop1);

    let mut hop2 = scan_pass(shards, hop1.clone(), &mut stats).await?;
    hop2.retain(|a| !seeds.contains(a) && !hop1.contains(a));

    let hop_sets = HopSets {
        chain: chain.to_string(),
        hop1: hop1.iter().cloned().collect(),
        hop2: hop2.into_iter().collect(),
    };

    tracing::info!(
        chain,
        seeds = seeds.len(),
        hop1 = hop_sets.hop1.len(),
        hop2 = hop_sets.hop2.len(),
        shards = stats.shards,
        shards_skipped = stats.shards_skipped,
        "Computed sanctions hop sets"
    );

    Ok((hop_sets, stats))
}

async fn scan_pass(
    shards: &[PathBuf],
    frontier: Arc<HashSet<String>>,
    stats: &mut ScanStats,
) -> eyre::Result<HashSet<String>> {
    let mut tasks = JoinSet::new();
    for shard in shards {
        let shard = shard.clone();
        let frontier = frontier.clone();
        tasks.spawn_blocking(move || {
            let result = neighbours_in_shard(&shard, &frontier);
            (shard, result)
        });
    }

    let mut merged = HashSet::new();
    while let Some(joined) = tasks.join_next().await {
        let (shard, result) = joined?;
        stats.shard_reads += 1;
        match result {
            Ok((neighbours, scan)) => {
                stats.edges_read += scan.edges;
                stats.edges_dropped += scan.dropped;
                if scan.dropped > 0 {
                    tracing::warn!(
                        shard = %shard.display(),
                        dropped = scan.dropped,
                        "Dropped unusable edge rows"
                    );
                }
                merged.extend(neighbours);
            }
            Err(e) => {
                stats.shards_skipped += 1;
                tracing::warn!(shard = %shard.display(), error = %e, "Skipping edge shard");
            }
        }
    }
    Ok(merged)
}

/// Addresses on the other side of any edge touching `frontier`, plus the shard counts.
fn neighbours_in_shard(
    path: &Path,
    frontier: &HashSet<String>,
) -> Result<(HashSet<String>, ShardScan), InputFormatError> {
    let mut neighbours = HashSet::new();
    let scan = scan_edges(path, |from, to| {
        if frontier.contains(from) {
            neighbours.insert(to.to_string());
        }
        if frontier.contains(to) {
            neighbours.insert(from.to_string());
        }
    })?;
    Ok((neighbours, scan))
}

/// Row counts of one complete read of an edge shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardScan {
    pub edges: u64,
    /// Unparseable rows and rows with an empty endpoint.
    pub dropped: u64,
}

/// Stream the `from`/`to` columns of an edge shard. Other columns are ignored.
pub fn scan_edges(
    path: &Path,
    visit: impl FnMut(&str, &str),
) -> Result<ShardScan, InputFormatError> {
    let file = std::fs::File::open(path).map_err(|e| InputFormatError::Open {
        path: path.to_path_buf(),
        source: csv::Error::from(e),
    })?;
    scan_edge_reader(file, path, visit)
}

/// Like [`scan_edges`] over any reader. An I/O failure part-way through fails
/// the whole shard, so a partial read never passes for a complete one.
pub fn scan_edge_reader<R: Read>(
    source: R,
    path: &Path,
    mut visit: impl FnMut(&str, &str),
) -> Result<ShardScan, InputFormatError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(source);

    let headers = reader.headers().map_err(|e| InputFormatError::Header {
        path: path.to_path_buf(),
        source: e,
    })?;
    let position = |name: &str| headers.iter().position(|h| h.trim().eq_ignore_ascii_case(name));
    let (from_idx, to_idx) = match (position("from"), position("to")) {
        (Some(f), Some(t)) => (f, t),
        (f, t) => {
            let mut missing = Vec::new();
            if f.is_none() {
                missing.push("from".to_string());
            }
            if t.is_none() {
                missing.push("to".to_string());
            }
            return Err(InputFormatError::MissingColumns {
                path: path.to_path_buf(),
                missing,
            });
        }
    };

    let mut scan = ShardScan::default();
    let mut record = csv::StringRecord::new();
    loop {
        match reader.read_record(&mut record) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) if e.is_io_error() => {
                return Err(InputFormatError::Read {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
            Err(e) => {
                tracing::debug!(shard = %path.display(), error = %e, "Unreadable edge row");
                scan.dropped += 1;
                continue;
            }
        }
        let from = record.get(from_idx).unwrap_or("").trim().to_lowercase();
        let to = record.get(to_idx).unwrap_or("").trim().to_lowercase();
        if from.is_empty() || to.is_empty() {
            scan.dropped += 1;
            continue;
        }
        scan.edges += 1;
        visit(&from, &to);
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_shard(dir: &Path, name: &str, rows: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(name);
        let mut content = String::from("tx_hash,from,to,usd_value\n");
        for (i, (from, to)) in rows.iter().enumerate() {
            content.push_str(&format!("0x{i:02},{from},{to},1.0\n"));
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn seeds(addresses: &[&str]) -> Arc<HashSet<String>> {
        Arc::new(addresses.iter().map(|a| a.to_string()).collect())
    }

    fn set(addresses: &[&str]) -> BTreeSet<String> {
        addresses.iter().map(|a| a.to_string()).collect()
    }

    /// sdn -- a -- c -- e
    ///   \-- b     d -/
    fn fixture(dir: &Path) -> Vec<PathBuf> {
        vec![
            write_shard(dir, "0xa.csv", &[("0xSDN", "0xa"), ("0xa", "0xc")]),
            write_shard(dir, "0xb.csv", &[("0xb", "0xsdn"), ("0xb", "0xa")]),
            write_shard(dir, "0xc.csv", &[("0xc", "0xe"), ("0xd", "0xe")]),
        ]
    }

    #[tokio::test]
    async fn test_two_hop_propagation() {
        let dir = TempDir::new().unwrap();
        let shards = fixture(dir.path());

        let (hops, stats) = propagate_hops("ethereum", seeds(&["0xsdn"]), &shards)
            .await
            .unwrap();

        assert_eq!(hops.hop1, set(&["0xa", "0xb"]));
        assert_eq!(hops.hop2, set(&["0xc"]));
        assert_eq!(stats.shards, 3);
        assert_eq!(stats.shard_reads, 6); // every shard read exactly twice
        assert_eq!(stats.shards_skipped, 0);

        let seed_set = seeds(&["0xsdn"]);
        assert_eq!(hops.distance("0xsdn", &seed_set), Some(0));
        assert_eq!(hops.distance("0xb", &seed_set), Some(1));
        assert_eq!(hops.distance("0xc", &seed_set), Some(2));
        assert_eq!(hops.distance("0xe", &seed_set), None);
    }

    #[tokio::test]
    async fn test_hop_sets_are_disjoint_and_order_independent() {
        let dir = TempDir::new().unwrap();
        let mut shards = fixture(dir.path());
        shards.push(write_shard(
            dir.path(),
            "0xf.csv",
            &[("0xsdn", "0xsdn2"), ("0xsdn2", "0xf"), ("0xf", "0xa")],
        ));
        let seed_set = seeds(&["0xsdn", "0xsdn2"]);

        let (forward, _) = propagate_hops("ethereum", seed_set.clone(), &shards).await.unwrap();
        shards.reverse();
        let (reversed, _) = propagate_hops("ethereum", seed_set.clone(), &shards).await.unwrap();

        assert_eq!(forward, reversed);
        assert!(forward.hop1.iter().all(|a| !seed_set.contains(a)));
        assert!(forward.hop2.iter().all(|a| !seed_set.contains(a)));
        assert!(forward.hop2.is_disjoint(&forward.hop1));
        assert_eq!(forward.hop1, set(&["0xa", "0xb", "0xf"]));
        assert_eq!(forward.hop2, set(&["0xc"]));
    }

    #[tokio::test]
    async fn test_shard_without_edge_columns_is_skipped() {
        let dir = TempDir::new().unwrap();
        let mut shards = fixture(dir.path());
        let broken = dir.path().join("broken.csv");
        std::fs::write(&broken, "tx_hash,sender\n0x1,0xsdn\n").unwrap();
        shards.push(broken);

        let (hops, stats) = propagate_hops("ethereum", seeds(&["0xsdn"]), &shards)
            .await
            .unwrap();
        assert_eq!(hops.hop1, set(&["0xa", "0xb"]));
        assert_eq!(stats.shards_skipped, 2); // once per pass
    }

    #[test]
    fn test_list_shards_only_csv() {
        let dir = TempDir::new().unwrap();
        fixture(dir.path());
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let shards = list_shards(dir.path()).unwrap();
        let names: Vec<_> = shards
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["0xa.csv", "0xb.csv", "0xc.csv"]);
    }

    #[tokio::test]
    async fn test_unusable_edge_rows_are_counted() {
        let dir = TempDir::new().unwrap();
        let shard = dir.path().join("edges.csv");
        std::fs::write(
            &shard,
            "from,to\n0xsdn,0xa\n,0xb\n0xsdn,\n0xsdn,0xc,extra\n\"bad\n",
        )
        .unwrap();

        let (hops, stats) = propagate_hops("ethereum", seeds(&["0xsdn"]), &[shard])
            .await
            .unwrap();
        assert_eq!(hops.hop1, set(&["0xa", "0xc"]));
        assert_eq!(stats.shards_skipped, 0);
        // Two good edges and three unusable rows, read once per pass.
        assert_eq!(stats.edges_read, 4);
        assert_eq!(stats.edges_dropped, 6);
    }

    struct BrokenSource<'a> {
        data: &'a [u8],
    }

    impl Read for BrokenSource<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.data.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "connection reset"));
            }
            let n = self.data.len().min(buf.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn test_io_failure_mid_shard_fails_the_shard() {
        let source = BrokenSource {
            data: b"from,to\n0xsdn,0xa\n",
        };
        let mut visited = 0;
        let err = scan_edge_reader(source, Path::new("edges.csv"), |_, _| visited += 1).unwrap_err();

        assert!(matches!(err, InputFormatError::Read { .. }));
        assert_eq!(visited, 1);
    }
}
