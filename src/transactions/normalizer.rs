use std::collections::{BTreeMap, HashSet};
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use serde::Serialize;

use crate::error::{InputFormatError, RowError};

use super::types::{Direction, TransactionRecord};

const REQUIRED_COLUMNS: [&str; 4] = ["tx_hash", "timestamp", "from", "to"];

/// Counters for one normalized file. Drops are keyed by `RowError::kind`.
#[derive(Debug, Default, Clone, Serialize)]
pub struct NormalizeStats {
    pub rows_read: u64,
    pub rows_kept: u64,
    pub missing_usd_value: u64,
    pub dropped: BTreeMap<&'static str, u64>,
}

impl NormalizeStats {
    pub fn rows_dropped(&self) -> u64 {
        self.dropped.values().sum()
    }

    pub fn merge(&mut self, other: &NormalizeStats) {
        self.rows_read += other.rows_read;
        self.rows_kept += other.rows_kept;
        self.missing_usd_value += other.missing_usd_value;
        for (kind, count) in &other.dropped {
            *self.dropped.entry(*kind).or_insert(0) += count;
        }
    }
}

/// Normalized history of one (chain, address) pair, in source file order.
#[derive(Debug, Clone)]
pub struct AddressHistory {
    pub chain: String,
    pub subject: String,
    pub records: Vec<TransactionRecord>,
    pub stats: NormalizeStats,
}

/// Column positions resolved from the CSV header.
struct Columns {
    tx_hash: usize,
    timestamp: usize,
    from: usize,
    to: usize,
    usd_value: Option<usize>,
    entity_type: Option<usize>,
    is_sanctioned: Option<usize>,
    is_known_scam: Option<usize>,
    is_mixer: Option<usize>,
    is_bridge: Option<usize>,
}

impl Columns {
    fn resolve(headers: &csv::StringRecord, path: &Path) -> Result<Self, InputFormatError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
        };

        let missing: Vec<String> = REQUIRED_COLUMNS
            .iter()
            .copied()
            .filter(|c| find(c).is_none())
            .map(|c| c.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(InputFormatError::MissingColumns {
                path: path.to_path_buf(),
                missing,
            });
        }

        // Required columns were checked above.
        let required = |name: &str| find(name).unwrap_or_default();

        Ok(Self {
            tx_hash: required("tx_hash"),
            timestamp: required("timestamp"),
            from: required("from"),
            to: required("to"),
            usd_value: find("usd_value"),
            entity_type: find("entity_type"),
            is_sanctioned: find("is_sanctioned"),
            is_known_scam: find("is_known_scam"),
            is_mixer: find("is_mixer"),
            is_bridge: find("is_bridge"),
        })
    }
}

/// Load `<dir>/<chain>/<address>.csv`. The subject address is the file stem.
pub fn load_address_history(path: &Path, chain: &str) -> Result<AddressHistory, InputFormatError> {
    let subject = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| InputFormatError::BadFileName {
            path: path.to_path_buf(),
        })?;

    let file = std::fs::File::open(path).map_err(|e| InputFormatError::Open {
        path: path.to_path_buf(),
        source: csv::Error::from(e),
    })?;

    normalize_reader(file, path, chain, &subject)
}

/// Normalize raw CSV rows for one subject address.
///
/// Per row, in order: parse required fields, lowercase addresses, drop
/// self-loops, drop repeated tx hashes (first occurrence wins), derive
/// direction (rows that do not involve the subject are dropped).
pub fn normalize_reader<R: Read>(
    reader: R,
    path: &Path,
    chain: &str,
    subject: &str,
) -> Result<AddressHistory, InputFormatError> {
    let subject = subject.to_lowercase();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|e| InputFormatError::Header {
            path: path.to_path_buf(),
            source: e,
        })?
        .clone();
    let columns = Columns::resolve(&headers, path)?;

    let mut stats = NormalizeStats::default();
    let mut seen_hashes: HashSet<String> = HashSet::new();
    let mut records = Vec::new();

    for (row_number, result) in reader.records().enumerate() {
        stats.rows_read += 1;

        // A failing source invalidates the whole file, not just this row.
        let result = match result {
            Err(e) if e.is_io_error() => {
                return Err(InputFormatError::Read {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
            other => other,
        };
        let outcome = result
            .map_err(|e| RowError::Unreadable(e.to_string()))
            .and_then(|row| normalize_row(&row, &columns, chain, &subject, &mut seen_hashes));

        match outcome {
            Ok(record) => {
                if record.usd_value.is_none() {
                    stats.missing_usd_value += 1;
                }
                stats.rows_kept += 1;
                records.push(record);
            }
            Err(e) => {
                tracing::debug!(
                    path = %path.display(),
                    row = row_number + 1,
                    error = %e,
                    "Dropped transaction row"
                );
                *stats.dropped.entry(e.kind()).or_insert(0) += 1;
            }
        }
    }

    if stats.rows_dropped() > 0 || stats.missing_usd_value > 0 {
        tracing::info!(
            path = %path.display(),
            kept = stats.rows_kept,
            dropped = stats.rows_dropped(),
            missing_usd_value = stats.missing_usd_value,
            "Normalized with data-quality issues"
        );
    }

    Ok(AddressHistory {
        chain: chain.to_string(),
        subject,
        records,
        stats,
    })
}

fn normalize_row(
    row: &csv::StringRecord,
    columns: &Columns,
    chain: &str,
    subject: &str,
    seen_hashes: &mut HashSet<String>,
) -> Result<TransactionRecord, RowError> {
    let field = |idx: usize| row.get(idx).map(str::trim).unwrap_or("");
    let optional = |idx: Option<usize>| idx.map(|i| field(i)).unwrap_or("");

    let tx_hash = non_empty(field(columns.tx_hash), "tx_hash")?.to_lowercase();
    let raw_ts = non_empty(field(columns.timestamp), "timestamp")?;
    let timestamp =
        parse_timestamp(raw_ts).ok_or_else(|| RowError::InvalidTimestamp(raw_ts.to_string()))?;
    let from_address = non_empty(field(columns.from), "from")?.to_lowercase();
    let to_address = non_empty(field(columns.to), "to")?.to_lowercase();

    let is_sanctioned = parse_flag(optional(columns.is_sanctioned), "is_sanctioned")?;
    let is_known_scam = parse_flag(optional(columns.is_known_scam), "is_known_scam")?;
    let is_mixer = parse_flag(optional(columns.is_mixer), "is_mixer")?;
    let is_bridge = parse_flag(optional(columns.is_bridge), "is_bridge")?;
    let usd_value = parse_usd_value(optional(columns.usd_value));

    let entity_type = match optional(columns.entity_type) {
        "" => "unknown".to_string(),
        raw => raw.to_lowercase(),
    };

    if from_address == to_address {
        return Err(RowError::SelfLoop);
    }

    if !seen_hashes.insert(tx_hash.clone()) {
        return Err(RowError::DuplicateTxHash(tx_hash));
    }

    let (direction, counterparty) = if from_address == subject {
        (Direction::Outbound, to_address.clone())
    } else if to_address == subject {
        (Direction::Inbound, from_address.clone())
    } else {
        return Err(RowError::OutOfScope);
    };

    Ok(TransactionRecord {
        chain: chain.to_string(),
        subject: subject.to_string(),
        tx_hash,
        timestamp,
        from_address,
        to_address,
        counterparty,
        direction,
        usd_value,
        entity_type,
        is_sanctioned,
        is_known_scam,
        is_mixer,
        is_bridge,
    })
}

fn non_empty<'a>(value: &'a str, name: &'static str) -> Result<&'a str, RowError> {
    if value.is_empty() || value.eq_ignore_ascii_case("nan") || value.eq_ignore_ascii_case("null") {
        Err(RowError::MissingField(name))
    } else {
        Ok(value)
    }
}

/// Accepts unix seconds (integer or float), RFC 3339, or `YYYY-MM-DD HH:MM:SS` (UTC).
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Some(secs);
    }
    if let Ok(secs) = raw.parse::<f64>() {
        return secs.is_finite().then_some(secs as i64);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Missing flag columns and empty cells read as `false`.
fn parse_flag(raw: &str, name: &'static str) -> Result<bool, RowError> {
    match raw.to_ascii_lowercase().as_str() {
        "" | "false" | "f" | "no" | "0" | "0.0" => Ok(false),
        "true" | "t" | "yes" | "1" | "1.0" => Ok(true),
        _ => Err(RowError::InvalidFlag {
            field: name,
            value: raw.to_string(),
        }),
    }
}

/// Negative, non-finite or unparseable values are treated as absent.
fn parse_usd_value(raw: &str) -> Option<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
}
