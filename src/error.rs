use std::path::PathBuf;

/// Malformed configuration or rule definitions. Always fatal for a run.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse '{path}': {message}")]
    Parse { path: PathBuf, message: String },

    #[error("rule #{index} has no id")]
    MissingRuleId { index: usize },

    #[error("duplicate rule id '{id}' (first declared at #{first}, again at #{second})")]
    DuplicateRuleId {
        id: String,
        first: usize,
        second: usize,
    },

    #[error("rule '{id}' has no condition")]
    MissingCondition { id: String },

    #[error("rule '{id}' has an invalid condition: {reason}")]
    InvalidCondition { id: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A whole input file is unusable (unreadable, or missing required columns).
#[derive(Debug, thiserror::Error)]
pub enum InputFormatError {
    #[error("failed to open '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to read header of '{path}': {source}")]
    Header {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("'{path}' is missing required columns: {}", missing.join(", "))]
    MissingColumns { path: PathBuf, missing: Vec<String> },

    #[error("'{path}' has no usable subject address in its file name")]
    BadFileName { path: PathBuf },
}

/// A single row was rejected during normalization.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RowError {
    #[error("unreadable row: {0}")]
    Unreadable(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("unparseable timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("unparseable flag '{field}' = '{value}'")]
    InvalidFlag { field: &'static str, value: String },

    #[error("self-loop transaction")]
    SelfLoop,

    #[error("duplicate tx_hash '{0}'")]
    DuplicateTxHash(String),

    #[error("neither side of the transaction is the subject address")]
    OutOfScope,
}

impl RowError {
    /// Stable key used when counting drops in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreadable(_) => "unreadable",
            Self::MissingField(_) => "missing_field",
            Self::InvalidTimestamp(_) => "invalid_timestamp",
            Self::InvalidFlag { .. } => "invalid_flag",
            Self::SelfLoop => "self_loop",
            Self::DuplicateTxHash(_) => "duplicate_tx_hash",
            Self::OutOfScope => "out_of_scope",
        }
    }
}

/// One rule failed on one row. Isolated: the rule counts as non-matching.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleEvaluationError {
    #[error("field '{0}' has no value")]
    MissingValue(&'static str),

    #[error("field '{field}' is not a finite number ({value})")]
    NonFinite { field: &'static str, value: f64 },
}
