use serde::{Deserialize, Serialize};

/// Direction of a transaction relative to the subject address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// One normalized transaction from a subject address's history.
/// All addresses are lowercased.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub chain: String,
    pub subject: String,
    pub tx_hash: String,
    pub timestamp: i64,
    pub from_address: String,
    pub to_address: String,
    pub counterparty: String,
    pub direction: Direction,
    /// `None` when the source value was absent or unparseable.
    pub usd_value: Option<f64>,
    pub entity_type: String,
    pub is_sanctioned: bool,
    pub is_known_scam: bool,
    pub is_mixer: bool,
    pub is_bridge: bool,
}
