use serde::{Deserialize, Serialize};

use crate::entity::lists::ListName;
use crate::error::RuleEvaluationError;
use crate::transactions::types::{Direction, TransactionRecord};

/// Rule severity, ordered LOW < MEDIUM < HIGH < CRITICAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "low", alias = "Low")]
    Low,
    #[serde(alias = "medium", alias = "Medium")]
    Medium,
    #[serde(alias = "high", alias = "High")]
    High,
    #[serde(alias = "critical", alias = "Critical")]
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

/// Scoring axis a rule contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    #[serde(alias = "C")]
    Compliance,
    #[serde(alias = "E")]
    Exposure,
    #[serde(alias = "B")]
    Behavior,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliance => "COMPLIANCE",
            Self::Exposure => "EXPOSURE",
            Self::Behavior => "BEHAVIOR",
        }
    }
}

/// Boolean counterparty attributes carried on each transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    IsSanctioned,
    IsKnownScam,
    IsMixer,
    IsBridge,
}

impl RiskFlag {
    fn read(&self, tx: &TransactionRecord) -> bool {
        match self {
            Self::IsSanctioned => tx.is_sanctioned,
            Self::IsKnownScam => tx.is_known_scam,
            Self::IsMixer => tx.is_mixer,
            Self::IsBridge => tx.is_bridge,
        }
    }
}

/// Numeric transaction fields usable in threshold comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericField {
    UsdValue,
    Timestamp,
}

impl NumericField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsdValue => "usd_value",
            Self::Timestamp => "timestamp",
        }
    }

    fn read(&self, tx: &TransactionRecord) -> Result<f64, RuleEvaluationError> {
        let value = match self {
            Self::UsdValue => tx
                .usd_value
                .ok_or(RuleEvaluationError::MissingValue(self.as_str()))?,
            Self::Timestamp => tx.timestamp as f64,
        };
        if !value.is_finite() {
            return Err(RuleEvaluationError::NonFinite {
                field: self.as_str(),
                value,
            });
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparison {
    fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::Gt => lhs > rhs,
            Self::Gte => lhs >= rhs,
            Self::Lt => lhs < rhs,
            Self::Lte => lhs <= rhs,
            Self::Eq => lhs == rhs,
        }
    }
}

/// Which address of a record an `in_list` condition looks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressField {
    #[default]
    Counterparty,
    Subject,
    From,
    To,
}

impl AddressField {
    fn read<'a>(&self, tx: &'a TransactionRecord) -> &'a str {
        match self {
            Self::Counterparty => &tx.counterparty,
            Self::Subject => &tx.subject,
            Self::From => &tx.from_address,
            Self::To => &tx.to_address,
        }
    }
}

/// Closed set of rule predicates, built from the rule document at load time.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Flag(RiskFlag),
    Threshold {
        field: NumericField,
        op: Comparison,
        value: f64,
    },
    /// Lowercased categories; matches when the record's entity type is one of them.
    EntityType(Vec<String>),
    Direction(Direction),
    /// The selected address is a member of the named address list.
    InList { list: ListName, field: AddressField },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

/// Read-only data a condition may consult besides the record itself.
pub trait ListLookup {
    fn contains(&self, list: ListName, address: &str) -> bool;
}

impl Condition {
    /// Evaluate against one record. Pure; a failing leaf fails the whole condition.
    pub fn evaluate(
        &self,
        tx: &TransactionRecord,
        lists: &dyn ListLookup,
    ) -> Result<bool, RuleEvaluationError> {
        match self {
            Self::Flag(flag) => Ok(flag.read(tx)),
            Self::Threshold { field, op, value } => Ok(op.apply(field.read(tx)?, *value)),
            Self::EntityType(types) => Ok(types.iter().any(|t| *t == tx.entity_type)),
            Self::Direction(direction) => Ok(tx.direction == *direction),
            Self::InList { list, field } => Ok(lists.contains(*list, field.read(tx))),
            Self::All(children) => {
                for child in children {
                    if !child.evaluate(tx, lists)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Self::Any(children) => {
                for child in children {
                    if child.evaluate(tx, lists)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Self::Not(child) => Ok(!child.evaluate(tx, lists)?),
        }
    }
}

/// An immutable, validated rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub category: Category,
    pub condition: Condition,
    /// When this matches, the rule does not fire.
    pub exception: Option<Condition>,
}

impl Rule {
    pub fn matches(
        &self,
        tx: &TransactionRecord,
        lists: &dyn ListLookup,
    ) -> Result<bool, RuleEvaluationError> {
        if !self.condition.evaluate(tx, lists)? {
            return Ok(false);
        }
        match &self.exception {
            Some(exception) => Ok(!exception.evaluate(tx, lists)?),
            None => Ok(true),
        }
    }
}
