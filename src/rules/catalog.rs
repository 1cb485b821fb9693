use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::entity::lists::ListName;
use crate::error::ConfigError;
use crate::transactions::types::Direction;

use super::types::{
    AddressField, Category, Comparison, Condition, NumericField, RiskFlag, Rule, Severity,
};

#[derive(Debug, Deserialize)]
struct RuleSetDocument {
    // Required: a misspelt key must not load as an empty catalog.
    rules: Vec<RawRule>,
}

#[derive(Debug, Deserialize)]
struct RawRule {
    id: Option<String>,
    name: Option<String>,
    severity: Option<Severity>,
    #[serde(alias = "axis")]
    category: Option<Category>,
    condition: Option<ConditionDef>,
    exceptions: Option<ConditionDef>,
}

/// One condition node as written in the rule document. Exactly one key must be set.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionDef {
    flag: Option<RiskFlag>,
    threshold: Option<ThresholdDef>,
    entity_type: Option<Vec<String>>,
    direction: Option<Direction>,
    in_list: Option<InListDef>,
    all: Option<Vec<ConditionDef>>,
    any: Option<Vec<ConditionDef>>,
    not: Option<Box<ConditionDef>>,
}

/// `in_list: sdn` checks the counterparty; the long form picks the address.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InListDef {
    Counterparty(ListName),
    Field {
        list: ListName,
        #[serde(default)]
        field: AddressField,
    },
}

#[derive(Debug, Deserialize)]
struct ThresholdDef {
    field: NumericField,
    op: Comparison,
    value: f64,
}

impl ConditionDef {
    fn build(self) -> Result<Condition, String> {
        let mut built = Vec::new();

        if let Some(flag) = self.flag {
            built.push(Condition::Flag(flag));
        }
        if let Some(t) = self.threshold {
            if !t.value.is_finite() {
                return Err(format!("threshold value for '{}' is not finite", t.field.as_str()));
            }
            built.push(Condition::Threshold {
                field: t.field,
                op: t.op,
                value: t.value,
            });
        }
        if let Some(types) = self.entity_type {
            if types.is_empty() {
                return Err("entity_type needs at least one category".to_string());
            }
            built.push(Condition::EntityType(
                types.iter().map(|t| t.trim().to_lowercase()).collect(),
            ));
        }
        if let Some(direction) = self.direction {
            built.push(Condition::Direction(direction));
        }
        if let Some(def) = self.in_list {
            let (list, field) = match def {
                InListDef::Counterparty(list) => (list, AddressField::Counterparty),
                InListDef::Field { list, field } => (list, field),
            };
            built.push(Condition::InList { list, field });
        }
        if let Some(children) = self.all {
            built.push(Condition::All(build_children("all", children)?));
        }
        if let Some(children) = self.any {
            built.push(Condition::Any(build_children("any", children)?));
        }
        if let Some(child) = self.not {
            built.push(Condition::Not(Box::new(child.build()?)));
        }

        match built.len() {
            1 => Ok(built.remove(0)),
            0 => Err("condition node is empty".to_string()),
            n => Err(format!(
                "condition node has {n} keys; wrap them in `all` or `any`"
            )),
        }
    }
}

fn build_children(kind: &str, children: Vec<ConditionDef>) -> Result<Vec<Condition>, String> {
    if children.is_empty() {
        return Err(format!("`{kind}` needs at least one child condition"));
    }
    children.into_iter().map(ConditionDef::build).collect()
}

/// Immutable index of validated rules, in document order.
#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    rules: Vec<Rule>,
    by_id: HashMap<String, usize>,
}

impl RuleCatalog {
    /// Load a YAML rule set from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let catalog = Self::from_yaml_str(&content, path)?;
        if catalog.is_empty() {
            tracing::warn!(
                path = %path.display(),
                "Rule catalog is empty; every transaction will score 0"
            );
        }
        tracing::info!(
            rules = catalog.len(),
            path = %path.display(),
            "Loaded rule catalog"
        );
        Ok(catalog)
    }

    /// Parse a YAML rule set. `origin` only feeds error messages.
    pub fn from_yaml_str(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let document: RuleSetDocument =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;

        let mut rules = Vec::with_capacity(document.rules.len());
        for (index, raw) in document.rules.into_iter().enumerate() {
            let id = raw
                .id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .ok_or(ConfigError::MissingRuleId { index })?;

            let condition = raw
                .condition
                .ok_or_else(|| ConfigError::MissingCondition { id: id.clone() })?
                .build()
                .map_err(|reason| ConfigError::InvalidCondition {
                    id: id.clone(),
                    reason,
                })?;

            let exception = raw
                .exceptions
                .map(ConditionDef::build)
                .transpose()
                .map_err(|reason| ConfigError::InvalidCondition {
                    id: id.clone(),
                    reason: format!("exceptions: {reason}"),
                })?;

            rules.push(Rule {
                name: raw.name.unwrap_or_else(|| id.clone()),
                severity: raw.severity.unwrap_or(Severity::Medium),
                category: raw.category.unwrap_or(Category::Behavior),
                id,
                condition,
                exception,
            });
        }

        Self::from_rules(rules)
    }

    /// Build a catalog from already-constructed rules, rejecting duplicate ids.
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self, ConfigError> {
        let mut by_id = HashMap::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            if let Some(first) = by_id.insert(rule.id.clone(), index) {
                return Err(ConfigError::DuplicateRuleId {
                    id: rule.id.clone(),
                    first,
                    second: index,
                });
            }
        }
        Ok(Self { rules, by_id })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.by_id.get(id).map(|&idx| &self.rules[idx])
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
