//! Declarative locking policies and the matching rules applied to accounts.

mod compare;
mod select;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::PathBuf;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::account::AccountSnapshot;

pub use compare::compare;
pub use select::{match_policy, select_best};

/// How configured values are compared with observed attribute values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComparisonType {
    #[default]
    Flat,
    Regexp,
}

impl ComparisonType {
    fn parse(raw: Option<&str>) -> Result<Self, MatchSpecError> {
        match raw {
            None | Some("") => Ok(Self::default()),
            Some("flat") => Ok(Self::Flat),
            Some("regexp") => Ok(Self::Regexp),
            Some(other) => Err(MatchSpecError::UnsupportedComparisonType(other.to_string())),
        }
    }
}

/// Whether every configured value or just one of them has to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComparisonCondition {
    #[default]
    All,
    Any,
}

impl ComparisonCondition {
    fn parse(raw: Option<&str>) -> Result<Self, MatchSpecError> {
        match raw {
            None | Some("") => Ok(Self::default()),
            Some("all") => Ok(Self::All),
            Some("any") => Ok(Self::Any),
            Some(other) => Err(MatchSpecError::UnsupportedCondition(other.to_string())),
        }
    }
}

/// Validated match specification for one condition attribute.
#[derive(Debug, Clone)]
pub struct MatchSpec {
    comparison: ComparisonType,
    condition: ComparisonCondition,
    values: Vec<String>,
    patterns: Vec<Regex>,
}

impl MatchSpec {
    /// Validate configured values and compile regexp patterns up front.
    pub fn new(
        comparison: ComparisonType,
        condition: ComparisonCondition,
        values: Vec<String>,
    ) -> Result<Self, MatchSpecError> {
        if values.is_empty() {
            return Err(MatchSpecError::MissingValues);
        }
        if let Some(empty) = values.iter().find(|value| value.is_empty()) {
            return Err(MatchSpecError::InvalidConditionValue(format!("{empty:?}")));
        }

        let patterns = match comparison {
            ComparisonType::Flat => Vec::new(),
            ComparisonType::Regexp => values
                .iter()
                .map(|pattern| {
                    RegexBuilder::new(&format!("^(?:{pattern})"))
                        .case_insensitive(true)
                        .build()
                        .map_err(|source| MatchSpecError::InvalidPattern {
                            pattern: pattern.clone(),
                            source,
                        })
                })
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(Self {
            comparison,
            condition,
            values,
            patterns,
        })
    }

    pub fn flat(condition: ComparisonCondition, values: &[&str]) -> Result<Self, MatchSpecError> {
        Self::new(
            ComparisonType::Flat,
            condition,
            values.iter().map(|value| value.to_string()).collect(),
        )
    }

    pub fn regexp(condition: ComparisonCondition, values: &[&str]) -> Result<Self, MatchSpecError> {
        Self::new(
            ComparisonType::Regexp,
            condition,
            values.iter().map(|value| value.to_string()).collect(),
        )
    }

    pub fn comparison(&self) -> ComparisonType {
        self.comparison
    }

    pub fn condition(&self) -> ComparisonCondition {
        self.condition
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub(crate) fn pattern(&self, index: usize) -> Option<&Regex> {
        self.patterns.get(index)
    }
}

/// Mail template reference; opaque to the engine and resolved by the notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateReference {
    pub file: PathBuf,
    #[serde(rename = "type", default, deserialize_with = "kind_or_plain")]
    pub kind: TemplateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateKind {
    #[default]
    Plain,
    Html,
}

fn kind_or_plain<'de, D>(deserializer: D) -> Result<TemplateKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<TemplateKind>::deserialize(deserializer)?.unwrap_or_default())
}

/// Warning sent when an account is exactly `days_before` days away from its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRule {
    pub days_before: i64,
    pub template: TemplateReference,
}

/// One entry of the ordered `users` policy list.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub days_valid: i64,
    pub time_attributes: Vec<String>,
    pub condition_attributes: BTreeMap<String, MatchSpec>,
    pub lock_notifications: Vec<NotificationRule>,
}

impl PolicyRule {
    pub fn new(days_valid: i64, time_attributes: &[&str]) -> Self {
        Self {
            days_valid,
            time_attributes: time_attributes.iter().map(|name| name.to_string()).collect(),
            condition_attributes: BTreeMap::new(),
            lock_notifications: Vec::new(),
        }
    }

    pub fn with_condition(mut self, attribute: impl Into<String>, spec: MatchSpec) -> Self {
        self.condition_attributes.insert(attribute.into(), spec);
        self
    }

    pub fn with_notification(mut self, days_before: i64, template: TemplateReference) -> Self {
        self.lock_notifications.push(NotificationRule {
            days_before,
            template,
        });
        self
    }

    /// Validate a raw policy document; `index` is its position in the list.
    pub fn from_document(index: usize, document: PolicyDocument) -> Result<Self, PolicyError> {
        let days_valid = document.days_valid.ok_or_else(|| PolicyError::InvalidPolicy {
            index,
            reason: "'days_valid' is required".to_string(),
        })?;
        if days_valid <= 0 {
            warn!(index, days_valid, "policy has a non-positive validity period");
        }

        let time_attributes = document
            .time_attributes
            .ok_or_else(|| PolicyError::InvalidPolicy {
                index,
                reason: "'time_attributes' must be a list (possibly empty)".to_string(),
            })?;

        let mut condition_attributes = BTreeMap::new();
        for (attribute, raw) in document.condition_attributes.unwrap_or_default() {
            let spec = raw
                .ok_or(MatchSpecError::MissingMatchConfig)
                .and_then(RawMatchSpec::into_spec)
                .map_err(|source| PolicyError::Condition {
                    index,
                    attribute: attribute.clone(),
                    source,
                })?;
            condition_attributes.insert(attribute, spec);
        }

        let lock_notifications = document
            .lock_notifications
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(position, raw)| -> Result<NotificationRule, PolicyError> {
                let invalid = |reason: &str| PolicyError::InvalidNotification {
                    index,
                    position,
                    reason: reason.to_string(),
                };
                Ok(NotificationRule {
                    days_before: raw.days_before.ok_or_else(|| invalid("'days_before' is required"))?,
                    template: raw.template.ok_or_else(|| invalid("'template' is required"))?,
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        Ok(Self {
            days_valid,
            time_attributes,
            condition_attributes,
            lock_notifications,
        })
    }
}

/// Policy entry as it appears in the JSON configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyDocument {
    #[serde(default)]
    pub days_valid: Option<i64>,
    #[serde(default)]
    pub time_attributes: Option<Vec<String>>,
    #[serde(default)]
    pub condition_attributes: Option<BTreeMap<String, Option<RawMatchSpec>>>,
    #[serde(default)]
    pub lock_notifications: Option<Vec<RawNotificationRule>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMatchSpec {
    #[serde(default)]
    pub comparison: Option<RawComparison>,
    #[serde(default)]
    pub values: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawComparison {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawNotificationRule {
    #[serde(default)]
    pub days_before: Option<i64>,
    #[serde(default)]
    pub template: Option<TemplateReference>,
}

impl RawMatchSpec {
    fn into_spec(self) -> Result<MatchSpec, MatchSpecError> {
        let comparison = self.comparison.unwrap_or_default();
        let kind = ComparisonType::parse(comparison.kind.as_deref())?;
        let condition = ComparisonCondition::parse(comparison.condition.as_deref())?;

        let values = self
            .values
            .ok_or(MatchSpecError::MissingValues)?
            .into_iter()
            .map(|value| match value {
                serde_json::Value::String(text) => Ok(text),
                other => Err(MatchSpecError::InvalidConditionValue(other.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        MatchSpec::new(kind, condition, values)
    }
}

/// Ordered, immutable policy list consulted for every account of a run.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    policies: Vec<PolicyRule>,
}

impl PolicyEngine {
    pub fn new(policies: Vec<PolicyRule>) -> Self {
        Self { policies }
    }

    pub fn from_documents(documents: Vec<PolicyDocument>) -> Result<Self, PolicyError> {
        let policies = documents
            .into_iter()
            .enumerate()
            .map(|(index, document)| PolicyRule::from_document(index, document))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(policies))
    }

    pub fn policies(&self) -> &[PolicyRule] {
        &self.policies
    }

    pub fn has_notifications(&self) -> bool {
        self.policies
            .iter()
            .any(|policy| !policy.lock_notifications.is_empty())
    }

    pub fn select(&self, account: &AccountSnapshot) -> Result<Option<&PolicyRule>, EvaluationError> {
        select_best(account, &self.policies)
    }
}

/// Broken match configuration for a single condition attribute.
#[derive(Debug, thiserror::Error)]
pub enum MatchSpecError {
    #[error("no match configuration given")]
    MissingMatchConfig,
    #[error("comparison of type '{0}' is not supported")]
    UnsupportedComparisonType(String),
    #[error("comparison condition '{0}' is not supported")]
    UnsupportedCondition(String),
    #[error("'values' must be a non-empty list")]
    MissingValues,
    #[error("empty or non-string condition value: {0}")]
    InvalidConditionValue(String),
    #[error("invalid regular expression '{pattern}'")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Configuration error in the deployed policy list; always fatal for a run.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy #{index}: {reason}")]
    InvalidPolicy { index: usize, reason: String },
    #[error("policy #{index}, condition attribute '{attribute}': {source}")]
    Condition {
        index: usize,
        attribute: String,
        #[source]
        source: MatchSpecError,
    },
    #[error("policy #{index}, notification #{position}: {reason}")]
    InvalidNotification {
        index: usize,
        position: usize,
        reason: String,
    },
}

/// Account data that cannot be evaluated under the configured policies.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EvaluationError {
    #[error("comparison of attribute '{attribute}' holding {found} is not supported")]
    NonStringAttribute {
        attribute: String,
        found: &'static str,
    },
    #[error("time attribute '{attribute}' holds {found}, expected a timestamp")]
    NonTimestampAttribute {
        attribute: String,
        found: &'static str,
    },
    #[error("lock date for time attribute '{attribute}' is out of range")]
    DateOutOfRange { attribute: String },
}
