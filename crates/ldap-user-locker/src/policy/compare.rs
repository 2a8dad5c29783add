use std::slice;

use tracing::debug;

use super::{ComparisonCondition, ComparisonType, EvaluationError, MatchSpec};
use crate::account::AttributeValue;

/// Compare the observed values of `attribute` against a match specification.
///
/// Every comparison is case-insensitive. Under `any` the first match wins;
/// under `all` a single mismatch for a configured value fails the attribute.
/// Empty observed values are skipped, and an attribute without values never
/// matches.
pub fn compare(
    attribute: &str,
    observed: &AttributeValue,
    spec: &MatchSpec,
) -> Result<bool, EvaluationError> {
    let observed: &[String] = match observed {
        AttributeValue::Missing => &[],
        AttributeValue::Single(value) if value.is_empty() => &[],
        AttributeValue::Single(value) => slice::from_ref(value),
        AttributeValue::Multi(values) => values,
        AttributeValue::Timestamp(_) => {
            return Err(EvaluationError::NonStringAttribute {
                attribute: attribute.to_string(),
                found: observed.kind(),
            })
        }
    };

    if observed.is_empty() {
        debug!(attribute, "no values to compare");
        return Ok(false);
    }

    let mut matched = false;
    for (index, configured) in spec.values().iter().enumerate() {
        for value in observed.iter().filter(|value| !value.is_empty()) {
            let is_match = match spec.comparison() {
                ComparisonType::Flat => configured.to_lowercase() == value.to_lowercase(),
                ComparisonType::Regexp => spec
                    .pattern(index)
                    .map(|pattern| pattern.is_match(value))
                    .unwrap_or(false),
            };

            match (is_match, spec.condition()) {
                (true, ComparisonCondition::Any) => {
                    debug!(attribute, %configured, %value, "match, condition satisfied");
                    return Ok(true);
                }
                (true, ComparisonCondition::All) => matched = true,
                (false, ComparisonCondition::All) => {
                    debug!(attribute, %configured, %value, "mismatch, condition failed");
                    return Ok(false);
                }
                (false, ComparisonCondition::Any) => {}
            }
        }
    }

    debug!(attribute, matched, "comparison finished");
    Ok(matched)
}
