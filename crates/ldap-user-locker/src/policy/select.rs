use tracing::debug;

use super::{compare, EvaluationError, PolicyRule};
use crate::account::AccountSnapshot;

/// Specificity of `policy` for `account`: the number of matched condition
/// attributes, or `None` when any condition fails.
pub fn match_policy(
    account: &AccountSnapshot,
    policy: &PolicyRule,
) -> Result<Option<usize>, EvaluationError> {
    let mut score = 0;

    for (attribute, spec) in &policy.condition_attributes {
        if !compare(attribute, account.attribute(attribute), spec)? {
            debug!(attribute = %attribute, "policy not applicable");
            return Ok(None);
        }
        score += 1;
    }

    Ok(Some(score))
}

/// Most specific applicable policy; ties go to the earliest entry.
pub fn select_best<'a>(
    account: &AccountSnapshot,
    policies: &'a [PolicyRule],
) -> Result<Option<&'a PolicyRule>, EvaluationError> {
    let mut best: Option<(usize, &PolicyRule)> = None;

    for (index, policy) in policies.iter().enumerate() {
        let Some(score) = match_policy(account, policy)? else {
            continue;
        };
        debug!(index, score, "applicable policy");

        match best {
            Some((best_score, _)) if score <= best_score => {}
            _ => best = Some((score, policy)),
        }
    }

    Ok(best.map(|(_, policy)| policy))
}
