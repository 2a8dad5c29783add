//! Lock date arithmetic and the warning schedule derived from it.

mod notify;

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use tracing::debug;

use crate::account::{AccountSnapshot, AttributeValue};
use crate::policy::EvaluationError;

pub use notify::{check_and_notify, plan_notification, PlannedNotification, LOCK_DATE_FORMAT};

/// Lock date and the signed number of whole days left until it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockDecision {
    pub lock_date: NaiveDateTime,
    pub days_before_lock: i64,
}

impl LockDecision {
    pub fn new(lock_date: NaiveDateTime, now: NaiveDateTime) -> Self {
        Self {
            lock_date,
            days_before_lock: days_before_lock(lock_date, now),
        }
    }

    pub fn is_due(&self) -> bool {
        self.days_before_lock <= 0
    }
}

/// Date the account becomes due for locking, or `None` when none of the
/// time attributes carries a value.
///
/// Offsets are discarded and each present timestamp is shifted by
/// `days_valid` days; the furthest candidate wins.
pub fn compute_lock_date(
    account: &AccountSnapshot,
    days_valid: i64,
    time_attributes: &[String],
) -> Result<Option<NaiveDateTime>, EvaluationError> {
    let mut lock_date: Option<NaiveDateTime> = None;

    for attribute in time_attributes {
        let value = account.attribute(attribute);
        let timestamp = match value {
            AttributeValue::Missing => continue,
            AttributeValue::Timestamp(timestamp) => timestamp.naive_local(),
            other => {
                return Err(EvaluationError::NonTimestampAttribute {
                    attribute: attribute.clone(),
                    found: other.kind(),
                })
            }
        };

        let candidate = Duration::try_days(days_valid)
            .and_then(|validity| timestamp.checked_add_signed(validity))
            .ok_or_else(|| EvaluationError::DateOutOfRange {
                attribute: attribute.clone(),
            })?;
        debug!(attribute = %attribute, %candidate, "candidate lock date");

        lock_date = Some(match lock_date {
            Some(current) if current >= candidate => current,
            _ => candidate,
        });
    }

    Ok(lock_date)
}

/// Whole days from `now` until `lock_date`, rounded toward negative infinity.
pub fn days_before_lock(lock_date: NaiveDateTime, now: NaiveDateTime) -> i64 {
    let span = lock_date - now;
    let days = span.num_days();

    // num_days truncates toward zero
    if span < Duration::days(days) {
        days - 1
    } else {
        days
    }
}
