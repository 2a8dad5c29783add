use chrono::{DateTime, FixedOffset};

use crate::account::{AccountId, AccountSnapshot, AttributeValue};

pub(super) fn account(cn: &str) -> AccountSnapshot {
    AccountSnapshot::new(AccountId(format!("cn={cn},ou=users,dc=example,dc=local")))
        .with_attribute("cn", AttributeValue::Single(cn.to_string()))
}

pub(super) fn single(value: &str) -> AttributeValue {
    AttributeValue::Single(value.to_string())
}

pub(super) fn multi(values: &[&str]) -> AttributeValue {
    AttributeValue::Multi(values.iter().map(|value| value.to_string()).collect())
}

pub(super) fn timestamp(raw: &str) -> AttributeValue {
    let parsed: DateTime<FixedOffset> = DateTime::parse_from_rfc3339(raw).expect("valid timestamp");
    AttributeValue::Timestamp(parsed)
}
