use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::policy::EvaluationError;

/// Attribute carrying the password-policy lock timestamp.
pub const LOCK_ATTRIBUTE: &str = "pwdAccountLockedTime";

/// Generalized-time epoch understood by the password-policy overlay as "locked now".
pub const LOCKED_SENTINEL: &str = "000001010000Z";

/// Distinguished name of a directory record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Value of a single directory attribute as handed over by the directory adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Missing,
    Single(String),
    Multi(Vec<String>),
    Timestamp(DateTime<FixedOffset>),
}

static MISSING: AttributeValue = AttributeValue::Missing;

impl AttributeValue {
    pub fn is_missing(&self) -> bool {
        matches!(self, AttributeValue::Missing)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Missing => "no value",
            AttributeValue::Single(_) => "a string",
            AttributeValue::Multi(_) => "a string list",
            AttributeValue::Timestamp(_) => "a timestamp",
        }
    }

    /// The lock sentinel, alone or as the only entry of a list.
    pub fn is_lock_sentinel(&self) -> bool {
        match self {
            AttributeValue::Single(value) => value == LOCKED_SENTINEL,
            AttributeValue::Multi(values) => {
                matches!(values.as_slice(), [value] if value == LOCKED_SENTINEL)
            }
            _ => false,
        }
    }

    /// First non-empty string value, if any.
    pub fn first_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Single(value) if !value.is_empty() => Some(value.as_str()),
            AttributeValue::Multi(values) => values
                .iter()
                .map(String::as_str)
                .find(|value| !value.is_empty()),
            _ => None,
        }
    }
}

/// Read-only view of one directory record, fetched once per account and run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    id: AccountId,
    attributes: BTreeMap<String, AttributeValue>,
}

impl AccountSnapshot {
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn id(&self) -> &AccountId {
        &self.id
    }

    /// Attribute lookup is case-insensitive on the name, as in LDAP.
    pub fn attribute(&self, name: &str) -> &AttributeValue {
        self.attributes
            .get(name)
            .or_else(|| {
                self.attributes
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
            .unwrap_or(&MISSING)
    }

    /// Replace an attribute, keeping the spelling of an existing key.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: AttributeValue) {
        let name = name.into();
        let key = self
            .attributes
            .keys()
            .find(|key| key.eq_ignore_ascii_case(&name))
            .cloned()
            .unwrap_or(name);

        if value.is_missing() {
            self.attributes.remove(&key);
        } else {
            self.attributes.insert(key, value);
        }
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.attributes
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// String view of an attribute used for identity and address fields.
    pub fn text(&self, name: &str) -> Result<Option<&str>, EvaluationError> {
        let value = self.attribute(name);
        if let AttributeValue::Timestamp(_) = value {
            return Err(EvaluationError::NonStringAttribute {
                attribute: name.to_string(),
                found: value.kind(),
            });
        }
        Ok(value.first_text())
    }

    pub fn cn(&self) -> Option<&str> {
        self.attribute("cn").first_text()
    }

    pub fn mail(&self) -> Result<Option<&str>, EvaluationError> {
        self.text("mail")
    }

    pub fn is_locked(&self) -> bool {
        self.attribute(LOCK_ATTRIBUTE).is_lock_sentinel()
    }

    /// Mark the record as locked; the directory still has to persist it.
    pub fn lock(&mut self) {
        self.set_attribute(
            LOCK_ATTRIBUTE,
            AttributeValue::Single(LOCKED_SENTINEL.to_string()),
        );
    }

    /// Display label for logs: `cn` when present, the DN otherwise.
    pub fn label(&self) -> &str {
        self.cn().unwrap_or(&self.id.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountSnapshot {
        AccountSnapshot::new(AccountId("cn=jdoe,ou=users,dc=example,dc=local".to_string()))
            .with_attribute("cn", AttributeValue::Single("jdoe".to_string()))
            .with_attribute(
                "authTimestamp",
                AttributeValue::Timestamp(
                    DateTime::parse_from_rfc3339("2024-03-01T10:00:00+02:00").expect("valid"),
                ),
            )
    }

    #[test]
    fn attribute_lookup_ignores_case() {
        let account = account();

        assert!(matches!(
            account.attribute("authTimeStamp"),
            AttributeValue::Timestamp(_)
        ));
        assert!(account.attribute("modifyTimestamp").is_missing());
    }

    #[test]
    fn lock_writes_sentinel_once() {
        let mut account = account().with_attribute(
            "PWDACCOUNTLOCKEDTIME",
            AttributeValue::Single("20240101000000Z".to_string()),
        );
        assert!(!account.is_locked());

        account.lock();

        assert!(account.is_locked());
        assert_eq!(
            account
                .attributes()
                .filter(|(name, _)| name.eq_ignore_ascii_case(LOCK_ATTRIBUTE))
                .count(),
            1
        );
    }

    #[test]
    fn sentinel_list_with_one_entry_is_locked() {
        let single_entry = account().with_attribute(
            LOCK_ATTRIBUTE,
            AttributeValue::Multi(vec![LOCKED_SENTINEL.to_string()]),
        );
        assert!(single_entry.is_locked());

        let mixed = account().with_attribute(
            LOCK_ATTRIBUTE,
            AttributeValue::Multi(vec![
                LOCKED_SENTINEL.to_string(),
                "20240101000000Z".to_string(),
            ]),
        );
        assert!(!mixed.is_locked());
    }

    #[test]
    fn text_rejects_timestamps() {
        let account = account();

        let err = account.text("authTimestamp").expect_err("timestamp is not text");
        assert!(matches!(err, EvaluationError::NonStringAttribute { .. }));
        assert_eq!(account.text("mail").expect("missing is fine"), None);
    }

    #[test]
    fn first_text_skips_empty_entries() {
        let value = AttributeValue::Multi(vec![String::new(), "second@example.local".to_string()]);
        assert_eq!(value.first_text(), Some("second@example.local"));
        assert_eq!(AttributeValue::Single(String::new()).first_text(), None);
    }
}
