//! Directory access consumed by the locker.

mod json;

use std::path::PathBuf;

use crate::account::{AccountId, AccountSnapshot, LOCKED_SENTINEL, LOCK_ATTRIBUTE};

pub use json::{format_directory_time, parse_directory_time, JsonDirectory};

/// Storage abstraction over the account directory.
pub trait Directory: Send + Sync {
    fn list_candidate_accounts(
        &self,
        filter: &AccountFilter,
    ) -> Result<Vec<AccountId>, DirectoryError>;
    fn fetch_account(&self, id: &AccountId) -> Result<AccountSnapshot, DirectoryError>;
    fn persist_account(&self, account: &AccountSnapshot) -> Result<(), DirectoryError>;
}

/// Selection of accounts a run should look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccountFilter {
    /// Accounts whose lock attribute does not carry the sentinel yet.
    #[default]
    NotLocked,
}

impl AccountFilter {
    /// Equivalent LDAP search filter.
    pub fn ldap_filter(&self) -> String {
        match self {
            AccountFilter::NotLocked => format!("(!({LOCK_ATTRIBUTE}={LOCKED_SENTINEL}))"),
        }
    }

    pub fn accepts(&self, account: &AccountSnapshot) -> bool {
        match self {
            AccountFilter::NotLocked => !account.is_locked(),
        }
    }
}

/// Directory transport or data failure.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("account '{0}' not found")]
    NotFound(AccountId),
    #[error("unable to access directory export '{path}'")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("directory export '{path}' is malformed")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("account '{account}', attribute '{attribute}': {reason}")]
    UnsupportedAttribute {
        account: AccountId,
        attribute: String,
        reason: String,
    },
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AttributeValue;

    #[test]
    fn not_locked_filter_matches_ldap_syntax() {
        assert_eq!(
            AccountFilter::NotLocked.ldap_filter(),
            "(!(pwdAccountLockedTime=000001010000Z))"
        );
    }

    #[test]
    fn not_locked_filter_skips_sentinel_only() {
        let mut account = AccountSnapshot::new(AccountId("cn=a,dc=l".to_string())).with_attribute(
            LOCK_ATTRIBUTE,
            AttributeValue::Single("20250101000000Z".to_string()),
        );
        assert!(AccountFilter::NotLocked.accepts(&account));

        account.lock();
        assert!(!AccountFilter::NotLocked.accepts(&account));
    }
}
