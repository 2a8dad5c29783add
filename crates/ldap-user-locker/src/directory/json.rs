use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{AccountFilter, Directory, DirectoryError};
use crate::account::{AccountId, AccountSnapshot, AttributeValue, LOCK_ATTRIBUTE};

const TIMESTAMP_KEY: &str = "timestamp";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredAccount {
    id: AccountId,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}

impl StoredAccount {
    fn is_locked(&self) -> bool {
        self.attributes
            .iter()
            .any(|(name, value)| {
                name.eq_ignore_ascii_case(LOCK_ATTRIBUTE)
                    && decode_value(value).is_ok_and(|value| value.is_lock_sentinel())
            })
    }

    fn lock_key(&self) -> String {
        self.attributes
            .keys()
            .find(|name| name.eq_ignore_ascii_case(LOCK_ATTRIBUTE))
            .cloned()
            .unwrap_or_else(|| LOCK_ATTRIBUTE.to_string())
    }
}

/// Directory backed by a JSON export of account records.
///
/// Persisting an account writes back its lock attribute only; every other
/// stored value is kept as exported. Each persist rewrites the whole file.
#[derive(Debug)]
pub struct JsonDirectory {
    path: PathBuf,
    records: Mutex<Vec<StoredAccount>>,
}

impl JsonDirectory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref().to_path_buf();
        let text = fs::read_to_string(&path).map_err(|source| DirectoryError::Io {
            path: path.clone(),
            source,
        })?;
        let records: Vec<StoredAccount> =
            serde_json::from_str(&text).map_err(|source| DirectoryError::Format {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), accounts = records.len(), "directory export loaded");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn records(&self) -> Result<std::sync::MutexGuard<'_, Vec<StoredAccount>>, DirectoryError> {
        self.records
            .lock()
            .map_err(|_| DirectoryError::Unavailable("directory store poisoned".to_string()))
    }

    fn write(&self, records: &[StoredAccount]) -> Result<(), DirectoryError> {
        let text =
            serde_json::to_string_pretty(records).map_err(|source| DirectoryError::Format {
                path: self.path.clone(),
                source,
            })?;
        fs::write(&self.path, text).map_err(|source| DirectoryError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Directory for JsonDirectory {
    fn list_candidate_accounts(
        &self,
        filter: &AccountFilter,
    ) -> Result<Vec<AccountId>, DirectoryError> {
        let records = self.records()?;
        debug!(filter = %filter.ldap_filter(), "listing candidate accounts");
        Ok(records
            .iter()
            .filter(|record| match filter {
                AccountFilter::NotLocked => !record.is_locked(),
            })
            .map(|record| record.id.clone())
            .collect())
    }

    fn fetch_account(&self, id: &AccountId) -> Result<AccountSnapshot, DirectoryError> {
        let records = self.records()?;
        let record = records
            .iter()
            .find(|record| &record.id == id)
            .ok_or_else(|| DirectoryError::NotFound(id.clone()))?;

        let mut account = AccountSnapshot::new(record.id.clone());
        for (name, value) in &record.attributes {
            let value = decode_value(value).map_err(|reason| DirectoryError::UnsupportedAttribute {
                account: id.clone(),
                attribute: name.clone(),
                reason,
            })?;
            account.set_attribute(name.clone(), value);
        }
        Ok(account)
    }

    fn persist_account(&self, account: &AccountSnapshot) -> Result<(), DirectoryError> {
        let mut records = self.records()?;
        let record = records
            .iter_mut()
            .find(|record| &record.id == account.id())
            .ok_or_else(|| DirectoryError::NotFound(account.id().clone()))?;

        let key = record.lock_key();
        match encode_value(account.attribute(LOCK_ATTRIBUTE)) {
            Some(value) => {
                record.attributes.insert(key, value);
            }
            None => {
                record.attributes.remove(&key);
            }
        }

        self.write(&records)?;
        debug!(account = %account.id(), path = %self.path.display(), "account persisted");
        Ok(())
    }
}

fn decode_value(value: &Value) -> Result<AttributeValue, String> {
    match value {
        Value::Null => Ok(AttributeValue::Missing),
        Value::String(text) => Ok(AttributeValue::Single(text.clone())),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => Ok(text.clone()),
                Value::Object(_) => Err("lists of timestamps are not supported".to_string()),
                other => Err(format!("unsupported list entry {other}")),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(AttributeValue::Multi),
        Value::Object(fields) => match (fields.len(), fields.get(TIMESTAMP_KEY)) {
            (1, Some(Value::String(raw))) => parse_directory_time(raw)
                .map(AttributeValue::Timestamp)
                .ok_or_else(|| format!("unparseable timestamp '{raw}'")),
            _ => Err("objects must be of the form {\"timestamp\": \"...\"}".to_string()),
        },
        other => Err(format!("unsupported value {other}")),
    }
}

fn encode_value(value: &AttributeValue) -> Option<Value> {
    match value {
        AttributeValue::Missing => None,
        AttributeValue::Single(text) => Some(Value::String(text.clone())),
        AttributeValue::Multi(values) => Some(Value::Array(
            values.iter().cloned().map(Value::String).collect(),
        )),
        AttributeValue::Timestamp(at) => {
            let mut fields = serde_json::Map::new();
            fields.insert(TIMESTAMP_KEY.to_string(), Value::String(format_directory_time(at)));
            Some(Value::Object(fields))
        }
    }
}

/// Parse an LDAP generalized time (`YYYYMMDDHH[MM[SS]][.f](Z|±hhmm)`) or an
/// RFC 3339 timestamp. Fractions of a second are dropped.
pub fn parse_directory_time(raw: &str) -> Option<DateTime<FixedOffset>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed);
    }

    let (stamp, offset) = split_offset(raw)?;
    let stamp = stamp.split(['.', ',']).next()?;
    if !stamp.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let padded = match stamp.len() {
        10 => format!("{stamp}0000"),
        12 => format!("{stamp}00"),
        14 => stamp.to_string(),
        _ => return None,
    };

    NaiveDateTime::parse_from_str(&padded, "%Y%m%d%H%M%S")
        .ok()?
        .and_local_timezone(offset)
        .single()
}

fn split_offset(raw: &str) -> Option<(&str, FixedOffset)> {
    if let Some(stamp) = raw.strip_suffix(['Z', 'z']) {
        return Some((stamp, FixedOffset::east_opt(0)?));
    }

    let split = raw.len().checked_sub(5)?;
    let (stamp, zone) = raw.split_at_checked(split)?;
    let sign = match zone.as_bytes().first()? {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hours: i32 = zone.get(1..3)?.parse().ok()?;
    let minutes: i32 = zone.get(3..5)?.parse().ok()?;
    Some((stamp, FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))?))
}

/// Generalized-time rendering used when records are written back.
pub fn format_directory_time(at: &DateTime<FixedOffset>) -> String {
    if at.offset().local_minus_utc() == 0 {
        at.format("%Y%m%d%H%M%SZ").to_string()
    } else {
        at.format("%Y%m%d%H%M%S%z").to_string()
    }
}
