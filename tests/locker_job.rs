use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveDate, NaiveDateTime};
use ldap_user_locker::config::LockerConfig;
use ldap_user_locker::directory::{AccountFilter, Directory, DirectoryError, JsonDirectory};
use ldap_user_locker::mailer::{
    MailTransport, NotificationError, Notifier, RenderedMessage, TemplateMailer,
};
use ldap_user_locker::{AccountId, AccountSnapshot, UserLocker, LOCKED_SENTINEL};
use serde_json::json;

fn now() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 15)
        .and_then(|date| date.and_hms_opt(6, 0, 0))
        .expect("valid run time")
}

fn seen(days_ago: i64) -> serde_json::Value {
    json!({ "timestamp": (now() - Duration::days(days_ago)).format("%Y%m%d%H%M%SZ").to_string() })
}

fn dn(cn: &str) -> AccountId {
    AccountId(format!("cn={cn},ou=users,dc=example,dc=local"))
}

#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<RenderedMessage>>>);

impl MailTransport for Outbox {
    fn deliver(&self, message: &RenderedMessage) -> Result<(), NotificationError> {
        self.0.lock().expect("outbox mutex").push(message.clone());
        Ok(())
    }
}

/// Counts writes so the single-persist guarantee can be checked.
struct CountingDirectory {
    inner: JsonDirectory,
    persisted: Mutex<Vec<AccountId>>,
}

impl Directory for CountingDirectory {
    fn list_candidate_accounts(
        &self,
        filter: &AccountFilter,
    ) -> Result<Vec<AccountId>, DirectoryError> {
        self.inner.list_candidate_accounts(filter)
    }

    fn fetch_account(&self, id: &AccountId) -> Result<AccountSnapshot, DirectoryError> {
        self.inner.fetch_account(id)
    }

    fn persist_account(&self, account: &AccountSnapshot) -> Result<(), DirectoryError> {
        self.persisted
            .lock()
            .expect("persist mutex")
            .push(account.id().clone());
        self.inner.persist_account(account)
    }
}

fn write_fixtures(dir: &Path) {
    fs::write(
        dir.join("config.json"),
        json!({
            "LDAP": { "url": "ldaps://ldap.example.local", "baseDn": "dc=example,dc=local" },
            "SMTP": { "url": "smtp://mail.example.local:2525", "from": "locker@example.local" },
            "users": [
                {
                    "days_valid": 30,
                    "time_attributes": ["authTimestamp"],
                    "lock_notifications": [
                        { "days_before": 0, "template": { "file": "templates/final.txt" } },
                        { "days_before": 7, "template": { "file": "templates/week.txt", "subject": "{lockDays} days left" } }
                    ]
                },
                {
                    "days_valid": 10,
                    "time_attributes": ["authTimestamp"],
                    "condition_attributes": {
                        "displayName": {
                            "comparison": { "type": "regexp", "condition": "any" },
                            "values": ["test.*"]
                        }
                    }
                }
            ]
        })
        .to_string(),
    )
    .expect("write config");

    fs::create_dir_all(dir.join("templates")).expect("template dir");
    fs::write(
        dir.join("templates/final.txt"),
        "Hello {cn}, your account is locked as of {lockDate}.",
    )
    .expect("write final template");
    fs::write(dir.join("templates/week.txt"), "{cn}: {lockDays} days left")
        .expect("write week template");

    fs::write(
        dir.join("accounts.json"),
        json!([
            {
                "id": dn("alice").0,
                "attributes": { "cn": "alice", "mail": "alice@example.local", "authTimestamp": seen(40) }
            },
            {
                "id": dn("tester").0,
                "attributes": { "cn": "tester", "displayName": "Test Account", "authTimestamp": seen(12) }
            },
            {
                "id": dn("bob").0,
                "attributes": { "cn": "bob", "mail": "bob@example.local", "authTimestamp": seen(23) }
            },
            {
                "id": dn("ghost").0,
                "attributes": { "cn": "ghost", "pwdAccountLockedTime": LOCKED_SENTINEL }
            },
            {
                "id": dn("idle").0,
                "attributes": { "cn": "idle", "mail": "idle@example.local" }
            }
        ])
        .to_string(),
    )
    .expect("write accounts");
}

#[test]
fn scheduled_run_warns_then_locks_due_accounts() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixtures(dir.path());

    let config = LockerConfig::from_path_with_env(&dir.path().join("config.json"), &|_| None)
        .expect("config loads");
    let directory = Arc::new(CountingDirectory {
        inner: JsonDirectory::open(dir.path().join("accounts.json")).expect("export opens"),
        persisted: Mutex::new(Vec::new()),
    });
    let outbox = Outbox::default();
    let mail_outbox = outbox.clone();
    let base_dir = config.base_dir.clone();

    let locker = UserLocker::new(directory.clone(), config.policies, move || {
        Ok(Box::new(TemplateMailer::new(
            mail_outbox.clone(),
            "locker@example.local",
            &base_dir,
        )) as Box<dyn Notifier>)
    });

    let summary = locker.run(now()).expect("run succeeds");

    assert_eq!(summary.processed, 4);
    assert_eq!(summary.locked, vec![dn("alice"), dn("tester")]);
    assert_eq!(summary.pending, 1);
    assert_eq!(summary.never_locks, 1);
    assert_eq!(summary.no_policy, 0);
    assert_eq!(summary.notifications_sent, 2);
    assert_eq!(
        *directory.persisted.lock().expect("persist mutex"),
        vec![dn("alice"), dn("tester")]
    );

    let sent = outbox.0.lock().expect("outbox mutex");
    assert_eq!(sent.len(), 2);
    let lock_date = (now() - Duration::days(10)).format("%Y-%d-%m").to_string();
    assert_eq!(sent[0].to, "alice@example.local");
    assert_eq!(
        sent[0].body,
        format!("Hello alice, your account is locked as of {lock_date}.")
    );
    assert_eq!(sent[1].to, "bob@example.local");
    assert_eq!(sent[1].subject, "7 days left");
    assert_eq!(sent[1].body, "bob: 7 days left");

    let reopened = JsonDirectory::open(dir.path().join("accounts.json")).expect("export reopens");
    for cn in ["alice", "tester"] {
        assert!(reopened.fetch_account(&dn(cn)).expect("fetches").is_locked());
    }
    assert!(!reopened.fetch_account(&dn("bob")).expect("fetches").is_locked());
}

#[test]
fn failed_warning_aborts_before_the_lock_is_written() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_fixtures(dir.path());

    let config = LockerConfig::from_path_with_env(&dir.path().join("config.json"), &|_| None)
        .expect("config loads");
    let export = dir.path().join("accounts.json");
    let locker = UserLocker::new(
        Arc::new(JsonDirectory::open(&export).expect("export opens")),
        config.policies,
        || {
            Ok(Box::new(TemplateMailer::new(
                Outbox::default(),
                "locker@example.local",
                Path::new("/nonexistent"),
            )) as Box<dyn Notifier>)
        },
    );

    // templates resolve against a missing directory
    assert!(matches!(
        locker.run(now()),
        Err(ldap_user_locker::LockerError::Notification(
            NotificationError::Template { .. }
        ))
    ));

    let reopened = JsonDirectory::open(&export).expect("export reopens");
    let candidates = reopened
        .list_candidate_accounts(&AccountFilter::NotLocked)
        .expect("lists");
    assert!(candidates.contains(&dn("alice")));
    assert!(!candidates.contains(&dn("ghost")));
}
