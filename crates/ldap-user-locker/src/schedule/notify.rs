use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::account::AccountSnapshot;
use crate::locker::LockerError;
use crate::mailer::{Notifier, Substitutions};
use crate::policy::{EvaluationError, PolicyRule, TemplateReference};

/// Rendering of `lockDate` in warning mails: year, day, month.
pub const LOCK_DATE_FORMAT: &str = "%Y-%d-%m";

const IDENTITY_FIELDS: [&str; 4] = ["cn", "givenName", "sn", "displayName"];

/// Warning mail that is due for an account on this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedNotification {
    pub mail_to: String,
    pub days_before: i64,
    pub template: TemplateReference,
    pub substitutions: Substitutions,
}

/// Decide whether a warning is due today.
///
/// Overdue accounts fall into the zero-day bucket, and only a rule whose
/// `days_before` equals the remaining days fires (the first one on duplicates).
pub fn plan_notification(
    account: &AccountSnapshot,
    policy: &PolicyRule,
    lock_date: NaiveDateTime,
    days_before_lock: i64,
) -> Result<Option<PlannedNotification>, EvaluationError> {
    if policy.lock_notifications.is_empty() {
        return Ok(None);
    }

    let Some(mail_to) = account.mail()? else {
        debug!(account = %account.label(), "no mail address, skipping notification");
        return Ok(None);
    };

    let days_before = days_before_lock.max(0);
    let Some(rule) = policy
        .lock_notifications
        .iter()
        .find(|rule| rule.days_before == days_before)
    else {
        debug!(account = %account.label(), days_before, "no notification scheduled");
        return Ok(None);
    };

    let mut substitutions = Substitutions::default();
    for field in IDENTITY_FIELDS {
        substitutions.insert(field, account.text(field)?.map(str::to_string));
    }
    substitutions.insert(
        "lockDate",
        Some(lock_date.format(LOCK_DATE_FORMAT).to_string()),
    );
    substitutions.insert("lockDays", Some(days_before.to_string()));

    Ok(Some(PlannedNotification {
        mail_to: mail_to.to_string(),
        days_before,
        template: rule.template.clone(),
        substitutions,
    }))
}

/// Plan the warning for an account and hand it to `notifier` when due.
/// Returns whether a notification was sent.
pub fn check_and_notify(
    account: &AccountSnapshot,
    policy: &PolicyRule,
    lock_date: NaiveDateTime,
    days_before_lock: i64,
    notifier: &dyn Notifier,
) -> Result<bool, LockerError> {
    let Some(planned) = plan_notification(account, policy, lock_date, days_before_lock)? else {
        return Ok(false);
    };

    info!(
        account = %account.label(),
        mail_to = %planned.mail_to,
        days_before = planned.days_before,
        "sending lock warning"
    );
    notifier.send(&planned.mail_to, &planned.template, &planned.substitutions)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{AccountId, AttributeValue};
    use crate::mailer::NotificationError;
    use crate::policy::TemplateKind;
    use chrono::NaiveDate;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, PathBuf, Substitutions)>>,
    }

    impl Notifier for RecordingNotifier {
        fn send(
            &self,
            mail_to: &str,
            template: &TemplateReference,
            substitutions: &Substitutions,
        ) -> Result<(), NotificationError> {
            self.sent.lock().expect("notifier mutex").push((
                mail_to.to_string(),
                template.file.clone(),
                substitutions.clone(),
            ));
            Ok(())
        }
    }

    fn template(file: &str) -> TemplateReference {
        TemplateReference {
            file: PathBuf::from(file),
            kind: TemplateKind::Plain,
            subject: None,
            signature: None,
        }
    }

    fn lock_date() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 7)
            .and_then(|date| date.and_hms_opt(8, 0, 0))
            .expect("valid date")
    }

    fn policy() -> PolicyRule {
        PolicyRule::new(30, &["authTimestamp"])
            .with_notification(7, template("week.txt"))
            .with_notification(0, template("final.txt"))
            .with_notification(0, template("duplicate.txt"))
    }

    fn account() -> AccountSnapshot {
        AccountSnapshot::new(AccountId("cn=jdoe,dc=example,dc=local".to_string()))
            .with_attribute("cn", AttributeValue::Single("jdoe".to_string()))
            .with_attribute("givenName", AttributeValue::Single("John".to_string()))
            .with_attribute("sn", AttributeValue::Single("Doe".to_string()))
            .with_attribute(
                "mail",
                AttributeValue::Single("jdoe@example.local".to_string()),
            )
    }

    #[test]
    fn overdue_accounts_use_the_zero_day_rule() {
        let notifier = RecordingNotifier::default();

        let sent = check_and_notify(&account(), &policy(), lock_date(), -5, &notifier)
            .expect("notification succeeds");

        assert!(sent);
        let sent = notifier.sent.lock().expect("notifier mutex");
        assert_eq!(sent.len(), 1);
        let (mail_to, file, substitutions) = &sent[0];
        assert_eq!(mail_to, "jdoe@example.local");
        assert_eq!(file, &PathBuf::from("final.txt"));
        assert_eq!(substitutions.get("lockDays"), Some("0"));
    }

    #[test]
    fn substitutions_carry_identity_and_swapped_date() {
        let planned = plan_notification(&account(), &policy(), lock_date(), 7)
            .expect("plans")
            .expect("due");

        assert_eq!(planned.template.file, PathBuf::from("week.txt"));
        assert_eq!(planned.substitutions.get("cn"), Some("jdoe"));
        assert_eq!(planned.substitutions.get("givenName"), Some("John"));
        assert_eq!(planned.substitutions.get("sn"), Some("Doe"));
        assert_eq!(planned.substitutions.get("displayName"), None);
        assert!(planned.substitutions.contains("displayName"));
        assert_eq!(planned.substitutions.get("lockDate"), Some("2025-07-03"));
        assert_eq!(planned.substitutions.get("lockDays"), Some("7"));
    }

    #[test]
    fn nothing_is_sent_without_mail_or_matching_rule() {
        let notifier = RecordingNotifier::default();
        let mut no_mail = account();
        no_mail.set_attribute("mail", AttributeValue::Missing);

        assert!(!check_and_notify(&no_mail, &policy(), lock_date(), 0, &notifier).expect("ok"));
        assert!(!check_and_notify(&account(), &policy(), lock_date(), 3, &notifier).expect("ok"));
        assert!(!check_and_notify(
            &account(),
            &PolicyRule::new(30, &[]),
            lock_date(),
            0,
            &notifier
        )
        .expect("ok"));
        assert!(notifier.sent.lock().expect("notifier mutex").is_empty());
    }
}
