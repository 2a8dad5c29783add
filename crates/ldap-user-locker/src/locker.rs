//! Batch run over every unlocked account: select, schedule, warn, lock.

use std::cell::{OnceCell, RefCell};
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::account::AccountId;
use crate::directory::{AccountFilter, Directory, DirectoryError};
use crate::mailer::{NotificationError, Notifier, Substitutions};
use crate::policy::{EvaluationError, PolicyEngine, TemplateReference};
use crate::schedule::{check_and_notify, compute_lock_date, LockDecision};

/// Run behaviour switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Record per-account failures and continue instead of aborting the run.
    pub keep_going: bool,
}

/// What happened to a single account during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccountOutcome {
    NoPolicy,
    NeverLocks,
    Pending {
        lock_date: NaiveDateTime,
        days_before_lock: i64,
        notified: bool,
    },
    Locked {
        lock_date: NaiveDateTime,
        days_before_lock: i64,
        notified: bool,
    },
}

impl AccountOutcome {
    fn notified(&self) -> bool {
        matches!(
            self,
            AccountOutcome::Pending { notified: true, .. }
                | AccountOutcome::Locked { notified: true, .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountFailure {
    pub account: AccountId,
    pub error: String,
}

/// Totals reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub processed: usize,
    pub no_policy: usize,
    pub never_locks: usize,
    pub pending: usize,
    pub locked: Vec<AccountId>,
    pub notifications_sent: usize,
    pub failures: Vec<AccountFailure>,
}

impl RunSummary {
    fn record(&mut self, account: &AccountId, outcome: &AccountOutcome) {
        self.processed += 1;
        if outcome.notified() {
            self.notifications_sent += 1;
        }
        match outcome {
            AccountOutcome::NoPolicy => self.no_policy += 1,
            AccountOutcome::NeverLocks => self.never_locks += 1,
            AccountOutcome::Pending { .. } => self.pending += 1,
            AccountOutcome::Locked { .. } => self.locked.push(account.clone()),
        }
    }
}

/// Failure while processing the batch.
#[derive(Debug, thiserror::Error)]
pub enum LockerError {
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Notification(#[from] NotificationError),
}

impl LockerError {
    /// Errors that stop the run even when failures are otherwise tolerated.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LockerError::Notification(NotificationError::Setup(_))
                | LockerError::Directory(DirectoryError::Unavailable(_) | DirectoryError::Io { .. })
        )
    }
}

/// Per-run notifier, built on the first warning that is actually due and
/// dropped when the run ends.
struct LazyNotifier<'a, F> {
    factory: &'a RefCell<F>,
    notifier: OnceCell<Box<dyn Notifier>>,
}

impl<'a, F> LazyNotifier<'a, F> {
    fn new(factory: &'a RefCell<F>) -> Self {
        Self {
            factory,
            notifier: OnceCell::new(),
        }
    }
}

impl<F> Notifier for LazyNotifier<'_, F>
where
    F: FnMut() -> Result<Box<dyn Notifier>, NotificationError>,
{
    fn send(
        &self,
        mail_to: &str,
        template: &TemplateReference,
        substitutions: &Substitutions,
    ) -> Result<(), NotificationError> {
        let notifier = match self.notifier.get() {
            Some(notifier) => notifier,
            None => {
                let mut factory = self.factory.borrow_mut();
                let built = (*factory)()?;
                debug!("mail notifier initialised");
                self.notifier.get_or_init(|| built)
            }
        };
        notifier.send(mail_to, template, substitutions)
    }
}

/// Applies the policy engine to every unlocked account of a directory.
pub struct UserLocker<D, F> {
    directory: Arc<D>,
    engine: PolicyEngine,
    notifier_factory: RefCell<F>,
    options: RunOptions,
}

impl<D, F> UserLocker<D, F>
where
    D: Directory,
    F: FnMut() -> Result<Box<dyn Notifier>, NotificationError>,
{
    /// `notifier_factory` runs at most once per run, when the first warning is due.
    pub fn new(directory: Arc<D>, engine: PolicyEngine, notifier_factory: F) -> Self {
        Self {
            directory,
            engine,
            notifier_factory: RefCell::new(notifier_factory),
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    /// Process every candidate account once.
    pub fn run(&self, now: NaiveDateTime) -> Result<RunSummary, LockerError> {
        let candidates = self
            .directory
            .list_candidate_accounts(&AccountFilter::NotLocked)?;
        info!(
            candidates = candidates.len(),
            policies = self.engine.policies().len(),
            %now,
            "locking run started"
        );

        let notifier = LazyNotifier::new(&self.notifier_factory);
        let mut summary = RunSummary::default();
        for id in &candidates {
            match self.process_account(id, now, &notifier) {
                Ok(outcome) => summary.record(id, &outcome),
                Err(err) if self.options.keep_going && !err.is_fatal() => {
                    warn!(account = %id, error = %err, "account skipped");
                    summary.failures.push(AccountFailure {
                        account: id.clone(),
                        error: err.to_string(),
                    });
                }
                Err(err) => {
                    error!(account = %id, error = %err, "locking run aborted");
                    return Err(err);
                }
            }
        }

        info!(
            processed = summary.processed,
            locked = summary.locked.len(),
            notifications = summary.notifications_sent,
            failures = summary.failures.len(),
            "locking run finished"
        );
        Ok(summary)
    }

    /// Evaluate a single account; a due warning is sent before the lock is written.
    pub fn process_account(
        &self,
        id: &AccountId,
        now: NaiveDateTime,
        notifier: &dyn Notifier,
    ) -> Result<AccountOutcome, LockerError> {
        let mut account = self.directory.fetch_account(id)?;

        let Some(policy) = self.engine.select(&account)? else {
            info!(account = %account.label(), "no matching policy, account left untouched");
            return Ok(AccountOutcome::NoPolicy);
        };

        let Some(lock_date) =
            compute_lock_date(&account, policy.days_valid, &policy.time_attributes)?
        else {
            info!(account = %account.label(), "no time attribute set, account never locks");
            return Ok(AccountOutcome::NeverLocks);
        };

        let decision = LockDecision::new(lock_date, now);
        debug!(
            account = %account.label(),
            %lock_date,
            days_before_lock = decision.days_before_lock,
            "lock date computed"
        );

        let notified = check_and_notify(
            &account,
            policy,
            lock_date,
            decision.days_before_lock,
            notifier,
        )?;

        if !decision.is_due() {
            return Ok(AccountOutcome::Pending {
                lock_date,
                days_before_lock: decision.days_before_lock,
                notified,
            });
        }

        account.lock();
        self.directory.persist_account(&account)?;
        info!(account = %account.label(), %lock_date, "account locked");

        Ok(AccountOutcome::Locked {
            lock_date,
            days_before_lock: decision.days_before_lock,
            notified,
        })
    }
}
