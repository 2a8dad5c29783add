//! Account locking policy engine.
//!
//! Each candidate account is matched against an ordered list of policies, the
//! most specific policy decides when the account becomes due for locking, and
//! owners are warned by e-mail on the configured days before the lock lands.
//! Directory access and mail delivery sit behind the [`directory::Directory`]
//! and [`mailer::Notifier`] traits so the engine itself stays free of I/O.

pub mod account;
pub mod config;
pub mod directory;
pub mod error;
pub mod locker;
pub mod mailer;
pub mod policy;
pub mod schedule;
pub mod telemetry;

pub use account::{AccountId, AccountSnapshot, AttributeValue, LOCKED_SENTINEL, LOCK_ATTRIBUTE};
pub use locker::{AccountFailure, AccountOutcome, LockerError, RunOptions, RunSummary, UserLocker};
pub use policy::{EvaluationError, PolicyEngine, PolicyRule};
