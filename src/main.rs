use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveDateTime};
use clap::Parser;
use ldap_user_locker::config::{LockerConfig, TelemetryConfig};
use ldap_user_locker::directory::JsonDirectory;
use ldap_user_locker::error::AppError;
use ldap_user_locker::mailer::{NotificationError, Notifier, TemplateMailer};
use ldap_user_locker::{telemetry, RunOptions, UserLocker};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "ldap-user-locker",
    about = "Lock directory accounts that outlived their policy and warn owners ahead of time",
    version
)]
struct Cli {
    /// Locker configuration document (LDAP, SMTP and user policies)
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// JSON export of the directory accounts to process
    #[arg(long)]
    directory: PathBuf,
    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Record per-account failures and keep processing the remaining accounts
    #[arg(long)]
    keep_going: bool,
    /// Evaluation time (YYYY-MM-DD or YYYY-MM-DDTHH:MM:SS, defaults to now)
    #[arg(long, value_parser = parse_now)]
    now: Option<NaiveDateTime>,
    /// Print the run summary as JSON on stdout
    #[arg(long)]
    json: bool,
}

fn main() {
    if let Err(err) = run_cli() {
        eprintln!("application error: {err}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<(), AppError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    telemetry::init(&TelemetryConfig {
        log_level: cli.log_level.clone(),
    })?;

    let config = LockerConfig::from_path(&cli.config)?;
    info!(url = %config.ldap.url, base_dn = %config.ldap.base_dn, "directory configured");

    let directory = Arc::new(JsonDirectory::open(&cli.directory)?);
    let LockerConfig {
        smtp,
        policies,
        base_dir,
        ..
    } = config;

    let notifier_factory = move || -> Result<Box<dyn Notifier>, NotificationError> {
        let settings = smtp.as_ref().ok_or_else(|| {
            NotificationError::Setup("SMTP settings are not configured".to_string())
        })?;
        Ok(Box::new(TemplateMailer::smtp(settings, &base_dir)?))
    };

    let locker = UserLocker::new(directory, policies, notifier_factory).with_options(RunOptions {
        keep_going: cli.keep_going,
    });
    let now = cli.now.unwrap_or_else(|| Local::now().naive_local());
    let summary = locker.run(now)?;

    if cli.json {
        let rendered = serde_json::to_string_pretty(&summary)
            .map_err(|err| AppError::Io(std::io::Error::other(err)))?;
        println!("{rendered}");
    } else {
        println!(
            "processed {} accounts: {} locked, {} pending, {} without policy, {} never locking, {} warnings sent, {} failures",
            summary.processed,
            summary.locked.len(),
            summary.pending,
            summary.no_policy,
            summary.never_locks,
            summary.notifications_sent,
            summary.failures.len()
        );
    }

    Ok(())
}

fn parse_now(raw: &str) -> Result<NaiveDateTime, String> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|date| date.and_time(Default::default()))
        })
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD[THH:MM:SS] ({err})"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn parses_date_and_datetime_overrides() {
        let midnight = parse_now("2025-06-15").expect("date parses");
        assert_eq!(midnight.hour(), 0);

        let morning = parse_now("2025-06-15T08:30:00").expect("datetime parses");
        assert_eq!((morning.hour(), morning.minute()), (8, 30));

        assert!(parse_now("15/06/2025").is_err());
    }

    #[test]
    fn cli_requires_directory_export() {
        assert!(Cli::try_parse_from(["ldap-user-locker"]).is_err());

        let cli = Cli::try_parse_from([
            "ldap-user-locker",
            "--directory",
            "accounts.json",
            "--keep-going",
        ])
        .expect("parses");
        assert_eq!(cli.config, PathBuf::from("config.json"));
        assert_eq!(cli.log_level, "info");
        assert!(cli.keep_going);
        assert!(cli.now.is_none());
    }
}
