use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::policy::{PolicyDocument, PolicyEngine, PolicyError};

const DEFAULT_SMTP_PORT: u16 = 25;

/// Everything a locking run needs, resolved from the JSON document and the environment.
#[derive(Debug, Clone)]
pub struct LockerConfig {
    pub ldap: LdapSettings,
    pub smtp: Option<SmtpSettings>,
    pub policies: PolicyEngine,
    /// Directory of the configuration file; relative paths resolve against it.
    pub base_dir: PathBuf,
}

impl LockerConfig {
    /// Load the configuration file, falling back to process environment variables.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        Self::from_path_with_env(path, &|key| env::var(key).ok())
    }

    pub fn from_path_with_env(
        path: &Path,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = std::path::absolute(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "loading locker configuration");

        let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::parse(&text, &base_dir, env).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: Some(path.clone()),
                source,
            },
            other => other,
        })
    }

    /// Parse a configuration document whose relative paths resolve against `base_dir`.
    pub fn parse(
        text: &str,
        base_dir: &Path,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let document: ConfigDocument =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse { path: None, source })?;

        let documents = document.users.ok_or(ConfigError::MissingPolicies)?;
        let policies = PolicyEngine::from_documents(documents)?;
        let ldap = LdapSettings::resolve(document.ldap.unwrap_or_default(), base_dir, env)?;

        let smtp = document.smtp.unwrap_or_default();
        let smtp = if policies.has_notifications() {
            Some(SmtpSettings::resolve(smtp, env)?)
        } else {
            SmtpSettings::resolve(smtp, env).ok()
        };

        debug!(policies = policies.policies().len(), "configuration resolved");
        Ok(Self {
            ldap,
            smtp,
            policies,
            base_dir: base_dir.to_path_buf(),
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigDocument {
    #[serde(rename = "LDAP", default)]
    ldap: Option<LdapDocument>,
    #[serde(rename = "SMTP", default)]
    smtp: Option<SmtpDocument>,
    #[serde(default)]
    users: Option<Vec<PolicyDocument>>,
}

#[derive(Debug, Default, Deserialize)]
struct LdapDocument {
    url: Option<String>,
    user_cert: Option<String>,
    user_key: Option<String>,
    ca_chain: Option<String>,
    #[serde(rename = "baseDn")]
    base_dn: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SmtpDocument {
    url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    from: Option<String>,
    subject: Option<String>,
}

/// A configured value wins; otherwise the environment variable, if non-empty.
fn lookup(
    configured: Option<String>,
    variable: &'static str,
    env: &dyn Fn(&str) -> Option<String>,
) -> Option<String> {
    configured
        .filter(|value| !value.is_empty())
        .or_else(|| env(variable).filter(|value| !value.is_empty()))
}

fn resolve_path(raw: String, base_dir: &Path) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

/// Directory connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapSettings {
    pub url: String,
    pub user_cert: Option<PathBuf>,
    pub user_key: Option<PathBuf>,
    pub ca_chain: Option<PathBuf>,
    pub base_dn: String,
}

impl LdapSettings {
    fn resolve(
        document: LdapDocument,
        base_dir: &Path,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let required = |value: Option<String>, key: &'static str, variable: &'static str| {
            lookup(value, variable, env).ok_or(ConfigError::MissingParameter {
                section: "LDAP",
                key,
                variable,
            })
        };
        let path = |value: Option<String>, variable: &'static str| {
            lookup(value, variable, env).map(|raw| resolve_path(raw, base_dir))
        };

        Ok(Self {
            url: required(document.url, "url", "LDAP_URL")?,
            user_cert: path(document.user_cert, "LDAP_USER_CERT"),
            user_key: path(document.user_key, "LDAP_USER_KEY"),
            ca_chain: path(document.ca_chain, "LDAP_CA_CHAIN"),
            base_dn: required(document.base_dn, "baseDn", "LDAP_BASE_DN")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpSecurity {
    Plain,
    Tls,
}

/// Mail server location parsed from `SMTP_URL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpEndpoint {
    pub security: SmtpSecurity,
    pub host: String,
    pub port: u16,
}

impl SmtpEndpoint {
    /// Parse `[scheme:]//host[:port]`; a bare host gets the `smtp://` scheme.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSmtpUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let normalized = match raw.find("//") {
            Some(0) => format!("smtp:{raw}"),
            Some(position) if raw[..position].ends_with(':') => raw.to_string(),
            _ => {
                warn!(url = raw, "no scheme in SMTP url, assuming smtp://");
                format!("smtp://{raw}")
            }
        };

        let url = Url::parse(&normalized).map_err(|err| invalid(&err.to_string()))?;
        let security = match url.scheme() {
            "smtp" => SmtpSecurity::Plain,
            "smtps" => SmtpSecurity::Tls,
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("host not parsed"))?
            .to_string();
        let port = url.port().unwrap_or(DEFAULT_SMTP_PORT);

        Ok(Self {
            security,
            host,
            port,
        })
    }
}

/// Mail transport settings; only required when some policy sends warnings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub endpoint: SmtpEndpoint,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: String,
    pub subject: Option<String>,
}

impl SmtpSettings {
    fn resolve(
        document: SmtpDocument,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let missing = |key: &'static str, variable: &'static str| ConfigError::MissingParameter {
            section: "SMTP",
            key,
            variable,
        };

        let url = lookup(document.url, "SMTP_URL", env).ok_or_else(|| missing("url", "SMTP_URL"))?;
        let from =
            lookup(document.from, "MAIL_FROM", env).ok_or_else(|| missing("from", "MAIL_FROM"))?;

        Ok(Self {
            endpoint: SmtpEndpoint::parse(&url)?,
            user: lookup(document.user, "SMTP_USER", env),
            password: lookup(document.password, "SMTP_PASSWORD", env),
            from,
            subject: document.subject.filter(|subject| !subject.is_empty()),
        })
    }

    /// Login pair, present only when both user and password are set.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some((user.as_str(), password.as_str())),
            _ => None,
        }
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: Option<PathBuf>,
        source: serde_json::Error,
    },
    MissingParameter {
        section: &'static str,
        key: &'static str,
        variable: &'static str,
    },
    InvalidSmtpUrl {
        url: String,
        reason: String,
    },
    MissingPolicies,
    Policy(PolicyError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Read { path, .. } => {
                write!(f, "unable to read configuration '{}'", path.display())
            }
            ConfigError::Parse {
                path: Some(path), ..
            } => write!(f, "configuration '{}' is not valid JSON", path.display()),
            ConfigError::Parse { path: None, .. } => write!(f, "configuration is not valid JSON"),
            ConfigError::MissingParameter {
                section,
                key,
                variable,
            } => write!(
                f,
                "required {section} parameter '{key}' is not set (config or {variable})"
            ),
            ConfigError::InvalidSmtpUrl { url, reason } => {
                write!(f, "invalid SMTP url '{url}': {reason}")
            }
            ConfigError::MissingPolicies => write!(f, "configuration has no 'users' policy list"),
            ConfigError::Policy(err) => write!(f, "invalid policy: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Policy(err) => Some(err),
            ConfigError::MissingParameter { .. }
            | ConfigError::InvalidSmtpUrl { .. }
            | ConfigError::MissingPolicies => None,
        }
    }
}

impl From<PolicyError> for ConfigError {
    fn from(value: PolicyError) -> Self {
        Self::Policy(value)
    }
}
