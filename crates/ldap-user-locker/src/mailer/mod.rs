//! Lock warning delivery: template loading, rendering and the transport seam.

mod smtp;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::SmtpSettings;
use crate::policy::{TemplateKind, TemplateReference};

pub use smtp::SmtpMailTransport;

/// Subject used when neither the template nor the SMTP block defines one.
pub const DEFAULT_SUBJECT: &str = "Account lock warning";

/// Outbound notification hook consumed by the locker.
pub trait Notifier {
    fn send(
        &self,
        mail_to: &str,
        template: &TemplateReference,
        substitutions: &Substitutions,
    ) -> Result<(), NotificationError>;
}

/// Named template values; absent identity fields are kept as `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Substitutions(BTreeMap<String, Option<String>>);

impl Substitutions {
    pub fn insert(&mut self, name: impl Into<String>, value: Option<String>) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|value| value.as_deref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    /// Replace `{name}` placeholders in one left-to-right pass; absent values
    /// render empty and unknown placeholders are left untouched. Substituted
    /// text is never scanned again.
    pub fn render(&self, template: &str) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            rendered.push_str(&rest[..start]);
            let tail = &rest[start + 1..];
            match tail.find('}') {
                Some(end) if self.contains(&tail[..end]) => {
                    rendered.push_str(self.get(&tail[..end]).unwrap_or_default());
                    rest = &tail[end + 1..];
                }
                _ => {
                    rendered.push('{');
                    rest = tail;
                }
            }
        }

        rendered.push_str(rest);
        rendered
    }
}

/// Fully rendered warning mail, ready for a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub kind: TemplateKind,
    pub body: String,
    pub signature: Option<Vec<u8>>,
}

/// Delivery seam so rendering can be exercised without a mail server.
pub trait MailTransport {
    fn deliver(&self, message: &RenderedMessage) -> Result<(), NotificationError>;
}

/// Notification delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("invalid e-mail address: '{0}'")]
    InvalidAddress(String),
    #[error("empty template or signature path")]
    EmptyPath,
    #[error("unable to read template '{path}'")]
    Template {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to read signature '{path}'")]
    Signature {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to build message: {0}")]
    Message(String),
    #[error("mail transport failed: {0}")]
    Transport(String),
    #[error("mail notifier unavailable: {0}")]
    Setup(String),
}

/// Notifier that renders file templates and hands them to a transport.
#[derive(Debug)]
pub struct TemplateMailer<T> {
    transport: T,
    from: String,
    default_subject: Option<String>,
    base_dir: PathBuf,
}

impl TemplateMailer<SmtpMailTransport> {
    /// SMTP-backed mailer; relative template paths resolve against `base_dir`.
    pub fn smtp(settings: &SmtpSettings, base_dir: &Path) -> Result<Self, NotificationError> {
        let transport = SmtpMailTransport::new(settings)?;
        Ok(Self::new(transport, settings.from.clone(), base_dir)
            .with_default_subject(settings.subject.clone()))
    }
}

impl<T: MailTransport> TemplateMailer<T> {
    pub fn new(transport: T, from: impl Into<String>, base_dir: &Path) -> Self {
        Self {
            transport,
            from: from.into(),
            default_subject: None,
            base_dir: base_dir.to_path_buf(),
        }
    }

    pub fn with_default_subject(mut self, subject: Option<String>) -> Self {
        self.default_subject = subject;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf, NotificationError> {
        if path.as_os_str().is_empty() {
            return Err(NotificationError::EmptyPath);
        }
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.base_dir.join(path))
        }
    }

    /// Load the referenced resources and render the message without sending it.
    pub fn render(
        &self,
        mail_to: &str,
        template: &TemplateReference,
        substitutions: &Substitutions,
    ) -> Result<RenderedMessage, NotificationError> {
        if !mail_to.contains('@') {
            return Err(NotificationError::InvalidAddress(mail_to.to_string()));
        }

        let path = self.resolve(&template.file)?;
        let text = fs::read_to_string(&path)
            .map_err(|source| NotificationError::Template { path, source })?;

        let signature = match &template.signature {
            Some(signature) => {
                let path = self.resolve(signature)?;
                Some(fs::read(&path).map_err(|source| NotificationError::Signature { path, source })?)
            }
            None => None,
        };

        let subject = template
            .subject
            .clone()
            .or_else(|| self.default_subject.clone())
            .unwrap_or_else(|| DEFAULT_SUBJECT.to_string());

        Ok(RenderedMessage {
            from: self.from.clone(),
            to: mail_to.to_string(),
            subject: substitutions.render(&subject),
            kind: template.kind,
            body: substitutions.render(&text),
            signature,
        })
    }
}

impl<T: MailTransport> Notifier for TemplateMailer<T> {
    fn send(
        &self,
        mail_to: &str,
        template: &TemplateReference,
        substitutions: &Substitutions,
    ) -> Result<(), NotificationError> {
        let message = self.render(mail_to, template, substitutions)?;
        debug!(template = %template.file.display(), kind = ?message.kind, "rendered lock warning");
        self.transport.deliver(&message)?;
        info!(mail_to, "lock warning delivered");
        Ok(())
    }
}
