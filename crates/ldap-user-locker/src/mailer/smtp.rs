use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::debug;

use super::{MailTransport, NotificationError, RenderedMessage};
use crate::config::{SmtpSecurity, SmtpSettings};
use crate::policy::TemplateKind;

const SIGNATURE_CONTENT_ID: &str = "signature";

/// SMTP delivery built on `lettre`; the connection pool lives as long as the transport.
pub struct SmtpMailTransport {
    transport: SmtpTransport,
}

impl SmtpMailTransport {
    pub fn new(settings: &SmtpSettings) -> Result<Self, NotificationError> {
        let endpoint = &settings.endpoint;
        let mut builder = match endpoint.security {
            SmtpSecurity::Plain => SmtpTransport::builder_dangerous(endpoint.host.as_str()),
            SmtpSecurity::Tls => SmtpTransport::relay(&endpoint.host)
                .map_err(|err| NotificationError::Setup(err.to_string()))?,
        }
        .port(endpoint.port);

        if let Some((user, password)) = settings.credentials() {
            debug!(user, "SMTP authentication enabled");
            builder = builder.credentials(Credentials::new(user.to_string(), password.to_string()));
        }

        debug!(host = %endpoint.host, port = endpoint.port, "SMTP transport ready");
        Ok(Self {
            transport: builder.build(),
        })
    }
}

fn mailbox(address: &str) -> Result<Mailbox, NotificationError> {
    address
        .parse::<Mailbox>()
        .map_err(|_| NotificationError::InvalidAddress(address.to_string()))
}

fn signature_type() -> Result<ContentType, NotificationError> {
    ContentType::parse("image/png").map_err(|err| NotificationError::Message(err.to_string()))
}

pub(super) fn build_message(message: &RenderedMessage) -> Result<Message, NotificationError> {
    let builder = Message::builder()
        .from(mailbox(&message.from)?)
        .to(mailbox(&message.to)?)
        .subject(message.subject.clone());

    let body = match message.kind {
        TemplateKind::Plain => SinglePart::plain(message.body.clone()),
        TemplateKind::Html => SinglePart::html(message.body.clone()),
    };

    let built = match (&message.signature, message.kind) {
        (None, _) => builder.singlepart(body),
        (Some(image), TemplateKind::Html) => builder.multipart(
            MultiPart::related().singlepart(body).singlepart(
                Attachment::new_inline(SIGNATURE_CONTENT_ID.to_string())
                    .body(image.clone(), signature_type()?),
            ),
        ),
        (Some(image), TemplateKind::Plain) => builder.multipart(
            MultiPart::mixed().singlepart(body).singlepart(
                Attachment::new(format!("{SIGNATURE_CONTENT_ID}.png"))
                    .body(image.clone(), signature_type()?),
            ),
        ),
    };

    built.map_err(|err| NotificationError::Message(err.to_string()))
}

impl MailTransport for SmtpMailTransport {
    fn deliver(&self, message: &RenderedMessage) -> Result<(), NotificationError> {
        let email = build_message(message)?;
        self.transport
            .send(&email)
            .map_err(|err| NotificationError::Transport(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(kind: TemplateKind, signature: Option<Vec<u8>>) -> RenderedMessage {
        RenderedMessage {
            from: "Locker <locker@example.local>".to_string(),
            to: "jdoe@example.local".to_string(),
            subject: "Account lock warning".to_string(),
            kind,
            body: "Your account will be locked.".to_string(),
            signature,
        }
    }

    #[test]
    fn builds_plain_and_html_messages() {
        let plain = build_message(&message(TemplateKind::Plain, None)).expect("plain builds");
        let formatted = String::from_utf8(plain.formatted()).expect("utf8");
        assert!(formatted.contains("Subject: Account lock warning"));
        assert!(formatted.contains("text/plain"));

        let html = build_message(&message(TemplateKind::Html, Some(vec![1, 2, 3])))
            .expect("html builds");
        let formatted = String::from_utf8(html.formatted()).expect("utf8");
        assert!(formatted.contains("multipart/related"));
        assert!(formatted.contains("Content-ID: <signature>"));
    }

    #[test]
    fn rejects_unparseable_recipient() {
        let mut broken = message(TemplateKind::Plain, None);
        broken.to = "not an address@".to_string();

        assert!(matches!(
            build_message(&broken),
            Err(NotificationError::InvalidAddress(_))
        ));
    }
}
