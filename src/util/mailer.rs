use crate::config::SmtpConfig;
use crate::util::render::RenderedEmail;
use lettre::address::AddressError;
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{Message, SmtpTransport, Transport};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("invalid address {address:?}: {source}")]
    Address { address: String, source: AddressError },

    #[error("building message failed: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("TLS setup for {host} failed: {source}")]
    Tls { host: String, source: lettre::transport::smtp::Error },

    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Delivers a rendered email.
///
/// `Ok(false)` means delivery is switched off, not that it failed.
pub trait Notifier {
    fn send(&self, email: &RenderedEmail) -> Result<bool, SendError>;
}

pub struct SmtpMailer {
    cfg: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(cfg: SmtpConfig) -> Self {
        Self { cfg }
    }

    fn build_message(&self, email: &RenderedEmail) -> Result<Message, SendError> {
        let mut builder = Message::builder()
            .from(mailbox(self.cfg.sender())?)
            .subject(email.subject.clone());
        for to in &self.cfg.to {
            builder = builder.to(mailbox(to)?);
        }

        let body = MultiPart::alternative()
            .singlepart(SinglePart::builder().header(ContentType::TEXT_PLAIN).body(email.text.clone()))
            .singlepart(SinglePart::builder().header(ContentType::TEXT_HTML).body(email.html.clone()));
        Ok(builder.multipart(body)?)
    }

    fn transport(&self, tls: Tls) -> SmtpTransport {
        let mut builder = SmtpTransport::builder_dangerous(self.cfg.host.as_str())
            .port(self.cfg.port)
            .tls(tls)
            .timeout(Some(Duration::from_secs(self.cfg.timeout_secs)));
        if self.cfg.has_credentials() {
            builder = builder.credentials(Credentials::new(self.cfg.user.clone(), self.cfg.password.clone()));
        }
        builder.build()
    }

    /// STARTTLS when the server offers it. A refused or broken upgrade falls
    /// back to one plaintext attempt on a fresh connection.
    fn deliver(&self, message: &Message) -> Result<(), SendError> {
        let host = &self.cfg.host;
        let params = TlsParameters::new(host.clone())
            .map_err(|source| SendError::Tls { host: host.clone(), source })?;

        match self.transport(Tls::Opportunistic(params)).send(message) {
            Ok(_) => Ok(()),
            Err(e) if starttls_refused(&e) => {
                tracing::warn!(host = %host, error = %e, "STARTTLS failed, sending unencrypted");
                self.transport(Tls::None).send(message)?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Notifier for SmtpMailer {
    fn send(&self, email: &RenderedEmail) -> Result<bool, SendError> {
        if !self.cfg.is_configured() {
            tracing::info!("email not configured; skipping send");
            return Ok(false);
        }
        let message = self.build_message(email)?;
        self.deliver(&message)?;
        tracing::info!(recipients = self.cfg.to.len(), subject = %email.subject, "email sent");
        Ok(true)
    }
}

/// TLS handshake errors, and the `454` a server answers STARTTLS with when it
/// cannot start TLS after all.
fn starttls_refused(e: &lettre::transport::smtp::Error) -> bool {
    e.is_tls() || e.status().is_some_and(|code| code.to_string() == "454")
}

fn mailbox(address: &str) -> Result<Mailbox, SendError> {
    address.parse().map_err(|source| SendError::Address { address: address.to_string(), source })
}
