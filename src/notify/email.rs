//! Gmail (SMTP with STARTTLS) backend.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::Notifier;
use crate::config::GmailConfig;
use crate::error::{ConfigError, DeliveryError};

pub struct GmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

fn parse_mailbox(field: &str, address: &str) -> Result<Mailbox, ConfigError> {
    address
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(field, format!("'{address}': {e}")))
}

impl GmailNotifier {
    // ---
    pub fn from_config(cfg: &GmailConfig) -> Result<Self, ConfigError> {
        // ---
        let from = parse_mailbox("GMAIL_SENDER", &cfg.sender)?;
        let to = cfg
            .recipients
            .iter()
            .map(|r| parse_mailbox("GMAIL_RECIPIENTS", r))
            .collect::<Result<Vec<_>, _>>()?;
        if to.is_empty() {
            return Err(ConfigError::MissingCredentials {
                backend: "gmail",
                missing: "GMAIL_RECIPIENTS".into(),
            });
        }

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
            .map_err(|e| ConfigError::invalid("SMTP_HOST", e.to_string()))?
            .port(cfg.smtp_port)
            .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
            .build();

        Ok(Self {
            transport,
            from,
            to,
        })
    }

    fn build_message(&self, subject: &str, body: &str) -> Result<Message, DeliveryError> {
        // ---
        let mut builder = Message::builder().from(self.from.clone());
        for mailbox in &self.to {
            builder = builder.to(mailbox.clone());
        }
        builder
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| DeliveryError::Smtp(e.to_string()))
    }
}

#[async_trait]
impl Notifier for GmailNotifier {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn send(&self, subject: &str, body: &str) -> Result<(), DeliveryError> {
        // ---
        let message = self.build_message(subject, body)?;
        self.transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::Smtp(e.to_string()))?;
        Ok(())
    }
}
