//! Outage notification
//!
//! The relay calls an [`OutageNotifier`] once per upstream outage that
//! outlasts the configured grace period. [`MailNotifier`] delivers it over
//! SMTP; port 465 uses implicit TLS, every other port upgrades with
//! STARTTLS.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

use crate::config::NoticeConfig;

/// Port on which SMTP is spoken over implicit TLS
pub const SMTPS_PORT: u16 = 465;

/// Placeholder replaced with the bot id in the mail body
pub const BOT_ID_PLACEHOLDER: &str = "{bot_id}";

/// Notification failure
#[derive(Debug, Error)]
pub enum NotifyError {
    /// A configured mail address does not parse
    #[error("invalid mail address `{address}`: {source}")]
    Address {
        address: String,
        #[source]
        source: lettre::address::AddressError,
    },

    /// The message could not be assembled
    #[error("failed to build mail: {0}")]
    Build(#[from] lettre::error::Error),

    /// SMTP connection, authentication or delivery failed
    #[error("SMTP delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Receives upstream outage notices
#[async_trait]
pub trait OutageNotifier: Send + Sync {
    /// The endpoint serving `bot_id` has been unreachable past the grace period
    async fn notify(&self, bot_id: i64) -> Result<(), NotifyError>;
}

/// Fill the `{bot_id}` placeholder
pub fn render_content(template: &str, bot_id: i64) -> String {
    template.replace(BOT_ID_PLACEHOLDER, &bot_id.to_string())
}

/// Sends outage notices by mail
pub struct MailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
    title: String,
    content: String,
}

impl MailNotifier {
    /// Build a notifier from the `notice` section
    ///
    /// Addresses are validated here so a typo fails at startup, not during
    /// the first outage.
    pub fn from_config(config: &NoticeConfig) -> Result<Self, NotifyError> {
        let from = Mailbox::new(
            Some(config.mail.subject.clone()),
            parse_address(&config.sender)?,
        );
        let to = Mailbox::new(None, parse_address(&config.receiver)?);

        let builder = if config.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.smtp)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp)?
        };

        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(
                config.sender.clone(),
                config.password.clone(),
            ))
            .build();

        Ok(Self {
            transport,
            from,
            to,
            title: config.mail.title.clone(),
            content: config.mail.content.clone(),
        })
    }

    fn message(&self, bot_id: i64) -> Result<Message, NotifyError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(self.title.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(render_content(&self.content, bot_id))?;
        Ok(message)
    }
}

#[async_trait]
impl OutageNotifier for MailNotifier {
    async fn notify(&self, bot_id: i64) -> Result<(), NotifyError> {
        let message = self.message(bot_id)?;
        self.transport.send(message).await?;
        tracing::info!(bot_id, to = %self.to, "Outage notice sent");
        Ok(())
    }
}

fn parse_address(address: &str) -> Result<lettre::Address, NotifyError> {
    address.parse().map_err(|source| NotifyError::Address {
        address: address.to_string(),
        source,
    })
}
