use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use log::{info, warn};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("compose: {0}")]
    Compose(String),
    #[error("send: {0}")]
    Send(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

// ---------------- SMTP implementation (lettre) ----------------
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("SMTP_HOST")
            .map_err(|_| anyhow::anyhow!("SMTP_HOST must be set for the SMTP mailer"))?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&host)?;
        if let Ok(port) = std::env::var("SMTP_PORT") {
            builder = builder.port(port.parse()?);
        }
        if let (Ok(user), Ok(pass)) = (std::env::var("SMTP_USER"), std::env::var("SMTP_PASS")) {
            builder = builder.credentials(Credentials::new(user, pass));
        }
        let from: Mailbox = std::env::var("MAIL_FROM")
            .unwrap_or_else(|_| "noreply@crit.local".to_string())
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid MAIL_FROM: {e}"))?;
        Ok(Self { transport: builder.build(), from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let message = Message::builder()
            .from(self.from.clone())
            .to(to.parse().map_err(|e| MailError::Compose(format!("{e}")))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| MailError::Compose(e.to_string()))?;
        self.transport
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| MailError::Send(e.to_string()))
    }
}

// ---------------- In-memory implementation (tests / dev) ----------------
#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Records messages instead of delivering them. Doubles as the dev fallback
/// when SMTP is not configured and as the inspection point in tests.
#[derive(Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<SentMail>>,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Factory used in main: SMTP when configured, in-memory otherwise.
pub fn build_mailer() -> Arc<dyn Mailer> {
    if std::env::var("SMTP_HOST").is_ok() {
        match SmtpMailer::from_env() {
            Ok(mailer) => {
                info!("Using SMTP mailer");
                Arc::new(mailer)
            }
            Err(e) => panic!("Failed to initialize SMTP mailer: {e}"),
        }
    } else {
        warn!("SMTP_HOST not set; confirmation codes are recorded in memory only");
        Arc::new(MemoryMailer::new())
    }
}
