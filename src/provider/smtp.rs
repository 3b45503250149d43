//! SMTP reference provider — outbound only.
//!
//! For deployments without a mailbox API backend this provider can still
//! deliver digest emails and outbound actions. Fetch-side operations are
//! `Unsupported`. A fresh transport is built per send so credential
//! rotation takes effect without a restart.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::error::ProviderError;
use crate::provider::{EmailDraft, EmailProvider, MailMessage, MessageFilter, MessagePage};

/// Outbound-only provider backed by an SMTP relay.
pub struct SmtpProvider {
    config: SmtpConfig,
}

impl SmtpProvider {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, draft: &EmailDraft) -> Result<Message, ProviderError> {
        let from = self
            .config
            .from_address
            .parse()
            .map_err(|e| ProviderError::SendFailed(format!("bad from address: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(draft.subject.clone())
            .header(ContentType::TEXT_HTML);

        for to in &draft.to {
            builder = builder.to(to
                .parse()
                .map_err(|e| ProviderError::SendFailed(format!("bad recipient '{to}': {e}")))?);
        }
        for cc in &draft.cc {
            builder = builder.cc(cc
                .parse()
                .map_err(|e| ProviderError::SendFailed(format!("bad cc '{cc}': {e}")))?);
        }
        for bcc in &draft.bcc {
            builder = builder.bcc(bcc
                .parse()
                .map_err(|e| ProviderError::SendFailed(format!("bad bcc '{bcc}': {e}")))?);
        }
        if let Some(ref irt) = draft.in_reply_to {
            builder = builder.in_reply_to(irt.clone());
        }

        builder
            .body(draft.html_body.clone())
            .map_err(|e| ProviderError::SendFailed(format!("message build failed: {e}")))
    }

    fn transport(&self) -> Result<SmtpTransport, ProviderError> {
        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        Ok(SmtpTransport::relay(&self.config.host)
            .map_err(|e| ProviderError::SendFailed(format!("relay setup failed: {e}")))?
            .port(self.config.port)
            .credentials(creds)
            .build())
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn fetch_messages(
        &self,
        _filter: &MessageFilter,
        _page_token: Option<&str>,
        _page_size: usize,
    ) -> Result<MessagePage, ProviderError> {
        Err(ProviderError::Unsupported {
            op: "fetch_messages",
        })
    }

    async fn get_messages_batch(&self, _ids: &[String]) -> Result<Vec<MailMessage>, ProviderError> {
        Err(ProviderError::Unsupported {
            op: "get_messages_batch",
        })
    }

    async fn send_email(&self, draft: &EmailDraft) -> Result<String, ProviderError> {
        if draft.to.is_empty() {
            return Err(ProviderError::SendFailed("no recipients".into()));
        }
        let message = self.build_message(draft)?;
        let transport = self.transport()?;

        // lettre's SmtpTransport is blocking; keep it off the async runtime.
        let result = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| ProviderError::SendFailed(format!("send task failed: {e}")))?;

        match result {
            Ok(_) => {
                let message_id = format!("smtp-{}", Uuid::new_v4());
                info!(to = ?draft.to, subject = %draft.subject, "Email sent via SMTP");
                Ok(message_id)
            }
            Err(e) => Err(ProviderError::SendFailed(e.to_string())),
        }
    }

    async fn create_draft(&self, _draft: &EmailDraft) -> Result<String, ProviderError> {
        Err(ProviderError::Unsupported { op: "create_draft" })
    }

    async fn archive_message(&self, _message_id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            op: "archive_message",
        })
    }

    async fn add_label(&self, _message_id: &str, _label: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported { op: "add_label" })
    }

    async fn move_to_folder(&self, _message_id: &str, _folder: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported {
            op: "move_to_folder",
        })
    }

    async fn mark_spam(&self, _message_id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported { op: "mark_spam" })
    }

    async fn mark_read(&self, _message_id: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported { op: "mark_read" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    fn test_config() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "bot@example.com".into(),
            password: SecretString::from("hunter2"),
            from_address: "bot@example.com".into(),
        }
    }

    #[test]
    fn builds_html_message() {
        let provider = SmtpProvider::new(test_config());
        let draft = EmailDraft {
            to: vec!["alice@example.com".into()],
            cc: vec![],
            bcc: vec![],
            subject: "Digest".into(),
            html_body: "<p>hello</p>".into(),
            in_reply_to: None,
        };
        assert!(provider.build_message(&draft).is_ok());
    }

    #[test]
    fn rejects_bad_recipient() {
        let provider = SmtpProvider::new(test_config());
        let draft = EmailDraft {
            to: vec!["not an address".into()],
            cc: vec![],
            bcc: vec![],
            subject: "x".into(),
            html_body: "y".into(),
            in_reply_to: None,
        };
        assert!(matches!(
            provider.build_message(&draft),
            Err(ProviderError::SendFailed(_))
        ));
    }

    #[tokio::test]
    async fn fetch_is_unsupported() {
        let provider = SmtpProvider::new(test_config());
        let result = provider
            .fetch_messages(&MessageFilter::default(), None, 25)
            .await;
        assert!(matches!(result, Err(ProviderError::Unsupported { .. })));
    }

    #[tokio::test]
    async fn send_with_no_recipients_fails() {
        let provider = SmtpProvider::new(test_config());
        let draft = EmailDraft {
            to: vec![],
            cc: vec![],
            bcc: vec![],
            subject: "x".into(),
            html_body: "y".into(),
            in_reply_to: None,
        };
        assert!(provider.send_email(&draft).await.is_err());
    }
}
