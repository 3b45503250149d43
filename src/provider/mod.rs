//! Mail provider abstraction — pure I/O seam, no business logic.
//!
//! Concrete backends (Gmail, Outlook, SMTP relay) implement `EmailProvider`.
//! Components never hold a client across invocations: they go through a
//! `ProviderFactory` each time so token refresh is always current.

pub mod smtp;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

// ── Message types ───────────────────────────────────────────────────

/// A message as returned by a provider fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailMessage {
    /// Provider-native message id.
    pub id: String,
    /// Provider-native thread id.
    pub thread_id: String,
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// Subject line.
    pub subject: Option<String>,
    /// Body content (plain text or stripped HTML, provider-dependent).
    pub content: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
    /// Whether the message is unread.
    pub unread: bool,
}

/// Filter for a paginated mailbox fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFilter {
    /// Only messages received at or after this instant.
    pub after: Option<DateTime<Utc>>,
    /// Only messages received before this instant.
    pub before: Option<DateTime<Utc>>,
    /// Only unread messages.
    pub unread_only: bool,
}

/// One page of a cursor-paginated fetch.
///
/// `next_page_token` is opaque — callers thread it back unmodified.
/// `None` means the sequence is exhausted.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<MailMessage>,
    pub next_page_token: Option<String>,
}

/// An outbound email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailDraft {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    pub html_body: String,
    /// Message id this is a reply to, for threading headers.
    #[serde(default)]
    pub in_reply_to: Option<String>,
}

// ── Provider traits ─────────────────────────────────────────────────

/// A mailbox backend.
///
/// Every method is a single remote call; pagination state lives in the
/// opaque page token, never in the client.
#[async_trait]
pub trait EmailProvider: Send + Sync {
    /// Fetch one page of messages matching the filter.
    async fn fetch_messages(
        &self,
        filter: &MessageFilter,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError>;

    /// Fetch full messages by id. Ids the backend no longer knows are
    /// silently absent from the result, not an error.
    async fn get_messages_batch(&self, ids: &[String]) -> Result<Vec<MailMessage>, ProviderError>;

    /// Send an email. Returns the provider-side message id.
    async fn send_email(&self, draft: &EmailDraft) -> Result<String, ProviderError>;

    /// Create a draft without sending. Returns the provider-side draft id.
    async fn create_draft(&self, draft: &EmailDraft) -> Result<String, ProviderError>;

    /// Archive a message (remove from inbox).
    async fn archive_message(&self, message_id: &str) -> Result<(), ProviderError>;

    /// Apply a label to a message.
    async fn add_label(&self, message_id: &str, label: &str) -> Result<(), ProviderError>;

    /// Move a message to a folder.
    async fn move_to_folder(&self, message_id: &str, folder: &str) -> Result<(), ProviderError>;

    /// Mark a message as spam.
    async fn mark_spam(&self, message_id: &str) -> Result<(), ProviderError>;

    /// Mark a message as read.
    async fn mark_read(&self, message_id: &str) -> Result<(), ProviderError>;
}

/// Resolves a fresh provider client for an account.
///
/// Called once per invocation (executor run, fetcher page, sender run) —
/// never cache the returned client across pages, or a long-running bulk
/// job will outlive its access token.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    async fn resolve(&self, account_id: &str) -> Result<Arc<dyn EmailProvider>, ProviderError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared in-memory provider fakes for unit tests.

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Scripted provider: serves pre-built pages in order, records calls.
    #[derive(Default)]
    pub struct FakeProvider {
        pub pages: Mutex<Vec<MessagePage>>,
        pub batch_messages: Mutex<Vec<MailMessage>>,
        pub sent: Mutex<Vec<EmailDraft>>,
        pub archived: Mutex<Vec<String>>,
        pub labeled: Mutex<Vec<(String, String)>>,
        pub batch_calls: Mutex<Vec<usize>>,
        pub fetch_calls: AtomicUsize,
        /// When set, every side-effecting call fails with this flag.
        pub fail_sends: std::sync::atomic::AtomicBool,
        /// When set, action calls report the target as gone.
        pub target_gone: std::sync::atomic::AtomicBool,
    }

    impl FakeProvider {
        pub fn with_pages(pages: Vec<MessagePage>) -> Self {
            Self {
                pages: Mutex::new(pages),
                ..Default::default()
            }
        }

        fn check_gone(&self, message_id: &str) -> Result<(), ProviderError> {
            if self.target_gone.load(Ordering::SeqCst) {
                return Err(ProviderError::MessageGone {
                    message_id: message_id.to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl EmailProvider for FakeProvider {
        async fn fetch_messages(
            &self,
            _filter: &MessageFilter,
            _page_token: Option<&str>,
            _page_size: usize,
        ) -> Result<MessagePage, ProviderError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            let mut pages = self.pages.lock().unwrap();
            if pages.is_empty() {
                return Ok(MessagePage {
                    messages: vec![],
                    next_page_token: None,
                });
            }
            Ok(pages.remove(0))
        }

        async fn get_messages_batch(
            &self,
            ids: &[String],
        ) -> Result<Vec<MailMessage>, ProviderError> {
            self.batch_calls.lock().unwrap().push(ids.len());
            let known = self.batch_messages.lock().unwrap();
            Ok(known
                .iter()
                .filter(|m| ids.contains(&m.id))
                .cloned()
                .collect())
        }

        async fn send_email(&self, draft: &EmailDraft) -> Result<String, ProviderError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ProviderError::SendFailed("smtp unavailable".into()));
            }
            self.sent.lock().unwrap().push(draft.clone());
            Ok(format!("sent-{}", self.sent.lock().unwrap().len()))
        }

        async fn create_draft(&self, draft: &EmailDraft) -> Result<String, ProviderError> {
            self.sent.lock().unwrap().push(draft.clone());
            Ok("draft-1".into())
        }

        async fn archive_message(&self, message_id: &str) -> Result<(), ProviderError> {
            self.check_gone(message_id)?;
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ProviderError::Network("connection reset".into()));
            }
            self.archived.lock().unwrap().push(message_id.to_string());
            Ok(())
        }

        async fn add_label(&self, message_id: &str, label: &str) -> Result<(), ProviderError> {
            self.check_gone(message_id)?;
            self.labeled
                .lock()
                .unwrap()
                .push((message_id.to_string(), label.to_string()));
            Ok(())
        }

        async fn move_to_folder(&self, message_id: &str, folder: &str) -> Result<(), ProviderError> {
            self.check_gone(message_id)?;
            self.labeled
                .lock()
                .unwrap()
                .push((message_id.to_string(), format!("folder:{folder}")));
            Ok(())
        }

        async fn mark_spam(&self, message_id: &str) -> Result<(), ProviderError> {
            self.check_gone(message_id)?;
            self.labeled
                .lock()
                .unwrap()
                .push((message_id.to_string(), "spam".to_string()));
            Ok(())
        }

        async fn mark_read(&self, message_id: &str) -> Result<(), ProviderError> {
            self.check_gone(message_id)?;
            self.labeled
                .lock()
                .unwrap()
                .push((message_id.to_string(), "read".to_string()));
            Ok(())
        }
    }

    /// Factory serving one shared fake for every account, counting resolves.
    pub struct FakeFactory {
        pub provider: Arc<FakeProvider>,
        pub resolve_calls: AtomicUsize,
        pub unknown_accounts: Mutex<Vec<String>>,
    }

    impl FakeFactory {
        pub fn new(provider: Arc<FakeProvider>) -> Self {
            Self {
                provider,
                resolve_calls: AtomicUsize::new(0),
                unknown_accounts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProviderFactory for FakeFactory {
        async fn resolve(
            &self,
            account_id: &str,
        ) -> Result<Arc<dyn EmailProvider>, ProviderError> {
            self.resolve_calls.fetch_add(1, Ordering::SeqCst);
            if self
                .unknown_accounts
                .lock()
                .unwrap()
                .contains(&account_id.to_string())
            {
                return Err(ProviderError::NoProvider {
                    account_id: account_id.to_string(),
                });
            }
            Ok(self.provider.clone())
        }
    }

    /// Build a test message.
    pub fn message(id: &str, from: &str) -> MailMessage {
        MailMessage {
            id: id.to_string(),
            thread_id: format!("t-{id}"),
            from: from.to_string(),
            to: vec!["user@example.com".into()],
            subject: Some(format!("subject {id}")),
            content: format!("body of {id}"),
            received_at: Utc::now(),
            unread: true,
        }
    }
}
