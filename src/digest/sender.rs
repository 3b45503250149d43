//! Digest sender — renders and delivers pending digests.
//!
//! Claiming happens before any slow I/O: every PENDING digest flips to
//! PROCESSING in one atomic update, so a concurrent sender run cannot
//! double-pick rows. Delivery success commits schedule bookkeeping,
//! SENT status, and content redaction in a single store transaction;
//! delivery failure marks the digests FAILED with content intact.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::digest::model::{DigestItem, DigestSchedule, next_occurrence};
use crate::error::{Error, Result, StoreError};
use crate::provider::{EmailDraft, EmailProvider as _, MailMessage, ProviderFactory};
use crate::store::Database;
use crate::summarizer::DigestSummary;

/// Result of one sender invocation.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub success: bool,
    pub message: String,
    pub digests_sent: usize,
    pub items_sent: usize,
}

impl SendOutcome {
    fn nothing_to_send() -> Self {
        Self {
            success: true,
            message: "nothing to send".into(),
            digests_sent: 0,
            items_sent: 0,
        }
    }
}

/// Sends one aggregated digest email per account run.
pub struct DigestSender {
    store: Arc<dyn Database>,
    providers: Arc<dyn ProviderFactory>,
    /// Max message ids per provider batch-fetch call.
    batch_size: usize,
    /// Pause between batch-fetch chunks (provider rate limits).
    chunk_pause: Duration,
}

impl DigestSender {
    pub fn new(
        store: Arc<dyn Database>,
        providers: Arc<dyn ProviderFactory>,
        batch_size: usize,
        chunk_pause: Duration,
    ) -> Self {
        Self {
            store,
            providers,
            batch_size,
            chunk_pause,
        }
    }

    pub async fn send(&self, account_id: &str, force: bool) -> Result<SendOutcome> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or_else(|| {
                Error::Store(StoreError::NotFound {
                    entity: "account",
                    id: account_id.to_string(),
                })
            })?;

        // Claim first — everything after this point owns the rows.
        let claimed = self.store.claim_pending_digests(account_id).await?;
        if claimed.is_empty() && !force {
            return Ok(SendOutcome::nothing_to_send());
        }

        let digest_ids: Vec<_> = claimed.iter().map(|d| d.id).collect();
        let items = self.store.list_digest_items(&digest_ids).await?;

        // Full message context, fetched in provider-sized chunks.
        let fetched = match self.fetch_context(account_id, &items).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.store.mark_digests_failed(&digest_ids).await?;
                return Err(e);
            }
        };

        let html = render_digest(&items, &fetched);
        let subject = format!("Your email digest — {}", Utc::now().format("%B %-d, %Y"));
        let draft = EmailDraft {
            to: vec![account.email.clone()],
            cc: vec![],
            bcc: vec![],
            subject,
            html_body: html,
            in_reply_to: None,
        };

        let provider = self.providers.resolve(account_id).await?;
        match provider.send_email(&draft).await {
            Ok(provider_message_id) => {
                let sent_at = Utc::now();
                let schedule = self.advanced_schedule(account_id, sent_at).await?;
                self.store
                    .finalize_digests_sent(&digest_ids, sent_at, schedule.as_ref())
                    .await?;
                info!(
                    account_id = %account_id,
                    digests = digest_ids.len(),
                    items = items.len(),
                    provider_message_id = %provider_message_id,
                    "Digest sent"
                );
                Ok(SendOutcome {
                    success: true,
                    message: format!("sent {} item(s)", items.len()),
                    digests_sent: digest_ids.len(),
                    items_sent: items.len(),
                })
            }
            Err(e) => {
                // FAILED, not back to PENDING: a garbled digest must not
                // be silently re-delivered. Content stays for audit.
                self.store.mark_digests_failed(&digest_ids).await?;
                warn!(account_id = %account_id, "Digest send failed: {e}");
                Err(Error::Provider(e))
            }
        }
    }

    /// Batch-fetch full messages for all item message ids, chunked and
    /// paused to respect provider limits.
    async fn fetch_context(
        &self,
        account_id: &str,
        items: &[DigestItem],
    ) -> Result<BTreeMap<String, MailMessage>> {
        let mut ids: Vec<String> = items.iter().map(|i| i.message_id.clone()).collect();
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }

        let provider = self.providers.resolve(account_id).await?;
        let mut fetched = BTreeMap::new();
        let mut first = true;
        for chunk in ids.chunks(self.batch_size.max(1)) {
            if !first {
                tokio::time::sleep(self.chunk_pause).await;
            }
            first = false;
            for message in provider.get_messages_batch(chunk).await? {
                fetched.insert(message.id.clone(), message);
            }
        }
        Ok(fetched)
    }

    /// The account's schedule advanced past `sent_at`, if one exists.
    async fn advanced_schedule(
        &self,
        account_id: &str,
        sent_at: chrono::DateTime<Utc>,
    ) -> Result<Option<DigestSchedule>> {
        let Some(mut schedule) = self.store.get_digest_schedule(account_id).await? else {
            return Ok(None);
        };
        schedule.last_occurrence = Some(sent_at);
        schedule.next_occurrence = next_occurrence(&schedule.cron_expression, sent_at)
            .unwrap_or_else(|e| {
                warn!(account_id = %account_id, "Bad digest cron expression: {e}");
                None
            });
        Ok(Some(schedule))
    }
}

/// Render the digest body: one section per rule name, items in order.
fn render_digest(items: &[DigestItem], fetched: &BTreeMap<String, MailMessage>) -> String {
    let mut groups: BTreeMap<&str, Vec<&DigestItem>> = BTreeMap::new();
    for item in items {
        groups.entry(item.rule_name.as_str()).or_default().push(item);
    }

    let mut html = String::from("<html><body><h1>Your email digest</h1>");
    if groups.is_empty() {
        html.push_str("<p>No new items.</p>");
    }
    for (rule_name, group) in &groups {
        html.push_str(&format!("<h2>{}</h2><ul>", escape(rule_name)));
        for item in group {
            let summary: Option<DigestSummary> = serde_json::from_str(&item.content).ok();
            let headline = summary
                .as_ref()
                .map(|s| s.headline.clone())
                .unwrap_or_else(|| item.content.clone());
            let sender = fetched
                .get(&item.message_id)
                .map(|m| m.from.as_str())
                .unwrap_or("unknown sender");
            html.push_str(&format!(
                "<li><strong>{}</strong> — {}",
                escape(&headline),
                escape(sender)
            ));
            if let Some(summary) = summary {
                for detail in &summary.details {
                    html.push_str(&format!("<br/><small>{}</small>", escape(detail)));
                }
            }
            html.push_str("</li>");
        }
        html.push_str("</ul>");
    }
    html.push_str("</body></html>");
    html
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    use crate::digest::model::{DigestStatus, REDACTED_CONTENT};
    use crate::provider::testing::{FakeFactory, FakeProvider, message};
    use crate::store::{Account, Database as _, DigestItemUpsert, LibSqlBackend};

    struct Fixture {
        sender: DigestSender,
        store: Arc<LibSqlBackend>,
        provider: Arc<FakeProvider>,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .insert_account(&Account {
                id: "acct-1".into(),
                email: "user@example.com".into(),
                assistant_email: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let provider = Arc::new(FakeProvider::default());
        let factory = Arc::new(FakeFactory::new(provider.clone()));
        Fixture {
            sender: DigestSender::new(
                store.clone(),
                factory,
                100,
                Duration::from_millis(1),
            ),
            store,
            provider,
        }
    }

    async fn seed_digest(fx: &Fixture, message_ids: &[&str]) -> Uuid {
        let digest = fx
            .store
            .find_or_create_pending_digest("acct-1")
            .await
            .unwrap();
        for id in message_ids {
            fx.store
                .upsert_digest_item(DigestItemUpsert {
                    digest_id: digest.id,
                    message_id: id,
                    thread_id: &format!("t-{id}"),
                    rule_name: "Newsletters",
                    content: &format!("{{\"headline\":\"About {id}\",\"details\":[]}}"),
                    rule_execution_id: None,
                    cold_email_id: None,
                })
                .await
                .unwrap();
            fx.provider
                .batch_messages
                .lock()
                .unwrap()
                .push(message(id, "news@example.com"));
        }
        digest.id
    }

    #[tokio::test]
    async fn nothing_pending_is_a_noop() {
        let fx = setup().await;
        let outcome = fx.sender.send("acct-1", false).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.message, "nothing to send");
        assert!(fx.provider.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sends_grouped_digest_and_redacts() {
        let fx = setup().await;
        let digest_id = seed_digest(&fx, &["m1", "m2"]).await;

        let outcome = fx.sender.send("acct-1", false).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.digests_sent, 1);
        assert_eq!(outcome.items_sent, 2);

        // One email, to the account owner, carrying both headlines.
        let sent = fx.provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["user@example.com".to_string()]);
        assert!(sent[0].html_body.contains("About m1"));
        assert!(sent[0].html_body.contains("About m2"));
        assert!(sent[0].html_body.contains("Newsletters"));
        drop(sent);

        // Digest SENT, every item redacted.
        let digest = fx.store.get_digest(digest_id).await.unwrap().unwrap();
        assert_eq!(digest.status, DigestStatus::Sent);
        for item in fx.store.list_digest_items(&[digest_id]).await.unwrap() {
            assert_eq!(item.content, REDACTED_CONTENT);
        }
    }

    #[tokio::test]
    async fn send_failure_marks_failed_and_keeps_content() {
        let fx = setup().await;
        let digest_id = seed_digest(&fx, &["m1"]).await;
        fx.provider.fail_sends.store(true, Ordering::SeqCst);

        let result = fx.sender.send("acct-1", false).await;
        assert!(result.is_err());

        let digest = fx.store.get_digest(digest_id).await.unwrap().unwrap();
        assert_eq!(digest.status, DigestStatus::Failed);
        let items = fx.store.list_digest_items(&[digest_id]).await.unwrap();
        assert!(items[0].content.contains("About m1"), "content kept for audit");
    }

    #[tokio::test]
    async fn second_run_after_send_finds_nothing() {
        let fx = setup().await;
        seed_digest(&fx, &["m1"]).await;

        fx.sender.send("acct-1", false).await.unwrap();
        let outcome = fx.sender.send("acct-1", false).await.unwrap();
        assert_eq!(outcome.message, "nothing to send");
        assert_eq!(fx.provider.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_fetch_respects_chunk_size() {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        store
            .insert_account(&Account {
                id: "acct-1".into(),
                email: "user@example.com".into(),
                assistant_email: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let provider = Arc::new(FakeProvider::default());
        let factory = Arc::new(FakeFactory::new(provider.clone()));
        let sender = DigestSender::new(store.clone(), factory, 2, Duration::from_millis(1));
        let fx = Fixture {
            sender,
            store,
            provider,
        };

        seed_digest(&fx, &["m1", "m2", "m3", "m4", "m5"]).await;
        fx.sender.send("acct-1", false).await.unwrap();

        let calls = fx.provider.batch_calls.lock().unwrap();
        assert_eq!(calls.as_slice(), [2, 2, 1], "chunks of at most batch_size");
    }

    #[tokio::test]
    async fn force_send_with_nothing_pending_delivers_empty_digest() {
        let fx = setup().await;
        let outcome = fx.sender.send("acct-1", true).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.digests_sent, 0);

        let sent = fx.provider.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].html_body.contains("No new items"));
    }

    #[tokio::test]
    async fn schedule_advances_inside_send() {
        let fx = setup().await;
        fx.store
            .upsert_digest_schedule(&DigestSchedule {
                account_id: "acct-1".into(),
                cron_expression: "0 0 9 * * *".into(),
                last_occurrence: None,
                next_occurrence: None,
            })
            .await
            .unwrap();
        seed_digest(&fx, &["m1"]).await;

        fx.sender.send("acct-1", false).await.unwrap();

        let schedule = fx.store.get_digest_schedule("acct-1").await.unwrap().unwrap();
        assert!(schedule.last_occurrence.is_some());
        let next = schedule.next_occurrence.unwrap();
        assert!(next > Utc::now());
    }
}
