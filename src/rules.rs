//! Rule engine seam.
//!
//! What a rule *is* — NLP matching, AI classification — lives outside
//! this crate. The bulk worker only needs something that turns a message
//! into a plan: which actions to run, whether to delay them, and whether
//! the message belongs in a digest. `PatternRules` is the reference
//! implementation: compiled regexes per message field.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use crate::actions::model::{ActionKind, ActionPayload};
use crate::error::Error;
use crate::provider::MailMessage;
use crate::store::Account;

/// One action a rule wants performed.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub kind: ActionKind,
    pub payload: ActionPayload,
    /// `None` executes inline; `Some` goes through the action scheduler.
    pub delay: Option<Duration>,
}

/// The plan a rule produced for one message.
#[derive(Debug, Clone)]
pub struct RulePlan {
    /// Human-readable rule name, surfaced in digests and execution records.
    pub rule_name: String,
    pub actions: Vec<PlannedAction>,
    /// Route a summary of this message into the account's digest.
    pub digest: bool,
}

/// Turns a message into a plan, or `None` when no rule matches.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn plan(
        &self,
        account: &Account,
        message: &MailMessage,
    ) -> Result<Option<RulePlan>, Error>;
}

/// Which field a pattern matches against.
#[derive(Debug, Clone, Copy)]
pub enum RuleField {
    Sender,
    Subject,
    Content,
}

/// A single pattern rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct PatternRule {
    pub name: String,
    pub field: RuleField,
    pub regex: Regex,
    pub actions: Vec<PlannedAction>,
    pub digest: bool,
}

/// Regex-based reference rule engine. First match wins.
pub struct PatternRules {
    rules: Vec<PatternRule>,
}

impl PatternRules {
    pub fn new(rules: Vec<PatternRule>) -> Self {
        Self { rules }
    }

    /// An empty engine (nothing ever matches).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// A small default set: newsletters get archived and digested,
    /// automated mail systems get archived outright.
    pub fn default_rules() -> Self {
        let archive = |delay| PlannedAction {
            kind: ActionKind::Archive,
            payload: ActionPayload::default(),
            delay,
        };
        Self::new(vec![
            PatternRule {
                name: "Newsletters".into(),
                field: RuleField::Content,
                regex: Regex::new(
                    r"(?i)(click here to unsubscribe|manage your subscription|email preferences|opt[- ]?out)",
                )
                .unwrap(),
                actions: vec![archive(None)],
                digest: true,
            },
            PatternRule {
                name: "Automated senders".into(),
                field: RuleField::Sender,
                regex: Regex::new(r"(?i)^(no[\-_.]?reply|mailer[\-_]?daemon|postmaster)@").unwrap(),
                actions: vec![archive(None)],
                digest: false,
            },
        ])
    }

    pub fn add_rule(&mut self, rule: PatternRule) {
        self.rules.push(rule);
    }
}

#[async_trait]
impl RuleEngine for PatternRules {
    async fn plan(
        &self,
        _account: &Account,
        message: &MailMessage,
    ) -> Result<Option<RulePlan>, Error> {
        for rule in &self.rules {
            let field_value = match rule.field {
                RuleField::Sender => &message.from,
                RuleField::Subject => match message.subject {
                    Some(ref subject) => subject,
                    None => continue,
                },
                RuleField::Content => &message.content,
            };

            if rule.regex.is_match(field_value) {
                debug!(
                    rule = %rule.name,
                    message_id = %message.id,
                    "Message matched rule"
                );
                return Ok(Some(RulePlan {
                    rule_name: rule.name.clone(),
                    actions: rule.actions.clone(),
                    digest: rule.digest,
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::message;
    use chrono::Utc;

    fn account() -> Account {
        Account {
            id: "acct-1".into(),
            email: "user@example.com".into(),
            assistant_email: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn matches_newsletter_content() {
        let engine = PatternRules::default_rules();
        let mut msg = message("m1", "promo@store.com");
        msg.content = "Big sale!\n\nClick here to unsubscribe from these emails.".into();

        let plan = engine.plan(&account(), &msg).await.unwrap().unwrap();
        assert_eq!(plan.rule_name, "Newsletters");
        assert!(plan.digest);
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::Archive);
    }

    #[tokio::test]
    async fn matches_noreply_sender() {
        let engine = PatternRules::default_rules();
        let msg = message("m1", "no-reply@service.io");

        let plan = engine.plan(&account(), &msg).await.unwrap().unwrap();
        assert_eq!(plan.rule_name, "Automated senders");
        assert!(!plan.digest);
    }

    #[tokio::test]
    async fn no_match_returns_none() {
        let engine = PatternRules::default_rules();
        let msg = message("m1", "alice@example.com");
        assert!(engine.plan(&account(), &msg).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_engine_never_matches() {
        let engine = PatternRules::empty();
        let msg = message("m1", "no-reply@service.io");
        assert!(engine.plan(&account(), &msg).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn first_match_wins() {
        let mut engine = PatternRules::empty();
        engine.add_rule(PatternRule {
            name: "First".into(),
            field: RuleField::Sender,
            regex: Regex::new(r"@example\.com$").unwrap(),
            actions: vec![],
            digest: false,
        });
        engine.add_rule(PatternRule {
            name: "Second".into(),
            field: RuleField::Sender,
            regex: Regex::new(r".*").unwrap(),
            actions: vec![],
            digest: false,
        });
        let msg = message("m1", "bob@example.com");
        let plan = engine.plan(&account(), &msg).await.unwrap().unwrap();
        assert_eq!(plan.rule_name, "First");
    }
}
