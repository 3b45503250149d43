//! Mailflow — durable email-automation core.
//!
//! Rule-triggered actions (archive, label, reply, send) are delayed and
//! later executed exactly once through a conditional-update state
//! machine; bulk mailbox scans paginate through a self-re-enqueuing
//! fetcher and fan out to bounded workers; per-message summaries
//! aggregate into digests with transactional, content-redacting
//! delivery.

pub mod actions;
pub mod api;
pub mod bulk;
pub mod config;
pub mod digest;
pub mod error;
pub mod provider;
pub mod queue;
pub mod rules;
pub mod runtime;
pub mod store;
pub mod summarizer;
