//! Digest aggregation and transactional delivery.

pub mod aggregator;
pub mod model;
pub mod sender;

pub use aggregator::{AddItemOutcome, DigestAggregator};
pub use model::{
    Digest, DigestItem, DigestSchedule, DigestStatus, REDACTED_CONTENT, next_occurrence,
};
pub use sender::{DigestSender, SendOutcome};
