//! Search queries over archived messages.

use super::deleted_message::DeletedMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One predicate on a [`DeletedMessage`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "criterion", content = "value", rename_all = "camelCase")]
pub enum Criterion {
    /// Case-insensitive substring match on the subject.
    SubjectContains(String),
    SubjectEquals(String),
    SenderEquals(String),
    HasRecipient(String),
    HasAttachment(bool),
    OriginMailboxEquals(String),
    DeletedBefore(DateTime<Utc>),
    DeletedAfter(DateTime<Utc>),
    DeliveredBefore(DateTime<Utc>),
    DeliveredAfter(DateTime<Utc>),
}

impl Criterion {
    pub fn matches(&self, message: &DeletedMessage) -> bool {
        match self {
            Criterion::SubjectContains(needle) => message
                .subject
                .as_deref()
                .is_some_and(|s| s.to_lowercase().contains(&needle.to_lowercase())),
            Criterion::SubjectEquals(subject) => message.subject.as_deref() == Some(subject.as_str()),
            Criterion::SenderEquals(sender) => message
                .sender
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(sender)),
            Criterion::HasRecipient(recipient) => message
                .recipients
                .iter()
                .any(|r| r.eq_ignore_ascii_case(recipient)),
            Criterion::HasAttachment(expected) => message.has_attachment == *expected,
            Criterion::OriginMailboxEquals(mailbox) => &message.origin_mailbox == mailbox,
            Criterion::DeletedBefore(instant) => message.deletion_date < *instant,
            Criterion::DeletedAfter(instant) => message.deletion_date > *instant,
            Criterion::DeliveredBefore(instant) => message.delivery_date < *instant,
            Criterion::DeliveredAfter(instant) => message.delivery_date > *instant,
        }
    }
}

/// A result-count limit plus a conjunction of criteria.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pub limit: Option<usize>,
    pub criteria: Vec<Criterion>,
}

impl Query {
    /// Matches every message, without limit.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criteria.push(criterion);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, message: &DeletedMessage) -> bool {
        self.criteria.iter().all(|c| c.matches(message))
    }
}
