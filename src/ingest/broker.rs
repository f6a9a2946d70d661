//! Broker Abstraction
//!
//! The durable-stream boundary. The pipeline needs very little from the
//! broker: declare a stream, open a durable pull consumer, read messages,
//! ack them, and publish with a dedup id.
//!
//! Implementations:
//! - `InMemoryBroker`: for tests, with disconnect injection
//! - `NatsBroker`: NATS JetStream (feature `nats`)

use crate::ingest::message::InboundMessage;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned across the broker boundary
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Error type for broker operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection-level failure; the subscription must be rebuilt
    Transport(String),
    /// Subscription invalidated by a disconnect
    Disconnected,
    /// No stream accepts the subject or name
    StreamNotFound(String),
    /// Broker refused a publish
    Rejected(String),
    /// Acknowledgement failed
    Ack(String),
}

impl BrokerError {
    /// True if the current subscription generation is unusable
    pub fn is_transport(&self) -> bool {
        matches!(self, BrokerError::Transport(_) | BrokerError::Disconnected)
    }
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::Transport(msg) => write!(f, "Broker transport error: {}", msg),
            BrokerError::Disconnected => write!(f, "Broker disconnected"),
            BrokerError::StreamNotFound(s) => write!(f, "Stream not found: {}", s),
            BrokerError::Rejected(msg) => write!(f, "Publish rejected: {}", msg),
            BrokerError::Ack(msg) => write!(f, "Ack failed: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Stream storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    File,
    Memory,
}

/// Stream retention policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep messages until limits are hit
    Limits,
    /// Remove each message once acknowledged
    WorkQueue,
}

/// Durable stream declaration, applied create-or-update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDefinition {
    pub name: String,
    pub subjects: Vec<String>,
    pub storage: StorageClass,
    pub retention: RetentionPolicy,
    /// Zero means unlimited
    pub max_age: Duration,
    pub max_messages_per_subject: Option<i64>,
    /// Reject new messages on a full subject instead of evicting old ones
    pub discard_new_per_subject: bool,
}

impl StreamDefinition {
    /// Ingest stream capturing every subject under `subject_prefix`
    pub fn ingest(name: &str, subject_prefix: &str, max_age: Duration) -> Self {
        StreamDefinition {
            name: name.to_string(),
            subjects: vec![format!("{}>", subject_prefix)],
            storage: StorageClass::File,
            retention: RetentionPolicy::Limits,
            max_age,
            max_messages_per_subject: None,
            discard_new_per_subject: false,
        }
    }

    /// Work queue holding at most one pending message per subject
    pub fn single_slot_work_queue(name: &str, subject_prefix: &str) -> Self {
        StreamDefinition {
            name: name.to_string(),
            subjects: vec![format!("{}>", subject_prefix)],
            storage: StorageClass::File,
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::ZERO,
            max_messages_per_subject: Some(1),
            discard_new_per_subject: true,
        }
    }

    pub fn accepts(&self, subject: &str) -> bool {
        self.subjects.iter().any(|p| subject_matches(p, subject))
    }
}

/// Match a subject against a pattern whose only wildcard is a trailing `>`
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    match pattern.strip_suffix('>') {
        Some(prefix) => subject.len() > prefix.len() && subject.starts_with(prefix),
        None => pattern == subject,
    }
}

/// Durable pull consumer declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDefinition {
    pub stream: String,
    pub durable_name: String,
    /// Prefix stripped from subjects to get table names
    pub subject_prefix: String,
    pub max_ack_pending: Option<i64>,
    /// Maximum delivery attempts; `None` redelivers forever
    pub max_deliver: Option<i64>,
}

/// Result of a publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted { sequence: u64 },
    /// Same dedup id already accepted, or the subject slot is full
    Duplicate,
}

/// Live consumer read position
pub trait Subscription: Send + 'static {
    /// Next message, `Ok(None)` once the subscription has ended
    ///
    /// Cancel-safe: dropping the future never loses a message.
    fn next_message(&mut self) -> BrokerFuture<'_, Option<InboundMessage>>;
}

/// Durable stream broker
pub trait Broker: Send + Sync + 'static {
    type Subscription: Subscription;

    /// Create the stream, or update it to match `definition`
    fn ensure_stream<'a>(&'a self, definition: &'a StreamDefinition) -> BrokerFuture<'a, ()>;

    /// Create or update the durable consumer and start pulling
    fn subscribe<'a>(
        &'a self,
        definition: &'a ConsumerDefinition,
    ) -> BrokerFuture<'a, Self::Subscription>;

    fn publish<'a>(
        &'a self,
        subject: &'a str,
        payload: Bytes,
        dedup_id: Option<&'a str>,
    ) -> BrokerFuture<'a, PublishOutcome>;
}
