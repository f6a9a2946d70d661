//! Inbound messages and batches

use crate::ingest::broker::{BrokerError, BrokerFuture};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Acknowledges one delivered message back to the broker
pub trait Acknowledger: Send + Sync {
    fn ack(&self) -> BrokerFuture<'_, ()>;
}

/// A message pulled from the durable consumer
///
/// Nothing is acknowledged until the rows built from it are committed.
#[derive(Clone)]
pub struct InboundMessage {
    subject: String,
    table: String,
    payload: Bytes,
    sequence: u64,
    received_at: DateTime<Utc>,
    dedup_id: Option<String>,
    acker: Arc<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(
        subject: impl Into<String>,
        table: impl Into<String>,
        payload: Bytes,
        sequence: u64,
        received_at: DateTime<Utc>,
        dedup_id: Option<String>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        InboundMessage {
            subject: subject.into(),
            table: table.into(),
            payload,
            sequence,
            received_at,
            dedup_id,
            acker,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Destination table, taken from the subject suffix
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Broker-assigned stream sequence
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Broker publish time
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn dedup_id(&self) -> Option<&str> {
        self.dedup_id.as_deref()
    }

    /// Identity used when the payload carries no `_id`
    ///
    /// The publisher's dedup id if present, else the stream sequence.
    /// Stable across redeliveries of the same message.
    pub fn default_id(&self) -> String {
        match &self.dedup_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => self.sequence.to_string(),
        }
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Table name for a subject under `prefix`
///
/// Returns `None` when the subject is outside the prefix or has no suffix.
pub fn table_for_subject<'a>(subject: &'a str, prefix: &str) -> Option<&'a str> {
    subject.strip_prefix(prefix).filter(|t| !t.is_empty())
}

/// Messages collected for one flush
#[derive(Debug)]
pub struct Batch {
    messages: Vec<InboundMessage>,
    opened_at: Instant,
}

impl Batch {
    pub fn with_capacity(capacity: usize) -> Self {
        Batch {
            messages: Vec::with_capacity(capacity),
            opened_at: Instant::now(),
        }
    }

    pub fn from_messages(messages: Vec<InboundMessage>) -> Self {
        Batch {
            messages,
            opened_at: Instant::now(),
        }
    }

    pub fn push(&mut self, message: InboundMessage) {
        if self.messages.is_empty() {
            self.opened_at = Instant::now();
        }
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn messages(&self) -> &[InboundMessage] {
        &self.messages
    }

    /// Split by destination table, tables in first-appearance order
    pub fn partition_by_table(self) -> Vec<TablePartition> {
        let mut partitions: Vec<TablePartition> = Vec::new();
        for message in self.messages {
            match partitions.iter_mut().find(|p| p.table == message.table()) {
                Some(p) => p.messages.push(message),
                None => partitions.push(TablePartition {
                    table: message.table().to_string(),
                    messages: vec![message],
                }),
            }
        }
        partitions
    }
}

/// Messages of one batch bound for the same table
#[derive(Debug)]
pub struct TablePartition {
    pub table: String,
    pub messages: Vec<InboundMessage>,
}
