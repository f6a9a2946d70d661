//! In-memory broker for tests
//!
//! Models the JetStream behaviour the pipeline depends on:
//! - durable consumers survive resubscription; unacked messages are
//!   redelivered to the next subscription
//! - publish dedup ids are remembered
//! - work-queue streams drop messages once acked
//! - a per-subject limit with discard-new reports the publish as duplicate
//!
//! `disconnect()` invalidates every open subscription, which then
//! returns `BrokerError::Disconnected` just like a dropped connection.

use crate::ingest::broker::{
    Broker, BrokerError, BrokerFuture, ConsumerDefinition, PublishOutcome, RetentionPolicy,
    StreamDefinition, Subscription,
};
use crate::ingest::message::{table_for_subject, Acknowledger, InboundMessage};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct StoredMessage {
    subject: String,
    payload: Bytes,
    published_at: DateTime<Utc>,
    dedup_id: Option<String>,
}

#[derive(Debug)]
struct MemStream {
    definition: StreamDefinition,
    messages: BTreeMap<u64, StoredMessage>,
    dedup_ids: HashSet<String>,
    last_sequence: u64,
}

#[derive(Debug)]
struct ConsumerState {
    definition: ConsumerDefinition,
    acked: BTreeSet<u64>,
    deliveries: HashMap<u64, u32>,
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: BTreeMap<String, MemStream>,
    /// (stream, durable name) -> consumer
    consumers: HashMap<(String, String), ConsumerState>,
    /// Bumped on every disconnect
    generation: u64,
    subscribe_failures: u32,
    fail_acks: bool,
}

#[derive(Debug, Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// Broker held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the "connection": every open subscription fails
    pub fn disconnect(&self) {
        self.inner.state.lock().generation += 1;
        self.inner.notify.notify_waiters();
    }

    /// Make the next `n` subscribe calls fail with a transport error
    pub fn fail_next_subscribes(&self, n: u32) {
        self.inner.state.lock().subscribe_failures = n;
    }

    pub fn set_fail_acks(&self, fail: bool) {
        self.inner.state.lock().fail_acks = fail;
    }

    /// Messages currently retained by `stream`
    pub fn stream_len(&self, stream: &str) -> usize {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    pub fn acked_count(&self, stream: &str, consumer: &str) -> usize {
        self.inner
            .state
            .lock()
            .consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .map(|c| c.acked.len())
            .unwrap_or(0)
    }

    pub fn is_acked(&self, stream: &str, consumer: &str, sequence: u64) -> bool {
        self.inner
            .state
            .lock()
            .consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .map(|c| c.acked.contains(&sequence))
            .unwrap_or(false)
    }

    /// Times `sequence` has been handed to `consumer`
    pub fn delivery_count(&self, stream: &str, consumer: &str, sequence: u64) -> u32 {
        self.inner
            .state
            .lock()
            .consumers
            .get(&(stream.to_string(), consumer.to_string()))
            .and_then(|c| c.deliveries.get(&sequence).copied())
            .unwrap_or(0)
    }

    pub fn stream_definition(&self, stream: &str) -> Option<StreamDefinition> {
        self.inner
            .state
            .lock()
            .streams
            .get(stream)
            .map(|s| s.definition.clone())
    }
}

impl Broker for InMemoryBroker {
    type Subscription = InMemorySubscription;

    fn ensure_stream<'a>(&'a self, definition: &'a StreamDefinition) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.inner.state.lock();
            state
                .streams
                .entry(definition.name.clone())
                .and_modify(|s| s.definition = definition.clone())
                .or_insert_with(|| MemStream {
                    definition: definition.clone(),
                    messages: BTreeMap::new(),
                    dedup_ids: HashSet::new(),
                    last_sequence: 0,
                });
            Ok(())
        })
    }

    fn subscribe<'a>(
        &'a self,
        definition: &'a ConsumerDefinition,
    ) -> BrokerFuture<'a, InMemorySubscription> {
        Box::pin(async move {
            let mut state = self.inner.state.lock();
            if state.subscribe_failures > 0 {
                state.subscribe_failures -= 1;
                return Err(BrokerError::Transport("connection refused".to_string()));
            }
            if !state.streams.contains_key(&definition.stream) {
                return Err(BrokerError::StreamNotFound(definition.stream.clone()));
            }
            let key = (definition.stream.clone(), definition.durable_name.clone());
            state
                .consumers
                .entry(key.clone())
                .and_modify(|c| c.definition = definition.clone())
                .or_insert_with(|| ConsumerState {
                    definition: definition.clone(),
                    acked: BTreeSet::new(),
                    deliveries: HashMap::new(),
                });
            Ok(InMemorySubscription {
                inner: Arc::clone(&self.inner),
                key,
                subject_prefix: definition.subject_prefix.clone(),
                generation: state.generation,
                cursor: 0,
            })
        })
    }

    fn publish<'a>(
        &'a self,
        subject: &'a str,
        payload: Bytes,
        dedup_id: Option<&'a str>,
    ) -> BrokerFuture<'a, PublishOutcome> {
        Box::pin(async move {
            let outcome = {
                let mut state = self.inner.state.lock();
                let stream = state
                    .streams
                    .values_mut()
                    .find(|s| s.definition.accepts(subject))
                    .ok_or_else(|| BrokerError::StreamNotFound(subject.to_string()))?;

                if let Some(id) = dedup_id {
                    if stream.dedup_ids.contains(id) {
                        return Ok(PublishOutcome::Duplicate);
                    }
                }
                if let Some(max) = stream.definition.max_messages_per_subject {
                    let held = stream
                        .messages
                        .values()
                        .filter(|m| m.subject == subject)
                        .count() as i64;
                    if held >= max && stream.definition.discard_new_per_subject {
                        return Ok(PublishOutcome::Duplicate);
                    }
                }

                stream.last_sequence += 1;
                let sequence = stream.last_sequence;
                stream.messages.insert(
                    sequence,
                    StoredMessage {
                        subject: subject.to_string(),
                        payload,
                        published_at: Utc::now(),
                        dedup_id: dedup_id.map(str::to_string),
                    },
                );
                if let Some(id) = dedup_id {
                    stream.dedup_ids.insert(id.to_string());
                }
                PublishOutcome::Accepted { sequence }
            };
            self.inner.notify.notify_waiters();
            Ok(outcome)
        })
    }
}

/// Subscription on an [`InMemoryBroker`] consumer
#[derive(Debug)]
pub struct InMemorySubscription {
    inner: Arc<BrokerInner>,
    key: (String, String),
    subject_prefix: String,
    generation: u64,
    /// Highest sequence handed out by this subscription
    cursor: u64,
}

impl InMemorySubscription {
    fn try_next(&mut self) -> Result<Option<InboundMessage>, BrokerError> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.generation != self.generation {
            return Err(BrokerError::Disconnected);
        }
        let stream = state
            .streams
            .get(&self.key.0)
            .ok_or_else(|| BrokerError::StreamNotFound(self.key.0.clone()))?;
        let consumer = state
            .consumers
            .get_mut(&self.key)
            .ok_or(BrokerError::Disconnected)?;

        let max_deliver = consumer.definition.max_deliver;
        let next = stream
            .messages
            .range(self.cursor + 1..)
            .find(|(seq, _)| {
                let delivered = consumer.deliveries.get(*seq).copied().unwrap_or(0) as i64;
                !consumer.acked.contains(*seq) && max_deliver.map_or(true, |m| delivered < m)
            })
            .map(|(seq, m)| (*seq, m.clone()));

        let Some((sequence, stored)) = next else {
            return Ok(None);
        };
        self.cursor = sequence;
        *consumer.deliveries.entry(sequence).or_insert(0) += 1;

        let table = table_for_subject(&stored.subject, &self.subject_prefix)
            .unwrap_or(&stored.subject)
            .to_string();
        let acker = Arc::new(InMemoryAcker {
            inner: Arc::clone(&self.inner),
            key: self.key.clone(),
            sequence,
        });
        Ok(Some(InboundMessage::new(
            stored.subject,
            table,
            stored.payload,
            sequence,
            stored.published_at,
            stored.dedup_id,
            acker,
        )))
    }
}

impl Subscription for InMemorySubscription {
    fn next_message(&mut self) -> BrokerFuture<'_, Option<InboundMessage>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            loop {
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                // Register before checking so a publish in between is not missed
                notified.as_mut().enable();

                if let Some(message) = self.try_next()? {
                    return Ok(Some(message));
                }
                notified.await;
            }
        })
    }
}

struct InMemoryAcker {
    inner: Arc<BrokerInner>,
    key: (String, String),
    sequence: u64,
}

impl Acknowledger for InMemoryAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if state.fail_acks {
                return Err(BrokerError::Ack("ack rejected".to_string()));
            }
            if let Some(consumer) = state.consumers.get_mut(&self.key) {
                consumer.acked.insert(self.sequence);
            }
            if let Some(stream) = state.streams.get_mut(&self.key.0) {
                if stream.definition.retention == RetentionPolicy::WorkQueue {
                    stream.messages.remove(&self.sequence);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn consumer() -> ConsumerDefinition {
        ConsumerDefinition {
            stream: "ingest".to_string(),
            durable_name: "c1".to_string(),
            subject_prefix: "ingest.".to_string(),
            max_ack_pending: None,
            max_deliver: None,
        }
    }

    async fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .ensure_stream(&StreamDefinition::ingest("ingest", "ingest.", Duration::ZERO))
            .await
            .unwrap();
        broker
    }

    #[tokio::test]
    async fn test_delivers_with_table_and_sequence() {
        let broker = broker().await;
        broker
            .publish("ingest.events", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();

        let mut sub = broker.subscribe(&consumer()).await.unwrap();
        let msg = sub.next_message().await.unwrap().unwrap();
        assert_eq!(msg.table(), "events");
        assert_eq!(msg.sequence(), 1);
    }

    #[tokio::test]
    async fn test_unacked_redelivered_after_resubscribe() {
        let broker = broker().await;
        for _ in 0..2 {
            broker
                .publish("ingest.t", Bytes::from_static(b"{}"), None)
                .await
                .unwrap();
        }

        let mut sub = broker.subscribe(&consumer()).await.unwrap();
        let first = sub.next_message().await.unwrap().unwrap();
        let _second = sub.next_message().await.unwrap().unwrap();
        first.ack().await.unwrap();

        broker.disconnect();
        assert_eq!(sub.next_message().await.unwrap_err(), BrokerError::Disconnected);

        let mut sub = broker.subscribe(&consumer()).await.unwrap();
        let again = sub.next_message().await.unwrap().unwrap();
        assert_eq!(again.sequence(), 2);
        assert_eq!(broker.delivery_count("ingest", "c1", 2), 2);
    }

    #[tokio::test]
    async fn test_dedup_id() {
        let broker = broker().await;
        let a = broker
            .publish("ingest.t", Bytes::new(), Some("id-1"))
            .await
            .unwrap();
        let b = broker
            .publish("ingest.t", Bytes::new(), Some("id-1"))
            .await
            .unwrap();
        assert!(matches!(a, PublishOutcome::Accepted { .. }));
        assert_eq!(b, PublishOutcome::Duplicate);
        assert_eq!(broker.stream_len("ingest"), 1);
    }

    #[tokio::test]
    async fn test_work_queue_single_slot() {
        let broker = InMemoryBroker::new();
        broker
            .ensure_stream(&StreamDefinition::single_slot_work_queue("snap", "snap."))
            .await
            .unwrap();
        let first = broker.publish("snap.run", Bytes::new(), Some("a")).await.unwrap();
        let second = broker.publish("snap.run", Bytes::new(), Some("b")).await.unwrap();
        assert!(matches!(first, PublishOutcome::Accepted { .. }));
        assert_eq!(second, PublishOutcome::Duplicate);

        let mut sub = broker
            .subscribe(&ConsumerDefinition {
                stream: "snap".to_string(),
                durable_name: "exec".to_string(),
                subject_prefix: "snap.".to_string(),
                max_ack_pending: None,
                max_deliver: None,
            })
            .await
            .unwrap();
        sub.next_message().await.unwrap().unwrap().ack().await.unwrap();
        assert_eq!(broker.stream_len("snap"), 0);
    }

    #[tokio::test]
    async fn test_max_deliver_stops_redelivery() {
        let broker = broker().await;
        broker.publish("ingest.t", Bytes::new(), None).await.unwrap();
        let mut def = consumer();
        def.max_deliver = Some(1);

        let mut sub = broker.subscribe(&def).await.unwrap();
        sub.next_message().await.unwrap().unwrap();
        broker.disconnect();

        let mut sub = broker.subscribe(&def).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), sub.next_message()).await;
        assert!(waited.is_err(), "message should not be redelivered");
    }

    #[tokio::test]
    async fn test_waiting_subscriber_wakes_on_publish() {
        let broker = broker().await;
        let mut sub = broker.subscribe(&consumer()).await.unwrap();
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher
                .publish("ingest.t", Bytes::from_static(b"{}"), None)
                .await
                .unwrap();
        });
        let msg = tokio::time::timeout(Duration::from_secs(5), sub.next_message())
            .await
            .unwrap()
            .unwrap();
        assert!(msg.is_some());
    }

    #[tokio::test]
    async fn test_subscribe_failure_injection() {
        let broker = broker().await;
        broker.fail_next_subscribes(1);
        assert!(broker.subscribe(&consumer()).await.unwrap_err().is_transport());
        assert!(broker.subscribe(&consumer()).await.is_ok());
    }
}
