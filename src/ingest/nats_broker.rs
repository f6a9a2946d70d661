//! NATS JetStream broker
//!
//! Streams are declared update-first, falling back to create. Consumers
//! are durable pull consumers with explicit acks.

use crate::ingest::broker::{
    Broker, BrokerError, BrokerFuture, ConsumerDefinition, PublishOutcome, RetentionPolicy,
    StorageClass, StreamDefinition, Subscription,
};
use crate::ingest::config::BrokerConfig;
use crate::ingest::message::{table_for_subject, Acknowledger, InboundMessage};
use async_nats::jetstream::{self, consumer::pull, context::Publish, stream};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info};

/// API error code for "maximum messages per subject exceeded"
const PER_SUBJECT_LIMIT_CODE: &str = "10077";

fn transport<E: std::fmt::Display>(e: E) -> BrokerError {
    BrokerError::Transport(e.to_string())
}

/// Broker backed by a NATS JetStream connection
#[derive(Clone)]
pub struct NatsBroker {
    jetstream: jetstream::Context,
}

impl NatsBroker {
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let mut options = async_nats::ConnectOptions::new();
        if let Some(token) = &config.token {
            options = options.token(token.clone());
        }
        let client = options.connect(config.url.as_str()).await.map_err(transport)?;
        info!(url = %config.url, "connected to broker");
        Ok(NatsBroker {
            jetstream: jetstream::new(client),
        })
    }

    fn stream_config(definition: &StreamDefinition) -> stream::Config {
        let mut config = stream::Config {
            name: definition.name.clone(),
            subjects: definition.subjects.clone(),
            max_age: definition.max_age,
            storage: match definition.storage {
                StorageClass::File => stream::StorageType::File,
                StorageClass::Memory => stream::StorageType::Memory,
            },
            retention: match definition.retention {
                RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
                RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
            },
            ..Default::default()
        };
        if let Some(max) = definition.max_messages_per_subject {
            config.max_messages_per_subject = max;
        }
        if definition.discard_new_per_subject {
            config.discard = stream::DiscardPolicy::New;
            config.discard_new_per_subject = true;
        }
        config
    }
}

impl std::fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroker").finish_non_exhaustive()
    }
}

impl Broker for NatsBroker {
    type Subscription = NatsSubscription;

    fn ensure_stream<'a>(&'a self, definition: &'a StreamDefinition) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let config = Self::stream_config(definition);
            match self.jetstream.update_stream(&config).await {
                Ok(_) => {
                    debug!(stream = %definition.name, "stream updated");
                    Ok(())
                }
                Err(update_err) => {
                    debug!(
                        stream = %definition.name,
                        error = %update_err,
                        "update failed, creating"
                    );
                    self.jetstream
                        .create_stream(config)
                        .await
                        .map(|_| ())
                        .map_err(transport)
                }
            }
        })
    }

    fn subscribe<'a>(
        &'a self,
        definition: &'a ConsumerDefinition,
    ) -> BrokerFuture<'a, NatsSubscription> {
        Box::pin(async move {
            let stream = self
                .jetstream
                .get_stream(&definition.stream)
                .await
                .map_err(transport)?;

            let mut config = pull::Config {
                durable_name: Some(definition.durable_name.clone()),
                ..Default::default()
            };
            if let Some(max) = definition.max_ack_pending {
                config.max_ack_pending = max;
            }
            if let Some(max) = definition.max_deliver {
                config.max_deliver = max;
            }

            let consumer = stream.create_consumer(config).await.map_err(transport)?;
            let messages = consumer.messages().await.map_err(transport)?;
            info!(
                stream = %definition.stream,
                consumer = %definition.durable_name,
                "subscribed"
            );
            Ok(NatsSubscription {
                messages: Box::pin(messages),
                subject_prefix: definition.subject_prefix.clone(),
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
            let mut publish = Publish::build().payload(payload);
            if let Some(id) = dedup_id {
                publish = publish.message_id(id);
            }
            let result = match self.jetstream.send_publish(subject.to_string(), publish).await {
                Ok(ack_future) => ack_future.await,
                Err(e) => Err(e),
            };
            match result {
                Ok(ack) if ack.duplicate => Ok(PublishOutcome::Duplicate),
                Ok(ack) => Ok(PublishOutcome::Accepted {
                    sequence: ack.sequence,
                }),
                Err(e) if e.to_string().contains(PER_SUBJECT_LIMIT_CODE) => {
                    Ok(PublishOutcome::Duplicate)
                }
                Err(e) => Err(BrokerError::Rejected(e.to_string())),
            }
        })
    }
}

/// Pull subscription on a durable JetStream consumer
pub struct NatsSubscription {
    messages: Pin<Box<pull::Stream>>,
    subject_prefix: String,
}

impl NatsSubscription {
    fn convert(&self, message: jetstream::Message) -> Result<InboundMessage, BrokerError> {
        let (sequence, received_at) = {
            let info = message.info().map_err(transport)?;
            let published = info.published;
            let received_at =
                DateTime::<Utc>::from_timestamp(published.unix_timestamp(), published.nanosecond())
                    .unwrap_or_else(Utc::now);
            (info.stream_sequence, received_at)
        };
        let subject = message.subject.to_string();
        let table = table_for_subject(&subject, &self.subject_prefix)
            .unwrap_or(&subject)
            .to_string();
        let payload = message.payload.clone();
        let dedup_id = message
            .headers
            .as_ref()
            .and_then(|h| h.get(async_nats::header::NATS_MESSAGE_ID))
            .map(|v| v.as_str().to_string());

        Ok(InboundMessage::new(
            subject,
            table,
            payload,
            sequence,
            received_at,
            dedup_id,
            Arc::new(NatsAcker { message }),
        ))
    }
}

impl Subscription for NatsSubscription {
    fn next_message(&mut self) -> BrokerFuture<'_, Option<InboundMessage>> {
        Box::pin(async move {
            match self.messages.next().await {
                None => Ok(None),
                Some(Err(e)) => Err(transport(e)),
                Some(Ok(message)) => self.convert(message).map(Some),
            }
        })
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

impl Acknowledger for NatsAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.message
                .ack()
                .await
                .map_err(|e| BrokerError::Ack(e.to_string()))
        })
    }
}
