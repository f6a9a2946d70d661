//! Event Ingestion
//!
//! Moves JSON events from a durable broker stream into the analytical
//! store with at-least-once delivery.
//!
//! ## Architecture
//!
//! ```text
//! Broker ──► StreamBatcher ──► RowMaterializer ──► AnalyticalStore
//!   ▲             │                   │
//!   │             │ transport error   └── ack after commit
//!   │             ▼
//!   └──── RecoverySupervisor (backoff, resubscribe)
//! ```
//!
//! ## Guarantees
//!
//! - A message is acked only after its row is committed
//! - Each table partition of a batch commits or fails on its own
//! - Unacked messages are redelivered after any failure or restart

pub mod batcher;
pub mod broker;
pub mod config;
pub mod materializer;
pub mod memory_broker;
pub mod message;
pub mod supervisor;
#[cfg(feature = "nats")]
pub mod nats_broker;

pub use batcher::{BatchSink, BatcherConfig, FlushReason, RunOutcome, StreamBatcher};
pub use broker::{
    Broker, BrokerError, BrokerFuture, ConsumerDefinition, PublishOutcome, RetentionPolicy,
    StorageClass, StreamDefinition, Subscription,
};
pub use config::{BrokerConfig, IngestConfig};
pub use materializer::{BatchReport, MaterializeError, RowMaterializer};
pub use memory_broker::{InMemoryBroker, InMemorySubscription};
pub use message::{Acknowledger, Batch, InboundMessage, TablePartition};
pub use supervisor::{RecoverySupervisor, SupervisorError};
#[cfg(feature = "nats")]
pub use nats_broker::{NatsBroker, NatsSubscription};
