//! Ingest Pipeline Integration Tests
//!
//! Runs the full path, broker to store, against the in-memory broker and
//! the in-memory analytical store:
//!
//! ```text
//! InMemoryBroker ─► RecoverySupervisor ─► StreamBatcher ─► RowMaterializer ─► MemoryAnalyticalStore
//! ```
//!
//! ## Test Categories
//!
//! - **Flush behaviour**: size and deadline flushes, unique ids
//! - **Isolation**: one table failing leaves the others committed
//! - **Recovery**: transport failure, backoff, resubscribe, redelivery

use bytes::Bytes;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use stream_ingest::ingest::{
    Batch, BatchReport, BatchSink, BatcherConfig, Broker, ConsumerDefinition, InMemoryBroker,
    RecoverySupervisor, RowMaterializer, StreamBatcher, StreamDefinition,
};
use stream_ingest::observability::IngestStats;
use stream_ingest::schema::{CellValue, ColumnType, SchemaCache, ID_COLUMN};
use stream_ingest::store::{AnalyticalStore, MemoryAnalyticalStore};
use tokio_util::sync::CancellationToken;

const STREAM: &str = "ingest";
const CONSUMER: &str = "pipeline";

/// Materializer that remembers the size of every flush
struct FlushLog {
    inner: RowMaterializer<MemoryAnalyticalStore>,
    sizes: Arc<parking_lot::Mutex<Vec<usize>>>,
}

impl BatchSink for FlushLog {
    fn process_batch(
        &mut self,
        batch: Batch,
    ) -> Pin<Box<dyn Future<Output = BatchReport> + Send + '_>> {
        Box::pin(async move {
            self.sizes.lock().push(batch.len());
            self.inner.materialize(batch).await
        })
    }
}

struct Harness {
    broker: InMemoryBroker,
    store: Arc<MemoryAnalyticalStore>,
    stats: Arc<IngestStats>,
    sizes: Arc<parking_lot::Mutex<Vec<usize>>>,
}

impl Harness {
    async fn new() -> Self {
        let broker = InMemoryBroker::new();
        broker
            .ensure_stream(&stream_definition())
            .await
            .unwrap();
        Harness {
            broker,
            store: Arc::new(MemoryAnalyticalStore::new()),
            stats: Arc::new(IngestStats::default()),
            sizes: Arc::new(parking_lot::Mutex::new(Vec::new())),
        }
    }

    async fn publish(&self, table: &str, payload: serde_json::Value) {
        self.broker
            .publish(
                &format!("ingest.{}", table),
                Bytes::from(payload.to_string()),
                None,
            )
            .await
            .unwrap();
    }

    /// Run the supervisor until `done` holds or the timeout hits
    async fn run_until<F>(&self, batch_size: usize, flush_timeout: Duration, done: F)
    where
        F: Fn(&Harness) -> bool,
    {
        let supervisor = RecoverySupervisor::new(
            Arc::new(self.broker.clone()),
            stream_definition(),
            consumer_definition(),
            StreamBatcher::new(
                BatcherConfig {
                    batch_size,
                    flush_timeout,
                },
                self.stats.clone(),
            ),
            Duration::from_millis(100),
            self.stats.clone(),
        );
        let mut sink = FlushLog {
            inner: RowMaterializer::new(
                self.store.clone(),
                SchemaCache::new(Duration::from_secs(3600)),
                self.stats.clone(),
            ),
            sizes: self.sizes.clone(),
        };
        let cancel = CancellationToken::new();
        let run = {
            let cancel = cancel.clone();
            async move { supervisor.run(&mut sink, cancel).await }
        };
        let watch = async {
            while !done(self) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            cancel.cancel();
        };

        let (result, _) = tokio::time::timeout(Duration::from_secs(20), async {
            tokio::join!(run, watch)
        })
        .await
        .expect("pipeline did not reach the expected state");
        result.unwrap();
    }
}

fn stream_definition() -> StreamDefinition {
    StreamDefinition::ingest(STREAM, "ingest.", Duration::ZERO)
}

fn consumer_definition() -> ConsumerDefinition {
    ConsumerDefinition {
        stream: STREAM.to_string(),
        durable_name: CONSUMER.to_string(),
        subject_prefix: "ingest.".to_string(),
        max_ack_pending: None,
        max_deliver: None,
    }
}

// ============================================================================
// Flush behaviour
// ============================================================================

#[tokio::test]
async fn test_1500_messages_flush_as_1000_then_500() {
    let harness = Harness::new().await;
    for i in 0..1500 {
        harness
            .publish("events", serde_json::json!({ "n": i, "kind": "click" }))
            .await;
    }

    harness
        .run_until(1000, Duration::from_secs(2), |h| h.store.row_count("events") == 1500)
        .await;

    assert_eq!(*harness.sizes.lock(), vec![1000, 500]);
    assert_eq!(harness.stats.snapshot().batches_flushed, 2);
    assert_eq!(harness.broker.acked_count(STREAM, CONSUMER), 1500);

    let ids: Vec<String> = harness
        .store
        .column_values("events", ID_COLUMN)
        .into_iter()
        .map(|v| match v {
            CellValue::String(s) => s,
            other => panic!("unexpected _id value {:?}", other),
        })
        .collect();
    assert_eq!(ids.len(), 1500);
    assert!(ids.iter().all(|id| !id.is_empty()));
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 1500);
}

#[tokio::test]
async fn test_schema_grows_with_new_fields() {
    let harness = Harness::new().await;
    harness.publish("users", serde_json::json!({ "name": "ada" })).await;
    harness
        .run_until(10, Duration::from_millis(50), |h| h.store.row_count("users") == 1)
        .await;

    harness
        .publish(
            "users",
            serde_json::json!({ "name": "grace", "age": 45, "joined": "2024-02-01" }),
        )
        .await;
    harness
        .run_until(10, Duration::from_millis(50), |h| h.store.row_count("users") == 2)
        .await;

    let columns = harness.store.describe_table("users").unwrap().unwrap();
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["_id", "_ts", "name", "age", "joined"]);
    assert_eq!(columns[3].column_type, ColumnType::Double);
    assert_eq!(columns[4].column_type, ColumnType::Date);
    assert_eq!(
        harness.store.column_values("users", "age"),
        vec![CellValue::Null, CellValue::Number(45.0)]
    );
}

// ============================================================================
// Isolation
// ============================================================================

#[tokio::test]
async fn test_failing_table_does_not_block_others() {
    let harness = Harness::new().await;
    harness.publish("good", serde_json::json!({ "v": 1 })).await;
    harness.publish("bad", serde_json::json!({ "v": 1 })).await;
    harness.publish("good", serde_json::json!({ "v": 2 })).await;
    harness.store.fail_appends("bad", "disk full");

    harness
        .run_until(10, Duration::from_millis(50), |h| {
            h.store.row_count("good") == 2 && h.stats.snapshot().partitions_failed >= 1
        })
        .await;

    assert_eq!(harness.store.row_count("bad"), 0);
    assert!(harness.broker.is_acked(STREAM, CONSUMER, 1));
    assert!(!harness.broker.is_acked(STREAM, CONSUMER, 2));
    assert!(harness.broker.is_acked(STREAM, CONSUMER, 3));

    // Unacked message is redelivered once the store recovers
    harness.store.clear_faults();
    harness
        .run_until(10, Duration::from_millis(50), |h| h.store.row_count("bad") == 1)
        .await;
    assert!(harness.broker.is_acked(STREAM, CONSUMER, 2));
}

#[tokio::test]
async fn test_malformed_message_stays_unacked() {
    let harness = Harness::new().await;
    harness
        .broker
        .publish("ingest.logs", Bytes::from_static(b"{not json"), None)
        .await
        .unwrap();
    harness.publish("metrics", serde_json::json!({ "cpu": 0.5 })).await;

    harness
        .run_until(10, Duration::from_millis(50), |h| {
            h.store.row_count("metrics") == 1 && h.stats.snapshot().partitions_failed >= 1
        })
        .await;

    assert!(!harness.broker.is_acked(STREAM, CONSUMER, 1));
    assert!(harness.broker.is_acked(STREAM, CONSUMER, 2));
    assert!(harness.store.describe_table("logs").unwrap().is_none());
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_recovers_after_transport_failure() {
    let harness = Harness::new().await;
    for i in 0..5 {
        harness.publish("events", serde_json::json!({ "n": i })).await;
    }

    let broker = harness.broker.clone();
    let injector = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        broker.disconnect();
        for i in 5..10 {
            broker
                .publish(
                    "ingest.events",
                    Bytes::from(serde_json::json!({ "n": i }).to_string()),
                    None,
                )
                .await
                .unwrap();
        }
    });

    harness
        .run_until(4, Duration::from_millis(50), |h| h.store.row_count("events") == 10)
        .await;
    injector.await.unwrap();

    let snap = harness.stats.snapshot();
    assert_eq!(snap.transport_errors, 1);
    assert_eq!(snap.resubscriptions, 1);
    assert_eq!(harness.broker.acked_count(STREAM, CONSUMER), 10);
}
