//! Snapshot Scheduler
//!
//! Publishes one trigger per day at a configured local wall-clock time.
//! Every replica runs a scheduler; the trigger's dedup id is derived from
//! the scheduled instant, so replicas racing for the same slot produce at
//! most one accepted trigger.
//!
//! ## Flow (TigerStyle: explicit steps)
//!
//! 1. Compute the next occurrence of `HH:MM` after now
//! 2. Sleep until then (cancellable)
//! 3. Publish `{"scheduled_for": ...}` with dedup id `snapshot-<slot>`
//! 4. Repeat for the following day

use crate::ingest::broker::{Broker, BrokerError, PublishOutcome, StreamDefinition};
use crate::snapshot::key::SNAPSHOT_TIMESTAMP_FORMAT;
use bytes::Bytes;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Next instant strictly after `now` whose local time is `at`
///
/// On a DST gap the slot moves forward to the first valid local time;
/// on an overlap the earlier instant wins.
pub fn next_run<Tz: TimeZone>(now: &DateTime<Tz>, at: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut day = now.date_naive();
    loop {
        let mut local = day.and_time(at);
        // A gap is at most a few hours wide
        for _ in 0..=4 {
            if let Some(candidate) = tz.from_local_datetime(&local).earliest() {
                if candidate > *now {
                    return candidate;
                }
                break;
            }
            local += ChronoDuration::hours(1);
        }
        day = match day.succ_opt() {
            Some(next) => next,
            None => return now.clone() + ChronoDuration::days(1),
        };
    }
}

/// Dedup id for the slot at `at`
pub fn trigger_id(at: DateTime<Utc>) -> String {
    format!("snapshot-{}", at.format(SNAPSHOT_TIMESTAMP_FORMAT))
}

/// Publishes daily snapshot triggers
pub struct SnapshotScheduler<B: Broker> {
    broker: Arc<B>,
    stream: StreamDefinition,
    subject: String,
    at: NaiveTime,
}

impl<B: Broker> SnapshotScheduler<B> {
    pub fn new(broker: Arc<B>, stream: StreamDefinition, subject: String, at: NaiveTime) -> Self {
        SnapshotScheduler {
            broker,
            stream,
            subject,
            at,
        }
    }

    /// Publish the trigger for `slot`
    pub async fn fire(&self, slot: DateTime<Utc>) -> Result<PublishOutcome, BrokerError> {
        self.broker.ensure_stream(&self.stream).await?;
        let payload = serde_json::json!({ "scheduled_for": slot.to_rfc3339() });
        let id = trigger_id(slot);
        self.broker
            .publish(&self.subject, Bytes::from(payload.to_string()), Some(id.as_str()))
            .await
    }

    /// Run until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        info!(at = %self.at.format("%H:%M"), subject = %self.subject, "snapshot scheduler started");
        loop {
            let now = Local::now();
            let next = next_run(&now, self.at);
            let wait = (next.clone() - now).to_std().unwrap_or_default();
            debug!(next = %next.to_rfc3339(), "next snapshot scheduled");

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("snapshot scheduler stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let slot = next.with_timezone(&Utc);
            match self.fire(slot).await {
                Ok(PublishOutcome::Accepted { sequence }) => {
                    info!(slot = %slot.to_rfc3339(), sequence, "snapshot triggered");
                }
                Ok(PublishOutcome::Duplicate) => {
                    debug!(slot = %slot.to_rfc3339(), "snapshot already triggered by another node");
                }
                Err(e) => {
                    warn!(
                        slot = %slot.to_rfc3339(),
                        error = %e,
                        "failed to publish snapshot trigger"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::memory_broker::InMemoryBroker;
    use chrono::{FixedOffset, NaiveDate};

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_next_run_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 30, 0).unwrap();
        let next = next_run(&now, time(1, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_rolls_to_tomorrow() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        let next = next_run(&now, time(1, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap());

        let now = Utc.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
        let next = next_run(&now, time(1, 0));
        assert_eq!(next.date_naive(), NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
    }

    #[test]
    fn test_next_run_keeps_zone() {
        let zone = FixedOffset::east_opt(2 * 3600).unwrap();
        let now = zone.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let next = next_run(&now, time(1, 0));
        assert_eq!(next, zone.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap());
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 3, 1, 23, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_trigger_id_is_slot_derived() {
        let slot = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        assert_eq!(trigger_id(slot), "snapshot-2024-03-01_01-00-00");
    }

    #[tokio::test]
    async fn test_racing_schedulers_publish_once() {
        let broker = Arc::new(InMemoryBroker::new());
        let stream = StreamDefinition::single_slot_work_queue("snapshots", "snapshots.");
        let a = SnapshotScheduler::new(
            broker.clone(),
            stream.clone(),
            "snapshots.run".to_string(),
            time(1, 0),
        );
        let b = SnapshotScheduler::new(
            broker.clone(),
            stream,
            "snapshots.run".to_string(),
            time(1, 0),
        );

        let slot = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        assert!(matches!(
            a.fire(slot).await.unwrap(),
            PublishOutcome::Accepted { .. }
        ));
        assert_eq!(b.fire(slot).await.unwrap(), PublishOutcome::Duplicate);
        assert_eq!(broker.stream_len("snapshots"), 1);
    }

    #[tokio::test]
    async fn test_pending_trigger_blocks_next_slot() {
        let broker = Arc::new(InMemoryBroker::new());
        let stream = StreamDefinition::single_slot_work_queue("snapshots", "snapshots.");
        let scheduler =
            SnapshotScheduler::new(broker.clone(), stream, "snapshots.run".to_string(), time(1, 0));

        let day1 = Utc.with_ymd_and_hms(2024, 3, 1, 1, 0, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap();
        scheduler.fire(day1).await.unwrap();
        // Day one's trigger was never consumed
        assert_eq!(scheduler.fire(day2).await.unwrap(), PublishOutcome::Duplicate);
    }
}
