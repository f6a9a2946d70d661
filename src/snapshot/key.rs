//! Snapshot Keys
//!
//! Object keys embed the snapshot instant so the latest snapshot can be
//! found by listing a prefix:
//!
//! ```text
//! <prefix>state-2024-01-31_01-00-00.db          transactional store copy
//! <prefix>analytics-2024-01-31_01-00-00/        analytical export
//!     load.sql                                  completion manifest
//!     ...
//! ```

use crate::snapshot::object_store::ObjectMeta;
use crate::store::EXPORT_MANIFEST;
use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamp layout embedded in keys
pub const SNAPSHOT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const STATE_STEM: &str = "state-";
const STATE_SUFFIX: &str = ".db";
const ANALYTICS_STEM: &str = "analytics-";

/// Which local store a snapshot belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    /// Transactional state store (single file)
    State,
    /// Analytical store export (directory of files)
    Analytics,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::State => write!(f, "state"),
            StoreKind::Analytics => write!(f, "analytics"),
        }
    }
}

/// Location of one snapshot in object storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotKey {
    pub kind: StoreKind,
    pub timestamp: NaiveDateTime,
    /// Full object key; for analytics, the directory prefix with trailing `/`
    pub key: String,
}

impl SnapshotKey {
    pub fn new(prefix: &str, kind: StoreKind, at: DateTime<Utc>) -> Self {
        let timestamp = at.naive_utc();
        let stamp = timestamp.format(SNAPSHOT_TIMESTAMP_FORMAT);
        let key = match kind {
            StoreKind::State => format!("{}{}{}{}", prefix, STATE_STEM, stamp, STATE_SUFFIX),
            StoreKind::Analytics => format!("{}{}{}/", prefix, ANALYTICS_STEM, stamp),
        };
        // Second precision, so parse(key) == Self
        let timestamp = NaiveDateTime::parse_from_str(&stamp.to_string(), SNAPSHOT_TIMESTAMP_FORMAT)
            .unwrap_or(timestamp);
        SnapshotKey {
            kind,
            timestamp,
            key,
        }
    }

    /// Recognize a listed object key as a snapshot of `kind`
    ///
    /// Analytics keys may point at any object inside the export directory;
    /// the returned key is the directory prefix.
    pub fn parse(prefix: &str, kind: StoreKind, object_key: &str) -> Option<Self> {
        let rest = object_key.strip_prefix(prefix)?;
        let (stamp, key) = match kind {
            StoreKind::State => {
                let stamp = rest.strip_prefix(STATE_STEM)?.strip_suffix(STATE_SUFFIX)?;
                (stamp, object_key.to_string())
            }
            StoreKind::Analytics => {
                let inner = rest.strip_prefix(ANALYTICS_STEM)?;
                let (stamp, _) = inner.split_once('/')?;
                (stamp, format!("{}{}{}/", prefix, ANALYTICS_STEM, stamp))
            }
        };
        let timestamp = NaiveDateTime::parse_from_str(stamp, SNAPSHOT_TIMESTAMP_FORMAT).ok()?;
        Some(SnapshotKey {
            kind,
            timestamp,
            key,
        })
    }

    /// Key of the completion manifest (analytics only)
    pub fn manifest_key(&self) -> String {
        format!("{}{}", self.key, EXPORT_MANIFEST)
    }

    /// Key of a file inside an analytics export
    pub fn child_key(&self, relative: &str) -> String {
        format!("{}{}", self.key, relative)
    }
}

/// Newest state snapshot among `objects`
pub fn latest_state_snapshot(prefix: &str, objects: &[ObjectMeta]) -> Option<SnapshotKey> {
    objects
        .iter()
        .filter_map(|o| SnapshotKey::parse(prefix, StoreKind::State, &o.key))
        .max_by_key(|k| k.timestamp)
}

/// Newest analytics export among `objects` whose manifest is present
pub fn latest_complete_analytics_snapshot(
    prefix: &str,
    objects: &[ObjectMeta],
) -> Option<SnapshotKey> {
    objects
        .iter()
        .filter_map(|o| {
            let key = SnapshotKey::parse(prefix, StoreKind::Analytics, &o.key)?;
            (o.key == key.manifest_key()).then_some(key)
        })
        .max_by_key(|k| k.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn meta(key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size_bytes: 1,
            modified_at_ms: 0,
        }
    }

    #[test]
    fn test_key_layout() {
        let at = Utc.with_ymd_and_hms(2024, 1, 31, 1, 0, 0).unwrap();
        let state = SnapshotKey::new("snapshots/", StoreKind::State, at);
        assert_eq!(state.key, "snapshots/state-2024-01-31_01-00-00.db");
        let analytics = SnapshotKey::new("snapshots/", StoreKind::Analytics, at);
        assert_eq!(analytics.key, "snapshots/analytics-2024-01-31_01-00-00/");
        assert_eq!(
            analytics.manifest_key(),
            "snapshots/analytics-2024-01-31_01-00-00/load.sql"
        );

        assert_eq!(
            SnapshotKey::parse("snapshots/", StoreKind::State, &state.key),
            Some(state)
        );
        assert_eq!(
            SnapshotKey::parse("snapshots/", StoreKind::Analytics, &analytics.manifest_key()),
            Some(analytics)
        );
    }

    #[test]
    fn test_latest_of_three() {
        let objects = vec![
            meta("s/state-2024-01-02_01-00-00.db"),
            meta("s/state-2024-01-03_01-00-00.db"),
            meta("s/state-2024-01-01_01-00-00.db"),
        ];
        let latest = latest_state_snapshot("s/", &objects).unwrap();
        assert_eq!(latest.key, "s/state-2024-01-03_01-00-00.db");
    }

    #[test]
    fn test_unparseable_keys_skipped() {
        let objects = vec![
            meta("s/state-yesterday.db"),
            meta("s/state-2024-01-01_01-00-00.db"),
            meta("s/state-2024-13-01_01-00-00.db"),
            meta("s/notes.txt"),
        ];
        let latest = latest_state_snapshot("s/", &objects).unwrap();
        assert_eq!(latest.key, "s/state-2024-01-01_01-00-00.db");
        assert!(latest_state_snapshot("s/", &[meta("s/readme")]).is_none());
    }

    #[test]
    fn test_analytics_without_manifest_is_ignored() {
        let objects = vec![
            meta("s/analytics-2024-01-01_01-00-00/load.sql"),
            meta("s/analytics-2024-01-01_01-00-00/schema.sql"),
            meta("s/analytics-2024-01-02_01-00-00/schema.sql"),
            meta("s/analytics-2024-01-02_01-00-00/events.parquet"),
        ];
        let latest = latest_complete_analytics_snapshot("s/", &objects).unwrap();
        assert_eq!(latest.key, "s/analytics-2024-01-01_01-00-00/");

        let incomplete = vec![meta("s/analytics-2024-01-02_01-00-00/schema.sql")];
        assert!(latest_complete_analytics_snapshot("s/", &incomplete).is_none());
    }
}
