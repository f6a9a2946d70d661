//! Value Coercion
//!
//! Converts raw JSON field values into [`CellValue`]s for a known column,
//! and holds the string patterns shared with type inference.

use crate::schema::types::{CellValue, ColumnDescriptor, ColumnType};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Date-time layouts accepted in addition to RFC 3339
const TIMESTAMP_LAYOUTS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Date-time layouts carrying an explicit offset
const TIMESTAMP_OFFSET_LAYOUTS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"];

/// Calendar-date layouts, tried in order
const DATE_LAYOUTS: [&str; 4] = ["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%d.%m.%Y"];

/// Numbers above this are read as Unix milliseconds rather than seconds
const UNIX_MILLIS_THRESHOLD: f64 = 1e11;

/// Error converting a field value into a column's type
#[derive(Debug, Clone, PartialEq)]
pub enum CoercionError {
    /// String did not match any accepted timestamp layout
    UnparsableTimestamp { column: String, value: String },
    /// String did not match any accepted date layout
    UnparsableDate { column: String, value: String },
    /// Value kind cannot be stored in the column at all
    Unsupported {
        column: String,
        expected: ColumnType,
        found: &'static str,
    },
    /// Number outside the representable timestamp range
    OutOfRange { column: String, value: f64 },
}

impl std::fmt::Display for CoercionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoercionError::UnparsableTimestamp { column, value } => {
                write!(f, "column {}: unparsable timestamp {:?}", column, value)
            }
            CoercionError::UnparsableDate { column, value } => {
                write!(f, "column {}: unparsable date {:?}", column, value)
            }
            CoercionError::Unsupported {
                column,
                expected,
                found,
            } => write!(f, "column {}: cannot store {} as {}", column, found, expected),
            CoercionError::OutOfRange { column, value } => {
                write!(f, "column {}: {} is out of timestamp range", column, value)
            }
        }
    }
}

impl std::error::Error for CoercionError {}

/// Parse a date-time string with a time component
///
/// Strings without an offset are read as UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in TIMESTAMP_OFFSET_LAYOUTS {
        if let Ok(dt) = DateTime::parse_from_str(s, layout) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    TIMESTAMP_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(s, layout).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse a strict calendar date
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    DATE_LAYOUTS
        .iter()
        .find_map(|layout| NaiveDate::parse_from_str(s, layout).ok())
}

/// Timestamp columns also take bare dates, at midnight UTC
fn parse_timestamp_or_date(s: &str) -> Option<DateTime<Utc>> {
    parse_timestamp(s).or_else(|| {
        parse_date(s)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
    })
}

/// Interpret a number as Unix time
///
/// Values above 1e11 are milliseconds, everything else seconds.
pub fn unix_to_timestamp(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    if value > UNIX_MILLIS_THRESHOLD {
        return DateTime::from_timestamp_millis(value as i64);
    }
    let secs = value.floor();
    let nanos = ((value - secs) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(secs as i64, nanos)
}

/// Short kind name of a JSON value
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Convert a field value for the given column
pub fn coerce_value(column: &ColumnDescriptor, value: &Value) -> Result<CellValue, CoercionError> {
    if value.is_null() {
        return Ok(CellValue::Null);
    }
    match column.column_type {
        ColumnType::Json => Ok(CellValue::Json(value.to_string())),
        ColumnType::Timestamp => coerce_timestamp(&column.name, value),
        ColumnType::Date => match value {
            Value::String(s) => parse_date(s)
                .or_else(|| parse_timestamp(s).map(|t| t.date_naive()))
                .map(CellValue::Date)
                .ok_or_else(|| CoercionError::UnparsableDate {
                    column: column.name.clone(),
                    value: s.clone(),
                }),
            other => Err(unsupported(column, other)),
        },
        ColumnType::Boolean => match value {
            Value::Bool(b) => Ok(CellValue::Bool(*b)),
            other => Err(unsupported(column, other)),
        },
        ColumnType::Double => match value.as_f64() {
            Some(n) => Ok(CellValue::Number(n)),
            None => Err(unsupported(column, value)),
        },
        ColumnType::Varchar => Ok(match value {
            Value::String(s) => CellValue::String(s.clone()),
            Value::Array(_) | Value::Object(_) => CellValue::Json(value.to_string()),
            other => CellValue::String(other.to_string()),
        }),
    }
}

/// Timestamp from a string or Unix number
fn coerce_timestamp(column: &str, value: &Value) -> Result<CellValue, CoercionError> {
    match value {
        Value::String(s) => parse_timestamp_or_date(s)
            .map(CellValue::Timestamp)
            .ok_or_else(|| CoercionError::UnparsableTimestamp {
                column: column.to_string(),
                value: s.clone(),
            }),
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or(f64::NAN);
            unix_to_timestamp(n)
                .map(CellValue::Timestamp)
                .ok_or(CoercionError::OutOfRange {
                    column: column.to_string(),
                    value: n,
                })
        }
        other => Err(CoercionError::Unsupported {
            column: column.to_string(),
            expected: ColumnType::Timestamp,
            found: json_kind(other),
        }),
    }
}

/// Resolve the event time for a row
///
/// A payload `_ts` string must parse, a number is Unix time and any
/// other kind falls back to the broker timestamp.
pub fn resolve_event_time(
    column: &str,
    payload_value: Option<&Value>,
    fallback: DateTime<Utc>,
) -> Result<CellValue, CoercionError> {
    match payload_value {
        Some(v @ (Value::String(_) | Value::Number(_))) => coerce_timestamp(column, v),
        _ => Ok(CellValue::Timestamp(fallback)),
    }
}

fn unsupported(column: &ColumnDescriptor, value: &Value) -> CoercionError {
    CoercionError::Unsupported {
        column: column.name.clone(),
        expected: column.column_type,
        found: json_kind(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn col(name: &str, ty: ColumnType) -> ColumnDescriptor {
        ColumnDescriptor::new(name, ty)
    }

    #[test]
    fn test_parse_timestamp_layouts() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T12:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T14:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01 12:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T12:30:00"), Some(expected));
        assert!(parse_timestamp("2024-03-01 12:30:00.250").is_some());
        assert!(parse_timestamp("2024-03-01T12:30:00.123456789Z").is_some());
        assert!(parse_timestamp("2024-03-01").is_none());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_parse_date_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(parse_date("2024-03-01"), Some(expected));
        assert_eq!(parse_date("03/01/2024"), Some(expected));
        assert_eq!(parse_date("01.03.2024"), Some(expected));
        // day-first fallback when month-first is impossible
        assert_eq!(parse_date("25/12/2024"), NaiveDate::from_ymd_opt(2024, 12, 25));
        assert!(parse_date("2024-03-01T00:00:00Z").is_none());
        assert!(parse_date("March 1st").is_none());
    }

    #[test]
    fn test_unix_seconds_vs_millis() {
        let secs = unix_to_timestamp(1_700_000_000.0).unwrap();
        let millis = unix_to_timestamp(1_700_000_000_000.0).unwrap();
        assert_eq!(secs, millis);
        let frac = unix_to_timestamp(1_700_000_000.5).unwrap();
        assert_eq!(frac.timestamp_subsec_millis(), 500);
        assert!(unix_to_timestamp(f64::NAN).is_none());
    }

    #[test]
    fn test_coerce_by_column_type() {
        assert_eq!(
            coerce_value(&col("ok", ColumnType::Boolean), &json!(true)).unwrap(),
            CellValue::Bool(true)
        );
        assert_eq!(
            coerce_value(&col("n", ColumnType::Double), &json!(3)).unwrap(),
            CellValue::Number(3.0)
        );
        assert_eq!(
            coerce_value(&col("d", ColumnType::Date), &json!("2024-03-01")).unwrap(),
            CellValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
        );
        assert_eq!(
            coerce_value(&col("j", ColumnType::Json), &json!({"a": [1, 2]})).unwrap(),
            CellValue::Json(r#"{"a":[1,2]}"#.to_string())
        );
        assert_eq!(
            coerce_value(&col("s", ColumnType::Varchar), &json!(42)).unwrap(),
            CellValue::String("42".to_string())
        );
        assert_eq!(
            coerce_value(&col("s", ColumnType::Varchar), &Value::Null).unwrap(),
            CellValue::Null
        );
    }

    #[test]
    fn test_coerce_rejects_mismatches() {
        let err = coerce_value(&col("ok", ColumnType::Boolean), &json!("yes")).unwrap_err();
        assert!(matches!(err, CoercionError::Unsupported { found: "string", .. }));

        let err = coerce_value(&col("at", ColumnType::Timestamp), &json!("soon")).unwrap_err();
        assert!(matches!(err, CoercionError::UnparsableTimestamp { .. }));
    }

    #[test]
    fn test_timestamp_column_accepts_dates_and_numbers() {
        let c = col("at", ColumnType::Timestamp);
        let midnight = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            coerce_value(&c, &json!("2024-03-01")).unwrap(),
            CellValue::Timestamp(midnight)
        );
        assert_eq!(
            coerce_value(&c, &json!(midnight.timestamp())).unwrap(),
            CellValue::Timestamp(midnight)
        );
    }

    #[test]
    fn test_resolve_event_time() {
        let fallback = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let parsed = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();

        assert_eq!(
            resolve_event_time("_ts", None, fallback).unwrap(),
            CellValue::Timestamp(fallback)
        );
        assert_eq!(
            resolve_event_time("_ts", Some(&json!(true)), fallback).unwrap(),
            CellValue::Timestamp(fallback)
        );
        assert_eq!(
            resolve_event_time("_ts", Some(&json!("2024-03-01T12:30:00Z")), fallback).unwrap(),
            CellValue::Timestamp(parsed)
        );
        assert_eq!(
            resolve_event_time("_ts", Some(&json!(parsed.timestamp_millis())), fallback).unwrap(),
            CellValue::Timestamp(parsed)
        );
        assert!(resolve_event_time("_ts", Some(&json!("not a time")), fallback).is_err());
    }
}
