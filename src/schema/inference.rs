//! Type Inference
//!
//! Chooses the narrowest column type that accommodates every sampled
//! value of a field.
//!
//! ## Ladder
//!
//! ```text
//! boolean   (only booleans)
//! double    (only numbers)
//! date      (only calendar-date strings)
//! timestamp (date-time strings, optionally mixed with dates)
//! varchar   (any other strings)
//! json      (arrays, objects, or incompatible primitive kinds)
//! ```
//!
//! Nulls never influence the result. A field with no non-null samples
//! is typed `json` so later values of any kind remain storable.

use crate::schema::coerce::{parse_date, parse_timestamp};
use crate::schema::types::{is_system_column, same_name, ColumnType};
use serde_json::{Map, Value};

/// What a single sample says about its field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleKind {
    Boolean,
    Number,
    DateString,
    TimestampString,
    PlainString,
    Complex,
}

fn classify(value: &Value) -> Option<SampleKind> {
    match value {
        Value::Null => None,
        Value::Bool(_) => Some(SampleKind::Boolean),
        Value::Number(_) => Some(SampleKind::Number),
        Value::String(s) => Some(if parse_date(s).is_some() {
            SampleKind::DateString
        } else if parse_timestamp(s).is_some() {
            SampleKind::TimestampString
        } else {
            SampleKind::PlainString
        }),
        Value::Array(_) | Value::Object(_) => Some(SampleKind::Complex),
    }
}

/// Infer a column type from sample values
pub fn infer_column_type<'a, I>(samples: I) -> ColumnType
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut has_boolean = false;
    let mut has_number = false;
    let mut has_date = false;
    let mut has_timestamp = false;
    let mut has_plain = false;

    for sample in samples {
        match classify(sample) {
            None => {}
            Some(SampleKind::Complex) => return ColumnType::Json,
            Some(SampleKind::Boolean) => has_boolean = true,
            Some(SampleKind::Number) => has_number = true,
            Some(SampleKind::DateString) => has_date = true,
            Some(SampleKind::TimestampString) => has_timestamp = true,
            Some(SampleKind::PlainString) => has_plain = true,
        }
    }

    let has_string = has_date || has_timestamp || has_plain;
    let families = [has_boolean, has_number, has_string]
        .iter()
        .filter(|present| **present)
        .count();

    match families {
        0 => ColumnType::Json,
        1 if has_boolean => ColumnType::Boolean,
        1 if has_number => ColumnType::Double,
        1 if has_plain => ColumnType::Varchar,
        1 if has_timestamp => ColumnType::Timestamp,
        1 => ColumnType::Date,
        _ => ColumnType::Json,
    }
}

/// Non-system fields seen across a set of payloads, with their samples
///
/// Fields keep the order and spelling in which they were first seen;
/// names differing only in case are one field.
#[derive(Debug, Default)]
pub struct FieldSamples<'a> {
    fields: Vec<(&'a str, Vec<&'a Value>)>,
}

impl<'a> FieldSamples<'a> {
    pub fn collect(payloads: &'a [Map<String, Value>]) -> Self {
        let mut fields: Vec<(&'a str, Vec<&'a Value>)> = Vec::new();
        for payload in payloads {
            for (name, value) in payload {
                if is_system_column(name) {
                    continue;
                }
                match fields.iter_mut().find(|(n, _)| same_name(n, name)) {
                    Some((_, samples)) => samples.push(value),
                    None => fields.push((name.as_str(), vec![value])),
                }
            }
        }
        FieldSamples { fields }
    }

    pub fn names(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.fields.iter().map(|(n, _)| *n)
    }

    pub fn infer(&self, name: &str) -> ColumnType {
        self.fields
            .iter()
            .find(|(n, _)| same_name(n, name))
            .map(|(_, samples)| infer_column_type(samples.iter().copied()))
            .unwrap_or(ColumnType::Json)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn infer(values: &[Value]) -> ColumnType {
        infer_column_type(values.iter())
    }

    #[test]
    fn test_single_family_types() {
        assert_eq!(infer(&[json!(true), json!(false)]), ColumnType::Boolean);
        assert_eq!(infer(&[json!(1), json!(2.5), json!(-3)]), ColumnType::Double);
        assert_eq!(infer(&[json!("a"), json!("b")]), ColumnType::Varchar);
        assert_eq!(infer(&[json!("2024-01-01"), json!("02/03/2024")]), ColumnType::Date);
        assert_eq!(
            infer(&[json!("2024-01-01T10:00:00Z"), json!("2024-01-02 11:00:00")]),
            ColumnType::Timestamp
        );
    }

    #[test]
    fn test_promotion_within_strings() {
        assert_eq!(
            infer(&[json!("2024-01-01"), json!("2024-01-02T10:00:00Z")]),
            ColumnType::Timestamp
        );
        assert_eq!(
            infer(&[json!("2024-01-01"), json!("2024-01-02T10:00:00Z"), json!("n/a")]),
            ColumnType::Varchar
        );
    }

    #[test]
    fn test_complex_and_mixed_go_json() {
        assert_eq!(infer(&[json!(1), json!([1, 2])]), ColumnType::Json);
        assert_eq!(infer(&[json!({"k": 1})]), ColumnType::Json);
        assert_eq!(infer(&[json!(true), json!(1)]), ColumnType::Json);
        assert_eq!(infer(&[json!("x"), json!(1)]), ColumnType::Json);
    }

    #[test]
    fn test_nulls_are_ignored() {
        assert_eq!(infer(&[Value::Null, json!(1), Value::Null]), ColumnType::Double);
        assert_eq!(infer(&[Value::Null, json!(true)]), ColumnType::Boolean);
        assert_eq!(infer(&[Value::Null]), ColumnType::Json);
        assert_eq!(infer(&[]), ColumnType::Json);
    }

    #[test]
    fn test_samples_accommodate_every_value() {
        // Any single-family sample set must infer to a type that accepts each sample alone
        let cases = vec![
            vec![json!(1), json!(2)],
            vec![json!("2024-05-05"), json!("2024-05-06 01:02:03")],
            vec![json!("x"), json!("2024-05-05")],
            vec![json!(false), Value::Null],
        ];
        for samples in cases {
            let combined = infer(&samples);
            for s in samples.iter().filter(|s| !s.is_null()) {
                let alone = infer(std::slice::from_ref(s));
                assert!(
                    rank(combined) >= rank(alone),
                    "{:?} narrower than {:?} for {:?}",
                    combined,
                    alone,
                    s
                );
            }
        }
    }

    fn rank(t: ColumnType) -> u8 {
        match t {
            ColumnType::Boolean | ColumnType::Double | ColumnType::Date => 0,
            ColumnType::Timestamp => 1,
            ColumnType::Varchar => 2,
            ColumnType::Json => 3,
        }
    }

    #[test]
    fn test_field_samples_first_seen_order() {
        let payloads: Vec<Map<String, Value>> = vec![
            json!({"_id": "a", "zeta": 1, "alpha": "x"}),
            json!({"beta": true, "zeta": 2.5, "_ts": 1}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();

        let samples = FieldSamples::collect(&payloads);
        let names: Vec<&str> = samples.names().collect();
        assert_eq!(names, vec!["zeta", "alpha", "beta"]);
        assert_eq!(samples.infer("zeta"), ColumnType::Double);
        assert_eq!(samples.infer("beta"), ColumnType::Boolean);
    }

    #[test]
    fn test_field_samples_merge_case_variants() {
        let payloads: Vec<Map<String, Value>> = vec![
            json!({"Score": 1, "_ID": "x"}),
            json!({"score": 2.5}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();

        let samples = FieldSamples::collect(&payloads);
        let names: Vec<&str> = samples.names().collect();
        assert_eq!(names, vec!["Score"]);
        assert_eq!(samples.infer("score"), ColumnType::Double);
    }
}
