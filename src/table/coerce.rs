//! Column type coercion.
//!
//! Upstream snapshots store most fields as text. Coercion turns declared
//! columns into typed values; anything that does not parse is replaced with
//! [`Value::Missing`] and counted, never raised.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::debug;

use super::{Table, Value};
use crate::error::Result;

/// Semantic type declared for a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Date,
    Text,
}

/// A cell that could not be coerced to its declared type.
///
/// Never leaves this module as an error: [`coerce_table`] downgrades it to
/// a missing cell and reports the count.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("cannot read {raw:?} as {expected:?}")]
pub struct MalformedValue {
    pub raw: String,
    pub expected: ColumnType,
}

/// Per-column count of malformed cells found during one coercion pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CoercionReport {
    pub malformed: BTreeMap<String, usize>,
}

impl CoercionReport {
    pub fn total(&self) -> usize {
        self.malformed.values().sum()
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

fn parse_number(raw: &str, expected: ColumnType) -> std::result::Result<f64, MalformedValue> {
    raw.parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .ok_or_else(|| MalformedValue {
            raw: raw.to_string(),
            expected,
        })
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

/// Coerce a single value to `ty`.
pub fn coerce_value(value: &Value, ty: ColumnType) -> std::result::Result<Value, MalformedValue> {
    let malformed = |raw: String| MalformedValue { raw, expected: ty };

    match (value, ty) {
        (Value::Missing, _) => Ok(Value::Missing),
        (Value::Text(s), _) if s.trim().is_empty() => Ok(Value::Missing),

        (Value::Integer(i), ColumnType::Integer) => Ok(Value::Integer(*i)),
        (Value::Float(f), ColumnType::Integer) => match Value::Float(*f).key() {
            Some(super::KeyValue::Integer(i)) => Ok(Value::Integer(i)),
            _ => Err(malformed(f.to_string())),
        },
        (Value::Text(s), ColumnType::Integer) => {
            let raw = s.trim();
            if let Ok(i) = raw.parse::<i64>() {
                return Ok(Value::Integer(i));
            }
            let f = parse_number(raw, ty)?;
            coerce_value(&Value::Float(f), ty).map_err(|_| malformed(raw.to_string()))
        }

        (Value::Integer(i), ColumnType::Float) => Ok(Value::Float(*i as f64)),
        (Value::Float(f), ColumnType::Float) => Ok(Value::Float(*f)),
        (Value::Text(s), ColumnType::Float) => parse_number(s.trim(), ty).map(Value::Float),

        (Value::Date(d), ColumnType::Date) => Ok(Value::Date(*d)),
        (Value::Text(s), ColumnType::Date) => {
            let raw = s.trim();
            parse_date(raw)
                .map(Value::Date)
                .ok_or_else(|| malformed(raw.to_string()))
        }
        (other, ColumnType::Date) => Err(malformed(other.to_string())),

        (Value::Text(s), ColumnType::Text) => Ok(Value::Text(s.clone())),
        (other, ColumnType::Text) => Ok(Value::Text(other.to_string())),

        (Value::Date(d), _) => Err(malformed(d.to_string())),
    }
}

/// Coerce the declared columns of `table` in place.
///
/// Fails only if a declared column does not exist.
pub fn coerce_table(table: &mut Table, declared: &BTreeMap<String, ColumnType>) -> Result<CoercionReport> {
    let mut report = CoercionReport::default();

    for (column, ty) in declared {
        let idx = table.require_column(column)?;
        let mut bad = 0usize;
        for row in table.rows_mut() {
            match coerce_value(&row[idx], *ty) {
                Ok(v) => row[idx] = v,
                Err(e) => {
                    debug!(column = %column, error = %e, "malformed value replaced with missing");
                    row[idx] = Value::Missing;
                    bad += 1;
                }
            }
        }
        if bad > 0 {
            report.malformed.insert(column.clone(), bad);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_coercion() {
        assert_eq!(coerce_value(&"42".into(), ColumnType::Integer), Ok(Value::Integer(42)));
        assert_eq!(coerce_value(&" 7.0 ".into(), ColumnType::Integer), Ok(Value::Integer(7)));
        assert_eq!(coerce_value(&Value::Float(3.0), ColumnType::Integer), Ok(Value::Integer(3)));
        assert!(coerce_value(&"N/A".into(), ColumnType::Integer).is_err());
        assert!(coerce_value(&"2.5".into(), ColumnType::Integer).is_err());
        assert_eq!(coerce_value(&"".into(), ColumnType::Integer), Ok(Value::Missing));
    }

    #[test]
    fn test_float_coercion_rejects_non_finite() {
        assert_eq!(coerce_value(&"4.5".into(), ColumnType::Float), Ok(Value::Float(4.5)));
        assert_eq!(coerce_value(&Value::Integer(2), ColumnType::Float), Ok(Value::Float(2.0)));
        assert!(coerce_value(&"inf".into(), ColumnType::Float).is_err());
        assert!(coerce_value(&"NaN".into(), ColumnType::Float).is_err());
        assert!(coerce_value(&"ten".into(), ColumnType::Float).is_err());
    }

    #[test]
    fn test_date_coercion_formats() {
        let expected = Value::Date(NaiveDate::from_ymd_opt(1943, 7, 3).unwrap());
        for raw in ["1943-07-03", "1943/07/03", "07/03/1943", "1943-07-03 00:00:00", "1943-07-03T10:00:00Z"] {
            assert_eq!(coerce_value(&raw.into(), ColumnType::Date), Ok(expected.clone()), "{raw}");
        }
        assert!(coerce_value(&"not a date".into(), ColumnType::Date).is_err());
        assert!(coerce_value(&Value::Integer(19430703), ColumnType::Date).is_err());
    }

    #[test]
    fn test_text_coercion_renders_numbers() {
        assert_eq!(coerce_value(&Value::Integer(5), ColumnType::Text), Ok("5".into()));
        assert_eq!(coerce_value(&"  ".into(), ColumnType::Text), Ok(Value::Missing));
    }

    #[test]
    fn test_coerce_table_reports_malformed_cells() {
        let mut table = Table::from_rows(
            "students",
            &["uuid", "job_id"],
            vec![
                vec![Value::Integer(1), "3".into()],
                vec![Value::Integer(2), "N/A".into()],
                vec![Value::Integer(3), Value::Missing],
            ],
        );
        let declared = BTreeMap::from([("job_id".to_string(), ColumnType::Float)]);

        let report = coerce_table(&mut table, &declared).unwrap();
        assert_eq!(report.total(), 1);
        assert_eq!(report.malformed.get("job_id"), Some(&1));
        assert_eq!(table.cell(0, "job_id"), Some(&Value::Float(3.0)));
        assert_eq!(table.cell(1, "job_id"), Some(&Value::Missing));
    }

    #[test]
    fn test_coerce_table_unknown_column_is_an_error() {
        let mut table = Table::from_rows("students", &["uuid"], vec![]);
        let declared = BTreeMap::from([("dob".to_string(), ColumnType::Date)]);
        assert!(coerce_table(&mut table, &declared).is_err());
    }
}
