//! Missing-value policy engine.
//!
//! Each [`ColumnPolicy`] names a column and a [`FillStrategy`]. Policies run
//! in declared order after coercion and only ever write into missing cells,
//! so running the same policy list twice leaves the table unchanged. The one
//! exception is `drop_sparse`, which removes a whole column; rows are never
//! removed.

pub mod carry;
pub mod structured;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::metrics::PolicyMetrics;
use crate::table::{Table, Value};

/// A literal replacement value as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Sentinel {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl From<&Sentinel> for Value {
    fn from(s: &Sentinel) -> Self {
        match s {
            Sentinel::Integer(i) => Value::Integer(*i),
            Sentinel::Float(f) => Value::Float(*f),
            Sentinel::Text(t) => Value::Text(t.clone()),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum FillStrategy {
    /// Replace missing cells with a fixed value
    Constant { value: Sentinel },
    /// Replace missing cells with the median of the observed values
    Median,
    /// Next observation carried backward within each entity
    CarryBackward { entity: String, sequence: String },
    /// Split a key/value blob column into derived columns
    Extract {
        fields: Vec<String>,
        #[serde(default = "default_true")]
        drop_source: bool,
    },
    /// Drop the column when more than `max_missing_pct` percent of it is missing
    DropSparse { max_missing_pct: f64 },
}

impl FillStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            FillStrategy::Constant { .. } => "constant",
            FillStrategy::Median => "median",
            FillStrategy::CarryBackward { .. } => "carry_backward",
            FillStrategy::Extract { .. } => "extract",
            FillStrategy::DropSparse { .. } => "drop_sparse",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnPolicy {
    pub column: String,
    #[serde(flatten)]
    pub strategy: FillStrategy,
}

impl ColumnPolicy {
    pub fn new(column: impl Into<String>, strategy: FillStrategy) -> Self {
        Self {
            column: column.into(),
            strategy,
        }
    }

    pub fn constant(column: impl Into<String>, value: Sentinel) -> Self {
        Self::new(column, FillStrategy::Constant { value })
    }
}

/// What a single policy application did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyOutcome {
    pub column: String,
    pub strategy: &'static str,
    pub filled: usize,
    /// The column was removed from the table
    pub dropped: bool,
}

/// Median of the numeric values in `values`, ignoring missing and
/// non-numeric cells.
///
/// Returns an integer when no observed value is a float and the median is
/// integral.
pub fn median<'a>(values: impl Iterator<Item = &'a Value>) -> Option<Value> {
    let mut all_integer = true;
    let mut observed: Vec<f64> = values
        .filter_map(|v| {
            if matches!(v, Value::Float(_)) {
                all_integer = false;
            }
            v.as_f64()
        })
        .collect();
    if observed.is_empty() {
        return None;
    }
    observed.sort_by(f64::total_cmp);

    let mid = observed.len() / 2;
    let m = if observed.len() % 2 == 0 {
        (observed[mid - 1] + observed[mid]) / 2.0
    } else {
        observed[mid]
    };

    if all_integer && m.fract() == 0.0 {
        Some(Value::Integer(m as i64))
    } else {
        Some(Value::Float(m))
    }
}

pub(crate) fn fill_missing(table: &mut Table, idx: usize, value: &Value) -> usize {
    let mut filled = 0;
    for row in table.rows_mut() {
        if row[idx].is_missing() {
            row[idx] = value.clone();
            filled += 1;
        }
    }
    filled
}

fn extract_fields(table: &mut Table, column: &str, fields: &[String], drop_source: bool) -> Result<usize> {
    let Some(src) = table.column_index(column) else {
        // Already extracted on an earlier pass
        if fields.iter().all(|f| table.has_column(f)) {
            return Ok(0);
        }
        return Err(PipelineError::ColumnNotFound {
            table: table.name().to_string(),
            column: column.to_string(),
        });
    };

    let mut derived: Vec<Vec<Value>> = vec![Vec::with_capacity(table.row_count()); fields.len()];
    let mut unparsed = 0usize;
    for row in table.rows() {
        let extracted = match &row[src] {
            Value::Missing => vec![None; fields.len()],
            other => {
                let raw = other.to_string();
                let out = structured::extract(&raw, fields);
                if out.iter().all(Option::is_none) {
                    unparsed += 1;
                }
                out
            }
        };
        for (col, v) in derived.iter_mut().zip(extracted) {
            col.push(v.map(Value::Text).unwrap_or(Value::Missing));
        }
    }
    if unparsed > 0 {
        warn!(column, rows = unparsed, "rows yielded no fields from structured column");
    }

    // Only cells that go from missing to present count as filled
    let mut filled = 0;
    for (name, values) in fields.iter().zip(derived) {
        let merged: Vec<Value> = match table.column_index(name) {
            Some(idx) => table
                .column_values(idx)
                .zip(values)
                .map(|(existing, new)| {
                    if existing.is_missing() {
                        filled += usize::from(!new.is_missing());
                        new
                    } else {
                        existing.clone()
                    }
                })
                .collect(),
            None => {
                filled += values.iter().filter(|v| !v.is_missing()).count();
                values
            }
        };
        table.set_column(name, merged);
    }

    if drop_source {
        table.drop_column(column);
    }
    Ok(filled)
}

/// Remove `column` when its missing share exceeds `max_missing_pct`.
/// A column that is already gone was dropped by an earlier pass.
fn drop_sparse(table: &mut Table, column: &str, max_missing_pct: f64) -> bool {
    let Some(profile) = table.missing_profile().into_iter().find(|p| p.column == column) else {
        debug!(column, "column absent, nothing to drop");
        return false;
    };
    if profile.missing_pct <= max_missing_pct {
        return false;
    }
    info!(
        column,
        missing = profile.missing,
        missing_pct = %format!("{:.2}", profile.missing_pct),
        threshold = max_missing_pct,
        "dropping sparse column"
    );
    PolicyMetrics::record_column_dropped(column);
    table.drop_column(column)
}

/// Apply one policy to `table`.
pub fn apply_policy(table: &mut Table, policy: &ColumnPolicy) -> Result<PolicyOutcome> {
    let column = policy.column.as_str();
    let mut dropped = false;
    let filled = match &policy.strategy {
        FillStrategy::Constant { value } => {
            let idx = table.require_column(column)?;
            fill_missing(table, idx, &Value::from(value))
        }
        FillStrategy::Median => {
            let idx = table.require_column(column)?;
            let observed = median(table.column_values(idx));
            match observed {
                Some(m) => {
                    debug!(column, median = %m, "median computed");
                    fill_missing(table, idx, &m)
                }
                None => {
                    warn!(column, "no observed values, median fill skipped");
                    0
                }
            }
        }
        FillStrategy::CarryBackward { entity, sequence } => {
            carry::carry_backward(table, column, entity, sequence)?
        }
        FillStrategy::Extract { fields, drop_source } => {
            extract_fields(table, column, fields, *drop_source)?
        }
        FillStrategy::DropSparse { max_missing_pct } => {
            dropped = drop_sparse(table, column, *max_missing_pct);
            0
        }
    };

    PolicyMetrics::record_fill(policy.strategy.name(), filled);
    Ok(PolicyOutcome {
        column: policy.column.clone(),
        strategy: policy.strategy.name(),
        filled,
        dropped,
    })
}

/// Apply `policies` in order.
pub fn apply_all(table: &mut Table, policies: &[ColumnPolicy]) -> Result<Vec<PolicyOutcome>> {
    let mut outcomes = Vec::with_capacity(policies.len());
    for policy in policies {
        let outcome = apply_policy(table, policy)?;
        info!(
            table = table.name(),
            column = %outcome.column,
            strategy = outcome.strategy,
            filled = outcome.filled,
            "policy applied"
        );
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn students() -> Table {
        Table::from_rows(
            "students",
            &["uuid", "job_id", "num_course_taken", "contact_info"],
            vec![
                vec![
                    Value::Integer(1),
                    Value::Float(3.0),
                    Value::Float(4.0),
                    "{'mailing_address': '1 Elm St', 'email': 'a@x.com'}".into(),
                ],
                vec![
                    Value::Integer(2),
                    Value::Missing,
                    Value::Missing,
                    "{'mailing_address': '2 Oak St', 'email': 'b@x.com'}".into(),
                ],
                vec![Value::Integer(3), Value::Float(7.0), Value::Float(10.0), "garbage".into()],
                vec![Value::Integer(4), Value::Float(1.0), Value::Float(5.0), Value::Missing],
            ],
        )
    }

    #[test]
    fn test_median_odd_even_and_integer_preservation() {
        let odd = [Value::Integer(5), Value::Integer(1), Value::Integer(3)];
        assert_eq!(median(odd.iter()), Some(Value::Integer(3)));

        let even = [Value::Integer(1), Value::Integer(4), Value::Missing];
        assert_eq!(median(even.iter()), Some(Value::Float(2.5)));

        let floats = [Value::Float(4.0), Value::Float(10.0), Value::Float(5.0)];
        assert_eq!(median(floats.iter()), Some(Value::Float(5.0)));

        assert_eq!(median([Value::Missing].iter()), None);
    }

    #[test]
    fn test_median_ignores_stray_text_in_integer_column() {
        let values = [Value::Integer(6), Value::Text("n/a".into()), Value::Integer(2), Value::Integer(4)];
        assert_eq!(median(values.iter()), Some(Value::Integer(4)));

        let mixed = [Value::Integer(6), Value::Float(2.0), Value::Integer(4)];
        assert_eq!(median(mixed.iter()), Some(Value::Float(4.0)));
    }

    #[test]
    fn test_median_is_order_independent() {
        let a = [Value::Float(0.1), Value::Float(0.7), Value::Float(0.3), Value::Float(0.9)];
        let b = [Value::Float(0.9), Value::Float(0.3), Value::Float(0.1), Value::Float(0.7)];
        let (ma, mb) = (median(a.iter()).unwrap(), median(b.iter()).unwrap());
        match (ma, mb) {
            (Value::Float(x), Value::Float(y)) => assert_eq!(x.to_bits(), y.to_bits()),
            other => panic!("unexpected medians {other:?}"),
        }
    }

    #[test]
    fn test_constant_and_median_fill() {
        let mut table = students();
        let policies = vec![
            ColumnPolicy::constant("job_id", Sentinel::Integer(0)),
            ColumnPolicy::new("num_course_taken", FillStrategy::Median),
        ];
        let outcomes = apply_all(&mut table, &policies).unwrap();

        assert_eq!(outcomes[0].filled, 1);
        assert_eq!(table.cell(1, "job_id"), Some(&Value::Integer(0)));
        assert_eq!(table.cell(1, "num_course_taken"), Some(&Value::Float(5.0)));
    }

    #[test]
    fn test_extract_replaces_source_column() {
        let mut table = students();
        let policy = ColumnPolicy::new(
            "contact_info",
            FillStrategy::Extract {
                fields: vec!["mailing_address".into(), "email".into()],
                drop_source: true,
            },
        );
        let outcome = apply_policy(&mut table, &policy).unwrap();

        assert_eq!(outcome.filled, 4);
        assert!(!table.has_column("contact_info"));
        assert_eq!(table.cell(1, "email"), Some(&"b@x.com".into()));
        assert_eq!(table.cell(2, "mailing_address"), Some(&Value::Missing));
        assert_eq!(table.cell(3, "email"), Some(&Value::Missing));

        // A second pass finds the derived columns and does nothing
        let before = table.clone();
        assert_eq!(apply_policy(&mut table, &policy).unwrap().filled, 0);
        assert_eq!(table, before);
    }

    #[test]
    fn test_extract_counts_only_cells_it_writes() {
        let mut table = students();
        let policy = ColumnPolicy::new(
            "contact_info",
            FillStrategy::Extract {
                fields: vec!["mailing_address".into(), "email".into()],
                drop_source: false,
            },
        );
        assert_eq!(apply_policy(&mut table, &policy).unwrap().filled, 4);
        assert_eq!(apply_policy(&mut table, &policy).unwrap().filled, 0);

        let email = table.column_index("email").unwrap();
        table.rows_mut()[0][email] = Value::Missing;
        assert_eq!(apply_policy(&mut table, &policy).unwrap().filled, 1);
        assert_eq!(table.cell(0, "email"), Some(&"a@x.com".into()));
    }

    #[test]
    fn test_drop_sparse_removes_column_over_threshold() {
        let mut table = students();
        // job_id is 25% missing
        let keep = ColumnPolicy::new("job_id", FillStrategy::DropSparse { max_missing_pct: 25.0 });
        let outcome = apply_policy(&mut table, &keep).unwrap();
        assert!(!outcome.dropped);
        assert!(table.has_column("job_id"));

        let drop = ColumnPolicy::new("job_id", FillStrategy::DropSparse { max_missing_pct: 20.0 });
        let outcome = apply_policy(&mut table, &drop).unwrap();
        assert!(outcome.dropped);
        assert_eq!(outcome.strategy, "drop_sparse");
        assert_eq!(outcome.filled, 0);
        assert!(!table.has_column("job_id"));
        assert_eq!(table.row_count(), 4);

        // Nothing left to drop on a second pass
        let before = table.clone();
        assert!(!apply_policy(&mut table, &drop).unwrap().dropped);
        assert_eq!(table, before);
    }

    #[test]
    fn test_policies_are_idempotent() {
        let policies = vec![
            ColumnPolicy::constant("job_id", Sentinel::Integer(0)),
            ColumnPolicy::new("num_course_taken", FillStrategy::Median),
            ColumnPolicy::new(
                "contact_info",
                FillStrategy::Extract {
                    fields: vec!["mailing_address".into(), "email".into()],
                    drop_source: false,
                },
            ),
            ColumnPolicy::constant("email", Sentinel::Text("Unknown".into())),
        ];
        let mut once = students();
        apply_all(&mut once, &policies).unwrap();
        let mut twice = once.clone();
        apply_all(&mut twice, &policies).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once.cell(2, "email"), Some(&"Unknown".into()));
    }

    #[test]
    fn test_unknown_column_is_reported() {
        let mut table = students();
        let err = apply_policy(&mut table, &ColumnPolicy::new("dob", FillStrategy::Median)).unwrap_err();
        assert!(matches!(err, PipelineError::ColumnNotFound { ref column, .. } if column == "dob"));
    }

    #[test]
    fn test_policy_deserializes_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            policies: Vec<ColumnPolicy>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[policies]]
            column = "job_id"
            strategy = "constant"
            value = 0

            [[policies]]
            column = "UndergradMajor"
            strategy = "carry_backward"
            entity = "RespondentID"
            sequence = "Year"

            [[policies]]
            column = "contact_info"
            strategy = "extract"
            fields = ["mailing_address", "email"]

            [[policies]]
            column = "ConvertedSalary"
            strategy = "drop_sparse"
            max_missing_pct = 50.0
            "#,
        )
        .unwrap();

        assert_eq!(doc.policies[0], ColumnPolicy::constant("job_id", Sentinel::Integer(0)));
        assert!(matches!(doc.policies[1].strategy, FillStrategy::CarryBackward { .. }));
        assert!(matches!(doc.policies[2].strategy, FillStrategy::Extract { drop_source: true, .. }));
        assert_eq!(doc.policies[3].strategy, FillStrategy::DropSparse { max_missing_pct: 50.0 });
    }
}
