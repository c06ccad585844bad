//! In-memory tables.
//!
//! A [`Table`] is a named, ordered list of columns and rows of [`Value`]
//! cells. Every stage of the pipeline takes a table and hands back a new or
//! mutated one; nothing here knows about files or databases.

pub mod coerce;

use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use crate::error::{PipelineError, Result};

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Missing,
    Integer(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
}

/// Hashable identity of a non-missing value, used for join keys, grouping
/// and duplicate detection. Integral floats collapse onto integers so that
/// `3` and `3.0` address the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Integer(i64),
    FloatBits(u64),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Missing)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn key(&self) -> Option<KeyValue> {
        match self {
            Value::Missing => None,
            Value::Integer(i) => Some(KeyValue::Integer(*i)),
            Value::Float(f) => {
                if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    Some(KeyValue::Integer(*f as i64))
                } else {
                    // -0.0 is integral, so only non-zero bit patterns reach here
                    Some(KeyValue::FloatBits(f.to_bits()))
                }
            }
            Value::Text(s) => Some(KeyValue::Text(s.clone())),
            Value::Date(d) => Some(KeyValue::Date(*d)),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Integer(_) | Value::Float(_) => 0,
            Value::Date(_) => 1,
            Value::Text(_) => 2,
            Value::Missing => 3,
        }
    }

    /// Total order used for sorting: numbers, then dates, then text, with
    /// missing values last.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            _ => match (self.as_f64(), other.as_f64()) {
                (Some(a), Some(b)) => a.total_cmp(&b),
                _ => self.rank().cmp(&other.rank()),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Missing => Ok(()),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Float(x) if x.fract() == 0.0 && x.abs() < 1e15 => write!(f, "{x:.1}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Missing-value statistics for one column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnProfile {
    pub column: String,
    pub missing: usize,
    pub missing_pct: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Build a table from literal rows. Short rows are padded with
    /// [`Value::Missing`], long rows are truncated.
    pub fn from_rows(name: impl Into<String>, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        let mut table = Self::new(name, columns.iter().map(|c| c.to_string()).collect());
        for row in rows {
            table.push_row(row);
        }
        table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [Vec<Value>] {
        &mut self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Missing);
        self.rows.push(row);
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn require_column(&self, column: &str) -> Result<usize> {
        self.column_index(column)
            .ok_or_else(|| PipelineError::ColumnNotFound {
                table: self.name.clone(),
                column: column.to_string(),
            })
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.column_index(column).is_some()
    }

    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().map(move |row| &row[idx])
    }

    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Append a column, or overwrite it in place if the name already exists.
    pub fn set_column(&mut self, column: &str, values: Vec<Value>) {
        debug_assert_eq!(values.len(), self.rows.len());
        match self.column_index(column) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(column.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
    }

    /// Remove a column. Returns false if it was not present.
    pub fn drop_column(&mut self, column: &str) -> bool {
        let Some(idx) = self.column_index(column) else {
            return false;
        };
        self.columns.remove(idx);
        for row in &mut self.rows {
            row.remove(idx);
        }
        true
    }

    /// Drop exact duplicate rows, keeping the first occurrence in input order.
    /// Returns the number of rows removed.
    pub fn dedup(&mut self) -> usize {
        let before = self.rows.len();
        let mut seen: HashSet<Vec<Option<KeyValue>>> = HashSet::with_capacity(before);
        self.rows
            .retain(|row| seen.insert(row.iter().map(Value::key).collect()));
        before - self.rows.len()
    }

    pub fn missing_cells(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .filter(|v| v.is_missing())
            .count()
    }

    /// Columns holding at least one missing cell, in column order
    pub fn columns_with_missing(&self) -> Vec<String> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(idx, _)| self.column_values(*idx).any(Value::is_missing))
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn missing_profile(&self) -> Vec<ColumnProfile> {
        let total = self.rows.len();
        self.columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let missing = self.column_values(idx).filter(|v| v.is_missing()).count();
                let missing_pct = if total == 0 {
                    0.0
                } else {
                    missing as f64 / total as f64 * 100.0
                };
                ColumnProfile {
                    column: name.clone(),
                    missing,
                    missing_pct,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jobs() -> Table {
        Table::from_rows(
            "jobs",
            &["job_id", "job_category", "avg_salary"],
            vec![
                vec![Value::Integer(1), "analytics".into(), Value::Integer(86000)],
                vec![Value::Integer(2), "engineer".into(), Value::Integer(101000)],
                vec![Value::Integer(1), "analytics".into(), Value::Integer(86000)],
                vec![Value::Integer(3), Value::Missing, Value::Missing],
            ],
        )
    }

    #[test]
    fn test_integral_float_keys_match_integers() {
        assert_eq!(Value::Float(3.0).key(), Value::Integer(3).key());
        assert_ne!(Value::Float(3.5).key(), Value::Integer(3).key());
        assert_eq!(Value::Missing.key(), None);
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let mut table = jobs();
        assert_eq!(table.dedup(), 1);
        assert_eq!(table.row_count(), 3);
        assert_eq!(table.cell(2, "job_id"), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_missing_profile_and_columns() {
        let table = jobs();
        assert_eq!(table.missing_cells(), 2);
        assert_eq!(table.columns_with_missing(), vec!["job_category", "avg_salary"]);

        let profile = table.missing_profile();
        assert_eq!(profile[0].missing, 0);
        assert_eq!(profile[1].missing, 1);
        assert!((profile[1].missing_pct - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_set_and_drop_column() {
        let mut table = jobs();
        table.set_column("flag", vec![Value::Integer(0); 4]);
        assert_eq!(table.columns().last().map(String::as_str), Some("flag"));

        assert!(table.drop_column("job_category"));
        assert!(!table.drop_column("job_category"));
        assert_eq!(table.columns(), &["job_id", "avg_salary", "flag"]);
        assert_eq!(table.rows()[0].len(), 3);
    }

    #[test]
    fn test_sort_order_puts_missing_last() {
        let mut values = vec![Value::Missing, Value::Float(2.5), Value::Integer(1), "a".into()];
        values.sort_by(|a, b| a.sort_cmp(b));
        assert_eq!(
            values,
            vec![Value::Integer(1), Value::Float(2.5), "a".into(), Value::Missing]
        );
    }

    #[test]
    fn test_display_matches_export_format() {
        assert_eq!(Value::Float(4.0).to_string(), "4.0");
        assert_eq!(Value::Float(4.25).to_string(), "4.25");
        assert_eq!(Value::Missing.to_string(), "");
        let d = NaiveDate::from_ymd_opt(1943, 7, 3).unwrap();
        assert_eq!(Value::Date(d).to_string(), "1943-07-03");
    }
}
