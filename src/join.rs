//! Left-outer joins against reference tables and post-join reconciliation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::metrics::JoinMetrics;
use crate::policy::{fill_missing, Sentinel};
use crate::table::{KeyValue, Table, Value};

fn default_true() -> bool {
    true
}

/// A reference table joined onto the entity table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub table: String,
    pub left_on: String,
    pub right_on: String,
    /// Drop exact duplicate rows of the reference table before joining
    #[serde(default = "default_true")]
    pub dedup: bool,
}

/// Sentinel for a column that may be left missing by an unmatched join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRule {
    pub column: String,
    pub sentinel: Sentinel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinStats {
    pub reference: String,
    pub matched: usize,
    pub unmatched: usize,
    pub output_rows: usize,
}

/// Left-outer join of `left` with `right` on `left.left_on == right.right_on`.
///
/// Every left row appears at least once; a left row matching several right
/// rows appears once per match. When both key columns share a name the key
/// is kept once. Any other column present on both sides is suffixed `_x`
/// (left) and `_y` (right). Missing keys never match.
pub fn left_join(left: &Table, right: &Table, left_on: &str, right_on: &str) -> Result<(Table, JoinStats)> {
    let lk = left.require_column(left_on)?;
    let rk = right.require_column(right_on)?;
    let shared_key = left_on == right_on;

    let right_cols: Vec<usize> = (0..right.columns().len())
        .filter(|&i| !(shared_key && i == rk))
        .collect();
    let left_names: HashSet<&str> = left.columns().iter().map(String::as_str).collect();
    let right_names: HashSet<&str> = right_cols.iter().map(|&i| right.columns()[i].as_str()).collect();

    let mut columns: Vec<String> = left
        .columns()
        .iter()
        .map(|c| {
            if right_names.contains(c.as_str()) {
                format!("{c}_x")
            } else {
                c.clone()
            }
        })
        .collect();
    columns.extend(right_cols.iter().map(|&i| {
        let c = &right.columns()[i];
        if left_names.contains(c.as_str()) {
            format!("{c}_y")
        } else {
            c.clone()
        }
    }));

    let mut seen: HashSet<&str> = HashSet::with_capacity(columns.len());
    if let Some(clash) = columns.iter().find(|c| !seen.insert(c.as_str())) {
        return Err(PipelineError::Config(format!(
            "joining '{}' onto '{}' produces column '{}' twice; rename the overlapping columns",
            right.name(),
            left.name(),
            clash
        )));
    }

    let mut index: HashMap<KeyValue, Vec<usize>> = HashMap::new();
    for (i, row) in right.rows().iter().enumerate() {
        if let Some(key) = row[rk].key() {
            index.entry(key).or_default().push(i);
        }
    }

    let mut out = Table::new(left.name(), columns);
    let (mut matched, mut unmatched) = (0, 0);
    for row in left.rows() {
        let hits = row[lk].key().and_then(|k| index.get(&k));
        match hits {
            Some(hits) => {
                matched += 1;
                for &r in hits {
                    let mut joined = row.clone();
                    joined.extend(right_cols.iter().map(|&i| right.rows()[r][i].clone()));
                    out.push_row(joined);
                }
            }
            None => {
                unmatched += 1;
                let mut joined = row.clone();
                joined.extend(std::iter::repeat(Value::Missing).take(right_cols.len()));
                out.push_row(joined);
            }
        }
    }

    let stats = JoinStats {
        reference: right.name().to_string(),
        matched,
        unmatched,
        output_rows: out.row_count(),
    };
    debug!(?stats, "left join complete");
    JoinMetrics::record_join(right.name(), matched, unmatched);
    Ok((out, stats))
}

/// Fill join-introduced gaps with each rule's sentinel. Returns the number
/// of cells written.
pub fn reconcile(table: &mut Table, rules: &[ReconcileRule]) -> Result<usize> {
    let mut total = 0;
    for rule in rules {
        let idx = table.require_column(&rule.column)?;
        let filled = fill_missing(table, idx, &Value::from(&rule.sentinel));
        if filled > 0 {
            info!(column = %rule.column, filled, "sentinel applied to unmatched rows");
        }
        total += filled;
    }
    JoinMetrics::record_reconciled(total);
    Ok(total)
}
