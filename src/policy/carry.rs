use crate::error::Result;
use crate::table::{KeyValue, Table, Value};

/// Next-observation-carried-backward fill of `column`, grouped by `entity`
/// and ordered by `sequence`.
///
/// Rows are visited in (entity, sequence) order using a stable sort, so
/// equal sequence keys keep their input order. The table's physical row
/// order is not changed. Returns the number of cells filled.
pub fn carry_backward(table: &mut Table, column: &str, entity: &str, sequence: &str) -> Result<usize> {
    let col = table.require_column(column)?;
    let ent = table.require_column(entity)?;
    let seq = table.require_column(sequence)?;

    let mut order: Vec<usize> = (0..table.row_count()).collect();
    {
        let rows = table.rows();
        order.sort_by(|&a, &b| {
            rows[a][ent]
                .sort_cmp(&rows[b][ent])
                .then_with(|| rows[a][seq].sort_cmp(&rows[b][seq]))
        });
    }

    let rows = table.rows_mut();
    let mut filled = 0;
    let mut carry: Option<(KeyValue, Value)> = None;

    for &i in order.iter().rev() {
        let Some(key) = rows[i][ent].key() else {
            carry = None;
            continue;
        };
        if !matches!(&carry, Some((k, _)) if *k == key) {
            carry = None;
        }

        if rows[i][col].is_missing() {
            if let Some((_, v)) = &carry {
                rows[i][col] = v.clone();
                filled += 1;
            }
        } else {
            carry = Some((key, rows[i][col].clone()));
        }
    }

    Ok(filled)
}
