//! Persistence of the cleaned snapshot and the audit changelog.
//!
//! The CSV export is staged to a temp file first. The relational snapshot is
//! then replaced inside a single SQLite transaction and the staged CSV is
//! renamed into place before that transaction commits, so a failed run
//! leaves both outputs at the previous snapshot. The changelog is only
//! appended after both writes succeed.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OpenFlags, Transaction};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::metrics::PersistMetrics;
use crate::table::{KeyValue, Table, Value};

/// One changelog record, written as three lines and a blank separator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangelogEntry {
    pub version: String,
    pub new_rows: usize,
    pub missing_cells: usize,
}

impl ChangelogEntry {
    pub fn render(&self) -> String {
        format!(
            "Version: {}\nNew rows added: {}\nMissing data count: {}\n\n",
            self.version, self.new_rows, self.missing_cells
        )
    }
}

/// Append `entry` to the changelog at `path`, creating it if needed
pub fn append_changelog(path: &Path, entry: &ChangelogEntry) -> Result<()> {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(entry.render().as_bytes())?;
        file.sync_data()
    };
    write().map_err(|e| {
        PersistMetrics::record_failure("changelog");
        PipelineError::persistence(path.display().to_string(), e)
    })
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Missing => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Date(_) => SqlValue::Text(value.to_string()),
    }
}

/// Declared SQLite type for a column, from the values it holds
fn column_affinity(table: &Table, idx: usize) -> &'static str {
    let mut affinity = None;
    for value in table.column_values(idx) {
        affinity = match (affinity, value) {
            (_, Value::Missing) => affinity,
            (None | Some("INTEGER"), Value::Integer(_)) => Some("INTEGER"),
            (None | Some("INTEGER") | Some("REAL"), Value::Float(_)) => Some("REAL"),
            (Some("REAL"), Value::Integer(_)) => Some("REAL"),
            _ => return "TEXT",
        };
    }
    affinity.unwrap_or("TEXT")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotReport {
    pub rows: usize,
    pub database: PathBuf,
    pub table: String,
    pub csv: PathBuf,
}

/// Destination of the cleaned snapshot
#[derive(Debug, Clone)]
pub struct OutputStore {
    db_path: PathBuf,
    table: String,
    csv_path: PathBuf,
}

impl OutputStore {
    pub fn new(db_path: impl Into<PathBuf>, table: impl Into<String>, csv_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            table: table.into(),
            csv_path: csv_path.into(),
        }
    }

    /// Key values present in the current snapshot. Empty when there is no
    /// snapshot yet.
    pub fn previous_keys(&self, key_column: &str) -> Result<HashSet<KeyValue>> {
        if !self.db_path.is_file() {
            return Ok(HashSet::new());
        }
        let conn = Connection::open_with_flags(&self.db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [&self.table],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Ok(HashSet::new());
        }

        let sql = format!("SELECT {} FROM {}", quote_ident(key_column), quote_ident(&self.table));
        let mut stmt = match conn.prepare(&sql) {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!(column = key_column, error = %e, "previous snapshot has no key column");
                return Ok(HashSet::new());
            }
        };
        let mut keys = HashSet::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let value = match row.get_ref(0)? {
                rusqlite::types::ValueRef::Integer(i) => Value::Integer(i),
                rusqlite::types::ValueRef::Real(f) => Value::Float(f),
                rusqlite::types::ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
                _ => Value::Missing,
            };
            keys.extend(value.key());
        }
        Ok(keys)
    }

    fn write_csv(&self, table: &Table, path: &Path) -> std::result::Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(table.columns())?;
        for row in table.rows() {
            writer.write_record(row.iter().map(Value::to_string))?;
        }
        writer.flush()?;
        Ok(())
    }

    fn replace_table(&self, tx: &Transaction<'_>, table: &Table) -> std::result::Result<(), rusqlite::Error> {
        let name = quote_ident(&self.table);
        let column_defs: Vec<String> = table
            .columns()
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} {}", quote_ident(c), column_affinity(table, i)))
            .collect();
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {name}; CREATE TABLE {name} ({});",
            column_defs.join(", ")
        ))?;

        let placeholders: Vec<String> = (1..=table.columns().len()).map(|i| format!("?{i}")).collect();
        let column_list: Vec<String> = table.columns().iter().map(|c| quote_ident(c)).collect();
        let mut insert = tx.prepare(&format!(
            "INSERT INTO {name} ({}) VALUES ({})",
            column_list.join(", "),
            placeholders.join(", ")
        ))?;
        for row in table.rows() {
            insert.execute(params_from_iter(row.iter().map(to_sql)))?;
        }
        Ok(())
    }

    /// Keep the current export reachable under a side name until the new
    /// snapshot is committed. `None` when there is no previous export.
    fn backup_csv(&self) -> std::io::Result<Option<PathBuf>> {
        if !self.csv_path.is_file() {
            return Ok(None);
        }
        let backup = self.csv_path.with_extension("csv.bak");
        let _ = fs::remove_file(&backup);
        if fs::hard_link(&self.csv_path, &backup).is_err() {
            fs::copy(&self.csv_path, &backup)?;
        }
        Ok(Some(backup))
    }

    fn restore_csv(&self, backup: Option<PathBuf>) {
        let restored = match &backup {
            Some(path) => fs::rename(path, &self.csv_path),
            None => fs::remove_file(&self.csv_path),
        };
        if let Err(e) = restored {
            warn!(path = %self.csv_path.display(), error = %e, "could not restore previous csv export");
        }
    }

    /// Swap both outputs in. The CSV is renamed into place while the table
    /// replacement is still uncommitted; a failed rename rolls the table
    /// back and a failed commit puts the previous CSV back.
    fn publish(&self, table: &Table, staged_csv: &Path) -> Result<()> {
        let db_failure = |e: rusqlite::Error| {
            PersistMetrics::record_failure("database");
            PipelineError::persistence(self.db_path.display().to_string(), e)
        };
        let csv_failure = |e: std::io::Error| {
            PersistMetrics::record_failure("csv");
            PipelineError::persistence(self.csv_path.display().to_string(), e)
        };

        let mut conn = Connection::open(&self.db_path).map_err(db_failure)?;
        let tx = conn.transaction().map_err(db_failure)?;
        self.replace_table(&tx, table).map_err(db_failure)?;

        let backup = self.backup_csv().map_err(csv_failure)?;
        if let Err(e) = fs::rename(staged_csv, &self.csv_path) {
            if let Some(path) = &backup {
                let _ = fs::remove_file(path);
            }
            return Err(csv_failure(e));
        }

        if let Err(e) = tx.commit() {
            self.restore_csv(backup);
            return Err(db_failure(e));
        }
        if let Some(path) = &backup {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    /// Replace the snapshot with `table` and refresh the CSV export.
    ///
    /// Either both outputs move to the new snapshot or neither does.
    pub fn write_snapshot(&self, table: &Table) -> Result<SnapshotReport> {
        let started = Instant::now();
        for path in [&self.db_path, &self.csv_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| PipelineError::persistence(parent.display().to_string(), e))?;
            }
        }

        let staged_csv = self.csv_path.with_extension("csv.tmp");
        if let Err(e) = self.write_csv(table, &staged_csv) {
            let _ = fs::remove_file(&staged_csv);
            PersistMetrics::record_failure("csv");
            return Err(PipelineError::persistence(self.csv_path.display().to_string(), e));
        }
        debug!(path = %staged_csv.display(), "csv export staged");

        if let Err(e) = self.publish(table, &staged_csv) {
            let _ = fs::remove_file(&staged_csv);
            return Err(e);
        }

        PersistMetrics::record_snapshot(table.row_count(), started.elapsed().as_secs_f64());
        info!(
            rows = table.row_count(),
            database = %self.db_path.display(),
            table = %self.table,
            csv = %self.csv_path.display(),
            "snapshot written"
        );
        Ok(SnapshotReport {
            rows: table.row_count(),
            database: self.db_path.clone(),
            table: self.table.clone(),
            csv: self.csv_path.clone(),
        })
    }
}
