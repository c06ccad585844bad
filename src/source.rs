//! Where raw tables come from.
//!
//! The production source is a SQLite snapshot; a directory of CSV files (one
//! file per table, named after the table) is accepted for ad hoc runs.
//! Sources hand back untyped tables: SQLite storage classes map onto
//! [`Value`] variants as-is and every CSV field is text.

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::table::{Table, Value};

pub trait TableSource {
    /// Human-readable location for logs
    fn describe(&self) -> String;
    fn table_names(&self) -> Result<Vec<String>>;
    fn load_table(&self, name: &str) -> Result<Table>;
}

fn unavailable(path: &Path, reason: impl ToString) -> PipelineError {
    PipelineError::SourceUnavailable {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Open the source at `path`: a directory is read as CSV files, anything
/// else as a SQLite database.
pub fn open_source(path: &Path) -> Result<Box<dyn TableSource>> {
    let meta = fs::metadata(path).map_err(|e| unavailable(path, e))?;
    if meta.is_dir() {
        Ok(Box::new(CsvSource::open(path)?))
    } else {
        Ok(Box::new(SqliteSource::open(path)?))
    }
}

pub struct SqliteSource {
    path: PathBuf,
    conn: Connection,
}

impl SqliteSource {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(unavailable(path, "no such file"));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| unavailable(path, e))?;
        let source = Self {
            path: path.to_path_buf(),
            conn,
        };
        // Fails here rather than mid-run if the file is not a database
        source.table_names().map_err(|e| unavailable(path, e))?;
        Ok(source)
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Missing,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) if f.is_finite() => Value::Float(f),
        ValueRef::Real(_) => Value::Missing,
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

impl TableSource for SqliteSource {
    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn table_names(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn load_table(&self, name: &str) -> Result<Table> {
        if !self.table_names()?.iter().any(|t| t == name) {
            return Err(PipelineError::TableNotFound(name.to_string()));
        }
        let mut stmt = self.conn.prepare(&format!("SELECT * FROM {}", quote_ident(name)))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let mut table = Table::new(name, columns);
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(from_sql(row.get_ref(i)?));
            }
            table.push_row(values);
        }
        debug!(table = name, rows = table.row_count(), "loaded table from sqlite");
        Ok(table)
    }
}

pub struct CsvSource {
    dir: PathBuf,
}

impl CsvSource {
    pub fn open(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(unavailable(dir, "not a directory"));
        }
        Ok(Self { dir: dir.to_path_buf() })
    }

    /// CSV files in the directory, the data files the gate watches
    pub fn files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| unavailable(dir, e))? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "csv") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

impl TableSource for CsvSource {
    fn describe(&self) -> String {
        format!("csv:{}", self.dir.display())
    }

    fn table_names(&self) -> Result<Vec<String>> {
        Ok(Self::files(&self.dir)?
            .iter()
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .collect())
    }

    fn load_table(&self, name: &str) -> Result<Table> {
        let path = self.dir.join(format!("{name}.csv"));
        if !path.is_file() {
            return Err(PipelineError::TableNotFound(name.to_string()));
        }
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(&path)?;
        let columns: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let mut table = Table::new(name, columns);
        for record in reader.records() {
            let record = record?;
            table.push_row(
                record
                    .iter()
                    .map(|field| {
                        if field.is_empty() {
                            Value::Missing
                        } else {
                            Value::text(field)
                        }
                    })
                    .collect(),
            );
        }
        debug!(table = name, rows = table.row_count(), "loaded table from csv");
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn sqlite_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("source.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE cademycode_students (uuid INTEGER, name TEXT, job_id TEXT, time_spent_hrs TEXT, blob BLOB);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO cademycode_students VALUES (?1, ?2, ?3, ?4, ?5)",
            params![1, "Ann", "3.0", "4.5", vec![104u8, 105]],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO cademycode_students VALUES (?1, ?2, NULL, 2.5, NULL)",
            params![2, "Bo"],
        )
        .unwrap();
        path
    }

    #[test]
    fn test_sqlite_source_loads_untyped_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = sqlite_fixture(dir.path());
        let source = open_source(&path).unwrap();

        assert_eq!(source.table_names().unwrap(), vec!["cademycode_students"]);
        let table = source.load_table("cademycode_students").unwrap();
        assert_eq!(table.columns(), &["uuid", "name", "job_id", "time_spent_hrs", "blob"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, "job_id"), Some(&"3.0".into()));
        assert_eq!(table.cell(0, "blob"), Some(&"hi".into()));
        assert_eq!(table.cell(1, "job_id"), Some(&Value::Missing));
        // Column affinity is TEXT, so the REAL literal comes back as text
        assert_eq!(table.cell(1, "time_spent_hrs"), Some(&"2.5".into()));
    }

    #[test]
    fn test_unknown_table() {
        let dir = tempfile::tempdir().unwrap();
        let source = SqliteSource::open(&sqlite_fixture(dir.path())).unwrap();
        assert!(matches!(source.load_table("nope"), Err(PipelineError::TableNotFound(_))));
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_source(&dir.path().join("absent.db")).err().unwrap();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_non_database_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.db");
        fs::write(&path, "this is not sqlite, just some text padding it out to a page").unwrap();
        assert!(matches!(
            SqliteSource::open(&path),
            Err(PipelineError::SourceUnavailable { .. })
        ));
    }

    #[test]
    fn test_csv_source_reads_text_fields() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("survey.csv"),
            "RespondentID,Year,UndergradMajor\n1,2019,\n1,2020,computer science\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = open_source(dir.path()).unwrap();
        assert_eq!(source.table_names().unwrap(), vec!["survey"]);
        let table = source.load_table("survey").unwrap();
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.cell(0, "UndergradMajor"), Some(&Value::Missing));
        assert_eq!(table.cell(1, "Year"), Some(&"2020".into()));
    }
}
