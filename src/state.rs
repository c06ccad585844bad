use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;

use crate::error::Result;
use crate::gate::from_micros;

/// Persisted run state: the last-modified watermark of each source the
/// pipeline has successfully processed.
pub struct RunStateStore {
    conn: Connection,
}

impl RunStateStore {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS source_watermark (
                source            TEXT PRIMARY KEY,
                last_modified_us  INTEGER NOT NULL,
                recorded_at       INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn })
    }

    pub fn last_modified(&self, source: &str) -> Result<Option<DateTime<Utc>>> {
        let mut stmt = self
            .conn
            .prepare("SELECT last_modified_us FROM source_watermark WHERE source = ?1")?;
        let mut rows = stmt.query(params![source])?;
        if let Some(row) = rows.next()? {
            let us: i64 = row.get(0)?;
            Ok(from_micros(us))
        } else {
            Ok(None)
        }
    }

    /// Record the watermark of a completed run
    pub fn record_success(&self, source: &str, modified: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO source_watermark (source, last_modified_us, recorded_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(source) DO UPDATE SET last_modified_us=excluded.last_modified_us, recorded_at=excluded.recorded_at",
            params![source, modified.timestamp_micros(), Utc::now().timestamp()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::truncate_to_micros;

    #[test]
    fn test_watermark_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStateStore::open(dir.path().join("state").join("meta.db")).unwrap();
        assert_eq!(store.last_modified("dev/cademycode.db").unwrap(), None);

        let ts = truncate_to_micros(Utc::now());
        store.record_success("dev/cademycode.db", ts).unwrap();
        assert_eq!(store.last_modified("dev/cademycode.db").unwrap(), Some(ts));

        let later = ts + chrono::Duration::seconds(60);
        store.record_success("dev/cademycode.db", later).unwrap();
        assert_eq!(store.last_modified("dev/cademycode.db").unwrap(), Some(later));
        assert_eq!(store.last_modified("other.db").unwrap(), None);
    }

    #[test]
    fn test_watermark_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.db");
        let ts = truncate_to_micros(Utc::now());
        RunStateStore::open(&path).unwrap().record_success("src", ts).unwrap();
        assert_eq!(RunStateStore::open(&path).unwrap().last_modified("src").unwrap(), Some(ts));
    }
}
