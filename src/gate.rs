//! Change-detection gate.
//!
//! The pipeline only runs when the source snapshot changed since the last
//! successful run. The gate itself is a pure query: the caller records the
//! new watermark (see [`crate::state::RunStateStore`]) once a run succeeds,
//! so a failed run is retried on the next invocation.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::source::CsvSource;

/// Watermarks are stored with microsecond precision; comparisons happen at
/// the same precision so a round-tripped value compares equal.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_micros(ts.timestamp_micros()).unwrap_or(ts)
}

pub fn from_micros(us: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(us.div_euclid(1_000_000), (us.rem_euclid(1_000_000) * 1_000) as u32)
}

fn mtime(path: &Path) -> Result<DateTime<Utc>> {
    let unavailable = |e: std::io::Error| PipelineError::SourceUnavailable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(unavailable)?;
    Ok(DateTime::<Utc>::from(modified))
}

/// Last-modified time of the source. For a CSV directory this is the newest
/// of the directory itself and the files in it.
pub fn source_modified(path: &Path) -> Result<DateTime<Utc>> {
    let mut latest = mtime(path)?;
    if path.is_dir() {
        for file in CsvSource::files(path)? {
            latest = latest.max(mtime(&file)?);
        }
    }
    Ok(truncate_to_micros(latest))
}

/// Decide whether the pipeline should run.
///
/// Returns `true` when there is no previous watermark or the source's
/// modification time is strictly newer than it, along with the timestamp to
/// record after a successful run.
pub fn should_run(source_path: &Path, last_seen: Option<DateTime<Utc>>) -> Result<(bool, DateTime<Utc>)> {
    let current = source_modified(source_path)?;
    let run = match last_seen {
        None => true,
        Some(seen) => current > truncate_to_micros(seen),
    };
    debug!(source = %source_path.display(), %current, ?last_seen, run, "gate evaluated");
    Ok((run, current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_first_run_always_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        fs::write(&path, b"x").unwrap();

        let (run, ts) = should_run(&path, None).unwrap();
        assert!(run);
        assert_eq!(ts, source_modified(&path).unwrap());
    }

    #[test]
    fn test_unchanged_source_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        fs::write(&path, b"x").unwrap();

        let (_, ts) = should_run(&path, None).unwrap();
        let (run, again) = should_run(&path, Some(ts)).unwrap();
        assert!(!run);
        assert_eq!(ts, again);
    }

    #[test]
    fn test_newer_source_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.db");
        fs::write(&path, b"x").unwrap();

        let (_, ts) = should_run(&path, None).unwrap();
        let (run, _) = should_run(&path, Some(ts - Duration::seconds(5))).unwrap();
        assert!(run);
        let (run, _) = should_run(&path, Some(ts + Duration::seconds(5))).unwrap();
        assert!(!run);
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = should_run(&dir.path().join("gone.db"), None).unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_micros_round_trip() {
        let ts = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let truncated = truncate_to_micros(ts);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(from_micros(truncated.timestamp_micros()), Some(truncated));
    }
}
