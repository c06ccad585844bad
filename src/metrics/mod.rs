//! Metrics for the cleaning pipeline
//!
//! Each pipeline phase records through its own struct in [`phases`]. Metric
//! names come from [`phase_metric!`] so they stay consistent. The binary
//! installs an in-process Prometheus recorder; since a run lives for a few
//! seconds, the rendered snapshot is written to a textfile for a collector
//! to pick up instead of being scraped.

pub mod phases;

pub use phases::{IngestMetrics, JoinMetrics, PersistMetrics, PolicyMetrics, RunMetrics, VerifyMetrics};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Build a metric name from a phase and a short name
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("pipeline_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("pipeline_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("pipeline_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;

/// Install the global recorder. Idempotent; failures are logged and the
/// pipeline runs without metrics.
pub fn init_metrics() {
    if HANDLE.get().is_some() {
        return;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let _ = HANDLE.set(handle);
            info!("metrics recorder installed");
        }
        Err(e) => warn!("metrics recorder not installed: {}", e),
    }
}

/// Render the current snapshot in Prometheus exposition format
pub fn render() -> Option<String> {
    HANDLE.get().map(PrometheusHandle::render)
}

/// Write the current snapshot to `path`, replacing any previous file.
///
/// Writes to a sibling temp file first so a collector never reads half a
/// snapshot.
pub fn write_textfile(path: &Path) -> std::io::Result<bool> {
    let Some(body) = render() else {
        return Ok(false);
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("prom.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_phase_metric_macro() {
        assert_eq!(phase_metric!(counter, "ingest", "rows"), "pipeline_ingest_rows_total");
        assert_eq!(phase_metric!(histogram, "persist", "duration_seconds"), "pipeline_persist_duration_seconds");
        assert_eq!(phase_metric!(gauge, "verify", "missing_cells"), "pipeline_verify_missing_cells");
    }

    #[test]
    fn test_write_textfile_without_recorder_is_a_no_op() {
        // The test binary never installs a recorder
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.prom");
        if super::render().is_none() {
            assert!(!super::write_textfile(&path).unwrap());
            assert!(!path.exists());
        }
    }
}
