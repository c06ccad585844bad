use super::phase_metric;

pub struct RunMetrics;

impl RunMetrics {
    pub fn record_started() {
        ::metrics::counter!(phase_metric!(counter, "run", "started")).increment(1);
    }

    pub fn record_skipped() {
        ::metrics::counter!(phase_metric!(counter, "run", "skipped")).increment(1);
    }

    pub fn record_completed(duration_secs: f64) {
        ::metrics::counter!(phase_metric!(counter, "run", "completed")).increment(1);
        ::metrics::histogram!(phase_metric!(histogram, "run", "duration_seconds")).record(duration_secs);
        ::metrics::gauge!(phase_metric!(gauge, "run", "last_success_timestamp_seconds"))
            .set(chrono::Utc::now().timestamp() as f64);
    }

    pub fn record_failed(kind: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "run", "failed"), "kind" => kind).increment(1);
    }
}

/// Ingestion and typing
pub struct IngestMetrics;

impl IngestMetrics {
    pub fn record_table_loaded(table: &str, rows: usize) {
        ::metrics::counter!(phase_metric!(counter, "ingest", "rows"), "table" => table.to_string())
            .increment(rows as u64);
    }

    pub fn record_malformed(column: &str, cells: usize) {
        ::metrics::counter!(phase_metric!(counter, "ingest", "malformed_cells"), "column" => column.to_string())
            .increment(cells as u64);
    }

    pub fn record_duplicates_dropped(table: &str, rows: usize) {
        ::metrics::counter!(phase_metric!(counter, "ingest", "duplicates_dropped"), "table" => table.to_string())
            .increment(rows as u64);
    }
}

pub struct PolicyMetrics;

impl PolicyMetrics {
    pub fn record_fill(strategy: &'static str, cells: usize) {
        ::metrics::counter!(phase_metric!(counter, "policy", "cells_filled"), "strategy" => strategy)
            .increment(cells as u64);
    }

    pub fn record_column_dropped(column: &str) {
        ::metrics::counter!(phase_metric!(counter, "policy", "columns_dropped"), "column" => column.to_string())
            .increment(1);
    }
}

pub struct JoinMetrics;

impl JoinMetrics {
    pub fn record_join(reference: &str, matched: usize, unmatched: usize) {
        ::metrics::counter!(phase_metric!(counter, "join", "matched_rows"), "reference" => reference.to_string())
            .increment(matched as u64);
        ::metrics::counter!(phase_metric!(counter, "join", "unmatched_rows"), "reference" => reference.to_string())
            .increment(unmatched as u64);
    }

    pub fn record_reconciled(cells: usize) {
        ::metrics::counter!(phase_metric!(counter, "join", "sentinel_cells")).increment(cells as u64);
    }
}

pub struct VerifyMetrics;

impl VerifyMetrics {
    pub fn record_passed() {
        ::metrics::counter!(phase_metric!(counter, "verify", "passed")).increment(1);
    }

    pub fn record_failed(check: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "verify", "failed"), "check" => check).increment(1);
    }
}

pub struct PersistMetrics;

impl PersistMetrics {
    pub fn record_snapshot(rows: usize, duration_secs: f64) {
        ::metrics::gauge!(phase_metric!(gauge, "persist", "snapshot_rows")).set(rows as f64);
        ::metrics::histogram!(phase_metric!(histogram, "persist", "duration_seconds")).record(duration_secs);
    }

    pub fn record_failure(target: &'static str) {
        ::metrics::counter!(phase_metric!(counter, "persist", "failures"), "target" => target).increment(1);
    }
}
