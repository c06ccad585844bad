use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Instant;
use tracing::{debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::gate;
use crate::join::{left_join, reconcile, JoinStats};
use crate::metrics::{IngestMetrics, RunMetrics};
use crate::persist::{append_changelog, ChangelogEntry, OutputStore, SnapshotReport};
use crate::policy::{apply_all, PolicyOutcome};
use crate::source::{open_source, TableSource};
use crate::table::coerce::coerce_table;
use crate::table::{KeyValue, Table};
use crate::verify::{VerificationReport, Verifier};

/// Result of a completed run
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub source: String,
    pub source_modified: DateTime<Utc>,
    pub entity_rows: usize,
    pub malformed: BTreeMap<String, usize>,
    pub fills: Vec<PolicyOutcome>,
    pub joins: Vec<JoinStats>,
    pub reconciled: usize,
    pub verification: VerificationReport,
    pub snapshot: SnapshotReport,
    pub changelog: ChangelogEntry,
    pub duration_secs: f64,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Source unchanged since the last successful run
    Skipped { modified: DateTime<Utc> },
    Completed(RunSummary),
}

impl RunOutcome {
    /// Watermark to record once the run is known to have succeeded
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        match self {
            RunOutcome::Skipped { .. } => None,
            RunOutcome::Completed(summary) => Some(summary.source_modified),
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Gate, clean, join, verify and persist.
    ///
    /// `last_seen` is the watermark of the previous successful run; `force`
    /// runs even when the source is unchanged. Nothing is written unless
    /// every verification check passes, and the changelog only after both
    /// snapshot writes succeeded.
    pub fn run(&self, last_seen: Option<DateTime<Utc>>, force: bool) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("pipeline_run", %run_id, version = %self.config.version);
        let _enter = span.enter();

        RunMetrics::record_started();
        let started = Instant::now();
        let result = self.execute(run_id, last_seen, force, started);

        match &result {
            Ok(RunOutcome::Skipped { modified }) => {
                info!(%modified, "no update needed, source unchanged");
                RunMetrics::record_skipped();
            }
            Ok(RunOutcome::Completed(summary)) => {
                info!(
                    rows = summary.snapshot.rows,
                    new_rows = summary.changelog.new_rows,
                    duration_secs = summary.duration_secs,
                    "pipeline run completed"
                );
                RunMetrics::record_completed(summary.duration_secs);
            }
            Err(e) => RunMetrics::record_failed(e.kind()),
        }
        result
    }

    fn execute(
        &self,
        run_id: Uuid,
        last_seen: Option<DateTime<Utc>>,
        force: bool,
        started: Instant,
    ) -> Result<RunOutcome> {
        let paths = &self.config.paths;
        let (changed, modified) = gate::should_run(&paths.source, last_seen)?;
        if !changed {
            if !force {
                return Ok(RunOutcome::Skipped { modified });
            }
            info!("source unchanged, running anyway");
        }

        let source = open_source(&paths.source)?;
        info!(source = %source.describe(), %modified, "source opened");

        let mut entity = self.load(source.as_ref(), &self.config.entity.table)?;
        let entity_rows = entity.row_count();
        let original_columns = entity.columns().to_vec();
        self.check_entity_key(&entity)?;

        let malformed = self.coerce(&mut entity)?;
        let fills = apply_all(&mut entity, &self.config.policies)?;
        let (mut output, joins) = self.join_references(source.as_ref(), entity)?;
        let reconciled = reconcile(&mut output, &self.config.reconcile)?;

        let mut schema = self.config.schema.clone();
        schema
            .removed
            .extend(fills.iter().filter(|f| f.dropped).map(|f| f.column.clone()));
        let verification = Verifier::standard(entity_rows, &original_columns, &schema).verify(&output)?;

        let store = OutputStore::new(&paths.output_db, &paths.output_table, &paths.csv_export);
        let new_rows = self.count_new_rows(&store, &output)?;
        let snapshot = store.write_snapshot(&output)?;

        let changelog = ChangelogEntry {
            version: self.config.version.clone(),
            new_rows,
            missing_cells: output.missing_cells(),
        };
        append_changelog(&paths.changelog, &changelog)?;
        info!(path = %paths.changelog.display(), new_rows, "changelog updated");

        Ok(RunOutcome::Completed(RunSummary {
            run_id,
            source: source.describe(),
            source_modified: modified,
            entity_rows,
            malformed,
            fills,
            joins,
            reconciled,
            verification,
            snapshot,
            changelog,
            duration_secs: started.elapsed().as_secs_f64(),
        }))
    }

    #[instrument(skip(self, source))]
    fn load(&self, source: &dyn TableSource, table: &str) -> Result<Table> {
        let loaded = source.load_table(table)?;
        IngestMetrics::record_table_loaded(table, loaded.row_count());
        info!(rows = loaded.row_count(), columns = loaded.columns().len(), "table loaded");

        for profile in loaded.missing_profile().iter().filter(|p| p.missing > 0) {
            info!(
                column = %profile.column,
                missing = profile.missing,
                missing_pct = %format!("{:.2}", profile.missing_pct),
                "missing values"
            );
        }
        Ok(loaded)
    }

    /// The entity key must be present and unique when configured so
    fn check_entity_key(&self, entity: &Table) -> Result<()> {
        let column = &self.config.entity.id_column;
        let idx = entity.require_column(column)?;
        if !self.config.entity.require_unique_id {
            return Ok(());
        }

        let mut seen: HashSet<KeyValue> = HashSet::with_capacity(entity.row_count());
        let (mut nulls, mut duplicates) = (0, 0);
        for value in entity.column_values(idx) {
            match value.key() {
                None => nulls += 1,
                Some(key) => {
                    if !seen.insert(key) {
                        duplicates += 1;
                    }
                }
            }
        }
        if nulls > 0 || duplicates > 0 {
            return Err(PipelineError::DuplicateEntityKey {
                column: column.clone(),
                nulls,
                duplicates,
            });
        }
        Ok(())
    }

    #[instrument(skip_all)]
    fn coerce(&self, entity: &mut Table) -> Result<BTreeMap<String, usize>> {
        let report = coerce_table(entity, &self.config.entity.coerce)?;
        for (column, cells) in &report.malformed {
            warn!(column = %column, cells, "malformed values replaced with missing");
            IngestMetrics::record_malformed(column, *cells);
        }
        debug!(malformed = report.total(), "typing complete");
        Ok(report.malformed)
    }

    #[instrument(skip_all)]
    fn join_references(&self, source: &dyn TableSource, entity: Table) -> Result<(Table, Vec<JoinStats>)> {
        let mut current = entity;
        let mut stats = Vec::with_capacity(self.config.references.len());
        for spec in &self.config.references {
            let mut reference = self.load(source, &spec.table)?;
            if spec.dedup {
                let dropped = reference.dedup();
                if dropped > 0 {
                    info!(table = %spec.table, dropped, "duplicate reference rows removed");
                    IngestMetrics::record_duplicates_dropped(&spec.table, dropped);
                }
            }
            let (joined, join_stats) = left_join(&current, &reference, &spec.left_on, &spec.right_on)?;
            info!(
                reference = %spec.table,
                matched = join_stats.matched,
                unmatched = join_stats.unmatched,
                rows = join_stats.output_rows,
                "reference joined"
            );
            current = joined;
            stats.push(join_stats);
        }
        Ok((current, stats))
    }

    /// Distinct entity keys not present in the previous snapshot
    fn count_new_rows(&self, store: &OutputStore, output: &Table) -> Result<usize> {
        let column = &self.config.entity.id_column;
        let idx = output.require_column(column)?;
        let previous = store.previous_keys(column)?;
        let fresh: HashSet<KeyValue> = output
            .column_values(idx)
            .filter_map(|v| v.key())
            .filter(|k| !previous.contains(k))
            .collect();
        Ok(fresh.len())
    }
}
