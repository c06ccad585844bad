//! Integrity checks run on the cleaned table before anything is persisted.
//!
//! A [`Verifier`] holds an ordered list of [`IntegrityCheck`]s and stops at
//! the first failure. [`Verifier::standard`] builds the three checks every
//! run must pass: no residual missing data, a stable row count, and an
//! output schema that covers the input schema.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::metrics::VerifyMetrics;
use crate::table::Table;

fn default_true() -> bool {
    true
}

/// How the entity schema is expected to change on its way to the output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaExpectation {
    /// Input columns that are legitimately gone from the output
    #[serde(default)]
    pub removed: Vec<String>,
    /// Columns the output must carry in addition to the input columns
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

impl Default for SchemaExpectation {
    fn default() -> Self {
        Self {
            removed: Vec::new(),
            added: Vec::new(),
            case_sensitive: true,
        }
    }
}

impl SchemaExpectation {
    fn normalize(&self, column: &str) -> String {
        if self.case_sensitive {
            column.to_string()
        } else {
            column.to_lowercase()
        }
    }

    /// Columns the output must contain, in input order followed by `added`
    pub fn expected_columns(&self, original: &[String]) -> Vec<String> {
        let removed: HashSet<String> = self.removed.iter().map(|c| self.normalize(c)).collect();
        let mut expected: Vec<String> = original
            .iter()
            .filter(|c| !removed.contains(&self.normalize(c)))
            .cloned()
            .collect();
        for column in &self.added {
            if !expected.iter().any(|e| self.normalize(e) == self.normalize(column)) {
                expected.push(column.clone());
            }
        }
        expected
    }
}

pub trait IntegrityCheck {
    fn name(&self) -> &'static str;
    fn check(&self, table: &Table) -> Result<()>;
}

/// No cell in the table may be missing
pub struct NoMissingCheck;

impl IntegrityCheck for NoMissingCheck {
    fn name(&self) -> &'static str {
        "no_missing"
    }

    fn check(&self, table: &Table) -> Result<()> {
        let columns = table.columns_with_missing();
        if columns.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::ResidualMissingData { columns })
        }
    }
}

/// The output has exactly as many rows as the entity table had
pub struct RowCountCheck {
    pub expected: usize,
}

impl IntegrityCheck for RowCountCheck {
    fn name(&self) -> &'static str {
        "row_count"
    }

    fn check(&self, table: &Table) -> Result<()> {
        if table.row_count() == self.expected {
            Ok(())
        } else {
            Err(PipelineError::RowCountMismatch {
                expected: self.expected,
                actual: table.row_count(),
            })
        }
    }
}

/// Every expected column is present in the output
pub struct SchemaSupersetCheck {
    pub expected: Vec<String>,
    pub case_sensitive: bool,
}

impl IntegrityCheck for SchemaSupersetCheck {
    fn name(&self) -> &'static str {
        "schema_superset"
    }

    fn check(&self, table: &Table) -> Result<()> {
        let fold = |c: &str| if self.case_sensitive { c.to_string() } else { c.to_lowercase() };
        let present: HashSet<String> = table.columns().iter().map(|c| fold(c.as_str())).collect();
        let missing: Vec<String> = self
            .expected
            .iter()
            .filter(|c| !present.contains(&fold(c.as_str())))
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::SchemaDrift { missing })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub checks_passed: Vec<&'static str>,
    pub rows: usize,
    pub columns: usize,
    pub missing_cells: usize,
}

pub struct Verifier {
    checks: Vec<Box<dyn IntegrityCheck>>,
}

impl Verifier {
    pub fn new(checks: Vec<Box<dyn IntegrityCheck>>) -> Self {
        Self { checks }
    }

    /// The three checks every run goes through, in order
    pub fn standard(original_rows: usize, original_columns: &[String], schema: &SchemaExpectation) -> Self {
        Self::new(vec![
            Box::new(NoMissingCheck),
            Box::new(RowCountCheck { expected: original_rows }),
            Box::new(SchemaSupersetCheck {
                expected: schema.expected_columns(original_columns),
                case_sensitive: schema.case_sensitive,
            }),
        ])
    }

    pub fn verify(&self, table: &Table) -> Result<VerificationReport> {
        let mut passed = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            if let Err(e) = check.check(table) {
                debug!(check = check.name(), error = %e, "verification failed");
                VerifyMetrics::record_failed(check.name());
                return Err(e);
            }
            passed.push(check.name());
        }
        info!(checks = passed.len(), rows = table.row_count(), "verification passed");
        VerifyMetrics::record_passed();
        Ok(VerificationReport {
            checks_passed: passed,
            rows: table.row_count(),
            columns: table.columns().len(),
            missing_cells: table.missing_cells(),
        })
    }
}
