use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::constants::*;
use crate::error::{PipelineError, Result};
use crate::join::{JoinSpec, ReconcileRule};
use crate::policy::{ColumnPolicy, FillStrategy, Sentinel};
use crate::table::coerce::ColumnType;
use crate::verify::SchemaExpectation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Version tag written to the changelog
    pub version: String,
    pub paths: PathsConfig,
    pub entity: EntityConfig,
    pub policies: Vec<ColumnPolicy>,
    pub references: Vec<JoinSpec>,
    pub reconcile: Vec<ReconcileRule>,
    pub schema: SchemaExpectation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub source: PathBuf,
    pub output_db: PathBuf,
    pub output_table: String,
    pub csv_export: PathBuf,
    pub changelog: PathBuf,
    pub log_dir: PathBuf,
    pub state_db: PathBuf,
    /// Prometheus textfile written after each run, if set
    pub metrics_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    pub table: String,
    pub id_column: String,
    pub require_unique_id: bool,
    /// Declared types for columns stored as text upstream
    pub coerce: BTreeMap<String, ColumnType>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE_DB.into(),
            output_db: DEFAULT_OUTPUT_DB.into(),
            output_table: DEFAULT_OUTPUT_TABLE.to_string(),
            csv_export: DEFAULT_CSV_EXPORT.into(),
            changelog: DEFAULT_CHANGELOG.into(),
            log_dir: DEFAULT_LOG_DIR.into(),
            state_db: DEFAULT_STATE_DB.into(),
            metrics_file: None,
        }
    }
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            table: STUDENTS_TABLE.to_string(),
            id_column: "uuid".to_string(),
            require_unique_id: true,
            coerce: BTreeMap::from([
                ("dob".to_string(), ColumnType::Date),
                ("job_id".to_string(), ColumnType::Integer),
                ("current_career_path_id".to_string(), ColumnType::Integer),
                ("num_course_taken".to_string(), ColumnType::Float),
                ("time_spent_hrs".to_string(), ColumnType::Float),
            ]),
        }
    }
}

fn unknown() -> Sentinel {
    Sentinel::Text(UNKNOWN.to_string())
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let rule = |column: &str, sentinel: Sentinel| ReconcileRule {
            column: column.to_string(),
            sentinel,
        };
        Self {
            version: DEFAULT_VERSION.to_string(),
            paths: PathsConfig::default(),
            entity: EntityConfig::default(),
            policies: vec![
                ColumnPolicy::constant("job_id", Sentinel::Integer(0)),
                ColumnPolicy::constant("current_career_path_id", Sentinel::Integer(0)),
                ColumnPolicy::new("num_course_taken", FillStrategy::Median),
                ColumnPolicy::new("time_spent_hrs", FillStrategy::Median),
                ColumnPolicy::new(
                    "contact_info",
                    FillStrategy::Extract {
                        fields: vec!["mailing_address".to_string(), "email".to_string()],
                        drop_source: true,
                    },
                ),
                ColumnPolicy::constant("mailing_address", unknown()),
                ColumnPolicy::constant("email", unknown()),
            ],
            references: vec![
                JoinSpec {
                    table: JOBS_TABLE.to_string(),
                    left_on: "job_id".to_string(),
                    right_on: "job_id".to_string(),
                    dedup: true,
                },
                JoinSpec {
                    table: COURSES_TABLE.to_string(),
                    left_on: "current_career_path_id".to_string(),
                    right_on: "career_path_id".to_string(),
                    dedup: true,
                },
            ],
            reconcile: vec![
                rule("job_category", unknown()),
                rule("avg_salary", Sentinel::Integer(0)),
                rule("career_path_id", Sentinel::Integer(0)),
                rule("career_path_name", unknown()),
                rule("hours_to_complete", Sentinel::Integer(0)),
            ],
            schema: SchemaExpectation {
                removed: vec!["contact_info".to_string()],
                added: vec!["mailing_address".to_string(), "email".to_string()],
                case_sensitive: true,
            },
        }
    }
}

impl PipelineConfig {
    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, `pipeline.toml` in the
    /// working directory is used if present and the built-in defaults
    /// otherwise. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_PATH).is_file() => Self::from_file(Path::new(DEFAULT_CONFIG_PATH))?,
            None => {
                debug!("no config file, using defaults");
                Self::default()
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        let config: PipelineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Override paths from environment-style lookups
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty()).map(PathBuf::from);
        if let Some(v) = get(ENV_SOURCE) {
            self.paths.source = v;
        }
        if let Some(v) = get(ENV_OUTPUT_DB) {
            self.paths.output_db = v;
        }
        if let Some(v) = get(ENV_CSV_EXPORT) {
            self.paths.csv_export = v;
        }
        if let Some(v) = get(ENV_CHANGELOG) {
            self.paths.changelog = v;
        }
        if let Some(v) = get(ENV_LOG_DIR) {
            self.paths.log_dir = v;
        }
        if let Some(v) = get(ENV_STATE_DB) {
            self.paths.state_db = v;
        }
        if let Some(v) = get(ENV_METRICS_FILE) {
            self.paths.metrics_file = Some(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PipelineError::Config(msg));

        if self.version.trim().is_empty() {
            return invalid("version tag must not be empty".into());
        }
        if self.entity.table.is_empty() || self.entity.id_column.is_empty() {
            return invalid("entity table and id column are required".into());
        }
        if self.paths.output_table.is_empty() {
            return invalid("output table name is required".into());
        }
        for policy in &self.policies {
            if policy.column.is_empty() {
                return invalid("policy with empty column name".into());
            }
            match &policy.strategy {
                FillStrategy::Extract { fields, .. } if fields.is_empty() => {
                    return invalid(format!("extract policy on '{}' declares no fields", policy.column));
                }
                FillStrategy::CarryBackward { entity, sequence } if entity.is_empty() || sequence.is_empty() => {
                    return invalid(format!(
                        "carry_backward policy on '{}' needs entity and sequence columns",
                        policy.column
                    ));
                }
                FillStrategy::DropSparse { max_missing_pct } if !(0.0..=100.0).contains(max_missing_pct) => {
                    return invalid(format!(
                        "drop_sparse policy on '{}' needs max_missing_pct between 0 and 100, got {}",
                        policy.column, max_missing_pct
                    ));
                }
                _ => {}
            }
        }
        for join in &self.references {
            if join.table.is_empty() || join.left_on.is_empty() || join.right_on.is_empty() {
                return invalid(format!("reference '{}' needs table, left_on and right_on", join.table));
            }
        }
        if let Some(rule) = self.reconcile.iter().find(|r| r.column.is_empty()) {
            return invalid(format!("reconcile rule with empty column (sentinel {:?})", rule.sentinel));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.entity.table, "cademycode_students");
        assert_eq!(config.references.len(), 2);
        assert_eq!(config.paths.output_table, "final_table");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: PipelineConfig = toml::from_str(
            r#"
            version = "2.1.0"

            [paths]
            source = "/data/snapshot.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.version, "2.1.0");
        assert_eq!(config.paths.source, PathBuf::from("/data/snapshot.db"));
        assert_eq!(config.paths.output_db, PathBuf::from(DEFAULT_OUTPUT_DB));
        assert_eq!(config.policies, PipelineConfig::default().policies);
    }

    #[test]
    fn test_full_file_round_trips() {
        let config = PipelineConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: PipelineConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_example_file_matches_defaults() {
        let config: PipelineConfig = toml::from_str(include_str!("../pipeline.example.toml")).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_env_overrides_paths() {
        let mut config = PipelineConfig::default();
        config.apply_env(|key| match key {
            ENV_SOURCE => Some("/tmp/src.db".to_string()),
            ENV_METRICS_FILE => Some("/tmp/pipeline.prom".to_string()),
            ENV_LOG_DIR => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.paths.source, PathBuf::from("/tmp/src.db"));
        assert_eq!(config.paths.metrics_file, Some(PathBuf::from("/tmp/pipeline.prom")));
        assert_eq!(config.paths.log_dir, PathBuf::from(DEFAULT_LOG_DIR));
    }

    #[test]
    fn test_validation_rejects_empty_extract() {
        let mut config = PipelineConfig::default();
        config.policies.push(ColumnPolicy::new(
            "contact_info",
            FillStrategy::Extract { fields: vec![], drop_source: true },
        ));
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_validation_rejects_out_of_range_drop_threshold() {
        for pct in [-1.0, 150.0, f64::NAN] {
            let mut config = PipelineConfig::default();
            config
                .policies
                .push(ColumnPolicy::new("email", FillStrategy::DropSparse { max_missing_pct: pct }));
            assert!(matches!(config.validate(), Err(PipelineError::Config(_))), "accepted {pct}");
        }

        let mut config = PipelineConfig::default();
        config
            .policies
            .push(ColumnPolicy::new("email", FillStrategy::DropSparse { max_missing_pct: 100.0 }));
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_explicit_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
