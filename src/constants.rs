//! Default locations and table names for the cademycode deployment.
//! Every one of these can be overridden in `pipeline.toml` or through the
//! environment (see [`crate::config`]).

pub const DEFAULT_CONFIG_PATH: &str = "pipeline.toml";

pub const DEFAULT_SOURCE_DB: &str = "dev/cademycode.db";
pub const DEFAULT_OUTPUT_DB: &str = "dev/clean_cademycode.db";
pub const DEFAULT_OUTPUT_TABLE: &str = "final_table";
pub const DEFAULT_CSV_EXPORT: &str = "dev/final_output.csv";
pub const DEFAULT_CHANGELOG: &str = "logs/changelog.txt";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_LOG_FILE: &str = "data_pipeline.log";
pub const DEFAULT_STATE_DB: &str = "logs/pipeline_state.db";

pub const DEFAULT_VERSION: &str = "1.0.0";

// Source tables
pub const STUDENTS_TABLE: &str = "cademycode_students";
pub const JOBS_TABLE: &str = "cademycode_student_jobs";
pub const COURSES_TABLE: &str = "cademycode_courses";

// Placeholder for descriptive fields with no value
pub const UNKNOWN: &str = "Unknown";

// Environment overrides
pub const ENV_SOURCE: &str = "PIPELINE_SOURCE";
pub const ENV_OUTPUT_DB: &str = "PIPELINE_OUTPUT_DB";
pub const ENV_CSV_EXPORT: &str = "PIPELINE_CSV_EXPORT";
pub const ENV_CHANGELOG: &str = "PIPELINE_CHANGELOG";
pub const ENV_LOG_DIR: &str = "PIPELINE_LOG_DIR";
pub const ENV_STATE_DB: &str = "PIPELINE_STATE_DB";
pub const ENV_METRICS_FILE: &str = "PIPELINE_METRICS_FILE";
