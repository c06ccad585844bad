pub mod config;
pub mod constants;
pub mod error;
pub mod gate;
pub mod join;
pub mod logging;
pub mod metrics;
pub mod persist;
pub mod pipeline;
pub mod policy;
pub mod source;
pub mod state;
pub mod table;
pub mod verify;

pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, RunOutcome, RunSummary};
