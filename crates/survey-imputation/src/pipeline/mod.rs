//! Pipeline module.
//!
//! This module provides the imputation pipeline and its progress reporting.

mod builder;
mod executor;
pub mod progress;

pub use builder::{Pipeline, PipelineBuilder, ShortToLongHook};
pub use executor::ImputationExecutor;
pub use progress::{ClosureProgressReporter, ImputationStage, ProgressReporter, ProgressUpdate};
