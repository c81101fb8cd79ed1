//! Progress reporting for the imputation pipeline.
//!
//! # Example
//!
//! ```rust,ignore
//! use survey_imputation::Pipeline;
//!
//! let output = Pipeline::builder()
//!     .on_progress(|update| {
//!         println!("[{:?}] {}", update.stage, update.message);
//!     })
//!     .build()?
//!     .process(records, None)?;
//! ```

use serde::{Deserialize, Serialize};

/// Stages of the imputation pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImputationStage {
    /// Checking configured variables against the records
    Validation,
    /// Spreading instance-0 values across instances
    Apportionment,
    /// Initial markers, set-aside and working-value snapshot
    Preparation,
    /// Carry-forward and back-infill from the prior period
    MeanOfRatios,
    /// Class means for the remaining records
    TrimmedMean,
    /// Short-form breakdown estimation
    Expansion,
    /// Recombination, composite totals and commit
    Finalizing,
    /// Pipeline completed successfully
    Complete,
    /// Pipeline failed with an error
    Failed,
}

impl ImputationStage {
    /// Returns a human-readable name for the stage.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Validation => "Validating Schema",
            Self::Apportionment => "Apportioning",
            Self::Preparation => "Preparing Records",
            Self::MeanOfRatios => "Carrying Forward",
            Self::TrimmedMean => "Imputing Class Means",
            Self::Expansion => "Expanding Short Forms",
            Self::Finalizing => "Finalizing",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
        }
    }

    /// Share of the overall run this stage accounts for.
    pub fn weight(&self) -> f32 {
        match self {
            Self::Validation => 0.05,
            Self::Apportionment => 0.10,
            Self::Preparation => 0.05,
            Self::MeanOfRatios => 0.25,
            Self::TrimmedMean => 0.30,
            Self::Expansion => 0.15,
            Self::Finalizing => 0.10,
            Self::Complete | Self::Failed => 0.0,
        }
    }

    /// Cumulative progress at the start of this stage.
    pub fn base_progress(&self) -> f32 {
        match self {
            Self::Validation => 0.0,
            Self::Apportionment => 0.05,
            Self::Preparation => 0.15,
            Self::MeanOfRatios => 0.20,
            Self::TrimmedMean => 0.45,
            Self::Expansion => 0.75,
            Self::Finalizing => 0.90,
            Self::Complete => 1.0,
            Self::Failed => 0.0,
        }
    }
}

/// A progress update emitted between stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub stage: ImputationStage,

    /// Overall progress (0.0 - 1.0)
    pub progress: f32,

    /// Progress within current stage (0.0 - 1.0)
    pub stage_progress: f32,

    pub message: String,

    /// Records in play when the update was emitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<usize>,
}

impl ProgressUpdate {
    pub fn new(stage: ImputationStage, stage_progress: f32, message: impl Into<String>) -> Self {
        let progress = stage.base_progress() + (stage.weight() * stage_progress);
        Self {
            stage,
            progress: progress.clamp(0.0, 1.0),
            stage_progress: stage_progress.clamp(0.0, 1.0),
            message: message.into(),
            records: None,
        }
    }

    /// Attach the current record count.
    pub fn with_records(mut self, records: usize) -> Self {
        self.records = Some(records);
        self
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self {
            stage: ImputationStage::Complete,
            progress: 1.0,
            stage_progress: 1.0,
            message: message.into(),
            records: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            stage: ImputationStage::Failed,
            progress: 0.0,
            stage_progress: 0.0,
            message: message.into(),
            records: None,
        }
    }
}

/// Receiver of pipeline progress updates.
///
/// Implementations must be `Send + Sync` so a pipeline can run on a worker
/// thread while the caller consumes updates elsewhere.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, update: ProgressUpdate);
}

/// [`ProgressReporter`] backed by a closure.
pub struct ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    callback: F,
}

impl<F> ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ProgressReporter for ClosureProgressReporter<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate) {
        (self.callback)(update);
    }
}

static_assertions::assert_impl_all!(ProgressUpdate: Send, Sync);
