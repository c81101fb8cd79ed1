//! Survey Imputation Library
//!
//! Imputation of missing returns for a periodic business R&D survey, built
//! with Rust and Polars.
//!
//! # Overview
//!
//! One period's records are completed in a fixed sequence of stages:
//!
//! - **Apportionment**: Spreads instance-0 answers over the reference's instances
//! - **Carry-Forward**: Copies prior-period values for unresolved records
//! - **Back-Infill**: Scales carried values by mean-of-ratios link factors
//! - **Trimmed-Mean Imputation**: Fills the rest from trimmed class means
//! - **Short-Form Expansion**: Estimates long-form breakdowns for short forms
//! - **Progress Reporting**: Stage-by-stage progress updates
//!
//! Every stage is deterministic: the same input always produces the same
//! output, regardless of row order.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use survey_imputation::{
//!     ImputationConfig, Pipeline, backdata_from_dataframe, records_from_dataframe,
//!     sic_mapping_from_dataframe,
//! };
//!
//! let config = ImputationConfig::builder()
//!     .trim_threshold(10)
//!     .trim_percentiles(15, 15)
//!     .build()?;
//!
//! let records = records_from_dataframe(&current_df, &config)?;
//! let backdata = backdata_from_dataframe(&previous_df, &config)?;
//! let mapping = sic_mapping_from_dataframe(&mapping_df, &config.columns)?;
//!
//! let output = Pipeline::builder()
//!     .config(config)
//!     .sic_mapping(mapping)
//!     .on_progress(|update| {
//!         println!("[{:.0}%] {}", update.progress * 100.0, update.message);
//!     })
//!     .build()?
//!     .process(records, Some(&backdata))?;
//!
//! println!("Imputed {} records", output.records.len());
//! ```
//!
//! # Configuration
//!
//! Use [`ImputationConfig`] to customize thresholds and the variable list.
//! The configuration also deserializes from partial JSON, with every missing
//! field taking its default:
//!
//! ```rust,ignore
//! use survey_imputation::config::*;
//!
//! let config = ImputationConfig::builder()
//!     .trim_threshold(10)                 // Trim only classes with >10 values
//!     .trim_percentiles(15, 15)           // Drop lowest and highest 15%
//!     .expansion_threshold(3)             // Class ratios need >3 responders
//!     .mor_min_pairs(5)                   // Link factors need 5 pairs
//!     .variables(vec![VariableGroup::new("211", &["202", "203"])])
//!     .back_infill(true)
//!     .build()?;
//! ```

pub mod classifier;
pub mod config;
pub mod error;
pub mod imputers;
pub mod pipeline;
pub mod reporting;
pub mod stats;
pub mod table;
pub mod types;
pub mod utils;

// Re-exports for convenient access
pub use classifier::{ClassKey, ImputationClass, classify, classify_all};
pub use config::{
    ApportionScope, ApportionedField, ApportionmentConfig, ColumnNames, CompositeTotal,
    ConfigValidationError, ImputationConfig, ImputationConfigBuilder, VariableGroup,
};
pub use error::{ImputationError, Result as ImputationResult, ResultExt};
pub use imputers::{
    Apportioner, Backdata, ClassMeans, DimensionBackfill, ExpansionRatios, LinkFactors,
    MeanOfRatiosImputer, MorOutcome, ShortFormExpander, SicMapping, TmiOutcome,
    TrimmedMeanImputer, ensure_unique_keys, recompute_composites,
};
pub use pipeline::{
    ClosureProgressReporter, ImputationExecutor, ImputationStage, Pipeline, PipelineBuilder,
    ProgressReporter, ProgressUpdate, ShortToLongHook,
};
pub use reporting::{ReportGenerator, RunSummary};
pub use table::{
    backdata_from_dataframe, link_qa_to_dataframe, records_from_dataframe, records_to_dataframe,
    sic_mapping_from_dataframe, trim_qa_to_dataframe,
};
pub use types::{
    CivilDefence, ExpansionSource, FormType, ImputationMarker, ImputationOutput, LinkFactorQaRow,
    Status, SurveyRecord, TrimQaRow,
};
