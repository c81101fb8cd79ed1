//! Main imputation pipeline module.
//!
//! This module provides the core `Pipeline` struct and builder for
//! orchestrating a full imputation run.

use crate::config::{ConfigValidationError, ImputationConfig};
use crate::error::{ImputationError, Result};
use crate::imputers::{
    Apportioner, Backdata, MeanOfRatiosImputer, ShortFormExpander, SicMapping,
    TrimmedMeanImputer, ensure_unique_keys,
};
use crate::pipeline::ImputationExecutor;
use crate::pipeline::progress::{
    ClosureProgressReporter, ImputationStage, ProgressReporter, ProgressUpdate,
};
use crate::types::{ImputationOutput, LinkFactorQaRow, SurveyRecord, TrimQaRow};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Caller-supplied conversion applied after apportionment, before markers are
/// assigned. Identity when not set.
pub type ShortToLongHook =
    Arc<dyn Fn(Vec<SurveyRecord>) -> Result<Vec<SurveyRecord>> + Send + Sync>;

/// The main imputation pipeline.
///
/// Use [`Pipeline::builder()`] to create a new pipeline with custom configuration.
///
/// # Example
///
/// ```rust,ignore
/// use survey_imputation::{ImputationConfig, Pipeline, SicMapping};
///
/// let output = Pipeline::builder()
///     .config(ImputationConfig::default())
///     .sic_mapping(SicMapping::from_pairs([(2011, "AA")]))
///     .on_progress(|update| {
///         println!("[{:.0}%] {}", update.progress * 100.0, update.message);
///     })
///     .build()?
///     .process(records, Some(&backdata))?;
/// ```
pub struct Pipeline {
    config: ImputationConfig,
    sic_mapping: SicMapping,
    short_to_long: Option<ShortToLongHook>,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
}

// Pipelines are built on one thread and may run on another.
static_assertions::assert_impl_all!(Pipeline: Send, Sync);

impl Pipeline {
    /// Create a new pipeline builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn config(&self) -> &ImputationConfig {
        &self.config
    }

    /// Run every stage over one period's records.
    ///
    /// Carry-forward and back-infill run only when `backdata` is given. The
    /// run either completes or fails as a whole; when QA is requested, QA
    /// tables built before a failure are attached to the error (see
    /// [`ImputationError::partial_qa`]).
    pub fn process(
        &self,
        records: Vec<SurveyRecord>,
        backdata: Option<&Backdata>,
    ) -> Result<ImputationOutput> {
        match self.process_internal(records, backdata) {
            Ok(output) => {
                self.report_progress(
                    ProgressUpdate::complete("Imputation completed successfully")
                        .with_records(output.records.len()),
                );
                Ok(output)
            }
            Err(e) => {
                self.report_progress(ProgressUpdate::failed(e.to_string()));
                error!("Pipeline error: {}", e);
                Err(e)
            }
        }
    }

    /// Report progress if a reporter is configured.
    fn report_progress(&self, update: ProgressUpdate) {
        if let Some(reporter) = &self.progress_reporter {
            reporter.report(update);
        }
    }

    fn stage_done(&self, stage: ImputationStage, message: impl Into<String>, records: usize) {
        self.report_progress(ProgressUpdate::new(stage, 1.0, message).with_records(records));
    }

    /// Attach already built QA tables to a failure when QA is requested.
    fn keep_qa(
        &self,
        error: ImputationError,
        trim_qa: Vec<TrimQaRow>,
        link_qa: Vec<LinkFactorQaRow>,
    ) -> ImputationError {
        if self.config.produce_qa {
            error.with_qa(trim_qa, link_qa)
        } else {
            error
        }
    }

    fn process_internal(
        &self,
        records: Vec<SurveyRecord>,
        backdata: Option<&Backdata>,
    ) -> Result<ImputationOutput> {
        let start_time = Instant::now();
        let config = &self.config;
        info!("Starting imputation run over {} records", records.len());

        // Step 1: schema
        self.report_progress(ProgressUpdate::new(
            ImputationStage::Validation,
            0.0,
            "Validating configured variables...",
        ));
        ImputationExecutor::validate_schema(&records, config)?;
        ensure_unique_keys(&records, "input")?;
        self.stage_done(ImputationStage::Validation, "Schema valid", records.len());

        // Step 2: apportionment
        let records = match &config.apportionment {
            Some(apportionment) => {
                info!("Step 2: Apportioning '{}'", apportionment.measure);
                Apportioner::apportion(records, apportionment, config.rounding_precision)?
            }
            None => {
                info!("Step 2: Skipping apportionment (not configured)");
                records
            }
        };
        self.stage_done(ImputationStage::Apportionment, "Apportionment complete", records.len());

        // Step 3: conversion hook, markers, set-aside, snapshot
        let records = match &self.short_to_long {
            Some(hook) => hook(records)?,
            None => records,
        };
        let records = ImputationExecutor::prepare(records);
        let (records, aside) = ImputationExecutor::set_aside(records);
        self.stage_done(ImputationStage::Preparation, "Records prepared", records.len());

        // Step 4: carry-forward and back-infill
        let (records, link_qa) = match backdata {
            Some(backdata) if !backdata.is_empty() => {
                info!("Step 4: Carry-forward from {} backdata records", backdata.len());
                let outcome = MeanOfRatiosImputer::impute(records, backdata, config)?;
                (outcome.records, outcome.link_qa)
            }
            _ => {
                warn!("Step 4: No backdata supplied, skipping carry-forward");
                (records, Vec::new())
            }
        };
        self.stage_done(ImputationStage::MeanOfRatios, "Carry-forward complete", records.len());

        // Step 5: trimmed mean
        info!("Step 5: Trimmed-mean imputation");
        let outcome = match TrimmedMeanImputer::impute(records, &self.sic_mapping, config) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.keep_qa(e, Vec::new(), link_qa)),
        };
        let trim_qa = outcome.trim_qa;
        self.stage_done(
            ImputationStage::TrimmedMean,
            "Trimmed-mean imputation complete",
            outcome.records.len(),
        );

        // Steps 6 and 7: expansion, recombination and commit
        let records = match self.expand_and_commit(outcome.records, aside) {
            Ok(records) => records,
            Err(e) => return Err(self.keep_qa(e, trim_qa, link_qa)),
        };

        info!(
            "Imputation finished: {} records in {:.2?}",
            records.len(),
            start_time.elapsed()
        );

        let (trim_qa, link_qa) = if config.produce_qa {
            (trim_qa, link_qa)
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(ImputationOutput {
            records,
            trim_qa,
            link_qa,
        })
    }

    fn expand_and_commit(
        &self,
        records: Vec<SurveyRecord>,
        aside: Vec<SurveyRecord>,
    ) -> Result<Vec<SurveyRecord>> {
        let config = &self.config;

        info!("Step 6: Short-form expansion");
        let (constructed_short, aside) = ImputationExecutor::split_constructed_short_forms(aside);
        let mut records = records;
        records.extend(constructed_short);
        let mut records = ShortFormExpander::expand(records, config)?;
        self.stage_done(ImputationStage::Expansion, "Expansion complete", records.len());

        info!("Step 7: Recombining {} set-aside records", aside.len());
        records.extend(aside);
        ensure_unique_keys(&records, "recombination")?;
        let records = ImputationExecutor::recompute_imputed_totals(records, config);
        let records = ImputationExecutor::finalize(records);
        self.stage_done(ImputationStage::Finalizing, "Records committed", records.len());
        Ok(records)
    }
}

/// Builder for creating a [`Pipeline`] instance.
///
/// Use [`Pipeline::builder()`] to get started.
#[derive(Default)]
pub struct PipelineBuilder {
    config: Option<ImputationConfig>,
    sic_mapping: Option<SicMapping>,
    short_to_long: Option<ShortToLongHook>,
    progress_reporter: Option<Arc<dyn ProgressReporter>>,
}

static_assertions::assert_impl_all!(PipelineBuilder: Send);

impl PipelineBuilder {
    /// Set the run configuration.
    pub fn config(mut self, config: ImputationConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the SIC to product-group mapping used to back-fill product groups.
    pub fn sic_mapping(mut self, mapping: SicMapping) -> Self {
        self.sic_mapping = Some(mapping);
        self
    }

    /// Set the short-to-long conversion applied after apportionment.
    pub fn short_to_long<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<SurveyRecord>) -> Result<Vec<SurveyRecord>> + Send + Sync + 'static,
    {
        self.short_to_long = Some(Arc::new(hook));
        self
    }

    /// Set a progress reporter for receiving updates during processing.
    pub fn progress_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.progress_reporter = Some(reporter);
        self
    }

    /// Set a progress callback closure.
    ///
    /// For more complex scenarios, use [`progress_reporter`](Self::progress_reporter).
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress_reporter = Some(Arc::new(ClosureProgressReporter::new(callback)));
        self
    }

    /// Build the pipeline.
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> std::result::Result<Pipeline, ConfigValidationError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        Ok(Pipeline {
            config,
            sic_mapping: self.sic_mapping.unwrap_or_default(),
            short_to_long: self.short_to_long,
            progress_reporter: self.progress_reporter,
        })
    }
}
