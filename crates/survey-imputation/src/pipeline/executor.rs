//! Imputation executor module.
//!
//! Contains the bookkeeping steps that surround the imputation stages: schema
//! checks, initial markers, set-aside and recombination, and the final commit.

use crate::config::ImputationConfig;
use crate::error::{ImputationError, Result};
use crate::imputers::recompute_composites;
use crate::types::{FormType, ImputationMarker, SurveyRecord};
use tracing::{debug, info};

/// Executes the non-statistical steps of a run.
pub struct ImputationExecutor;

impl ImputationExecutor {
    /// Every configured variable must be a field of at least one record.
    pub fn validate_schema(records: &[SurveyRecord], config: &ImputationConfig) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for name in config.carried_variables() {
            if !records.iter().any(|r| r.values.contains_key(name)) {
                return Err(ImputationError::UnknownVariable(name.to_string()));
            }
        }
        debug!("Schema check passed for {} variables", config.carried_variables().len());
        Ok(())
    }

    /// Assign the marker each record starts the run with.
    pub fn initial_marker(record: &SurveyRecord) -> ImputationMarker {
        if record.keeps_constructed_values() {
            ImputationMarker::Constructed
        } else if record.status.is_clear() {
            ImputationMarker::Responded
        } else {
            ImputationMarker::NoImputation
        }
    }

    /// Set initial markers and copy canonical values into working fields.
    pub fn prepare(mut records: Vec<SurveyRecord>) -> Vec<SurveyRecord> {
        for record in &mut records {
            record.marker = Self::initial_marker(record);
            record.expansion.clear();
            record.trimmed.clear();
            record.snapshot();
        }
        records
    }

    /// Whether a record is kept out of the imputation stages.
    pub fn is_set_aside(record: &SurveyRecord) -> bool {
        record.keeps_constructed_values() || record.manual_trim
    }

    /// Split records into (processed, set aside).
    pub fn set_aside(records: Vec<SurveyRecord>) -> (Vec<SurveyRecord>, Vec<SurveyRecord>) {
        let (aside, kept): (Vec<_>, Vec<_>) = records.into_iter().partition(Self::is_set_aside);
        info!(
            "Set aside {} constructed or manually trimmed records, {} remain",
            aside.len(),
            kept.len()
        );
        (kept, aside)
    }

    /// Constructed short-form records join the expansion stage so their known
    /// values are carried into the working fields. Force-flagged records were
    /// never set aside on constructed grounds and stay where they are.
    pub fn split_constructed_short_forms(
        aside: Vec<SurveyRecord>,
    ) -> (Vec<SurveyRecord>, Vec<SurveyRecord>) {
        aside
            .into_iter()
            .partition(|r| r.keeps_constructed_values() && r.form_type == FormType::Short)
    }

    /// Recompute composite totals for imputed long-form rows.
    pub fn recompute_imputed_totals(
        mut records: Vec<SurveyRecord>,
        config: &ImputationConfig,
    ) -> Vec<SurveyRecord> {
        let mut count = 0usize;
        for record in records
            .iter_mut()
            .filter(|r| r.form_type == FormType::Long && r.marker.is_imputed())
        {
            recompute_composites(record, &config.composite_totals);
            count += 1;
        }
        debug!("Recomputed composite totals on {} imputed long-form rows", count);
        records
    }

    /// Sort by (reference, instance) and replace canonical values with the
    /// working values.
    pub fn finalize(mut records: Vec<SurveyRecord>) -> Vec<SurveyRecord> {
        records.sort_by(|a, b| a.key().cmp(&b.key()).then(a.period.cmp(&b.period)));
        for record in &mut records {
            record.commit();
        }
        records
    }
}
