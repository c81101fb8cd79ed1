//! Trimmed-mean imputation.
//!
//! Records still unresolved after carry-forward take the mean of the clear
//! responders in their imputation class. Extreme responders are trimmed from
//! the mean once a class has enough non-zero values.

use crate::classifier::{ClassKey, ImputationClass, classify_all};
use crate::config::ImputationConfig;
use crate::error::Result;
use crate::imputers::backfill::{DimensionBackfill, SicMapping};
use crate::stats::{DonorFrame, GroupIds};
use crate::types::{FormType, ImputationMarker, SurveyRecord, TrimQaRow};
use crate::utils::trim_flags;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Trimmed means per (class, variable), plus the classes that had responders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassMeans {
    means: BTreeMap<(ClassKey, String), f64>,
    responders: BTreeSet<ClassKey>,
}

impl ClassMeans {
    pub fn get(&self, key: &ClassKey, variable: &str) -> Option<f64> {
        self.means.get(&(key.clone(), variable.to_string())).copied()
    }

    /// Whether the class had at least one clear responder.
    pub fn has_responders(&self, key: &ClassKey) -> bool {
        self.responders.contains(key)
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    pub fn is_empty(&self) -> bool {
        self.means.is_empty()
    }
}

/// Result of the trimmed-mean stage.
#[derive(Debug, Clone)]
pub struct TmiOutcome {
    pub records: Vec<SurveyRecord>,
    pub trim_qa: Vec<TrimQaRow>,
}

/// Class-mean imputer for records carry-forward could not resolve.
pub struct TrimmedMeanImputer;

impl TrimmedMeanImputer {
    /// Run the whole stage: no-R&D zeroing, dimension back-fill,
    /// classification, class means and application.
    pub fn impute(
        records: Vec<SurveyRecord>,
        mapping: &SicMapping,
        config: &ImputationConfig,
    ) -> Result<TmiOutcome> {
        let records = Self::zero_no_rd(records, config);
        let records = DimensionBackfill::backfill_product_groups(records, mapping);
        let records = DimensionBackfill::backfill_civil_defence(records);
        let records = classify_all(records);

        let (records, means, trim_qa) = Self::class_means(records, config)?;
        info!(
            "Computed {} class means ({} trimming decisions)",
            means.len(),
            trim_qa.len()
        );

        let records = Self::apply(records, &means, config);
        Ok(TmiOutcome { records, trim_qa })
    }

    /// Clear no-R&D returns report zero for every unanswered variable.
    pub fn zero_no_rd(mut records: Vec<SurveyRecord>, config: &ImputationConfig) -> Vec<SurveyRecord> {
        let variables = config.imputed_variables();
        for record in records
            .iter_mut()
            .filter(|r| r.is_no_rd() && r.status.is_clear() && !r.is_instance_zero())
        {
            for name in &variables {
                if record.working(name).is_none() {
                    record.set_working(name, Some(0.0));
                }
            }
        }
        records
    }

    /// Whether `record` donates to the mean of `variable`.
    fn is_donor(record: &SurveyRecord, variable: &str, config: &ImputationConfig) -> bool {
        record.status.is_clear()
            && !record.is_instance_zero()
            && record.class.is_defined()
            && record.working(variable).is_some()
            && (record.form_type == FormType::Long || !config.is_breakdown(variable))
    }

    /// Trimming order: value ascending, then larger businesses first, then key.
    fn trim_order(a: &SurveyRecord, b: &SurveyRecord, variable: &str) -> Ordering {
        let value = |r: &SurveyRecord| r.working(variable).unwrap_or(0.0);
        let employees = |r: &SurveyRecord| r.employees.unwrap_or(f64::NEG_INFINITY);
        value(a)
            .total_cmp(&value(b))
            .then_with(|| employees(b).total_cmp(&employees(a)))
            .then_with(|| a.key().cmp(&b.key()))
    }

    /// Compute the trimmed mean of every (class, variable) and flag trimmed
    /// donors on their records.
    ///
    /// Trimming positions follow [`Self::trim_order`]; the means themselves
    /// are aggregated over the untrimmed donors in one grouped pass.
    pub fn class_means(
        mut records: Vec<SurveyRecord>,
        config: &ImputationConfig,
    ) -> Result<(Vec<SurveyRecord>, ClassMeans, Vec<TrimQaRow>)> {
        let mut means = ClassMeans::default();
        let mut trim_qa = Vec::new();

        for record in &mut records {
            record.trimmed.clear();
            if record.status.is_clear()
                && !record.is_instance_zero()
                && let ImputationClass::Defined(key) = &record.class
            {
                means.responders.insert(key.clone());
            }
        }

        let mut ids = GroupIds::default();
        let mut donors = DonorFrame::default();
        for variable in config.imputed_variables() {
            let mut classes: BTreeMap<ClassKey, Vec<usize>> = BTreeMap::new();
            for (idx, record) in records.iter().enumerate() {
                if Self::is_donor(record, variable, config)
                    && let Some(key) = record.class.key()
                {
                    classes.entry(key.clone()).or_default().push(idx);
                }
            }

            for (key, mut members) in classes {
                members.sort_by(|&a, &b| Self::trim_order(&records[a], &records[b], variable));
                let values: Vec<f64> = members
                    .iter()
                    .map(|&i| records[i].working(variable).unwrap_or(0.0))
                    .collect();
                let flags = trim_flags(
                    &values,
                    config.trim_threshold,
                    config.lower_trim_percent,
                    config.upper_trim_percent,
                );

                let group = ids.id(&key);
                let label = key.to_string();
                for ((&idx, value), trimmed) in members.iter().zip(&values).zip(&flags) {
                    if *trimmed {
                        records[idx].trimmed.insert(variable.to_string());
                    }
                    donors.push(group, variable, *value, *trimmed);
                    trim_qa.push(TrimQaRow {
                        reference: records[idx].reference,
                        instance: records[idx].instance,
                        class: label.clone(),
                        variable: variable.to_string(),
                        value: *value,
                        trimmed: *trimmed,
                    });
                }
                debug!(
                    "Class {} variable {}: {} donors, {} trimmed",
                    label,
                    variable,
                    members.len(),
                    flags.iter().filter(|t| **t).count()
                );
            }
        }

        for ((group, variable), cell) in donors.trimmed_means()? {
            if let (Some(key), Some(mean)) = (ids.key(group), cell.mean) {
                means.means.insert((key.clone(), variable), mean);
            }
        }

        Ok((records, means, trim_qa))
    }

    /// Write class means into unresolved records.
    ///
    /// Long-form records take means for masters and breakdowns, short-form
    /// records for masters only. A class with no clear responders, or with no
    /// mean for any of the record's variables, marks its records "No mean
    /// found" and leaves their values alone. A long-form breakdown whose class
    /// has no long-form donors keeps its missing value under the TMI marker.
    pub fn apply(
        mut records: Vec<SurveyRecord>,
        means: &ClassMeans,
        config: &ImputationConfig,
    ) -> Vec<SurveyRecord> {
        let long_vars = config.imputed_variables();
        let short_vars = config.target_variables();
        let mut imputed = 0usize;
        let mut no_mean = 0usize;
        let mut partial = 0usize;

        for record in records.iter_mut().filter(|r| {
            r.marker == ImputationMarker::NoImputation && !r.is_instance_zero()
        }) {
            let Some(key) = record.class.key().cloned() else {
                continue;
            };
            let variables = match record.form_type {
                FormType::Long => &long_vars,
                FormType::Short => &short_vars,
            };
            let found: Vec<(&str, f64)> = variables
                .iter()
                .filter_map(|name| means.get(&key, name).map(|mean| (*name, mean)))
                .collect();
            if !means.has_responders(&key) || found.is_empty() {
                record.marker = ImputationMarker::NoMeanFound;
                no_mean += 1;
                continue;
            }
            if found.len() < variables.len() {
                partial += 1;
            }
            for (name, mean) in found {
                record.set_working(name, Some(mean));
            }
            record.marker = ImputationMarker::TrimmedMean;
            imputed += 1;
        }

        if no_mean > 0 {
            warn!("{} records had no class mean to impute from", no_mean);
        }
        if partial > 0 {
            warn!(
                "{} imputed records kept variables without a class mean",
                partial
            );
        }
        info!("Trimmed-mean imputation filled {} records", imputed);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariableGroup;
    use crate::types::{CivilDefence, Status};
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    fn config() -> ImputationConfig {
        ImputationConfig::builder()
            .variables(vec![VariableGroup::new("211", &["202"])])
            .composite_totals(vec![])
            .without_apportionment()
            .build()
            .unwrap()
    }

    fn record(
        reference: i64,
        status: Status,
        form_type: FormType,
        pg: Option<&str>,
        value: Option<f64>,
    ) -> SurveyRecord {
        let mut record = SurveyRecord::new(reference, Some(1), 202212, form_type, status)
            .with_dimensions(Some(CivilDefence::Civil), pg)
            .with_value("211", value)
            .with_value("202", value.map(|v| v / 2.0));
        record.marker = if record.status.is_clear() {
            ImputationMarker::Responded
        } else {
            ImputationMarker::NoImputation
        };
        record.snapshot();
        record
    }

    fn run(records: Vec<SurveyRecord>) -> TmiOutcome {
        TrimmedMeanImputer::impute(records, &SicMapping::default(), &config()).unwrap()
    }

    fn responder(reference: i64, value: f64) -> SurveyRecord {
        record(reference, Status::Clear, FormType::Long, Some("AA"), Some(value))
    }

    fn pending(reference: i64, form_type: FormType) -> SurveyRecord {
        record(reference, Status::FormSentOut, form_type, Some("AA"), None)
    }

    #[test]
    fn test_twenty_responders_trim_three_each_side() {
        let mut records: Vec<SurveyRecord> = (1..=20).map(|i| responder(i, i as f64)).collect();
        records.push(pending(100, FormType::Long));

        let outcome = run(records);
        let trimmed: Vec<i64> = outcome
            .trim_qa
            .iter()
            .filter(|row| row.variable == "211" && row.trimmed)
            .map(|row| row.reference)
            .collect();
        assert_eq!(trimmed, vec![1, 2, 3, 18, 19, 20]);

        let target = outcome.records.iter().find(|r| r.reference == 100).unwrap();
        assert_eq!(target.marker, ImputationMarker::TrimmedMean);
        assert_relative_eq!(target.working("211").unwrap(), 10.5);
        assert_relative_eq!(target.working("202").unwrap(), 5.25);
        assert!(outcome.records[0].trimmed.contains("211"));
    }

    #[test]
    fn test_small_class_is_not_trimmed() {
        let mut records: Vec<SurveyRecord> = (1..=4).map(|i| responder(i, i as f64)).collect();
        records.push(pending(100, FormType::Long));

        let outcome = run(records);
        assert!(outcome.trim_qa.iter().all(|row| !row.trimmed));
        let target = outcome.records.iter().find(|r| r.reference == 100).unwrap();
        assert_relative_eq!(target.working("211").unwrap(), 2.5);
    }

    #[test]
    fn test_ties_trim_larger_businesses_first() {
        let mut records: Vec<SurveyRecord> = (1..=11).map(|i| responder(i, 5.0)).collect();
        for (i, record) in records.iter_mut().enumerate() {
            record.employees = Some(i as f64);
        }

        let (records, _, _) =
            TrimmedMeanImputer::class_means(classify_all(records), &config()).unwrap();
        let trimmed: Vec<i64> = records
            .iter()
            .filter(|r| r.trimmed.contains("211"))
            .map(|r| r.reference)
            .collect();
        // 15% of 11 rounds to 2: the two largest at the low end, two smallest at the top.
        assert_eq!(trimmed, vec![1, 2, 10, 11]);
    }

    #[test]
    fn test_class_means_are_idempotent() {
        let records: Vec<SurveyRecord> =
            classify_all((1..=15).map(|i| responder(i, (i * 7 % 13) as f64)).collect());
        let (first_records, first, first_qa) =
            TrimmedMeanImputer::class_means(records, &config()).unwrap();
        let (_, second, second_qa) =
            TrimmedMeanImputer::class_means(first_records, &config()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first_qa, second_qa);
    }

    #[test]
    fn test_short_form_takes_masters_only() {
        let mut records: Vec<SurveyRecord> = (1..=3).map(|i| responder(i, 10.0)).collect();
        records.push(pending(100, FormType::Short));

        let outcome = run(records);
        let target = outcome.records.iter().find(|r| r.reference == 100).unwrap();
        assert_eq!(target.working("211"), Some(10.0));
        assert_eq!(target.working("202"), None);
    }

    #[test]
    fn test_short_form_responders_skip_breakdown_means() {
        let mut records = vec![responder(1, 10.0)];
        records.push(record(2, Status::Clear, FormType::Short, Some("AA"), Some(30.0)));
        records.push(pending(100, FormType::Long));

        let outcome = run(records);
        let target = outcome.records.iter().find(|r| r.reference == 100).unwrap();
        assert_eq!(target.working("211"), Some(20.0));
        assert_eq!(target.working("202"), Some(5.0));
    }

    #[test]
    fn test_class_without_responders_has_no_mean() {
        let records = vec![
            responder(1, 10.0),
            record(100, Status::FormSentOut, FormType::Long, Some("ZZ"), None),
        ];
        let outcome = run(records);
        let target = outcome.records.iter().find(|r| r.reference == 100).unwrap();
        assert_eq!(target.marker, ImputationMarker::NoMeanFound);
        assert_eq!(target.working("211"), None);
    }

    #[test]
    fn test_undefined_class_is_left_alone() {
        let records = vec![
            responder(1, 10.0),
            record(100, Status::FormSentOut, FormType::Long, None, None),
        ];
        let outcome = run(records);
        let target = outcome.records.iter().find(|r| r.reference == 100).unwrap();
        assert_eq!(target.class, ImputationClass::Undefined);
        assert_eq!(target.marker, ImputationMarker::NoImputation);
    }

    #[test]
    fn test_no_rd_returns_donate_zeros() {
        let mut no_rd = record(2, Status::Clear, FormType::Long, Some("AA"), None);
        no_rd.rd_activity = Some(false);
        let records = vec![responder(1, 10.0), no_rd, pending(100, FormType::Long)];

        let outcome = run(records);
        let target = outcome.records.iter().find(|r| r.reference == 100).unwrap();
        assert_eq!(target.working("211"), Some(5.0));
    }

    #[test]
    fn test_long_form_breakdown_without_long_donors_stays_missing() {
        let records = vec![
            record(1, Status::Clear, FormType::Short, Some("AA"), Some(30.0)),
            pending(100, FormType::Long),
        ];
        let outcome = run(records);
        let target = outcome.records.iter().find(|r| r.reference == 100).unwrap();
        assert_eq!(target.marker, ImputationMarker::TrimmedMean);
        assert_eq!(target.working("211"), Some(30.0));
        assert_eq!(target.working("202"), None);
    }

    #[test]
    fn test_fully_trimmed_class_has_no_mean() {
        let config = ImputationConfig::builder()
            .variables(vec![VariableGroup::new("211", &[])])
            .composite_totals(vec![])
            .without_apportionment()
            .trim_threshold(0)
            .trim_percentiles(49, 49)
            .build()
            .unwrap();
        let means = ClassMeans {
            means: BTreeMap::new(),
            responders: [ClassKey {
                civil_or_defence: CivilDefence::Civil,
                product_group: "AA".to_string(),
                reference_list: false,
            }]
            .into_iter()
            .collect(),
        };
        let target = classify_all(vec![pending(100, FormType::Long)]);

        let result = TrimmedMeanImputer::apply(target, &means, &config);
        assert_eq!(result[0].marker, ImputationMarker::NoMeanFound);
        assert_eq!(result[0].working("211"), None);
    }

    #[test]
    fn test_two_donors_keep_one_untrimmed() {
        let config = ImputationConfig::builder()
            .variables(vec![VariableGroup::new("211", &[])])
            .composite_totals(vec![])
            .without_apportionment()
            .trim_threshold(0)
            .trim_percentiles(49, 49)
            .build()
            .unwrap();
        let mut records = vec![responder(1, 4.0), responder(2, 8.0)];
        records.push(pending(100, FormType::Long));

        let outcome = TrimmedMeanImputer::impute(records, &SicMapping::default(), &config).unwrap();
        assert_eq!(outcome.trim_qa.iter().filter(|row| row.trimmed).count(), 1);
        let target = outcome.records.iter().find(|r| r.reference == 100).unwrap();
        assert_eq!(target.marker, ImputationMarker::TrimmedMean);
        assert_eq!(target.working("211"), Some(8.0));
    }
}
