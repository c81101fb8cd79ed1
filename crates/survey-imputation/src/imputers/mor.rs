//! Carry-forward and mean-of-ratios imputation from prior-period returns.
//!
//! Unresolved long-form references that returned a clear form in the previous
//! period have their previous answers carried forward (`CF`). Carried values
//! are then scaled by a per-class link factor (`BI`): the mean growth ratio of
//! clear references answering in both periods, taken as current over previous
//! so that multiplying a carried value by it brings the value forward.

use crate::classifier::{ClassKey, ImputationClass, classify};
use crate::config::ImputationConfig;
use crate::error::{ImputationError, Result};
use crate::imputers::apportionment::Apportioner;
use crate::stats::{DonorFrame, GroupIds};
use crate::types::{FormType, ImputationMarker, LinkFactorQaRow, SurveyRecord};
use crate::utils::trim_flags;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Prior-period records, consumed read-only.
#[derive(Debug, Clone, Default)]
pub struct Backdata {
    records: Vec<SurveyRecord>,
}

impl Backdata {
    pub fn new(records: Vec<SurveyRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[SurveyRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Link factors keyed by class and variable.
#[derive(Debug, Clone, Default)]
pub struct LinkFactors {
    factors: BTreeMap<(ClassKey, String), f64>,
}

impl LinkFactors {
    /// Factor for a class and variable; 1.0 when none was derived.
    pub fn get(&self, class: &ImputationClass, variable: &str) -> f64 {
        class
            .key()
            .and_then(|key| self.factors.get(&(key.clone(), variable.to_string())))
            .copied()
            .unwrap_or(1.0)
    }

    pub fn len(&self) -> usize {
        self.factors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factors.is_empty()
    }
}

/// Result of the mean-of-ratios stage.
#[derive(Debug, Clone)]
pub struct MorOutcome {
    pub records: Vec<SurveyRecord>,
    pub link_qa: Vec<LinkFactorQaRow>,
}

/// Carry-forward and back-infill imputer.
pub struct MeanOfRatiosImputer;

impl MeanOfRatiosImputer {
    /// Run carry-forward and, when enabled, back-infill.
    ///
    /// Link factors are derived before the join, so a failing join still
    /// hands back the link-factor QA table on the error when QA is requested.
    pub fn impute(
        records: Vec<SurveyRecord>,
        backdata: &Backdata,
        config: &ImputationConfig,
    ) -> Result<MorOutcome> {
        let prepared = Self::prepare_backdata(backdata, config)?;
        info!(
            "Prepared {} clear backdata records from {}",
            prepared.len(),
            backdata.len()
        );

        let (link_factors, link_qa) = Self::link_factors(&records, &prepared, config)?;
        let records = match Self::carry_forward(records, &prepared, config) {
            Ok(records) => records,
            Err(e) if config.produce_qa => return Err(e.with_qa(Vec::new(), link_qa)),
            Err(e) => return Err(e),
        };
        let records = if config.back_infill {
            Self::back_infill(records, &link_factors, config)
        } else {
            records
        };

        Ok(MorOutcome { records, link_qa })
    }

    /// Strip the legacy prefix from a backdata field name when the remainder
    /// is a known field.
    pub fn normalize_field_name(name: &str, prefix: &str, known: &[&str]) -> String {
        if !prefix.is_empty()
            && let Some(stripped) = name.strip_prefix(prefix)
            && known.contains(&stripped)
        {
            return stripped.to_string();
        }
        name.to_string()
    }

    /// Normalize field names, apportion, and keep clear rows.
    pub fn prepare_backdata(
        backdata: &Backdata,
        config: &ImputationConfig,
    ) -> Result<Vec<SurveyRecord>> {
        if backdata.is_empty() {
            return Ok(Vec::new());
        }
        let known = config.required_numeric_fields();

        let normalized: Vec<SurveyRecord> = backdata
            .records()
            .iter()
            .cloned()
            .map(|mut record| {
                record.values = std::mem::take(&mut record.values)
                    .into_iter()
                    .map(|(name, value)| {
                        (
                            Self::normalize_field_name(&name, &config.backdata_prefix, &known),
                            value,
                        )
                    })
                    .collect();
                record
            })
            .collect();

        for target in config.target_variables() {
            if !normalized.iter().any(|r| r.values.contains_key(target)) {
                return Err(ImputationError::MissingField {
                    stage: "mean_of_ratios",
                    field: target.to_string(),
                });
            }
        }

        let apportioned = match &config.apportionment {
            Some(apportionment) => {
                Apportioner::apportion(normalized, apportionment, config.rounding_precision)?
            }
            None => normalized,
        };

        Ok(apportioned
            .into_iter()
            .filter(|r| r.status.is_clear())
            .collect())
    }

    /// Whether a record is selected for carry-forward.
    fn is_candidate(record: &SurveyRecord) -> bool {
        record.form_type == FormType::Long
            && record.status.is_unresolved()
            && record.marker == ImputationMarker::NoImputation
            && matches!(record.instance, None | Some(0))
    }

    /// Replace each unresolved candidate with its reference's backdata rows.
    pub fn carry_forward(
        records: Vec<SurveyRecord>,
        prepared: &[SurveyRecord],
        config: &ImputationConfig,
    ) -> Result<Vec<SurveyRecord>> {
        let mut by_reference: BTreeMap<i64, Vec<&SurveyRecord>> = BTreeMap::new();
        for record in prepared {
            by_reference.entry(record.reference).or_default().push(record);
        }
        for rows in by_reference.values_mut() {
            rows.sort_by_key(|r| r.instance);
        }

        let carried = config.carried_variables();
        let mut output = Vec::with_capacity(records.len());
        let mut carried_refs = 0usize;

        for record in records {
            let matches = if Self::is_candidate(&record) {
                by_reference.get(&record.reference)
            } else {
                None
            };
            let Some(previous_rows) = matches else {
                output.push(record);
                continue;
            };

            carried_refs += 1;
            for previous in previous_rows {
                let mut row = record.clone();
                row.instance = previous.instance;
                row.civil_or_defence = previous.civil_or_defence.or(record.civil_or_defence);
                row.product_group = previous
                    .product_group
                    .clone()
                    .or_else(|| record.product_group.clone());
                row.sic = record.sic.or(previous.sic);
                row.employees = record.employees.or(previous.employees);
                for name in &carried {
                    row.set_working(name, previous.value(name));
                    if !row.values.contains_key(*name) {
                        row.set_value(name, None);
                    }
                }
                row.marker = ImputationMarker::CarriedForward;
                output.push(row);
            }
        }

        ensure_unique_keys(&output, "carry-forward join")?;
        info!("Carried forward {} references from backdata", carried_refs);
        Ok(output)
    }

    /// Per (class, variable) link factors from references clear in both periods.
    ///
    /// Each pair contributes `current / previous`; pairs with a zero on either
    /// side are skipped. Classes with fewer than `mor_min_pairs` pairs, or
    /// whose ratios are all trimmed, default to 1.0.
    pub fn link_factors(
        records: &[SurveyRecord],
        prepared: &[SurveyRecord],
        config: &ImputationConfig,
    ) -> Result<(LinkFactors, Vec<LinkFactorQaRow>)> {
        let previous: HashMap<(i64, Option<i64>), &SurveyRecord> =
            prepared.iter().map(|r| (r.key(), r)).collect();
        let variables = config.carried_variables();

        let mut ratios: BTreeMap<(ClassKey, String), Vec<(f64, i64, Option<i64>)>> =
            BTreeMap::new();
        for record in records
            .iter()
            .filter(|r| r.status.is_clear() && !r.is_instance_zero())
        {
            let ImputationClass::Defined(key) = classify(record) else {
                continue;
            };
            let Some(prev) = previous.get(&record.key()) else {
                continue;
            };
            for name in &variables {
                if let (Some(current), Some(before)) = (record.working(name), prev.value(name))
                    && current != 0.0
                    && before != 0.0
                {
                    ratios
                        .entry((key.clone(), name.to_string()))
                        .or_default()
                        .push((current / before, record.reference, record.instance));
                }
            }
        }

        let mut ids = GroupIds::default();
        let mut donors = DonorFrame::default();
        for ((key, variable), pairs) in &mut ratios {
            pairs.sort_by(|a, b| {
                a.0.total_cmp(&b.0)
                    .then(a.1.cmp(&b.1))
                    .then(a.2.cmp(&b.2))
            });
            let values: Vec<f64> = pairs.iter().map(|p| p.0).collect();
            let flags = trim_flags(
                &values,
                config.trim_threshold,
                config.lower_trim_percent,
                config.upper_trim_percent,
            );
            let group = ids.id(key);
            for (value, trimmed) in values.iter().zip(&flags) {
                donors.push(group, variable, *value, *trimmed);
            }
        }
        let cells = donors.trimmed_means()?;

        let mut factors = LinkFactors::default();
        let mut qa = Vec::with_capacity(ratios.len());
        for (key, variable) in ratios.into_keys() {
            let cell = cells.get(&(ids.id(&key), variable.clone()));
            let pair_count = cell.map_or(0, |c| c.count);
            let factor = cell
                .filter(|c| c.count >= config.mor_min_pairs)
                .and_then(|c| c.mean);

            debug!(
                "Link factor {}/{}: {:?} from {} pairs",
                key, variable, factor, pair_count
            );
            qa.push(LinkFactorQaRow {
                class: key.to_string(),
                variable: variable.clone(),
                link_factor: factor.unwrap_or(1.0),
                pair_count,
                defaulted: factor.is_none(),
            });
            if let Some(factor) = factor {
                factors.factors.insert((key, variable), factor);
            }
        }

        Ok((factors, qa))
    }

    /// Scale carried-forward values by their link factors and re-mark `BI`.
    pub fn back_infill(
        mut records: Vec<SurveyRecord>,
        factors: &LinkFactors,
        config: &ImputationConfig,
    ) -> Vec<SurveyRecord> {
        let variables = config.carried_variables();
        let mut infilled = 0usize;
        for record in records
            .iter_mut()
            .filter(|r| r.marker == ImputationMarker::CarriedForward)
        {
            let class = classify(record);
            for name in &variables {
                if let Some(value) = record.working(name) {
                    record.set_working(name, Some(value * factors.get(&class, name)));
                }
            }
            record.marker = ImputationMarker::BackInfilled;
            infilled += 1;
        }
        if infilled > 0 && factors.is_empty() {
            warn!("No link factors derived; {} records back-infilled with 1.0", infilled);
        }
        records
    }
}

/// Fail when any (reference, instance) appears more than once. `stage` names
/// the check in the error.
pub fn ensure_unique_keys(records: &[SurveyRecord], stage: &'static str) -> Result<()> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert((record.period, record.reference, record.instance)) {
            return Err(ImputationError::duplicate(
                stage,
                record.reference,
                record.instance,
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariableGroup;
    use crate::types::{CivilDefence, Status};
    use approx::assert_relative_eq;

    const CURRENT: i64 = 202212;
    const PREVIOUS: i64 = 202112;

    fn config() -> ImputationConfig {
        ImputationConfig::builder()
            .variables(vec![VariableGroup::new("211", &["202"])])
            .composite_totals(vec![])
            .without_apportionment()
            .build()
            .unwrap()
    }

    fn current(reference: i64, instance: i64, status: Status, value: Option<f64>) -> SurveyRecord {
        let mut record = SurveyRecord::new(reference, Some(instance), CURRENT, FormType::Long, status)
            .with_dimensions(Some(CivilDefence::Civil), Some("AA"))
            .with_value("211", value)
            .with_value("202", None);
        record.marker = if record.status.is_clear() {
            ImputationMarker::Responded
        } else {
            ImputationMarker::NoImputation
        };
        record.snapshot();
        record
    }

    fn previous(reference: i64, instance: i64, value: f64) -> SurveyRecord {
        SurveyRecord::new(reference, Some(instance), PREVIOUS, FormType::Long, Status::Clear)
            .with_dimensions(Some(CivilDefence::Civil), Some("AA"))
            .with_value("q211", Some(value))
            .with_value("q202", Some(value / 2.0))
    }

    /// Clear pairs growing by `ratio` between the periods.
    fn growing_pairs(count: i64, ratio: f64) -> (Vec<SurveyRecord>, Vec<SurveyRecord>) {
        let current_rows = (0..count)
            .map(|i| current(2000 + i, 1, Status::Clear, Some(100.0 * ratio)))
            .collect();
        let previous_rows = (0..count).map(|i| previous(2000 + i, 1, 100.0)).collect();
        (current_rows, previous_rows)
    }

    #[test]
    fn test_normalize_field_name() {
        let known = ["211", "202"];
        assert_eq!(MeanOfRatiosImputer::normalize_field_name("q211", "q", &known), "211");
        assert_eq!(MeanOfRatiosImputer::normalize_field_name("211", "q", &known), "211");
        assert_eq!(MeanOfRatiosImputer::normalize_field_name("qx", "q", &known), "qx");
        assert_eq!(MeanOfRatiosImputer::normalize_field_name("q211", "", &known), "q211");
    }

    #[test]
    fn test_prepare_backdata_keeps_clear_rows() {
        let mut stale = previous(3, 1, 10.0);
        stale.status = Status::FormSentOut;
        let backdata = Backdata::new(vec![previous(1, 1, 10.0), stale]);

        let prepared = MeanOfRatiosImputer::prepare_backdata(&backdata, &config()).unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].value("211"), Some(10.0));
    }

    #[test]
    fn test_prepare_backdata_requires_targets() {
        let backdata = Backdata::new(vec![
            SurveyRecord::new(1, Some(1), PREVIOUS, FormType::Long, Status::Clear)
                .with_value("q999", Some(1.0)),
        ]);
        let err = MeanOfRatiosImputer::prepare_backdata(&backdata, &config()).unwrap_err();
        assert_eq!(err.error_code(), "MISSING_FIELD");
    }

    #[test]
    fn test_carry_forward_scenario() {
        let config = ImputationConfig::builder()
            .variables(vec![VariableGroup::new("211", &["202"])])
            .composite_totals(vec![])
            .without_apportionment()
            .back_infill(false)
            .build()
            .unwrap();
        let records = vec![current(1, 0, Status::FormSentOut, None)];
        let backdata = Backdata::new(vec![previous(1, 1, 500.0)]);

        let outcome = MeanOfRatiosImputer::impute(records, &backdata, &config).unwrap();
        let row = &outcome.records[0];
        assert_eq!(row.marker, ImputationMarker::CarriedForward);
        assert_eq!(row.instance, Some(1));
        assert_eq!(row.working("211"), Some(500.0));
        assert_eq!(row.working("202"), Some(250.0));
        assert_eq!(row.period, CURRENT);
    }

    #[test]
    fn test_back_infill_scenario() {
        let (mut records, mut backrows) = growing_pairs(12, 1.1);
        records.push(current(1, 0, Status::FormSentOut, None));
        backrows.push(previous(1, 1, 500.0));

        let outcome =
            MeanOfRatiosImputer::impute(records, &Backdata::new(backrows), &config()).unwrap();
        let row = outcome.records.iter().find(|r| r.reference == 1).unwrap();
        assert_eq!(row.marker, ImputationMarker::BackInfilled);
        assert_relative_eq!(row.working("211").unwrap(), 550.0, epsilon = 1e-9);

        let qa = outcome
            .link_qa
            .iter()
            .find(|q| q.variable == "211")
            .unwrap();
        assert_eq!(qa.class, "C_AA");
        assert_eq!(qa.pair_count, 12);
        assert!(!qa.defaulted);
        assert_relative_eq!(qa.link_factor, 1.1, epsilon = 1e-9);
    }

    #[test]
    fn test_link_factor_defaults_below_min_pairs() {
        let (records, backrows) = growing_pairs(4, 2.0);
        let prepared = backrows_prepared(backrows);
        let (factors, qa) = link_factors(&records, &prepared);

        let class = classify(&records[0]);
        assert_eq!(factors.get(&class, "211"), 1.0);
        assert!(qa.iter().all(|q| q.defaulted && q.link_factor == 1.0));
        assert_eq!(qa[0].pair_count, 4);
    }

    #[test]
    fn test_link_factor_ignores_zero_pairs() {
        let (mut records, backrows) = growing_pairs(5, 2.0);
        records[0].set_working("211", Some(0.0));
        let prepared = backrows_prepared(backrows);
        let (factors, _) = link_factors(&records, &prepared);
        assert_eq!(factors.get(&classify(&records[1]), "211"), 1.0);
    }

    #[test]
    fn test_link_factor_trims_extreme_ratios() {
        let (mut records, backrows) = growing_pairs(12, 1.0);
        records[0].set_working("211", Some(1000.0));
        records[1].set_working("211", Some(1.0));
        let prepared = backrows_prepared(backrows);
        let (factors, _) = link_factors(&records, &prepared);
        assert_relative_eq!(factors.get(&classify(&records[2]), "211"), 1.0);
    }

    #[test]
    fn test_unmatched_records_stay_unresolved() {
        let records = vec![current(7, 0, Status::CheckNeeded, None)];
        let backdata = Backdata::new(vec![previous(8, 1, 10.0)]);
        let outcome = MeanOfRatiosImputer::impute(records, &backdata, &config()).unwrap();
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].marker, ImputationMarker::NoImputation);
    }

    #[test]
    fn test_duplicate_after_join_is_fault() {
        let records = vec![
            current(1, 0, Status::FormSentOut, None),
            current(1, 1, Status::FormSentOut, None),
        ];
        let backdata = Backdata::new(vec![previous(1, 1, 500.0)]);
        let err = MeanOfRatiosImputer::impute(records, &backdata, &config()).unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_RECORD");
        assert!(err.to_string().contains("carry-forward join"));
        let (trim_qa, link_qa) = err.partial_qa().unwrap();
        assert!(trim_qa.is_empty());
        assert!(link_qa.is_empty());
    }

    #[test]
    fn test_link_factor_is_current_over_previous() {
        let mut records: Vec<SurveyRecord> = (0..5)
            .map(|i| current(2000 + i, 1, Status::Clear, Some(20.0)))
            .collect();
        let mut backrows: Vec<SurveyRecord> = (0..5).map(|i| previous(2000 + i, 1, 10.0)).collect();
        records.push(current(1, 0, Status::FormSentOut, None));
        backrows.push(previous(1, 1, 7.0));

        let outcome =
            MeanOfRatiosImputer::impute(records, &Backdata::new(backrows), &config()).unwrap();
        let qa = outcome
            .link_qa
            .iter()
            .find(|q| q.variable == "211")
            .unwrap();
        assert_relative_eq!(qa.link_factor, 2.0);
        assert_eq!(qa.pair_count, 5);

        let row = outcome.records.iter().find(|r| r.reference == 1).unwrap();
        assert_eq!(row.marker, ImputationMarker::BackInfilled);
        assert_relative_eq!(row.working("211").unwrap(), 14.0);
    }

    fn link_factors(
        records: &[SurveyRecord],
        prepared: &[SurveyRecord],
    ) -> (LinkFactors, Vec<LinkFactorQaRow>) {
        MeanOfRatiosImputer::link_factors(records, prepared, &config()).unwrap()
    }

    fn backrows_prepared(rows: Vec<SurveyRecord>) -> Vec<SurveyRecord> {
        MeanOfRatiosImputer::prepare_backdata(&Backdata::new(rows), &config()).unwrap()
    }
}
