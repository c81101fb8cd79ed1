//! Short-form expansion.
//!
//! Short-form returns report only master values. Their breakdowns are
//! estimated by scaling the master with the breakdown/master ratio observed on
//! long-form responders: first across everyone sharing the civil/defence
//! indicator, then, where a class has enough responders of its own, across the
//! class.

use crate::classifier::{ClassKey, classify};
use crate::config::ImputationConfig;
use crate::error::Result;
use crate::imputers::composites::recompute_composites;
use crate::stats::{GroupIds, group_sums};
use crate::types::{CivilDefence, ExpansionSource, FormType, ImputationMarker, SurveyRecord};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Summed donor values of one ratio group.
#[derive(Debug, Clone, Copy, Default)]
struct RatioSums {
    master: f64,
    breakdown: f64,
    nonzero_masters: usize,
}

impl RatioSums {
    /// Sums in the column order used by [`ShortFormExpander::sum_by`].
    fn from_sums(sums: &[f64]) -> Self {
        match *sums {
            [master, breakdown, nonzero] => Self {
                master,
                breakdown,
                nonzero_masters: nonzero as usize,
            },
            _ => Self::default(),
        }
    }

    /// `None` when the master sum is zero.
    fn ratio(&self) -> Option<f64> {
        (self.master != 0.0).then(|| self.breakdown / self.master)
    }
}

/// Breakdown ratios for one (master, breakdown) pair.
#[derive(Debug, Clone, Default)]
pub struct ExpansionRatios {
    coarse: BTreeMap<CivilDefence, RatioSums>,
    fine: BTreeMap<ClassKey, RatioSums>,
}

impl ExpansionRatios {
    /// Ratio across every responder sharing the civil/defence indicator.
    pub fn coarse(&self, civil_or_defence: CivilDefence) -> Option<f64> {
        self.coarse.get(&civil_or_defence).and_then(RatioSums::ratio)
    }

    /// Ratio within a class, if it has more than `threshold` responders with a
    /// non-zero master.
    pub fn fine(&self, key: &ClassKey, threshold: usize) -> Option<f64> {
        self.fine
            .get(key)
            .filter(|sums| sums.nonzero_masters > threshold)
            .and_then(RatioSums::ratio)
    }
}

/// Breakdown estimator for short-form records.
pub struct ShortFormExpander;

impl ShortFormExpander {
    /// Whether a record's breakdowns are estimated from its master value.
    pub fn is_expandable(record: &SurveyRecord, master: &str) -> bool {
        record.form_type == FormType::Short
            && !record.keeps_constructed_values()
            && !record.is_instance_zero()
            && matches!(
                record.marker,
                ImputationMarker::Responded
                    | ImputationMarker::TrimmedMean
                    | ImputationMarker::CarriedForward
                    | ImputationMarker::BackInfilled
            )
            && record.working(master).is_some()
    }

    /// Collect the ratio sums for one (master, breakdown) pair.
    ///
    /// Donors are clear long-form responders with both values present that
    /// were not trimmed from the master's class mean.
    pub fn ratios(
        records: &[SurveyRecord],
        master: &str,
        breakdown: &str,
    ) -> Result<ExpansionRatios> {
        let donors: Vec<(&SurveyRecord, f64, f64)> = records
            .iter()
            .filter(|r| {
                r.status.is_clear()
                    && r.form_type == FormType::Long
                    && !r.is_instance_zero()
                    && !r.trimmed.contains(master)
            })
            .filter_map(|r| Some((r, r.working(master)?, r.working(breakdown)?)))
            .collect();

        Ok(ExpansionRatios {
            coarse: Self::sum_by(&donors, |r| r.civil_or_defence)?,
            fine: Self::sum_by(&donors, |r| r.class.key().cloned())?,
        })
    }

    /// Master sum, breakdown sum and non-zero master count per group.
    fn sum_by<K: Ord + Clone>(
        donors: &[(&SurveyRecord, f64, f64)],
        key: impl Fn(&SurveyRecord) -> Option<K>,
    ) -> Result<BTreeMap<K, RatioSums>> {
        let mut ids = GroupIds::default();
        let mut groups = Vec::with_capacity(donors.len());
        let mut masters = Vec::with_capacity(donors.len());
        let mut breakdowns = Vec::with_capacity(donors.len());
        let mut nonzero = Vec::with_capacity(donors.len());
        for (record, master, breakdown) in donors {
            let Some(group) = key(*record) else {
                continue;
            };
            groups.push(ids.id(&group));
            masters.push(*master);
            breakdowns.push(*breakdown);
            nonzero.push(if *master != 0.0 { 1.0 } else { 0.0 });
        }

        let sums = group_sums(
            groups,
            vec![
                ("master", masters),
                ("breakdown", breakdowns),
                ("nonzero", nonzero),
            ],
        )?;
        Ok(sums
            .into_iter()
            .filter_map(|(id, sums)| {
                ids.key(id)
                    .map(|group| (group.clone(), RatioSums::from_sums(&sums)))
            })
            .collect())
    }

    /// Estimate short-form breakdowns and recompute their composite totals.
    pub fn expand(
        mut records: Vec<SurveyRecord>,
        config: &ImputationConfig,
    ) -> Result<Vec<SurveyRecord>> {
        let constructed = Self::copy_constructed(&mut records, config);

        let mut coarse_count = 0usize;
        let mut fine_count = 0usize;
        for group in &config.variables {
            let master = group.master.as_str();
            let expandable: Vec<usize> = records
                .iter()
                .enumerate()
                .filter(|(_, r)| Self::is_expandable(r, master))
                .map(|(i, _)| i)
                .collect();
            if expandable.is_empty() {
                continue;
            }

            for breakdown in &group.breakdowns {
                let ratios = Self::ratios(&records, master, breakdown)?;
                for &idx in &expandable {
                    let record = &mut records[idx];
                    let master_value = record.working(master);
                    let fine = record
                        .class
                        .key()
                        .and_then(|key| ratios.fine(key, config.expansion_threshold));
                    let coarse = record.civil_or_defence.and_then(|cd| ratios.coarse(cd));

                    let (estimate, source) = match (fine, coarse) {
                        (Some(ratio), _) => (Some(ratio), Some(ExpansionSource::ImpClassGroup)),
                        (None, Some(ratio)) => {
                            (Some(ratio), Some(ExpansionSource::CivilDefenceFallback))
                        }
                        (None, None) => (None, None),
                    };
                    record.set_working(breakdown, master_value.zip(estimate).map(|(m, r)| m * r));
                    match source {
                        Some(source) => {
                            if source == ExpansionSource::ImpClassGroup {
                                fine_count += 1;
                            } else {
                                coarse_count += 1;
                            }
                            record.expansion.insert(breakdown.clone(), source);
                        }
                        None => {
                            record.expansion.remove(breakdown);
                        }
                    }
                }
                debug!(
                    "Expanded {} from {} on {} short-form records",
                    breakdown,
                    master,
                    expandable.len()
                );
            }
        }

        for record in records
            .iter_mut()
            .filter(|r| r.form_type == FormType::Short)
        {
            recompute_composites(record, &config.composite_totals);
        }

        info!(
            "Short-form expansion: {} class ratios, {} civil/defence ratios, {} constructed",
            fine_count, coarse_count, constructed
        );
        Ok(records)
    }

    /// Constructed short-form records keep their known values and get a class
    /// from whatever dimensions they carry.
    fn copy_constructed(records: &mut [SurveyRecord], config: &ImputationConfig) -> usize {
        let breakdowns = config.breakdown_variables();
        let mut count = 0usize;
        for record in records
            .iter_mut()
            .filter(|r| r.form_type == FormType::Short && r.keeps_constructed_values())
        {
            for (name, value) in record.values.clone() {
                if value.is_some() {
                    record.set_working(&name, value);
                    if breakdowns.contains(&name.as_str()) {
                        record.expansion.insert(name, ExpansionSource::Constructed);
                    }
                }
            }
            record.class = classify(record);
            count += 1;
        }
        count
    }
}
