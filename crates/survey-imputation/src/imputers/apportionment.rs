//! Apportionment of reference-level values across instances.
//!
//! On the long form some answers (employment, headcount) are given once, at
//! instance 0, while the expenditure measure is given per instance. The
//! instance-0 value is spread over the other instances in proportion to the
//! measure. A group whose measure total is zero or negative has no shares at
//! all, so every apportioned value in it stays undefined.

use crate::config::{ApportionScope, ApportionmentConfig};
use crate::error::{ImputationError, Result};
use crate::types::{FormType, SurveyRecord};
use crate::utils::round_to;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Spreads instance-0 values over sibling instances.
pub struct Apportioner;

impl Apportioner {
    /// Shares of each measure in the total of the present measures.
    ///
    /// Returns `None` for every entry when the total is not positive, and for
    /// entries whose own measure is missing.
    pub fn shares(measures: &[Option<f64>], precision: u32) -> Vec<Option<f64>> {
        let total: f64 = measures.iter().flatten().sum();
        if total <= 0.0 {
            return vec![None; measures.len()];
        }
        measures
            .iter()
            .map(|m| m.map(|m| round_to(m / total, precision)))
            .collect()
    }

    /// Apportion the configured fields of every long-form reference.
    pub fn apportion(
        mut records: Vec<SurveyRecord>,
        config: &ApportionmentConfig,
        precision: u32,
    ) -> Result<Vec<SurveyRecord>> {
        if records.is_empty() {
            return Ok(records);
        }
        Self::require_field(&records, &config.measure)?;
        for field in &config.fields {
            Self::require_field(&records, &field.name)?;
        }

        let mut groups: BTreeMap<(i64, i64), Vec<usize>> = BTreeMap::new();
        for (idx, record) in records.iter().enumerate() {
            groups
                .entry((record.period, record.reference))
                .or_default()
                .push(idx);
        }

        let mut updates: Vec<(usize, String, Option<f64>)> = Vec::new();
        let mut apportioned_refs = 0usize;

        for ((_, reference), members) in &groups {
            let Some(&zero_idx) = members.iter().find(|&&i| records[i].is_instance_zero()) else {
                continue;
            };
            if records[zero_idx].form_type != FormType::Long {
                continue;
            }
            let siblings: Vec<usize> = members
                .iter()
                .copied()
                .filter(|&i| !records[i].is_instance_zero())
                .collect();
            if siblings.is_empty() {
                continue;
            }
            apportioned_refs += 1;

            for field in &config.fields {
                let source = records[zero_idx].value(&field.name);
                let shares = match field.scope {
                    ApportionScope::Reference => {
                        let measures: Vec<Option<f64>> = siblings
                            .iter()
                            .map(|&i| records[i].value(&config.measure))
                            .collect();
                        Self::shares(&measures, precision)
                    }
                    ApportionScope::ReferenceCivilDefence => {
                        Self::civil_defence_shares(&records, &siblings, &config.measure, precision)
                    }
                };

                for (&idx, share) in siblings.iter().zip(shares) {
                    let value = match (source, share) {
                        (Some(source), Some(share)) => Some(source * share),
                        _ => None,
                    };
                    updates.push((idx, field.name.clone(), value));
                }
            }
            debug!("Apportioned reference {} over {} instances", reference, siblings.len());
        }

        for (idx, name, value) in updates {
            records[idx].set_value(&name, value);
        }

        info!("Apportionment applied to {} references", apportioned_refs);
        Ok(records)
    }

    /// Shares within each civil/defence subset of the siblings.
    fn civil_defence_shares(
        records: &[SurveyRecord],
        siblings: &[usize],
        measure: &str,
        precision: u32,
    ) -> Vec<Option<f64>> {
        let mut shares = vec![None; siblings.len()];
        let mut subsets: BTreeMap<_, Vec<usize>> = BTreeMap::new();
        for (pos, &idx) in siblings.iter().enumerate() {
            if let Some(civil_or_defence) = records[idx].civil_or_defence {
                subsets.entry(civil_or_defence).or_default().push(pos);
            }
        }
        for positions in subsets.values() {
            let measures: Vec<Option<f64>> = positions
                .iter()
                .map(|&pos| records[siblings[pos]].value(measure))
                .collect();
            for (&pos, share) in positions.iter().zip(Self::shares(&measures, precision)) {
                shares[pos] = share;
            }
        }
        shares
    }

    fn require_field(records: &[SurveyRecord], field: &str) -> Result<()> {
        if records.iter().any(|r| r.values.contains_key(field)) {
            Ok(())
        } else {
            Err(ImputationError::MissingField {
                stage: "apportionment",
                field: field.to_string(),
            })
        }
    }
}
