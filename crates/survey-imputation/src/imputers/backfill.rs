//! Back-fill of missing class dimensions before trimmed-mean imputation.
//!
//! Records that will need a class mean but lack a product group get one from
//! the SIC mapping. Records lacking a civil/defence indicator get one drawn at
//! random, in proportion to what clear responders in the same product group
//! and SIC report. Draws are seeded per group key and made in
//! (reference, instance) order, so a run never depends on input row order.

use crate::types::{CivilDefence, FormType, ImputationMarker, SurveyRecord};
use crate::utils::group_seed;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// SIC code to product-group lookup.
#[derive(Debug, Clone, Default)]
pub struct SicMapping {
    map: HashMap<i64, String>,
}

impl SicMapping {
    pub fn new(map: HashMap<i64, String>) -> Self {
        Self { map }
    }

    pub fn from_pairs<S: Into<String>>(pairs: impl IntoIterator<Item = (i64, S)>) -> Self {
        Self {
            map: pairs.into_iter().map(|(sic, pg)| (sic, pg.into())).collect(),
        }
    }

    pub fn product_group(&self, sic: i64) -> Option<&str> {
        self.map.get(&sic).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Civil and total counts of clear responders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Tally {
    civil: usize,
    total: usize,
}

impl Tally {
    fn add(&mut self, civil_or_defence: CivilDefence) {
        self.total += 1;
        if civil_or_defence == CivilDefence::Civil {
            self.civil += 1;
        }
    }

    fn proportion(&self) -> f64 {
        self.civil as f64 / self.total as f64
    }
}

/// Fills missing product groups and civil/defence indicators.
pub struct DimensionBackfill;

impl DimensionBackfill {
    /// Long-form non-responders and no-R&D returns get missing dimensions filled.
    pub fn needs_backfill(record: &SurveyRecord) -> bool {
        !record.is_instance_zero()
            && (record.is_no_rd()
                || (record.form_type == FormType::Long
                    && record.marker == ImputationMarker::NoImputation))
    }

    /// Fill missing product groups from the SIC mapping.
    pub fn backfill_product_groups(
        mut records: Vec<SurveyRecord>,
        mapping: &SicMapping,
    ) -> Vec<SurveyRecord> {
        let mut filled = 0usize;
        for record in records.iter_mut().filter(|r| Self::needs_backfill(r)) {
            let missing = record
                .product_group
                .as_deref()
                .is_none_or(|pg| pg.trim().is_empty());
            if missing
                && let Some(pg) = record.sic.and_then(|sic| mapping.product_group(sic))
            {
                record.product_group = Some(pg.to_string());
                filled += 1;
            }
        }
        info!("Back-filled {} product groups from SIC mapping", filled);
        records
    }

    /// Draw missing civil/defence indicators from observed proportions.
    pub fn backfill_civil_defence(mut records: Vec<SurveyRecord>) -> Vec<SurveyRecord> {
        let mut by_pair: HashMap<(String, i64), Tally> = HashMap::new();
        let mut by_group: HashMap<String, Tally> = HashMap::new();
        for record in records
            .iter()
            .filter(|r| r.status.is_clear() && !r.is_instance_zero())
        {
            let (Some(civil_or_defence), Some(pg)) =
                (record.civil_or_defence, record.product_group.as_ref())
            else {
                continue;
            };
            by_group.entry(pg.clone()).or_default().add(civil_or_defence);
            if let Some(sic) = record.sic {
                by_pair
                    .entry((pg.clone(), sic))
                    .or_default()
                    .add(civil_or_defence);
            }
        }

        let mut draws: BTreeMap<String, (f64, Vec<usize>)> = BTreeMap::new();
        for (idx, record) in records.iter().enumerate() {
            if record.civil_or_defence.is_some() || !Self::needs_backfill(record) {
                continue;
            }
            let Some(pg) = record.product_group.as_ref() else {
                continue;
            };
            let pair = record
                .sic
                .and_then(|sic| by_pair.get(&(pg.clone(), sic)).map(|t| (sic, t)));
            let (key, tally) = match pair {
                Some((sic, tally)) => (format!("{pg}|{sic}"), tally),
                None => match by_group.get(pg) {
                    Some(tally) => (pg.clone(), tally),
                    None => continue,
                },
            };
            draws
                .entry(key)
                .or_insert_with(|| (tally.proportion(), Vec::new()))
                .1
                .push(idx);
        }

        let mut drawn = 0usize;
        for (key, (proportion, mut members)) in draws {
            members.sort_by_key(|&i| records[i].key());
            let mut rng = StdRng::seed_from_u64(group_seed(&key));
            for idx in members {
                let civil_or_defence = if rng.r#gen::<f64>() < proportion {
                    CivilDefence::Civil
                } else {
                    CivilDefence::Defence
                };
                records[idx].civil_or_defence = Some(civil_or_defence);
                drawn += 1;
            }
            debug!("Drew civil/defence for group {} (p_civil = {:.3})", key, proportion);
        }
        info!("Back-filled {} civil/defence indicators", drawn);
        records
    }
}
