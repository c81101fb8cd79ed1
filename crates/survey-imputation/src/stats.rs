//! Grouped aggregations over small polars frames.
//!
//! Stages pick their donor rows and trimming flags; the per-group means,
//! counts and sums are computed here with polars.

use crate::error::{Result, ResultExt};
use crate::table::{float_values, int_values, string_values};
use polars::prelude::*;
use std::collections::BTreeMap;

const GROUP: &str = "group";
const VARIABLE: &str = "variable";
const VALUE: &str = "value";
const TRIMMED: &str = "trimmed";
const COUNT: &str = "count";
const MEAN: &str = "mean";

/// Dense integer ids for grouping keys, so frames never need to encode the
/// keys themselves.
#[derive(Debug, Clone)]
pub struct GroupIds<K> {
    ids: BTreeMap<K, i64>,
    keys: Vec<K>,
}

impl<K> Default for GroupIds<K> {
    fn default() -> Self {
        Self {
            ids: BTreeMap::new(),
            keys: Vec::new(),
        }
    }
}

impl<K: Ord + Clone> GroupIds<K> {
    /// Id of `key`, assigning the next free one on first sight.
    pub fn id(&mut self, key: &K) -> i64 {
        if let Some(&id) = self.ids.get(key) {
            return id;
        }
        let id = self.keys.len() as i64;
        self.ids.insert(key.clone(), id);
        self.keys.push(key.clone());
        id
    }

    pub fn key(&self, id: i64) -> Option<&K> {
        usize::try_from(id).ok().and_then(|i| self.keys.get(i))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Aggregate of one (group, variable) cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrimmedMean {
    /// Every donor, trimmed or not.
    pub count: usize,
    /// `None` when every donor was trimmed.
    pub mean: Option<f64>,
}

/// Donor values with their trimming decisions, collected row by row.
#[derive(Debug, Default)]
pub struct DonorFrame {
    groups: Vec<i64>,
    variables: Vec<String>,
    values: Vec<f64>,
    trimmed: Vec<bool>,
}

impl DonorFrame {
    pub fn push(&mut self, group: i64, variable: &str, value: f64, trimmed: bool) {
        self.groups.push(group);
        self.variables.push(variable.to_string());
        self.values.push(value);
        self.trimmed.push(trimmed);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn to_dataframe(&self) -> Result<DataFrame> {
        DataFrame::new(vec![
            Column::new(GROUP.into(), self.groups.clone()),
            Column::new(VARIABLE.into(), self.variables.clone()),
            Column::new(VALUE.into(), self.values.clone()),
            Column::new(TRIMMED.into(), self.trimmed.clone()),
        ])
        .context("Building donor frame")
    }

    /// Donor count and mean of the untrimmed values per (group, variable).
    pub fn trimmed_means(&self) -> Result<BTreeMap<(i64, String), TrimmedMean>> {
        if self.is_empty() {
            return Ok(BTreeMap::new());
        }

        let out = self
            .to_dataframe()?
            .lazy()
            .group_by([col(GROUP), col(VARIABLE)])
            .agg([
                col(VALUE).count().alias(COUNT),
                col(VALUE)
                    .filter(col(TRIMMED).eq(lit(false)))
                    .mean()
                    .alias(MEAN),
            ])
            .collect()
            .context("Aggregating trimmed means")?;

        let groups = int_values(&out, GROUP)?;
        let variables = string_values(&out, VARIABLE)?;
        let counts = int_values(&out, COUNT)?;
        let means = float_values(&out, MEAN)?;

        let mut cells = BTreeMap::new();
        for (((group, variable), count), mean) in
            groups.into_iter().zip(variables).zip(counts).zip(means)
        {
            if let (Some(group), Some(variable)) = (group, variable) {
                let count = count.and_then(|c| usize::try_from(c).ok()).unwrap_or(0);
                cells.insert((group, variable), TrimmedMean { count, mean });
            }
        }
        Ok(cells)
    }
}

/// Sum every value column per group, returning the sums in column order.
pub fn group_sums(
    groups: Vec<i64>,
    columns: Vec<(&str, Vec<f64>)>,
) -> Result<BTreeMap<i64, Vec<f64>>> {
    if groups.is_empty() {
        return Ok(BTreeMap::new());
    }

    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    let mut frame = vec![Column::new(GROUP.into(), groups)];
    frame.extend(
        columns
            .into_iter()
            .map(|(name, values)| Column::new(name.into(), values)),
    );

    let out = DataFrame::new(frame)
        .context("Building sum frame")?
        .lazy()
        .group_by([col(GROUP)])
        .agg(names.iter().map(|name| col(*name).sum()).collect::<Vec<_>>())
        .collect()
        .context("Aggregating group sums")?;

    let ids = int_values(&out, GROUP)?;
    let sums = names
        .iter()
        .map(|name| float_values(&out, name))
        .collect::<Result<Vec<_>>>()?;

    let mut result = BTreeMap::new();
    for (row, id) in ids.into_iter().enumerate() {
        if let Some(id) = id {
            result.insert(
                id,
                sums.iter().map(|column| column[row].unwrap_or(0.0)).collect(),
            );
        }
    }
    Ok(result)
}
