//! Imputation stages.
//!
//! Each stage takes the record vector by value and returns a new one:
//! - Apportionment of instance-0 values across instances
//! - Carry-forward and mean-of-ratios back-infill
//! - Trimmed-mean imputation, with dimension back-fill
//! - Short-form breakdown expansion

mod apportionment;
mod backfill;
mod composites;
mod expansion;
mod mor;
mod tmi;

pub use apportionment::Apportioner;
pub use backfill::{DimensionBackfill, SicMapping};
pub use composites::recompute_composites;
pub use expansion::{ExpansionRatios, ShortFormExpander};
pub use mor::{Backdata, LinkFactors, MeanOfRatiosImputer, MorOutcome, ensure_unique_keys};
pub use tmi::{ClassMeans, TmiOutcome, TrimmedMeanImputer};
