//! Shared numeric helpers for the imputation stages.

use sha2::{Digest, Sha256};

/// Version tag mixed into every derived seed. Bump it when the seeding scheme
/// changes so old and new runs are never silently compared.
pub const SEED_VERSION: &str = "civdef-v1";

/// Round `value` to `places` decimal places (half away from zero).
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Number of values removed from one tail for a trim percentage.
pub fn trim_count(n: usize, percent: u32) -> usize {
    (n as f64 * f64::from(percent) / 100.0).round() as usize
}

/// Trim decisions for values already in trimming order.
///
/// Only non-zero values are trimmed, and only when there are more of them than
/// `threshold`. The first `lower` percent and the last `upper` percent of the
/// non-zero values in the given order are flagged. Zeros are never flagged,
/// and at least one non-zero value always survives rounding.
pub fn trim_flags(ordered: &[f64], threshold: usize, lower: u32, upper: u32) -> Vec<bool> {
    let mut flags = vec![false; ordered.len()];
    let nonzero: Vec<usize> = ordered
        .iter()
        .enumerate()
        .filter(|(_, v)| **v != 0.0)
        .map(|(i, _)| i)
        .collect();

    if nonzero.len() <= threshold {
        return flags;
    }

    let n = nonzero.len();
    let low = trim_count(n, lower).min(n - 1);
    let high = trim_count(n, upper).min(n - 1 - low);

    for &i in nonzero.iter().take(low) {
        flags[i] = true;
    }
    for &i in nonzero.iter().skip(n - high) {
        flags[i] = true;
    }
    flags
}

/// Deterministic seed for a group key, stable across platforms and releases.
pub fn group_seed(key: &str) -> u64 {
    let digest = Sha256::digest(format!("{SEED_VERSION}:{key}").as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Sum of the present values, `None` when every value is missing.
pub fn sum_present(values: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    values
        .into_iter()
        .flatten()
        .fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}
