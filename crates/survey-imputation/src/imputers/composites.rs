//! Composite totals derived from their parts.

use crate::config::CompositeTotal;
use crate::types::SurveyRecord;
use crate::utils::sum_present;

/// Recompute every composite total of a record from its working parts.
///
/// A total whose parts are all missing becomes missing too.
pub fn recompute_composites(record: &mut SurveyRecord, composites: &[CompositeTotal]) {
    for composite in composites {
        let total = sum_present(composite.parts.iter().map(|part| record.working(part)));
        record.set_working(&composite.total, total);
    }
}
