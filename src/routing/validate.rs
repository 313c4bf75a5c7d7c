//! Fixed-range checks
//!
//! Every bound is evaluated so a rejected record carries all of its
//! violations, not just the first.

use crate::config::FieldBound;
use crate::types::{FieldError, SensorRecord, Violation};

/// Check `record` against `bounds`. `Ok(())` when every check passes.
pub fn check_bounds(record: &SensorRecord, bounds: &[FieldBound]) -> Result<(), Vec<Violation>> {
    let violations: Vec<Violation> = bounds
        .iter()
        .filter_map(|bound| check_one(record, bound))
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

fn check_one(record: &SensorRecord, bound: &FieldBound) -> Option<Violation> {
    let value = match read_field(record, bound) {
        Ok(Some(v)) => v,
        Ok(None) => return None,
        Err(e) => return Some(e.into()),
    };
    if bound.contains(value) {
        None
    } else {
        Some(Violation::OutOfRange {
            field: bound.field.clone(),
            value,
            min: bound.min,
            max: bound.max,
        })
    }
}

/// Required fields must be present and numeric; optional ones only need to
/// be numeric when present.
pub(crate) fn read_field(record: &SensorRecord, bound: &FieldBound) -> Result<Option<f64>, FieldError> {
    if bound.required {
        record.number(&bound.field).map(Some)
    } else {
        record.optional_number(&bound.field)
    }
}
