//! Mass-conserving (pycnophylactic) redistribution of source-unit population
//! over its target units in proportion to their estimates.

use std::collections::BTreeMap;

use tracing::debug;

use crate::density::TargetEstimate;
use crate::error::{DasyError, Result};
use crate::table::{group_sum, join_scalar, UnitId};

/// Source units whose estimates sum to zero while holding population get an
/// area-proportional estimate instead. Returns their ids in ascending order.
pub fn apply_zero_estimate_fallback(estimates: &mut [TargetEstimate]) -> Vec<UnitId> {
    let totals = group_sum(&*estimates, |e| e.unit.source_unit_id, |e| [e.pop_estimate, e.pop_count]);
    let fallback: Vec<UnitId> = totals
        .iter()
        .filter(|&(_, &[est, pop])| est == 0.0 && pop > 0.0)
        .map(|(&id, _)| id)
        .collect();

    for e in estimates.iter_mut().filter(|e| fallback.binary_search(&e.unit.source_unit_id).is_ok()) {
        e.pop_estimate = e.unit.area;
    }
    for id in &fallback {
        debug!(source = id, "no positive estimate; weighting by area");
    }
    fallback
}

/// Scale every target unit's estimate so its source unit's estimates sum to
/// the source unit's population. Returns the fallback source units.
///
/// Fails if a source unit's estimates do not sum to a finite total.
pub fn redistribute(estimates: &mut [TargetEstimate]) -> Result<Vec<UnitId>> {
    let fallback = apply_zero_estimate_fallback(estimates);

    let source_totals: BTreeMap<UnitId, f64> =
        group_sum(&*estimates, |e| e.unit.source_unit_id, |e| [e.pop_estimate])
            .into_iter()
            .map(|(id, [total])| (id, total))
            .collect();
    if let Some((&source_id, _)) = source_totals.iter().find(|&(_, t)| !t.is_finite()) {
        return Err(DasyError::NonFiniteEstimate { source_id });
    }
    let totals = join_scalar(&*estimates, |e| e.unit.source_unit_id, &source_totals);

    for (e, total) in estimates.iter_mut().zip(totals) {
        e.total_fraction = if total > 0.0 { e.pop_estimate / total } else { 0.0 };
        e.new_pop = e.total_fraction * e.pop_count;
        e.new_density = if e.unit.area > 0.0 { e.new_pop / e.unit.area } else { 0.0 };
    }
    Ok(fallback)
}
