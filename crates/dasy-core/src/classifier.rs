//! Inhabited / uninhabited class split and per-source-unit populated area.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{DasyError, Result};
use crate::table::{group_sum, ClassCode, SourceRecord, TargetUnit, UnitId};

/// Relative slack allowed between a delivered `Count` and the summed areas.
const AREA_CHECK_TOLERANCE: f64 = 1e-9;

/// Source unit with the aggregates derived from its target units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceUnit {
    pub id: UnitId,
    pub population_count: f64,
    /// Sum of all its target-unit areas.
    pub total_area: f64,
    /// Sum of its target-unit areas in inhabited classes.
    pub populated_area: f64,
    /// `population_count / populated_area`, 0 where `populated_area` is 0.
    pub population_density: f64,
    /// Class this unit is a density sample for, if any.
    pub representative_category: Option<ClassCode>,
}

impl SourceUnit {
    /// Zero populated area. Benign; the redistributor's fallback handles it.
    pub fn is_degenerate(&self) -> bool {
        self.populated_area <= 0.0
    }
}

/// Output of the classification stage.
#[derive(Debug, Clone)]
pub struct Classification {
    /// Classes present in the target table whose preset density is not 0.
    pub inhabited: BTreeSet<ClassCode>,
    /// Classes preset to density 0.
    pub uninhabited: BTreeSet<ClassCode>,
    /// In source-table order.
    pub sources: Vec<SourceUnit>,
    index: BTreeMap<UnitId, usize>,
}

impl Classification {
    pub fn source_index(&self, id: UnitId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    pub fn source(&self, id: UnitId) -> Option<&SourceUnit> {
        self.source_index(id).map(|i| &self.sources[i])
    }
}

/// Split classes, reject orphan target units, and aggregate source-unit areas.
pub fn classify(
    targets: &[TargetUnit],
    records: &[SourceRecord],
    config: &Config,
) -> Result<Classification> {
    let index: BTreeMap<UnitId, usize> =
        records.iter().enumerate().map(|(i, r)| (r.id, i)).collect();

    if let Some(orphan) = targets.iter().find(|t| !index.contains_key(&t.source_unit_id)) {
        return Err(DasyError::OrphanTargetUnit {
            target_id: orphan.id,
            source_id: orphan.source_unit_id,
        });
    }

    let uninhabited: BTreeSet<ClassCode> = config
        .preset_densities
        .iter()
        .filter(|&(_, &d)| d == 0.0)
        .map(|(&c, _)| c)
        .collect();
    let inhabited: BTreeSet<ClassCode> = targets
        .iter()
        .map(|t| t.ancillary_class)
        .filter(|c| !uninhabited.contains(c))
        .collect();

    // [total_area, populated_area] per source unit.
    let areas = group_sum(targets, |t| t.source_unit_id, |t| {
        let populated = if inhabited.contains(&t.ancillary_class) { t.area } else { 0.0 };
        [t.area, populated]
    });

    let sources = records
        .iter()
        .map(|r| {
            let [total_area, populated_area] = areas.get(&r.id).copied().unwrap_or([0.0; 2]);
            let population_density =
                if populated_area > 0.0 { r.population_count / populated_area } else { 0.0 };

            if total_area == 0.0 && r.population_count > 0.0 {
                warn!(source = r.id, population = r.population_count, "source unit has no target units");
            } else if populated_area == 0.0 {
                debug!(source = r.id, population = r.population_count, "degenerate source unit: no populated area");
            }
            if let Some(reported) = r.reported_area {
                if (reported - total_area).abs() > AREA_CHECK_TOLERANCE * reported.abs().max(1.0) {
                    warn!(source = r.id, reported, summed = total_area, "source Count differs from summed target areas");
                }
            }

            SourceUnit {
                id: r.id,
                population_count: r.population_count,
                total_area,
                populated_area,
                population_density,
                representative_category: None,
            }
        })
        .collect();

    Ok(Classification { inhabited, uninhabited, sources, index })
}
