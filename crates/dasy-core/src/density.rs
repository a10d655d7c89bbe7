//! Class density resolution.
//!
//! Stage order:
//!   A. Sampled densities from representative source units
//!   B. Preset override (always wins over A)
//!   C. First-pass estimate `area × class_density`
//!   D. Intelligent areal weighting for classes with neither sample nor preset
//!
//! D reads only C-final estimates; it is a single pass, not a fixpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;
use tracing::debug;

use crate::classifier::Classification;
use crate::config::Config;
use crate::sampler::{per_class, Sampling};
use crate::table::{group_sum, join_scalar, ClassCode, TargetUnit};

/// How a class's final density was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DensityMethod {
    Sampled,
    Preset,
    #[serde(rename = "IAW")]
    Iaw,
}

impl fmt::Display for DensityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Sampled => "Sampled",
            Self::Preset => "Preset",
            Self::Iaw => "IAW",
        })
    }
}

/// Per-class density record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassDensitySummary {
    pub class_code: ClassCode,
    /// Population summed over the representative units (Sampled / Preset),
    /// or over the provisional areal-weighting split (IAW).
    pub sum_population: f64,
    /// Area matching `sum_population`.
    pub sum_populated_area: f64,
    /// Representative-sample density, if the class was sampled.
    pub sampled_density: Option<f64>,
    pub method: DensityMethod,
    /// Density used for estimation.
    pub class_density: f64,
}

/// Working copy of a target unit annotated through every stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetEstimate {
    pub unit: TargetUnit,
    /// Owning source unit's population.
    pub pop_count: f64,
    /// Owning source unit's populated area.
    pub pop_area: f64,
    /// Owning source unit's representative class.
    pub rep_cat: Option<ClassCode>,
    pub class_density: f64,
    pub pop_estimate: f64,
    /// Owning source unit's area in unsampled classes.
    pub remaining_area: f64,
    /// Owning source unit's population not explained by first-pass estimates.
    pub pop_difference: f64,
    pub total_fraction: f64,
    pub new_pop: f64,
    pub new_density: f64,
}

/// Densities for every resolved class plus the annotated target units.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub classes: BTreeMap<ClassCode, ClassDensitySummary>,
    /// In target-table order.
    pub estimates: Vec<TargetEstimate>,
}

/// Step A: `sum(population) / sum(populated_area)` over each sampled class's
/// representative source units. A unit representative of two classes feeds
/// both samples.
pub fn sampled_densities(
    classification: &Classification,
    sampling: &Sampling,
) -> BTreeMap<ClassCode, ClassDensitySummary> {
    let reps: Vec<_> = sampling
        .representatives
        .iter()
        .flat_map(|(&c, units)| units.iter().map(move |&i| (c, &classification.sources[i])))
        .collect();
    group_sum(&reps, |(c, _)| *c, |(_, s)| [s.population_count, s.populated_area])
        .into_iter()
        .map(|(class_code, [pop, area])| {
            let density = if area > 0.0 { pop / area } else { 0.0 };
            let summary = ClassDensitySummary {
                class_code,
                sum_population: pop,
                sum_populated_area: area,
                sampled_density: Some(density),
                method: DensityMethod::Sampled,
                class_density: density,
            };
            (class_code, summary)
        })
        .collect()
}

/// Step B: every preset class present in the data takes its preset density,
/// replacing any sampled value.
pub fn apply_presets(
    classes: &mut BTreeMap<ClassCode, ClassDensitySummary>,
    present: &BTreeSet<ClassCode>,
    config: &Config,
) {
    for (&class_code, &preset) in config.preset_densities.iter().filter(|(c, _)| present.contains(*c)) {
        let entry = classes.entry(class_code).or_insert(ClassDensitySummary {
            class_code,
            sum_population: 0.0,
            sum_populated_area: 0.0,
            sampled_density: None,
            method: DensityMethod::Preset,
            class_density: preset,
        });
        if let Some(sampled) = entry.sampled_density {
            debug!(class = class_code, sampled, preset, "preset overrides sampled density");
        }
        entry.method = DensityMethod::Preset;
        entry.class_density = preset;
    }
}

/// Step C: annotate every target unit with its owning source unit's fields and
/// a first-pass estimate. Classes without a density start at 0.
fn first_pass(
    targets: &[TargetUnit],
    classification: &Classification,
    classes: &BTreeMap<ClassCode, ClassDensitySummary>,
) -> Vec<TargetEstimate> {
    targets
        .iter()
        .map(|t| {
            let src = classification.source(t.source_unit_id);
            let class_density = classes.get(&t.ancillary_class).map_or(0.0, |s| s.class_density);
            TargetEstimate {
                unit: *t,
                pop_count: src.map_or(0.0, |s| s.population_count),
                pop_area: src.map_or(0.0, |s| s.populated_area),
                rep_cat: src.and_then(|s| s.representative_category),
                class_density,
                pop_estimate: t.area * class_density,
                remaining_area: 0.0,
                pop_difference: 0.0,
                total_fraction: 0.0,
                new_pop: 0.0,
                new_density: 0.0,
            }
        })
        .collect()
}

/// Step D: intelligent areal weighting.
///
/// Each source unit's unexplained population is split over its unsampled
/// area, the provisional split is pooled into one density per class, and
/// that density replaces the provisional estimate.
fn areal_weighting(
    estimates: &mut [TargetEstimate],
    classification: &Classification,
    unsampled: &BTreeSet<ClassCode>,
) -> BTreeMap<ClassCode, ClassDensitySummary> {
    let in_unsampled = |e: &TargetEstimate| unsampled.contains(&e.unit.ancillary_class);

    let per_source = group_sum(&*estimates, |e| e.unit.source_unit_id, |e| {
        [if in_unsampled(e) { e.unit.area } else { 0.0 }, e.pop_estimate]
    });
    let remaining: BTreeMap<_, f64> = per_source.iter().map(|(&id, &[rem, _])| (id, rem)).collect();
    let difference: BTreeMap<_, f64> = per_source
        .iter()
        .map(|(&id, &[_, so_far])| {
            let pop = classification.source(id).map_or(0.0, |s| s.population_count);
            (id, (pop - so_far).max(0.0))
        })
        .collect();

    let rem = join_scalar(&*estimates, |e| e.unit.source_unit_id, &remaining);
    let diff = join_scalar(&*estimates, |e| e.unit.source_unit_id, &difference);
    for ((e, rem), diff) in estimates.iter_mut().zip(rem).zip(diff) {
        e.remaining_area = rem;
        e.pop_difference = diff;
        if in_unsampled(&*e) {
            e.pop_estimate =
                if rem != 0.0 { diff * e.unit.area / rem } else { 0.0 };
        }
    }

    let mut members: BTreeMap<ClassCode, Vec<usize>> = BTreeMap::new();
    for (i, e) in estimates.iter().enumerate().filter(|&(_, e)| in_unsampled(e)) {
        members.entry(e.unit.ancillary_class).or_default().push(i);
    }
    let classes: Vec<ClassCode> = members.keys().copied().collect();
    let pooled = {
        let shared: &[TargetEstimate] = estimates;
        per_class(&classes, |c| {
            members[&c].iter().fold([0.0, 0.0], |[pop, area], &i| {
                [pop + shared[i].pop_estimate, area + shared[i].unit.area]
            })
        })
    };

    let mut out = BTreeMap::new();
    for (class_code, [pop, area]) in classes.into_iter().zip(pooled) {
        let density = if area > 0.0 { pop / area } else { 0.0 };
        debug!(class = class_code, density, "areal-weighting density");
        for &i in &members[&class_code] {
            let e = &mut estimates[i];
            e.class_density = density;
            e.pop_estimate = e.unit.area * density;
        }
        out.insert(class_code, ClassDensitySummary {
            class_code,
            sum_population: pop,
            sum_populated_area: area,
            sampled_density: None,
            method: DensityMethod::Iaw,
            class_density: density,
        });
    }
    out
}

/// Run steps A–D.
pub fn resolve_densities(
    targets: &[TargetUnit],
    classification: &Classification,
    sampling: &Sampling,
    config: &Config,
) -> Resolution {
    let present: BTreeSet<ClassCode> = targets.iter().map(|t| t.ancillary_class).collect();

    let mut classes = sampled_densities(classification, sampling);
    apply_presets(&mut classes, &present, config);

    let mut estimates = first_pass(targets, classification, &classes);

    // Barrier: areal weighting sees only completed first-pass estimates.
    let iaw = areal_weighting(&mut estimates, classification, &sampling.unsampled);
    classes.extend(iaw);

    debug_assert!(classes.values().all(|s| s.class_density >= 0.0));
    Resolution { classes, estimates }
}
