//! Representative source units and class sampling sufficiency.
//!
//! A source unit is representative of class `c` when one of its target units
//! of class `c` is larger than `min_sampling_area` and covers at least
//! `percent_threshold` of the unit's populated area. A class with at least
//! `min_sample` representatives is sampled.
//!
//! Tie-break: every qualifying unit counts toward its class's sample, but a
//! unit's `representative_category` goes to the lowest class code that
//! samples it. With a threshold above 0.5 no unit can qualify twice, so this
//! only matters for lower thresholds.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::classifier::Classification;
use crate::config::Config;
use crate::table::{ClassCode, TargetUnit};

/// Outcome of representative sampling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sampling {
    /// Classes with enough representative source units.
    pub sampled: BTreeSet<ClassCode>,
    /// Classes with too few representatives and no preset density.
    pub unsampled: BTreeSet<ClassCode>,
    /// Distinct representative source units per inhabited class.
    pub rep_counts: BTreeMap<ClassCode, usize>,
    /// Source-table indices of the representatives of each sampled class.
    pub representatives: BTreeMap<ClassCode, Vec<usize>>,
    /// Representatives whose category was already taken by a lower class.
    pub contested: usize,
}

/// Map `f` over classes, in parallel with the `threading` feature.
/// Results keep the order of `classes`.
pub(crate) fn per_class<T, F>(classes: &[ClassCode], f: F) -> Vec<T>
where
    T: Send,
    F: Fn(ClassCode) -> T + Sync + Send,
{
    #[cfg(feature = "threading")]
    {
        use rayon::prelude::*;
        classes.par_iter().map(|&c| f(c)).collect()
    }
    #[cfg(not(feature = "threading"))]
    {
        classes.iter().map(|&c| f(c)).collect()
    }
}

/// Source-table indices of units that qualify as representative of `class`.
fn qualifying_sources(
    units: &[&TargetUnit],
    classification: &Classification,
    config: &Config,
) -> BTreeSet<usize> {
    units
        .iter()
        .filter(|t| t.area > config.min_sampling_area)
        .filter_map(|t| {
            let idx = classification.source_index(t.source_unit_id)?;
            let populated = classification.sources[idx].populated_area;
            if populated <= 0.0 {
                return None;
            }
            (t.area / populated >= config.percent_threshold).then_some(idx)
        })
        .collect()
}

/// Find representatives for every inhabited class and record each claimed
/// unit's `representative_category`.
pub fn select_representatives(
    targets: &[TargetUnit],
    classification: &mut Classification,
    config: &Config,
) -> Sampling {
    let mut by_class: BTreeMap<ClassCode, Vec<&TargetUnit>> = BTreeMap::new();
    for t in targets.iter().filter(|t| classification.inhabited.contains(&t.ancillary_class)) {
        by_class.entry(t.ancillary_class).or_default().push(t);
    }
    let classes: Vec<ClassCode> = by_class.keys().copied().collect();

    let qualifying = {
        let shared: &Classification = classification;
        per_class(&classes, |c| qualifying_sources(&by_class[&c], shared, config))
    };

    let mut sampling = Sampling::default();
    for (class, candidates) in classes.into_iter().zip(qualifying) {
        let count = candidates.len();
        sampling.rep_counts.insert(class, count);

        if count < config.min_sample {
            if config.preset(class).is_none() {
                sampling.unsampled.insert(class);
                debug!(class, representatives = count, "class under-sampled; deferring to areal weighting");
            }
            continue;
        }

        let mut contested = 0;
        for &i in &candidates {
            let unit = &mut classification.sources[i];
            match unit.representative_category {
                None => unit.representative_category = Some(class),
                Some(_) => contested += 1,
            }
        }
        if contested > 0 {
            warn!(class, contested, "source units representative of more than one class; lower class code keeps the category");
            sampling.contested += contested;
        }
        sampling.sampled.insert(class);
        sampling.representatives.insert(class, candidates.into_iter().collect());
        debug!(class, representatives = count, "class sampled");
    }
    sampling
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::classify;
    use crate::table::{SourceRecord, UnitId};

    fn tu(id: UnitId, src: UnitId, class: ClassCode, area: f64) -> TargetUnit {
        TargetUnit { id, source_unit_id: src, ancillary_class: class, area }
    }

    fn sources(n: i64, pop: f64) -> Vec<SourceRecord> {
        (1..=n).map(|id| SourceRecord { id, population_count: pop, reported_area: None }).collect()
    }

    fn cfg(min_sample: usize, threshold: f64) -> Config {
        Config { min_sample, percent_threshold: threshold, ..Config::default() }
    }

    /// `n` source units each entirely covered by `class`.
    fn homogeneous(n: i64, class: ClassCode) -> Vec<TargetUnit> {
        (1..=n).map(|i| tu(i, i, class, 50.0)).collect()
    }

    fn run(targets: &[TargetUnit], n: i64, config: &Config) -> (Classification, Sampling) {
        let mut c = classify(targets, &sources(n, 10.0), config).unwrap();
        let s = select_representatives(targets, &mut c, config);
        (c, s)
    }

    #[test]
    fn exactly_min_sample_representatives_is_sampled() {
        let targets = homogeneous(3, 22);
        let (c, s) = run(&targets, 3, &cfg(3, 0.9));
        assert!(s.sampled.contains(&22));
        assert!(c.sources.iter().all(|u| u.representative_category == Some(22)));
    }

    #[test]
    fn one_short_falls_to_unsampled() {
        let targets = homogeneous(2, 22);
        let (c, s) = run(&targets, 2, &cfg(3, 0.9));
        assert!(s.unsampled.contains(&22));
        assert!(c.sources.iter().all(|u| u.representative_category.is_none()));
    }

    #[test]
    fn under_sampled_preset_class_is_not_unsampled() {
        let targets = homogeneous(2, 22);
        let mut config = cfg(3, 0.9);
        config.preset_densities.insert(22, 1.5);
        let (_, s) = run(&targets, 2, &config);
        assert!(s.sampled.is_empty());
        assert!(s.unsampled.is_empty());
    }

    #[test]
    fn small_target_units_are_not_candidates() {
        let targets = homogeneous(3, 22);
        let config = Config { min_sampling_area: 50.0, ..cfg(1, 0.9) };
        let (_, s) = run(&targets, 3, &config);
        // area must be strictly greater than min_sampling_area
        assert_eq!(s.rep_counts[&22], 0);
        assert!(s.unsampled.contains(&22));
    }

    #[test]
    fn threshold_is_relative_to_populated_area() {
        // 40 water + 60 class 22: 60/60 of populated area once water is uninhabited.
        let targets = [tu(1, 1, 11, 40.0), tu(2, 1, 22, 60.0)];
        let mut config = cfg(1, 0.9);
        let (_, s) = run(&targets, 1, &config);
        assert!(!s.sampled.contains(&22));

        config.preset_densities.insert(11, 0.0);
        let (c, s) = run(&targets, 1, &config);
        assert!(s.sampled.contains(&22));
        assert_eq!(c.sources[0].representative_category, Some(22));
    }

    #[test]
    fn low_threshold_tie_goes_to_lowest_class_code() {
        // Source 1 is half 21, half 22; both qualify at p = 0.5.
        let targets = [tu(1, 1, 22, 50.0), tu(2, 1, 21, 50.0)];
        let (c, s) = run(&targets, 1, &cfg(1, 0.5));
        assert_eq!(c.sources[0].representative_category, Some(21));
        assert_eq!(s.contested, 1);
        // The unit still counts toward class 22.
        assert_eq!(s.rep_counts[&22], 1);
        assert!(s.sampled.contains(&21) && s.sampled.contains(&22));
        assert!(s.unsampled.is_empty());
    }

    #[test]
    fn shared_representatives_sample_both_classes() {
        // Three sources, each half 21 and half 22, min_sample 3 at p = 0.5.
        let targets: Vec<_> = (1..=3)
            .flat_map(|i| [tu(2 * i - 1, i, 21, 40.0), tu(2 * i, i, 22, 40.0)])
            .collect();
        let (c, s) = run(&targets, 3, &cfg(3, 0.5));
        assert_eq!(s.rep_counts, BTreeMap::from([(21, 3), (22, 3)]));
        assert_eq!(s.sampled, BTreeSet::from([21, 22]));
        assert_eq!(s.representatives[&22], vec![0, 1, 2]);
        assert!(c.sources.iter().all(|u| u.representative_category == Some(21)));
        assert_eq!(s.contested, 3);
    }

    #[test]
    fn per_class_keeps_class_order() {
        let classes: Vec<ClassCode> = (1..=64).collect();
        let squares = per_class(&classes, |c| c * c);
        assert_eq!(squares, classes.iter().map(|c| c * c).collect::<Vec<_>>());
    }

    #[test]
    fn distinct_units_counted_once() {
        // Two class-22 pieces in the same source unit count as one representative.
        let targets = [tu(1, 1, 22, 50.0), tu(2, 1, 22, 50.0)];
        let (_, s) = run(&targets, 1, &cfg(1, 0.4));
        assert_eq!(s.rep_counts[&22], 1);
    }
}
