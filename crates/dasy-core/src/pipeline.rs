//! Pipeline orchestrator: runs all redistribution stages in order.

use tracing::{info, info_span};

use crate::classifier::{classify, SourceUnit};
use crate::config::{Config, RunConfig, TableSchema};
use crate::density::{resolve_densities, ClassDensitySummary, DensityMethod, TargetEstimate};
use crate::error::Result;
use crate::redistribute::redistribute;
use crate::results::{assemble, OutputTables};
use crate::sampler::{select_representatives, Sampling};
use crate::table::{group_sum, read_source_units, read_target_units, SourceRecord, Table, TargetUnit, UnitId};

/// Default relative tolerance for the conservation check.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// Full output of one redistribution run.
#[derive(Debug, Clone)]
pub struct DasyResult {
    /// Annotated target units, in input order.
    pub targets: Vec<TargetEstimate>,
    /// Source units, in input order.
    pub sources: Vec<SourceUnit>,
    /// Resolved classes, by ascending class code.
    pub classes: Vec<ClassDensitySummary>,
    pub sampling: Sampling,
    /// Source units that took the area-weighting fallback.
    pub fallback_sources: Vec<UnitId>,
}

impl DasyResult {
    pub fn class(&self, code: i64) -> Option<&ClassDensitySummary> {
        self.classes.iter().find(|c| c.class_code == code)
    }

    pub fn count_method(&self, method: DensityMethod) -> usize {
        self.classes.iter().filter(|c| c.method == method).count()
    }
}

/// The redistribution pipeline for one validated configuration.
#[derive(Debug, Clone)]
pub struct Dasymetric {
    config: Config,
}

impl Dasymetric {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Validate a raw configuration first.
    pub fn from_run_config(run: &RunConfig) -> Result<Self> {
        Ok(Self::new(run.validate()?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run every stage over typed inputs.
    ///
    /// Stage order:
    ///   1. Classification (inhabited classes, populated areas)
    ///   2. Representative sampling
    ///   3. Density resolution (sampled → preset → first pass → IAW)
    ///   4. Pycnophylactic redistribution
    pub fn run(&self, targets: &[TargetUnit], sources: &[SourceRecord]) -> Result<DasyResult> {
        let _span = info_span!("dasymetric", targets = targets.len(), sources = sources.len()).entered();

        // ── 1. Classification ───────────────────────────────────────────────
        let mut classification = classify(targets, sources, &self.config)?;
        info!(
            inhabited = classification.inhabited.len(),
            uninhabited = classification.uninhabited.len(),
            "classes split"
        );

        // ── 2. Representative sampling ──────────────────────────────────────
        let sampling = select_representatives(targets, &mut classification, &self.config);
        info!(
            sampled = sampling.sampled.len(),
            unsampled = sampling.unsampled.len(),
            contested = sampling.contested,
            "representatives selected"
        );

        // ── 3. Density resolution ───────────────────────────────────────────
        let resolution = resolve_densities(targets, &classification, &sampling, &self.config);
        let mut estimates = resolution.estimates;
        let classes: Vec<ClassDensitySummary> = resolution.classes.into_values().collect();

        // ── 4. Redistribution ───────────────────────────────────────────────
        let fallback_sources = redistribute(&mut estimates)?;

        let result = DasyResult {
            targets: estimates,
            sources: classification.sources,
            classes,
            sampling,
            fallback_sources,
        };
        info!(
            sampled = result.count_method(DensityMethod::Sampled),
            preset = result.count_method(DensityMethod::Preset),
            iaw = result.count_method(DensityMethod::Iaw),
            fallback = result.fallback_sources.len(),
            "redistribution complete"
        );
        Ok(result)
    }

    /// Validate exchange tables against `schema`, run, and assemble the outputs.
    /// Nothing is returned unless every stage succeeds.
    pub fn run_tables(
        &self,
        target_table: &Table,
        source_table: &Table,
        schema: &TableSchema,
    ) -> Result<(DasyResult, OutputTables)> {
        let targets = read_target_units(target_table, schema)?;
        let sources = read_source_units(source_table, schema)?;
        let result = self.run(&targets, &sources)?;
        let tables = assemble(&result, schema);
        Ok((result, tables))
    }
}

// ── Conservation check ────────────────────────────────────────────────────────

/// Per-source comparison of redistributed population against the input.
#[derive(Debug, Clone, PartialEq)]
pub struct ConservationReport {
    /// Populated source units with at least one target unit.
    pub checked: usize,
    /// Largest `|Σ new_pop − population| / max(population, 1)`; infinite
    /// if any placed total is not finite.
    pub max_error: f64,
    pub worst_source: Option<UnitId>,
    /// Populated source units with no target units; their population has
    /// nowhere to go.
    pub unplaced: Vec<UnitId>,
}

impl ConservationReport {
    pub fn holds(&self, tolerance: f64) -> bool {
        self.max_error <= tolerance && self.unplaced.is_empty()
    }
}

pub fn check_conservation(result: &DasyResult) -> ConservationReport {
    let sums = group_sum(&result.targets, |e| e.unit.source_unit_id, |e| [e.new_pop]);
    let mut report = ConservationReport { checked: 0, max_error: 0.0, worst_source: None, unplaced: Vec::new() };
    for s in result.sources.iter().filter(|s| s.population_count > 0.0) {
        let Some(&[placed]) = sums.get(&s.id) else {
            report.unplaced.push(s.id);
            continue;
        };
        report.checked += 1;
        let err = (placed - s.population_count).abs() / s.population_count.max(1.0);
        let err = if err.is_finite() { err } else { f64::INFINITY };
        if err > report.max_error || report.worst_source.is_none() {
            report.max_error = report.max_error.max(err);
            report.worst_source = Some(s.id);
        }
    }
    report
}
