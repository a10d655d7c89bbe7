//! Projection of a finished run into the three exchange tables.

use serde::Serialize;
use serde_json::{json, Value};

use crate::config::TableSchema;
use crate::pipeline::DasyResult;
use crate::table::{ClassCode, Table, COUNT_FIELD, ID_FIELD};

pub const POP_COUNT: &str = "POP_COUNT";
pub const POP_AREA: &str = "POP_AREA";
pub const POP_DENS: &str = "POP_DENS";
pub const REP_CAT: &str = "REP_CAT";
pub const CLASSDENS: &str = "CLASSDENS";
pub const POP_EST: &str = "POP_EST";
pub const REM_AREA: &str = "REM_AREA";
pub const POP_DIFF: &str = "POP_DIFF";
pub const TOTALFRACT: &str = "TOTALFRACT";
pub const NEW_POP: &str = "NEW_POP";
pub const NEWDENSITY: &str = "NEWDENSITY";
pub const SUM_POP_AREA: &str = "SUM_POP_AREA";
pub const SAMPLEDENS: &str = "SAMPLEDENS";
pub const METHOD: &str = "METHOD";

/// Output tables handed back to the geoprocessing layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputTables {
    /// One row per target unit, every intermediate field retained.
    pub targets: Table,
    /// One row per source unit.
    pub sources: Table,
    /// One row per class with a resolved density.
    pub classes: Table,
}

/// `REP_CAT` uses 0 for "not representative".
fn rep_cat(c: Option<ClassCode>) -> Value {
    json!(c.unwrap_or(0))
}

pub fn assemble(result: &DasyResult, schema: &TableSchema) -> OutputTables {
    let mut targets = Table::new([
        ID_FIELD,
        COUNT_FIELD,
        schema.source_unit_id_column.as_str(),
        schema.ancillary_class_column.as_str(),
        POP_COUNT,
        POP_AREA,
        REP_CAT,
        CLASSDENS,
        POP_EST,
        REM_AREA,
        POP_DIFF,
        TOTALFRACT,
        NEW_POP,
        NEWDENSITY,
    ]);
    for e in &result.targets {
        targets.push_row(vec![
            json!(e.unit.id),
            json!(e.unit.area),
            json!(e.unit.source_unit_id),
            json!(e.unit.ancillary_class),
            json!(e.pop_count),
            json!(e.pop_area),
            rep_cat(e.rep_cat),
            json!(e.class_density),
            json!(e.pop_estimate),
            json!(e.remaining_area),
            json!(e.pop_difference),
            json!(e.total_fraction),
            json!(e.new_pop),
            json!(e.new_density),
        ]);
    }

    let mut sources = Table::new([
        ID_FIELD,
        COUNT_FIELD,
        schema.population_count_column.as_str(),
        POP_AREA,
        POP_DENS,
        REP_CAT,
    ]);
    for s in &result.sources {
        sources.push_row(vec![
            json!(s.id),
            json!(s.total_area),
            json!(s.population_count),
            json!(s.populated_area),
            json!(s.population_density),
            rep_cat(s.representative_category),
        ]);
    }

    let sum_pop = format!("SUM_{}", schema.population_count_column);
    let mut classes = Table::new([REP_CAT, sum_pop.as_str(), SUM_POP_AREA, SAMPLEDENS, METHOD, CLASSDENS]);
    for c in &result.classes {
        classes.push_row(vec![
            json!(c.class_code),
            json!(c.sum_population),
            json!(c.sum_populated_area),
            json!(c.sampled_density),
            json!(c.method.to_string()),
            json!(c.class_density),
        ]);
    }

    OutputTables { targets, sources, classes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::Dasymetric;
    use crate::table::{SourceRecord, TargetUnit};

    fn scenario() -> DasyResult {
        let targets = [
            TargetUnit { id: 1, source_unit_id: 1, ancillary_class: 11, area: 10.0 },
            TargetUnit { id: 2, source_unit_id: 1, ancillary_class: 42, area: 90.0 },
        ];
        let sources = [SourceRecord { id: 1, population_count: 100.0, reported_area: Some(100.0) }];
        let mut config = Config { min_sample: 1, ..Config::default() };
        config.preset_densities.insert(11, 0.0);
        Dasymetric::new(config).run(&targets, &sources).unwrap()
    }

    #[test]
    fn field_order_follows_exchange_schema() {
        let schema = TableSchema {
            source_unit_id_column: "BLOCK".into(),
            ancillary_class_column: "LC".into(),
            population_count_column: "POP10".into(),
        };
        let out = assemble(&scenario(), &schema);
        assert_eq!(&out.targets.fields[..4], ["Value", "Count", "BLOCK", "LC"]);
        assert_eq!(out.targets.fields.last().map(String::as_str), Some(NEWDENSITY));
        assert_eq!(out.sources.fields, ["Value", "Count", "POP10", POP_AREA, POP_DENS, REP_CAT]);
        assert_eq!(out.classes.fields[1], "SUM_POP10");
    }

    #[test]
    fn rows_carry_final_values() {
        let out = assemble(&scenario(), &TableSchema::default());
        assert_eq!(out.targets.len(), 2);
        assert_eq!(out.targets.get(1, NEW_POP).and_then(Value::as_f64), Some(100.0));
        assert_eq!(out.targets.get(0, NEW_POP).and_then(Value::as_f64), Some(0.0));
        assert_eq!(out.sources.get(0, REP_CAT), Some(&json!(42)));

        let methods: Vec<_> = (0..out.classes.len())
            .filter_map(|r| out.classes.get(r, METHOD).and_then(Value::as_str))
            .collect();
        assert_eq!(methods, ["Preset", "Sampled"]);
        // Preset-only class has no sample.
        assert_eq!(out.classes.get(0, SAMPLEDENS), Some(&Value::Null));
    }
}
