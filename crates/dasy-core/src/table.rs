//! Exchange tables and typed input records.
//!
//! The geoprocessing layer hands over attribute tables as
//! `{"fields": [...], "rows": [[...], ...]}`. This module validates those
//! tables into typed records and provides the two aggregation primitives
//! the rest of the pipeline is built from: keyed group-sum and a sparse
//! keyed left-join.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::TableSchema;
use crate::error::{DasyError, Result};

/// Unique id column shared by every raster attribute table.
pub const ID_FIELD: &str = "Value";
/// Cell-count column shared by every raster attribute table.
pub const COUNT_FIELD: &str = "Count";

pub const TARGET_TABLE: &str = "target units";
pub const SOURCE_TABLE: &str = "source units";

pub type UnitId = i64;
pub type ClassCode = i64;

// ── Exchange table ────────────────────────────────────────────────────────────

/// Column-named table in the exchange format.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Table {
    pub fields: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self { fields: fields.into_iter().map(Into::into).collect(), rows: Vec::new() }
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.fields.len());
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of column `name`, or `SchemaMismatch`.
    pub fn column(&self, table: &str, name: &str) -> Result<usize> {
        self.fields.iter().position(|f| f == name).ok_or_else(|| DasyError::SchemaMismatch {
            table: table.to_owned(),
            column: name.to_owned(),
        })
    }

    /// Finite numeric cell.
    pub fn number(&self, table: &str, row: usize, col: usize) -> Result<f64> {
        let cell = self.rows[row].get(col);
        match cell.and_then(Value::as_f64) {
            Some(v) if v.is_finite() => Ok(v),
            Some(_) => Err(DasyError::value(table, row, &self.fields[col], "not finite")),
            None => Err(DasyError::value(
                table,
                row,
                &self.fields[col],
                format!("expected a number, found {}", cell.map_or_else(|| "nothing".to_owned(), Value::to_string)),
            )),
        }
    }

    /// Integral numeric cell. Attribute tables often store codes as floats,
    /// so `42.0` is accepted and `42.5` is not.
    pub fn integer(&self, table: &str, row: usize, col: usize) -> Result<i64> {
        if let Some(v) = self.rows[row].get(col).and_then(Value::as_i64) {
            return Ok(v);
        }
        let v = self.number(table, row, col)?;
        if v.fract() != 0.0 || v.abs() >= i64::MAX as f64 {
            return Err(DasyError::value(table, row, &self.fields[col], format!("{v} is not an integer code")));
        }
        Ok(v as i64)
    }

    /// Look up a named cell in an already-validated row.
    pub fn get(&self, row: usize, name: &str) -> Option<&Value> {
        let col = self.fields.iter().position(|f| f == name)?;
        self.rows.get(row)?.get(col)
    }
}

// ── Typed records ─────────────────────────────────────────────────────────────

/// One (source unit × ancillary class) intersection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetUnit {
    pub id: UnitId,
    pub source_unit_id: UnitId,
    pub ancillary_class: ClassCode,
    /// Ancillary-raster cell count, > 0.
    pub area: f64,
}

/// One row of the source-unit population table as delivered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: UnitId,
    pub population_count: f64,
    /// `Count` column if present; only cross-checked against target areas.
    pub reported_area: Option<f64>,
}

/// Validate the target-unit table into records, in row order.
pub fn read_target_units(table: &Table, schema: &TableSchema) -> Result<Vec<TargetUnit>> {
    let t = TARGET_TABLE;
    let id_col = table.column(t, ID_FIELD)?;
    let area_col = table.column(t, COUNT_FIELD)?;
    let src_col = table.column(t, &schema.source_unit_id_column)?;
    let class_col = table.column(t, &schema.ancillary_class_column)?;

    let mut seen = BTreeSet::new();
    let mut units = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        let id = table.integer(t, row, id_col)?;
        if !seen.insert(id) {
            return Err(DasyError::DuplicateKey { table: t.to_owned(), key: id });
        }
        let keyed = |e: DasyError| e.with_key(id);
        let area = table.number(t, row, area_col).map_err(keyed)?;
        if area <= 0.0 {
            return Err(keyed(DasyError::value(t, row, COUNT_FIELD, format!("area must be > 0, got {area}"))));
        }
        units.push(TargetUnit {
            id,
            source_unit_id: table.integer(t, row, src_col).map_err(keyed)?,
            ancillary_class: table.integer(t, row, class_col).map_err(keyed)?,
            area,
        });
    }
    Ok(units)
}

/// Validate the source-unit population table into records, in row order.
pub fn read_source_units(table: &Table, schema: &TableSchema) -> Result<Vec<SourceRecord>> {
    let t = SOURCE_TABLE;
    let id_col = table.column(t, ID_FIELD)?;
    let pop_col = table.column(t, &schema.population_count_column)?;
    let area_col = table.column(t, COUNT_FIELD).ok();

    let mut seen = BTreeSet::new();
    let mut units = Vec::with_capacity(table.len());
    for row in 0..table.len() {
        let id = table.integer(t, row, id_col)?;
        if !seen.insert(id) {
            return Err(DasyError::DuplicateKey { table: t.to_owned(), key: id });
        }
        let keyed = |e: DasyError| e.with_key(id);
        let population_count = table.number(t, row, pop_col).map_err(keyed)?;
        if population_count < 0.0 {
            return Err(keyed(DasyError::value(
                t,
                row,
                &schema.population_count_column,
                format!("population must be >= 0, got {population_count}"),
            )));
        }
        let reported_area = match area_col {
            Some(col) => Some(table.number(t, row, col).map_err(keyed)?),
            None => None,
        };
        units.push(SourceRecord { id, population_count, reported_area });
    }
    Ok(units)
}

// ── Aggregation primitives ────────────────────────────────────────────────────

/// Sum `N` numeric fields per key. Keys are ordered so downstream
/// iteration (and floating-point summation order) is deterministic.
pub fn group_sum<R, K, const N: usize>(
    rows: &[R],
    key: impl Fn(&R) -> K,
    values: impl Fn(&R) -> [f64; N],
) -> BTreeMap<K, [f64; N]>
where
    K: Ord,
{
    let mut out: BTreeMap<K, [f64; N]> = BTreeMap::new();
    for r in rows {
        let acc = out.entry(key(r)).or_insert([0.0; N]);
        for (a, v) in acc.iter_mut().zip(values(r)) {
            *a += v;
        }
    }
    out
}

/// Attach the scalar computed for each row's key. Joins in this domain are
/// sparse on purpose, so a missing key yields 0 instead of an error.
pub fn join_scalar<R, K>(rows: &[R], key: impl Fn(&R) -> K, lookup: &BTreeMap<K, f64>) -> Vec<f64>
where
    K: Ord,
{
    rows.iter().map(|r| lookup.get(&key(r)).copied().unwrap_or(0.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> TableSchema {
        TableSchema {
            source_unit_id_column: "BLOCK".into(),
            ancillary_class_column: "LC".into(),
            population_count_column: "POP".into(),
        }
    }

    fn target_table() -> Table {
        let mut t = Table::new(["Value", "Count", "BLOCK", "LC"]);
        t.push_row(vec![json!(1), json!(10), json!(100), json!(11)]);
        t.push_row(vec![json!(2), json!(90.0), json!(100), json!(42.0)]);
        t
    }

    #[test]
    fn reads_target_units_with_float_codes() {
        let units = read_target_units(&target_table(), &schema()).unwrap();
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].ancillary_class, 42);
        assert_eq!(units[1].area, 90.0);
    }

    #[test]
    fn missing_column_is_schema_mismatch() {
        let mut s = schema();
        s.ancillary_class_column = "NLCD".into();
        let err = read_target_units(&target_table(), &s).unwrap_err();
        assert_eq!(
            err,
            DasyError::SchemaMismatch { table: TARGET_TABLE.into(), column: "NLCD".into() }
        );
    }

    #[test]
    fn fractional_class_code_rejected() {
        let mut t = target_table();
        t.rows[0][3] = json!(11.5);
        assert!(matches!(
            read_target_units(&t, &schema()),
            Err(DasyError::InvalidValue { row: 0, .. })
        ));
    }

    #[test]
    fn code_at_two_pow_63_rejected() {
        let mut t = target_table();
        t.rows[0][2] = json!(9_223_372_036_854_775_808.0_f64);
        assert!(matches!(
            read_target_units(&t, &schema()),
            Err(DasyError::InvalidValue { row: 0, .. })
        ));
    }

    #[test]
    fn bad_cell_error_names_row_id() {
        let mut t = target_table();
        t.rows[1][3] = json!("forest");
        assert!(matches!(
            read_target_units(&t, &schema()),
            Err(DasyError::InvalidValue { row: 1, key: Some(2), .. })
        ));
    }

    #[test]
    fn duplicate_target_id_rejected() {
        let mut t = target_table();
        t.rows[1][0] = json!(1);
        assert_eq!(
            read_target_units(&t, &schema()).unwrap_err(),
            DasyError::DuplicateKey { table: TARGET_TABLE.into(), key: 1 }
        );
    }

    #[test]
    fn zero_area_rejected() {
        let mut t = target_table();
        t.rows[0][1] = json!(0);
        assert!(read_target_units(&t, &schema()).is_err());
    }

    #[test]
    fn source_count_column_is_optional() {
        let mut t = Table::new(["Value", "POP"]);
        t.push_row(vec![json!(100), json!(5)]);
        let units = read_source_units(&t, &schema()).unwrap();
        assert_eq!(units[0].reported_area, None);
        assert_eq!(units[0].population_count, 5.0);
    }

    #[test]
    fn negative_population_rejected() {
        let mut t = Table::new(["Value", "Count", "POP"]);
        t.push_row(vec![json!(100), json!(3), json!(-1)]);
        assert!(matches!(
            read_source_units(&t, &schema()),
            Err(DasyError::InvalidValue { key: Some(100), .. })
        ));
    }

    #[test]
    fn non_numeric_population_rejected() {
        let mut t = Table::new(["Value", "POP"]);
        t.push_row(vec![json!(100), json!("many")]);
        assert!(read_source_units(&t, &schema()).is_err());
    }

    #[test]
    fn group_sum_sums_each_field_per_key() {
        let rows = [(1, 2.0, 3.0), (2, 1.0, 1.0), (1, 4.0, 5.0)];
        let sums = group_sum(&rows, |r| r.0, |r| [r.1, r.2]);
        assert_eq!(sums[&1], [6.0, 8.0]);
        assert_eq!(sums[&2], [1.0, 1.0]);
    }

    #[test]
    fn join_scalar_defaults_missing_keys_to_zero() {
        let rows = [1, 2, 3];
        let lookup = BTreeMap::from([(1, 0.5), (3, 2.0)]);
        assert_eq!(join_scalar(&rows, |r| *r, &lookup), vec![0.5, 0.0, 2.0]);
    }
}
