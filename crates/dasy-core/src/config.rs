//! Run parameters: the raw serde form read from disk and the validated form
//! every stage consumes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DasyError, Result};
use crate::table::ClassCode;

/// Names of the domain-specific columns in the input tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSchema {
    /// Column of the target table holding the owning source unit id.
    pub source_unit_id_column: String,
    /// Column of the target table holding the ancillary class code.
    pub ancillary_class_column: String,
    /// Column of the source table holding the population count.
    pub population_count_column: String,
}

impl Default for TableSchema {
    fn default() -> Self {
        Self {
            source_unit_id_column: "SOURCE_ID".into(),
            ancillary_class_column: "ANC_CLASS".into(),
            population_count_column: "POPULATION".into(),
        }
    }
}

/// Run configuration as written by the user.
///
/// Preset densities are kept as raw JSON so a bad entry can be reported by
/// class instead of failing the whole document parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Class code (as text) → preset density (people per cell).
    pub preset_densities: BTreeMap<String, Value>,
    /// Minimum representative source units for a class to count as sampled.
    pub min_sample: u32,
    /// Target units must be strictly larger than this (cells) to be sampled.
    pub min_sampling_area: u64,
    /// Share of a source unit's populated area one class must cover, (0, 1].
    pub percent_threshold: f64,
    #[serde(flatten)]
    pub schema: TableSchema,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            preset_densities: BTreeMap::new(),
            min_sample: 3,
            min_sampling_area: 0,
            percent_threshold: 0.95,
            schema: TableSchema::default(),
        }
    }
}

impl RunConfig {
    /// Check every parameter and produce the typed `Config`.
    pub fn validate(&self) -> Result<Config> {
        let mut preset_densities = BTreeMap::new();
        for (key, raw) in &self.preset_densities {
            let field = format!("preset_densities[{key}]");
            let class: ClassCode = key
                .trim()
                .parse()
                .map_err(|_| DasyError::config(&field, "class code is not an integer"))?;
            let density = raw
                .as_f64()
                .ok_or_else(|| DasyError::config(&field, format!("density {raw} is not numeric")))?;
            if !density.is_finite() || density < 0.0 {
                return Err(DasyError::config(&field, format!("density {density} must be >= 0")));
            }
            if preset_densities.insert(class, density).is_some() {
                return Err(DasyError::config(&field, "class listed twice"));
            }
        }

        if self.min_sample < 1 {
            return Err(DasyError::config("min_sample", "must be >= 1"));
        }
        let p = self.percent_threshold;
        if !(p > 0.0 && p <= 1.0) {
            return Err(DasyError::config("percent_threshold", format!("{p} not in (0, 1]")));
        }

        Ok(Config {
            preset_densities,
            min_sample: self.min_sample as usize,
            min_sampling_area: self.min_sampling_area as f64,
            percent_threshold: p,
        })
    }
}

/// Validated, immutable run parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub preset_densities: BTreeMap<ClassCode, f64>,
    pub min_sample: usize,
    pub min_sampling_area: f64,
    pub percent_threshold: f64,
}

impl Config {
    pub fn preset(&self, class: ClassCode) -> Option<f64> {
        self.preset_densities.get(&class).copied()
    }

    /// Classes preset to density 0 are uninhabited.
    pub fn is_uninhabited(&self, class: ClassCode) -> bool {
        self.preset(class) == Some(0.0)
    }
}

impl Default for Config {
    fn default() -> Self {
        // RunConfig::default() always validates.
        Self {
            preset_densities: BTreeMap::new(),
            min_sample: 3,
            min_sampling_area: 0.0,
            percent_threshold: 0.95,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_run_config_validates() {
        assert_eq!(RunConfig::default().validate().unwrap(), Config::default());
    }

    #[test]
    fn parses_presets_from_json() {
        let raw: RunConfig = serde_json::from_value(json!({
            "preset_densities": { "11": 0, "90": 0.0, " 21 ": 2.5 },
            "min_sample": 2,
            "ancillary_class_column": "NLCD"
        }))
        .unwrap();
        let cfg = raw.validate().unwrap();
        assert_eq!(cfg.preset(21), Some(2.5));
        assert!(cfg.is_uninhabited(11));
        assert!(cfg.is_uninhabited(90));
        assert!(!cfg.is_uninhabited(21));
        assert_eq!(cfg.min_sample, 2);
        assert_eq!(raw.schema.ancillary_class_column, "NLCD");
        assert_eq!(raw.schema.population_count_column, "POPULATION");
    }

    #[test]
    fn non_numeric_preset_is_invalid_config() {
        let mut raw = RunConfig::default();
        raw.preset_densities.insert("11".into(), json!("zero"));
        assert!(matches!(raw.validate(), Err(DasyError::InvalidConfig { .. })));
    }

    #[test]
    fn negative_preset_is_invalid_config() {
        let mut raw = RunConfig::default();
        raw.preset_densities.insert("11".into(), json!(-0.5));
        assert!(matches!(raw.validate(), Err(DasyError::InvalidConfig { .. })));
    }

    #[test]
    fn non_integer_class_key_is_invalid_config() {
        let mut raw = RunConfig::default();
        raw.preset_densities.insert("water".into(), json!(0));
        assert!(raw.validate().is_err());
    }

    #[test]
    fn duplicate_class_after_trim_is_invalid_config() {
        let mut raw = RunConfig::default();
        raw.preset_densities.insert("11".into(), json!(0));
        raw.preset_densities.insert(" 11".into(), json!(1));
        assert!(raw.validate().is_err());
    }

    #[test]
    fn threshold_bounds() {
        let mut raw = RunConfig { percent_threshold: 1.0, ..RunConfig::default() };
        assert!(raw.validate().is_ok());
        raw.percent_threshold = 0.0;
        assert!(raw.validate().is_err());
        raw.percent_threshold = 1.01;
        assert!(raw.validate().is_err());
        raw.percent_threshold = f64::NAN;
        assert!(raw.validate().is_err());
    }

    #[test]
    fn zero_min_sample_rejected() {
        let raw = RunConfig { min_sample: 0, ..RunConfig::default() };
        assert!(matches!(raw.validate(), Err(DasyError::InvalidConfig { .. })));
    }
}
