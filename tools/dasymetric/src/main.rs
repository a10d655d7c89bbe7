//! Dasymetric redistribution tool.
//!
//! Reads the intersected target-unit table and the source-unit population
//! table exported by the geoprocessing layer, redistributes population, and
//! writes three tables back: per target unit, per source unit, per class.
//! Output: {output}/target_units.json, source_units.json, class_densities.json

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use dasy_core::pipeline::DEFAULT_TOLERANCE;
use dasy_core::{check_conservation, Dasymetric, DasyResult, OutputTables, RunConfig, Table};
use serde::de::DeserializeOwned;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "dasymetric", about = "Redistribute source-unit population over ancillary classes")]
struct Args {
    /// Target-unit table (source unit × ancillary class intersections).
    #[arg(short, long)]
    targets: PathBuf,

    /// Source-unit population table.
    #[arg(short, long)]
    sources: PathBuf,

    /// Run config JSON (preset densities, thresholds, column names).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory for the three result tables.
    #[arg(short, long, default_value = "data/dasymetric")]
    output: PathBuf,

    /// Override: minimum representative source units per sampled class.
    #[arg(long)]
    min_sample: Option<u32>,

    /// Override: target units must exceed this many cells to be sampled.
    #[arg(long)]
    min_sampling_area: Option<u64>,

    /// Override: share of populated area one class must cover, (0, 1].
    #[arg(long)]
    percent_threshold: Option<f64>,

    /// Override: source unit id column of the target table.
    #[arg(long)]
    source_id_column: Option<String>,

    /// Override: ancillary class column of the target table.
    #[arg(long)]
    class_column: Option<String>,

    /// Override: population column of the source table.
    #[arg(long)]
    population_column: Option<String>,

    /// Maximum relative conservation error tolerated per source unit.
    #[arg(long, default_value_t = DEFAULT_TOLERANCE)]
    tolerance: f64,

    /// Logging filter in EnvFilter syntax, e.g. "debug" or "info,dasy_core=debug".
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Command-line values take precedence over the config file.
    fn apply_overrides(&self, run: &mut RunConfig) {
        if let Some(v) = self.min_sample {
            run.min_sample = v;
        }
        if let Some(v) = self.min_sampling_area {
            run.min_sampling_area = v;
        }
        if let Some(v) = self.percent_threshold {
            run.percent_threshold = v;
        }
        if let Some(v) = &self.source_id_column {
            run.schema.source_unit_id_column = v.clone();
        }
        if let Some(v) = &self.class_column {
            run.schema.ancillary_class_column = v.clone();
        }
        if let Some(v) = &self.population_column {
            run.schema.population_count_column = v.clone();
        }
    }
}

// ── I/O helpers ───────────────────────────────────────────────────────────────

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Every table is staged next to its destination before any is renamed into
/// place, so a failed write leaves the previous outputs untouched.
fn write_tables(out_dir: &Path, tables: &OutputTables) -> Result<()> {
    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let outputs = [
        ("target_units.json", &tables.targets),
        ("source_units.json", &tables.sources),
        ("class_densities.json", &tables.classes),
    ];

    let mut staged = Vec::with_capacity(outputs.len());
    for (name, table) in outputs {
        let tmp = out_dir.join(format!(".{name}.tmp"));
        let written = serde_json::to_string_pretty(table)
            .map_err(anyhow::Error::from)
            .and_then(|text| fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display())));
        if let Err(e) = written {
            for (tmp, _) in &staged {
                fs::remove_file(tmp).ok();
            }
            fs::remove_file(&tmp).ok();
            return Err(e);
        }
        staged.push((tmp, out_dir.join(name)));
    }

    for (tmp, path) in staged {
        fs::rename(&tmp, &path).with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
        eprintln!("  -> {}", path.display());
    }
    Ok(())
}

fn print_summary(result: &DasyResult) {
    eprintln!(
        "\n{:>8} {:>8} {:>12} {:>12} {:>10} {:>12}",
        "Class", "Method", "SumPop", "SumArea", "Sampled", "Density"
    );
    eprintln!("{}", "-".repeat(67));
    for c in &result.classes {
        let sampled = c.sampled_density.map_or_else(|| "-".to_owned(), |d| format!("{d:.4}"));
        eprintln!(
            "{:>8} {:>8} {:>12.1} {:>12.1} {:>10} {:>12.4}",
            c.class_code, c.method, c.sum_population, c.sum_populated_area, sampled, c.class_density
        );
    }
}

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| match EnvFilter::try_new(level) {
            Ok(filter) => Ok(filter),
            Err(e) => {
                eprintln!("invalid log filter: {level}, using info, err is: {e}");
                EnvFilter::try_new("info")
            }
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to init logger: {e}");
    }
}

/// Load, run, verify. Returns the result and tables only if every check passes.
fn run(args: &Args) -> Result<(DasyResult, OutputTables)> {
    let mut run_config: RunConfig = match &args.config {
        Some(path) => read_json(path)?,
        None => RunConfig::default(),
    };
    args.apply_overrides(&mut run_config);
    let pipeline = Dasymetric::from_run_config(&run_config).context("validating run config")?;

    let target_table: Table = read_json(&args.targets)?;
    let source_table: Table = read_json(&args.sources)?;
    info!(targets = target_table.len(), sources = source_table.len(), "tables loaded");

    let (result, tables) = pipeline
        .run_tables(&target_table, &source_table, &run_config.schema)
        .context("redistributing population")?;

    let report = check_conservation(&result);
    if !report.holds(args.tolerance) {
        bail!(
            "population not conserved: max relative error {:.3e} (source {:?}), {} source units without target units",
            report.max_error,
            report.worst_source,
            report.unplaced.len()
        );
    }
    info!(checked = report.checked, max_error = report.max_error, "conservation verified");
    Ok((result, tables))
}

// ── main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let (result, tables) = run(&args)?;
    print_summary(&result);
    write_tables(&args.output, &tables)?;

    eprintln!(
        "\nDone. {} target units, {} source units, {} classes.",
        tables.targets.len(),
        tables.sources.len(),
        tables.classes.len()
    );
    Ok(())
}

// ── Unit tests ────────────────────────────────────────────────────────────────
