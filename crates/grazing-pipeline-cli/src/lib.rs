//! Command surface for the grazing pipeline (binary `grc`).
//!
//! Commands print a JSON report on stdout; [`run_cli`] returns the process
//! exit code. `DriftConflict` errors map to exit 3, monitor severity maps to
//! exits 0/1/2 through `MonitorStatus::exit_code`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use grazing_pipeline_core::{
    parse_date, BiomassComposite, BoundaryRecord, HerdConfigInput, PipelineConfig,
    PipelineError, RunStatus, SoilSample, WeatherDay,
};
use grazing_pipeline_store_sqlite::SqlitePipelineStore;
use serde_json::{json, Value};
use time::Date;

#[derive(Debug, Parser)]
#[command(name = "grc")]
#[command(about = "Grazing recommendation pipeline CLI")]
pub struct Cli {
    #[arg(long, default_value = "./grazing_pipeline.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Load boundary, soil, and biomass reference data from JSON files.
    LoadReference(LoadReferenceArgs),
    /// Ingest herd + weather for a date range, materialize features, run the
    /// quality gate.
    Ingest(IngestArgs),
    /// Compute (or replay) the recommendation for one boundary/herd/day.
    Compute(ComputeArgs),
    /// Show the stored derivation of a recommendation.
    Explain(ExplainArgs),
    /// Evaluate the rolling output monitor for a boundary.
    Monitor(MonitorArgs),
}

#[derive(Debug, Args)]
pub struct LoadReferenceArgs {
    #[arg(long)]
    boundary: PathBuf,
    #[arg(long)]
    soil: Option<PathBuf>,
    #[arg(long)]
    biomass: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    boundary: PathBuf,
    #[arg(long)]
    herd: PathBuf,
    /// Pre-fetched weather JSON: either an Open-Meteo daily response or a
    /// plain array of day objects.
    #[arg(long)]
    weather: PathBuf,
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ComputeArgs {
    #[arg(long)]
    boundary_id: String,
    #[arg(long)]
    herd_config_id: String,
    #[arg(long)]
    as_of: String,
    #[arg(long, default_value = "./manifests")]
    manifest_root: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ExplainArgs {
    #[arg(long, conflicts_with_all = ["boundary_id", "herd_config_id", "as_of"])]
    run_id: Option<String>,
    #[arg(long, requires_all = ["herd_config_id", "as_of"])]
    boundary_id: Option<String>,
    #[arg(long)]
    herd_config_id: Option<String>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    #[arg(long)]
    boundary_id: String,
    #[arg(long)]
    end: String,
    #[arg(long, default_value_t = 30)]
    lookback_days: i64,
    #[arg(long, default_value = "./manifests")]
    report_root: PathBuf,
    /// Exit nonzero on warn status as well as crit. Pass
    /// `--fail-on-warn=false` to treat warnings as success.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    fail_on_warn: bool,
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Runs a parsed CLI invocation and returns the process exit code.
pub fn run_cli(cli: Cli) -> Result<i32> {
    let mut store = SqlitePipelineStore::open(&cli.db)?;
    store.migrate()?;

    match cli.command {
        Command::LoadReference(args) => run_load_reference(&args, &mut store),
        Command::Ingest(args) => run_ingest(&args, &mut store),
        Command::Compute(args) => run_compute(&args, &mut store),
        Command::Explain(args) => run_explain(&args, &store),
        Command::Monitor(args) => run_monitor(&args, &mut store),
    }
}

/// Exit code for a failed invocation: drift conflicts are distinguishable
/// from ordinary failures so automation can detect them.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<PipelineError>() {
        Some(PipelineError::DriftConflict(_)) => 3,
        _ => 1,
    }
}

fn run_load_reference(args: &LoadReferenceArgs, store: &mut SqlitePipelineStore) -> Result<i32> {
    let boundary = boundary_from_file(&args.boundary)?;
    store.upsert_boundary(&boundary)?;

    let soil_count = match &args.soil {
        Some(path) => {
            let samples = soil_from_file(path)?;
            store.replace_soil_partition(&boundary.boundary_id, &samples)?
        }
        None => 0,
    };
    let biomass_count = match &args.biomass {
        Some(path) => {
            let composites = biomass_from_file(path)?;
            store.replace_biomass_partition(&boundary.boundary_id, &composites)?
        }
        None => 0,
    };

    print_json(&json!({
        "boundary_id": boundary.boundary_id,
        "soil_samples": soil_count,
        "biomass_composites": biomass_count,
    }))?;
    Ok(0)
}

fn run_ingest(args: &IngestArgs, store: &mut SqlitePipelineStore) -> Result<i32> {
    let cfg = load_config(args.config.as_deref())?;
    let boundary = boundary_from_file(&args.boundary)?;
    let herd = herd_from_file(&args.herd)?;
    let weather = weather_from_file(&args.weather)?;
    let start = cli_date(&args.start)?;
    let end = cli_date(&args.end)?;

    let report = store.run_ingestion(&boundary, &herd, &weather, start, end, &cfg)?;
    let failed = report.status == RunStatus::Failed;
    print_json(&serde_json::to_value(&report)?)?;
    Ok(i32::from(failed))
}

fn run_compute(args: &ComputeArgs, store: &mut SqlitePipelineStore) -> Result<i32> {
    let cfg = load_config(args.config.as_deref())?;
    let as_of = cli_date(&args.as_of)?;

    let report = store.compute_recommendation(
        &args.boundary_id,
        &args.herd_config_id,
        as_of,
        &args.manifest_root,
        &cfg,
    )?;
    print_json(&serde_json::to_value(&report)?)?;
    Ok(0)
}

fn run_explain(args: &ExplainArgs, store: &SqlitePipelineStore) -> Result<i32> {
    let explained = match (&args.run_id, &args.boundary_id) {
        (Some(run_id), _) => store.explain_by_run_id(run_id)?,
        (None, Some(boundary_id)) => {
            let herd_config_id = args
                .herd_config_id
                .as_deref()
                .ok_or_else(|| anyhow!("--herd-config-id is required with --boundary-id"))?;
            let as_of = args
                .as_of
                .as_deref()
                .ok_or_else(|| anyhow!("--as-of is required with --boundary-id"))?;
            store.explain_by_key(boundary_id, herd_config_id, cli_date(as_of)?)?
        }
        (None, None) => {
            return Err(anyhow!(
                "pass either --run-id or --boundary-id/--herd-config-id/--as-of"
            ))
        }
    };
    print_json(&explained)?;
    Ok(0)
}

fn run_monitor(args: &MonitorArgs, store: &mut SqlitePipelineStore) -> Result<i32> {
    let cfg = load_config(args.config.as_deref())?;
    let end = cli_date(&args.end)?;

    let record = store.run_monitoring(
        &args.boundary_id,
        end,
        args.lookback_days,
        &args.report_root,
        &cfg,
    )?;
    let code = record.status.exit_code(args.fail_on_warn);
    print_json(&serde_json::to_value(&record)?)?;
    Ok(code)
}

// -- input files -----------------------------------------------------------

fn read_json_file(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not valid JSON", path.display()))
}

fn boundary_from_file(path: &Path) -> Result<BoundaryRecord> {
    let value = read_json_file(path)?;
    serde_json::from_value(value)
        .with_context(|| format!("{} is not a valid boundary record", path.display()))
}

/// The full herd file is kept as the content snapshot; edits therefore derive
/// a new herd config id.
fn herd_from_file(path: &Path) -> Result<HerdConfigInput> {
    let value = read_json_file(path)?;

    let animal_count = value
        .get("animal_count")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("{}: animal_count is required", path.display()))?;
    let daily_intake_kg_per_head = value
        .get("daily_intake_kg_per_head")
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("{}: daily_intake_kg_per_head is required", path.display()))?;
    let source_id = value
        .get("herd_id")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let animal_type = value
        .get("animal_type")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    Ok(HerdConfigInput {
        source_id,
        animal_count,
        daily_intake_kg_per_head,
        animal_type,
        snapshot: value,
    })
}

fn soil_from_file(path: &Path) -> Result<Vec<SoilSample>> {
    let value = read_json_file(path)?;
    serde_json::from_value(value)
        .with_context(|| format!("{} is not a valid soil sample array", path.display()))
}

fn biomass_from_file(path: &Path) -> Result<Vec<BiomassComposite>> {
    let value = read_json_file(path)?;
    serde_json::from_value(value)
        .with_context(|| format!("{} is not a valid biomass composite array", path.display()))
}

fn weather_from_file(path: &Path) -> Result<Vec<WeatherDay>> {
    let value = read_json_file(path)?;
    if value.get("daily").is_some() {
        parse_open_meteo_daily(&value)
            .with_context(|| format!("{} is not a valid Open-Meteo response", path.display()))
    } else {
        serde_json::from_value(value)
            .with_context(|| format!("{} is not a valid weather day array", path.display()))
    }
}

/// Open-Meteo daily responses are columnar: parallel arrays under `daily`,
/// keyed by the `time` array.
fn parse_open_meteo_daily(value: &Value) -> Result<Vec<WeatherDay>> {
    let daily = value
        .get("daily")
        .ok_or_else(|| anyhow!("missing daily block"))?;
    let times = daily
        .get("time")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("missing daily.time array"))?;

    let column = |name: &str| -> Vec<Option<f64>> {
        daily
            .get(name)
            .and_then(Value::as_array)
            .map(|values| values.iter().map(Value::as_f64).collect())
            .unwrap_or_else(|| vec![None; times.len()])
    };
    let precipitation = column("precipitation_sum");
    let temp_max = column("temperature_2m_max");
    let temp_min = column("temperature_2m_min");
    let wind = column("wind_speed_10m_max");

    let mut out = Vec::with_capacity(times.len());
    for (idx, time_value) in times.iter().enumerate() {
        let raw = time_value
            .as_str()
            .ok_or_else(|| anyhow!("daily.time[{idx}] is not a string"))?;
        out.push(WeatherDay {
            forecast_date: cli_date(raw)?,
            precipitation_mm: precipitation.get(idx).copied().flatten(),
            temp_max_c: temp_max.get(idx).copied().flatten(),
            temp_min_c: temp_min.get(idx).copied().flatten(),
            wind_speed_kmh: wind.get(idx).copied().flatten(),
        });
    }
    Ok(out)
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let cfg = match path {
        Some(path) => {
            let value = read_json_file(path)?;
            serde_json::from_value(value)
                .with_context(|| format!("{} is not a valid pipeline config", path.display()))?
        }
        None => PipelineConfig::default(),
    };
    cfg.validate().map_err(anyhow::Error::new)?;
    Ok(cfg)
}

fn cli_date(raw: &str) -> Result<Date> {
    parse_date(raw).map_err(anyhow::Error::new)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err:?}"),
        }
    }

    #[test]
    fn open_meteo_daily_parses_columnar_arrays() {
        let value = json!({
            "daily": {
                "time": ["2025-06-01", "2025-06-02"],
                "precipitation_sum": [0.5, null],
                "temperature_2m_max": [24.0, 25.5],
                "temperature_2m_min": [10.0, 11.0],
                "wind_speed_10m_max": [7.0, 9.0],
            }
        });
        let days = must_ok(parse_open_meteo_daily(&value));
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].precipitation_mm, Some(0.5));
        assert_eq!(days[1].precipitation_mm, None);
        assert_eq!(days[1].temp_max_c, Some(25.5));
    }

    #[test]
    fn open_meteo_missing_columns_become_nulls() {
        let value = json!({
            "daily": { "time": ["2025-06-01"] }
        });
        let days = must_ok(parse_open_meteo_daily(&value));
        assert_eq!(days.len(), 1);
        assert!(days[0].precipitation_mm.is_none());
        assert!(days[0].wind_speed_kmh.is_none());
    }

    #[test]
    fn drift_conflicts_map_to_exit_3() {
        let drift = anyhow::Error::new(PipelineError::DriftConflict("x".to_string()));
        assert_eq!(exit_code_for(&drift), 3);

        let other = anyhow!("plain failure");
        assert_eq!(exit_code_for(&other), 1);
    }
}
