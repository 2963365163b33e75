//! Data-quality checks evaluated after ingestion and before compute.
//!
//! Every check returns a [`CheckResult`] rather than erroring, so a run can
//! record the complete verdict set even when the first check already fails.
//! `Hard` failures fail the run; `Warn` failures only downgrade it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{Date, Duration};

use crate::{
    format_date, inclusive_day_count, BiomassComposite, CheckSeverity, FeatureDay,
    HerdConfigInput, PipelineConfig, PipelineError, RunStatus, SoilSample, WeatherDay,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub kind: String,
    pub severity: CheckSeverity,
    pub passed: bool,
    pub details: Value,
}

impl CheckResult {
    fn hard(name: &str, kind: &str, passed: bool, details: Value) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            severity: CheckSeverity::Hard,
            passed,
            details,
        }
    }

    fn warn(name: &str, kind: &str, passed: bool, details: Value) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            severity: CheckSeverity::Warn,
            passed,
            details,
        }
    }
}

#[must_use]
pub fn check_herd_config_valid(herd: &HerdConfigInput) -> CheckResult {
    let (passed, reason) = match herd.validate() {
        Ok(()) => (true, Value::Null),
        Err(err) => (false, Value::String(err.to_string())),
    };
    CheckResult::hard(
        "herd_config_valid",
        "validity",
        passed,
        json!({
            "animal_count": herd.animal_count,
            "daily_intake_kg_per_head": herd.daily_intake_kg_per_head,
            "reason": reason,
        }),
    )
}

#[must_use]
pub fn check_soil_present(soil: &[SoilSample]) -> CheckResult {
    CheckResult::hard(
        "soil_present",
        "presence",
        !soil.is_empty(),
        json!({ "sample_count": soil.len() }),
    )
}

#[must_use]
pub fn check_rap_present(composites: &[BiomassComposite]) -> CheckResult {
    CheckResult::hard(
        "rap_present",
        "presence",
        !composites.is_empty(),
        json!({ "composite_count": composites.len() }),
    )
}

/// The weather series must cover every day of the requested range exactly
/// once. Counts only rows inside `[start, end]`; out-of-range rows from a
/// wider fetch do not mask a gap.
///
/// # Errors
/// Returns [`PipelineError::Validation`] for a reversed range.
pub fn check_weather_response_complete(
    weather: &[WeatherDay],
    start: Date,
    end: Date,
) -> Result<CheckResult, PipelineError> {
    let expected = inclusive_day_count(start, end)?;
    let in_range = weather
        .iter()
        .filter(|row| row.forecast_date >= start && row.forecast_date <= end)
        .count() as i64;

    Ok(CheckResult::hard(
        "weather_response_complete",
        "completeness",
        in_range == expected,
        json!({
            "expected_days": expected,
            "rows_in_range": in_range,
            "range_start": format_date(start)?,
            "range_end": format_date(end)?,
        }),
    ))
}

/// The materialized feature table must be dense over the range, carry weather
/// for every day, and carry biomass for at least one day.
///
/// # Errors
/// Returns [`PipelineError::Validation`] for a reversed range.
pub fn check_daily_features_complete(
    rows: &[FeatureDay],
    start: Date,
    end: Date,
) -> Result<CheckResult, PipelineError> {
    let expected = inclusive_day_count(start, end)?;
    let row_count = rows.len() as i64;
    let missing_weather = rows.iter().filter(|row| !row.has_weather()).count() as i64;
    let missing_biomass = rows
        .iter()
        .filter(|row| row.biomass_kg_per_ha.is_none())
        .count() as i64;

    let passed = row_count == expected && missing_weather == 0 && missing_biomass < expected;

    Ok(CheckResult::hard(
        "daily_features_complete",
        "completeness",
        passed,
        json!({
            "expected_days": expected,
            "row_count": row_count,
            "missing_weather_days": missing_weather,
            "missing_biomass_days": missing_biomass,
        }),
    ))
}

/// # Errors
/// Returns [`PipelineError::Validation`] when detail formatting fails.
pub fn check_weather_fresh_enough(
    weather: &[WeatherDay],
    end: Date,
    cfg: &PipelineConfig,
) -> Result<CheckResult, PipelineError> {
    let latest = weather.iter().map(|row| row.forecast_date).max();
    freshness_check(
        "weather_fresh_enough",
        latest,
        end,
        cfg.weather_stale_days,
    )
}

/// # Errors
/// Returns [`PipelineError::Validation`] when detail formatting fails.
pub fn check_rap_fresh_enough(
    composites: &[BiomassComposite],
    end: Date,
    cfg: &PipelineConfig,
) -> Result<CheckResult, PipelineError> {
    let latest = composites.iter().map(|row| row.composite_date).max();
    freshness_check("rap_fresh_enough", latest, end, cfg.rap_stale_days)
}

fn freshness_check(
    name: &str,
    latest: Option<Date>,
    end: Date,
    stale_days: i64,
) -> Result<CheckResult, PipelineError> {
    let threshold = end - Duration::days(stale_days);
    let passed = latest.is_some_and(|date| date >= threshold);

    let latest_str = match latest {
        Some(date) => Value::String(format_date(date)?),
        None => Value::Null,
    };

    Ok(CheckResult::warn(
        name,
        "freshness",
        passed,
        json!({
            "latest_date": latest_str,
            "stale_threshold_date": format_date(threshold)?,
            "stale_days": stale_days,
        }),
    ))
}

/// Rolls the check verdicts up to a run status: any failed `Hard` check fails
/// the run, any failed `Warn` check downgrades it to warnings.
#[must_use]
pub fn aggregate_run_status(results: &[CheckResult]) -> RunStatus {
    let hard_failed = results
        .iter()
        .any(|result| result.severity == CheckSeverity::Hard && !result.passed);
    if hard_failed {
        return RunStatus::Failed;
    }

    let warn_failed = results
        .iter()
        .any(|result| result.severity == CheckSeverity::Warn && !result.passed);
    if warn_failed {
        RunStatus::SucceededWithWarnings
    } else {
        RunStatus::Succeeded
    }
}
