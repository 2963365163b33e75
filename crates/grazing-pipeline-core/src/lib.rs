//! Domain model and pure pipeline logic for the grazing recommendation
//! pipeline: temporal feature joins, data-quality checks, the days-remaining
//! calculation, provenance manifests, and the rolling output monitor.
//!
//! Everything here is side-effect free; persistence lives in
//! `grazing-pipeline-store-sqlite`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, Duration, OffsetDateTime, UtcOffset};

pub mod canonical;
pub mod checks;
pub mod join;
pub mod logic;
pub mod manifest;
pub mod monitor;

pub use canonical::{canonical_json, sha256_hex};

const DATE_FORMAT: &[time::format_description::FormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("missing dependency: {0}")]
    MissingDependency(String),
    #[error("drift conflict: {0}")]
    DriftConflict(String),
}

/// Parses a calendar date in `YYYY-MM-DD` form.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when the input is not a valid date.
pub fn parse_date(value: &str) -> Result<Date, PipelineError> {
    Date::parse(value, DATE_FORMAT)
        .map_err(|err| PipelineError::Validation(format!("invalid date {value:?}: {err}")))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, PipelineError> {
    value
        .format(DATE_FORMAT)
        .map_err(|err| PipelineError::Validation(format!("failed to format date: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, PipelineError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| PipelineError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(PipelineError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, PipelineError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| PipelineError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
        .replace_nanosecond(0)
        .unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Number of days in the inclusive `[start, end]` range.
///
/// # Errors
/// Returns [`PipelineError::Validation`] when `start > end`.
pub fn inclusive_day_count(start: Date, end: Date) -> Result<i64, PipelineError> {
    if start > end {
        return Err(PipelineError::Validation(format!(
            "invalid date range: start {start} is after end {end}"
        )));
    }
    Ok((end - start).whole_days() + 1)
}

/// Serde adapter for `Date` fields rendered as `YYYY-MM-DD`.
pub mod iso_date {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Fails when the date cannot be formatted.
    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = super::format_date(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    /// # Errors
    /// Fails when the input is not a valid `YYYY-MM-DD` date.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional `Date` fields rendered as `YYYY-MM-DD`.
pub mod iso_date_option {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    /// # Errors
    /// Fails when the date cannot be formatted.
    pub fn serialize<S: Serializer>(
        value: &Option<Date>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(date) => {
                let formatted = super::format_date(*date).map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(&formatted)
            }
            None => serializer.serialize_none(),
        }
    }

    /// # Errors
    /// Fails when the input is not a valid `YYYY-MM-DD` date.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Date>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|value| super::parse_date(&value).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    SucceededWithWarnings,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::SucceededWithWarnings => "succeeded_with_warnings",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "succeeded" => Some(Self::Succeeded),
            "succeeded_with_warnings" => Some(Self::SucceededWithWarnings),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Severity class of a data-quality check: a failed `Hard` check fails the
/// run, a failed `Warn` check only downgrades it to warnings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    Warn,
    Hard,
}

impl CheckSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Hard => "hard",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warn" => Some(Self::Warn),
            "hard" => Some(Self::Hard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MonitorStatus {
    Ok,
    Warn,
    Crit,
}

impl MonitorStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Crit => "crit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ok" => Some(Self::Ok),
            "warn" => Some(Self::Warn),
            "crit" => Some(Self::Crit),
            _ => None,
        }
    }

    #[must_use]
    pub fn exit_code(self, fail_on_warn: bool) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Warn => i32::from(fail_on_warn),
            Self::Crit => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warn,
    Crit,
}

impl AlertSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Crit => "crit",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "warn" => Some(Self::Warn),
            "crit" => Some(Self::Crit),
            _ => None,
        }
    }
}

/// Immutable pipeline configuration passed explicitly into each operation.
/// Threshold defaults mirror the reference deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub weather_stale_days: i64,
    pub rap_stale_days: i64,

    pub max_days_remaining: f64,
    pub min_days_remaining: f64,

    pub weather_source_version: String,

    pub monitor_zero_days_warn_pct: f64,
    pub monitor_zero_days_crit_pct: f64,
    pub monitor_over_max_warn_pct: f64,
    pub monitor_over_max_crit_pct: f64,
    pub monitor_rap_p95_stale_warn_days: i64,
    pub monitor_rap_p95_stale_crit_days: i64,
    pub monitor_drift_warn_ratio: f64,
    pub monitor_drift_crit_ratio: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            weather_stale_days: 7,
            // RAP composites are sparse; staleness is a warning gate by default.
            rap_stale_days: 120,
            max_days_remaining: 365.0,
            min_days_remaining: 0.0,
            weather_source_version: "openmeteo:v1".to_string(),
            monitor_zero_days_warn_pct: 0.02,
            monitor_zero_days_crit_pct: 0.10,
            monitor_over_max_warn_pct: 0.01,
            monitor_over_max_crit_pct: 0.05,
            monitor_rap_p95_stale_warn_days: 150,
            monitor_rap_p95_stale_crit_days: 240,
            monitor_drift_warn_ratio: 0.25,
            monitor_drift_crit_ratio: 0.50,
        }
    }
}

impl PipelineConfig {
    /// Validates numeric bounds and threshold ordering.
    ///
    /// # Errors
    /// Returns [`PipelineError::Configuration`] when a field is out of range.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.weather_stale_days < 0 || self.rap_stale_days < 0 {
            return Err(PipelineError::Configuration(
                "staleness thresholds MUST be >= 0 days".to_string(),
            ));
        }

        if self.max_days_remaining <= self.min_days_remaining {
            return Err(PipelineError::Configuration(
                "max_days_remaining MUST exceed min_days_remaining".to_string(),
            ));
        }

        for (name, value) in [
            ("monitor_zero_days_warn_pct", self.monitor_zero_days_warn_pct),
            ("monitor_zero_days_crit_pct", self.monitor_zero_days_crit_pct),
            ("monitor_over_max_warn_pct", self.monitor_over_max_warn_pct),
            ("monitor_over_max_crit_pct", self.monitor_over_max_crit_pct),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Configuration(format!(
                    "{name} MUST be in [0.0, 1.0]"
                )));
            }
        }

        if self.monitor_zero_days_warn_pct > self.monitor_zero_days_crit_pct
            || self.monitor_over_max_warn_pct > self.monitor_over_max_crit_pct
            || self.monitor_rap_p95_stale_warn_days > self.monitor_rap_p95_stale_crit_days
            || self.monitor_drift_warn_ratio > self.monitor_drift_crit_ratio
        {
            return Err(PipelineError::Configuration(
                "warn thresholds MUST NOT exceed crit thresholds".to_string(),
            ));
        }

        Ok(())
    }

    /// The parameter subset that affects the computed recommendation; this is
    /// what `config_hash` is derived from.
    #[must_use]
    pub fn compute_params(&self) -> Value {
        serde_json::json!({
            "max_days_remaining": self.max_days_remaining,
            "min_days_remaining": self.min_days_remaining,
        })
    }

    /// Deterministic hash of [`Self::compute_params`].
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when canonicalization fails.
    pub fn config_hash(&self) -> Result<String, PipelineError> {
        Ok(sha256_hex(&canonical_json(&self.compute_params())?))
    }
}

/// A boundary dimension row. Geometry arrives already normalized to a
/// canonical CRS by the ingestion collaborator; the core only reads the
/// derived area and centroid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoundaryRecord {
    pub boundary_id: String,
    pub name: String,
    pub geometry_geojson: String,
    pub crs: String,
    pub area_ha: f64,
    pub centroid_lat: f64,
    pub centroid_lon: f64,
}

impl BoundaryRecord {
    /// # Errors
    /// Returns [`PipelineError::Validation`] for an empty id or non-positive
    /// area.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.boundary_id.trim().is_empty() {
            return Err(PipelineError::Validation(
                "boundary_id MUST be provided".to_string(),
            ));
        }
        if self.area_ha <= 0.0 {
            return Err(PipelineError::Validation(
                "area_ha MUST be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Static soil attributes for a boundary; no time axis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SoilSample {
    pub productivity_index: Option<f64>,
    pub available_water_capacity: Option<f64>,
    pub source_version: String,
}

/// Sparse biomass composite; `composite_date` is unique per boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BiomassComposite {
    #[serde(with = "iso_date")]
    pub composite_date: Date,
    pub biomass_kg_per_ha: f64,
    pub source_version: String,
}

/// One daily weather observation; dense series with exactly one row per
/// calendar day once ingested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeatherDay {
    #[serde(with = "iso_date")]
    pub forecast_date: Date,
    pub precipitation_mm: Option<f64>,
    pub temp_max_c: Option<f64>,
    pub temp_min_c: Option<f64>,
    pub wind_speed_kmh: Option<f64>,
}

/// One materialized row of the per-day joined feature table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureDay {
    pub boundary_id: String,
    #[serde(with = "iso_date")]
    pub feature_date: Date,

    #[serde(with = "iso_date_option")]
    pub biomass_composite_date: Option<Date>,
    pub biomass_kg_per_ha: Option<f64>,
    pub biomass_source_version: Option<String>,

    pub weather_precipitation_mm: Option<f64>,
    pub weather_temp_max_c: Option<f64>,
    pub weather_temp_min_c: Option<f64>,
    pub weather_wind_speed_kmh: Option<f64>,
    pub weather_source_version: String,

    pub soil_productivity_index_mean: Option<f64>,
    pub soil_available_water_capacity_mean: Option<f64>,
    pub soil_source_version: Option<String>,

    pub area_ha: f64,
}

impl FeatureDay {
    #[must_use]
    pub fn has_weather(&self) -> bool {
        self.weather_precipitation_mm.is_some()
            || self.weather_temp_max_c.is_some()
            || self.weather_temp_min_c.is_some()
            || self.weather_wind_speed_kmh.is_some()
    }
}

/// Validated herd consumption parameters plus the raw snapshot used for
/// content addressing. Identical snapshots always hash to the same id, so
/// ingest is idempotent across reruns; an edited snapshot gets a new id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HerdConfigInput {
    pub source_id: Option<String>,
    pub animal_count: i64,
    pub daily_intake_kg_per_head: f64,
    pub animal_type: Option<String>,
    pub snapshot: Value,
}

impl HerdConfigInput {
    /// # Errors
    /// Returns [`PipelineError::Validation`] for non-positive counts or
    /// intake.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.animal_count <= 0 {
            return Err(PipelineError::Validation(
                "animal_count must be > 0".to_string(),
            ));
        }
        if self.daily_intake_kg_per_head <= 0.0 {
            return Err(PipelineError::Validation(
                "daily_intake_kg_per_head must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Deterministic herd config id: the explicit source id when present,
    /// otherwise the first 24 hex chars of the canonical snapshot hash.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when canonicalization fails.
    pub fn config_id(&self) -> Result<String, PipelineError> {
        if let Some(raw) = &self.source_id {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
        let digest = sha256_hex(&canonical_json(&self.snapshot)?);
        Ok(digest[..24].to_string())
    }

    /// Hash of the full snapshot, recorded as provenance.
    ///
    /// # Errors
    /// Returns [`PipelineError::Validation`] when canonicalization fails.
    pub fn snapshot_hash(&self) -> Result<String, PipelineError> {
        Ok(sha256_hex(&canonical_json(&self.snapshot)?))
    }
}

#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn add_whole_days(date: Date, days: f64) -> Date {
    let clamped = days.max(0.0).floor() as i64;
    date + Duration::days(clamped)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn parse_and_format_date_round_trip() {
        let date = must_ok(parse_date("2024-02-29"));
        assert_eq!(must_ok(format_date(date)), "2024-02-29");
    }

    #[test]
    fn parse_date_rejects_garbage() {
        assert!(parse_date("2024-13-01").is_err());
        assert!(parse_date("not-a-date").is_err());
    }

    #[test]
    fn inclusive_day_count_covers_leap_year() {
        let start = must_ok(parse_date("2024-01-01"));
        let end = must_ok(parse_date("2024-12-31"));
        assert_eq!(must_ok(inclusive_day_count(start, end)), 366);
    }

    #[test]
    fn inclusive_day_count_rejects_reversed_range() {
        let start = must_ok(parse_date("2024-01-02"));
        let end = must_ok(parse_date("2024-01-01"));
        assert!(inclusive_day_count(start, end).is_err());
    }

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn config_hash_is_stable_for_identical_params() {
        let first = must_ok(PipelineConfig::default().config_hash());
        let second = must_ok(PipelineConfig::default().config_hash());
        assert_eq!(first, second);

        let changed = PipelineConfig {
            max_days_remaining: 200.0,
            ..PipelineConfig::default()
        };
        assert_ne!(first, must_ok(changed.config_hash()));
    }

    #[test]
    fn herd_config_id_is_content_derived() {
        let herd = HerdConfigInput {
            source_id: None,
            animal_count: 400,
            daily_intake_kg_per_head: 12.0,
            animal_type: Some("cattle".to_string()),
            snapshot: serde_json::json!({"herd": {"animal_count": 400}}),
        };
        let id = must_ok(herd.config_id());
        assert_eq!(id.len(), 24);
        assert_eq!(id, must_ok(herd.clone().config_id()));

        let explicit = HerdConfigInput {
            source_id: Some(" herd-7 ".to_string()),
            ..herd
        };
        assert_eq!(must_ok(explicit.config_id()), "herd-7");
    }

    #[test]
    fn herd_validation_rejects_non_positive_values() {
        let herd = HerdConfigInput {
            source_id: None,
            animal_count: 0,
            daily_intake_kg_per_head: 12.0,
            animal_type: None,
            snapshot: Value::Object(serde_json::Map::default()),
        };
        assert!(herd.validate().is_err());
    }

    #[test]
    fn move_date_floors_and_clamps() {
        let as_of = must_ok(parse_date("2025-06-01"));
        assert_eq!(
            must_ok(format_date(add_whole_days(as_of, 15.625))),
            "2025-06-16"
        );
        assert_eq!(
            must_ok(format_date(add_whole_days(as_of, -3.0))),
            "2025-06-01"
        );
    }

    #[test]
    fn monitor_status_exit_codes() {
        assert_eq!(MonitorStatus::Ok.exit_code(true), 0);
        assert_eq!(MonitorStatus::Warn.exit_code(true), 1);
        assert_eq!(MonitorStatus::Warn.exit_code(false), 0);
        assert_eq!(MonitorStatus::Crit.exit_code(false), 2);
    }
}
