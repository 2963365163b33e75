#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite persistence for the grazing recommendation pipeline: raw-source
//! partitions, the materialized feature table, ingestion-run bookkeeping,
//! idempotent recommendation compute with the drift guard, write-once
//! manifest files, and monitoring persistence.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write as _};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use grazing_pipeline_core::checks::{
    aggregate_run_status, check_daily_features_complete, check_herd_config_valid,
    check_rap_fresh_enough, check_rap_present, check_soil_present,
    check_weather_fresh_enough, check_weather_response_complete, CheckResult,
};
use grazing_pipeline_core::join::{materialize_feature_days, JoinInputs, MaterializeSummary};
use grazing_pipeline_core::logic::{compute_calc, GrazingCalc, LOGIC_VERSION};
use grazing_pipeline_core::manifest::{
    CodeMetadata, ComputeIdentity, RunManifest, MANIFEST_SCHEMA_VERSION,
};
use grazing_pipeline_core::monitor::{evaluate_window, MonitorReport, WindowOutcome};
use grazing_pipeline_core::{
    canonical_json, format_date, format_rfc3339, now_utc, parse_date, sha256_hex,
    BiomassComposite, BoundaryRecord, FeatureDay, HerdConfigInput, MonitorStatus,
    PipelineConfig, PipelineError, RunStatus, SoilSample, WeatherDay,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use time::{Date, Duration};
use ulid::Ulid;

const SCHEMA_MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS geographic_boundaries (
  boundary_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  geometry_geojson TEXT NOT NULL,
  crs TEXT NOT NULL,
  area_ha REAL NOT NULL CHECK (area_ha > 0.0),
  centroid_lat REAL NOT NULL,
  centroid_lon REAL NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS soil_samples (
  sample_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  boundary_id TEXT NOT NULL REFERENCES geographic_boundaries(boundary_id),
  productivity_index REAL,
  available_water_capacity REAL,
  source_version TEXT NOT NULL,
  ingested_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_soil_samples_boundary
  ON soil_samples(boundary_id, sample_seq);

CREATE TABLE IF NOT EXISTS biomass_composites (
  boundary_id TEXT NOT NULL REFERENCES geographic_boundaries(boundary_id),
  composite_date TEXT NOT NULL,
  biomass_kg_per_ha REAL NOT NULL CHECK (biomass_kg_per_ha >= 0.0),
  source_version TEXT NOT NULL,
  ingested_at TEXT NOT NULL,
  UNIQUE (boundary_id, composite_date)
);

CREATE TABLE IF NOT EXISTS weather_days (
  boundary_id TEXT NOT NULL REFERENCES geographic_boundaries(boundary_id),
  source_version TEXT NOT NULL,
  forecast_date TEXT NOT NULL,
  precipitation_mm REAL,
  temp_max_c REAL,
  temp_min_c REAL,
  wind_speed_kmh REAL,
  ingested_at TEXT NOT NULL,
  UNIQUE (boundary_id, source_version, forecast_date)
);

CREATE TABLE IF NOT EXISTS herd_configs (
  herd_config_id TEXT PRIMARY KEY,
  animal_count INTEGER NOT NULL CHECK (animal_count > 0),
  daily_intake_kg_per_head REAL NOT NULL CHECK (daily_intake_kg_per_head > 0.0),
  animal_type TEXT,
  snapshot_json TEXT NOT NULL,
  snapshot_hash TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS boundary_daily_features (
  boundary_id TEXT NOT NULL REFERENCES geographic_boundaries(boundary_id),
  feature_date TEXT NOT NULL,
  biomass_composite_date TEXT,
  biomass_kg_per_ha REAL,
  biomass_source_version TEXT,
  weather_precipitation_mm REAL,
  weather_temp_max_c REAL,
  weather_temp_min_c REAL,
  weather_wind_speed_kmh REAL,
  weather_source_version TEXT NOT NULL,
  soil_productivity_index_mean REAL,
  soil_available_water_capacity_mean REAL,
  soil_source_version TEXT,
  area_ha REAL NOT NULL CHECK (area_ha > 0.0),
  materialized_at TEXT NOT NULL,
  PRIMARY KEY (boundary_id, feature_date)
);

CREATE TABLE IF NOT EXISTS ingestion_runs (
  run_id TEXT PRIMARY KEY,
  boundary_id TEXT NOT NULL,
  range_start TEXT NOT NULL,
  range_end TEXT NOT NULL,
  status TEXT NOT NULL CHECK (
    status IN ('running', 'succeeded', 'succeeded_with_warnings', 'failed')
  ),
  records_ingested INTEGER NOT NULL DEFAULT 0,
  error_message TEXT,
  started_at TEXT NOT NULL,
  finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_ingestion_runs_boundary_started
  ON ingestion_runs(boundary_id, started_at);

CREATE TABLE IF NOT EXISTS data_quality_checks (
  check_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES ingestion_runs(run_id),
  check_name TEXT NOT NULL,
  check_kind TEXT NOT NULL,
  severity TEXT NOT NULL CHECK (severity IN ('warn', 'hard')),
  passed INTEGER NOT NULL CHECK (passed IN (0, 1)),
  details_json TEXT NOT NULL DEFAULT '{}',
  checked_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_data_quality_checks_run
  ON data_quality_checks(run_id, check_seq);

CREATE TABLE IF NOT EXISTS recommendations (
  rec_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL,
  boundary_id TEXT NOT NULL,
  herd_config_id TEXT NOT NULL,
  calculation_date TEXT NOT NULL,
  logic_version TEXT NOT NULL,
  config_hash TEXT NOT NULL,
  days_remaining REAL NOT NULL,
  recommended_move_date TEXT NOT NULL,
  available_forage_kg REAL NOT NULL,
  daily_consumption_kg REAL NOT NULL,
  payload_json TEXT NOT NULL,
  provenance_json TEXT NOT NULL,
  manifest_snapshot_id TEXT NOT NULL,
  manifest_path TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_recommendations_identity
  ON recommendations(
    boundary_id, herd_config_id, calculation_date, logic_version, config_hash
  );

CREATE INDEX IF NOT EXISTS idx_recommendations_run_id
  ON recommendations(run_id);

CREATE TRIGGER IF NOT EXISTS trg_recommendations_no_update
BEFORE UPDATE ON recommendations
BEGIN
  SELECT RAISE(FAIL, 'recommendations is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_recommendations_no_delete
BEFORE DELETE ON recommendations
BEGIN
  SELECT RAISE(FAIL, 'recommendations is append-only');
END;

CREATE TABLE IF NOT EXISTS monitoring_runs (
  monitor_run_id TEXT PRIMARY KEY,
  boundary_id TEXT NOT NULL,
  window_start TEXT NOT NULL,
  window_end TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('ok', 'warn', 'crit')),
  metrics_json TEXT NOT NULL,
  report_path TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS monitoring_alerts (
  alert_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  monitor_run_id TEXT NOT NULL REFERENCES monitoring_runs(monitor_run_id),
  alert_name TEXT NOT NULL,
  severity TEXT NOT NULL CHECK (severity IN ('warn', 'crit')),
  passed INTEGER NOT NULL CHECK (passed IN (0, 1)),
  details_json TEXT NOT NULL DEFAULT '{}'
);
";

pub struct SqlitePipelineStore {
    conn: Connection,
}

/// Persisted herd config row: validated parameters plus the content snapshot
/// that derives the id.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct HerdConfigRow {
    pub herd_config_id: String,
    pub animal_count: i64,
    pub daily_intake_kg_per_head: f64,
    pub animal_type: Option<String>,
    pub snapshot: Value,
    pub snapshot_hash: String,
    pub created_at: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct IngestionReport {
    pub run_id: String,
    pub boundary_id: String,
    pub herd_config_id: String,
    pub range_start: String,
    pub range_end: String,
    pub status: RunStatus,
    pub records_ingested: i64,
    pub features_inserted: usize,
    pub missing_weather_days: usize,
    pub missing_biomass_days: usize,
    pub checks: Vec<CheckResult>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ComputeReport {
    pub run_id: String,
    pub boundary_id: String,
    pub herd_config_id: String,
    pub calculation_date: String,
    pub logic_version: String,
    pub config_hash: String,
    pub replayed: bool,
    pub days_remaining: f64,
    pub recommended_move_date: String,
    pub available_forage_kg: f64,
    pub daily_consumption_kg: f64,
    pub snapshot_id: String,
    pub manifest_path: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct MonitorRunRecord {
    pub monitor_run_id: String,
    pub boundary_id: String,
    pub window_start: String,
    pub window_end: String,
    pub status: MonitorStatus,
    pub report_path: String,
    pub report: MonitorReport,
}

impl SqlitePipelineStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply pipeline schema")?;

        let now = rfc3339_now()?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_MIGRATION_VERSION, now],
            )
            .context("failed to register schema migration")?;

        Ok(())
    }

    // -- boundary dimension ------------------------------------------------

    pub fn upsert_boundary(&self, boundary: &BoundaryRecord) -> Result<()> {
        boundary.validate().map_err(anyhow::Error::new)?;

        let now = rfc3339_now()?;
        self.conn
            .execute(
                "INSERT INTO geographic_boundaries(
                    boundary_id, name, geometry_geojson, crs,
                    area_ha, centroid_lat, centroid_lon, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(boundary_id) DO UPDATE SET
                   name = excluded.name,
                   geometry_geojson = excluded.geometry_geojson,
                   crs = excluded.crs,
                   area_ha = excluded.area_ha,
                   centroid_lat = excluded.centroid_lat,
                   centroid_lon = excluded.centroid_lon,
                   updated_at = excluded.updated_at",
                params![
                    boundary.boundary_id,
                    boundary.name,
                    boundary.geometry_geojson,
                    boundary.crs,
                    boundary.area_ha,
                    boundary.centroid_lat,
                    boundary.centroid_lon,
                    now,
                ],
            )
            .context("failed to upsert boundary")?;

        Ok(())
    }

    pub fn get_boundary(&self, boundary_id: &str) -> Result<Option<BoundaryRecord>> {
        self.conn
            .query_row(
                "SELECT boundary_id, name, geometry_geojson, crs,
                        area_ha, centroid_lat, centroid_lon
                 FROM geographic_boundaries WHERE boundary_id = ?1",
                params![boundary_id],
                |row| {
                    Ok(BoundaryRecord {
                        boundary_id: row.get(0)?,
                        name: row.get(1)?,
                        geometry_geojson: row.get(2)?,
                        crs: row.get(3)?,
                        area_ha: row.get(4)?,
                        centroid_lat: row.get(5)?,
                        centroid_lon: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("failed to load boundary")
    }

    // -- herd configs ------------------------------------------------------

    /// Insert-or-confirm by content-derived id. A second ingest of the same
    /// snapshot is a no-op; the same id arriving with a different snapshot is
    /// a [`PipelineError::DriftConflict`].
    pub fn upsert_herd_config(&self, herd: &HerdConfigInput) -> Result<HerdConfigRow> {
        herd.validate().map_err(anyhow::Error::new)?;

        let herd_config_id = herd.config_id().map_err(anyhow::Error::new)?;
        let snapshot_hash = herd.snapshot_hash().map_err(anyhow::Error::new)?;
        let snapshot_json = canonical_json(&herd.snapshot).map_err(anyhow::Error::new)?;
        let now = rfc3339_now()?;

        self.conn
            .execute(
                "INSERT INTO herd_configs(
                    herd_config_id, animal_count, daily_intake_kg_per_head,
                    animal_type, snapshot_json, snapshot_hash, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(herd_config_id) DO NOTHING",
                params![
                    herd_config_id,
                    herd.animal_count,
                    herd.daily_intake_kg_per_head,
                    herd.animal_type,
                    snapshot_json,
                    snapshot_hash,
                    now,
                ],
            )
            .context("failed to insert herd config")?;

        let existing = self
            .get_herd_config(&herd_config_id)?
            .ok_or_else(|| anyhow!("herd config {herd_config_id} vanished after insert"))?;

        if existing.snapshot_hash != snapshot_hash {
            return Err(PipelineError::DriftConflict(format!(
                "herd config {herd_config_id} already exists with a different snapshot \
                 (stored {}, incoming {snapshot_hash}); edits must create a new identity",
                existing.snapshot_hash
            ))
            .into());
        }

        Ok(existing)
    }

    pub fn get_herd_config(&self, herd_config_id: &str) -> Result<Option<HerdConfigRow>> {
        let row = self
            .conn
            .query_row(
                "SELECT herd_config_id, animal_count, daily_intake_kg_per_head,
                        animal_type, snapshot_json, snapshot_hash, created_at
                 FROM herd_configs WHERE herd_config_id = ?1",
                params![herd_config_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()
            .context("failed to load herd config")?;

        row.map(
            |(id, animal_count, intake, animal_type, snapshot_json, snapshot_hash, created_at)| {
                let snapshot: Value = serde_json::from_str(&snapshot_json)
                    .context("invalid stored herd snapshot JSON")?;
                Ok(HerdConfigRow {
                    herd_config_id: id,
                    animal_count,
                    daily_intake_kg_per_head: intake,
                    animal_type,
                    snapshot,
                    snapshot_hash,
                    created_at,
                })
            },
        )
        .transpose()
    }

    // -- partition replace -------------------------------------------------

    /// Replaces the whole soil partition for a boundary in one transaction.
    pub fn replace_soil_partition(
        &mut self,
        boundary_id: &str,
        samples: &[SoilSample],
    ) -> Result<usize> {
        let now = rfc3339_now()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start soil replace transaction")?;

        tx.execute(
            "DELETE FROM soil_samples WHERE boundary_id = ?1",
            params![boundary_id],
        )
        .context("failed to clear soil partition")?;

        for sample in samples {
            tx.execute(
                "INSERT INTO soil_samples(
                    boundary_id, productivity_index, available_water_capacity,
                    source_version, ingested_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    boundary_id,
                    sample.productivity_index,
                    sample.available_water_capacity,
                    sample.source_version,
                    now,
                ],
            )
            .context("failed to insert soil sample")?;
        }

        tx.commit().context("failed to commit soil replace")?;
        Ok(samples.len())
    }

    /// Replaces the whole biomass partition for a boundary in one transaction.
    pub fn replace_biomass_partition(
        &mut self,
        boundary_id: &str,
        composites: &[BiomassComposite],
    ) -> Result<usize> {
        let now = rfc3339_now()?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start biomass replace transaction")?;

        tx.execute(
            "DELETE FROM biomass_composites WHERE boundary_id = ?1",
            params![boundary_id],
        )
        .context("failed to clear biomass partition")?;

        for composite in composites {
            tx.execute(
                "INSERT INTO biomass_composites(
                    boundary_id, composite_date, biomass_kg_per_ha,
                    source_version, ingested_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    boundary_id,
                    format_date(composite.composite_date).map_err(anyhow::Error::new)?,
                    composite.biomass_kg_per_ha,
                    composite.source_version,
                    now,
                ],
            )
            .context("failed to insert biomass composite")?;
        }

        tx.commit().context("failed to commit biomass replace")?;
        Ok(composites.len())
    }

    /// Replaces the weather slice `(boundary, source_version, [start, end])`
    /// in one transaction. Rows outside the range are rejected rather than
    /// silently widening the partition.
    pub fn replace_weather_partition(
        &mut self,
        boundary_id: &str,
        source_version: &str,
        start: Date,
        end: Date,
        rows: &[WeatherDay],
    ) -> Result<usize> {
        for row in rows {
            if row.forecast_date < start || row.forecast_date > end {
                return Err(PipelineError::Validation(format!(
                    "weather row {} is outside the replaced range [{start}, {end}]",
                    row.forecast_date
                ))
                .into());
            }
        }

        let now = rfc3339_now()?;
        let start_str = format_date(start).map_err(anyhow::Error::new)?;
        let end_str = format_date(end).map_err(anyhow::Error::new)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start weather replace transaction")?;

        tx.execute(
            "DELETE FROM weather_days
             WHERE boundary_id = ?1 AND source_version = ?2
               AND forecast_date BETWEEN ?3 AND ?4",
            params![boundary_id, source_version, start_str, end_str],
        )
        .context("failed to clear weather partition")?;

        for row in rows {
            tx.execute(
                "INSERT INTO weather_days(
                    boundary_id, source_version, forecast_date,
                    precipitation_mm, temp_max_c, temp_min_c, wind_speed_kmh,
                    ingested_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    boundary_id,
                    source_version,
                    format_date(row.forecast_date).map_err(anyhow::Error::new)?,
                    row.precipitation_mm,
                    row.temp_max_c,
                    row.temp_min_c,
                    row.wind_speed_kmh,
                    now,
                ],
            )
            .context("failed to insert weather row")?;
        }

        tx.commit().context("failed to commit weather replace")?;
        Ok(rows.len())
    }

    // -- source loads ------------------------------------------------------

    pub fn load_soil(&self, boundary_id: &str) -> Result<Vec<SoilSample>> {
        let mut stmt = self.conn.prepare(
            "SELECT productivity_index, available_water_capacity, source_version
             FROM soil_samples WHERE boundary_id = ?1 ORDER BY sample_seq ASC",
        )?;
        let rows = stmt.query_map(params![boundary_id], |row| {
            Ok(SoilSample {
                productivity_index: row.get(0)?,
                available_water_capacity: row.get(1)?,
                source_version: row.get(2)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn load_biomass(&self, boundary_id: &str) -> Result<Vec<BiomassComposite>> {
        let mut stmt = self.conn.prepare(
            "SELECT composite_date, biomass_kg_per_ha, source_version
             FROM biomass_composites WHERE boundary_id = ?1 ORDER BY composite_date ASC",
        )?;
        let rows = stmt.query_map(params![boundary_id], |row| {
            Ok(BiomassComposite {
                composite_date: parse_date_column(row, 0)?,
                biomass_kg_per_ha: row.get(1)?,
                source_version: row.get(2)?,
            })
        })?;
        collect_rows(rows)
    }

    pub fn load_weather(
        &self,
        boundary_id: &str,
        source_version: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<WeatherDay>> {
        let start_str = format_date(start).map_err(anyhow::Error::new)?;
        let end_str = format_date(end).map_err(anyhow::Error::new)?;
        let mut stmt = self.conn.prepare(
            "SELECT forecast_date, precipitation_mm, temp_max_c, temp_min_c, wind_speed_kmh
             FROM weather_days
             WHERE boundary_id = ?1 AND source_version = ?2
               AND forecast_date BETWEEN ?3 AND ?4
             ORDER BY forecast_date ASC",
        )?;
        let rows = stmt.query_map(
            params![boundary_id, source_version, start_str, end_str],
            |row| {
                Ok(WeatherDay {
                    forecast_date: parse_date_column(row, 0)?,
                    precipitation_mm: row.get(1)?,
                    temp_max_c: row.get(2)?,
                    temp_min_c: row.get(3)?,
                    wind_speed_kmh: row.get(4)?,
                })
            },
        )?;
        collect_rows(rows)
    }

    // -- feature materialization -------------------------------------------

    /// Joins the stored sources and replaces the feature partition for the
    /// range atomically.
    pub fn materialize_features(
        &mut self,
        boundary_id: &str,
        start: Date,
        end: Date,
        cfg: &PipelineConfig,
    ) -> Result<MaterializeSummary> {
        let boundary = self.get_boundary(boundary_id)?.ok_or_else(|| {
            anyhow::Error::new(PipelineError::MissingDependency(format!(
                "boundary {boundary_id} not found; load reference data first"
            )))
        })?;
        let soil = self.load_soil(boundary_id)?;
        let composites = self.load_biomass(boundary_id)?;
        let weather = self.load_weather(boundary_id, &cfg.weather_source_version, start, end)?;

        let inputs = JoinInputs {
            boundary: &boundary,
            soil: &soil,
            composites: &composites,
            weather: &weather,
            weather_source_version: &cfg.weather_source_version,
        };
        let materialized =
            materialize_feature_days(&inputs, start, end).map_err(anyhow::Error::new)?;

        let now = rfc3339_now()?;
        let start_str = format_date(start).map_err(anyhow::Error::new)?;
        let end_str = format_date(end).map_err(anyhow::Error::new)?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start feature replace transaction")?;

        tx.execute(
            "DELETE FROM boundary_daily_features
             WHERE boundary_id = ?1 AND feature_date BETWEEN ?2 AND ?3",
            params![boundary_id, start_str, end_str],
        )
        .context("failed to clear feature partition")?;

        for row in &materialized.rows {
            let composite_date = row
                .biomass_composite_date
                .map(format_date)
                .transpose()
                .map_err(anyhow::Error::new)?;
            tx.execute(
                "INSERT INTO boundary_daily_features(
                    boundary_id, feature_date,
                    biomass_composite_date, biomass_kg_per_ha, biomass_source_version,
                    weather_precipitation_mm, weather_temp_max_c, weather_temp_min_c,
                    weather_wind_speed_kmh, weather_source_version,
                    soil_productivity_index_mean, soil_available_water_capacity_mean,
                    soil_source_version, area_ha, materialized_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    row.boundary_id,
                    format_date(row.feature_date).map_err(anyhow::Error::new)?,
                    composite_date,
                    row.biomass_kg_per_ha,
                    row.biomass_source_version,
                    row.weather_precipitation_mm,
                    row.weather_temp_max_c,
                    row.weather_temp_min_c,
                    row.weather_wind_speed_kmh,
                    row.weather_source_version,
                    row.soil_productivity_index_mean,
                    row.soil_available_water_capacity_mean,
                    row.soil_source_version,
                    row.area_ha,
                    now,
                ],
            )
            .context("failed to insert feature row")?;
        }

        tx.commit().context("failed to commit feature replace")?;
        Ok(materialized.summary)
    }

    pub fn get_feature_day(
        &self,
        boundary_id: &str,
        feature_date: Date,
    ) -> Result<Option<FeatureDay>> {
        let date_str = format_date(feature_date).map_err(anyhow::Error::new)?;
        self.conn
            .query_row(
                "SELECT boundary_id, feature_date,
                        biomass_composite_date, biomass_kg_per_ha, biomass_source_version,
                        weather_precipitation_mm, weather_temp_max_c, weather_temp_min_c,
                        weather_wind_speed_kmh, weather_source_version,
                        soil_productivity_index_mean, soil_available_water_capacity_mean,
                        soil_source_version, area_ha
                 FROM boundary_daily_features
                 WHERE boundary_id = ?1 AND feature_date = ?2",
                params![boundary_id, date_str],
                parse_feature_row,
            )
            .optional()
            .context("failed to load feature day")
    }

    pub fn load_features(
        &self,
        boundary_id: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<FeatureDay>> {
        let start_str = format_date(start).map_err(anyhow::Error::new)?;
        let end_str = format_date(end).map_err(anyhow::Error::new)?;
        let mut stmt = self.conn.prepare(
            "SELECT boundary_id, feature_date,
                    biomass_composite_date, biomass_kg_per_ha, biomass_source_version,
                    weather_precipitation_mm, weather_temp_max_c, weather_temp_min_c,
                    weather_wind_speed_kmh, weather_source_version,
                    soil_productivity_index_mean, soil_available_water_capacity_mean,
                    soil_source_version, area_ha
             FROM boundary_daily_features
             WHERE boundary_id = ?1 AND feature_date BETWEEN ?2 AND ?3
             ORDER BY feature_date ASC",
        )?;
        let rows = stmt.query_map(params![boundary_id, start_str, end_str], parse_feature_row)?;
        collect_rows(rows)
    }

    // -- ingestion orchestration -------------------------------------------

    /// Full ingestion run: upsert boundary + herd config, replace the weather
    /// partition, materialize features, evaluate the quality gate, persist
    /// every verdict, finalize the run row.
    ///
    /// A failed hard check fails the run but never rolls back the already
    /// replaced partitions.
    pub fn run_ingestion(
        &mut self,
        boundary: &BoundaryRecord,
        herd: &HerdConfigInput,
        weather: &[WeatherDay],
        start: Date,
        end: Date,
        cfg: &PipelineConfig,
    ) -> Result<IngestionReport> {
        cfg.validate().map_err(anyhow::Error::new)?;
        boundary.validate().map_err(anyhow::Error::new)?;

        let run_id = Ulid::new().to_string();
        let started_at = rfc3339_now()?;
        let start_str = format_date(start).map_err(anyhow::Error::new)?;
        let end_str = format_date(end).map_err(anyhow::Error::new)?;

        self.conn
            .execute(
                "INSERT INTO ingestion_runs(
                    run_id, boundary_id, range_start, range_end, status, started_at
                 ) VALUES (?1, ?2, ?3, ?4, 'running', ?5)",
                params![run_id, boundary.boundary_id, start_str, end_str, started_at],
            )
            .context("failed to open ingestion run")?;

        match self.ingest_inner(&run_id, boundary, herd, weather, start, end, cfg) {
            Ok(report) => Ok(report),
            Err(err) => {
                self.finalize_ingestion_run(
                    &run_id,
                    RunStatus::Failed,
                    0,
                    Some(&format!("{err:#}")),
                )?;
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments, clippy::too_many_lines)]
    fn ingest_inner(
        &mut self,
        run_id: &str,
        boundary: &BoundaryRecord,
        herd: &HerdConfigInput,
        weather: &[WeatherDay],
        start: Date,
        end: Date,
        cfg: &PipelineConfig,
    ) -> Result<IngestionReport> {
        self.upsert_boundary(boundary)?;
        let herd_row = self.upsert_herd_config(herd)?;

        let weather_count = self.replace_weather_partition(
            &boundary.boundary_id,
            &cfg.weather_source_version,
            start,
            end,
            weather,
        )?;

        let summary = self.materialize_features(&boundary.boundary_id, start, end, cfg)?;

        let soil = self.load_soil(&boundary.boundary_id)?;
        let composites = self.load_biomass(&boundary.boundary_id)?;
        let features = self.load_features(&boundary.boundary_id, start, end)?;

        let checks = vec![
            check_herd_config_valid(herd),
            check_soil_present(&soil),
            check_rap_present(&composites),
            check_weather_response_complete(weather, start, end).map_err(anyhow::Error::new)?,
            check_daily_features_complete(&features, start, end).map_err(anyhow::Error::new)?,
            check_weather_fresh_enough(weather, end, cfg).map_err(anyhow::Error::new)?,
            check_rap_fresh_enough(&composites, end, cfg).map_err(anyhow::Error::new)?,
        ];
        for check in &checks {
            self.insert_check(run_id, check)?;
        }

        let status = aggregate_run_status(&checks);
        let records_ingested = 2 + weather_count as i64 + summary.inserted as i64;
        self.finalize_ingestion_run(run_id, status, records_ingested, None)?;

        Ok(IngestionReport {
            run_id: run_id.to_string(),
            boundary_id: boundary.boundary_id.clone(),
            herd_config_id: herd_row.herd_config_id,
            range_start: format_date(start).map_err(anyhow::Error::new)?,
            range_end: format_date(end).map_err(anyhow::Error::new)?,
            status,
            records_ingested,
            features_inserted: summary.inserted,
            missing_weather_days: summary.missing_weather_days,
            missing_biomass_days: summary.missing_biomass_days,
            checks,
        })
    }

    fn insert_check(&self, run_id: &str, check: &CheckResult) -> Result<()> {
        let details = serde_json::to_string(&check.details)
            .context("failed to serialize check details")?;
        let now = rfc3339_now()?;
        self.conn
            .execute(
                "INSERT INTO data_quality_checks(
                    run_id, check_name, check_kind, severity, passed, details_json, checked_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run_id,
                    check.name,
                    check.kind,
                    check.severity.as_str(),
                    i64::from(check.passed),
                    details,
                    now,
                ],
            )
            .context("failed to persist quality check")?;
        Ok(())
    }

    fn finalize_ingestion_run(
        &self,
        run_id: &str,
        status: RunStatus,
        records_ingested: i64,
        error_message: Option<&str>,
    ) -> Result<()> {
        let finished_at = rfc3339_now()?;
        self.conn
            .execute(
                "UPDATE ingestion_runs
                 SET status = ?2, records_ingested = ?3, error_message = ?4, finished_at = ?5
                 WHERE run_id = ?1",
                params![run_id, status.as_str(), records_ingested, error_message, finished_at],
            )
            .context("failed to finalize ingestion run")?;
        Ok(())
    }

    /// Quality summary of the most recent ingestion run touching the
    /// boundary, recorded into compute manifests. Content-stable on purpose:
    /// only check verdicts and the derived status, never run ids or
    /// timestamps, so a wholesale re-ingest of identical data leaves the
    /// hashed provenance payload byte-identical and a recompute replays
    /// instead of raising a drift conflict.
    fn latest_dq_summary(&self, boundary_id: &str) -> Result<Value> {
        let run = self
            .conn
            .query_row(
                "SELECT run_id, status
                 FROM ingestion_runs
                 WHERE boundary_id = ?1
                 ORDER BY started_at DESC, run_id DESC
                 LIMIT 1",
                params![boundary_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("failed to load latest ingestion run")?;

        let Some((run_id, status)) = run else {
            return Ok(json!({ "ingestion": Value::Null }));
        };

        let mut stmt = self.conn.prepare(
            "SELECT check_name, severity, passed
             FROM data_quality_checks WHERE run_id = ?1 ORDER BY check_name ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? == 1,
            ))
        })?;
        let checks = collect_rows(rows)?;

        let verdicts: Vec<Value> = checks
            .iter()
            .map(|(name, severity, passed)| {
                json!({ "name": name, "severity": severity, "passed": passed })
            })
            .collect();

        Ok(json!({
            "ingestion": {
                "status": status,
                "checks": verdicts,
            }
        }))
    }

    // -- recommendation compute --------------------------------------------

    /// Idempotent compute: the identity row is inserted `ON CONFLICT DO
    /// NOTHING`, then read back and compared. An identical payload is a
    /// replay; a different payload under the same identity is a
    /// [`PipelineError::DriftConflict`] and nothing is mutated.
    #[allow(clippy::too_many_lines)]
    pub fn compute_recommendation(
        &mut self,
        boundary_id: &str,
        herd_config_id: &str,
        calculation_date: Date,
        manifest_root: &Path,
        cfg: &PipelineConfig,
    ) -> Result<ComputeReport> {
        cfg.validate().map_err(anyhow::Error::new)?;
        let config_hash = cfg.config_hash().map_err(anyhow::Error::new)?;

        let boundary = self.get_boundary(boundary_id)?.ok_or_else(|| {
            anyhow::Error::new(PipelineError::MissingDependency(format!(
                "boundary {boundary_id} not found; run load-reference and ingest first"
            )))
        })?;
        let herd = self.get_herd_config(herd_config_id)?.ok_or_else(|| {
            anyhow::Error::new(PipelineError::MissingDependency(format!(
                "herd config {herd_config_id} not found; run ingest first"
            )))
        })?;
        let date_str = format_date(calculation_date).map_err(anyhow::Error::new)?;
        let feature = self
            .get_feature_day(boundary_id, calculation_date)?
            .ok_or_else(|| {
                anyhow::Error::new(PipelineError::MissingDependency(format!(
                    "no materialized features for {boundary_id} on {date_str}; \
                     run ingest covering that date first"
                )))
            })?;

        let calc = compute_calc(
            &feature,
            herd.animal_count,
            herd.daily_intake_kg_per_head,
            calculation_date,
        )
        .map_err(anyhow::Error::new)?;

        let identity = ComputeIdentity {
            boundary_id: boundary_id.to_string(),
            herd_config_id: herd_config_id.to_string(),
            calculation_date,
            logic_version: LOGIC_VERSION.to_string(),
            config_hash: config_hash.clone(),
        };
        let run_id = identity.run_id().map_err(anyhow::Error::new)?;

        let manifest = self.build_manifest(&identity, &run_id, &boundary, &herd, &feature, &calc, cfg)?;
        let snapshot_id = manifest.snapshot_id().map_err(anyhow::Error::new)?;
        let payload =
            canonical_json(&manifest.snapshot_material()).map_err(anyhow::Error::new)?;
        let provenance = manifest.to_canonical_json().map_err(anyhow::Error::new)?;

        let manifest_path = manifest_root
            .join(boundary_id)
            .join(format!("{date_str}_{snapshot_id}.json"));
        let manifest_path_str = manifest_path.display().to_string();
        let move_date_str =
            format_date(calc.recommended_move_date).map_err(anyhow::Error::new)?;
        let created_at = rfc3339_now()?;

        let changed = self
            .conn
            .execute(
                "INSERT INTO recommendations(
                    run_id, boundary_id, herd_config_id, calculation_date,
                    logic_version, config_hash,
                    days_remaining, recommended_move_date,
                    available_forage_kg, daily_consumption_kg,
                    payload_json, provenance_json, manifest_snapshot_id, manifest_path,
                    created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                 ON CONFLICT(boundary_id, herd_config_id, calculation_date,
                             logic_version, config_hash) DO NOTHING",
                params![
                    run_id,
                    boundary_id,
                    herd_config_id,
                    date_str,
                    LOGIC_VERSION,
                    config_hash,
                    calc.days_remaining,
                    move_date_str,
                    calc.available_forage_kg,
                    calc.daily_consumption_kg,
                    payload,
                    provenance,
                    snapshot_id,
                    manifest_path_str,
                    created_at,
                ],
            )
            .context("failed to insert recommendation")?;

        let stored = self
            .conn
            .query_row(
                "SELECT payload_json, provenance_json, manifest_path, manifest_snapshot_id
                 FROM recommendations
                 WHERE boundary_id = ?1 AND herd_config_id = ?2 AND calculation_date = ?3
                   AND logic_version = ?4 AND config_hash = ?5",
                params![boundary_id, herd_config_id, date_str, LOGIC_VERSION, config_hash],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .context("failed to read back recommendation")?;
        let (stored_payload, stored_provenance, stored_path, stored_snapshot_id) = stored;

        if stored_payload != payload {
            return Err(PipelineError::DriftConflict(format!(
                "recommendation {run_id} already exists with a different payload; \
                 inputs or code changed without a version bump \
                 (stored snapshot {stored_snapshot_id}, recomputed {snapshot_id})"
            ))
            .into());
        }

        let replayed = changed == 0;

        // On replay the original manifest bytes are rewritten, so the
        // write-once comparison sees identical content even though
        // created_at differs in the freshly built manifest.
        let bytes = if replayed { &stored_provenance } else { &provenance };
        write_manifest_once(Path::new(&stored_path), bytes)?;

        Ok(ComputeReport {
            run_id,
            boundary_id: boundary_id.to_string(),
            herd_config_id: herd_config_id.to_string(),
            calculation_date: date_str,
            logic_version: LOGIC_VERSION.to_string(),
            config_hash,
            replayed,
            days_remaining: calc.days_remaining,
            recommended_move_date: move_date_str,
            available_forage_kg: calc.available_forage_kg,
            daily_consumption_kg: calc.daily_consumption_kg,
            snapshot_id: stored_snapshot_id,
            manifest_path: stored_path,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_manifest(
        &self,
        identity: &ComputeIdentity,
        run_id: &str,
        boundary: &BoundaryRecord,
        herd: &HerdConfigRow,
        feature: &FeatureDay,
        calc: &GrazingCalc,
        cfg: &PipelineConfig,
    ) -> Result<RunManifest> {
        let composite_date = feature
            .biomass_composite_date
            .map(format_date)
            .transpose()
            .map_err(anyhow::Error::new)?;

        let inputs = json!({
            "boundary": {
                "boundary_id": boundary.boundary_id,
                "area_ha": boundary.area_ha,
                "geometry_hash": sha256_hex(&boundary.geometry_geojson),
            },
            "herd": {
                "herd_config_id": herd.herd_config_id,
                "animal_count": herd.animal_count,
                "daily_intake_kg_per_head": herd.daily_intake_kg_per_head,
                "snapshot_hash": herd.snapshot_hash,
            },
            "data_snapshot": {
                "rap": {
                    "as_of_composite_date": composite_date,
                    "biomass_kg_per_ha": feature.biomass_kg_per_ha,
                    "source_version": feature.biomass_source_version,
                },
                "weather": {
                    "source_version": feature.weather_source_version,
                    "present": feature.has_weather(),
                },
                "soil": {
                    "productivity_index_mean": feature.soil_productivity_index_mean,
                    "available_water_capacity_mean": feature.soil_available_water_capacity_mean,
                    "source_version": feature.soil_source_version,
                },
            },
            "config": {
                "config_hash": identity.config_hash,
                "params": cfg.compute_params(),
            },
        });

        let move_date =
            format_date(calc.recommended_move_date).map_err(anyhow::Error::new)?;
        let outputs = json!({
            "available_forage_kg": calc.available_forage_kg,
            "daily_consumption_kg": calc.daily_consumption_kg,
            "days_remaining": calc.days_remaining,
            "recommended_move_date": move_date,
        });

        Ok(RunManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_type: "compute".to_string(),
            run_id: run_id.to_string(),
            created_at: rfc3339_now()?,
            code: CodeMetadata::collect(),
            identity: identity.to_value().map_err(anyhow::Error::new)?,
            inputs,
            dq_summary: self.latest_dq_summary(&boundary.boundary_id)?,
            outputs,
        })
    }

    // -- explain -----------------------------------------------------------

    /// Resolves a stored recommendation and renders the formula with the
    /// actual substituted values, merging the row with its manifest.
    pub fn explain_by_run_id(&self, run_id: &str) -> Result<Value> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, boundary_id, herd_config_id, calculation_date,
                        logic_version, config_hash, days_remaining, recommended_move_date,
                        available_forage_kg, daily_consumption_kg,
                        provenance_json, manifest_snapshot_id, manifest_path
                 FROM recommendations WHERE run_id = ?1",
                params![run_id],
                parse_explain_row,
            )
            .optional()
            .context("failed to load recommendation")?;

        let row = row.ok_or_else(|| {
            anyhow::Error::new(PipelineError::MissingDependency(format!(
                "no recommendation with run id {run_id}"
            )))
        })?;
        render_explanation(&row)
    }

    /// Latest recommendation for `(boundary, herd, as_of)` across logic and
    /// config versions.
    pub fn explain_by_key(
        &self,
        boundary_id: &str,
        herd_config_id: &str,
        as_of: Date,
    ) -> Result<Value> {
        let date_str = format_date(as_of).map_err(anyhow::Error::new)?;
        let row = self
            .conn
            .query_row(
                "SELECT run_id, boundary_id, herd_config_id, calculation_date,
                        logic_version, config_hash, days_remaining, recommended_move_date,
                        available_forage_kg, daily_consumption_kg,
                        provenance_json, manifest_snapshot_id, manifest_path
                 FROM recommendations
                 WHERE boundary_id = ?1 AND herd_config_id = ?2 AND calculation_date = ?3
                 ORDER BY rec_seq DESC LIMIT 1",
                params![boundary_id, herd_config_id, date_str],
                parse_explain_row,
            )
            .optional()
            .context("failed to load recommendation")?;

        let row = row.ok_or_else(|| {
            anyhow::Error::new(PipelineError::MissingDependency(format!(
                "no recommendation for {boundary_id} / {herd_config_id} on {date_str}"
            )))
        })?;
        render_explanation(&row)
    }

    // -- monitoring --------------------------------------------------------

    /// Evaluates the rolling monitor for `[end - (lookback_days - 1), end]`,
    /// persists the run and its alerts, and writes a write-once report file.
    pub fn run_monitoring(
        &mut self,
        boundary_id: &str,
        end: Date,
        lookback_days: i64,
        report_root: &Path,
        cfg: &PipelineConfig,
    ) -> Result<MonitorRunRecord> {
        cfg.validate().map_err(anyhow::Error::new)?;
        if lookback_days < 1 {
            return Err(PipelineError::Validation(
                "lookback_days must be >= 1".to_string(),
            )
            .into());
        }

        let start = end - Duration::days(lookback_days - 1);
        let preceding_end = start - Duration::days(1);
        let preceding_start = preceding_end - Duration::days(lookback_days - 1);

        let window = self.load_window_outcomes(boundary_id, start, end)?;
        let preceding = self.load_window_outcomes(boundary_id, preceding_start, preceding_end)?;

        let report = evaluate_window(boundary_id, &window, &preceding, start, end, cfg)
            .map_err(anyhow::Error::new)?;

        let monitor_run_id = Ulid::new().to_string();
        let created_at = rfc3339_now()?;
        let code = CodeMetadata::collect();

        let report_value = serde_json::to_value(&report)
            .context("failed to serialize monitoring report")?;
        let file_value = json!({
            "schema_version": MANIFEST_SCHEMA_VERSION,
            "run_type": "monitor",
            "monitor_run_id": monitor_run_id,
            "created_at": created_at,
            "code": code.to_value(),
            "report": report_value,
        });
        let snapshot_id = monitor_snapshot_id(&file_value)?;
        let report_path = report_root
            .join(boundary_id)
            .join(format!("{}_{}.json", report.window_end, &snapshot_id[..16]));
        let report_path_str = report_path.display().to_string();

        let metrics_json = serde_json::to_string(&report.metrics)
            .context("failed to serialize monitor metrics")?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start monitoring transaction")?;
        tx.execute(
            "INSERT INTO monitoring_runs(
                monitor_run_id, boundary_id, window_start, window_end,
                status, metrics_json, report_path, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                monitor_run_id,
                boundary_id,
                report.window_start,
                report.window_end,
                report.status.as_str(),
                metrics_json,
                report_path_str,
                created_at,
            ],
        )
        .context("failed to persist monitoring run")?;

        for alert in &report.alerts {
            let details = serde_json::to_string(&alert.details)
                .context("failed to serialize alert details")?;
            tx.execute(
                "INSERT INTO monitoring_alerts(
                    monitor_run_id, alert_name, severity, passed, details_json
                 ) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    monitor_run_id,
                    alert.name,
                    alert.severity.as_str(),
                    i64::from(alert.passed),
                    details,
                ],
            )
            .context("failed to persist monitoring alert")?;
        }
        tx.commit().context("failed to commit monitoring run")?;

        let bytes = canonical_json(&file_value).map_err(anyhow::Error::new)?;
        write_manifest_once(&report_path, &bytes)?;

        Ok(MonitorRunRecord {
            monitor_run_id,
            boundary_id: boundary_id.to_string(),
            window_start: report.window_start.clone(),
            window_end: report.window_end.clone(),
            status: report.status,
            report_path: report_path_str,
            report,
        })
    }

    fn load_window_outcomes(
        &self,
        boundary_id: &str,
        start: Date,
        end: Date,
    ) -> Result<Vec<WindowOutcome>> {
        let start_str = format_date(start).map_err(anyhow::Error::new)?;
        let end_str = format_date(end).map_err(anyhow::Error::new)?;
        let mut stmt = self.conn.prepare(
            "SELECT calculation_date, days_remaining, provenance_json
             FROM recommendations
             WHERE boundary_id = ?1 AND calculation_date BETWEEN ?2 AND ?3
             ORDER BY calculation_date ASC",
        )?;
        let rows = stmt.query_map(params![boundary_id, start_str, end_str], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let raw = collect_rows(rows)?;

        let mut outcomes = Vec::with_capacity(raw.len());
        for (date_raw, days_remaining, provenance_raw) in raw {
            let calculation_date = parse_date(&date_raw).map_err(anyhow::Error::new)?;
            let provenance: Value = serde_json::from_str(&provenance_raw)
                .context("invalid stored provenance JSON")?;
            let biomass_composite_date = provenance
                .pointer("/inputs/data_snapshot/rap/as_of_composite_date")
                .and_then(Value::as_str)
                .map(parse_date)
                .transpose()
                .map_err(anyhow::Error::new)?;

            outcomes.push(WindowOutcome {
                calculation_date,
                days_remaining,
                biomass_composite_date,
            });
        }
        Ok(outcomes)
    }
}

// -- manifest files --------------------------------------------------------

/// Write-once file create: `create_new` so two concurrent writers cannot
/// interleave. An existing file with identical bytes is a no-op; different
/// bytes under the same path is corruption and errors.
pub fn write_manifest_once(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create manifest directory {}", parent.display()))?;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(content.as_bytes())
                .with_context(|| format!("failed to write manifest {}", path.display()))?;
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let existing = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read manifest {}", path.display()))?;
            if existing == content {
                Ok(())
            } else {
                Err(anyhow!(
                    "manifest {} already exists with different content",
                    path.display()
                ))
            }
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to create manifest {}", path.display()))
        }
    }
}

pub fn read_manifest(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("manifest {} is not valid JSON", path.display()))
}

fn monitor_snapshot_id(file_value: &Value) -> Result<String> {
    let mut material = file_value.clone();
    if let Value::Object(map) = &mut material {
        map.remove("created_at");
        if let Some(Value::Object(code)) = map.get_mut("code") {
            code.remove("os");
            code.remove("arch");
        }
    }
    Ok(sha256_hex(
        &canonical_json(&material).map_err(anyhow::Error::new)?,
    ))
}

// -- row helpers -----------------------------------------------------------

struct ExplainRow {
    run_id: String,
    boundary_id: String,
    herd_config_id: String,
    calculation_date: String,
    logic_version: String,
    config_hash: String,
    days_remaining: f64,
    recommended_move_date: String,
    available_forage_kg: f64,
    daily_consumption_kg: f64,
    provenance_json: String,
    manifest_snapshot_id: String,
    manifest_path: String,
}

fn parse_explain_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExplainRow> {
    Ok(ExplainRow {
        run_id: row.get(0)?,
        boundary_id: row.get(1)?,
        herd_config_id: row.get(2)?,
        calculation_date: row.get(3)?,
        logic_version: row.get(4)?,
        config_hash: row.get(5)?,
        days_remaining: row.get(6)?,
        recommended_move_date: row.get(7)?,
        available_forage_kg: row.get(8)?,
        daily_consumption_kg: row.get(9)?,
        provenance_json: row.get(10)?,
        manifest_snapshot_id: row.get(11)?,
        manifest_path: row.get(12)?,
    })
}

fn render_explanation(row: &ExplainRow) -> Result<Value> {
    let manifest: Value = serde_json::from_str(&row.provenance_json)
        .context("invalid stored provenance JSON")?;
    let inputs = manifest.get("inputs").cloned().unwrap_or(Value::Null);

    let biomass = inputs
        .pointer("/data_snapshot/rap/biomass_kg_per_ha")
        .and_then(Value::as_f64);
    let area_ha = inputs.pointer("/boundary/area_ha").and_then(Value::as_f64);
    let animal_count = inputs
        .pointer("/herd/animal_count")
        .and_then(Value::as_i64);
    let intake = inputs
        .pointer("/herd/daily_intake_kg_per_head")
        .and_then(Value::as_f64);

    Ok(json!({
        "run_id": row.run_id,
        "identity": {
            "boundary_id": row.boundary_id,
            "herd_config_id": row.herd_config_id,
            "calculation_date": row.calculation_date,
            "logic_version": row.logic_version,
            "config_hash": row.config_hash,
        },
        "derivation": [
            {
                "formula": "available_forage_kg = biomass_kg_per_ha * area_ha",
                "substitution": format!(
                    "{} * {} = {}",
                    fmt_opt_f64(biomass),
                    fmt_opt_f64(area_ha),
                    row.available_forage_kg
                ),
            },
            {
                "formula": "daily_consumption_kg = animal_count * daily_intake_kg_per_head",
                "substitution": format!(
                    "{} * {} = {}",
                    animal_count.map_or_else(|| "null".to_string(), |v| v.to_string()),
                    fmt_opt_f64(intake),
                    row.daily_consumption_kg
                ),
            },
            {
                "formula": "days_remaining = available_forage_kg / daily_consumption_kg",
                "substitution": format!(
                    "{} / {} = {}",
                    row.available_forage_kg, row.daily_consumption_kg, row.days_remaining
                ),
            },
            {
                "formula": "recommended_move_date = calculation_date + floor(max(0, days_remaining))",
                "substitution": format!(
                    "{} + {} days = {}",
                    row.calculation_date,
                    row.days_remaining.max(0.0).floor(),
                    row.recommended_move_date
                ),
            },
        ],
        "outputs": {
            "available_forage_kg": row.available_forage_kg,
            "daily_consumption_kg": row.daily_consumption_kg,
            "days_remaining": row.days_remaining,
            "recommended_move_date": row.recommended_move_date,
        },
        "manifest_snapshot_id": row.manifest_snapshot_id,
        "manifest_path": row.manifest_path,
        "manifest": manifest,
    }))
}

fn fmt_opt_f64(value: Option<f64>) -> String {
    value.map_or_else(|| "null".to_string(), |v| v.to_string())
}

fn parse_feature_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeatureDay> {
    Ok(FeatureDay {
        boundary_id: row.get(0)?,
        feature_date: parse_date_column(row, 1)?,
        biomass_composite_date: parse_date_column_opt(row, 2)?,
        biomass_kg_per_ha: row.get(3)?,
        biomass_source_version: row.get(4)?,
        weather_precipitation_mm: row.get(5)?,
        weather_temp_max_c: row.get(6)?,
        weather_temp_min_c: row.get(7)?,
        weather_wind_speed_kmh: row.get(8)?,
        weather_source_version: row.get(9)?,
        soil_productivity_index_mean: row.get(10)?,
        soil_available_water_capacity_mean: row.get(11)?,
        soil_source_version: row.get(12)?,
        area_ha: row.get(13)?,
    })
}

fn parse_date_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Date> {
    let raw: String = row.get(idx)?;
    parse_date(&raw).map_err(|err| date_sql_error(idx, &err))
}

fn parse_date_column_opt(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Date>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| parse_date(&value).map_err(|err| date_sql_error(idx, &err)))
        .transpose()
}

fn date_sql_error(idx: usize, err: &PipelineError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn rfc3339_now() -> Result<String> {
    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.context("failed to read sqlite row")?);
    }
    Ok(values)
}
