//! Temporal join of the three raw sources into one `FeatureDay` per
//! calendar day.
//!
//! Join policies per source:
//! - weather: exact date match (missing day leaves the fields null),
//! - biomass: as-of carry-forward (most recent composite not after the day),
//! - soil and boundary area: static broadcast.
//!
//! The as-of join is one sorted pass over the composites with a cursor, so
//! materialization is linear in the range length plus the composite count.

use std::collections::BTreeMap;

use time::Date;

use crate::{
    BiomassComposite, BoundaryRecord, FeatureDay, PipelineError, SoilSample, WeatherDay,
};

#[derive(Debug, Clone)]
pub struct JoinInputs<'a> {
    pub boundary: &'a BoundaryRecord,
    /// Soil rows in ingestion order; the last row's `source_version` is the
    /// one recorded on the features.
    pub soil: &'a [SoilSample],
    pub composites: &'a [BiomassComposite],
    pub weather: &'a [WeatherDay],
    pub weather_source_version: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializeSummary {
    pub inserted: usize,
    pub missing_weather_days: usize,
    pub missing_biomass_days: usize,
}

#[derive(Debug, Clone)]
pub struct MaterializedFeatures {
    pub rows: Vec<FeatureDay>,
    pub summary: MaterializeSummary,
}

/// Materializes one `FeatureDay` per day of the inclusive `[start, end]`
/// range.
///
/// # Errors
/// Returns [`PipelineError::Validation`] for a reversed range, duplicate
/// weather days, or duplicate composite dates.
pub fn materialize_feature_days(
    inputs: &JoinInputs<'_>,
    start: Date,
    end: Date,
) -> Result<MaterializedFeatures, PipelineError> {
    if start > end {
        return Err(PipelineError::Validation(format!(
            "invalid date range: start {start} is after end {end}"
        )));
    }
    inputs.boundary.validate()?;

    let weather_by_date = index_weather(inputs.weather)?;
    let composites = sorted_composites(inputs.composites)?;
    let soil = aggregate_soil(inputs.soil);

    let mut rows = Vec::new();
    let mut missing_weather = 0_usize;
    let mut missing_biomass = 0_usize;

    // Cursor into the sorted composites; advances monotonically as the day
    // moves forward (carry-forward as-of join).
    let mut cursor = 0_usize;
    let mut current: Option<&BiomassComposite> = None;

    let mut day = start;
    loop {
        while cursor < composites.len() && composites[cursor].composite_date <= day {
            current = Some(composites[cursor]);
            cursor += 1;
        }

        let weather = weather_by_date.get(&day);
        if weather.is_none() {
            missing_weather += 1;
        }
        if current.is_none() {
            missing_biomass += 1;
        }

        rows.push(FeatureDay {
            boundary_id: inputs.boundary.boundary_id.clone(),
            feature_date: day,
            biomass_composite_date: current.map(|c| c.composite_date),
            biomass_kg_per_ha: current.map(|c| c.biomass_kg_per_ha),
            biomass_source_version: current.map(|c| c.source_version.clone()),
            weather_precipitation_mm: weather.and_then(|w| w.precipitation_mm),
            weather_temp_max_c: weather.and_then(|w| w.temp_max_c),
            weather_temp_min_c: weather.and_then(|w| w.temp_min_c),
            weather_wind_speed_kmh: weather.and_then(|w| w.wind_speed_kmh),
            weather_source_version: inputs.weather_source_version.to_string(),
            soil_productivity_index_mean: soil.productivity_index_mean,
            soil_available_water_capacity_mean: soil.available_water_capacity_mean,
            soil_source_version: soil.source_version.clone(),
            area_ha: inputs.boundary.area_ha,
        });

        if day == end {
            break;
        }
        day = day.next_day().ok_or_else(|| {
            PipelineError::Validation("date range exceeds supported calendar".to_string())
        })?;
    }

    let summary = MaterializeSummary {
        inserted: rows.len(),
        missing_weather_days: missing_weather,
        missing_biomass_days: missing_biomass,
    };

    Ok(MaterializedFeatures { rows, summary })
}

struct SoilAggregate {
    productivity_index_mean: Option<f64>,
    available_water_capacity_mean: Option<f64>,
    source_version: Option<String>,
}

#[allow(clippy::cast_precision_loss)]
fn aggregate_soil(samples: &[SoilSample]) -> SoilAggregate {
    let mean = |values: Vec<f64>| -> Option<f64> {
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    };

    SoilAggregate {
        productivity_index_mean: mean(
            samples
                .iter()
                .filter_map(|sample| sample.productivity_index)
                .collect(),
        ),
        available_water_capacity_mean: mean(
            samples
                .iter()
                .filter_map(|sample| sample.available_water_capacity)
                .collect(),
        ),
        source_version: samples.last().map(|sample| sample.source_version.clone()),
    }
}

fn index_weather(
    weather: &[WeatherDay],
) -> Result<BTreeMap<Date, &WeatherDay>, PipelineError> {
    let mut by_date = BTreeMap::new();
    for row in weather {
        if by_date.insert(row.forecast_date, row).is_some() {
            return Err(PipelineError::Validation(format!(
                "duplicate weather row for {}",
                row.forecast_date
            )));
        }
    }
    Ok(by_date)
}

fn sorted_composites(
    composites: &[BiomassComposite],
) -> Result<Vec<&BiomassComposite>, PipelineError> {
    let mut sorted: Vec<&BiomassComposite> = composites.iter().collect();
    sorted.sort_by_key(|composite| composite.composite_date);

    for pair in sorted.windows(2) {
        if pair[0].composite_date == pair[1].composite_date {
            return Err(PipelineError::Validation(format!(
                "duplicate biomass composite for {}",
                pair[0].composite_date
            )));
        }
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_date;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_boundary() -> BoundaryRecord {
        BoundaryRecord {
            boundary_id: "ranch_001_paddock_3".to_string(),
            name: "Paddock 3".to_string(),
            geometry_geojson: "{}".to_string(),
            crs: "EPSG:4326".to_string(),
            area_ha: 50.0,
            centroid_lat: 44.5,
            centroid_lon: -103.2,
        }
    }

    fn composite(date: &str, biomass: f64) -> BiomassComposite {
        BiomassComposite {
            composite_date: must_ok(parse_date(date)),
            biomass_kg_per_ha: biomass,
            source_version: "rap:v1".to_string(),
        }
    }

    fn weather_day(date: &str) -> WeatherDay {
        WeatherDay {
            forecast_date: must_ok(parse_date(date)),
            precipitation_mm: Some(1.0),
            temp_max_c: Some(20.0),
            temp_min_c: Some(10.0),
            wind_speed_kmh: Some(5.0),
        }
    }

    fn soil_sample(pi: f64, awc: f64) -> SoilSample {
        SoilSample {
            productivity_index: Some(pi),
            available_water_capacity: Some(awc),
            source_version: "nrcs:v1".to_string(),
        }
    }

    #[test]
    fn as_of_join_takes_most_recent_composite_not_after_day() {
        let boundary = fixture_boundary();
        let soil = vec![soil_sample(50.0, 0.15)];
        let composites = vec![
            composite("2024-01-05", 900.0),
            composite("2024-01-02", 800.0),
            composite("2024-01-10", 1000.0),
        ];
        let weather: Vec<WeatherDay> = Vec::new();

        let inputs = JoinInputs {
            boundary: &boundary,
            soil: &soil,
            composites: &composites,
            weather: &weather,
            weather_source_version: "openmeteo:v1",
        };
        let result = must_ok(materialize_feature_days(
            &inputs,
            must_ok(parse_date("2024-01-01")),
            must_ok(parse_date("2024-01-12")),
        ));

        let by_date = |raw: &str| -> FeatureDay {
            let target = must_ok(parse_date(raw));
            match result.rows.iter().find(|row| row.feature_date == target) {
                Some(row) => row.clone(),
                None => panic!("missing feature row for {raw}"),
            }
        };

        // Before the first composite: null biomass.
        assert_eq!(by_date("2024-01-01").biomass_kg_per_ha, None);
        // Between d2 and d3: value from d2.
        assert_eq!(by_date("2024-01-07").biomass_kg_per_ha, Some(900.0));
        assert_eq!(
            by_date("2024-01-07").biomass_composite_date,
            Some(must_ok(parse_date("2024-01-05")))
        );
        // On and after the last composite.
        assert_eq!(by_date("2024-01-10").biomass_kg_per_ha, Some(1000.0));
        assert_eq!(by_date("2024-01-12").biomass_kg_per_ha, Some(1000.0));
        assert_eq!(result.summary.missing_biomass_days, 1);
    }

    #[test]
    fn leap_year_range_materializes_366_rows() {
        let boundary = fixture_boundary();
        let soil = vec![soil_sample(50.0, 0.15)];
        let composites = vec![composite("2023-12-15", 700.0)];
        let weather: Vec<WeatherDay> = Vec::new();

        let inputs = JoinInputs {
            boundary: &boundary,
            soil: &soil,
            composites: &composites,
            weather: &weather,
            weather_source_version: "openmeteo:v1",
        };
        let result = must_ok(materialize_feature_days(
            &inputs,
            must_ok(parse_date("2024-01-01")),
            must_ok(parse_date("2024-12-31")),
        ));

        assert_eq!(result.rows.len(), 366);
        assert_eq!(result.summary.inserted, 366);
        assert_eq!(result.summary.missing_weather_days, 366);
        assert_eq!(result.summary.missing_biomass_days, 0);
    }

    #[test]
    fn weather_exact_match_and_missing_day_count() {
        let boundary = fixture_boundary();
        let soil = vec![soil_sample(40.0, 0.10), soil_sample(60.0, 0.20)];
        let composites = vec![composite("2024-01-01", 500.0)];
        let weather = vec![weather_day("2024-01-01"), weather_day("2024-01-03")];

        let inputs = JoinInputs {
            boundary: &boundary,
            soil: &soil,
            composites: &composites,
            weather: &weather,
            weather_source_version: "openmeteo:v1",
        };
        let result = must_ok(materialize_feature_days(
            &inputs,
            must_ok(parse_date("2024-01-01")),
            must_ok(parse_date("2024-01-03")),
        ));

        assert_eq!(result.summary.missing_weather_days, 1);
        assert!(result.rows[0].has_weather());
        assert!(!result.rows[1].has_weather());
        // Soil means broadcast to every day.
        for row in &result.rows {
            assert_eq!(row.soil_productivity_index_mean, Some(50.0));
            assert!(
                (row.soil_available_water_capacity_mean.unwrap_or(0.0) - 0.15).abs() < 1e-12
            );
            assert_eq!(row.area_ha, 50.0);
        }
    }

    #[test]
    fn duplicate_weather_rows_are_rejected() {
        let boundary = fixture_boundary();
        let soil = Vec::new();
        let composites = Vec::new();
        let weather = vec![weather_day("2024-01-01"), weather_day("2024-01-01")];

        let inputs = JoinInputs {
            boundary: &boundary,
            soil: &soil,
            composites: &composites,
            weather: &weather,
            weather_source_version: "openmeteo:v1",
        };
        assert!(materialize_feature_days(
            &inputs,
            must_ok(parse_date("2024-01-01")),
            must_ok(parse_date("2024-01-02")),
        )
        .is_err());
    }

    #[test]
    fn rerun_is_bit_identical() {
        let boundary = fixture_boundary();
        let soil = vec![soil_sample(50.0, 0.15)];
        let composites = vec![composite("2024-01-01", 500.0)];
        let weather = vec![weather_day("2024-01-01"), weather_day("2024-01-02")];

        let inputs = JoinInputs {
            boundary: &boundary,
            soil: &soil,
            composites: &composites,
            weather: &weather,
            weather_source_version: "openmeteo:v1",
        };
        let start = must_ok(parse_date("2024-01-01"));
        let end = must_ok(parse_date("2024-01-02"));

        let first = must_ok(materialize_feature_days(&inputs, start, end));
        let second = must_ok(materialize_feature_days(&inputs, start, end));
        assert_eq!(first.rows, second.rows);
    }
}
