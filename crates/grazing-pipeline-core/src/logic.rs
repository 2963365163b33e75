//! Days-remaining recommendation logic.
//!
//! Units: biomass is kg/ha, area is ha, so available forage is kg; intake is
//! kg/head/day, so daily consumption is kg/day and the quotient is days.

use serde::{Deserialize, Serialize};
use time::Date;

use crate::{add_whole_days, iso_date, FeatureDay, PipelineError};

/// Bumped whenever the formula changes; part of the recommendation identity.
pub const LOGIC_VERSION: &str = "days_remaining:v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GrazingCalc {
    pub available_forage_kg: f64,
    pub daily_consumption_kg: f64,
    pub days_remaining: f64,
    #[serde(with = "iso_date")]
    pub recommended_move_date: Date,
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn daily_consumption_kg(animal_count: i64, daily_intake_kg_per_head: f64) -> f64 {
    animal_count as f64 * daily_intake_kg_per_head
}

/// Available forage for a materialized day: as-of biomass times boundary
/// area. A day with no biomass yet contributes zero forage.
#[must_use]
pub fn available_forage_kg(feature: &FeatureDay) -> f64 {
    feature.biomass_kg_per_ha.unwrap_or(0.0) * feature.area_ha
}

/// # Errors
/// Returns [`PipelineError::Validation`] when daily consumption is not
/// positive; a herd that eats nothing has no finite days-remaining.
pub fn days_remaining(
    available_forage_kg: f64,
    daily_consumption_kg: f64,
) -> Result<f64, PipelineError> {
    if daily_consumption_kg <= 0.0 {
        return Err(PipelineError::Validation(
            "daily_consumption_kg must be > 0 to compute days remaining".to_string(),
        ));
    }
    Ok(available_forage_kg / daily_consumption_kg)
}

/// Move date is `as_of + floor(days_remaining)` days, clamped at zero so a
/// depleted pasture recommends moving immediately.
#[must_use]
pub fn recommended_move_date(as_of: Date, days_remaining: f64) -> Date {
    add_whole_days(as_of, days_remaining)
}

/// Full calculation for one materialized day and one herd.
///
/// # Errors
/// Returns [`PipelineError::Validation`] on non-positive consumption.
pub fn compute_calc(
    feature: &FeatureDay,
    animal_count: i64,
    daily_intake_kg_per_head: f64,
    as_of: Date,
) -> Result<GrazingCalc, PipelineError> {
    let daily = daily_consumption_kg(animal_count, daily_intake_kg_per_head);
    let available = available_forage_kg(feature);
    let days = days_remaining(available, daily)?;

    Ok(GrazingCalc {
        available_forage_kg: available,
        daily_consumption_kg: daily,
        days_remaining: days,
        recommended_move_date: recommended_move_date(as_of, days),
    })
}
