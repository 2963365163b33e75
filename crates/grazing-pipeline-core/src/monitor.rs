//! Label-free monitoring over a rolling window of recommendation outputs.
//!
//! No ground truth exists for "days remaining", so the monitor watches output
//! distributions instead: degenerate values, saturation at the cap, input
//! staleness carried through provenance, and drift of the window mean against
//! the preceding window.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::Date;

use crate::{
    format_date, AlertSeverity, MonitorStatus, PipelineConfig, PipelineError,
};

/// One recommendation projected down to what the monitor needs.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutcome {
    pub calculation_date: Date,
    pub days_remaining: f64,
    /// As-of composite date recovered from the run's provenance; `None` when
    /// the run computed without biomass.
    pub biomass_composite_date: Option<Date>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorAlert {
    pub name: String,
    pub severity: AlertSeverity,
    pub passed: bool,
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorReport {
    pub boundary_id: String,
    pub window_start: String,
    pub window_end: String,
    pub status: MonitorStatus,
    pub metrics: Value,
    pub alerts: Vec<MonitorAlert>,
}

/// Evaluates the monitoring window for one boundary.
///
/// `window` holds the outcomes inside `[start, end]`; `preceding` holds the
/// outcomes of the equal-length window immediately before it, used only for
/// the drift metric. An empty window short-circuits to a single crit alert.
///
/// # Errors
/// Returns [`PipelineError::Validation`] for a reversed range.
#[allow(clippy::cast_precision_loss)]
pub fn evaluate_window(
    boundary_id: &str,
    window: &[WindowOutcome],
    preceding: &[WindowOutcome],
    start: Date,
    end: Date,
    cfg: &PipelineConfig,
) -> Result<MonitorReport, PipelineError> {
    if start > end {
        return Err(PipelineError::Validation(format!(
            "invalid monitoring window: start {start} is after end {end}"
        )));
    }

    let window_start = format_date(start)?;
    let window_end = format_date(end)?;

    if window.is_empty() {
        let alert = MonitorAlert {
            name: "no_recommendations_in_window".to_string(),
            severity: AlertSeverity::Crit,
            passed: false,
            details: json!({ "n_recommendations": 0 }),
        };
        return Ok(MonitorReport {
            boundary_id: boundary_id.to_string(),
            window_start,
            window_end,
            status: MonitorStatus::Crit,
            metrics: json!({ "n_recommendations": 0 }),
            alerts: vec![alert],
        });
    }

    let n = window.len();
    let zero_count = window
        .iter()
        .filter(|o| o.days_remaining <= cfg.min_days_remaining)
        .count();
    let over_max_count = window
        .iter()
        .filter(|o| o.days_remaining > cfg.max_days_remaining)
        .count();
    let pct_zero = zero_count as f64 / n as f64;
    let pct_over_max = over_max_count as f64 / n as f64;

    let staleness: Vec<f64> = window
        .iter()
        .filter_map(|o| {
            o.biomass_composite_date
                .map(|composite| (o.calculation_date - composite).whole_days() as f64)
        })
        .collect();
    let staleness_p95 = pctl(&staleness, 0.95);

    let window_mean = mean(window);
    let preceding_mean = if preceding.is_empty() {
        None
    } else {
        Some(mean(preceding))
    };
    let drift_ratio = preceding_mean.and_then(|prev| {
        if prev.abs() < f64::EPSILON {
            None
        } else {
            Some((window_mean - prev).abs() / prev.abs())
        }
    });

    let metrics = json!({
        "n_recommendations": n,
        "pct_zero_days_remaining": pct_zero,
        "pct_over_max_days_remaining": pct_over_max,
        "rap_staleness_p95_days": staleness_p95,
        "mean_days_remaining": window_mean,
        "preceding_mean_days_remaining": preceding_mean,
        "mean_drift_ratio": drift_ratio,
    });

    let mut alerts = Vec::new();
    alerts.push(MonitorAlert {
        name: "no_recommendations_in_window".to_string(),
        severity: AlertSeverity::Crit,
        passed: true,
        details: json!({ "n_recommendations": n }),
    });
    alerts.push(threshold_alert(
        "too_many_zero_days_remaining",
        pct_zero,
        cfg.monitor_zero_days_warn_pct,
        cfg.monitor_zero_days_crit_pct,
        json!({ "pct": pct_zero, "count": zero_count }),
    ));
    alerts.push(threshold_alert(
        "too_many_over_max_days_remaining",
        pct_over_max,
        cfg.monitor_over_max_warn_pct,
        cfg.monitor_over_max_crit_pct,
        json!({ "pct": pct_over_max, "count": over_max_count }),
    ));

    match staleness_p95 {
        Some(p95) => alerts.push(threshold_alert(
            "rap_p95_staleness_too_high",
            p95,
            cfg.monitor_rap_p95_stale_warn_days as f64,
            cfg.monitor_rap_p95_stale_crit_days as f64,
            json!({ "p95_days": p95, "sample_count": staleness.len() }),
        )),
        // Recommendations exist but none carry a composite date: the
        // staleness signal itself is missing, which is worth a warning.
        None => alerts.push(MonitorAlert {
            name: "missing_rap_staleness_metrics".to_string(),
            severity: AlertSeverity::Warn,
            passed: false,
            details: json!({ "sample_count": 0 }),
        }),
    }

    match drift_ratio {
        Some(ratio) => alerts.push(threshold_alert(
            "mean_days_remaining_drift",
            ratio,
            cfg.monitor_drift_warn_ratio,
            cfg.monitor_drift_crit_ratio,
            json!({
                "drift_ratio": ratio,
                "window_mean": window_mean,
                "preceding_mean": preceding_mean,
            }),
        )),
        // No preceding history yet (or a zero baseline): drift is undefined
        // and passes.
        None => alerts.push(MonitorAlert {
            name: "mean_days_remaining_drift".to_string(),
            severity: AlertSeverity::Warn,
            passed: true,
            details: json!({
                "window_mean": window_mean,
                "preceding_mean": preceding_mean,
            }),
        }),
    }

    let status = rollup(&alerts);

    Ok(MonitorReport {
        boundary_id: boundary_id.to_string(),
        window_start,
        window_end,
        status,
        metrics,
        alerts,
    })
}

fn threshold_alert(
    name: &str,
    value: f64,
    warn_at: f64,
    crit_at: f64,
    details: Value,
) -> MonitorAlert {
    let (severity, passed) = if value >= crit_at {
        (AlertSeverity::Crit, false)
    } else if value >= warn_at {
        (AlertSeverity::Warn, false)
    } else {
        (AlertSeverity::Warn, true)
    };
    MonitorAlert {
        name: name.to_string(),
        severity,
        passed,
        details,
    }
}

fn rollup(alerts: &[MonitorAlert]) -> MonitorStatus {
    let mut status = MonitorStatus::Ok;
    for alert in alerts {
        if alert.passed {
            continue;
        }
        let level = match alert.severity {
            AlertSeverity::Crit => MonitorStatus::Crit,
            AlertSeverity::Warn => MonitorStatus::Warn,
        };
        if level > status {
            status = level;
        }
    }
    status
}

#[allow(clippy::cast_precision_loss)]
fn mean(outcomes: &[WindowOutcome]) -> f64 {
    outcomes.iter().map(|o| o.days_remaining).sum::<f64>() / outcomes.len() as f64
}

/// Nearest-rank percentile: sort ascending, take `round((n - 1) * p)`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn pctl(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let idx = (((sorted.len() - 1) as f64) * p).round() as usize;
    Some(sorted[idx])
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

    fn outcome(date: &str, days: f64, composite: Option<&str>) -> WindowOutcome {
        WindowOutcome {
            calculation_date: must_ok(parse_date(date)),
            days_remaining: days,
            biomass_composite_date: composite.map(|raw| must_ok(parse_date(raw))),
        }
    }

    fn window_bounds() -> (Date, Date) {
        (
            must_ok(parse_date("2025-06-01")),
            must_ok(parse_date("2025-06-30")),
        )
    }

    #[test]
    fn empty_window_is_crit_with_single_alert() {
        let (start, end) = window_bounds();
        let report = must_ok(evaluate_window(
            "ranch_001_paddock_3",
            &[],
            &[],
            start,
            end,
            &PipelineConfig::default(),
        ));
        assert_eq!(report.status, MonitorStatus::Crit);
        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].name, "no_recommendations_in_window");
    }

    #[test]
    fn healthy_window_is_ok() {
        let (start, end) = window_bounds();
        let window: Vec<WindowOutcome> = (1..=20)
            .map(|day| {
                outcome(
                    &format!("2025-06-{day:02}"),
                    20.0 + f64::from(day),
                    Some("2025-05-20"),
                )
            })
            .collect();
        let preceding: Vec<WindowOutcome> = (1..=20)
            .map(|day| outcome(&format!("2025-05-{day:02}"), 25.0, Some("2025-04-20")))
            .collect();

        let report = must_ok(evaluate_window(
            "ranch_001_paddock_3",
            &window,
            &preceding,
            start,
            end,
            &PipelineConfig::default(),
        ));
        assert_eq!(report.status, MonitorStatus::Ok);
        assert!(report.alerts.iter().all(|alert| alert.passed));
    }

    #[test]
    fn zero_days_fraction_escalates_warn_then_crit() {
        let (start, end) = window_bounds();
        let cfg = PipelineConfig::default();

        // 1 of 20 at zero = 5%: above warn (2%), below crit (10%).
        let mut window: Vec<WindowOutcome> = (1..=19)
            .map(|day| outcome(&format!("2025-06-{day:02}"), 30.0, Some("2025-05-20")))
            .collect();
        window.push(outcome("2025-06-20", 0.0, Some("2025-05-20")));

        let report = must_ok(evaluate_window("b", &window, &[], start, end, &cfg));
        assert_eq!(report.status, MonitorStatus::Warn);

        // 3 of 20 at zero = 15%: above crit.
        for day in 18..=19 {
            window[day - 1].days_remaining = 0.0;
        }
        let report = must_ok(evaluate_window("b", &window, &[], start, end, &cfg));
        assert_eq!(report.status, MonitorStatus::Crit);
    }

    #[test]
    fn days_remaining_at_the_cap_is_not_over_max() {
        let (start, end) = window_bounds();
        let cfg = PipelineConfig::default();

        // Exactly at the cap: only values strictly above it count.
        let mut window: Vec<WindowOutcome> = (1..=10)
            .map(|day| {
                outcome(
                    &format!("2025-06-{day:02}"),
                    cfg.max_days_remaining,
                    Some("2025-05-20"),
                )
            })
            .collect();
        let report = must_ok(evaluate_window("b", &window, &[], start, end, &cfg));
        assert!(report
            .alerts
            .iter()
            .any(|alert| alert.name == "too_many_over_max_days_remaining" && alert.passed));

        // 1 of 10 above the cap = 10%: above the 5% crit fraction.
        window[0].days_remaining = cfg.max_days_remaining + 0.5;
        let report = must_ok(evaluate_window("b", &window, &[], start, end, &cfg));
        assert!(report
            .alerts
            .iter()
            .any(|alert| alert.name == "too_many_over_max_days_remaining"
                && alert.severity == AlertSeverity::Crit
                && !alert.passed));
    }

    #[test]
    fn missing_staleness_metrics_warn() {
        let (start, end) = window_bounds();
        let window = vec![
            outcome("2025-06-01", 30.0, None),
            outcome("2025-06-02", 31.0, None),
        ];
        let report = must_ok(evaluate_window(
            "b",
            &window,
            &[],
            start,
            end,
            &PipelineConfig::default(),
        ));
        assert_eq!(report.status, MonitorStatus::Warn);
        assert!(report
            .alerts
            .iter()
            .any(|alert| alert.name == "missing_rap_staleness_metrics" && !alert.passed));
    }

    #[test]
    fn drift_against_preceding_window() {
        let (start, end) = window_bounds();
        let cfg = PipelineConfig::default();
        let window: Vec<WindowOutcome> = (1..=10)
            .map(|day| outcome(&format!("2025-06-{day:02}"), 10.0, Some("2025-05-20")))
            .collect();
        let preceding: Vec<WindowOutcome> = (1..=10)
            .map(|day| outcome(&format!("2025-05-{day:02}"), 30.0, Some("2025-04-20")))
            .collect();

        // |10 - 30| / 30 = 0.667: above the 0.50 crit ratio.
        let report = must_ok(evaluate_window("b", &window, &preceding, start, end, &cfg));
        assert_eq!(report.status, MonitorStatus::Crit);
        assert!(report
            .alerts
            .iter()
            .any(|alert| alert.name == "mean_days_remaining_drift" && !alert.passed));

        // No preceding window: drift passes.
        let report = must_ok(evaluate_window("b", &window, &[], start, end, &cfg));
        assert!(report
            .alerts
            .iter()
            .any(|alert| alert.name == "mean_days_remaining_drift" && alert.passed));
    }

    #[test]
    fn staleness_p95_escalates() {
        let (start, end) = window_bounds();
        let cfg = PipelineConfig::default();
        // Composites ~300 days old: above the 240-day crit threshold.
        let window: Vec<WindowOutcome> = (1..=10)
            .map(|day| outcome(&format!("2025-06-{day:02}"), 30.0, Some("2024-08-01")))
            .collect();
        let report = must_ok(evaluate_window("b", &window, &[], start, end, &cfg));
        assert_eq!(report.status, MonitorStatus::Crit);
    }

    #[test]
    fn pctl_uses_nearest_rank() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(pctl(&values, 0.95), Some(10.0));
        // (10 - 1) * 0.5 = 4.5 rounds half away from zero to index 5.
        assert_eq!(pctl(&values, 0.5), Some(6.0));
        assert_eq!(pctl(&[], 0.95), None);
    }
}
