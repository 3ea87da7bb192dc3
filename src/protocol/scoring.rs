//! Maintenance-point scoring and the performance metrics rolled up from a
//! single closed-loop run. The mean/variance helpers follow the same
//! running-statistics shape used for population parameter summaries.

use crate::monitoring::TimeSeries;

use super::{PerformanceMetrics, ProtocolSettings};

pub fn mean_ce_in_window(series: &TimeSeries, center_min: f64, window_min: f64) -> f64 {
    let half = window_min / 2.0;
    let values: Vec<f64> = series
        .t_min
        .iter()
        .zip(series.ce_ug_per_ml.iter())
        .filter(|(t, _)| (**t - center_min).abs() <= half)
        .map(|(_, ce)| *ce)
        .collect();
    mean(&values)
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn maintenance_score(series: &TimeSeries, settings: &ProtocolSettings) -> f64 {
    let point_scores: Vec<f64> = settings
        .maintenance_points
        .iter()
        .filter(|&&tau| tau <= *series.t_min.last().unwrap_or(&0.0))
        .map(|&tau| {
            let observed = mean_ce_in_window(series, tau, settings.evaluation_window_min);
            let rel_err = (observed - settings.target_ce).abs() / settings.target_ce;
            if rel_err <= settings.maintenance_tolerance {
                100.0
            } else {
                (100.0 - 500.0 * rel_err).max(0.0)
            }
        })
        .collect();
    mean(&point_scores)
}

fn stability_index(series: &TimeSeries) -> f64 {
    if series.ce_ug_per_ml.len() < 2 {
        return 100.0;
    }
    let diffs: Vec<f64> = series
        .ce_ug_per_ml
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .collect();
    (100.0 - 1000.0 * mean(&diffs)).max(0.0)
}

fn convergence_time(series: &TimeSeries, settings: &ProtocolSettings) -> Option<f64> {
    series
        .t_min
        .iter()
        .zip(series.ce_ug_per_ml.iter())
        .find(|(_, ce)| {
            (**ce - settings.target_ce).abs() / settings.target_ce <= settings.convergence_threshold_ratio
        })
        .map(|(t, _)| *t)
}

fn overshoot_percent(series: &TimeSeries, settings: &ProtocolSettings) -> f64 {
    let max_ce = series.ce_ug_per_ml.iter().cloned().fold(0.0, f64::max);
    ((max_ce / settings.target_ce - 1.0) * 100.0).max(0.0)
}

fn time_in_target(series: &TimeSeries, settings: &ProtocolSettings) -> f64 {
    if series.ce_ug_per_ml.is_empty() {
        return 0.0;
    }
    let hits = series
        .ce_ug_per_ml
        .iter()
        .filter(|&&ce| (ce - settings.target_ce).abs() / settings.target_ce <= settings.maintenance_tolerance)
        .count();
    hits as f64 / series.ce_ug_per_ml.len() as f64
}

/// Rolls a closed-loop run up into the headline metrics used by the grid
/// search to rank candidate initial rates.
pub fn evaluate(series: &TimeSeries, settings: &ProtocolSettings) -> PerformanceMetrics {
    let maintenance = maintenance_score(series, settings);
    let stability = stability_index(series);
    let convergence = convergence_time(series, settings);
    let overshoot = overshoot_percent(series, settings);
    let in_target = time_in_target(series, settings);

    let convergence_score = match convergence {
        Some(t) if t < 30.0 => 100.0,
        Some(t) => (100.0 - 2.0 * (t - 30.0)).max(0.0),
        None => 0.0,
    };

    let overall = (0.5 * maintenance + 0.25 * stability + 0.25 * convergence_score
        - 1.5 * (overshoot - 10.0).max(0.0))
    .max(0.0);

    PerformanceMetrics {
        maintenance_score: maintenance,
        stability_index: stability,
        convergence_time_min: convergence,
        overshoot_percent: overshoot,
        time_in_target: in_target,
        overall_score: overall,
    }
}
