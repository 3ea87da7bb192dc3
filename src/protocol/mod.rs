//! Component F: the step-down infusion protocol optimizer.
//!
//! A threshold controller closes the loop on the unified compartment
//! integrator; a three-stage grid search over the initial continuous rate
//! picks the candidate that best maintains the target effect-site
//! concentration across a set of maintenance checkpoints.

pub mod controller;
pub mod grid_search;
pub mod scoring;

use serde::{Deserialize, Serialize};

use crate::error::{PKError, PKResult, Violations};
use crate::monitoring::TimeSeries;
use crate::patient::Patient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolSettings {
    pub target_ce: f64,
    pub upper_threshold_ratio: f64,
    pub reduction_factor: f64,
    pub adjustment_interval_min: f64,
    pub time_step_min: f64,
    pub simulation_duration_min: f64,
    pub maintenance_points: Vec<f64>,
    pub max_adjustments_per_hour: u32,
    pub maintenance_tolerance: f64,
    pub evaluation_window_min: f64,
    pub minimum_rate_mg_per_hr: f64,
    pub convergence_threshold_ratio: f64,
}

impl ProtocolSettings {
    pub fn new(target_ce: f64) -> PKResult<Self> {
        let settings = Self {
            target_ce,
            upper_threshold_ratio: 1.20,
            reduction_factor: 0.70,
            adjustment_interval_min: 5.0,
            time_step_min: 0.1,
            simulation_duration_min: 360.0,
            maintenance_points: vec![30.0, 60.0, 90.0, 120.0],
            max_adjustments_per_hour: 3,
            maintenance_tolerance: 0.10,
            evaluation_window_min: 5.0,
            minimum_rate_mg_per_hr: 0.1,
            convergence_threshold_ratio: 0.05,
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> PKResult<()> {
        let mut v = Violations::new();
        v.check(
            (0.5..=8.0).contains(&self.target_ce),
            format!("target_ce must be within [0.5, 8.0], got {}", self.target_ce),
        );
        v.check(
            (1.05..=1.30).contains(&self.upper_threshold_ratio),
            format!(
                "upper_threshold_ratio must be within [1.05, 1.30], got {}",
                self.upper_threshold_ratio
            ),
        );
        v.check(
            (0.50..=0.90).contains(&self.reduction_factor),
            format!(
                "reduction_factor must be within [0.50, 0.90], got {}",
                self.reduction_factor
            ),
        );
        v.check(
            self.adjustment_interval_min >= 3.0,
            format!(
                "adjustment_interval_min must be >= 3, got {}",
                self.adjustment_interval_min
            ),
        );
        v.check(self.time_step_min > 0.0, "time_step_min must be > 0".to_string());
        v.check(
            self.simulation_duration_min > 0.0,
            "simulation_duration_min must be > 0".to_string(),
        );
        v.check(
            self.minimum_rate_mg_per_hr > 0.0,
            "minimum_rate_mg_per_hr must be > 0".to_string(),
        );
        if v.is_empty() {
            Ok(())
        } else {
            Err(PKError::InvalidProtocolSettings(v.into_joined()))
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdjustmentEvent {
    pub t_min: f64,
    pub old_rate: f64,
    pub new_rate: f64,
    pub ce_at_event: f64,
    pub adjustment_number: u32,
    pub reduction_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub maintenance_score: f64,
    pub stability_index: f64,
    pub convergence_time_min: Option<f64>,
    pub overshoot_percent: f64,
    pub time_in_target: f64,
    pub overall_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScheduleRow {
    Bolus {
        t_min: f64,
        dose_mg: f64,
    },
    StartInfusion {
        t_min: f64,
        rate_mg_per_hr: f64,
    },
    StepDown {
        t_min: f64,
        old_rate_mg_per_hr: f64,
        new_rate_mg_per_hr: f64,
        ce_ug_per_ml: f64,
    },
    MaintenancePoint {
        t_min: f64,
        target_ce: f64,
        observed_ce: f64,
        within_tolerance: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolResult {
    pub optimal_initial_rate_mg_per_hr: f64,
    pub time_series: TimeSeries,
    pub adjustments: Vec<AdjustmentEvent>,
    pub performance: PerformanceMetrics,
    pub schedule: Vec<ScheduleRow>,
    /// Euler fallback events recovered from during the winning candidate's run.
    pub fallback_count: u64,
}

/// target_ce, bolus, and target-reach-time inputs to a single optimizer run.
/// `target_reach_time_min` is accepted for interface fidelity with the
/// external contract but is not consumed by the scoring formulas — see
/// DESIGN.md's resolution of the matching Open Question.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolRequest {
    pub bolus_mg: f64,
    pub target_reach_time_min: f64,
}

pub fn run(
    patient: &Patient,
    request: ProtocolRequest,
    settings: &ProtocolSettings,
) -> PKResult<ProtocolResult> {
    let (pk, pd) = crate::params::derive(patient)?;
    let outcome = grid_search::search(&pk, &pd, request, settings)?;

    let schedule = build_schedule(request, settings, &outcome.series, &outcome.adjustments);

    Ok(ProtocolResult {
        optimal_initial_rate_mg_per_hr: outcome.rate_mg_per_hr,
        time_series: outcome.series,
        adjustments: outcome.adjustments,
        performance: outcome.performance,
        schedule,
        fallback_count: outcome.fallback_count,
    })
}

fn build_schedule(
    request: ProtocolRequest,
    settings: &ProtocolSettings,
    series: &TimeSeries,
    adjustments: &[AdjustmentEvent],
) -> Vec<ScheduleRow> {
    let mut rows = vec![
        ScheduleRow::Bolus {
            t_min: 0.0,
            dose_mg: request.bolus_mg,
        },
        ScheduleRow::StartInfusion {
            t_min: 0.0,
            rate_mg_per_hr: series.infusion_rate_mg_per_hr.first().copied().unwrap_or(0.0),
        },
    ];

    for adj in adjustments {
        rows.push(ScheduleRow::StepDown {
            t_min: adj.t_min,
            old_rate_mg_per_hr: adj.old_rate,
            new_rate_mg_per_hr: adj.new_rate,
            ce_ug_per_ml: adj.ce_at_event,
        });
    }

    for &tau in &settings.maintenance_points {
        let observed = scoring::mean_ce_in_window(series, tau, settings.evaluation_window_min);
        let rel_err = (observed - settings.target_ce).abs() / settings.target_ce;
        rows.push(ScheduleRow::MaintenancePoint {
            t_min: tau,
            target_ce: settings.target_ce,
            observed_ce: observed,
            within_tolerance: rel_err <= settings.maintenance_tolerance,
        });
    }

    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient::{AsaClass, Opioid, Sex};

    fn reference() -> Patient {
        Patient::new(
            "ref", 35.0, 70.0, 170.0, Sex::Male, AsaClass::OneOrTwo, Opioid::Yes, None,
        )
        .unwrap()
    }

    /// S5: a full protocol run against the published reference patient.
    #[test]
    fn protocol_run_meets_reference_scenario_bounds() {
        let settings = ProtocolSettings::new(3.0).unwrap();
        let request = ProtocolRequest {
            bolus_mg: 140.0,
            target_reach_time_min: 20.0,
        };
        let result = run(&reference(), request, &settings).unwrap();

        assert!((100.0..=2000.0).contains(&result.optimal_initial_rate_mg_per_hr));
        assert!((3..=18).contains(&result.adjustments.len()));
        assert!(result.performance.maintenance_score >= 60.0);

        for window in result.adjustments.windows(2) {
            assert!(window[1].t_min - window[0].t_min >= settings.adjustment_interval_min - 1e-9);
        }
        for adj in &result.adjustments {
            let expected = (adj.old_rate * settings.reduction_factor).max(settings.minimum_rate_mg_per_hr);
            assert!((adj.new_rate - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(ProtocolSettings::new(50.0).is_err());
    }
}
