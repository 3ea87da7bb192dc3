//! The closed-loop threshold step-down controller: a single continuous
//! rate, stepped down by a fixed fraction whenever effect-site
//! concentration crosses the upper threshold, gated by a minimum interval
//! and a per-hour adjustment cap.

use crate::error::PKResult;
use crate::integrator::{self, CompartmentState, IntegrationMethod};
use crate::params::{PDParams, PKParams};

use super::{AdjustmentEvent, ProtocolSettings};
use crate::monitoring::TimeSeries;

pub struct ClosedLoopRun {
    pub series: TimeSeries,
    pub adjustments: Vec<AdjustmentEvent>,
    pub fallback_count: u64,
}

/// Simulates one full closed-loop run at a fixed initial continuous rate,
/// applying step-downs in place as the threshold is crossed. Runs on the
/// same unified integrator as induction and monitoring, at the protocol's
/// own (coarser) fixed time step.
pub fn simulate(
    pk: &PKParams,
    pd: &PDParams,
    initial_rate_mg_per_hr: f64,
    bolus_mg: f64,
    settings: &ProtocolSettings,
) -> PKResult<ClosedLoopRun> {
    let dt = settings.time_step_min;
    let total_steps = (settings.simulation_duration_min / dt).round() as i64;
    let upper_threshold = settings.target_ce * settings.upper_threshold_ratio;

    let mut state = CompartmentState::ZERO.with_bolus(bolus_mg);
    let mut current_rate = initial_rate_mg_per_hr;
    let mut last_adjustment_t = f64::NEG_INFINITY;
    let mut hour_index = -1_i64;
    let mut adjustments_this_hour = 0_u32;
    let mut adjustments = Vec::new();
    let mut series = TimeSeries::default();
    let mut fallback_count = 0u64;

    for step in 0..=total_steps {
        let t = step as f64 * dt;
        let this_hour = (t / 60.0).floor() as i64;
        if this_hour != hour_index {
            hour_index = this_hour;
            adjustments_this_hour = 0;
        }

        series.t_min.push(t);
        series.plasma_ug_per_ml.push(state.plasma(pk));
        series.ce_ug_per_ml.push(state.ce);
        series.bis.push(pd.bis(state.ce));
        series.infusion_rate_mg_per_hr.push(current_rate);
        series.active_event.push(None);

        if state.ce >= upper_threshold
            && (t - last_adjustment_t) >= settings.adjustment_interval_min
            && adjustments_this_hour < settings.max_adjustments_per_hour
            && current_rate > settings.minimum_rate_mg_per_hr
        {
            let old_rate = current_rate;
            let new_rate = (current_rate * settings.reduction_factor).max(settings.minimum_rate_mg_per_hr);
            adjustments.push(AdjustmentEvent {
                t_min: t,
                old_rate,
                new_rate,
                ce_at_event: state.ce,
                adjustment_number: adjustments.len() as u32 + 1,
                reduction_percent: (1.0 - new_rate / old_rate) * 100.0,
            });
            current_rate = new_rate;
            last_adjustment_t = t;
            adjustments_this_hour += 1;
        }

        if step == total_steps {
            break;
        }

        let r_mg_per_min = current_rate / 60.0;
        let (next_state, fallback) = integrator::step(&state, pk, r_mg_per_min, dt, IntegrationMethod::Rk4)?;
        state = next_state;
        if fallback {
            fallback_count += 1;
        }
    }

    Ok(ClosedLoopRun {
        series,
        adjustments,
        fallback_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient::{AsaClass, Opioid, Patient, Sex};

    fn reference_params() -> (PKParams, PDParams) {
        let patient = Patient::new(
            "ref", 35.0, 70.0, 170.0, Sex::Male, AsaClass::OneOrTwo, Opioid::Yes, None,
        )
        .unwrap();
        crate::params::derive(&patient).unwrap()
    }

    /// P7: adjustment spacing respects the interval and the per-hour cap.
    #[test]
    fn adjustments_respect_interval_and_hourly_cap() {
        let (pk, pd) = reference_params();
        let settings = ProtocolSettings::new(3.0).unwrap();
        let run = simulate(&pk, &pd, 1400.0, 140.0, &settings).unwrap();

        for window in run.adjustments.windows(2) {
            assert!(window[1].t_min - window[0].t_min >= settings.adjustment_interval_min - 1e-9);
        }

        let mut per_hour = std::collections::HashMap::new();
        for adj in &run.adjustments {
            *per_hour.entry((adj.t_min / 60.0).floor() as i64).or_insert(0) += 1;
        }
        for count in per_hour.values() {
            assert!(*count <= settings.max_adjustments_per_hour as i64);
        }
    }

    #[test]
    fn low_rate_never_triggers_an_adjustment() {
        let (pk, pd) = reference_params();
        let settings = ProtocolSettings::new(3.0).unwrap();
        let run = simulate(&pk, &pd, 100.0, 0.0, &settings).unwrap();
        assert!(run.adjustments.is_empty());
    }
}
