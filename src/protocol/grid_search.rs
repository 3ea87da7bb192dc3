//! The three-stage (coarse, medium, fine) grid search over the initial
//! continuous infusion rate, seeded by a compensation heuristic that
//! accounts for the rate being stepped down repeatedly over the run.

use crate::error::{PKError, PKResult};
use crate::monitoring::TimeSeries;
use crate::params::{PDParams, PKParams};

use super::{controller, scoring, AdjustmentEvent, PerformanceMetrics, ProtocolRequest, ProtocolSettings};

pub struct SearchOutcome {
    pub rate_mg_per_hr: f64,
    pub series: TimeSeries,
    pub adjustments: Vec<AdjustmentEvent>,
    pub performance: PerformanceMetrics,
    pub fallback_count: u64,
}

struct Candidate {
    rate: f64,
    run: controller::ClosedLoopRun,
    performance: PerformanceMetrics,
}

fn compensation_max_rate(settings: &ProtocolSettings) -> f64 {
    let hours = settings.simulation_duration_min / 60.0;
    let estimated_step_downs = (0.7 * settings.max_adjustments_per_hour as f64 * hours).min(15.0);
    let cumulative_reduction = settings.reduction_factor.powf(estimated_step_downs);
    let compensation = 1.0 / cumulative_reduction;
    let base = if settings.target_ce <= 2.0 { 800.0 } else { 1200.0 };
    (base * compensation).min(2000.0)
}

fn evaluate(
    pk: &PKParams,
    pd: &PDParams,
    rate: f64,
    request: ProtocolRequest,
    settings: &ProtocolSettings,
) -> PKResult<Candidate> {
    let run = controller::simulate(pk, pd, rate, request.bolus_mg, settings)?;
    let performance = scoring::evaluate(&run.series, settings);
    Ok(Candidate { rate, run, performance })
}

fn best_of(
    pk: &PKParams,
    pd: &PDParams,
    rates: impl Iterator<Item = f64>,
    request: ProtocolRequest,
    settings: &ProtocolSettings,
) -> PKResult<Candidate> {
    let mut best: Option<Candidate> = None;
    for rate in rates {
        if rate < settings.minimum_rate_mg_per_hr {
            continue;
        }
        let candidate = evaluate(pk, pd, rate, request, settings)?;
        best = match best {
            Some(current) if current.performance.overall_score >= candidate.performance.overall_score => {
                Some(current)
            }
            _ => Some(candidate),
        };
    }
    best.ok_or_else(|| PKError::OptimizerNoFeasibleRate("empty candidate range".to_string()))
}

fn stepped_range(center: f64, half_width: f64, step: f64, floor: f64, ceiling: f64) -> Vec<f64> {
    let low = (center - half_width).max(floor);
    let high = (center + half_width).min(ceiling);
    let mut rates = Vec::new();
    let mut r = low;
    while r <= high + 1e-9 {
        rates.push(r);
        r += step;
    }
    rates
}

/// Coarse -> medium -> fine grid search, each stage narrowing around the
/// prior stage's best candidate. Falls back to the best-available candidate
/// with a warning if nothing clears a positive overall score.
pub fn search(
    pk: &PKParams,
    pd: &PDParams,
    request: ProtocolRequest,
    settings: &ProtocolSettings,
) -> PKResult<SearchOutcome> {
    let max_rate = compensation_max_rate(settings);

    let coarse_step = if settings.target_ce <= 2.0 { 30.0 } else { 40.0 };
    let coarse_rates = stepped_range(
        (100.0 + max_rate) / 2.0,
        (max_rate - 100.0) / 2.0,
        coarse_step,
        100.0,
        max_rate,
    );
    let coarse_best = best_of(pk, pd, coarse_rates.into_iter(), request, settings)?;

    let medium_half = (0.3 * coarse_best.rate).max(150.0);
    let medium_rates = stepped_range(coarse_best.rate, medium_half, 10.0, 50.0, max_rate);
    let medium_best = best_of(pk, pd, medium_rates.into_iter(), request, settings)?;

    let fine_half = (0.1 * medium_best.rate).max(50.0);
    let fine_rates = stepped_range(medium_best.rate, fine_half, 2.0, 20.0, max_rate);
    let fine_best = best_of(pk, pd, fine_rates.into_iter(), request, settings)?;

    let overall_best = [coarse_best, medium_best, fine_best]
        .into_iter()
        .max_by(|a, b| a.performance.overall_score.partial_cmp(&b.performance.overall_score).unwrap())
        .expect("three non-empty stages");

    if overall_best.performance.overall_score <= 0.0 {
        log::warn!(
            "protocol search exhausted its bounds without a positive overall score; returning best-available rate {}",
            overall_best.rate
        );
    }

    Ok(SearchOutcome {
        rate_mg_per_hr: overall_best.rate,
        fallback_count: overall_best.run.fallback_count,
        series: overall_best.run.series,
        adjustments: overall_best.run.adjustments,
        performance: overall_best.performance,
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

    #[test]
    fn search_converges_within_bounds() {
        let (pk, pd) = reference_params();
        let settings = ProtocolSettings::new(3.0).unwrap();
        let request = ProtocolRequest {
            bolus_mg: 140.0,
            target_reach_time_min: 20.0,
        };
        let outcome = search(&pk, &pd, request, &settings).unwrap();
        assert!((20.0..=2000.0).contains(&outcome.rate_mg_per_hr));
        assert!(outcome.performance.overall_score >= 0.0);
    }

    #[test]
    fn compensation_heuristic_scales_with_target() {
        let low = ProtocolSettings::new(1.5).unwrap();
        let high = ProtocolSettings::new(5.0).unwrap();
        assert!(compensation_max_rate(&low) <= compensation_max_rate(&high) + 1e-9);
    }
}
