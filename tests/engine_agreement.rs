//! Cross-module integration tests that cannot live inside a single
//! module's `#[cfg(test)]` block: agreement between the live tick-driven
//! engine and the offline monitoring engine, and an end-to-end protocol
//! run against the published reference patient.

use sedation_pkpd::dosing::{DoseEvent, DoseSchedule};
use sedation_pkpd::induction::InductionSimulator;
use sedation_pkpd::integrator::IntegrationMethod;
use sedation_pkpd::monitoring;
use sedation_pkpd::patient::{AsaClass, Opioid, Patient, Sex};
use sedation_pkpd::protocol::{self, ProtocolRequest, ProtocolSettings};

fn reference_patient() -> Patient {
    Patient::new(
        "ref", 35.0, 70.0, 170.0, Sex::Male, AsaClass::OneOrTwo, Opioid::Yes, None,
    )
    .unwrap()
}

/// P6: the live induction engine and the offline monitoring engine must
/// agree to within 1e-6 on identical dose histories, since both drive the
/// same unified integrator at the same fixed 0.01-min step.
#[test]
fn induction_and_monitoring_agree_on_identical_dose_history() {
    let patient = reference_patient();
    let bolus_mg = 140.0;
    let continuous_mg_per_hr = 200.0;
    let horizon_min = 30.0;

    let mut sim = InductionSimulator::new();
    sim.start(patient.clone(), bolus_mg, continuous_mg_per_hr).unwrap();
    let mut live_final = None;
    let ticks = (horizon_min / sedation_pkpd::induction::SIMULATED_DT_MIN).round() as u64;
    for _ in 0..ticks {
        live_final = Some(sim.tick().unwrap());
    }
    let live_final = live_final.unwrap();

    let mut schedule = DoseSchedule::new();
    schedule
        .add(DoseEvent::new(0.0, bolus_mg, continuous_mg_per_hr).unwrap())
        .unwrap();
    let monitoring_result = monitoring::simulate(
        &patient,
        &schedule,
        Some(horizon_min),
        IntegrationMethod::Rk4,
    )
    .unwrap();
    let ts = &monitoring_result.time_series;
    let last = ts.len() - 1;

    assert!((ts.t_min[last] - live_final.elapsed_min).abs() < 1e-9);
    assert!((ts.plasma_ug_per_ml[last] - live_final.plasma).abs() < 1e-6);
    assert!((ts.ce_ug_per_ml[last] - live_final.ce).abs() < 1e-6);
    assert!((ts.bis[last] - live_final.bis).abs() < 1e-6);
}

/// S5: a full protocol run, exercised end to end through the public API.
#[test]
fn protocol_run_produces_a_coherent_schedule() {
    let patient = reference_patient();
    let settings = ProtocolSettings::new(3.0).unwrap();
    let request = ProtocolRequest {
        bolus_mg: 140.0,
        target_reach_time_min: 20.0,
    };

    let result = protocol::run(&patient, request, &settings).unwrap();

    assert!(result.optimal_initial_rate_mg_per_hr > 0.0);
    assert!(!result.schedule.is_empty());
    assert!(result.time_series.t_min.last().copied().unwrap_or(0.0) >= settings.simulation_duration_min - 1e-6);

    // Every adjustment in the schedule must also appear as a step-down row.
    let step_downs = result
        .schedule
        .iter()
        .filter(|row| matches!(row, sedation_pkpd::protocol::ScheduleRow::StepDown { .. }))
        .count();
    assert_eq!(step_downs, result.adjustments.len());
}
