//! Component E: the full-horizon monitoring simulator and its CSV export.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::dosing::{DoseEvent, DoseSchedule};
use crate::error::PKResult;
use crate::integrator::{self, CompartmentState, IntegrationMethod};
use crate::params;
use crate::patient::Patient;

pub const MONITOR_DT_MIN: f64 = 0.01;
const SAMPLE_EVERY_STEPS: usize = 100; // 1-minute grid at dt = 0.01 min
const EVENT_ATTACH_WINDOW_MIN: f64 = 0.5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSeries {
    pub t_min: Vec<f64>,
    pub plasma_ug_per_ml: Vec<f64>,
    pub ce_ug_per_ml: Vec<f64>,
    pub infusion_rate_mg_per_hr: Vec<f64>,
    pub bis: Vec<f64>,
    /// The dose event active within +/-0.5 min of this sample, if any.
    pub active_event: Vec<Option<DoseEvent>>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.t_min.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t_min.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringResult {
    pub time_series: TimeSeries,
    pub max_plasma: f64,
    pub max_ce: f64,
    pub min_bis: f64,
    pub calculation_method: IntegrationMethod,
    /// Count of Euler fallback events recovered from over the run.
    pub fallback_count: u64,
}

fn grid_index(t_minutes: f64, dt: f64) -> i64 {
    (t_minutes / dt).round() as i64
}

fn nearest_active_event(events: &[DoseEvent], t_minutes: f64) -> Option<DoseEvent> {
    events
        .iter()
        .filter(|e| (e.t_minutes - t_minutes).abs() <= EVENT_ATTACH_WINDOW_MIN)
        .min_by(|a, b| {
            (a.t_minutes - t_minutes)
                .abs()
                .partial_cmp(&(b.t_minutes - t_minutes).abs())
                .unwrap()
        })
        .copied()
}

/// Integrates the full dose schedule to `horizon_min` (default: the last
/// event time + 120 min) on a 0.01-min grid using the unified compartment
/// integrator, then downsamples to a 1-min `TimeSeries`.
pub fn simulate(
    patient: &Patient,
    schedule: &DoseSchedule,
    horizon_min: Option<f64>,
    method: IntegrationMethod,
) -> PKResult<MonitoringResult> {
    let (pk, pd) = params::derive(patient)?;
    let streams = schedule.materialize();

    let max_event_time = schedule
        .events()
        .iter()
        .map(|e| e.t_minutes)
        .fold(0.0_f64, f64::max);
    let horizon = horizon_min.unwrap_or(max_event_time + 120.0);

    let total_steps = (horizon / MONITOR_DT_MIN).round() as i64;

    let mut bolus_by_index = std::collections::HashMap::new();
    for bolus in &streams.bolus_stream {
        let idx = grid_index(bolus.t_minutes, MONITOR_DT_MIN);
        *bolus_by_index.entry(idx).or_insert(0.0) += bolus.dose_mg;
    }

    let mut state = CompartmentState::ZERO.with_bolus(streams.initial_a1);
    let mut fallback_count = 0u64;

    let mut series = TimeSeries::default();

    for step in 0..=total_steps {
        let t = step as f64 * MONITOR_DT_MIN;

        if step > 0 {
            if let Some(&bolus) = bolus_by_index.get(&step) {
                state = state.with_bolus(bolus);
            }
        }

        if step % SAMPLE_EVERY_STEPS as i64 == 0 {
            series.t_min.push(t);
            series.plasma_ug_per_ml.push(state.plasma(&pk));
            series.ce_ug_per_ml.push(state.ce);
            series.bis.push(pd.bis(state.ce));
            series
                .infusion_rate_mg_per_hr
                .push(streams.rate_mg_per_min_at(t) * 60.0);
            series
                .active_event
                .push(nearest_active_event(schedule.events(), t));
        }

        if step == total_steps {
            break;
        }

        let rate_mg_per_min = streams.rate_mg_per_min_at(t);
        let (next_state, fallback) = integrator::step(&state, &pk, rate_mg_per_min, MONITOR_DT_MIN, method)?;
        state = next_state;
        if fallback {
            fallback_count += 1;
        }
    }

    let max_plasma = series.plasma_ug_per_ml.iter().cloned().fold(0.0, f64::max);
    let max_ce = series.ce_ug_per_ml.iter().cloned().fold(0.0, f64::max);
    let min_bis = series
        .bis
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);

    Ok(MonitoringResult {
        time_series: series,
        max_plasma,
        max_ce,
        min_bis: if min_bis.is_finite() { min_bis } else { 0.0 },
        calculation_method: method,
        fallback_count,
    })
}

fn format_time_label(patient: &Patient, t_min: f64) -> String {
    match patient.anesthesia_start_min {
        Some(start) => {
            let total_min = (start + t_min).rem_euclid(1440.0);
            let seconds = ((total_min * 60.0).round() as i64).rem_euclid(86_400) as u32;
            let time = chrono::NaiveTime::from_num_seconds_from_midnight(seconds, 0);
            time.format("%H:%M").to_string()
        }
        None => format!("{}", t_min.round() as i64),
    }
}

fn fmt3(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.3}")
    } else {
        "N/A".to_string()
    }
}

fn fmt1(value: f64) -> String {
    if value.is_finite() {
        format!("{value:.1}")
    } else {
        "N/A".to_string()
    }
}

/// Writes the exact CSV layout specified: a patient-attribute header line, a
/// column header line, then one row per sample.
pub fn write_csv<W: Write>(mut writer: W, patient: &Patient, series: &TimeSeries) -> PKResult<()> {
    let anesthesia_start = match patient.anesthesia_start_min {
        Some(start) => format!("{:02}:{:02}", (start as i64) / 60, (start as i64) % 60),
        None => "N/A".to_string(),
    };

    writeln!(
        writer,
        "Patient ID:{},Age:{} years,Weight:{} kg,Height:{} cm,Sex:{:?},ASA:{:?},Opioid:{:?},Anesthesia Start:{}",
        patient.id,
        patient.age_y,
        patient.weight_kg,
        patient.height_cm,
        patient.sex,
        patient.asa,
        patient.opioid,
        anesthesia_start
    )?;

    writeln!(
        writer,
        "Time,Predicted Plasma Conc.(\u{b5}g/mL),Predicted Effect-site Conc.(\u{b5}g/mL),Predicted BIS Value"
    )?;

    for i in 0..series.len() {
        writeln!(
            writer,
            "{},{},{},{}",
            format_time_label(patient, series.t_min[i]),
            fmt3(series.plasma_ug_per_ml[i]),
            fmt3(series.ce_ug_per_ml[i]),
            fmt1(series.bis[i])
        )?;
    }

    Ok(())
}
