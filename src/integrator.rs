//! Component B: the three-compartment + effect-site ODE integrator.
//!
//! A single pure stepping function backs every driver (induction,
//! monitoring, protocol) per the re-architecture guidance: no class
//! hierarchy, just one `step` entry point parameterized by an
//! `IntegrationMethod` tag.

use serde::{Deserialize, Serialize};

use crate::error::{PKError, PKResult};
use crate::params::PKParams;

/// Tagged variant standing in for the source's dynamic dispatch on
/// integration method. Never hot-swapped mid-run: fixing it per run keeps
/// results deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegrationMethod {
    Rk4,
    Euler,
}

/// (a1, a2, a3) in mg held in the central and two peripheral compartments,
/// plus the effect-site concentration `ce` in ug/mL. Every component is
/// clamped to >= 0 after each step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompartmentState {
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
    pub ce: f64,
}

impl CompartmentState {
    pub const ZERO: CompartmentState = CompartmentState {
        a1: 0.0,
        a2: 0.0,
        a3: 0.0,
        ce: 0.0,
    };

    /// Bolus as an instantaneous initial-condition jump into the central
    /// compartment. Never applied mid-step: callers apply this once at the
    /// declared event time, not smeared across an integration step.
    pub fn with_bolus(mut self, dose_mg: f64) -> Self {
        self.a1 += dose_mg;
        self
    }

    fn clamp_nonnegative(mut self) -> Self {
        self.a1 = self.a1.max(0.0);
        self.a2 = self.a2.max(0.0);
        self.a3 = self.a3.max(0.0);
        self.ce = self.ce.max(0.0);
        self
    }

    fn is_finite(&self) -> bool {
        self.a1.is_finite() && self.a2.is_finite() && self.a3.is_finite() && self.ce.is_finite()
    }

    pub fn plasma(&self, pk: &PKParams) -> f64 {
        self.a1 / pk.v1
    }
}

fn derivative(state: &CompartmentState, pk: &PKParams, r_mg_per_min: f64) -> CompartmentState {
    let k10 = pk.k10();
    let k12 = pk.k12();
    let k21 = pk.k21();
    let k13 = pk.k13();
    let k31 = pk.k31();

    let da1 = r_mg_per_min - (k10 + k12 + k13) * state.a1 + k21 * state.a2 + k31 * state.a3;
    let da2 = k12 * state.a1 - k21 * state.a2;
    let da3 = k13 * state.a1 - k31 * state.a3;
    let dce = pk.ke0 * (state.a1 / pk.v1 - state.ce);

    CompartmentState {
        a1: da1,
        a2: da2,
        a3: da3,
        ce: dce,
    }
}

fn add(a: &CompartmentState, b: &CompartmentState, scale: f64) -> CompartmentState {
    CompartmentState {
        a1: a.a1 + scale * b.a1,
        a2: a.a2 + scale * b.a2,
        a3: a.a3 + scale * b.a3,
        ce: a.ce + scale * b.ce,
    }
}

/// Classical 4th-order Runge-Kutta, equal half-step evaluations. `dt` is in
/// minutes; `r_mg_per_min` is held constant across the step (the driving
/// rate is piecewise-constant).
pub fn step_rk4(state: &CompartmentState, pk: &PKParams, r_mg_per_min: f64, dt: f64) -> CompartmentState {
    let k1 = derivative(state, pk, r_mg_per_min);
    let s2 = add(state, &k1, dt / 2.0);
    let k2 = derivative(&s2, pk, r_mg_per_min);
    let s3 = add(state, &k2, dt / 2.0);
    let k3 = derivative(&s3, pk, r_mg_per_min);
    let s4 = add(state, &k3, dt);
    let k4 = derivative(&s4, pk, r_mg_per_min);

    let slope = CompartmentState {
        a1: (k1.a1 + 2.0 * k2.a1 + 2.0 * k3.a1 + k4.a1) / 6.0,
        a2: (k1.a2 + 2.0 * k2.a2 + 2.0 * k3.a2 + k4.a2) / 6.0,
        a3: (k1.a3 + 2.0 * k2.a3 + 2.0 * k3.a3 + k4.a3) / 6.0,
        ce: (k1.ce + 2.0 * k2.ce + 2.0 * k3.ce + k4.ce) / 6.0,
    };

    add(state, &slope, dt).clamp_nonnegative()
}

/// Fallback used when RK4 would produce a NaN/Inf, or when explicitly
/// selected for the whole run.
pub fn step_euler(state: &CompartmentState, pk: &PKParams, r_mg_per_min: f64, dt: f64) -> CompartmentState {
    let k1 = derivative(state, pk, r_mg_per_min);
    add(state, &k1, dt).clamp_nonnegative()
}

/// A single `step` recovers from divergence with the Euler fallback before
/// surfacing a fatal error, implementing the integrator's numerical policy:
/// on NaN/Inf, retry once with Euler; fail if it recurs. The returned bool
/// is `true` when the Euler fallback was needed, so callers can count
/// recovered fallback events per spec.md's "recovered locally and counted"
/// contract.
pub fn step(
    state: &CompartmentState,
    pk: &PKParams,
    r_mg_per_min: f64,
    dt: f64,
    method: IntegrationMethod,
) -> PKResult<(CompartmentState, bool)> {
    let primary = match method {
        IntegrationMethod::Rk4 => step_rk4(state, pk, r_mg_per_min, dt),
        IntegrationMethod::Euler => step_euler(state, pk, r_mg_per_min, dt),
    };

    if primary.is_finite() {
        return Ok((primary, false));
    }

    log::warn!("integrator diverged under {method:?}, retrying with Euler fallback");
    let retry = step_euler(state, pk, r_mg_per_min, dt);
    if retry.is_finite() {
        return Ok((retry, true));
    }

    log::error!("integrator diverged again after Euler retry, aborting run");
    Err(PKError::IntegratorDiverged(
        "RK4 and Euler both produced non-finite state; aborting run".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient::{AsaClass, Opioid, Patient, Sex};
    use approx::assert_relative_eq;

    fn reference_params() -> PKParams {
        let patient = Patient::new(
            "ref", 35.0, 70.0, 170.0, Sex::Male, AsaClass::OneOrTwo, Opioid::Yes, None,
        )
        .unwrap();
        crate::params::derive(&patient).unwrap().0
    }

    /// P2: zero dose, zero initial state stays at zero for any horizon.
    #[test]
    fn zero_dose_keeps_state_at_zero() {
        let pk = reference_params();
        let mut state = CompartmentState::ZERO;
        for _ in 0..10_000 {
            state = step_rk4(&state, &pk, 0.0, 0.01);
        }
        assert_eq!(state, CompartmentState::ZERO);
    }

    /// P3: bolus-only decay, plasma concentration decreases monotonically.
    #[test]
    fn bolus_only_plasma_decays_monotonically() {
        let pk = reference_params();
        let mut state = CompartmentState::ZERO.with_bolus(140.0);
        let mut prev_plasma = state.plasma(&pk);
        for _ in 0..6_000 {
            state = step_rk4(&state, &pk, 0.0, 0.01);
            let plasma = state.plasma(&pk);
            assert!(plasma <= prev_plasma + 1e-12);
            prev_plasma = plasma;
        }
    }

    /// P1: every component stays finite and non-negative.
    #[test]
    fn state_stays_non_negative_and_finite() {
        let pk = reference_params();
        let mut state = CompartmentState::ZERO.with_bolus(140.0);
        for i in 0..36_000 {
            let rate = if i < 3000 { 200.0 / 60.0 } else { 0.0 };
            state = step_rk4(&state, &pk, rate, 0.01);
            assert!(state.a1 >= 0.0 && state.a2 >= 0.0 && state.a3 >= 0.0 && state.ce >= 0.0);
            assert!(state.is_finite());
        }
    }

    /// P4: steady-state infusion converges to Css = R_ss / CL within 3%.
    #[test]
    fn constant_infusion_converges_to_steady_state() {
        let pk = reference_params();
        let target_css = 2.0; // ug/mL
        let r_ss_per_min = pk.cl * target_css; // mg/min
        let mut state = CompartmentState::ZERO;
        let dt = 0.01;
        let k10 = pk.k10();
        let horizon_min = 5.0 * std::f64::consts::LN_2 / k10;
        let steps = (horizon_min / dt).ceil() as usize;
        for _ in 0..steps {
            state = step_rk4(&state, &pk, r_ss_per_min, dt);
        }
        let plasma = state.plasma(&pk);
        assert_relative_eq!(plasma, target_css, max_relative = 0.03);
    }

    /// P5: determinism, same inputs produce bitwise-identical trajectories.
    #[test]
    fn integration_is_deterministic() {
        let pk = reference_params();
        let run = || {
            let mut state = CompartmentState::ZERO.with_bolus(140.0);
            for _ in 0..1000 {
                state = step_rk4(&state, &pk, 200.0 / 60.0, 0.01);
            }
            state
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn euler_fallback_matches_signature_and_stays_non_negative() {
        let pk = reference_params();
        let mut state = CompartmentState::ZERO.with_bolus(140.0);
        for _ in 0..1000 {
            state = step_euler(&state, &pk, 0.0, 0.01);
            assert!(state.a1 >= 0.0);
        }
    }

    /// `step` reports no fallback on a well-behaved trajectory.
    #[test]
    fn step_reports_no_fallback_when_rk4_stays_finite() {
        let pk = reference_params();
        let state = CompartmentState::ZERO.with_bolus(140.0);
        let (_, fallback) = step(&state, &pk, 200.0 / 60.0, 0.01, IntegrationMethod::Rk4).unwrap();
        assert!(!fallback);
    }

    /// `step` recovers via Euler and reports it when RK4's nested stage
    /// evaluations overflow to infinity. `v1` this small makes `k10`/`k12`/
    /// `k13` large enough that RK4's fourth stage (evaluated at a state
    /// already amplified three times) overflows, while Euler's single
    /// evaluation at the unperturbed state stays finite and is clamped
    /// back to zero.
    #[test]
    fn step_recovers_and_reports_fallback_on_divergence() {
        let bad_pk = PKParams {
            v1: 1e-80,
            v2: 1.0,
            v3: 1.0,
            cl: 1.0,
            q2: 1.0,
            q3: 1.0,
            ke0: 1.0,
        };
        let state = CompartmentState::ZERO.with_bolus(1.0);
        assert!(!step_rk4(&state, &bad_pk, 0.0, 1.0).is_finite());

        let (recovered, fallback) = step(&state, &bad_pk, 0.0, 1.0, IntegrationMethod::Rk4).unwrap();
        assert!(fallback);
        assert!(recovered.is_finite());
    }
}
