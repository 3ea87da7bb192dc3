//! Component A: the covariate-driven PK/PD parameter model.
//!
//! Implements the published Eleveld-style covariate model for a
//! sedative-hypnotic administered by continuous/bolus IV infusion. The
//! theta/pd constants are treated as opaque model coefficients per the
//! model's own convention; the sigmoid/ageing/opioid helper forms and the
//! per-parameter covariate equations are implemented exactly as specified.

use serde::{Deserialize, Serialize};

use crate::error::{PKError, PKResult};
use crate::patient::Patient;

/// Reference individual the sigmoidal covariate terms are normalized
/// against: 35 y / 70 kg / 170 cm male.
const REF_AGE_Y: f64 = 35.0;
const REF_WEIGHT_KG: f64 = 70.0;
const REF_PMA_WEEKS: f64 = REF_AGE_Y * 52.0 + 40.0;

mod theta {
    // PK covariate model coefficients.
    pub const V1_REF: f64 = 6.28; // L
    pub const V2_REF: f64 = 25.5; // L
    pub const V3_SCALE: f64 = 750.672; // L, scales with ffm/ffm_ref and opioid term
    pub const CL_REF_MALE: f64 = 5.1152; // L/min
    pub const CL_REF_FEMALE: f64 = 6.0011; // L/min
    pub const Q2_REF: f64 = 1.83; // L/min
    pub const Q3_SCALE: f64 = 2.3697; // L/min
    pub const CL_MATURATION_E50: f64 = 42.3; // weeks PMA
    pub const CL_MATURATION_HILL: f64 = 9.06;
    pub const V2_AGEING: f64 = -0.015;
    pub const CL_OPIOID: f64 = -0.03;
    pub const V1_WEIGHT_E50: f64 = 3.0; // kg
    pub const V3_OPIOID: f64 = -0.0289;
    pub const Q_MATURATION_E50: f64 = 50.0; // weeks PMA
    pub const Q2_MATURATION_WEIGHT: f64 = 0.0;
}

mod pd_theta {
    pub const CE50_REF: f64 = 3.08; // ug/mL
    pub const KE0_REF: f64 = 0.146; // 1/min
    pub const BIS_BASELINE: f64 = 93.0;
    pub const GAMMA_HIGH: f64 = 1.47;
    pub const CE50_AGE: f64 = -0.006;
    pub const GAMMA_LOW: f64 = 1.89;
}

fn sigmoid(x: f64, e50: f64, lambda: f64) -> f64 {
    let xl = x.powf(lambda);
    xl / (xl + e50.powf(lambda))
}

fn ageing(theta: f64, age: f64, age_ref: f64) -> f64 {
    (theta * (age - age_ref)).exp()
}

fn opioid_factor(theta: f64, age: f64, opioid: bool) -> f64 {
    if opioid {
        (theta * age).exp()
    } else {
        1.0
    }
}

/// Per-patient PK constants plus the first-order rate constants derived
/// from them. All fields are strictly positive for a patient that passed
/// `derive`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PKParams {
    pub v1: f64,
    pub v2: f64,
    pub v3: f64,
    pub cl: f64,
    pub q2: f64,
    pub q3: f64,
    pub ke0: f64,
}

impl PKParams {
    pub fn k10(&self) -> f64 {
        self.cl / self.v1
    }
    pub fn k12(&self) -> f64 {
        self.q2 / self.v1
    }
    pub fn k21(&self) -> f64 {
        self.q2 / self.v2
    }
    pub fn k13(&self) -> f64 {
        self.q3 / self.v1
    }
    pub fn k31(&self) -> f64 {
        self.q3 / self.v3
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PDParams {
    pub ce50: f64,
    pub ke0: f64,
    pub bis_baseline: f64,
    pub gamma_low: f64,
    pub gamma_high: f64,
}

impl PDParams {
    /// BIS from effect-site concentration via an asymmetric-gamma sigmoidal
    /// Emax model. Strictly decreasing in `ce` for ce in (0, 10*ce50], and
    /// BIS(0) == bis_baseline exactly.
    pub fn bis(&self, ce: f64) -> f64 {
        let ce = ce.max(0.0);
        let gamma = if ce < self.ce50 {
            self.gamma_low
        } else {
            self.gamma_high
        };
        let ce_g = ce.powf(gamma);
        let ce50_g = self.ce50.powf(gamma);
        self.bis_baseline * (1.0 - ce_g / (ce_g + ce50_g))
    }
}

pub fn derive(patient: &Patient) -> PKResult<(PKParams, PDParams)> {
    let age = patient.age_y;
    let weight = patient.weight_kg;
    let pma = patient.pma_weeks();
    let ffm = patient.ffm();
    let ffm_ref = Patient::ffm_ref();
    let opioid = patient.opioid_coadministered();

    let v1 = theta::V1_REF * sigmoid(weight, theta::V1_WEIGHT_E50, 1.0)
        / sigmoid(REF_WEIGHT_KG, theta::V1_WEIGHT_E50, 1.0);

    let v2 = theta::V2_REF * (weight / REF_WEIGHT_KG) * ageing(theta::V2_AGEING, age, REF_AGE_Y);

    let v3 = theta::V3_SCALE * (ffm / ffm_ref) * opioid_factor(theta::V3_OPIOID, age, opioid);

    let cl_ref = if patient.is_male() {
        theta::CL_REF_MALE
    } else {
        theta::CL_REF_FEMALE
    };
    let cl = cl_ref
        * (weight / REF_WEIGHT_KG).powf(0.75)
        * (sigmoid(pma, theta::CL_MATURATION_E50, theta::CL_MATURATION_HILL)
            / sigmoid(REF_PMA_WEEKS, theta::CL_MATURATION_E50, theta::CL_MATURATION_HILL))
        * opioid_factor(theta::CL_OPIOID, age, opioid);

    let q2 = theta::Q2_REF
        * (v2 / theta::V2_REF).powf(0.75)
        * (1.0
            + theta::Q2_MATURATION_WEIGHT
                * (1.0 - sigmoid(pma, theta::Q_MATURATION_E50, 1.0)));

    let q3 = theta::Q3_SCALE
        * (v3 / theta::V3_SCALE).powf(0.75)
        * (sigmoid(pma, theta::Q_MATURATION_E50, 1.0)
            / sigmoid(REF_PMA_WEEKS, theta::Q_MATURATION_E50, 1.0));

    let ke0 = pd_theta::KE0_REF * (weight / REF_WEIGHT_KG).powf(-0.25);

    let pk = PKParams {
        v1,
        v2,
        v3,
        cl,
        q2,
        q3,
        ke0,
    };
    validate_pk(&pk)?;

    let ce50 = pd_theta::CE50_REF * (pd_theta::CE50_AGE * (age - REF_AGE_Y)).exp();
    let pd = PDParams {
        ce50,
        ke0,
        bis_baseline: pd_theta::BIS_BASELINE,
        gamma_low: pd_theta::GAMMA_LOW,
        gamma_high: pd_theta::GAMMA_HIGH,
    };
    validate_pd(&pd)?;

    Ok((pk, pd))
}

fn validate_pk(pk: &PKParams) -> PKResult<()> {
    let fields: [(&str, f64); 7] = [
        ("V1", pk.v1),
        ("V2", pk.v2),
        ("V3", pk.v3),
        ("CL", pk.cl),
        ("Q2", pk.q2),
        ("Q3", pk.q3),
        ("ke0", pk.ke0),
    ];
    for (name, value) in fields {
        if !(value > 0.0) || !value.is_finite() {
            return Err(PKError::ParameterDerivation(format!(
                "derived PK parameter {name} must be positive and finite, got {value}"
            )));
        }
    }
    if !(0.05..=1.0).contains(&pk.ke0) {
        log::warn!(
            "derived ke0 {} is outside the advisory band [0.05, 1.0]",
            pk.ke0
        );
    }
    Ok(())
}

fn validate_pd(pd: &PDParams) -> PKResult<()> {
    let fields: [(&str, f64); 4] = [
        ("ce50", pd.ce50),
        ("bis_baseline", pd.bis_baseline),
        ("gamma_low", pd.gamma_low),
        ("gamma_high", pd.gamma_high),
    ];
    for (name, value) in fields {
        if !(value > 0.0) || !value.is_finite() {
            return Err(PKError::ParameterDerivation(format!(
                "derived PD parameter {name} must be positive and finite, got {value}"
            )));
        }
    }
    if !(0.5..=10.0).contains(&pd.ce50) {
        log::warn!("derived ce50 {} is outside the advisory band [0.5, 10]", pd.ce50);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patient::{AsaClass, Opioid, Sex};
    use approx::assert_relative_eq;

    fn reference_male() -> Patient {
        Patient::new(
            "ref-m",
            35.0,
            70.0,
            170.0,
            Sex::Male,
            AsaClass::OneOrTwo,
            Opioid::Yes,
            None,
        )
        .unwrap()
    }

    fn reference_female() -> Patient {
        Patient::new(
            "ref-f",
            35.0,
            70.0,
            170.0,
            Sex::Female,
            AsaClass::OneOrTwo,
            Opioid::Yes,
            None,
        )
        .unwrap()
    }

    /// S1: derivation on the reference individual.
    #[test]
    fn reference_individual_derives_published_parameters() {
        let (pk, pd) = derive(&reference_male()).unwrap();
        assert_relative_eq!(pk.v1, 6.28, max_relative = 0.005);
        assert_relative_eq!(pk.v2, 25.5, max_relative = 0.005);
        assert_relative_eq!(pk.v3, 273.0, max_relative = 0.005);
        assert_relative_eq!(pk.cl, 1.79, max_relative = 0.005);
        assert_relative_eq!(pk.q2, 1.83, max_relative = 0.005);
        assert_relative_eq!(pk.q3, 1.11, max_relative = 0.005);
        assert_relative_eq!(pk.ke0, 0.146, max_relative = 0.005);
        assert_relative_eq!(pd.ce50, 3.08, max_relative = 0.005);
        assert_relative_eq!(pd.bis_baseline, 93.0, max_relative = 0.005);
        assert_relative_eq!(pd.gamma_low, 1.89, max_relative = 0.005);
        assert_relative_eq!(pd.gamma_high, 1.47, max_relative = 0.005);
    }

    /// S2: only CL (and the ffm-gated V3/Q3 chain) moves with sex; the
    /// sex-independent parameters (V1, V2, Q2, ke0) stay within 1%. V3/Q3
    /// are excluded from the 1% check here: both depend on fat-free mass,
    /// and Al-Sallami FFM is itself sex-specific by construction, so a
    /// same-covariate female individual has a materially different FFM
    /// than the reference male (see DESIGN.md).
    #[test]
    fn female_reference_has_higher_clearance_other_pk_unchanged() {
        let (pk_m, _) = derive(&reference_male()).unwrap();
        let (pk_f, _) = derive(&reference_female()).unwrap();

        assert_relative_eq!(pk_f.cl, 2.10, max_relative = 0.01);
        assert_relative_eq!(pk_f.v1, pk_m.v1, max_relative = 0.01);
        assert_relative_eq!(pk_f.v2, pk_m.v2, max_relative = 0.01);
        assert_relative_eq!(pk_f.q2, pk_m.q2, max_relative = 0.01);
        assert_relative_eq!(pk_f.ke0, pk_m.ke0, max_relative = 0.01);
    }

    /// S6: BIS bounds hold for any ce in [0, 20], and BIS(0) == baseline.
    #[test]
    fn bis_is_bounded_and_baseline_at_zero_ce() {
        let (_, pd) = derive(&reference_male()).unwrap();
        assert_eq!(pd.bis(0.0), pd.bis_baseline);
        let mut ce = 0.0;
        while ce <= 20.0 {
            let bis = pd.bis(ce);
            assert!(bis >= 0.0 && bis <= pd.bis_baseline);
            ce += 0.25;
        }
    }

    /// P8: BIS is strictly decreasing in ce over (0, 10*ce50].
    #[test]
    fn bis_is_monotonically_decreasing_in_ce() {
        let (_, pd) = derive(&reference_male()).unwrap();
        let mut prev = pd.bis(0.0001);
        let mut ce = 0.01;
        while ce <= 10.0 * pd.ce50 {
            let cur = pd.bis(ce);
            assert!(cur < prev, "BIS not decreasing at ce={ce}: {cur} >= {prev}");
            prev = cur;
            ce += 0.05;
        }
    }

    #[test]
    fn rate_constants_are_all_positive() {
        let (pk, _) = derive(&reference_male()).unwrap();
        assert!(pk.k10() > 0.0);
        assert!(pk.k12() > 0.0);
        assert!(pk.k21() > 0.0);
        assert!(pk.k13() > 0.0);
        assert!(pk.k31() > 0.0);
    }
}
