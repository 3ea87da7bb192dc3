use serde::{Deserialize, Serialize};

use crate::error::{PKError, PKResult, Violations};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sex {
    Male,
    Female,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsaClass {
    #[serde(rename = "I-II")]
    OneOrTwo,
    #[serde(rename = "III-IV")]
    ThreeOrFour,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Opioid {
    Yes,
    No,
}

/// Immutable over the lifetime of a single simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: String,
    pub age_y: f64,
    pub weight_kg: f64,
    pub height_cm: f64,
    pub sex: Sex,
    pub asa: AsaClass,
    pub opioid: Opioid,
    /// Wall-clock anesthesia start, minutes-of-day convention (0..1440).
    /// `None` when no wall-clock reference is known (monitoring output
    /// then renders integer minutes instead of HH:MM).
    pub anesthesia_start_min: Option<f64>,
}

impl Patient {
    pub fn new(
        id: impl Into<String>,
        age_y: f64,
        weight_kg: f64,
        height_cm: f64,
        sex: Sex,
        asa: AsaClass,
        opioid: Opioid,
        anesthesia_start_min: Option<f64>,
    ) -> PKResult<Self> {
        let patient = Self {
            id: id.into(),
            age_y,
            weight_kg,
            height_cm,
            sex,
            asa,
            opioid,
            anesthesia_start_min,
        };
        patient.validate()?;
        Ok(patient)
    }

    pub fn validate(&self) -> PKResult<()> {
        let mut v = Violations::new();
        v.check(
            self.id.trim().len() > 0,
            "id must not be empty".to_string(),
        );
        v.check(
            (1.0..=100.0).contains(&self.age_y),
            format!("age_y must be within [1, 100], got {}", self.age_y),
        );
        v.check(
            (3.0..=200.0).contains(&self.weight_kg),
            format!("weight_kg must be within [3, 200], got {}", self.weight_kg),
        );
        v.check(
            (70.0..=220.0).contains(&self.height_cm),
            format!("height_cm must be within [70, 220], got {}", self.height_cm),
        );
        if let Some(t) = self.anesthesia_start_min {
            v.check(
                (0.0..1440.0).contains(&t),
                format!("anesthesia_start_min must be within [0, 1440), got {}", t),
            );
        }
        if v.is_empty() {
            Ok(())
        } else {
            Err(PKError::InvalidPatient(v.into_joined()))
        }
    }

    pub fn bmi(&self) -> f64 {
        let height_m = self.height_cm / 100.0;
        self.weight_kg / (height_m * height_m)
    }

    /// Post-menstrual age in weeks; for adults this is the age·52+40
    /// approximation the covariate model is defined over.
    pub fn pma_weeks(&self) -> f64 {
        self.age_y * 52.0 + 40.0
    }

    /// Fat-free mass via the Al-Sallami equation.
    pub fn ffm(&self) -> f64 {
        al_sallami_ffm(self.age_y, self.weight_kg, self.bmi(), self.sex)
    }

    /// Reference individual used to normalize sigmoidal covariate terms:
    /// 35 y / 70 kg / 170 cm male.
    pub fn ffm_ref() -> f64 {
        let height_cm = 170.0_f64;
        let weight_kg = 70.0_f64;
        let bmi = weight_kg / (height_cm / 100.0).powi(2);
        al_sallami_ffm(35.0, weight_kg, bmi, Sex::Male)
    }

    pub fn is_male(&self) -> bool {
        matches!(self.sex, Sex::Male)
    }

    pub fn opioid_coadministered(&self) -> bool {
        matches!(self.opioid, Opioid::Yes)
    }
}

fn al_sallami_ffm(age_y: f64, weight_kg: f64, bmi: f64, sex: Sex) -> f64 {
    if age_y < 2.0 {
        return 0.82 * weight_kg;
    }
    match sex {
        Sex::Male => {
            let numerator = 0.88 + (1.0 - 0.88) / (1.0 + (age_y / 13.4).powf(-12.7));
            numerator * (9270.0 * weight_kg) / (6680.0 + 216.0 * bmi)
        }
        Sex::Female => {
            let numerator = 1.11 + (1.0 - 1.11) / (1.0 + (age_y / 7.1).powf(-1.1));
            numerator * (9270.0 * weight_kg) / (8780.0 + 244.0 * bmi)
        }
    }
}
