//! Component C: the ordered dose event stream and its reduction into the
//! integrator's driving functions.

use serde::{Deserialize, Serialize};

use crate::error::{PKError, PKResult, Violations};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoseEvent {
    pub t_minutes: f64,
    pub bolus_mg: f64,
    pub continuous_mg_per_hr: f64,
}

impl DoseEvent {
    pub fn new(t_minutes: f64, bolus_mg: f64, continuous_mg_per_hr: f64) -> PKResult<Self> {
        let event = Self {
            t_minutes,
            bolus_mg,
            continuous_mg_per_hr,
        };
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> PKResult<()> {
        let mut v = Violations::new();
        v.check(
            self.t_minutes >= 0.0,
            format!("t_minutes must be >= 0, got {}", self.t_minutes),
        );
        v.check(
            self.bolus_mg >= 0.0,
            format!("bolus_mg must be >= 0, got {}", self.bolus_mg),
        );
        v.check(
            self.continuous_mg_per_hr >= 0.0,
            format!(
                "continuous_mg_per_hr must be >= 0, got {}",
                self.continuous_mg_per_hr
            ),
        );
        if v.is_empty() {
            Ok(())
        } else {
            Err(PKError::InvalidDoseEvent(v.into_joined()))
        }
    }
}

/// A rate-change point: the continuous infusion rate becomes `rate_mg_per_hr`
/// starting at `t_minutes`, until the next point in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatePoint {
    pub t_minutes: f64,
    pub rate_mg_per_hr: f64,
}

/// A bolus point: `dose_mg` is added to the central compartment as an
/// instantaneous jump at `t_minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BolusPoint {
    pub t_minutes: f64,
    pub dose_mg: f64,
}

/// The materialized driving streams an integrator consumes: a bolus stream
/// (only t > 0, since any t = 0 bolus becomes the initial condition), a
/// rate stream guaranteed to start at (0, 0) unless overridden, and the
/// t = 0 bolus exported separately.
#[derive(Debug, Clone, Default)]
pub struct DrivingStreams {
    pub initial_a1: f64,
    pub bolus_stream: Vec<BolusPoint>,
    pub rate_stream: Vec<RatePoint>,
}

impl DrivingStreams {
    /// The piecewise-constant rate in effect at `t`, expressed in mg/min
    /// for direct use by the integrator.
    pub fn rate_mg_per_min_at(&self, t_minutes: f64) -> f64 {
        let mut current = 0.0;
        for point in &self.rate_stream {
            if point.t_minutes <= t_minutes {
                current = point.rate_mg_per_hr;
            } else {
                break;
            }
        }
        current / 60.0
    }
}

/// Ordered list of dose events, sorted by `t_minutes`, stable for ties.
#[derive(Debug, Clone, Default)]
pub struct DoseSchedule {
    events: Vec<DoseEvent>,
}

impl DoseSchedule {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn add(&mut self, event: DoseEvent) -> PKResult<()> {
        event.validate()?;
        let insert_at = self
            .events
            .iter()
            .position(|e| e.t_minutes > event.t_minutes)
            .unwrap_or(self.events.len());
        self.events.insert(insert_at, event);
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> PKResult<DoseEvent> {
        if index >= self.events.len() {
            return Err(PKError::NotReady(format!(
                "no dose event at index {index}"
            )));
        }
        Ok(self.events.remove(index))
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn events(&self) -> &[DoseEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Reduces the ordered event list into (bolus_stream, rate_stream,
    /// initial_a1). Two events at an identical `t` are merged: bolus sums,
    /// the later-declared rate wins.
    pub fn materialize(&self) -> DrivingStreams {
        let mut initial_a1 = 0.0;
        let mut bolus_stream = Vec::new();
        let mut rate_stream = vec![RatePoint {
            t_minutes: 0.0,
            rate_mg_per_hr: 0.0,
        }];

        let mut i = 0;
        while i < self.events.len() {
            let t = self.events[i].t_minutes;
            let mut bolus_sum = 0.0;
            let mut rate_here: Option<f64> = None;
            let mut j = i;
            while j < self.events.len() && self.events[j].t_minutes == t {
                bolus_sum += self.events[j].bolus_mg;
                rate_here = Some(self.events[j].continuous_mg_per_hr);
                j += 1;
            }

            if t == 0.0 {
                initial_a1 += bolus_sum;
            } else if bolus_sum > 0.0 {
                bolus_stream.push(BolusPoint {
                    t_minutes: t,
                    dose_mg: bolus_sum,
                });
            }

            if let Some(rate) = rate_here {
                if t == 0.0 {
                    rate_stream[0].rate_mg_per_hr = rate;
                } else {
                    rate_stream.push(RatePoint {
                        t_minutes: t,
                        rate_mg_per_hr: rate,
                    });
                }
            }

            i = j;
        }

        bolus_stream.sort_by(|a, b| a.t_minutes.partial_cmp(&b.t_minutes).unwrap());
        rate_stream.sort_by(|a, b| a.t_minutes.partial_cmp(&b.t_minutes).unwrap());

        DrivingStreams {
            initial_a1,
            bolus_stream,
            rate_stream,
        }
    }
}
