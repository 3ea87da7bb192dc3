pub mod clinical_notation;

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PKError, PKResult};
use crate::integrator::IntegrationMethod;
use crate::protocol::ProtocolSettings;

fn default_integration_method() -> IntegrationMethod {
    IntegrationMethod::Rk4
}

/// Overrides layered onto `ProtocolSettings::new`'s defaults. Every field is
/// optional; an absent field keeps the built-in default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProtocolSettingsOverrides {
    pub upper_threshold_ratio: Option<f64>,
    pub reduction_factor: Option<f64>,
    pub adjustment_interval_min: Option<f64>,
    pub simulation_duration_min: Option<f64>,
    pub maintenance_points: Option<Vec<f64>>,
    pub max_adjustments_per_hour: Option<u32>,
    pub maintenance_tolerance: Option<f64>,
    pub evaluation_window_min: Option<f64>,
    pub minimum_rate_mg_per_hr: Option<f64>,
    pub convergence_threshold_ratio: Option<f64>,
}

impl ProtocolSettingsOverrides {
    pub fn apply(&self, target_ce: f64) -> PKResult<ProtocolSettings> {
        let mut settings = ProtocolSettings::new(target_ce)?;
        if let Some(v) = self.upper_threshold_ratio {
            settings.upper_threshold_ratio = v;
        }
        if let Some(v) = self.reduction_factor {
            settings.reduction_factor = v;
        }
        if let Some(v) = self.adjustment_interval_min {
            settings.adjustment_interval_min = v;
        }
        if let Some(v) = self.simulation_duration_min {
            settings.simulation_duration_min = v;
        }
        if let Some(ref v) = self.maintenance_points {
            settings.maintenance_points = v.clone();
        }
        if let Some(v) = self.max_adjustments_per_hour {
            settings.max_adjustments_per_hour = v;
        }
        if let Some(v) = self.maintenance_tolerance {
            settings.maintenance_tolerance = v;
        }
        if let Some(v) = self.evaluation_window_min {
            settings.evaluation_window_min = v;
        }
        if let Some(v) = self.minimum_rate_mg_per_hr {
            settings.minimum_rate_mg_per_hr = v;
        }
        if let Some(v) = self.convergence_threshold_ratio {
            settings.convergence_threshold_ratio = v;
        }
        settings.validate()?;
        Ok(settings)
    }
}

/// Top-level run configuration loaded from a JSON file via `--config`. Every
/// field has a sensible default so an empty `{}` file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_integration_method")]
    pub integration_method: IntegrationMethod,
    #[serde(default)]
    pub protocol_overrides: ProtocolSettingsOverrides,
    #[serde(default)]
    pub monitoring_horizon_min: Option<f64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            integration_method: default_integration_method(),
            protocol_overrides: ProtocolSettingsOverrides::default(),
            monitoring_horizon_min: None,
        }
    }
}

impl RunConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> PKResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RunConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PKResult<()> {
        if let Some(horizon) = self.monitoring_horizon_min {
            if horizon <= 0.0 {
                return Err(PKError::InvalidProtocolSettings(
                    "monitoring_horizon_min must be > 0".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_object_loads_with_defaults() {
        let config: RunConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.integration_method, IntegrationMethod::Rk4);
        assert!(config.monitoring_horizon_min.is_none());
    }

    #[test]
    fn overrides_layer_onto_protocol_defaults() {
        let overrides = ProtocolSettingsOverrides {
            reduction_factor: Some(0.6),
            ..Default::default()
        };
        let settings = overrides.apply(3.0).unwrap();
        assert_eq!(settings.reduction_factor, 0.6);
        assert_eq!(settings.upper_threshold_ratio, 1.20);
    }
}
