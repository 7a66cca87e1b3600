//! Patient profiles and controller configuration, loaded once from TOML.

use crate::error::ConfigError;
use crate::safety::{ExponentialDecay, InsulinDecay, LinearDecay};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Clinical parameters for one patient. Immutable for the process lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientProfile {
    pub id: String,
    /// mg/dL drop per unit of insulin.
    pub insulin_sensitivity_factor: f64,
    pub target_low_mg_dl: f64,
    pub target_high_mg_dl: f64,
    pub max_bolus_units: f64,
    pub min_correction_interval_s: u64,
    pub insulin_action_duration_s: u64,
    #[serde(default = "default_low_battery_percent")]
    pub low_battery_percent: f64,
}

impl PatientProfile {
    pub fn min_correction_interval(&self) -> Duration {
        Duration::from_secs(self.min_correction_interval_s)
    }

    pub fn insulin_action_duration(&self) -> Duration {
        Duration::from_secs(self.insulin_action_duration_s)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(format!("patient {}: {msg}", self.id)));

        if self.id.is_empty() || self.id.contains(['/', ':']) {
            return invalid("id must be non-empty and contain no '/' or ':'");
        }
        if !(self.insulin_sensitivity_factor.is_finite() && self.insulin_sensitivity_factor > 0.0) {
            return invalid("insulin_sensitivity_factor must be > 0");
        }
        if !(self.target_low_mg_dl.is_finite()
            && self.target_high_mg_dl.is_finite()
            && self.target_low_mg_dl < self.target_high_mg_dl)
        {
            return invalid("target_low_mg_dl must be below target_high_mg_dl");
        }
        if !(self.max_bolus_units.is_finite() && self.max_bolus_units > 0.0) {
            return invalid("max_bolus_units must be > 0");
        }
        if self.insulin_action_duration_s == 0 {
            return invalid("insulin_action_duration_s must be > 0");
        }
        if !(0.0..=100.0).contains(&self.low_battery_percent) {
            return invalid("low_battery_percent must be within 0..=100");
        }
        Ok(())
    }
}

/// Same as [`PatientProfile`] without the id; applied to patients that have no
/// profile of their own.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DefaultProfile {
    pub insulin_sensitivity_factor: f64,
    pub target_low_mg_dl: f64,
    pub target_high_mg_dl: f64,
    pub max_bolus_units: f64,
    pub min_correction_interval_s: u64,
    pub insulin_action_duration_s: u64,
    #[serde(default = "default_low_battery_percent")]
    pub low_battery_percent: f64,
}

impl DefaultProfile {
    pub fn for_patient(&self, id: &str) -> PatientProfile {
        PatientProfile {
            id: id.to_owned(),
            insulin_sensitivity_factor: self.insulin_sensitivity_factor,
            target_low_mg_dl: self.target_low_mg_dl,
            target_high_mg_dl: self.target_high_mg_dl,
            max_bolus_units: self.max_bolus_units,
            min_correction_interval_s: self.min_correction_interval_s,
            insulin_action_duration_s: self.insulin_action_duration_s,
            low_battery_percent: self.low_battery_percent,
        }
    }
}

/// What to do when a correction exceeds the patient's maximum bolus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverLimitPolicy {
    /// Deliver the maximum bolus.
    DeliverClamped,
    /// Deliver nothing; report the clamped amount.
    Suppress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayModel {
    Linear,
    Exponential,
}

impl DecayModel {
    pub fn build(self) -> Arc<dyn InsulinDecay> {
        match self {
            DecayModel::Linear => Arc::new(LinearDecay),
            DecayModel::Exponential => Arc::new(ExponentialDecay::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PublishSettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub dose_increment_units: f64,
    pub over_limit_policy: OverLimitPolicy,
    pub iob_decay: DecayModel,
    pub queue_capacity: usize,
    pub bus_capacity: usize,
    pub emit_suppression_notes: bool,
    pub hyperglycemia_alert_after: u32,
    pub critical_high_mg_dl: f64,
    pub low_reservoir_units: f64,
    pub low_pump_battery_percent: f64,
    pub publish: PublishSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            dose_increment_units: 0.05,
            over_limit_policy: OverLimitPolicy::DeliverClamped,
            iob_decay: DecayModel::Exponential,
            queue_capacity: 64,
            bus_capacity: 1024,
            emit_suppression_notes: true,
            hyperglycemia_alert_after: 3,
            critical_high_mg_dl: 250.0,
            low_reservoir_units: 60.0,
            low_pump_battery_percent: 15.0,
            publish: PublishSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub patients: Vec<PatientProfile>,
    #[serde(default)]
    pub default_profile: Option<DefaultProfile>,
}

impl ControllerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let settings = &self.controller;

        if !(settings.dose_increment_units.is_finite() && settings.dose_increment_units > 0.0) {
            return Err(ConfigError::Invalid("dose_increment_units must be > 0".into()));
        }
        if settings.queue_capacity == 0 || settings.bus_capacity == 0 {
            return Err(ConfigError::Invalid("queue and bus capacities must be > 0".into()));
        }
        if settings.publish.max_attempts == 0 {
            return Err(ConfigError::Invalid("publish.max_attempts must be >= 1".into()));
        }
        if settings.publish.timeout_ms == 0 {
            return Err(ConfigError::Invalid("publish.timeout_ms must be > 0".into()));
        }
        if self.patients.is_empty() && self.default_profile.is_none() {
            return Err(ConfigError::Invalid(
                "at least one [[patients]] entry or a [default_profile] is required".into(),
            ));
        }

        let mut seen = HashSet::new();
        for profile in &self.patients {
            if !seen.insert(profile.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate patient id {}", profile.id)));
            }
            profile.validate()?;
        }

        if let Some(default) = &self.default_profile {
            default.for_patient("default").validate()?;
        }

        Ok(())
    }
}

fn default_low_battery_percent() -> f64 {
    20.0
}
