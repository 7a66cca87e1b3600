//! Dose decision engine.
//!
//! [`decide`] is a pure function of the reading, the patient's (already
//! decayed) safety state and profile. It never mutates anything; the
//! controller commits the outcome afterwards and re-checks it with
//! [`validate_commit`] against the state it is about to mutate.

use crate::error::SafetyViolation;
use crate::profile::{ControllerSettings, OverLimitPolicy, PatientProfile};
use crate::safety::PatientSafetyState;
use crate::telemetry::{GlucoseReading, Trend};
use serde::{Deserialize, Serialize};

/// Tolerance for float noise when converting doses to pump increments.
const STEP_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCode {
    PumpAlarm,
    PumpAlarmCleared,
    Hypoglycemia,
    Hyperglycemia,
    LowSensorBattery,
    CorrectionSuppressed,
    LowReservoir,
    ReservoirEmpty,
    LowPumpBattery,
}

impl AlertCode {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertCode::PumpAlarm => "pump_alarm",
            AlertCode::PumpAlarmCleared => "pump_alarm_cleared",
            AlertCode::Hypoglycemia => "hypoglycemia",
            AlertCode::Hyperglycemia => "hyperglycemia",
            AlertCode::LowSensorBattery => "low_sensor_battery",
            AlertCode::CorrectionSuppressed => "correction_suppressed",
            AlertCode::LowReservoir => "low_reservoir",
            AlertCode::ReservoirEmpty => "reservoir_empty",
            AlertCode::LowPumpBattery => "low_pump_battery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub code: AlertCode,
    pub message: String,
}

impl Alert {
    pub fn new(severity: Severity, code: AlertCode, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    MinimumIntervalNotElapsed,
    ExceedsMaxBolus,
    PumpAlarmRaised,
}

impl SuppressionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SuppressionReason::MinimumIntervalNotElapsed => "minimum interval not elapsed",
            SuppressionReason::ExceedsMaxBolus => "exceeds max bolus",
            SuppressionReason::PumpAlarmRaised => "pump alarm raised before commit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DoseDecision {
    NoAction,
    Bolus { units: f64 },
    /// `units` carries the clamped amount when the reason is an over-limit
    /// correction.
    SuppressedBolus {
        reason: SuppressionReason,
        units: Option<f64>,
    },
    Alert(Alert),
}

impl DoseDecision {
    pub fn is_bolus(&self) -> bool {
        matches!(self, DoseDecision::Bolus { .. })
    }
}

/// One decision per reading plus any non-exclusive advisories (low sensor
/// battery, persistent hyperglycemia). Advisories never carry insulin.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub decision: DoseDecision,
    pub advisories: alloc::vec::Vec<Alert>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    pub over_limit: OverLimitPolicy,
    pub dose_increment_units: f64,
    /// Consecutive high readings before a persistent-high advisory. Zero
    /// disables it.
    pub hyperglycemia_alert_after: u32,
    pub critical_high_mg_dl: f64,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::from(&ControllerSettings::default())
    }
}

impl From<&ControllerSettings> for DecisionPolicy {
    fn from(settings: &ControllerSettings) -> Self {
        Self {
            over_limit: settings.over_limit_policy,
            dose_increment_units: settings.dose_increment_units,
            hyperglycemia_alert_after: settings.hyperglycemia_alert_after,
            critical_high_mg_dl: settings.critical_high_mg_dl,
        }
    }
}

/// Outcome of re-checking a bolus against the current state right before it
/// is committed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommitCheck {
    Proceed,
    Suppress(SuppressionReason),
}

/// Decides what to do with one reading. `state` must already be decayed to
/// the reading's timestamp.
pub fn decide(
    reading: &GlucoseReading,
    state: &PatientSafetyState,
    profile: &PatientProfile,
    policy: &DecisionPolicy,
) -> Assessment {
    let mut advisories = advisories(reading, state, profile, policy);

    if state.pump_alarm_active() {
        // The alarm owns the decision; a low reading still has to reach the patient.
        if reading.value_mg_dl < profile.target_low_mg_dl {
            advisories.insert(0, hypoglycemia_alert(reading.value_mg_dl));
        }
        return Assessment {
            decision: DoseDecision::Alert(Alert::new(
                Severity::Critical,
                AlertCode::PumpAlarm,
                "pump alarm active, correction suppressed",
            )),
            advisories,
        };
    }

    let value = reading.value_mg_dl;

    let decision = if value < profile.target_low_mg_dl {
        // Never insulin here, whatever the IOB or interval.
        DoseDecision::Alert(hypoglycemia_alert(value))
    } else if value > profile.target_high_mg_dl {
        if !state.correction_interval_elapsed(reading.timestamp, profile.min_correction_interval()) {
            DoseDecision::SuppressedBolus {
                reason: SuppressionReason::MinimumIntervalNotElapsed,
                units: None,
            }
        } else if reading.trend == Trend::FallingFast {
            DoseDecision::NoAction
        } else {
            correction_decision(value, profile, policy)
        }
    } else {
        DoseDecision::NoAction
    };

    Assessment { decision, advisories }
}

fn correction_decision(value: f64, profile: &PatientProfile, policy: &DecisionPolicy) -> DoseDecision {
    let increment = policy.dose_increment_units;
    let raw = (value - profile.target_high_mg_dl) / profile.insulin_sensitivity_factor;

    let steps = increment_steps(raw, increment);
    let max_steps = max_increment_steps(profile.max_bolus_units, increment);

    if steps == 0 {
        return DoseDecision::NoAction;
    }

    if steps <= max_steps {
        return DoseDecision::Bolus { units: units_from_steps(steps, increment) };
    }

    let clamped = units_from_steps(max_steps, increment);
    match policy.over_limit {
        OverLimitPolicy::DeliverClamped if max_steps > 0 => DoseDecision::Bolus { units: clamped },
        _ => DoseDecision::SuppressedBolus {
            reason: SuppressionReason::ExceedsMaxBolus,
            units: Some(clamped),
        },
    }
}

fn hypoglycemia_alert(value: f64) -> Alert {
    Alert::new(
        Severity::Critical,
        AlertCode::Hypoglycemia,
        format!("hypoglycemia: {value:.1} mg/dL"),
    )
}

fn advisories(
    reading: &GlucoseReading,
    state: &PatientSafetyState,
    profile: &PatientProfile,
    policy: &DecisionPolicy,
) -> alloc::vec::Vec<Alert> {
    let mut advisories = alloc::vec::Vec::new();

    if reading.battery_percent < profile.low_battery_percent {
        advisories.push(Alert::new(
            Severity::Warning,
            AlertCode::LowSensorBattery,
            format!("sensor battery low: {:.0}%", reading.battery_percent),
        ));
    }

    let high_streak = state.consecutive_high_readings().saturating_add(1);
    if policy.hyperglycemia_alert_after > 0
        && reading.value_mg_dl > profile.target_high_mg_dl
        && high_streak >= policy.hyperglycemia_alert_after
    {
        let severity = if reading.value_mg_dl > policy.critical_high_mg_dl {
            Severity::Critical
        } else {
            Severity::Warning
        };
        advisories.push(Alert::new(
            severity,
            AlertCode::Hyperglycemia,
            format!(
                "hyperglycemia: {:.1} mg/dL for {high_streak} consecutive readings",
                reading.value_mg_dl
            ),
        ));
    }

    advisories
}

/// Re-checks a bolus right before commit. Anything the engine should have
/// clamped is a [`SafetyViolation`]; state that changed since the decision
/// (an alarm, a correction) turns the bolus into a suppression.
pub fn validate_commit(
    units: f64,
    now: u64,
    state: &PatientSafetyState,
    profile: &PatientProfile,
) -> Result<CommitCheck, SafetyViolation> {
    let violation = |reason: String| SafetyViolation {
        patient: state.patient_id().to_owned(),
        reason,
    };

    if !units.is_finite() || units <= 0.0 {
        return Err(violation(format!("non-positive bolus {units}")));
    }
    if units > profile.max_bolus_units + STEP_EPSILON {
        return Err(violation(format!(
            "bolus {units} U exceeds max {} U",
            profile.max_bolus_units
        )));
    }

    if state.pump_alarm_active() {
        return Ok(CommitCheck::Suppress(SuppressionReason::PumpAlarmRaised));
    }
    if !state.correction_interval_elapsed(now, profile.min_correction_interval()) {
        return Ok(CommitCheck::Suppress(SuppressionReason::MinimumIntervalNotElapsed));
    }

    Ok(CommitCheck::Proceed)
}

/// Rounds `units` half-up to the pump's deliverable increment.
pub fn round_to_increment(units: f64, increment: f64) -> f64 {
    units_from_steps(increment_steps(units, increment), increment)
}

fn increment_steps(units: f64, increment: f64) -> u64 {
    if !(units.is_finite() && units > 0.0) {
        return 0;
    }
    (units / increment + 0.5 + STEP_EPSILON).floor() as u64
}

/// Largest whole number of increments not above `max_units`.
fn max_increment_steps(max_units: f64, increment: f64) -> u64 {
    if !(max_units.is_finite() && max_units > 0.0) {
        return 0;
    }
    (max_units / increment + STEP_EPSILON).floor() as u64
}

#[allow(clippy::cast_precision_loss)]
fn units_from_steps(steps: u64, increment: f64) -> f64 {
    steps as f64 * increment
}
