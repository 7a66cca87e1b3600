use crate::decision::{AlertCode, Severity};
use crate::telemetry::{GlucoseReading, PumpStatus};
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

pub const MAX_ALERT_HISTORY: usize = 16;

static_assertions::const_assert!(MAX_ALERT_HISTORY > 0);

/// Fraction of a bolus still active after `elapsed`, given the insulin action
/// duration. Must be 1.0 at zero, 0.0 from `action` on, and non-increasing.
pub trait InsulinDecay: Debug + Send + Sync {
    fn remaining_fraction(&self, elapsed: Duration, action: Duration) -> f64;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinearDecay;

impl InsulinDecay for LinearDecay {
    fn remaining_fraction(&self, elapsed: Duration, action: Duration) -> f64 {
        if action.is_zero() || elapsed >= action {
            return 0.0;
        }
        1.0 - elapsed.as_secs_f64() / action.as_secs_f64()
    }

    fn name(&self) -> &'static str {
        "linear"
    }
}

/// Exponential curve rescaled so it reaches exactly zero at the end of the
/// action window.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialDecay {
    pub steepness: f64,
}

impl Default for ExponentialDecay {
    fn default() -> Self {
        Self { steepness: 5.0 }
    }
}

impl InsulinDecay for ExponentialDecay {
    fn remaining_fraction(&self, elapsed: Duration, action: Duration) -> f64 {
        if action.is_zero() || elapsed >= action {
            return 0.0;
        }
        let floor = (-self.steepness).exp();
        let x = elapsed.as_secs_f64() / action.as_secs_f64();
        (((-self.steepness * x).exp() - floor) / (1.0 - floor)).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "exponential"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BolusRecord {
    pub units: f64,
    pub delivered_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub code: AlertCode,
    pub severity: Severity,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackChange {
    AlarmRaised,
    AlarmCleared,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpSnapshot {
    pub reservoir_units: f64,
    pub battery_percent: f64,
    pub reported_at: u64,
}

/// Per-patient physiological and safety state.
///
/// Owned by exactly one patient worker. `insulin_on_board` only rises through
/// [`PatientSafetyState::apply_bolus`].
#[derive(Debug)]
pub struct PatientSafetyState {
    patient_id: String,
    insulin_on_board: f64,
    last_correction_at: Option<u64>,
    pump_alarm_active: bool,
    consecutive_high_readings: u32,
    consecutive_low_readings: u32,
    last_reading_at: Option<u64>,
    last_feedback_at: Option<u64>,
    decayed_at: Option<u64>,
    active_boluses: alloc::vec::Vec<BolusRecord>,
    pump: Option<PumpSnapshot>,
    alert_history: Vec<AlertRecord, MAX_ALERT_HISTORY>,
}

/// Copy of a patient's state for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySnapshot {
    pub patient_id: String,
    pub insulin_on_board: f64,
    pub last_correction_at: Option<u64>,
    pub pump_alarm_active: bool,
    pub consecutive_high_readings: u32,
    pub consecutive_low_readings: u32,
    pub last_reading_at: Option<u64>,
    pub active_boluses: alloc::vec::Vec<BolusRecord>,
    pub pump: Option<PumpSnapshot>,
    pub recent_alerts: alloc::vec::Vec<AlertRecord>,
}

impl PatientSafetyState {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            insulin_on_board: 0.0,
            last_correction_at: None,
            pump_alarm_active: false,
            consecutive_high_readings: 0,
            consecutive_low_readings: 0,
            last_reading_at: None,
            last_feedback_at: None,
            decayed_at: None,
            active_boluses: alloc::vec::Vec::new(),
            pump: None,
            alert_history: Vec::new(),
        }
    }

    /// Recomputes insulin-on-board at `now` and forgets fully absorbed boluses.
    ///
    /// A `now` earlier than a previous decay is treated as that earlier
    /// instant, so the value never climbs back up.
    pub fn decay_iob(&mut self, now: u64, model: &dyn InsulinDecay, action: Duration) -> f64 {
        let now = self.decayed_at.map_or(now, |t| t.max(now));

        self.active_boluses.retain(|b| {
            let elapsed = Duration::from_millis(now.saturating_sub(b.delivered_at));
            model.remaining_fraction(elapsed, action) > 0.0
        });

        let iob: f64 = self
            .active_boluses
            .iter()
            .map(|b| {
                let elapsed = Duration::from_millis(now.saturating_sub(b.delivered_at));
                b.units * model.remaining_fraction(elapsed, action)
            })
            .sum();

        // Never above the previous value between commits.
        self.insulin_on_board = iob.max(0.0).min(self.insulin_on_board);
        self.decayed_at = Some(now);
        self.insulin_on_board
    }

    /// Commits a validated bolus. Performs no checks of its own.
    pub fn apply_bolus(&mut self, units: f64, now: u64) {
        self.active_boluses.push(BolusRecord { units, delivered_at: now });
        self.insulin_on_board += units;
        self.last_correction_at = Some(now);
        self.decayed_at = Some(self.decayed_at.map_or(now, |t| t.max(now)));
    }

    /// Updates alarm state from a pump report. A report without an alarm does
    /// not clear an active one; only an explicit clear does.
    pub fn apply_pump_feedback(&mut self, status: &PumpStatus) -> FeedbackChange {
        self.last_feedback_at = Some(status.timestamp);
        self.pump = Some(PumpSnapshot {
            reservoir_units: status.reservoir_units,
            battery_percent: status.battery_percent,
            reported_at: status.timestamp,
        });

        if status.alarm_cleared() {
            if self.pump_alarm_active {
                self.pump_alarm_active = false;
                return FeedbackChange::AlarmCleared;
            }
        } else if status.alarm_raised() && !self.pump_alarm_active {
            self.pump_alarm_active = true;
            return FeedbackChange::AlarmRaised;
        }

        FeedbackChange::Unchanged
    }

    /// Advances the hysteresis counters and the last-seen reading time.
    pub fn record_reading(&mut self, reading: &GlucoseReading, low: f64, high: f64) {
        self.last_reading_at = Some(reading.timestamp);

        if reading.value_mg_dl > high {
            self.consecutive_high_readings = self.consecutive_high_readings.saturating_add(1);
            self.consecutive_low_readings = 0;
        } else if reading.value_mg_dl < low {
            self.consecutive_low_readings = self.consecutive_low_readings.saturating_add(1);
            self.consecutive_high_readings = 0;
        } else {
            self.consecutive_high_readings = 0;
            self.consecutive_low_readings = 0;
        }
    }

    pub fn record_alert(&mut self, code: AlertCode, severity: Severity, timestamp: u64) {
        if self.alert_history.is_full() {
            self.alert_history.remove(0);
        }
        let _ = self.alert_history.push(AlertRecord { code, severity, timestamp });
    }

    /// True when a reading at `timestamp` is older than, or a duplicate of,
    /// the last processed one.
    pub fn is_stale_reading(&self, timestamp: u64) -> bool {
        self.last_reading_at.is_some_and(|last| timestamp <= last)
    }

    pub fn is_stale_feedback(&self, timestamp: u64) -> bool {
        self.last_feedback_at.is_some_and(|last| timestamp < last)
    }

    pub fn correction_interval_elapsed(&self, now: u64, min_interval: Duration) -> bool {
        self.last_correction_at.map_or(true, |last| {
            Duration::from_millis(now.saturating_sub(last)) >= min_interval
        })
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn insulin_on_board(&self) -> f64 {
        self.insulin_on_board
    }

    pub fn last_correction_at(&self) -> Option<u64> {
        self.last_correction_at
    }

    pub fn pump_alarm_active(&self) -> bool {
        self.pump_alarm_active
    }

    pub fn consecutive_high_readings(&self) -> u32 {
        self.consecutive_high_readings
    }

    pub fn consecutive_low_readings(&self) -> u32 {
        self.consecutive_low_readings
    }

    pub fn last_reading_at(&self) -> Option<u64> {
        self.last_reading_at
    }

    pub fn pump(&self) -> Option<&PumpSnapshot> {
        self.pump.as_ref()
    }

    pub fn alert_history(&self) -> &[AlertRecord] {
        &self.alert_history
    }

    pub fn snapshot(&self) -> SafetySnapshot {
        SafetySnapshot {
            patient_id: self.patient_id.clone(),
            insulin_on_board: self.insulin_on_board,
            last_correction_at: self.last_correction_at,
            pump_alarm_active: self.pump_alarm_active,
            consecutive_high_readings: self.consecutive_high_readings,
            consecutive_low_readings: self.consecutive_low_readings,
            last_reading_at: self.last_reading_at,
            active_boluses: self.active_boluses.clone(),
            pump: self.pump,
            recent_alerts: self.alert_history.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_decay_models_bounds() {
        let models: [&dyn InsulinDecay; 2] = [&LinearDecay, &ExponentialDecay::default()];
        for model in models {
            assert!((model.remaining_fraction(Duration::ZERO, HOUR) - 1.0).abs() < 1e-12);
            assert_eq!(model.remaining_fraction(HOUR, HOUR), 0.0);
            assert_eq!(model.remaining_fraction(HOUR * 2, HOUR), 0.0);

            let mut previous = 1.0;
            for minutes in (0..=60).step_by(5) {
                let f = model.remaining_fraction(Duration::from_secs(minutes * 60), HOUR);
                assert!(f <= previous + 1e-12, "{} not monotonic", model.name());
                previous = f;
            }
        }
    }

    #[test]
    fn test_linear_halfway() {
        let f = LinearDecay.remaining_fraction(HOUR / 2, HOUR);
        assert!((f - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_alert_history_evicts_oldest() {
        let mut state = PatientSafetyState::new("p1");
        for i in 0..(MAX_ALERT_HISTORY as u64 + 4) {
            state.record_alert(AlertCode::Hypoglycemia, Severity::Critical, i);
        }
        assert_eq!(state.alert_history().len(), MAX_ALERT_HISTORY);
        assert_eq!(state.alert_history()[0].timestamp, 4);
    }
}
