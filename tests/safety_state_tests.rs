use glucoloop::safety::{ExponentialDecay, FeedbackChange, InsulinDecay, LinearDecay, MAX_ALERT_HISTORY};
use glucoloop::telemetry::PumpState;
use glucoloop::*;
use std::time::Duration;

const T0: u64 = 1_700_000_000_000;
const ACTION: Duration = Duration::from_secs(4 * 3600);

fn pump(state: PumpState, alarm: bool, timestamp: u64) -> PumpStatus {
    PumpStatus {
        patient_id: "p1".to_string(),
        state,
        alarm,
        reservoir_units: 150.0,
        battery_percent: 90.0,
        timestamp,
    }
}

#[test]
fn test_new_state_is_clean() {
    let state = PatientSafetyState::new("p1");

    assert_eq!(state.patient_id(), "p1");
    assert_eq!(state.insulin_on_board(), 0.0);
    assert_eq!(state.last_correction_at(), None);
    assert!(!state.pump_alarm_active());
    assert_eq!(state.consecutive_high_readings(), 0);
    assert_eq!(state.consecutive_low_readings(), 0);
    assert!(state.alert_history().is_empty());
}

#[test]
fn test_bolus_raises_iob_by_exactly_its_units() {
    let mut state = PatientSafetyState::new("p1");
    state.apply_bolus(1.5, T0);
    assert!((state.insulin_on_board() - 1.5).abs() < 1e-12);

    state.apply_bolus(0.75, T0 + 1_000);
    assert!((state.insulin_on_board() - 2.25).abs() < 1e-12);
    assert_eq!(state.last_correction_at(), Some(T0 + 1_000));
}

#[test]
fn test_iob_decays_monotonically_to_zero() {
    let models: [&dyn InsulinDecay; 2] = [&LinearDecay, &ExponentialDecay::default()];

    for model in models {
        let mut state = PatientSafetyState::new("p1");
        state.apply_bolus(4.0, T0);

        let mut previous = state.insulin_on_board();
        for minutes in (0..=240).step_by(15) {
            let iob = state.decay_iob(T0 + minutes * 60_000, model, ACTION);
            assert!(iob <= previous + 1e-12, "{} increased at {minutes} min", model.name());
            assert!(iob >= 0.0);
            previous = iob;
        }

        assert_eq!(state.insulin_on_board(), 0.0, "{} left insulin after the action window", model.name());
        assert!(state.snapshot().active_boluses.is_empty());
    }
}

#[test]
fn test_linear_decay_halfway() {
    let mut state = PatientSafetyState::new("p1");
    state.apply_bolus(2.0, T0);

    let iob = state.decay_iob(T0 + 2 * 3_600_000, &LinearDecay, ACTION);
    assert!((iob - 1.0).abs() < 1e-9);
}

#[test]
fn test_decay_never_moves_backwards_in_time() {
    let mut state = PatientSafetyState::new("p1");
    state.apply_bolus(2.0, T0);

    let later = state.decay_iob(T0 + 3_600_000, &LinearDecay, ACTION);
    let earlier = state.decay_iob(T0 + 60_000, &LinearDecay, ACTION);
    assert!((earlier - later).abs() < 1e-12);
}

#[test]
fn test_pump_alarm_sets_and_only_explicit_clear_resets() {
    let mut state = PatientSafetyState::new("p1");

    assert_eq!(
        state.apply_pump_feedback(&pump(PumpState::Active, true, T0)),
        FeedbackChange::AlarmRaised
    );
    assert!(state.pump_alarm_active());

    assert_eq!(
        state.apply_pump_feedback(&pump(PumpState::Alarm, false, T0 + 1)),
        FeedbackChange::Unchanged
    );

    // A healthy report does not clear the alarm.
    assert_eq!(
        state.apply_pump_feedback(&pump(PumpState::Active, false, T0 + 2)),
        FeedbackChange::Unchanged
    );
    assert!(state.pump_alarm_active());

    assert_eq!(
        state.apply_pump_feedback(&pump(PumpState::AlarmCleared, false, T0 + 3)),
        FeedbackChange::AlarmCleared
    );
    assert!(!state.pump_alarm_active());

    assert_eq!(
        state.apply_pump_feedback(&pump(PumpState::AlarmCleared, false, T0 + 4)),
        FeedbackChange::Unchanged
    );
}

#[test]
fn test_feedback_keeps_latest_pump_snapshot() {
    let mut state = PatientSafetyState::new("p1");
    let mut status = pump(PumpState::Active, false, T0);
    status.reservoir_units = 42.0;
    state.apply_pump_feedback(&status);

    let snapshot = state.pump().copied().unwrap();
    assert_eq!(snapshot.reservoir_units, 42.0);
    assert_eq!(snapshot.reported_at, T0);

    assert!(state.is_stale_feedback(T0 - 1));
    assert!(!state.is_stale_feedback(T0));
}

#[test]
fn test_reading_counters() {
    let mut state = PatientSafetyState::new("p1");
    let reading = |value: f64, timestamp: u64| GlucoseReading {
        patient_id: "p1".to_string(),
        value_mg_dl: value,
        trend: Trend::Stable,
        timestamp,
        battery_percent: 80.0,
    };

    state.record_reading(&reading(250.0, T0), 70.0, 180.0);
    state.record_reading(&reading(260.0, T0 + 1), 70.0, 180.0);
    assert_eq!(state.consecutive_high_readings(), 2);

    state.record_reading(&reading(60.0, T0 + 2), 70.0, 180.0);
    assert_eq!(state.consecutive_high_readings(), 0);
    assert_eq!(state.consecutive_low_readings(), 1);

    state.record_reading(&reading(110.0, T0 + 3), 70.0, 180.0);
    assert_eq!(state.consecutive_low_readings(), 0);

    assert_eq!(state.last_reading_at(), Some(T0 + 3));
    assert!(state.is_stale_reading(T0 + 3));
    assert!(state.is_stale_reading(T0));
    assert!(!state.is_stale_reading(T0 + 4));
}

#[test]
fn test_correction_interval() {
    let mut state = PatientSafetyState::new("p1");
    let interval = Duration::from_secs(60);
    assert!(state.correction_interval_elapsed(T0, interval));

    state.apply_bolus(1.0, T0);
    assert!(!state.correction_interval_elapsed(T0 + 59_999, interval));
    assert!(state.correction_interval_elapsed(T0 + 60_000, interval));
}

#[test]
fn test_alert_history_is_bounded() {
    let mut state = PatientSafetyState::new("p1");
    for i in 0..40 {
        state.record_alert(AlertCode::LowSensorBattery, Severity::Warning, T0 + i);
    }

    let snapshot = state.snapshot();
    assert_eq!(snapshot.recent_alerts.len(), MAX_ALERT_HISTORY);
    assert_eq!(snapshot.recent_alerts.last().unwrap().timestamp, T0 + 39);
}
