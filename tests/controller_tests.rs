use glucoloop::controller::{ControllerStats, PatientPhase};
use glucoloop::profile::ControllerSettings;
use glucoloop::safety::FeedbackChange;
use glucoloop::senml::{SenmlPack, SenmlValue};
use glucoloop::telemetry::PumpState;
use glucoloop::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};

const T0: u64 = 1_700_000_000_000;

const CONFIG: &str = r#"
[controller]
hyperglycemia_alert_after = 3

[[patients]]
id = "patient001"
insulin_sensitivity_factor = 50.0
target_low_mg_dl = 70.0
target_high_mg_dl = 180.0
max_bolus_units = 6.0
min_correction_interval_s = 60
insulin_action_duration_s = 14400
"#;

const DEFAULT_PROFILE: &str = r#"
[default_profile]
insulin_sensitivity_factor = 40.0
target_low_mg_dl = 70.0
target_high_mg_dl = 180.0
max_bolus_units = 4.0
min_correction_interval_s = 300
insulin_action_duration_s = 14400
"#;

#[derive(Debug, Clone, Default)]
struct RecordingPublisher {
    sent: Arc<Mutex<Vec<BusMessage>>>,
    stalled: Option<(&'static str, Arc<Semaphore>)>,
}

impl RecordingPublisher {
    /// Holds every publish for `patient` until `gate` is closed.
    fn stalling(patient: &'static str, gate: Arc<Semaphore>) -> Self {
        Self {
            stalled: Some((patient, gate)),
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<BusMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn on(&self, kind: TopicKind) -> Vec<BusMessage> {
        self.sent()
            .into_iter()
            .filter(|m| TopicKind::parse(&m.topic).map(|(_, k)| k) == Some(kind))
            .collect()
    }
}

impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        if let Some((patient, gate)) = &self.stalled {
            if TopicKind::parse(topic).is_some_and(|(p, _)| p == *patient) {
                let _ = gate.acquire().await;
            }
        }
        self.sent.lock().unwrap().push(BusMessage::new(topic, payload));
        Ok(())
    }
}

fn profile() -> PatientProfile {
    ControllerConfig::from_toml_str(CONFIG).unwrap().patients.remove(0)
}

fn worker() -> (PatientWorker<RecordingPublisher>, RecordingPublisher, Arc<ControllerStats>) {
    let settings = ControllerSettings::default();
    let publisher = RecordingPublisher::default();
    let stats = Arc::new(ControllerStats::default());
    let emitter = Arc::new(CommandEmitter::new(
        publisher.clone(),
        settings.publish.clone(),
        settings.emit_suppression_notes,
    ));

    let worker = PatientWorker::new(
        Arc::new(profile()),
        Arc::new(settings.clone()),
        settings.iob_decay.build(),
        emitter,
        Arc::clone(&stats),
    );
    (worker, publisher, stats)
}

fn reading(patient: &str, value: f64, timestamp: u64) -> GlucoseReading {
    GlucoseReading {
        patient_id: patient.to_string(),
        value_mg_dl: value,
        trend: Trend::Stable,
        timestamp,
        battery_percent: 80.0,
    }
}

fn pump(state: PumpState, reservoir: f64, timestamp: u64) -> PumpStatus {
    PumpStatus {
        patient_id: "patient001".to_string(),
        state,
        alarm: false,
        reservoir_units: reservoir,
        battery_percent: 90.0,
        timestamp,
    }
}

fn reading_message(patient: &str, value: f64, timestamp: u64) -> BusMessage {
    let payload = reading(patient, value, timestamp).to_senml().to_json().unwrap();
    BusMessage::new(TopicKind::GlucoseReading.topic(patient), payload)
}

fn text_field(message: &BusMessage, name: &str) -> String {
    SenmlPack::parse(&message.payload)
        .unwrap()
        .resolve()
        .into_iter()
        .find(|r| r.name == name)
        .and_then(|r| match r.value {
            SenmlValue::Text(s) => Some(s),
            _ => None,
        })
        .unwrap()
}

fn committed_units(outcome: &Outcome) -> f64 {
    match outcome {
        Outcome::Committed { units } => *units,
        other => panic!("expected a committed bolus, got {other:?}"),
    }
}

#[tokio::test]
async fn test_correction_then_interval_suppression() {
    let (mut worker, publisher, stats) = worker();

    let first = worker.handle_reading(reading("patient001", 280.0, T0)).await.unwrap();
    assert!((committed_units(&first) - 2.0).abs() < 1e-9);
    assert!((worker.state().insulin_on_board() - 2.0).abs() < 1e-9);
    assert_eq!(worker.state().last_correction_at(), Some(T0));

    let second = worker
        .handle_reading(reading("patient001", 300.0, T0 + 10_000))
        .await
        .unwrap();
    assert_eq!(
        second,
        Outcome::Suppressed {
            decision: DoseDecision::SuppressedBolus {
                reason: SuppressionReason::MinimumIntervalNotElapsed,
                units: None,
            }
        }
    );
    assert_eq!(worker.state().last_correction_at(), Some(T0));
    assert_eq!(worker.phase(), PatientPhase::Idle);

    let commands = publisher.on(TopicKind::PumpCommand);
    assert_eq!(commands.len(), 1);
    assert_eq!(text_field(&commands[0], "command"), "bolus");

    let alerts = publisher.on(TopicKind::Alert);
    assert_eq!(alerts.len(), 1);
    assert_eq!(text_field(&alerts[0], "type"), "correction_suppressed");

    let stats = stats.snapshot();
    assert_eq!(stats.readings_processed, 2);
    assert_eq!(stats.boluses_committed, 1);
    assert_eq!(stats.suppressed, 1);
    assert!((stats.units_committed - 2.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_readings_are_processed_in_order() {
    let (mut worker, publisher, _) = worker();

    let high = worker.handle_reading(reading("patient001", 250.0, T0)).await.unwrap();
    assert!((committed_units(&high) - 1.4).abs() < 1e-9);

    let normal = worker
        .handle_reading(reading("patient001", 90.0, T0 + 300_000))
        .await
        .unwrap();
    assert_eq!(normal, Outcome::Suppressed { decision: DoseDecision::NoAction });

    assert_eq!(publisher.on(TopicKind::PumpCommand).len(), 1);
    assert!(publisher.on(TopicKind::Alert).is_empty());
    assert!(worker.state().insulin_on_board() <= 1.4 + 1e-9);
}

#[tokio::test]
async fn test_hypoglycemia_alerts_and_leaves_iob_alone() {
    let (mut worker, publisher, stats) = worker();
    worker.handle_reading(reading("patient001", 280.0, T0)).await.unwrap();
    let iob_before = worker.state().insulin_on_board();

    let outcome = worker
        .handle_reading(reading("patient001", 60.0, T0 + 1_800_000))
        .await
        .unwrap();

    match outcome {
        Outcome::Alerted { alert } => {
            assert_eq!(alert.code, AlertCode::Hypoglycemia);
            assert_eq!(alert.severity, Severity::Critical);
        }
        other => panic!("expected a hypoglycemia alert, got {other:?}"),
    }
    assert!(worker.state().insulin_on_board() <= iob_before);
    assert_eq!(worker.state().last_correction_at(), Some(T0));
    assert_eq!(publisher.on(TopicKind::PumpCommand).len(), 1);

    let alerts = publisher.on(TopicKind::Alert);
    assert_eq!(alerts.len(), 1);
    assert_eq!(text_field(&alerts[0], "severity"), "critical");
    assert_eq!(stats.snapshot().alerts_emitted, 1);
}

#[test]
fn test_unclamped_bolus_is_rejected_at_commit() {
    let (mut worker, publisher, stats) = worker();

    for units in [7.0, 0.0, f64::NAN] {
        let err = worker.commit_bolus(units, T0).unwrap_err();
        assert_eq!(err.patient, "patient001");
    }

    assert_eq!(worker.state().insulin_on_board(), 0.0);
    assert_eq!(worker.state().last_correction_at(), None);
    assert!(publisher.sent().is_empty());

    let stats = stats.snapshot();
    assert_eq!(stats.safety_violations, 3);
    assert_eq!(stats.boluses_committed, 0);
    assert_eq!(stats.units_committed, 0.0);

    let committed = worker.commit_bolus(6.0, T0).unwrap();
    assert!((committed_units(&committed) - 6.0).abs() < 1e-9);
    assert_eq!(worker.state().last_correction_at(), Some(T0));
}

#[tokio::test]
async fn test_stale_and_duplicate_readings_are_discarded() {
    let (mut worker, publisher, stats) = worker();
    worker.handle_reading(reading("patient001", 280.0, T0)).await.unwrap();

    let duplicate = worker.handle_reading(reading("patient001", 280.0, T0)).await.unwrap();
    let older = worker.handle_reading(reading("patient001", 300.0, T0 - 1)).await.unwrap();

    assert_eq!(duplicate, Outcome::Discarded);
    assert_eq!(older, Outcome::Discarded);
    assert_eq!(publisher.on(TopicKind::PumpCommand).len(), 1);
    assert_eq!(stats.snapshot().stale_readings, 2);
    assert_eq!(stats.snapshot().readings_processed, 1);
}

#[tokio::test]
async fn test_pump_alarm_suspends_corrections_until_cleared() {
    let (mut worker, publisher, _) = worker();

    let raised = worker.handle_pump_status(pump(PumpState::Alarm, 150.0, T0)).await.unwrap();
    assert_eq!(raised, Outcome::Feedback { change: FeedbackChange::AlarmRaised });

    let blocked = worker
        .handle_reading(reading("patient001", 300.0, T0 + 1_000))
        .await
        .unwrap();
    match blocked {
        Outcome::Alerted { alert } => assert_eq!(alert.code, AlertCode::PumpAlarm),
        other => panic!("expected a pump alarm alert, got {other:?}"),
    }

    let healthy = worker.handle_pump_status(pump(PumpState::Active, 150.0, T0 + 1_500)).await.unwrap();
    assert_eq!(healthy, Outcome::Feedback { change: FeedbackChange::Unchanged });
    assert!(worker.state().pump_alarm_active());

    let cleared = worker
        .handle_pump_status(pump(PumpState::AlarmCleared, 150.0, T0 + 2_000))
        .await
        .unwrap();
    assert_eq!(cleared, Outcome::Feedback { change: FeedbackChange::AlarmCleared });

    let resumed = worker
        .handle_reading(reading("patient001", 300.0, T0 + 3_000))
        .await
        .unwrap();
    assert!((committed_units(&resumed) - 2.4).abs() < 1e-9);

    let types: Vec<String> = publisher
        .on(TopicKind::Alert)
        .iter()
        .map(|m| text_field(m, "type"))
        .collect();
    assert_eq!(types, vec!["pump_alarm", "pump_alarm", "pump_alarm_cleared"]);
    assert_eq!(publisher.on(TopicKind::PumpCommand).len(), 1);
}

#[tokio::test]
async fn test_low_reading_during_pump_alarm_raises_both_alerts() {
    let (mut worker, publisher, stats) = worker();
    worker.handle_pump_status(pump(PumpState::Alarm, 150.0, T0)).await.unwrap();

    let outcome = worker
        .handle_reading(reading("patient001", 40.0, T0 + 1_000))
        .await
        .unwrap();
    match outcome {
        Outcome::Alerted { alert } => assert_eq!(alert.code, AlertCode::PumpAlarm),
        other => panic!("expected a pump alarm alert, got {other:?}"),
    }

    let alerts = publisher.on(TopicKind::Alert);
    let types: Vec<String> = alerts.iter().map(|m| text_field(m, "type")).collect();
    assert_eq!(types, vec!["pump_alarm", "pump_alarm", "hypoglycemia"]);
    assert_eq!(text_field(&alerts[2], "severity"), "critical");
    assert!(publisher.on(TopicKind::PumpCommand).is_empty());
    assert_eq!(stats.snapshot().alerts_emitted, 3);
}

#[tokio::test]
async fn test_reservoir_alerts_fire_on_transitions() {
    let (mut worker, publisher, _) = worker();

    worker.handle_pump_status(pump(PumpState::Active, 50.0, T0)).await.unwrap();
    worker.handle_pump_status(pump(PumpState::Active, 45.0, T0 + 1)).await.unwrap();
    worker.handle_pump_status(pump(PumpState::Active, 0.0, T0 + 2)).await.unwrap();
    worker.handle_pump_status(pump(PumpState::Active, 0.0, T0 + 3)).await.unwrap();

    let stale = worker.handle_pump_status(pump(PumpState::Active, 0.0, T0)).await.unwrap();
    assert_eq!(stale, Outcome::Discarded);

    let types: Vec<String> = publisher
        .on(TopicKind::Alert)
        .iter()
        .map(|m| text_field(m, "type"))
        .collect();
    assert_eq!(types, vec!["low_reservoir", "reservoir_empty"]);
    assert_eq!(worker.state().alert_history().len(), 2);
}

#[tokio::test]
async fn test_dispatch_routes_to_patient_worker() {
    let config = ControllerConfig::from_toml_str(CONFIG).unwrap();
    let mut controller = DoseController::new(config, RecordingPublisher::default());

    controller
        .dispatch(&reading_message("patient001", 280.0, T0))
        .unwrap();
    assert_eq!(controller.patient_count(), 1);

    let snapshot = controller.patient_snapshot("patient001").await.unwrap();
    assert!((snapshot.insulin_on_board - 2.0).abs() < 1e-9);
    assert_eq!(snapshot.last_correction_at, Some(T0));
    assert_eq!(controller.emitter().publisher().on(TopicKind::PumpCommand).len(), 1);

    assert!(controller.patient_snapshot("nobody").await.is_none());

    let stats = controller.shutdown().await;
    assert_eq!(stats.readings_processed, 1);
    assert_eq!(stats.boluses_committed, 1);
}

#[tokio::test]
async fn test_unknown_patient_is_dropped_without_default_profile() {
    let config = ControllerConfig::from_toml_str(CONFIG).unwrap();
    let mut controller = DoseController::new(config, RecordingPublisher::default());

    let err = controller
        .dispatch(&reading_message("stranger", 280.0, T0))
        .unwrap_err();

    assert!(matches!(err, ControllerError::UnknownPatient(ref id) if id == "stranger"));
    assert_eq!(controller.patient_count(), 0);
    assert_eq!(controller.stats().unknown_patients, 1);
    assert!(controller.emitter().publisher().sent().is_empty());
}

#[tokio::test]
async fn test_default_profile_covers_unknown_patients() {
    let config = ControllerConfig::from_toml_str(&format!("{CONFIG}{DEFAULT_PROFILE}")).unwrap();
    let mut controller = DoseController::new(config, RecordingPublisher::default());

    controller
        .dispatch(&reading_message("walk-in", 300.0, T0))
        .unwrap();

    let snapshot = controller.patient_snapshot("walk-in").await.unwrap();
    assert!((snapshot.insulin_on_board - 3.0).abs() < 1e-9);
    assert_eq!(controller.patient_count(), 1);
}

#[tokio::test]
async fn test_busy_patient_does_not_hold_up_others() {
    let text = format!("{CONFIG}{DEFAULT_PROFILE}").replace(
        "hyperglycemia_alert_after = 3",
        "hyperglycemia_alert_after = 3\nqueue_capacity = 1",
    );
    let config = ControllerConfig::from_toml_str(&text).unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let mut controller = DoseController::new(config, RecordingPublisher::stalling("patient001", Arc::clone(&gate)));

    controller.dispatch(&reading_message("patient001", 280.0, T0)).unwrap();
    let overflow = controller
        .dispatch(&reading_message("patient001", 300.0, T0 + 1_000))
        .unwrap_err();
    assert!(matches!(overflow, ControllerError::QueueFull(ref id) if id == "patient001"));

    controller.dispatch(&reading_message("walk-in", 300.0, T0)).unwrap();
    let snapshot = tokio::time::timeout(Duration::from_secs(1), controller.patient_snapshot("walk-in"))
        .await
        .unwrap()
        .unwrap();
    assert!((snapshot.insulin_on_board - 3.0).abs() < 1e-9);

    let commands = controller.emitter().publisher().on(TopicKind::PumpCommand);
    assert_eq!(commands.len(), 1);
    assert_eq!(
        TopicKind::parse(&commands[0].topic),
        Some(("walk-in", TopicKind::PumpCommand))
    );

    gate.close();
    let stats = controller.shutdown().await;
    assert_eq!(stats.queue_overflows, 1);
    assert_eq!(stats.boluses_committed, 2);
    assert_eq!(stats.readings_processed, 2);
}

#[tokio::test]
async fn test_undecodable_messages_are_counted() {
    let config = ControllerConfig::from_toml_str(CONFIG).unwrap();
    let mut controller = DoseController::new(config, RecordingPublisher::default());

    let garbage = BusMessage::new(TopicKind::GlucoseReading.topic("patient001"), "{oops");
    assert!(matches!(
        controller.dispatch(&garbage),
        Err(ControllerError::Decode(DecodeError::InvalidJson(_)))
    ));

    let mut mismatched = reading_message("patient001", 200.0, T0);
    mismatched.topic = TopicKind::GlucoseReading.topic("patient002");
    assert!(matches!(
        controller.dispatch(&mismatched),
        Err(ControllerError::Decode(DecodeError::PatientMismatch { .. }))
    ));

    assert_eq!(controller.stats().decode_errors, 2);
    assert_eq!(controller.patient_count(), 0);
}

#[tokio::test]
async fn test_outbound_and_foreign_topics_are_ignored() {
    let config = ControllerConfig::from_toml_str(CONFIG).unwrap();
    let mut controller = DoseController::new(config, RecordingPublisher::default());

    let command = BusMessage::new(TopicKind::PumpCommand.topic("patient001"), "[]");
    let alert = BusMessage::new(TopicKind::Alert.topic("patient001"), "[]");
    let foreign = BusMessage::new("/iot/weather/station1", "[]");

    for message in [command, alert, foreign] {
        controller.dispatch(&message).unwrap();
    }

    assert_eq!(controller.patient_count(), 0);
    assert_eq!(controller.stats(), StatsSnapshot::default());
}

#[tokio::test]
async fn test_controller_runs_over_the_bus_until_shutdown() {
    let config = ControllerConfig::from_toml_str(CONFIG).unwrap();
    let bus = MessageBus::new(64);
    let inbound = bus.subscribe();
    let mut observer = bus.subscribe();
    let controller = DoseController::new(config, BusPublisher::new(bus.clone()));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(controller.run_until(inbound, async move {
        let _ = stop_rx.await;
    }));

    bus.publish(reading_message("patient001", 280.0, T0)).unwrap();

    let command = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let message = observer.recv().await.unwrap();
            if TopicKind::parse(&message.topic) == Some(("patient001", TopicKind::PumpCommand)) {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(text_field(&command, "command"), "bolus");

    stop_tx.send(()).unwrap();
    let stats = handle.await.unwrap();
    assert_eq!(stats.boluses_committed, 1);
    assert_eq!(stats.readings_processed, 1);
}
