//! Closed-loop dose controller.
//!
//! The controller owns a registry of patients. Each patient gets one worker
//! task fed by a bounded queue, so that patient's readings and pump feedback
//! are handled strictly in arrival order while different patients run in
//! parallel. The worker exclusively owns the patient's [`PatientSafetyState`].

use crate::bus::{BusMessage, TopicKind};
use crate::decision::{
    decide, validate_commit, Alert, AlertCode, CommitCheck, DecisionPolicy, DoseDecision, Severity,
};
use crate::emitter::{CommandEmitter, EmissionPlan, Publisher};
use crate::error::{ControllerError, DecodeError, SafetyViolation};
use crate::profile::{ControllerConfig, ControllerSettings, DefaultProfile, PatientProfile};
use crate::safety::{FeedbackChange, InsulinDecay, PatientSafetyState, SafetySnapshot};
use crate::telemetry::{decode_pump_status, decode_reading, GlucoseReading, PumpStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatientPhase {
    Idle,
    Evaluating,
    Committing,
    Suppressed,
    Alerting,
}

/// What a worker did with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Committed { units: f64 },
    /// `NoAction` or a `SuppressedBolus`, including boluses turned down by
    /// the pre-commit re-check.
    Suppressed { decision: DoseDecision },
    Alerted { alert: Alert },
    /// Stale or duplicate; dropped without touching state.
    Discarded,
    Feedback { change: FeedbackChange },
}

#[derive(Debug)]
pub enum PatientEvent {
    Reading(GlucoseReading),
    PumpStatus(PumpStatus),
    Snapshot(oneshot::Sender<SafetySnapshot>),
}

#[derive(Debug, Default)]
pub struct ControllerStats {
    readings_processed: AtomicU64,
    decode_errors: AtomicU64,
    stale_readings: AtomicU64,
    unknown_patients: AtomicU64,
    boluses_committed: AtomicU64,
    milliunits_committed: AtomicU64,
    suppressed: AtomicU64,
    alerts_emitted: AtomicU64,
    publish_failures: AtomicU64,
    safety_violations: AtomicU64,
    bus_messages_dropped: AtomicU64,
    queue_overflows: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub readings_processed: u64,
    pub decode_errors: u64,
    pub stale_readings: u64,
    pub unknown_patients: u64,
    pub boluses_committed: u64,
    pub units_committed: f64,
    pub suppressed: u64,
    pub alerts_emitted: u64,
    pub publish_failures: u64,
    pub safety_violations: u64,
    pub bus_messages_dropped: u64,
    pub queue_overflows: u64,
}

impl ControllerStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            readings_processed: load(&self.readings_processed),
            decode_errors: load(&self.decode_errors),
            stale_readings: load(&self.stale_readings),
            unknown_patients: load(&self.unknown_patients),
            boluses_committed: load(&self.boluses_committed),
            units_committed: load(&self.milliunits_committed) as f64 / 1000.0,
            suppressed: load(&self.suppressed),
            alerts_emitted: load(&self.alerts_emitted),
            publish_failures: load(&self.publish_failures),
            safety_violations: load(&self.safety_violations),
            bus_messages_dropped: load(&self.bus_messages_dropped),
            queue_overflows: load(&self.queue_overflows),
        }
    }
}

/// Sequential processor for one patient.
pub struct PatientWorker<P> {
    profile: Arc<PatientProfile>,
    settings: Arc<ControllerSettings>,
    policy: DecisionPolicy,
    decay: Arc<dyn InsulinDecay>,
    emitter: Arc<CommandEmitter<P>>,
    stats: Arc<ControllerStats>,
    state: PatientSafetyState,
    phase: PatientPhase,
}

impl<P: Publisher> PatientWorker<P> {
    pub fn new(
        profile: Arc<PatientProfile>,
        settings: Arc<ControllerSettings>,
        decay: Arc<dyn InsulinDecay>,
        emitter: Arc<CommandEmitter<P>>,
        stats: Arc<ControllerStats>,
    ) -> Self {
        let policy = DecisionPolicy::from(settings.as_ref());
        let state = PatientSafetyState::new(profile.id.clone());
        Self {
            profile,
            settings,
            policy,
            decay,
            emitter,
            stats,
            state,
            phase: PatientPhase::Idle,
        }
    }

    pub fn state(&self) -> &PatientSafetyState {
        &self.state
    }

    pub fn phase(&self) -> PatientPhase {
        self.phase
    }

    pub async fn run(mut self, mut rx: mpsc::Receiver<PatientEvent>) {
        debug!(patient = %self.profile.id, "patient worker started");

        while let Some(event) = rx.recv().await {
            let result = match event {
                PatientEvent::Reading(reading) => self.handle_reading(reading).await,
                PatientEvent::PumpStatus(status) => self.handle_pump_status(status).await,
                PatientEvent::Snapshot(reply) => {
                    let _ = reply.send(self.state.snapshot());
                    continue;
                }
            };

            if let Err(e) = result {
                error!(patient = %self.profile.id, error = %e, "event handling failed");
            }
        }

        debug!(patient = %self.profile.id, "patient worker stopped");
    }

    /// Runs one reading through decay, decision, commit and emission. Always
    /// completes and leaves the worker `Idle`.
    pub async fn handle_reading(&mut self, reading: GlucoseReading) -> Result<Outcome, ControllerError> {
        let now = reading.timestamp;

        if self.state.is_stale_reading(now) {
            info!(
                patient = %self.profile.id,
                timestamp = now,
                last = ?self.state.last_reading_at(),
                "stale or duplicate reading discarded"
            );
            ControllerStats::incr(&self.stats.stale_readings);
            return Ok(Outcome::Discarded);
        }

        self.transition(PatientPhase::Evaluating);
        let iob = self
            .state
            .decay_iob(now, self.decay.as_ref(), self.profile.insulin_action_duration());

        let assessment = decide(&reading, &self.state, &self.profile, &self.policy);
        self.state
            .record_reading(&reading, self.profile.target_low_mg_dl, self.profile.target_high_mg_dl);
        ControllerStats::incr(&self.stats.readings_processed);

        debug!(
            patient = %self.profile.id,
            value = reading.value_mg_dl,
            trend = reading.trend.as_str(),
            iob,
            decision = ?assessment.decision,
            "reading evaluated"
        );

        let mut violation = None;
        let (decision, outcome) = match assessment.decision {
            DoseDecision::Bolus { units } => match self.commit_bolus(units, now) {
                Ok(Outcome::Committed { units }) => (DoseDecision::Bolus { units }, Outcome::Committed { units }),
                Ok(Outcome::Suppressed { decision }) => (decision.clone(), Outcome::Suppressed { decision }),
                Ok(other) => (DoseDecision::NoAction, other),
                Err(v) => {
                    violation = Some(v);
                    (DoseDecision::NoAction, Outcome::Suppressed { decision: DoseDecision::NoAction })
                }
            },
            DoseDecision::Alert(alert) => {
                self.transition(PatientPhase::Alerting);
                (DoseDecision::Alert(alert.clone()), Outcome::Alerted { alert })
            }
            decision => {
                self.transition(PatientPhase::Suppressed);
                if matches!(decision, DoseDecision::SuppressedBolus { .. }) {
                    ControllerStats::incr(&self.stats.suppressed);
                }
                (decision.clone(), Outcome::Suppressed { decision })
            }
        };

        let plan = self
            .emitter
            .plan(&self.profile.id, &decision, &assessment.advisories, now);
        self.emit(plan, now).await;

        self.transition(PatientPhase::Idle);

        match violation {
            Some(v) => Err(v.into()),
            None => Ok(outcome),
        }
    }

    /// Re-checks a bolus against the current state and applies it. Nothing is
    /// published here; a rejected dose leaves IOB and the correction clock
    /// untouched and is counted as a safety violation.
    pub fn commit_bolus(&mut self, units: f64, now: u64) -> Result<Outcome, SafetyViolation> {
        self.transition(PatientPhase::Committing);
        match validate_commit(units, now, &self.state, &self.profile) {
            Ok(CommitCheck::Proceed) => {
                self.state.apply_bolus(units, now);
                ControllerStats::incr(&self.stats.boluses_committed);
                self.stats
                    .milliunits_committed
                    .fetch_add((units * 1000.0).round() as u64, Ordering::Relaxed);
                info!(
                    patient = %self.profile.id,
                    units,
                    iob = self.state.insulin_on_board(),
                    "bolus committed"
                );
                Ok(Outcome::Committed { units })
            }
            Ok(CommitCheck::Suppress(reason)) => {
                self.transition(PatientPhase::Suppressed);
                ControllerStats::incr(&self.stats.suppressed);
                Ok(Outcome::Suppressed {
                    decision: DoseDecision::SuppressedBolus {
                        reason,
                        units: Some(units),
                    },
                })
            }
            Err(v) => {
                self.transition(PatientPhase::Suppressed);
                ControllerStats::incr(&self.stats.safety_violations);
                error!(patient = %self.profile.id, units, reason = %v.reason, "bolus rejected");
                Err(v)
            }
        }
    }

    /// Side transition: updates alarm and pump state without evaluating.
    pub async fn handle_pump_status(&mut self, status: PumpStatus) -> Result<Outcome, ControllerError> {
        let now = status.timestamp;

        if self.state.is_stale_feedback(now) {
            info!(patient = %self.profile.id, timestamp = now, "stale pump status discarded");
            return Ok(Outcome::Discarded);
        }

        let previous = self.state.pump().copied();
        let change = self.state.apply_pump_feedback(&status);

        let mut alerts = alloc::vec::Vec::new();
        match change {
            FeedbackChange::AlarmRaised => {
                warn!(patient = %self.profile.id, state = status.state.as_str(), "pump alarm raised");
                alerts.push(Alert::new(
                    Severity::Critical,
                    AlertCode::PumpAlarm,
                    format!("pump alarm ({}), corrections suspended", status.state.as_str()),
                ));
            }
            FeedbackChange::AlarmCleared => {
                info!(patient = %self.profile.id, "pump alarm cleared");
                alerts.push(Alert::new(
                    Severity::Info,
                    AlertCode::PumpAlarmCleared,
                    "pump alarm cleared, corrections resumed",
                ));
            }
            FeedbackChange::Unchanged => {}
        }

        let low_reservoir = self.settings.low_reservoir_units;
        let was_empty = previous.is_some_and(|p| p.reservoir_units <= 0.0);
        let was_low = previous.is_some_and(|p| p.reservoir_units < low_reservoir);

        if status.reservoir_units <= 0.0 {
            if !was_empty {
                alerts.push(Alert::new(
                    Severity::Critical,
                    AlertCode::ReservoirEmpty,
                    "insulin reservoir empty, refill immediately",
                ));
            }
        } else if status.reservoir_units < low_reservoir && !was_low {
            alerts.push(Alert::new(
                Severity::Warning,
                AlertCode::LowReservoir,
                format!("insulin reservoir low: {:.0} U remaining", status.reservoir_units),
            ));
        }

        let low_battery = self.settings.low_pump_battery_percent;
        let battery_was_low = previous.is_some_and(|p| p.battery_percent < low_battery);
        if status.battery_percent < low_battery && !battery_was_low {
            alerts.push(Alert::new(
                Severity::Warning,
                AlertCode::LowPumpBattery,
                format!("pump battery low: {:.0}%", status.battery_percent),
            ));
        }

        let plan = self
            .emitter
            .plan(&self.profile.id, &DoseDecision::NoAction, &alerts, now);
        self.emit(plan, now).await;

        Ok(Outcome::Feedback { change })
    }

    async fn emit(&mut self, plan: EmissionPlan, now: u64) {
        if plan.is_empty() {
            return;
        }

        for message in &plan.alerts {
            self.state
                .record_alert(message.alert.code, message.alert.severity, now);
            info!(
                patient = %self.profile.id,
                code = message.alert.code.as_str(),
                severity = message.alert.severity.as_str(),
                text = %message.alert.message,
                "alert"
            );
        }
        self.stats
            .alerts_emitted
            .fetch_add(plan.alerts.len() as u64, Ordering::Relaxed);

        if let Err(e) = self.emitter.emit(&plan).await {
            ControllerStats::incr(&self.stats.publish_failures);
            error!(patient = %self.profile.id, error = %e, "emission failed");
        }
    }

    fn transition(&mut self, to: PatientPhase) {
        if self.phase != to {
            debug!(patient = %self.profile.id, from = ?self.phase, to = ?to, "phase");
            self.phase = to;
        }
    }
}

struct PatientHandle {
    tx: mpsc::Sender<PatientEvent>,
    task: JoinHandle<()>,
}

/// Routes bus traffic to per-patient workers, creating each worker the first
/// time its patient shows up.
pub struct DoseController<P> {
    settings: Arc<ControllerSettings>,
    profiles: HashMap<String, Arc<PatientProfile>>,
    default_profile: Option<DefaultProfile>,
    decay: Arc<dyn InsulinDecay>,
    emitter: Arc<CommandEmitter<P>>,
    stats: Arc<ControllerStats>,
    patients: HashMap<String, PatientHandle>,
}

impl<P: Publisher> DoseController<P> {
    pub fn new(config: ControllerConfig, publisher: P) -> Self {
        let settings = Arc::new(config.controller);
        let emitter = Arc::new(CommandEmitter::new(
            publisher,
            settings.publish.clone(),
            settings.emit_suppression_notes,
        ));
        let profiles = config
            .patients
            .into_iter()
            .map(|p| (p.id.clone(), Arc::new(p)))
            .collect();

        Self {
            decay: settings.iob_decay.build(),
            settings,
            profiles,
            default_profile: config.default_profile,
            emitter,
            stats: Arc::new(ControllerStats::default()),
            patients: HashMap::new(),
        }
    }

    /// Replaces the configured insulin decay model for workers created after
    /// this call.
    #[must_use]
    pub fn with_decay(mut self, decay: Arc<dyn InsulinDecay>) -> Self {
        self.decay = decay;
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn emitter(&self) -> &CommandEmitter<P> {
        &self.emitter
    }

    pub fn patient_count(&self) -> usize {
        self.patients.len()
    }

    /// Decodes one bus message and queues it on its patient's worker.
    /// Outbound and unrelated topics are ignored. Never waits on a busy
    /// worker: a full queue drops the message so other patients keep flowing.
    pub fn dispatch(&mut self, message: &BusMessage) -> Result<(), ControllerError> {
        let Some((topic_patient, kind)) = TopicKind::parse(&message.topic) else {
            return Ok(());
        };

        let decoded = match kind {
            TopicKind::GlucoseReading => decode_reading(&message.payload).map(PatientEvent::Reading),
            TopicKind::PumpStatus => decode_pump_status(&message.payload).map(PatientEvent::PumpStatus),
            TopicKind::PumpCommand | TopicKind::Alert => return Ok(()),
        };

        let event = decoded.and_then(|event| {
            let payload_patient = match &event {
                PatientEvent::Reading(r) => r.patient_id.as_str(),
                PatientEvent::PumpStatus(s) => s.patient_id.as_str(),
                PatientEvent::Snapshot(_) => topic_patient,
            };
            if payload_patient == topic_patient {
                Ok(event)
            } else {
                Err(DecodeError::PatientMismatch {
                    topic: topic_patient.to_owned(),
                    payload: payload_patient.to_owned(),
                })
            }
        });

        let event = match event {
            Ok(event) => event,
            Err(e) => {
                ControllerStats::incr(&self.stats.decode_errors);
                warn!(topic = %message.topic, error = %e, "dropping undecodable message");
                return Err(e.into());
            }
        };

        let patient = topic_patient.to_owned();
        let tx = self.worker_for(&patient)?;
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                ControllerStats::incr(&self.stats.queue_overflows);
                warn!(patient = %patient, "patient queue full, message dropped");
                Err(ControllerError::QueueFull(patient))
            }
            Err(TrySendError::Closed(_)) => Err(ControllerError::WorkerGone(patient)),
        }
    }

    /// Asks the patient's worker for a copy of its state. The request is
    /// queued behind any events already waiting for that patient.
    pub async fn patient_snapshot(&self, patient_id: &str) -> Option<SafetySnapshot> {
        let handle = self.patients.get(patient_id)?;
        let (reply, rx) = oneshot::channel();
        handle.tx.send(PatientEvent::Snapshot(reply)).await.ok()?;
        rx.await.ok()
    }

    pub async fn run(self, rx: broadcast::Receiver<BusMessage>) -> StatsSnapshot {
        self.run_until(rx, std::future::pending()).await
    }

    /// Consumes the bus until it closes or `shutdown` resolves, then drains
    /// every worker.
    pub async fn run_until(
        mut self,
        mut rx: broadcast::Receiver<BusMessage>,
        shutdown: impl Future<Output = ()>,
    ) -> StatsSnapshot {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(message) => {
                        if let Err(e) = self.dispatch(&message) {
                            debug!(topic = %message.topic, error = %e, "message not processed");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "controller lagging behind the bus, messages lost");
                        self.stats.bus_messages_dropped.fetch_add(missed, Ordering::Relaxed);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.shutdown().await
    }

    /// Closes every patient queue and waits for in-flight events to finish.
    pub async fn shutdown(self) -> StatsSnapshot {
        for (patient, handle) in self.patients {
            drop(handle.tx);
            if let Err(e) = handle.task.await {
                error!(patient = %patient, error = %e, "patient worker panicked");
            }
        }
        self.stats.snapshot()
    }

    fn worker_for(&mut self, patient_id: &str) -> Result<mpsc::Sender<PatientEvent>, ControllerError> {
        if let Some(handle) = self.patients.get(patient_id) {
            return Ok(handle.tx.clone());
        }

        let profile = match self.profiles.get(patient_id) {
            Some(profile) => Arc::clone(profile),
            None => match &self.default_profile {
                Some(default) => Arc::new(default.for_patient(patient_id)),
                None => {
                    ControllerStats::incr(&self.stats.unknown_patients);
                    warn!(patient = patient_id, "no profile for patient, message dropped");
                    return Err(ControllerError::UnknownPatient(patient_id.to_owned()));
                }
            },
        };

        let worker = PatientWorker::new(
            profile,
            Arc::clone(&self.settings),
            Arc::clone(&self.decay),
            Arc::clone(&self.emitter),
            Arc::clone(&self.stats),
        );

        let (tx, rx) = mpsc::channel(self.settings.queue_capacity);
        let task = tokio::spawn(worker.run(rx));
        info!(patient = patient_id, decay = self.decay.name(), "patient registered");

        self.patients
            .insert(patient_id.to_owned(), PatientHandle { tx: tx.clone(), task });
        Ok(tx)
    }
}
