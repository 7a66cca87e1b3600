//! Command emitter: turns decisions into SenML commands and alerts and
//! publishes them with bounded retry.

use crate::bus::TopicKind;
use crate::decision::{Alert, AlertCode, DoseDecision, Severity};
use crate::error::PublishError;
use crate::profile::PublishSettings;
use crate::senml::SenmlPack;
use crate::telemetry::{base_name, to_seconds};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Outbound transport. Implementations report failures instead of
/// swallowing them.
pub trait Publisher: Send + Sync + 'static {
    fn publish(
        &self,
        topic: &str,
        payload: String,
    ) -> impl Future<Output = Result<(), PublishError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoseKind {
    Bolus,
    /// Representable on the wire; the engine never issues it.
    BasalAdjust,
}

impl DoseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DoseKind::Bolus => "bolus",
            DoseKind::BasalAdjust => "basal_adjust",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseCommand {
    pub patient_id: String,
    pub sequence: u64,
    pub kind: DoseKind,
    pub units: f64,
    pub timestamp: u64,
}

impl DoseCommand {
    #[allow(clippy::cast_precision_loss)]
    pub fn to_senml(&self) -> SenmlPack {
        SenmlPack::builder(base_name(&self.patient_id, "insulin"), to_seconds(self.timestamp))
            .base_unit("U")
            .number("dose", self.units, None)
            .text("command", self.kind.as_str())
            .number("id", self.sequence as f64, None)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub patient_id: String,
    pub alert: Alert,
    pub timestamp: u64,
}

impl AlertMessage {
    pub fn to_senml(&self) -> SenmlPack {
        SenmlPack::builder(base_name(&self.patient_id, "alert"), to_seconds(self.timestamp))
            .text("type", self.alert.code.as_str())
            .text("message", &self.alert.message)
            .text("severity", self.alert.severity.as_str())
            .build()
    }
}

/// Zero or one command plus zero or more alerts for one decision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmissionPlan {
    pub command: Option<DoseCommand>,
    pub alerts: alloc::vec::Vec<AlertMessage>,
}

impl EmissionPlan {
    pub fn is_empty(&self) -> bool {
        self.command.is_none() && self.alerts.is_empty()
    }
}

#[derive(Debug)]
pub struct CommandEmitter<P> {
    publisher: P,
    settings: PublishSettings,
    emit_suppression_notes: bool,
    sequence: AtomicU64,
}

impl<P: Publisher> CommandEmitter<P> {
    pub fn new(publisher: P, settings: PublishSettings, emit_suppression_notes: bool) -> Self {
        Self {
            publisher,
            settings,
            emit_suppression_notes,
            sequence: AtomicU64::new(1),
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn plan(
        &self,
        patient_id: &str,
        decision: &DoseDecision,
        advisories: &[Alert],
        timestamp: u64,
    ) -> EmissionPlan {
        let alert = |alert: Alert| AlertMessage {
            patient_id: patient_id.to_owned(),
            alert,
            timestamp,
        };

        let mut plan = EmissionPlan::default();

        match decision {
            DoseDecision::NoAction => {}
            DoseDecision::Bolus { units } => {
                plan.command = Some(DoseCommand {
                    patient_id: patient_id.to_owned(),
                    sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                    kind: DoseKind::Bolus,
                    units: *units,
                    timestamp,
                });
            }
            DoseDecision::SuppressedBolus { reason, units } => {
                if self.emit_suppression_notes {
                    let message = match units {
                        Some(u) => format!("correction suppressed: {} ({u:.2} U)", reason.as_str()),
                        None => format!("correction suppressed: {}", reason.as_str()),
                    };
                    plan.alerts.push(alert(Alert::new(
                        Severity::Info,
                        AlertCode::CorrectionSuppressed,
                        message,
                    )));
                }
            }
            DoseDecision::Alert(a) => plan.alerts.push(alert(a.clone())),
        }

        plan.alerts.extend(advisories.iter().cloned().map(alert));
        plan
    }

    /// Publishes the command first, then every alert. A failed publish does
    /// not stop the rest of the plan; the first failure is returned.
    pub async fn emit(&self, plan: &EmissionPlan) -> Result<(), PublishError> {
        let mut first_error = None;

        if let Some(command) = &plan.command {
            let topic = TopicKind::PumpCommand.topic(&command.patient_id);
            if let Err(e) = self.publish_pack(&topic, &command.to_senml()).await {
                first_error.get_or_insert(e);
            }
        }

        for alert in &plan.alerts {
            let topic = TopicKind::Alert.topic(&alert.patient_id);
            if let Err(e) = self.publish_pack(&topic, &alert.to_senml()).await {
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn publish_pack(&self, topic: &str, pack: &SenmlPack) -> Result<(), PublishError> {
        let payload = pack
            .to_json()
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        self.publish_with_retry(topic, payload).await
    }

    /// Retries with doubling backoff up to `max_attempts`, each attempt bounded
    /// by `timeout_ms`. Exhaustion is escalated on the emergency log target
    /// because the message it carried never reached anyone.
    pub async fn publish_with_retry(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        let attempts = self.settings.max_attempts.max(1);
        let timeout = Duration::from_millis(self.settings.timeout_ms);
        let mut backoff = Duration::from_millis(self.settings.initial_backoff_ms);
        let mut last = PublishError::NoSubscribers;

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(timeout, self.publisher.publish(topic, payload.clone())).await;

            match result {
                Ok(Ok(())) => {
                    debug!(topic, attempt, "published");
                    return Ok(());
                }
                Ok(Err(e)) => last = e,
                Err(_) => {
                    last = PublishError::Timeout {
                        after_ms: self.settings.timeout_ms,
                    }
                }
            }

            if attempt < attempts {
                warn!(topic, attempt, error = %last, "publish failed, retrying in {:?}", backoff);
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        error!(
            target: "glucoloop::emergency",
            topic,
            attempts,
            error = %last,
            payload = %payload,
            "EMERGENCY: outbound message could not be delivered"
        );

        Err(PublishError::Exhausted {
            attempts,
            last: Box::new(last),
        })
    }
}
