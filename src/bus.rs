//! In-process publish/subscribe bus and the per-patient topic scheme.

use crate::emitter::Publisher;
use crate::error::PublishError;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const TOPIC_PREFIX: &str = "/iot/patient/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    GlucoseReading,
    PumpStatus,
    PumpCommand,
    Alert,
}

impl TopicKind {
    fn suffix(self) -> &'static str {
        match self {
            TopicKind::GlucoseReading => "glucose/sensor/data",
            TopicKind::PumpStatus => "insulin/pump/status",
            TopicKind::PumpCommand => "insulin/pump/command",
            TopicKind::Alert => "notifications/alert",
        }
    }

    pub fn topic(self, patient_id: &str) -> String {
        format!("{TOPIC_PREFIX}{patient_id}/{}", self.suffix())
    }

    /// Splits `/iot/patient/{id}/{suffix}` into the patient id and kind.
    pub fn parse(topic: &str) -> Option<(&str, TopicKind)> {
        let rest = topic.strip_prefix(TOPIC_PREFIX)?;
        let (patient, suffix) = rest.split_once('/')?;
        if patient.is_empty() {
            return None;
        }

        let kind = [
            TopicKind::GlucoseReading,
            TopicKind::PumpStatus,
            TopicKind::PumpCommand,
            TopicKind::Alert,
        ]
        .into_iter()
        .find(|k| k.suffix() == suffix)?;

        Some((patient, kind))
    }
}

/// One message on the bus. Also the newline-delimited JSON envelope spoken by
/// the TCP gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Every subscriber sees every message in publish order.
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers received the message.
    pub fn publish(&self, message: BusMessage) -> Result<usize, PublishError> {
        self.tx.send(message).map_err(|_| PublishError::NoSubscribers)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[derive(Debug, Clone)]
pub struct BusPublisher {
    bus: MessageBus,
}

impl BusPublisher {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }
}

impl Publisher for BusPublisher {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        self.bus.publish(BusMessage::new(topic, payload)).map(|_| ())
    }
}
