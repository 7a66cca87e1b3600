use thiserror::Error;

/// Failure to turn an inbound bus payload into a typed record.
///
/// Decode failures are terminal for the message: it is dropped, counted and
/// never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("invalid SenML JSON: {0}")]
    InvalidJson(String),
    #[error("payload of {0} bytes exceeds the message limit")]
    TooLarge(usize),
    #[error("SenML pack is empty")]
    EmptyPack,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid base name `{0}`")]
    InvalidBaseName(String),
    #[error("unknown trend `{0}`")]
    UnknownTrend(String),
    #[error("unknown pump status `{0}`")]
    UnknownPumpStatus(String),
    #[error("{field} value {value} outside plausible range")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("invalid timestamp {0}")]
    InvalidTimestamp(f64),
    #[error("topic patient `{topic}` does not match payload patient `{payload}`")]
    PatientMismatch { topic: String, payload: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error("no subscribers on the bus")]
    NoSubscribers,
    #[error("publish timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<PublishError>,
    },
}

/// A dose that escaped the engine's clamping. Reaching this is a programming
/// error; the bolus is never committed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("safety violation for {patient}: {reason}")]
pub struct SafetyViolation {
    pub patient: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Safety(#[from] SafetyViolation),
    #[error("no profile configured for patient {0}")]
    UnknownPatient(String),
    #[error("worker for patient {0} has stopped")]
    WorkerGone(String),
    #[error("queue for patient {0} is full")]
    QueueFull(String),
}
