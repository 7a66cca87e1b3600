//! # Glucoloop
//!
//! A closed-loop glucose controller: it consumes continuous glucose sensor
//! readings and pump status reports from a publish/subscribe bus, keeps
//! per-patient safety state, decides on correction boluses and publishes pump
//! commands and patient alerts.
//!
//! ## Features
//!
//! - **SenML messages**: every bus payload is an RFC 8428 JSON pack
//! - **Pure decision engine**: decisions are computed without side effects and
//!   committed separately after a re-check
//! - **Per-patient ordering**: one worker per patient, patients in parallel
//! - **Safety first**: hypoglycemia never yields insulin, pump alarms suspend
//!   corrections, boluses are clamped and rounded to the pump increment
//! - **Bounded retry**: outbound publishes retry with backoff and escalate
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use glucoloop::{BusPublisher, ControllerConfig, DoseController, MessageBus};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ControllerConfig::load("glucoloop.toml")?;
//! let bus = MessageBus::new(config.controller.bus_capacity);
//! let inbound = bus.subscribe();
//!
//! let controller = DoseController::new(config, BusPublisher::new(bus.clone()));
//! let stats = controller.run(inbound).await;
//! println!("{stats:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`senml`] - SenML pack encoding and base-field resolution
//! - [`telemetry`] - Decoding glucose readings and pump status
//! - [`profile`] - Patient profiles and TOML configuration
//! - [`safety`] - Per-patient safety state and insulin-on-board decay
//! - [`decision`] - The dose decision engine
//! - [`emitter`] - Outbound commands and alerts
//! - [`bus`] - In-process bus and topic scheme
//! - [`controller`] - Patient registry and ordered workers

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

extern crate alloc;

pub mod bus;
pub mod controller;
pub mod decision;
pub mod emitter;
pub mod error;
pub mod profile;
pub mod safety;
pub mod senml;
pub mod telemetry;

// Re-export main public types for convenience
pub use bus::{BusMessage, BusPublisher, MessageBus, TopicKind};
pub use controller::{DoseController, Outcome, PatientWorker, StatsSnapshot};
pub use decision::{decide, Alert, AlertCode, DecisionPolicy, DoseDecision, Severity, SuppressionReason};
pub use emitter::{CommandEmitter, Publisher};
pub use error::{ConfigError, ControllerError, DecodeError, PublishError, SafetyViolation};
pub use profile::{ControllerConfig, OverLimitPolicy, PatientProfile};
pub use safety::PatientSafetyState;
pub use telemetry::{GlucoseReading, PumpStatus, Trend};
