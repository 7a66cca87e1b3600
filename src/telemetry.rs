//! Inbound telemetry: glucose readings from the sensor and status reports
//! from the pump, decoded from SenML packs.
//!
//! Decoding is pure. The same payload always yields the same record and a
//! failed decode leaves nothing behind.

use crate::error::DecodeError;
use crate::senml::{ResolvedRecord, SenmlPack, SenmlValue};
use serde::{Deserialize, Serialize};

pub const MIN_PLAUSIBLE_GLUCOSE_MG_DL: f64 = 20.0;
pub const MAX_PLAUSIBLE_GLUCOSE_MG_DL: f64 = 600.0;

const GLUCOSE_KIND: &str = "glucose";
const PUMP_KIND: &str = "pump";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    RisingFast,
    Rising,
    Stable,
    Falling,
    FallingFast,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::RisingFast => "rising_fast",
            Trend::Rising => "rising",
            Trend::Stable => "stable",
            Trend::Falling => "falling",
            Trend::FallingFast => "falling_fast",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DecodeError> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "rising_fast" => Ok(Trend::RisingFast),
            "rising" => Ok(Trend::Rising),
            "stable" => Ok(Trend::Stable),
            "falling" => Ok(Trend::Falling),
            "falling_fast" => Ok(Trend::FallingFast),
            _ => Err(DecodeError::UnknownTrend(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseReading {
    pub patient_id: String,
    pub value_mg_dl: f64,
    pub trend: Trend,
    /// UNIX milliseconds.
    pub timestamp: u64,
    pub battery_percent: f64,
}

impl GlucoseReading {
    pub fn to_senml(&self) -> SenmlPack {
        SenmlPack::builder(base_name(&self.patient_id, GLUCOSE_KIND), to_seconds(self.timestamp))
            .base_unit("mg/dL")
            .number("level", self.value_mg_dl, None)
            .text("trend", self.trend.as_str())
            .number("battery", self.battery_percent, Some("%"))
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpState {
    Active,
    Alarm,
    Stopped,
    AlarmCleared,
}

impl PumpState {
    pub fn as_str(self) -> &'static str {
        match self {
            PumpState::Active => "active",
            PumpState::Alarm => "alarm",
            PumpState::Stopped => "stopped",
            PumpState::AlarmCleared => "alarm_cleared",
        }
    }

    pub fn parse(s: &str) -> Result<Self, DecodeError> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "active" => Ok(PumpState::Active),
            "alarm" => Ok(PumpState::Alarm),
            "stopped" => Ok(PumpState::Stopped),
            "alarm_cleared" | "cleared" => Ok(PumpState::AlarmCleared),
            _ => Err(DecodeError::UnknownPumpStatus(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpStatus {
    pub patient_id: String,
    pub state: PumpState,
    /// Alarm flag as reported; `state` may raise an alarm on its own.
    pub alarm: bool,
    pub reservoir_units: f64,
    pub battery_percent: f64,
    pub timestamp: u64,
}

impl PumpStatus {
    pub fn alarm_raised(&self) -> bool {
        self.alarm || matches!(self.state, PumpState::Alarm | PumpState::Stopped)
    }

    pub fn alarm_cleared(&self) -> bool {
        self.state == PumpState::AlarmCleared
    }

    pub fn to_senml(&self) -> SenmlPack {
        SenmlPack::builder(base_name(&self.patient_id, PUMP_KIND), to_seconds(self.timestamp))
            .number("reservoir", self.reservoir_units, Some("U"))
            .number("battery", self.battery_percent, Some("%"))
            .text("status", self.state.as_str())
            .boolean("alarm", self.alarm)
            .build()
    }
}

pub fn decode_reading(payload: &str) -> Result<GlucoseReading, DecodeError> {
    let pack = SenmlPack::parse(payload)?;
    let patient_id = patient_from_base_name(&pack, GLUCOSE_KIND)?;
    let records = pack.resolve();

    let level = find(&records, "level").ok_or(DecodeError::MissingField("level"))?;
    let value_mg_dl = number(level, "level")?;
    if !(MIN_PLAUSIBLE_GLUCOSE_MG_DL..=MAX_PLAUSIBLE_GLUCOSE_MG_DL).contains(&value_mg_dl) {
        return Err(DecodeError::OutOfRange { field: "level", value: value_mg_dl });
    }

    let trend = match find(&records, "trend").map(|r| &r.value) {
        Some(SenmlValue::Text(s)) => Trend::parse(s)?,
        Some(_) => return Err(DecodeError::UnknownTrend("non-text value".into())),
        None => return Err(DecodeError::MissingField("trend")),
    };

    let battery = find(&records, "battery").ok_or(DecodeError::MissingField("battery"))?;
    let battery_percent = percent(battery, "battery")?;

    Ok(GlucoseReading {
        patient_id,
        value_mg_dl,
        trend,
        timestamp: to_millis(level.time)?,
        battery_percent,
    })
}

pub fn decode_pump_status(payload: &str) -> Result<PumpStatus, DecodeError> {
    let pack = SenmlPack::parse(payload)?;
    let patient_id = patient_from_base_name(&pack, PUMP_KIND)?;
    let records = pack.resolve();

    let status = find(&records, "status").ok_or(DecodeError::MissingField("status"))?;
    let state = match &status.value {
        SenmlValue::Text(s) => PumpState::parse(s)?,
        _ => return Err(DecodeError::UnknownPumpStatus("non-text value".into())),
    };

    let reservoir = find(&records, "reservoir").ok_or(DecodeError::MissingField("reservoir"))?;
    let reservoir_units = number(reservoir, "reservoir")?;
    if reservoir_units < 0.0 {
        return Err(DecodeError::OutOfRange { field: "reservoir", value: reservoir_units });
    }

    let battery = find(&records, "battery").ok_or(DecodeError::MissingField("battery"))?;
    let battery_percent = percent(battery, "battery")?;

    let alarm = match find(&records, "alarm").map(|r| &r.value) {
        Some(SenmlValue::Bool(b)) => *b,
        Some(SenmlValue::Number(n)) => *n != 0.0,
        _ => false,
    };

    Ok(PumpStatus {
        patient_id,
        state,
        alarm,
        reservoir_units,
        battery_percent,
        timestamp: to_millis(status.time)?,
    })
}

pub fn base_name(patient_id: &str, kind: &str) -> String {
    format!("urn:patient:{patient_id}:{kind}:")
}

/// Extracts the patient id from `urn:patient:{id}:{kind}:`.
fn patient_from_base_name(pack: &SenmlPack, kind: &str) -> Result<String, DecodeError> {
    let bn = pack.base_name().ok_or(DecodeError::MissingField("bn"))?;

    let patient = bn
        .strip_prefix("urn:patient:")
        .and_then(|rest| rest.strip_suffix(':'))
        .and_then(|rest| rest.strip_suffix(kind))
        .and_then(|rest| rest.strip_suffix(':'))
        .filter(|id| !id.is_empty() && !id.contains(':'));

    patient
        .map(str::to_owned)
        .ok_or_else(|| DecodeError::InvalidBaseName(bn.to_owned()))
}

fn find<'a>(records: &'a [ResolvedRecord], name: &str) -> Option<&'a ResolvedRecord> {
    records.iter().find(|r| r.name == name)
}

fn number(record: &ResolvedRecord, field: &'static str) -> Result<f64, DecodeError> {
    match record.value {
        SenmlValue::Number(v) if v.is_finite() => Ok(v),
        SenmlValue::Number(v) => Err(DecodeError::OutOfRange { field, value: v }),
        _ => Err(DecodeError::MissingField(field)),
    }
}

fn percent(record: &ResolvedRecord, field: &'static str) -> Result<f64, DecodeError> {
    let value = number(record, field)?;
    if (0.0..=100.0).contains(&value) {
        Ok(value)
    } else {
        Err(DecodeError::OutOfRange { field, value })
    }
}

/// A record without any time (no `bt` in the pack, no `t` on the record) is
/// rejected rather than read as the epoch.
fn to_millis(seconds: Option<f64>) -> Result<u64, DecodeError> {
    let seconds = seconds.ok_or(DecodeError::MissingField("bt"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(DecodeError::InvalidTimestamp(seconds));
    }
    Ok((seconds * 1000.0).round() as u64)
}

#[allow(clippy::cast_precision_loss)]
pub fn to_seconds(millis: u64) -> f64 {
    millis as f64 / 1000.0
}
