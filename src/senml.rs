//! Minimal SenML (RFC 8428) JSON packs.
//!
//! Every message on the bus is a pack: a JSON array whose first record usually
//! carries the base fields (`bn`, `bt`, `bu`) and whose following records carry
//! named values. Only the subset used by the glucose loop is supported.

use crate::error::DecodeError;
use serde::{Deserialize, Serialize};

pub const MAX_PACK_SIZE: usize = 4096;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SenmlRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vb: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SenmlValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

/// A record with base fields applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRecord {
    /// Record name without the base name prefix.
    pub name: String,
    pub unit: Option<String>,
    pub value: SenmlValue,
    /// Absolute time in UNIX seconds. `None` when the record has no `t` and
    /// no earlier record declared a `bt`.
    pub time: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SenmlPack {
    pub records: Vec<SenmlRecord>,
}

impl SenmlPack {
    pub fn parse(json: &str) -> Result<Self, DecodeError> {
        if json.len() > MAX_PACK_SIZE {
            return Err(DecodeError::TooLarge(json.len()));
        }

        let pack: SenmlPack =
            serde_json::from_str(json).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

        if pack.records.is_empty() {
            return Err(DecodeError::EmptyPack);
        }

        Ok(pack)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn builder(base_name: impl Into<String>, base_time: f64) -> SenmlBuilder {
        SenmlBuilder::new(base_name.into(), base_time)
    }

    /// Base name declared by the first record that carries one.
    pub fn base_name(&self) -> Option<&str> {
        self.records.iter().find_map(|r| r.bn.as_deref())
    }

    pub fn base_time(&self) -> Option<f64> {
        self.records.iter().find_map(|r| r.bt)
    }

    /// Applies base fields in record order, as RFC 8428 section 4.6 describes.
    /// Records that carry no value (pure base records) are skipped.
    pub fn resolve(&self) -> Vec<ResolvedRecord> {
        let mut base_time: Option<f64> = None;
        let mut base_unit: Option<&str> = None;
        let mut resolved = Vec::with_capacity(self.records.len());

        for record in &self.records {
            if let Some(bt) = record.bt {
                base_time = Some(bt);
            }
            if let Some(bu) = record.bu.as_deref() {
                base_unit = Some(bu);
            }

            let value = match (record.v, record.vs.as_ref(), record.vb) {
                (Some(v), _, _) => SenmlValue::Number(v),
                (None, Some(vs), _) => SenmlValue::Text(vs.clone()),
                (None, None, Some(vb)) => SenmlValue::Bool(vb),
                (None, None, None) => continue,
            };

            resolved.push(ResolvedRecord {
                name: record.n.clone().unwrap_or_default(),
                unit: record.u.as_deref().or(base_unit).map(str::to_owned),
                value,
                time: match (base_time, record.t) {
                    (None, None) => None,
                    (bt, t) => Some(bt.unwrap_or(0.0) + t.unwrap_or(0.0)),
                },
            });
        }

        resolved
    }
}

#[derive(Debug)]
pub struct SenmlBuilder {
    base: SenmlRecord,
    records: Vec<SenmlRecord>,
}

impl SenmlBuilder {
    fn new(base_name: String, base_time: f64) -> Self {
        Self {
            base: SenmlRecord {
                bn: Some(base_name),
                bt: Some(base_time),
                ..SenmlRecord::default()
            },
            records: Vec::new(),
        }
    }

    pub fn base_unit(mut self, unit: &str) -> Self {
        self.base.bu = Some(unit.to_owned());
        self
    }

    pub fn number(mut self, name: &str, value: f64, unit: Option<&str>) -> Self {
        self.records.push(SenmlRecord {
            n: Some(name.to_owned()),
            v: Some(value),
            u: unit.map(str::to_owned),
            t: Some(0.0),
            ..SenmlRecord::default()
        });
        self
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.records.push(SenmlRecord {
            n: Some(name.to_owned()),
            vs: Some(value.to_owned()),
            t: Some(0.0),
            ..SenmlRecord::default()
        });
        self
    }

    pub fn boolean(mut self, name: &str, value: bool) -> Self {
        self.records.push(SenmlRecord {
            n: Some(name.to_owned()),
            vb: Some(value),
            t: Some(0.0),
            ..SenmlRecord::default()
        });
        self
    }

    pub fn build(self) -> SenmlPack {
        let mut records = Vec::with_capacity(self.records.len() + 1);
        records.push(self.base);
        records.extend(self.records);
        SenmlPack { records }
    }
}
