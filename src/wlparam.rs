//! Workload parameter descriptors and values.
//!
//! A workload type declares its parameters as descriptors: name, type,
//! optional range and whether a fresh value is generated per request.
//! Values are validated against the descriptor and encoded little-endian
//! into the fixed-size suffix of a time-series record.

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Parameter (and record field) type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Bool,
    Int,
    Float,
    String,
}

/// Declared value constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamRange {
    Int { min: i64, max: i64 },
    Float { min: f64, max: f64 },
    StringLength { max: usize },
}

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ParamValue {
    pub fn type_of(&self) -> ParamType {
        match self {
            ParamValue::Bool(_) => ParamType::Bool,
            ParamValue::Int(_) => ParamType::Int,
            ParamValue::Float(_) => ParamType::Float,
            ParamValue::Str(_) => ParamType::String,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ParamValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Parameter declaration of a workload type.
#[derive(Debug, Clone)]
pub struct ParamDescr {
    pub name: String,
    pub ptype: ParamType,

    /// Generated anew for every request when true; fixed at configuration
    /// time otherwise.
    pub per_request: bool,

    pub range: Option<ParamRange>,
    pub default: Option<ParamValue>,
}

impl ParamDescr {
    pub fn new(name: &str, ptype: ParamType, per_request: bool) -> ParamDescr {
        ParamDescr {
            name: name.into(),
            ptype,
            per_request,
            range: None,
            default: None,
        }
    }

    pub fn with_range(mut self, range: ParamRange) -> ParamDescr {
        self.range = Some(range);
        self
    }

    pub fn with_default(mut self, value: ParamValue) -> ParamDescr {
        self.default = Some(value);
        self
    }

    /// On-disk size of this field in a record.
    pub fn encoded_size(&self) -> usize {
        match self.ptype {
            ParamType::Bool => 1,
            ParamType::Int => 8,
            ParamType::Float => 8,
            ParamType::String => match &self.range {
                Some(ParamRange::StringLength { max }) => *max,
                _ => DEFAULT_STRING_SIZE,
            },
        }
    }

    /// Validate a value against the declared type and range.
    pub fn check(&self, value: &ParamValue) -> Result<()> {
        if value.type_of() != self.ptype {
            return Err(Error::invalid_value(
                format!("param '{}'", self.name),
                format!("expected {:?} value, got {:?}", self.ptype, value.type_of()),
            ));
        }
        match (&self.range, value) {
            (Some(ParamRange::Int { min, max }), ParamValue::Int(v)) => {
                if v < min || v > max {
                    return Err(Error::invalid_value(
                        format!("param '{}'", self.name),
                        format!("{v} outside [{min}, {max}]"),
                    ));
                }
            }
            (Some(ParamRange::Float { min, max }), ParamValue::Float(v)) => {
                if v < min || v > max {
                    return Err(Error::invalid_value(
                        format!("param '{}'", self.name),
                        format!("{v} outside [{min}, {max}]"),
                    ));
                }
            }
            (Some(ParamRange::StringLength { max }), ParamValue::Str(s)) => {
                // One byte is reserved for the terminator in the record.
                if s.len() >= *max {
                    return Err(Error::invalid_value(
                        format!("param '{}'", self.name),
                        format!("string of {} bytes exceeds length {}", s.len(), max),
                    ));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Encode `value` into `buf` (exactly `encoded_size()` bytes).
    pub fn encode(&self, value: &ParamValue, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.encoded_size());
        match value {
            ParamValue::Bool(b) => buf[0] = *b as u8,
            ParamValue::Int(v) => buf.copy_from_slice(&v.to_le_bytes()),
            ParamValue::Float(v) => buf.copy_from_slice(&v.to_le_bytes()),
            ParamValue::Str(s) => {
                let bytes = s.as_bytes();
                let n = bytes.len().min(buf.len().saturating_sub(1));
                buf[..n].copy_from_slice(&bytes[..n]);
                for b in buf[n..].iter_mut() {
                    *b = 0;
                }
            }
        }
    }
}

const DEFAULT_STRING_SIZE: usize = 32;

/// Total record-suffix size of the per-request parameters.
pub fn request_params_size(descrs: &[ParamDescr]) -> usize {
    descrs
        .iter()
        .filter(|d| d.per_request)
        .map(|d| d.encoded_size())
        .sum()
}

/// Encode per-request values (ordered like the per-request descriptors)
/// into `buf`.
pub fn encode_request_params(descrs: &[ParamDescr], values: &[ParamValue], buf: &mut [u8]) {
    let mut off = 0;
    for (descr, value) in descrs.iter().filter(|d| d.per_request).zip(values) {
        let size = descr.encoded_size();
        descr.encode(value, &mut buf[off..off + size]);
        off += size;
    }
}
