//! Signal types, values and registry error types.
//!
//! A signal is a named, typed scalar owned by one module. Values travel
//! through shared memory as an 8-byte raw union; [`SignalValue`] is the
//! typed view and enforces that every access matches the declared
//! [`SignalType`] exactly.

use crate::consts::{MAX_MODULE_NAME_LEN, MAX_SIGNAL_NAME_LEN};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fixed-capacity signal name, as stored in a signal table entry.
pub type SignalName = heapless::String<MAX_SIGNAL_NAME_LEN>;

/// Fixed-capacity module name, as stored in a module block.
pub type ModuleName = heapless::String<MAX_MODULE_NAME_LEN>;

/// Scalar type tag of a signal (1 byte in shared memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SignalType {
    F64 = 0,
    F32 = 1,
    I64 = 2,
    I32 = 3,
    Bool = 4,
}

impl SignalType {
    /// Convert from raw `u8` tag. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::F64),
            1 => Some(Self::F32),
            2 => Some(Self::I64),
            3 => Some(Self::I32),
            4 => Some(Self::Bool),
            _ => None,
        }
    }

    /// The zero value of this type: the default of an unset signal.
    pub const fn zero(self) -> SignalValue {
        match self {
            Self::F64 => SignalValue::F64(0.0),
            Self::F32 => SignalValue::F32(0.0),
            Self::I64 => SignalValue::I64(0),
            Self::I32 => SignalValue::I32(0),
            Self::Bool => SignalValue::Bool(false),
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::F64 => "f64",
            Self::F32 => "f32",
            Self::I64 => "i64",
            Self::I32 => "i32",
            Self::Bool => "bool",
        };
        f.write_str(s)
    }
}

/// A typed signal value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SignalValue {
    F64(f64),
    F32(f32),
    I64(i64),
    I32(i32),
    Bool(bool),
}

impl SignalValue {
    /// Declared type of this value.
    pub const fn kind(&self) -> SignalType {
        match self {
            Self::F64(_) => SignalType::F64,
            Self::F32(_) => SignalType::F32,
            Self::I64(_) => SignalType::I64,
            Self::I32(_) => SignalType::I32,
            Self::Bool(_) => SignalType::Bool,
        }
    }

    /// Encode into the 8-byte value union.
    pub fn to_bits(self) -> u64 {
        match self {
            Self::F64(v) => v.to_bits(),
            Self::F32(v) => u64::from(v.to_bits()),
            Self::I64(v) => v as u64,
            Self::I32(v) => u64::from(v as u32),
            Self::Bool(v) => u64::from(v),
        }
    }

    /// Decode the 8-byte value union according to `kind`.
    pub fn from_bits(kind: SignalType, bits: u64) -> Self {
        match kind {
            SignalType::F64 => Self::F64(f64::from_bits(bits)),
            SignalType::F32 => Self::F32(f32::from_bits(bits as u32)),
            SignalType::I64 => Self::I64(bits as i64),
            SignalType::I32 => Self::I32(bits as u32 as i32),
            SignalType::Bool => Self::Bool(bits != 0),
        }
    }

    /// Numeric view used by wire routing. Bool maps to 0.0 / 1.0.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::F64(v) => v,
            Self::F32(v) => f64::from(v),
            Self::I64(v) => v as f64,
            Self::I32(v) => f64::from(v),
            Self::Bool(v) => {
                if v {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Explicit conversion from a numeric value into `kind`.
    ///
    /// Integers are rounded and saturate at the type bounds; bool is
    /// `value != 0`. This is never applied implicitly on signal access.
    pub fn from_f64(kind: SignalType, value: f64) -> Self {
        match kind {
            SignalType::F64 => Self::F64(value),
            SignalType::F32 => Self::F32(value as f32),
            SignalType::I64 => Self::I64(value.round() as i64),
            SignalType::I32 => Self::I32(value.round() as i32),
            SignalType::Bool => Self::Bool(value != 0.0),
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F64(v) => write!(f, "{v}"),
            Self::F32(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::I32(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<f32> for SignalValue {
    fn from(v: f32) -> Self {
        Self::F32(v)
    }
}

impl From<i64> for SignalValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<i32> for SignalValue {
    fn from(v: i32) -> Self {
        Self::I32(v)
    }
}

impl From<bool> for SignalValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

bitflags! {
    /// Per-signal permission and visibility flags (1 byte in shared memory).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SignalFlags: u8 {
        /// Parties other than the owning module may write the signal.
        const WRITABLE = 0b0000_0001;
        /// Signal is exported to read-only observers (telemetry, listing).
        const PUBLISHED = 0b0000_0010;
    }
}

impl SignalFlags {
    /// Flags for the common `(writable)` registration form.
    pub fn writable(writable: bool) -> Self {
        if writable {
            Self::WRITABLE | Self::PUBLISHED
        } else {
            Self::PUBLISHED
        }
    }
}

/// Index of a module inside the segment (registration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModuleId(pub u32);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resolved handle to a registered signal.
///
/// Slots never move once registered, so a ref stays valid for the
/// lifetime of the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalRef {
    /// Owning module.
    pub module: ModuleId,
    /// Slot index inside the owning module's table region.
    pub slot: u32,
    /// Declared type.
    pub kind: SignalType,
}

/// Snapshot of one registry entry, for listing and reports.
#[derive(Debug, Clone, Serialize)]
pub struct SignalInfo {
    pub module: ModuleName,
    pub name: SignalName,
    #[serde(rename = "type")]
    pub kind: SignalType,
    pub writable: bool,
    pub published: bool,
    pub value: SignalValue,
    /// Engineering unit, known only for configuration-declared signals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl SignalInfo {
    /// Externally addressable `module.signal` form.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }
}

/// Split a qualified `module.signal` name at the first dot.
///
/// Signal names may contain further dots; module names may not.
pub fn split_qualified(name: &str) -> Option<(&str, &str)> {
    let (module, signal) = name.split_once('.')?;
    if module.is_empty() || signal.is_empty() {
        return None;
    }
    Some((module, signal))
}

/// Check a name against the fixed-width field rules.
pub fn validate_name(name: &str, max_len: usize) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("name is empty");
    }
    if name.len() > max_len {
        return Err("name exceeds fixed-width field");
    }
    if name.bytes().any(|b| b == 0 || b.is_ascii_whitespace()) {
        return Err("name contains NUL or whitespace");
    }
    Ok(())
}

/// Errors raised while registering a signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The name is already registered in this module's namespace.
    #[error("signal {name:?} is already registered")]
    DuplicateName { name: String },

    /// Registration attempted after the owning module acknowledged STAGE.
    #[error("registry is closed, cannot register {name:?}")]
    RegistryClosed { name: String },

    /// The name does not fit the fixed-width identifier rules.
    #[error("invalid signal name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The module's table region has no free slot left.
    #[error("signal table full ({capacity} slots per module)")]
    TableFull { capacity: u32 },
}

/// Errors raised while reading or writing a signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// The name (or ref) was never registered.
    #[error("signal {name:?} not found")]
    NotFound { name: String },

    /// The caller is not allowed to write this signal.
    #[error("signal {name:?} is not writable by this caller")]
    NotWritable { name: String },

    /// The value type differs from the declared type.
    #[error("signal {name:?} is {expected}, access used {actual}")]
    TypeMismatch {
        name: String,
        expected: SignalType,
        actual: SignalType,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_type_tag_roundtrip() {
        for val in 0..=4u8 {
            let kind = SignalType::from_u8(val).unwrap();
            assert_eq!(kind as u8, val);
        }
        assert!(SignalType::from_u8(5).is_none());
        assert!(SignalType::from_u8(255).is_none());
    }

    #[test]
    fn negative_i32_survives_the_union() {
        let v = SignalValue::I32(-7);
        let bits = v.to_bits();
        assert_eq!(bits >> 32, 0, "i32 must not sign-extend into the upper word");
        assert_eq!(SignalValue::from_bits(SignalType::I32, bits), v);
    }

    #[test]
    fn zero_matches_all_zero_bits() {
        for kind in [
            SignalType::F64,
            SignalType::F32,
            SignalType::I64,
            SignalType::I32,
            SignalType::Bool,
        ] {
            assert_eq!(SignalValue::from_bits(kind, 0), kind.zero());
            assert_eq!(kind.zero().kind(), kind);
        }
    }

    #[test]
    fn from_f64_rounds_and_saturates() {
        assert_eq!(SignalValue::from_f64(SignalType::I32, 2.6), SignalValue::I32(3));
        assert_eq!(
            SignalValue::from_f64(SignalType::I32, 1e12),
            SignalValue::I32(i32::MAX)
        );
        assert_eq!(SignalValue::from_f64(SignalType::Bool, 0.0), SignalValue::Bool(false));
        assert_eq!(SignalValue::from_f64(SignalType::Bool, -0.5), SignalValue::Bool(true));
        assert_eq!(SignalValue::Bool(true).as_f64(), 1.0);
    }

    #[test]
    fn qualified_names_split_at_first_dot() {
        assert_eq!(split_qualified("a.x"), Some(("a", "x")));
        assert_eq!(
            split_qualified("vehicle.position.z"),
            Some(("vehicle", "position.z"))
        );
        assert_eq!(split_qualified("nodot"), None);
        assert_eq!(split_qualified(".x"), None);
        assert_eq!(split_qualified("a."), None);
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("x", MAX_SIGNAL_NAME_LEN).is_ok());
        assert!(validate_name("", MAX_SIGNAL_NAME_LEN).is_err());
        assert!(validate_name("has space", MAX_SIGNAL_NAME_LEN).is_err());
        let long = "x".repeat(MAX_SIGNAL_NAME_LEN + 1);
        assert!(validate_name(&long, MAX_SIGNAL_NAME_LEN).is_err());
        let exact = "x".repeat(MAX_SIGNAL_NAME_LEN);
        assert!(validate_name(&exact, MAX_SIGNAL_NAME_LEN).is_ok());
    }

    #[test]
    fn writable_flag_helper() {
        assert!(SignalFlags::writable(true).contains(SignalFlags::WRITABLE));
        assert!(!SignalFlags::writable(false).contains(SignalFlags::WRITABLE));
    }
}
