//! Prelude module for common re-exports.
//!
//! ```rust
//! use hermes_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, ExecutionMode, FaultPolicy, LogLevel, RunConfig, SharedConfig,
};

// ─── Signals ────────────────────────────────────────────────────────
pub use crate::signal::{
    AccessError, ModuleId, RegistrationError, SignalFlags, SignalInfo, SignalRef, SignalType,
    SignalValue,
};

// ─── Control channel ────────────────────────────────────────────────
pub use crate::protocol::{
    Command, CompletionMessage, CompletionStatus, ControlMessage, LivenessError, ProtocolError,
};

// ─── Shared memory ──────────────────────────────────────────────────
pub use crate::shm::{Accessor, Segment, SegmentError, SegmentSpec};

// ─── Supervision ────────────────────────────────────────────────────
pub use crate::watchdog::{HealthStatus, Watchdog, WatchdogError};
