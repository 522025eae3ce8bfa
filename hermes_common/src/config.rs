//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! across all Hermes binaries, plus the run configuration consumed by the
//! orchestrator.
//!
//! # Usage
//!
//! ```rust,no_run
//! use hermes_common::config::{ConfigError, RunConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = RunConfig::from_file(Path::new("run.toml"))?;
//!     println!("Service: {}", config.shared.service_name);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::consts::{
    DEFAULT_ATTACH_TIMEOUT_MS, DEFAULT_COMMAND_TIMEOUT_MS, DEFAULT_RATE_HZ,
    DEFAULT_SIGNALS_PER_MODULE, DEFAULT_STEP_TIMEOUT_MS, DEFAULT_TERMINATE_GRACE_MS,
    MAX_MODULE_NAME_LEN, MAX_MODULES, MAX_SIGNAL_NAME_LEN, MAX_SIGNALS_PER_MODULE,
    NANOS_PER_SECOND,
};
use crate::signal::{
    SignalFlags, SignalInfo, SignalType, SignalValue, split_qualified, validate_name,
};

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Directive string for `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Common configuration fields shared across all Hermes binaries.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "hermes-sim-01"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Any serde-deserializable struct can use ConfigLoader.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}

// ─── Run configuration ──────────────────────────────────────────────

/// Shared memory segment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentConfig {
    /// POSIX segment name; defaults to `/hermes_<pid>`.
    #[serde(default)]
    pub name: Option<String>,

    /// Signal slots reserved per module.
    #[serde(default = "default_signals_per_module")]
    pub signals_per_module: u32,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            name: None,
            signals_per_module: DEFAULT_SIGNALS_PER_MODULE,
        }
    }
}

fn default_signals_per_module() -> u32 {
    DEFAULT_SIGNALS_PER_MODULE
}

/// How the scheduler paces frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Paced to wall-clock time.
    Realtime,
    /// As fast as possible.
    #[default]
    Afap,
    /// Frames advance only on explicit request.
    SingleFrame,
}

/// Simulation timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Frame rate; must produce an integer microsecond timestep.
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,

    /// Stop after this much simulated time (seconds).
    #[serde(default)]
    pub end_time: Option<f64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            rate_hz: DEFAULT_RATE_HZ,
            end_time: None,
        }
    }
}

fn default_rate_hz() -> f64 {
    DEFAULT_RATE_HZ
}

impl ExecutionConfig {
    /// Timestep in integer nanoseconds.
    pub fn dt_ns(&self) -> u64 {
        (NANOS_PER_SECOND as f64 / self.rate_hz).round() as u64
    }

    /// Timestep in seconds.
    pub fn dt(&self) -> f64 {
        self.dt_ns() as f64 / NANOS_PER_SECOND as f64
    }

    /// Number of frames needed to reach `end_time`, if set.
    pub fn end_frame(&self) -> Option<u64> {
        let end_ns = (self.end_time? * NANOS_PER_SECOND as f64).round() as u64;
        let dt_ns = self.dt_ns().max(1);
        Some(end_ns.div_ceil(dt_ns))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.rate_hz.is_finite() && self.rate_hz > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "execution.rate_hz must be positive, got {}",
                self.rate_hz
            )));
        }
        let dt_us = 1_000_000.0 / self.rate_hz;
        if (dt_us - dt_us.round()).abs() > 1e-9 || dt_us.round() < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "execution.rate_hz={} does not produce an integer microsecond timestep",
                self.rate_hz
            )));
        }
        if let Some(end) = self.end_time {
            if !(end.is_finite() && end > 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "execution.end_time must be positive, got {end}"
                )));
            }
        }
        Ok(())
    }
}

/// What the supervisor does when a module faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultPolicy {
    /// Exclude the module from later barriers; its values stay frozen.
    #[default]
    Continue,
    /// End the run on the first fault.
    Abort,
}

/// Supervisor timeouts and fault policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    #[serde(default = "default_attach_timeout_ms")]
    pub attach_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default)]
    pub fault_policy: FaultPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            attach_timeout_ms: DEFAULT_ATTACH_TIMEOUT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            step_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
            terminate_grace_ms: DEFAULT_TERMINATE_GRACE_MS,
            fault_policy: FaultPolicy::default(),
        }
    }
}

fn default_attach_timeout_ms() -> u64 {
    DEFAULT_ATTACH_TIMEOUT_MS
}
fn default_command_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}
fn default_step_timeout_ms() -> u64 {
    DEFAULT_STEP_TIMEOUT_MS
}
fn default_terminate_grace_ms() -> u64 {
    DEFAULT_TERMINATE_GRACE_MS
}

impl SupervisorConfig {
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("attach_timeout_ms", self.attach_timeout_ms),
            ("command_timeout_ms", self.command_timeout_ms),
            ("step_timeout_ms", self.step_timeout_ms),
            ("terminate_grace_ms", self.terminate_grace_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "supervisor.{field} must be non-zero"
                )));
            }
        }
        Ok(())
    }
}

/// A signal declared in configuration and pre-registered by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignalConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SignalType,
    #[serde(default)]
    pub writable: bool,
    #[serde(default = "default_true")]
    pub published: bool,
    #[serde(default)]
    pub unit: String,
    /// Registration-time default, converted to the declared type.
    #[serde(default)]
    pub initial: Option<f64>,
}

fn default_true() -> bool {
    true
}

impl SignalConfig {
    pub fn flags(&self) -> SignalFlags {
        let mut flags = SignalFlags::empty();
        flags.set(SignalFlags::WRITABLE, self.writable);
        flags.set(SignalFlags::PUBLISHED, self.published);
        flags
    }

    pub fn default_value(&self) -> SignalValue {
        self.initial
            .map_or(self.kind.zero(), |v| SignalValue::from_f64(self.kind, v))
    }
}

/// One module of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleConfig {
    pub name: String,
    /// Executable to spawn; `None` for modules attached by other means.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Opaque module configuration passed as the second argument.
    #[serde(default)]
    pub config: Option<PathBuf>,
    #[serde(default)]
    pub signals: Vec<SignalConfig>,
}

/// A signal connection applied between frames: `dst = src * gain + offset`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WireConfig {
    pub src: String,
    pub dst: String,
    #[serde(default = "default_gain")]
    pub gain: f64,
    #[serde(default)]
    pub offset: f64,
}

fn default_gain() -> f64 {
    1.0
}

/// Complete orchestrator configuration.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// service_name = "hermes"
///
/// [execution]
/// mode = "afap"
/// rate_hz = 100.0
/// end_time = 1.0
///
/// [[modules]]
/// name = "plant"
/// executable = "bin/plant"
/// config = "plant.toml"
///
/// [[modules.signals]]
/// name = "x"
/// type = "f64"
/// writable = true
///
/// [[wiring]]
/// src = "plant.x"
/// dst = "ctrl.x_meas"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub shared: SharedConfig,
    #[serde(default)]
    pub segment: SegmentConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    pub modules: Vec<ModuleConfig>,
    #[serde(default)]
    pub wiring: Vec<WireConfig>,
}

impl RunConfig {
    /// Load, resolve relative paths against the file's directory, validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        if let Some(dir) = path.parent() {
            config.resolve_paths(dir);
        }
        config.validate()?;
        Ok(config)
    }

    /// Make relative `executable` and `config` paths absolute against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for module in &mut self.modules {
            if let Some(exe) = module.executable.as_mut() {
                resolve(exe);
            }
            if let Some(cfg) = module.config.as_mut() {
                resolve(cfg);
            }
        }
    }

    /// Module names in declaration order.
    pub fn module_names(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.name.as_str()).collect()
    }

    /// Declared unit of `module.signal`, if the signal is declared here
    /// with a non-empty unit.
    pub fn signal_unit(&self, module: &str, signal: &str) -> Option<&str> {
        self.modules
            .iter()
            .find(|m| m.name == module)?
            .signals
            .iter()
            .find(|s| s.name == signal && !s.unit.is_empty())
            .map(|s| s.unit.as_str())
    }

    /// Fill in the unit of every listed signal declared in this config.
    pub fn annotate_units(&self, signals: &mut [SignalInfo]) {
        for info in signals {
            if let Some(unit) = self.signal_unit(info.module.as_str(), info.name.as_str()) {
                info.unit = Some(unit.to_string());
            }
        }
    }

    /// Validate the whole configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));

        self.shared.validate()?;
        self.execution.validate()?;
        self.supervisor.validate()?;

        if self.modules.is_empty() {
            return invalid("at least one module is required".into());
        }
        if self.modules.len() > MAX_MODULES {
            return invalid(format!(
                "{} modules exceed the limit of {MAX_MODULES}",
                self.modules.len()
            ));
        }
        let spm = self.segment.signals_per_module;
        if spm == 0 || spm > MAX_SIGNALS_PER_MODULE {
            return invalid(format!(
                "segment.signals_per_module must be in 1..={MAX_SIGNALS_PER_MODULE}, got {spm}"
            ));
        }
        if let Some(name) = &self.segment.name {
            if !name.starts_with('/') || name.len() < 2 {
                return invalid(format!("segment.name {name:?} must look like \"/name\""));
            }
        }

        let mut names = HashSet::new();
        for module in &self.modules {
            if let Err(reason) = validate_name(&module.name, MAX_MODULE_NAME_LEN) {
                return invalid(format!("module {:?}: {reason}", module.name));
            }
            if module.name.contains('.') {
                return invalid(format!("module {:?}: name contains '.'", module.name));
            }
            if !names.insert(module.name.as_str()) {
                return invalid(format!("duplicate module name {:?}", module.name));
            }
            if module.signals.len() > spm as usize {
                return invalid(format!(
                    "module {:?} declares {} signals, only {spm} slots",
                    module.name,
                    module.signals.len()
                ));
            }
            let mut signals = HashSet::new();
            for signal in &module.signals {
                if let Err(reason) = validate_name(&signal.name, MAX_SIGNAL_NAME_LEN) {
                    return invalid(format!("signal {}.{}: {reason}", module.name, signal.name));
                }
                if !signals.insert(signal.name.as_str()) {
                    return invalid(format!(
                        "duplicate signal {}.{}",
                        module.name, signal.name
                    ));
                }
            }
        }

        for wire in &self.wiring {
            for endpoint in [&wire.src, &wire.dst] {
                let Some((module, _)) = split_qualified(endpoint) else {
                    return invalid(format!(
                        "wire endpoint {endpoint:?} is not of the form module.signal"
                    ));
                };
                if !names.contains(module) {
                    return invalid(format!("wire endpoint {endpoint:?} names unknown module"));
                }
            }
            if !(wire.gain.is_finite() && wire.offset.is_finite()) {
                return invalid(format!("wire {} -> {} has non-finite gain/offset", wire.src, wire.dst));
            }
        }
        Ok(())
    }
}
