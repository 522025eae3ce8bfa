//! # Watchdog Trait
//!
//! Supervisor contract for module process lifecycle management. The
//! `hermes` orchestrator implements it to spawn modules with the
//! two-argument process contract, check their health and drain them on
//! shutdown.

use crate::signal::ModuleId;
use std::time::Duration;

/// Health status returned by [`Watchdog::health_check`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Process alive and answering commands.
    Healthy,
    /// Process alive but missed a completion deadline.
    Unresponsive {
        /// Last frame the module settled, if any.
        last_frame: Option<u64>,
    },
    /// Module process has exited.
    Dead {
        /// Exit code if available.
        exit_code: Option<i32>,
    },
    /// Module was never started or is not being tracked.
    Unknown,
}

/// Error type for watchdog operations.
#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    /// Failed to spawn the requested module.
    #[error("failed to spawn {module}: {reason}")]
    SpawnFailed { module: String, reason: String },

    /// Module did not attach within the expected timeout.
    #[error("{module} not attached after {timeout:?}")]
    AttachTimeout { module: String, timeout: Duration },

    /// No module with this id or name is managed.
    #[error("unknown module {0}")]
    UnknownModule(String),

    /// Generic I/O or system error.
    #[error("watchdog error: {0}")]
    Other(String),
}

/// Supervisor contract for module process lifecycle management.
///
/// # Example
///
/// ```rust,ignore
/// impl Watchdog for Supervisor {
///     fn spawn_module(&mut self, module: ModuleId) -> Result<u32, WatchdogError> { /* ... */ }
///     fn health_check(&mut self, module: ModuleId) -> HealthStatus { /* ... */ }
///     fn shutdown_all(&mut self) -> Result<(), WatchdogError> { /* ... */ }
/// }
/// ```
pub trait Watchdog {
    /// Spawn a module process.
    ///
    /// The process receives exactly two positional arguments,
    /// `(segment_name, config_path)`. Returns the OS PID on success.
    fn spawn_module(&mut self, module: ModuleId) -> Result<u32, WatchdogError>;

    /// Query the health of a managed module.
    ///
    /// Takes `&mut self` because reaping an exited child updates state.
    fn health_check(&mut self, module: ModuleId) -> HealthStatus;

    /// Drain all modules in reverse-startup order.
    ///
    /// Expected sequence:
    /// 1. Send TERMINATE to each live module and wait for the ack.
    /// 2. Wait up to the grace period for the process to exit.
    /// 3. Escalate SIGTERM, then SIGKILL, for unresponsive processes.
    fn shutdown_all(&mut self) -> Result<(), WatchdogError>;
}
