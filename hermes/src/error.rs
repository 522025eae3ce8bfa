//! Supervisor error type.

use hermes_common::config::ConfigError;
use hermes_common::protocol::Command;
use hermes_common::shm::SegmentError;
use hermes_common::signal::{AccessError, RegistrationError};
use hermes_common::watchdog::WatchdogError;
use thiserror::Error;

/// Errors that end or refuse a supervisor operation.
///
/// Module-level faults under the `continue` policy are not errors: they are
/// recorded as [`FaultReport`](crate::report::FaultReport)s and the run goes
/// on without the module.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Segment creation failed; the run cannot start.
    #[error(transparent)]
    Segment(#[from] SegmentError),

    /// A configuration-declared signal could not be pre-registered.
    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Watchdog(#[from] WatchdogError),

    /// A wire failed validation after STAGE.
    #[error("wire {src} -> {dst}: {reason}")]
    Wiring {
        src: String,
        dst: String,
        reason: String,
    },

    /// The operation is not legal in the current run state.
    #[error("cannot {command} while {state}")]
    InvalidTransition { command: Command, state: String },

    /// STEP requested while the run is paused.
    #[error("simulation is paused")]
    Paused,

    /// No module is left to drive the barrier.
    #[error("all modules faulted at frame {frame}, run stalled")]
    Stalled { frame: u64 },

    /// A module faulted under the `abort` policy.
    #[error("module {module} faulted at frame {frame}: {cause}")]
    ModuleFaulted {
        module: String,
        frame: u64,
        cause: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;
