//! Error type returned to module code by the runtime client.

use hermes_common::protocol::{LivenessError, ProtocolError};
use hermes_common::shm::SegmentError;
use hermes_common::signal::{AccessError, RegistrationError};
use thiserror::Error;

/// Everything a runtime client call can fail with.
///
/// Registration and access errors are locally recoverable. Protocol errors
/// mean the module broke the command discipline; liveness errors mean the
/// supervisor is gone.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("supervisor: {0}")]
    Liveness(#[from] LivenessError),

    /// Wrong process arguments or environment.
    #[error("usage: {0}")]
    Usage(String),

    /// Failure inside module business logic.
    #[error("module error: {0}")]
    Other(String),
}

/// Result alias for runtime client operations.
pub type ModuleResult<T> = Result<T, ModuleError>;
