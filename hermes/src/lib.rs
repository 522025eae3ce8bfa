//! # Hermes Orchestrator
//!
//! The supervisor side of the protocol: creates the shared memory segment,
//! spawns module processes with the `(segment_name, config_path)` contract,
//! and advances all modules one frame at a time through the step barrier.
//!
//! ```rust,no_run
//! use hermes::{Scheduler, Supervisor};
//! use hermes_common::config::RunConfig;
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RunConfig::from_file(Path::new("run.toml"))?;
//!     let scheduler = Scheduler::new(&config.execution);
//!     let mut supervisor = Supervisor::new(config)?;
//!     supervisor.spawn_all()?;
//!     supervisor.await_attached()?;
//!     supervisor.stage()?;
//!     scheduler.run(&mut supervisor)?;
//!     supervisor.terminate()?;
//!     Ok(())
//! }
//! ```

pub mod barrier;
pub mod error;
pub mod handle;
pub mod process;
pub mod report;
pub mod router;
pub mod scheduler;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use handle::{ModuleHandle, ModuleState};
pub use report::{FaultKind, FaultReport, RunReport};
pub use scheduler::{Request, Scheduler};
pub use supervisor::Supervisor;
