//! Hermes Common Library
//!
//! This crate provides everything both sides of the Hermes protocol share:
//! the fixed shared memory layout, the signal registry, the command and
//! completion mailboxes, protocol error types and configuration loading.
//!
//! # Module Structure
//!
//! - [`signal`] - Signal types, values, flags and registry/access errors
//! - [`protocol`] - Commands, completion status, protocol/liveness errors
//! - [`shm`] - Segment layout, creation/attach, mailboxes, futex wake
//! - [`config`] - Configuration loading traits and run configuration
//! - [`platform`] - Process liveness helpers
//! - [`watchdog`] - Supervisor contract for module lifecycle management
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use hermes_common::prelude::*;
//! use hermes_common::config::{ConfigLoader, RunConfig};
//! ```

pub mod config;
pub mod consts;
pub mod platform;
pub mod prelude;
pub mod protocol;
pub mod shm;
pub mod signal;
pub mod watchdog;
