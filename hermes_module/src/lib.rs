//! Hermes Module Runtime Client
//!
//! The library linked into each module process. It attaches to the
//! supervisor's segment, exposes the command-processing state machine and
//! gives module code typed access to the signal table.
//!
//! # Usage
//!
//! ```rust,no_run
//! use hermes_module::{Module, ModuleContext, ModuleResult};
//! use hermes_common::signal::SignalType;
//!
//! struct Counter;
//!
//! impl Module for Counter {
//!     fn stage(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
//!         ctx.register_signal("count", SignalType::I64, false)?;
//!         Ok(())
//!     }
//!
//!     fn step(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
//!         ctx.set_signal("count", ctx.frame() as i64 + 1)?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> ModuleResult<()> {
//!     hermes_module::init_tracing();
//!     let mut ctx = ModuleContext::from_args()?;
//!     ctx.run(&mut Counter)
//! }
//! ```

pub mod context;
pub mod error;
pub mod handler;

pub use context::ModuleContext;
pub use error::{ModuleError, ModuleResult};
pub use handler::Module;

use tracing_subscriber::EnvFilter;

/// Initialise compact tracing output for a module process.
///
/// Honours `RUST_LOG`, defaulting to `info`. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}
