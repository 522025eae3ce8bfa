//! Command dispatch loop for module implementations.

use hermes_common::protocol::Command;
use tracing::{info, warn};

use crate::context::ModuleContext;
use crate::error::ModuleResult;

/// Module business logic driven by [`ModuleContext::run`].
///
/// Every callback runs before the runtime client answers the command, so
/// signals may be registered in [`stage`](Module::stage) and outputs must
/// be written by the end of [`step`](Module::step). Returning an error
/// reports a fault to the supervisor and ends the loop.
pub trait Module {
    /// One-time setup; the registry closes right after it returns.
    fn stage(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Compute one frame. `ctx.dt()` and `ctx.frame()` describe it.
    fn step(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()>;

    /// Return to initial state. Signal values are already reset to their
    /// registration-time defaults by the supervisor.
    fn reset(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn pause(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn resume(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Last chance to flush state before the process exits.
    fn terminate(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
        let _ = ctx;
        Ok(())
    }
}

impl ModuleContext {
    /// Serve commands until TERMINATE has been acknowledged.
    pub fn run<M: Module + ?Sized>(&mut self, module: &mut M) -> ModuleResult<()> {
        loop {
            let msg = self.wait_command()?;
            let outcome = match msg.command {
                Command::None => continue,
                Command::Stage => module.stage(self),
                Command::Step => module.step(self),
                Command::Reset => module.reset(self),
                Command::Pause => module.pause(self),
                Command::Resume => module.resume(self),
                Command::Terminate => module.terminate(self),
            };

            if let Err(e) = outcome {
                warn!("{}: {} failed at frame {}: {e}", self.name(), msg.command, msg.frame);
                if let Err(report) = self.signal_fault() {
                    warn!("{}: could not report fault: {report}", self.name());
                }
                return Err(e);
            }

            match msg.command {
                Command::Step => self.signal_done()?,
                _ => self.ack()?,
            }
            if msg.command == Command::Terminate {
                info!("{}: terminated", self.name());
                return Ok(());
            }
        }
    }
}
