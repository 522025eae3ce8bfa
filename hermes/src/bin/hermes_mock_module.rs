//! Scriptable stand-in module for exercising the supervisor end to end.
//!
//! Spawned like any module: `hermes_mock_module <segment_name> <config_path>`
//! with `HERMES_MODULE` naming it. The config (TOML, optional) declares the
//! outputs to publish and the misbehaviour to inject:
//!
//! ```toml
//! step_delay_ms = 5
//! crash_at_frame = 40            # exit(3) in the middle of STEP 40
//! terminate_delay_ms = 200       # before acknowledging TERMINATE
//! linger_after_terminate_ms = 0  # after acknowledging, before exiting
//! exit_code_on_terminate = 7     # exit code once TERMINATE is done
//! inputs = ["plant.y"]           # logged at debug every step
//!
//! [[outputs]]
//! name = "u"
//! type = "f64"
//! increment = 0.5                # u = (frame + 1) * increment
//! ```

use std::path::Path;
use std::process;
use std::thread;
use std::time::Duration;

use hermes_common::config::ConfigLoader;
use hermes_common::signal::{SignalFlags, SignalRef, SignalType, SignalValue};
use hermes_module::{Module, ModuleContext, ModuleError, ModuleResult};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct OutputConfig {
    name: String,
    #[serde(rename = "type", default = "default_type")]
    kind: SignalType,
    #[serde(default = "default_increment")]
    increment: f64,
    #[serde(default)]
    writable: bool,
}

fn default_type() -> SignalType {
    SignalType::F64
}

fn default_increment() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct MockConfig {
    #[serde(default)]
    outputs: Vec<OutputConfig>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    step_delay_ms: u64,
    hang_at_frame: Option<u64>,
    crash_at_frame: Option<u64>,
    fault_at_frame: Option<u64>,
    exit_code_on_terminate: Option<i32>,
    #[serde(default)]
    terminate_delay_ms: u64,
    #[serde(default)]
    linger_after_terminate_ms: u64,
}

struct MockModule {
    config: MockConfig,
    outputs: Vec<(SignalRef, f64)>,
    inputs: Vec<SignalRef>,
}

impl Module for MockModule {
    fn stage(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
        for out in &self.config.outputs {
            let sref = ctx.register_signal_with(
                &out.name,
                out.kind.zero(),
                SignalFlags::writable(out.writable),
            )?;
            self.outputs.push((sref, out.increment));
        }
        info!("{}: {} output(s) registered", ctx.name(), self.outputs.len());
        Ok(())
    }

    fn step(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
        let frame = ctx.frame();
        if self.config.crash_at_frame == Some(frame) {
            warn!("{}: crashing at frame {frame}", ctx.name());
            process::exit(3);
        }
        if self.config.hang_at_frame == Some(frame) {
            warn!("{}: hanging at frame {frame}", ctx.name());
            loop {
                thread::sleep(Duration::from_secs(1));
            }
        }
        if self.config.fault_at_frame == Some(frame) {
            return Err(ModuleError::Other(format!("injected fault at frame {frame}")));
        }

        // Inputs resolve lazily: other modules' signals exist only after STAGE.
        if self.inputs.len() != self.config.inputs.len() {
            self.inputs = self
                .config
                .inputs
                .iter()
                .map(|name| ctx.signal(name))
                .collect::<Result<_, _>>()?;
        }
        for (name, sref) in self.config.inputs.iter().zip(&self.inputs) {
            debug!("{}: frame {frame} {name} = {}", ctx.name(), ctx.read(*sref)?);
        }

        if self.config.step_delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.config.step_delay_ms));
        }
        for &(sref, increment) in &self.outputs {
            let value = (frame + 1) as f64 * increment;
            ctx.write(sref, SignalValue::from_f64(sref.kind, value))?;
        }
        Ok(())
    }

    fn reset(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
        info!("{}: reset (generation {})", ctx.name(), ctx.generation());
        Ok(())
    }

    fn terminate(&mut self, ctx: &mut ModuleContext) -> ModuleResult<()> {
        if self.config.terminate_delay_ms > 0 {
            debug!("{}: delaying TERMINATE by {} ms", ctx.name(), self.config.terminate_delay_ms);
            thread::sleep(Duration::from_millis(self.config.terminate_delay_ms));
        }
        Ok(())
    }
}

fn load_config(path: &Path) -> ModuleResult<MockConfig> {
    if path.as_os_str().is_empty() {
        return Ok(MockConfig::default());
    }
    MockConfig::load(path).map_err(|e| ModuleError::Usage(format!("{}: {e}", path.display())))
}

/// Serve the supervisor until TERMINATE. Returns the exit code to use.
fn run() -> ModuleResult<i32> {
    let mut ctx = ModuleContext::from_args()?;
    let config = load_config(ctx.config_path())?;
    let mut module = MockModule {
        config,
        outputs: Vec::new(),
        inputs: Vec::new(),
    };
    ctx.run(&mut module)?;
    drop(ctx);
    if module.config.linger_after_terminate_ms > 0 {
        thread::sleep(Duration::from_millis(module.config.linger_after_terminate_ms));
    }
    Ok(module.config.exit_code_on_terminate.unwrap_or(0))
}

fn main() {
    hermes_module::init_tracing();
    match run() {
        Ok(0) => {}
        Ok(code) => {
            warn!("exiting with code {code} after TERMINATE");
            process::exit(code);
        }
        Err(e) => {
            error!("FATAL: {e}");
            process::exit(1);
        }
    }
}
