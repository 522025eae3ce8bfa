//! # Orchestrator Supervisor
//!
//! Owns the segment for the whole run, spawns and monitors module
//! processes, and drives every module through the control channel. Each
//! call issues one command round through the [`Barrier`] and then applies
//! the configured fault policy to whatever faulted during the round.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use hermes_common::config::{FaultPolicy, RunConfig};
use hermes_common::consts::{NANOS_PER_SECOND, SHM_PREFIX};
use hermes_common::platform;
use hermes_common::protocol::{Command, ControlMessage};
use hermes_common::shm::{Accessor, Segment, SegmentSpec};
use hermes_common::signal::{AccessError, ModuleId, SignalInfo, SignalValue};
use hermes_common::watchdog::{HealthStatus, Watchdog, WatchdogError};
use tracing::{debug, error, info, warn};

use crate::barrier::{Barrier, Round};
use crate::error::{SupervisorError, SupervisorResult};
use crate::handle::{ModuleHandle, ModuleState};
use crate::process::ModuleProcess;
use crate::report::{FaultKind, FaultReport, ModuleSummary, RunReport};
use crate::router::WireRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Staged,
    Terminated,
}

impl Phase {
    const fn describe(self) -> &'static str {
        match self {
            Self::Starting => "not staged",
            Self::Staged => "staged",
            Self::Terminated => "terminated",
        }
    }
}

/// The central authority of a simulation run.
pub struct Supervisor {
    config: RunConfig,
    segment: Segment,
    handles: Vec<ModuleHandle>,
    router: WireRouter,
    frame: u64,
    dt_ns: u64,
    phase: Phase,
    paused: bool,
    faults: Vec<FaultReport>,
}

impl Supervisor {
    /// Create the segment and pre-register configuration-declared signals.
    ///
    /// # Errors
    ///
    /// Segment creation failures are fatal: the run cannot start.
    pub fn new(config: RunConfig) -> SupervisorResult<Self> {
        config.validate()?;
        let name = config
            .segment
            .name
            .clone()
            .unwrap_or_else(|| format!("{SHM_PREFIX}{}", platform::current_pid()));
        let modules = config.module_names();
        let segment = Segment::create(&SegmentSpec {
            name: &name,
            modules: &modules,
            signals_per_module: config.segment.signals_per_module,
            dt: config.execution.dt(),
        })?;

        let mut handles = Vec::with_capacity(config.modules.len());
        for (id, module) in segment.module_ids().zip(&config.modules) {
            for signal in &module.signals {
                segment.register_signal(id, &signal.name, signal.default_value(), signal.flags())?;
            }
            handles.push(ModuleHandle::new(
                id,
                module.name.as_str(),
                module.executable.clone(),
                module.config.clone(),
            ));
        }

        let dt_ns = config.execution.dt_ns();
        info!(
            "Supervisor ready: segment {name}, {} module(s), dt={}ns",
            handles.len(),
            dt_ns
        );
        let supervisor = Self {
            config,
            segment,
            handles,
            router: WireRouter::default(),
            frame: 0,
            dt_ns,
            phase: Phase::Starting,
            paused: false,
            faults: Vec::new(),
        };
        supervisor.publish_clock();
        Ok(supervisor)
    }

    // ─── Lifecycle ──────────────────────────────────────────────────

    /// Spawn every module that has an executable. Modules without one are
    /// expected to attach by other means.
    pub fn spawn_all(&mut self) -> SupervisorResult<()> {
        self.require(Command::None, Phase::Starting)?;
        let mut faults = Vec::new();
        for index in 0..self.handles.len() {
            let handle = &self.handles[index];
            if handle.executable().is_none() || handle.process.is_some() {
                continue;
            }
            let id = handle.id();
            if let Err(e) = self.spawn_module(id) {
                faults.push(self.handles[index].mark_faulted(0, FaultKind::Spawn, e.to_string()));
            }
        }
        self.absorb(faults)
    }

    /// Wait for every spawning module to attach; stragglers fault.
    pub fn await_attached(&mut self) -> SupervisorResult<()> {
        self.require(Command::None, Phase::Starting)?;
        let timeout = self.config.supervisor.attach_timeout();
        let round = Barrier::new(&self.segment).await_attach(&mut self.handles, timeout);
        info!("{} module(s) attached", round.settled.len());
        self.absorb(round.faults)
    }

    /// STAGE every attached module, close all registries and compile wires.
    pub fn stage(&mut self) -> SupervisorResult<()> {
        self.require(Command::Stage, Phase::Starting)?;
        if self
            .handles
            .iter()
            .any(|h| h.state() == ModuleState::Spawning)
        {
            self.await_attached()?;
        }

        let round = self.exchange(Command::Stage, self.config.supervisor.command_timeout());
        for id in self.segment.module_ids() {
            self.segment.close_registry(id);
        }
        let staged = round.settled.len();
        self.absorb(round.faults)?;

        self.router = WireRouter::compile(&self.segment, &self.config.wiring)?;
        self.phase = Phase::Staged;
        self.frame = 0;
        self.publish_clock();
        info!("Staged {staged} module(s), {} signal(s) registered", self.segment.all_signals().len());
        Ok(())
    }

    /// Advance every READY module by one frame.
    ///
    /// Wires are routed and the clock is published before STEP goes out.
    /// Outputs of settled modules are committed and the frame advances
    /// only after the barrier round is over. Returns the new frame.
    pub fn step(&mut self) -> SupervisorResult<u64> {
        self.require(Command::Step, Phase::Staged)?;
        if self.paused {
            return Err(SupervisorError::Paused);
        }

        self.router.route(&self.segment)?;
        self.publish_clock();
        let round = self.exchange(Command::Step, self.config.supervisor.step_timeout());
        for id in &round.settled {
            self.segment.commit(*id);
        }
        debug!(
            "Frame {} settled by {} module(s), {} fault(s)",
            self.frame,
            round.settled.len(),
            round.faults.len()
        );
        let settled = round.settled.len();
        self.absorb(round.faults)?;
        if settled == 0 {
            return Err(SupervisorError::Stalled { frame: self.frame });
        }

        self.frame += 1;
        self.publish_clock();
        Ok(self.frame)
    }

    /// Restore defaults, rewind to frame 0 and start a new generation.
    pub fn reset(&mut self) -> SupervisorResult<()> {
        self.require(Command::Reset, Phase::Staged)?;
        for handle in self.handles.iter().filter(|h| h.is_live()) {
            self.segment.reset_to_defaults(handle.id());
        }
        self.frame = 0;
        let generation = self.segment.bump_generation();
        self.publish_clock();

        let round = self.exchange(Command::Reset, self.config.supervisor.command_timeout());
        self.paused = false;
        info!("Reset to frame 0, generation {generation}");
        self.absorb(round.faults)
    }

    /// Freeze frame and time. Idempotent.
    pub fn pause(&mut self) -> SupervisorResult<()> {
        self.require(Command::Pause, Phase::Staged)?;
        if self.paused {
            return Ok(());
        }
        let round = self.exchange(Command::Pause, self.config.supervisor.command_timeout());
        self.paused = true;
        info!("Paused at frame {}", self.frame);
        self.absorb(round.faults)
    }

    /// Leave the paused state. Idempotent.
    pub fn resume(&mut self) -> SupervisorResult<()> {
        self.require(Command::Resume, Phase::Staged)?;
        if !self.paused {
            return Ok(());
        }
        let round = self.exchange(Command::Resume, self.config.supervisor.command_timeout());
        self.paused = false;
        info!("Resumed at frame {}", self.frame);
        self.absorb(round.faults)
    }

    /// Drain all modules and reclaim their processes.
    ///
    /// Live modules get TERMINATE and `terminate_grace` to acknowledge and
    /// exit. Processes still running afterwards, and those of faulted
    /// modules, are escalated to SIGTERM and SIGKILL. Faulted handles stay
    /// FAULTED. A module that acknowledged TERMINATE but whose process then
    /// ends with anything other than exit code 0 is faulted as a process
    /// exit. Calling this again is a no-op.
    pub fn terminate(&mut self) -> SupervisorResult<()> {
        if self.phase == Phase::Terminated {
            return Ok(());
        }
        self.phase = Phase::Terminated;
        self.paused = false;

        // One grace window covers both the answer and the exit.
        let grace = self.config.supervisor.terminate_grace();
        let deadline = Instant::now() + grace;
        let round = self.exchange(Command::Terminate, grace);
        self.faults.extend(round.faults);

        let frame = self.frame;
        for handle in &mut self.handles {
            let clean = handle.state() == ModuleState::Terminated;
            if let Some(process) = handle.process.as_mut() {
                let wait = if clean {
                    deadline.saturating_duration_since(Instant::now())
                } else {
                    Duration::ZERO
                };
                let code = process.reclaim(wait);
                debug!("{} reclaimed, exit code {code:?}", handle.name());
                if clean && code != Some(0) {
                    let report = handle.mark_faulted(
                        frame,
                        FaultKind::ProcessExit,
                        format!("process exited with code {code:?} after TERMINATE"),
                    );
                    self.faults.push(report);
                }
            }
            if handle.state() == ModuleState::Spawning {
                handle.set_state(ModuleState::Terminated);
            }
        }
        info!(
            "Run terminated at frame {} ({} fault(s))",
            self.frame,
            self.faults.len()
        );
        Ok(())
    }

    // ─── Signals ────────────────────────────────────────────────────

    /// Committed value of a `module.signal`.
    pub fn read_signal(&self, qualified: &str) -> Result<SignalValue, AccessError> {
        let sref = self.segment.resolve(qualified)?;
        self.segment.read_signal(sref, Accessor::Supervisor)
    }

    /// External write; the target must be writable and of the same type.
    pub fn write_signal(
        &self,
        qualified: &str,
        value: impl Into<SignalValue>,
    ) -> Result<(), AccessError> {
        let sref = self.segment.resolve(qualified)?;
        self.segment
            .write_signal(sref, value.into(), Accessor::Supervisor)
    }

    /// Every registered signal with its committed value and declared unit.
    pub fn signals(&self) -> Vec<SignalInfo> {
        let mut signals = self.segment.all_signals();
        self.config.annotate_units(&mut signals);
        signals
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn handles(&self) -> &[ModuleHandle] {
        &self.handles
    }

    pub fn handle(&self, name: &str) -> Option<&ModuleHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Simulation time in integer nanoseconds.
    pub fn time_ns(&self) -> u64 {
        self.frame * self.dt_ns
    }

    pub fn time(&self) -> f64 {
        self.time_ns() as f64 / NANOS_PER_SECOND as f64
    }

    pub fn dt(&self) -> f64 {
        self.dt_ns as f64 / NANOS_PER_SECOND as f64
    }

    pub fn generation(&self) -> u64 {
        self.segment.header().generation()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    /// Every fault recorded so far, in detection order.
    pub fn faults(&self) -> &[FaultReport] {
        &self.faults
    }

    pub fn report(&self) -> RunReport {
        RunReport {
            segment: self.segment.name().to_string(),
            frames: self.frame,
            time: self.time(),
            generation: self.generation(),
            modules: self
                .handles
                .iter()
                .map(|h| ModuleSummary {
                    name: h.name().to_string(),
                    state: h.state(),
                    pid: h.pid(),
                    last_ack_frame: h.last_ack_frame(),
                })
                .collect(),
            signals: self.signals(),
            faults: self.faults.clone(),
        }
    }

    // ─── Internals ──────────────────────────────────────────────────

    fn require(&self, command: Command, phase: Phase) -> SupervisorResult<()> {
        if self.phase != phase {
            return Err(SupervisorError::InvalidTransition {
                command,
                state: format!("run is {}", self.phase.describe()),
            });
        }
        Ok(())
    }

    fn exchange(&mut self, command: Command, timeout: Duration) -> Round {
        let message = ControlMessage {
            command,
            frame: self.frame,
            dt: self.dt(),
            generation: self.generation(),
        };
        Barrier::new(&self.segment).exchange(&mut self.handles, message, timeout)
    }

    fn publish_clock(&self) {
        self.segment.set_clock(self.frame, self.time());
    }

    /// Record faults and apply the fault policy.
    fn absorb(&mut self, faults: Vec<FaultReport>) -> SupervisorResult<()> {
        let first = faults.first().cloned();
        self.faults.extend(faults);

        if let Some(fault) = first {
            if self.config.supervisor.fault_policy == FaultPolicy::Abort {
                return Err(SupervisorError::ModuleFaulted {
                    module: fault.module,
                    frame: fault.frame,
                    cause: fault.cause,
                });
            }
            warn!("Continuing without faulted module(s); their last values stay frozen");
        }
        if !self.handles.iter().any(ModuleHandle::is_live) {
            return Err(SupervisorError::Stalled { frame: self.frame });
        }
        Ok(())
    }
}

impl Watchdog for Supervisor {
    fn spawn_module(&mut self, module: ModuleId) -> Result<u32, WatchdogError> {
        let segment_name = self.segment.name();
        let handle = self
            .handles
            .get_mut(module.0 as usize)
            .ok_or_else(|| WatchdogError::UnknownModule(module.to_string()))?;
        if handle.state() != ModuleState::Spawning || handle.process.is_some() {
            return Err(WatchdogError::Other(format!(
                "{} already started ({})",
                handle.name(),
                handle.state()
            )));
        }
        let Some(executable) = handle.executable() else {
            return Err(WatchdogError::SpawnFailed {
                module: handle.name().to_string(),
                reason: "no executable configured".into(),
            });
        };
        let process =
            ModuleProcess::spawn(executable, handle.name(), segment_name, handle.config_path())?;
        let pid = process.pid();
        handle.pid = Some(pid);
        handle.process = Some(process);
        Ok(pid)
    }

    fn health_check(&mut self, module: ModuleId) -> HealthStatus {
        let Some(handle) = self.handles.get_mut(module.0 as usize) else {
            return HealthStatus::Unknown;
        };
        let attached_pid = self.segment.block(module).info.pid.load(Ordering::Acquire);
        if let Some(exit_code) = handle.poll_exit(attached_pid) {
            return HealthStatus::Dead { exit_code };
        }
        match handle.state() {
            ModuleState::Spawning if handle.process.is_none() => HealthStatus::Unknown,
            ModuleState::Faulted => HealthStatus::Unresponsive {
                last_frame: handle.last_ack_frame(),
            },
            ModuleState::Terminated => HealthStatus::Dead { exit_code: None },
            _ => HealthStatus::Healthy,
        }
    }

    fn shutdown_all(&mut self) -> Result<(), WatchdogError> {
        self.terminate()
            .map_err(|e| WatchdogError::Other(e.to_string()))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            error!("Shutdown failed: {e}");
        }
    }
}
