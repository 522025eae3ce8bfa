//! Supervisor-side module handles and the per-module state machine.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

use hermes_common::platform;
use hermes_common::protocol::Command;
use hermes_common::signal::ModuleId;
use tracing::{debug, error};

use crate::process::ModuleProcess;
use crate::report::{FaultKind, FaultReport};

/// Supervisor's view of one module.
///
/// `SPAWNING → ATTACHED → STAGED → READY ⇄ RUNNING`, `READY|RUNNING → PAUSED
/// ⇄ READY`, any attached state `→ TERMINATED`, any non-terminal state
/// `→ FAULTED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModuleState {
    Spawning,
    Attached,
    Staged,
    Ready,
    Running,
    Paused,
    Faulted,
    Terminated,
}

impl ModuleState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Faulted | Self::Terminated)
    }

    /// Legal transitions driven by a command.
    ///
    /// Returns the state held while the command is outstanding and the
    /// state entered once the module answers it, or `None` if the command
    /// may not be sent from `self`.
    pub const fn transition(self, command: Command) -> Option<(Self, Self)> {
        use ModuleState::*;
        match (command, self) {
            (Command::Stage, Attached) => Some((Staged, Ready)),
            (Command::Step, Ready) => Some((Running, Ready)),
            (Command::Reset, Staged | Ready | Running | Paused) => Some((Staged, Ready)),
            (Command::Pause, Ready | Running) => Some((Paused, Paused)),
            (Command::Resume, Paused) => Some((Paused, Ready)),
            (Command::Terminate, Attached | Staged | Ready | Running | Paused) => {
                Some((self, Terminated))
            }
            _ => None,
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawning => "SPAWNING",
            Self::Attached => "ATTACHED",
            Self::Staged => "STAGED",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Faulted => "FAULTED",
            Self::Terminated => "TERMINATED",
        };
        f.write_str(s)
    }
}

/// The single command a module has not answered yet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Pending {
    pub command: Command,
    pub seq: u32,
    pub frame: u64,
    pub generation: u64,
    /// State entered on a valid completion.
    pub after: ModuleState,
}

/// Supervisor-owned record of one module.
#[derive(Debug)]
pub struct ModuleHandle {
    id: ModuleId,
    name: String,
    executable: Option<PathBuf>,
    config_path: PathBuf,
    pub(crate) state: ModuleState,
    pub(crate) last_ack_frame: Option<u64>,
    /// Completion count already consumed from the module's slot.
    pub(crate) seen_count: u32,
    pub(crate) pending: Option<Pending>,
    pub(crate) fault: Option<FaultReport>,
    pub(crate) process: Option<ModuleProcess>,
    pub(crate) pid: Option<u32>,
}

impl ModuleHandle {
    pub fn new(
        id: ModuleId,
        name: impl Into<String>,
        executable: Option<PathBuf>,
        config_path: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            executable,
            config_path: config_path.unwrap_or_default(),
            state: ModuleState::Spawning,
            last_ack_frame: None,
            seen_count: 0,
            pending: None,
            fault: None,
            process: None,
            pid: None,
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn last_ack_frame(&self) -> Option<u64> {
        self.last_ack_frame
    }

    pub fn fault(&self) -> Option<&FaultReport> {
        self.fault.as_ref()
    }

    /// OS process id, once spawned or attached.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn executable(&self) -> Option<&Path> {
        self.executable.as_deref()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Whether the module still takes part in the run.
    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    pub(crate) fn set_state(&mut self, next: ModuleState) {
        if self.state != next {
            debug!("{}: {} -> {}", self.name, self.state, next);
            self.state = next;
        }
    }

    /// Exit code once the module process is gone.
    ///
    /// Spawned children are reaped; modules attached by other means are
    /// checked through the pid they published in the segment.
    pub(crate) fn poll_exit(&mut self, attached_pid: u32) -> Option<Option<i32>> {
        if let Some(process) = self.process.as_mut() {
            return process.try_exit();
        }
        if attached_pid != 0 && !platform::is_process_alive(attached_pid) {
            return Some(None);
        }
        None
    }

    /// Move to FAULTED and record why. Returns the report.
    pub(crate) fn mark_faulted(&mut self, frame: u64, kind: FaultKind, cause: String) -> FaultReport {
        let report = FaultReport {
            module: self.name.clone(),
            frame,
            last_good_frame: self.last_ack_frame,
            kind,
            cause,
        };
        error!("Module fault: {report}");
        self.set_state(ModuleState::Faulted);
        self.pending = None;
        self.fault = Some(report.clone());
        report
    }
}
