//! Fault and run reports.
//!
//! Faults are reported with the module name, the last frame it settled and
//! the cause. The run report is the JSON document written by
//! `hermes run --report <path>`.

use serde::Serialize;
use std::fmt;
use std::path::Path;

use hermes_common::signal::SignalInfo;

use crate::handle::ModuleState;

/// How a module left the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The process could not be started.
    Spawn,
    /// No completion before the deadline.
    Timeout,
    /// The process exited without answering.
    ProcessExit,
    /// The module broke the command/completion discipline.
    Protocol,
    /// The module itself posted FAULT.
    Reported,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Spawn => "spawn failure",
            Self::Timeout => "timeout",
            Self::ProcessExit => "process exit",
            Self::Protocol => "protocol violation",
            Self::Reported => "module-reported fault",
        };
        f.write_str(s)
    }
}

/// One module fault.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaultReport {
    pub module: String,
    /// Frame being executed when the fault was detected.
    pub frame: u64,
    /// Last frame the module settled, if any.
    pub last_good_frame: Option<u64>,
    pub kind: FaultKind,
    pub cause: String,
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} at frame {}", self.module, self.kind, self.frame)?;
        match self.last_good_frame {
            Some(good) => write!(f, " (last good frame {good})")?,
            None => f.write_str(" (no frame settled)")?,
        }
        write!(f, ": {}", self.cause)
    }
}

/// Final state of one module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSummary {
    pub name: String,
    pub state: ModuleState,
    pub pid: Option<u32>,
    pub last_ack_frame: Option<u64>,
}

/// Summary of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub segment: String,
    pub frames: u64,
    pub time: f64,
    pub generation: u64,
    pub modules: Vec<ModuleSummary>,
    /// Final committed values.
    pub signals: Vec<SignalInfo>,
    pub faults: Vec<FaultReport>,
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the report as pretty JSON.
    pub fn write_json(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}
