//! Control channel messages and protocol error types.
//!
//! The supervisor writes a [`ControlMessage`] into a module's command slot;
//! the module answers with a [`CompletionMessage`] in its completion slot.
//! Both tags are closed `#[repr(u32)]` enums decoded with `from_u32`.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Command sent from the supervisor to a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[repr(u32)]
pub enum Command {
    /// No command has been issued yet.
    #[default]
    None = 0,
    /// One-time setup; the ack closes the module's registry.
    Stage = 1,
    /// Execute one frame.
    Step = 2,
    /// Restore registration-time defaults and restart at frame 0.
    Reset = 3,
    /// Freeze; frame and time do not advance.
    Pause = 4,
    /// Leave the paused state.
    Resume = 5,
    /// Acknowledge, then exit.
    Terminate = 6,
}

impl Command {
    /// Convert from raw `u32` value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Stage),
            2 => Some(Self::Step),
            3 => Some(Self::Reset),
            4 => Some(Self::Pause),
            5 => Some(Self::Resume),
            6 => Some(Self::Terminate),
            _ => None,
        }
    }

    /// The completion status a well-behaved module answers with.
    pub const fn expected_completion(self) -> Option<CompletionStatus> {
        match self {
            Self::None => None,
            Self::Step => Some(CompletionStatus::Done),
            Self::Stage | Self::Reset | Self::Pause | Self::Resume | Self::Terminate => {
                Some(CompletionStatus::Ack)
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Stage => "STAGE",
            Self::Step => "STEP",
            Self::Reset => "RESET",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
            Self::Terminate => "TERMINATE",
        };
        f.write_str(s)
    }
}

/// Status posted by a module into its completion slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[repr(u32)]
pub enum CompletionStatus {
    #[default]
    None = 0,
    /// Posted once by the runtime client right after attaching.
    Attached = 1,
    /// Acknowledges STAGE, RESET, PAUSE, RESUME or TERMINATE.
    Ack = 2,
    /// The commanded STEP is complete and outputs are written.
    Done = 3,
    /// The module gave up on the current command.
    Fault = 4,
}

impl CompletionStatus {
    /// Convert from raw `u32` value. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Attached),
            2 => Some(Self::Ack),
            3 => Some(Self::Done),
            4 => Some(Self::Fault),
            _ => None,
        }
    }
}

/// One command as delivered through a command slot.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlMessage {
    pub command: Command,
    pub frame: u64,
    pub dt: f64,
    pub generation: u64,
}

/// One completion as posted through a completion slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionMessage {
    pub status: CompletionStatus,
    /// Sequence number of the command being answered.
    pub seq: u32,
    /// Frame of the command being answered.
    pub frame: u64,
    pub generation: u64,
}

/// Violations of the command/completion discipline.
///
/// These are programming errors in a module. The runtime client returns
/// them to module code; the supervisor faults the module on sight.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// A completion that does not answer the outstanding command.
    #[error("{status:?} does not answer {command}")]
    UnexpectedCommand {
        command: Command,
        status: CompletionStatus,
    },

    /// A second completion for a command that was already answered.
    #[error("command #{seq} acknowledged twice")]
    DoubleAck { seq: u32 },

    /// Completion reported for a frame that was not commanded.
    #[error("completion for frame {reported}, commanded frame {expected}")]
    StaleFrame { expected: u64, reported: u64 },

    /// Waiting for a new command while the current one is unanswered.
    #[error("{command} is still outstanding")]
    Outstanding { command: Command },
}

/// A peer stopped making progress.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LivenessError {
    /// No completion within the bounded wait.
    #[error("no response within {waited_ms} ms")]
    Timeout { waited_ms: u64 },

    /// The peer process is gone.
    #[error("process exited (code {code:?})")]
    ProcessExit { code: Option<i32> },
}
