//! The per-process module context.
//!
//! [`ModuleContext`] is the owned resource for one attachment: created by
//! [`ModuleContext::attach`], released on drop whatever the exit path. It
//! owns the module's single command cell, the last command received and
//! whether it has been answered, and drives the control channel from the
//! module side.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use hermes_common::consts::{LIVENESS_POLL_MS, MODULE_ENV_VAR};
use hermes_common::platform;
use hermes_common::protocol::{
    Command, CompletionMessage, CompletionStatus, ControlMessage, LivenessError, ProtocolError,
};
use hermes_common::shm::{Accessor, Segment, SegmentError};
use hermes_common::signal::{
    AccessError, ModuleId, ModuleName, RegistrationError, SignalFlags, SignalRef, SignalType,
    SignalValue,
};
use tracing::{debug, info};

use crate::error::{ModuleError, ModuleResult};

/// The latest command seen by this module and whether it was answered.
#[derive(Debug, Clone, Copy)]
struct CommandCell {
    seq: u32,
    message: ControlMessage,
    answered: bool,
}

/// Attachment of one module process to a Hermes segment.
pub struct ModuleContext {
    segment: Segment,
    id: ModuleId,
    name: ModuleName,
    config_path: PathBuf,
    supervisor_pid: u32,
    cell: CommandCell,
}

impl ModuleContext {
    /// Attach using the process contract: exactly two positional
    /// arguments `(segment_name, config_path)`, module name from
    /// `HERMES_MODULE`.
    pub fn from_args() -> ModuleResult<Self> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let [segment_name, config_path] = args.as_slice() else {
            return Err(ModuleError::Usage(format!(
                "expected <segment_name> <config_path>, got {} argument(s)",
                args.len()
            )));
        };
        Self::init(segment_name, config_path)
    }

    /// Attach as the module named by the `HERMES_MODULE` environment variable.
    pub fn init(segment_name: &str, config_path: impl Into<PathBuf>) -> ModuleResult<Self> {
        let module_name = std::env::var(MODULE_ENV_VAR)
            .map_err(|_| ModuleError::Usage(format!("{MODULE_ENV_VAR} is not set")))?;
        Self::attach(segment_name, &module_name, config_path)
    }

    /// Attach to `segment_name` as `module_name`.
    ///
    /// Announces the attachment through the completion mailbox so the
    /// supervisor can move the module from SPAWNING to ATTACHED.
    ///
    /// # Errors
    ///
    /// `AttachFailed` if the segment is missing or invalid, the module is
    /// not part of the run, or another client is already attached as it.
    pub fn attach(
        segment_name: &str,
        module_name: &str,
        config_path: impl Into<PathBuf>,
    ) -> ModuleResult<Self> {
        let segment = Segment::attach(segment_name)?;
        let fail = |reason: &str| SegmentError::AttachFailed {
            name: segment_name.to_string(),
            reason: format!("module {module_name:?}: {reason}"),
        };

        let id = segment
            .module_id(module_name)
            .ok_or_else(|| fail("not part of this run"))?;
        let block = segment.block(id);
        if block
            .info
            .attached
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(fail("already attached").into());
        }
        block.info.pid.store(platform::current_pid(), Ordering::Release);

        let header = segment.header();
        let seq = block.command.seq();
        block.completion.post(&CompletionMessage {
            status: CompletionStatus::Attached,
            seq,
            frame: header.frame(),
            generation: header.generation(),
        });

        let supervisor_pid = header.supervisor_pid;
        let name = segment.module_name(id);
        info!("Module {name} attached to {segment_name} as {id}");
        Ok(Self {
            segment,
            id,
            name,
            config_path: config_path.into(),
            supervisor_pid,
            cell: CommandCell {
                seq,
                message: ControlMessage::default(),
                answered: true,
            },
        })
    }

    // ─── Identity ───────────────────────────────────────────────────

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Second process argument, opaque to the protocol.
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    // ─── Control channel ────────────────────────────────────────────

    /// Block until the supervisor posts the next command.
    ///
    /// # Errors
    ///
    /// - `Outstanding` if the current command has not been answered.
    /// - `ProcessExit` if the supervisor died while we were waiting.
    pub fn wait_command(&mut self) -> ModuleResult<ControlMessage> {
        loop {
            if let Some(msg) = self.wait_until(None)? {
                return Ok(msg);
            }
        }
    }

    /// Like [`wait_command`](Self::wait_command), giving up after `timeout`.
    pub fn wait_command_timeout(&mut self, timeout: Duration) -> ModuleResult<Option<ControlMessage>> {
        self.wait_until(Some(Instant::now() + timeout))
    }

    fn wait_until(&mut self, deadline: Option<Instant>) -> ModuleResult<Option<ControlMessage>> {
        if !self.cell.answered {
            return Err(ProtocolError::Outstanding {
                command: self.cell.message.command,
            }
            .into());
        }

        let poll = Duration::from_millis(LIVENESS_POLL_MS);
        let slot = &self.segment.block(self.id).command;
        loop {
            let round = Instant::now() + poll * 5;
            let until = deadline.map_or(round, |d| d.min(round));
            if let Some((seq, message)) = slot.wait_newer(self.cell.seq, Some(until), poll) {
                debug!(
                    "{}: received {} (frame {}, gen {})",
                    self.name, message.command, message.frame, message.generation
                );
                self.cell = CommandCell {
                    seq,
                    message,
                    answered: message.command == Command::None,
                };
                return Ok(Some(message));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
            if !platform::is_process_alive(self.supervisor_pid) {
                return Err(LivenessError::ProcessExit { code: None }.into());
            }
        }
    }

    /// Current command (the last one received).
    pub fn command(&self) -> Command {
        self.cell.message.command
    }

    /// The full last message received.
    pub fn message(&self) -> ControlMessage {
        self.cell.message
    }

    /// Acknowledge STAGE, RESET, PAUSE, RESUME or TERMINATE.
    ///
    /// Acknowledging STAGE closes this module's registry.
    pub fn ack(&mut self) -> ModuleResult<()> {
        self.check_answerable(CompletionStatus::Ack)?;
        if self.cell.message.command == Command::Stage {
            self.segment.close_registry(self.id);
        }
        self.complete(CompletionStatus::Ack);
        Ok(())
    }

    /// Report the commanded STEP as done; outputs must already be written.
    pub fn signal_done(&mut self) -> ModuleResult<()> {
        self.check_answerable(CompletionStatus::Done)?;
        self.complete(CompletionStatus::Done);
        Ok(())
    }

    /// Give up on the current command. The supervisor faults this module.
    pub fn signal_fault(&mut self) -> ModuleResult<()> {
        let command = self.cell.message.command;
        if command == Command::None {
            return Err(ProtocolError::UnexpectedCommand {
                command,
                status: CompletionStatus::Fault,
            }
            .into());
        }
        if self.cell.answered {
            return Err(ProtocolError::DoubleAck { seq: self.cell.seq }.into());
        }
        self.complete(CompletionStatus::Fault);
        Ok(())
    }

    fn check_answerable(&self, status: CompletionStatus) -> Result<(), ProtocolError> {
        let command = self.cell.message.command;
        if command.expected_completion() != Some(status) {
            return Err(ProtocolError::UnexpectedCommand { command, status });
        }
        if self.cell.answered {
            return Err(ProtocolError::DoubleAck { seq: self.cell.seq });
        }
        Ok(())
    }

    fn complete(&mut self, status: CompletionStatus) {
        self.segment.block(self.id).completion.post(&CompletionMessage {
            status,
            seq: self.cell.seq,
            frame: self.cell.message.frame,
            generation: self.cell.message.generation,
        });
        self.cell.answered = true;
        debug!("{}: {:?} for {}", self.name, status, self.cell.message.command);
    }

    // ─── Clock ──────────────────────────────────────────────────────

    /// Frame of the current STEP, or the run's current frame otherwise.
    pub fn frame(&self) -> u64 {
        match self.cell.message.command {
            Command::Step => self.cell.message.frame,
            _ => self.segment.header().frame(),
        }
    }

    /// Simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.segment.header().time()
    }

    /// Timestep of the current STEP, or the run's configured timestep.
    pub fn dt(&self) -> f64 {
        match self.cell.message.command {
            Command::Step => self.cell.message.dt,
            _ => self.segment.header().dt(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.segment.header().generation()
    }

    // ─── Signals ────────────────────────────────────────────────────

    /// Register a signal in this module's namespace, defaulting to zero.
    ///
    /// Legal only until STAGE is acknowledged.
    pub fn register_signal(
        &self,
        name: &str,
        kind: SignalType,
        writable: bool,
    ) -> Result<SignalRef, RegistrationError> {
        self.segment
            .register_signal(self.id, name, kind.zero(), SignalFlags::writable(writable))
    }

    /// Register with an explicit default (restored on RESET) and flags.
    pub fn register_signal_with(
        &self,
        name: &str,
        default: SignalValue,
        flags: SignalFlags,
    ) -> Result<SignalRef, RegistrationError> {
        self.segment.register_signal(self.id, name, default, flags)
    }

    /// Resolve a local name in this module's namespace, else a qualified
    /// `module.signal` name.
    pub fn signal(&self, name: &str) -> Result<SignalRef, AccessError> {
        match self.segment.find_signal(self.id, name) {
            Some(sref) => Ok(sref),
            None => self.segment.resolve(name),
        }
    }

    /// Read by ref. Own signals return this module's latest write; others
    /// the last committed value.
    pub fn read(&self, sref: SignalRef) -> Result<SignalValue, AccessError> {
        self.segment.read_signal(sref, Accessor::Module(self.id))
    }

    /// Write by ref. Only this module's own signals are writable.
    pub fn write(&self, sref: SignalRef, value: impl Into<SignalValue>) -> Result<(), AccessError> {
        self.segment
            .write_signal(sref, value.into(), Accessor::Module(self.id))
    }

    /// Read by name.
    pub fn get_signal(&self, name: &str) -> Result<SignalValue, AccessError> {
        self.read(self.signal(name)?)
    }

    /// Write by name.
    pub fn set_signal(&self, name: &str, value: impl Into<SignalValue>) -> Result<(), AccessError> {
        self.write(self.signal(name)?, value)
    }
}

impl Drop for ModuleContext {
    fn drop(&mut self) {
        let info = &self.segment.block(self.id).info;
        info.pid.store(0, Ordering::Release);
        info.attached.store(0, Ordering::Release);
        debug!("Module {} detached from {}", self.name, self.segment.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_common::shm::SegmentSpec;
    use std::sync::atomic::AtomicU32;

    fn unique_name(suffix: &str) -> String {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let id = CTR.fetch_add(1, Ordering::Relaxed);
        format!("/hermes_ctx_{}_{id}_{suffix}", std::process::id())
    }

    fn supervisor_segment(suffix: &str) -> Segment {
        Segment::create(&SegmentSpec {
            name: &unique_name(suffix),
            modules: &["a", "b"],
            signals_per_module: 4,
            dt: 0.01,
        })
        .expect("create segment")
    }

    fn post(seg: &Segment, id: ModuleId, command: Command, frame: u64) -> u32 {
        seg.block(id).command.post(&ControlMessage {
            command,
            frame,
            dt: 0.01,
            generation: seg.header().generation(),
        })
    }

    #[test]
    fn attach_announces_itself() {
        let seg = supervisor_segment("announce");
        let ctx = ModuleContext::attach(seg.name(), "b", "").expect("attach");
        assert_eq!(ctx.id(), ModuleId(1));
        assert_eq!(ctx.name(), "b");

        let completion = &seg.block(ModuleId(1)).completion;
        assert_eq!(completion.count(), 1);
        assert_eq!(completion.read().status, CompletionStatus::Attached);
        assert_eq!(
            seg.block(ModuleId(1)).info.pid.load(Ordering::Acquire),
            std::process::id()
        );
    }

    #[test]
    fn second_attach_and_unknown_module_fail() {
        let seg = supervisor_segment("double");
        let _ctx = ModuleContext::attach(seg.name(), "a", "").expect("attach");
        assert!(matches!(
            ModuleContext::attach(seg.name(), "a", ""),
            Err(ModuleError::Segment(SegmentError::AttachFailed { .. }))
        ));
        assert!(matches!(
            ModuleContext::attach(seg.name(), "ghost", ""),
            Err(ModuleError::Segment(SegmentError::AttachFailed { .. }))
        ));
    }

    #[test]
    fn drop_detaches() {
        let seg = supervisor_segment("detach");
        drop(ModuleContext::attach(seg.name(), "a", "").expect("attach"));
        assert_eq!(seg.block(ModuleId(0)).info.attached.load(Ordering::Acquire), 0);
        assert!(ModuleContext::attach(seg.name(), "a", "").is_ok());
    }

    #[test]
    fn stage_ack_closes_registry() {
        let seg = supervisor_segment("stage");
        let mut ctx = ModuleContext::attach(seg.name(), "a", "").expect("attach");
        ctx.register_signal("x", SignalType::F64, true).unwrap();

        post(&seg, ModuleId(0), Command::Stage, 0);
        let msg = ctx.wait_command_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.map(|m| m.command), Some(Command::Stage));
        // Registration stays legal until the ack.
        ctx.register_signal("y", SignalType::I32, false).unwrap();
        ctx.ack().unwrap();

        assert!(matches!(
            ctx.register_signal("z", SignalType::Bool, true),
            Err(RegistrationError::RegistryClosed { .. })
        ));
        let completion = seg.block(ModuleId(0)).completion.read();
        assert_eq!(completion.status, CompletionStatus::Ack);
    }

    #[test]
    fn double_ack_and_wrong_completion_are_protocol_errors() {
        let seg = supervisor_segment("proto");
        let mut ctx = ModuleContext::attach(seg.name(), "a", "").expect("attach");

        // Nothing to answer yet.
        assert!(matches!(
            ctx.ack(),
            Err(ModuleError::Protocol(ProtocolError::UnexpectedCommand { .. }))
        ));

        post(&seg, ModuleId(0), Command::Step, 0);
        ctx.wait_command().unwrap();
        assert!(matches!(
            ctx.ack(),
            Err(ModuleError::Protocol(ProtocolError::UnexpectedCommand {
                command: Command::Step,
                status: CompletionStatus::Ack
            }))
        ));
        ctx.signal_done().unwrap();
        assert!(matches!(
            ctx.signal_done(),
            Err(ModuleError::Protocol(ProtocolError::DoubleAck { .. }))
        ));
        // One Attached plus one Done.
        assert_eq!(seg.block(ModuleId(0)).completion.count(), 2);
    }

    #[test]
    fn waiting_with_unanswered_command_is_rejected() {
        let seg = supervisor_segment("outstanding");
        let mut ctx = ModuleContext::attach(seg.name(), "a", "").expect("attach");
        post(&seg, ModuleId(0), Command::Pause, 0);
        ctx.wait_command().unwrap();
        assert!(matches!(
            ctx.wait_command_timeout(Duration::from_millis(10)),
            Err(ModuleError::Protocol(ProtocolError::Outstanding {
                command: Command::Pause
            }))
        ));
    }

    #[test]
    fn wait_times_out_without_command() {
        let seg = supervisor_segment("timeout");
        let mut ctx = ModuleContext::attach(seg.name(), "a", "").expect("attach");
        let got = ctx.wait_command_timeout(Duration::from_millis(30)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn step_carries_frame_and_dt() {
        let seg = supervisor_segment("dt");
        let mut ctx = ModuleContext::attach(seg.name(), "a", "").expect("attach");
        seg.block(ModuleId(0)).command.post(&ControlMessage {
            command: Command::Step,
            frame: 9,
            dt: 0.25,
            generation: 0,
        });
        let msg = ctx.wait_command().unwrap();
        assert_eq!(msg.frame, 9);
        assert_eq!(ctx.dt(), 0.25);
        ctx.signal_done().unwrap();
        assert_eq!(seg.block(ModuleId(0)).completion.read().frame, 9);
    }

    #[test]
    fn signal_access_by_local_and_qualified_name() {
        let seg = supervisor_segment("access");
        let a = ModuleContext::attach(seg.name(), "a", "").expect("attach a");
        let b = ModuleContext::attach(seg.name(), "b", "").expect("attach b");
        a.register_signal("x", SignalType::F64, true).unwrap();
        b.register_signal("y", SignalType::I32, true).unwrap();

        a.set_signal("x", 4.0).unwrap();
        assert_eq!(a.get_signal("x"), Ok(SignalValue::F64(4.0)));
        // Not committed yet: b still sees the default.
        assert_eq!(b.get_signal("a.x"), Ok(SignalValue::F64(0.0)));
        seg.commit(ModuleId(0));
        assert_eq!(b.get_signal("a.x"), Ok(SignalValue::F64(4.0)));

        assert!(matches!(
            b.set_signal("a.x", 1.0),
            Err(AccessError::NotWritable { .. })
        ));
        assert!(matches!(
            a.set_signal("x", 1i32),
            Err(AccessError::TypeMismatch { .. })
        ));
        assert!(matches!(
            a.get_signal("missing"),
            Err(AccessError::NotFound { .. })
        ));
    }
}
