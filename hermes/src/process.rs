//! Module process launch, liveness and reclamation.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use hermes_common::consts::MODULE_ENV_VAR;
use hermes_common::watchdog::WatchdogError;
use tracing::{debug, info, warn};

/// How long a process gets to honour SIGTERM before SIGKILL.
const SIGTERM_WAIT: Duration = Duration::from_millis(500);
const REAP_POLL: Duration = Duration::from_millis(10);

/// A spawned module process.
#[derive(Debug)]
pub struct ModuleProcess {
    child: Child,
    status: Option<ExitStatus>,
}

impl ModuleProcess {
    /// Spawn `executable` with the two-argument process contract.
    ///
    /// The child gets its own process group so a terminal Ctrl-C reaches
    /// only the supervisor, which then drains modules through TERMINATE.
    pub fn spawn(
        executable: &Path,
        module: &str,
        segment_name: &str,
        config_path: &Path,
    ) -> Result<Self, WatchdogError> {
        let child = Command::new(executable)
            .arg(segment_name)
            .arg(config_path)
            .env(MODULE_ENV_VAR, module)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|e| WatchdogError::SpawnFailed {
                module: module.to_string(),
                reason: format!("{}: {e}", executable.display()),
            })?;
        info!("Spawned {module} (pid {}) from {}", child.id(), executable.display());
        Ok(Self {
            child,
            status: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// `Some(code)` once the process has exited. `code` is `None` when it
    /// was killed by a signal.
    pub fn try_exit(&mut self) -> Option<Option<i32>> {
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.status = status,
                Err(e) => warn!("try_wait on pid {} failed: {e}", self.pid()),
            }
        }
        self.status.map(|s| s.code())
    }

    pub fn has_exited(&mut self) -> bool {
        self.try_exit().is_some()
    }

    /// Wait up to `grace` for a voluntary exit, then SIGTERM, then SIGKILL.
    /// Always reaps the child. Returns the exit code if there is one.
    pub fn reclaim(&mut self, grace: Duration) -> Option<i32> {
        let pid = self.pid();
        if self.wait_exit(grace) {
            return self.exit_code();
        }

        warn!("pid {pid} still running after {grace:?}, sending SIGTERM");
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!("SIGTERM to pid {pid} failed: {e}");
        }
        if self.wait_exit(SIGTERM_WAIT) {
            return self.exit_code();
        }

        warn!("pid {pid} ignored SIGTERM, sending SIGKILL");
        if let Err(e) = self.child.kill() {
            debug!("SIGKILL to pid {pid} failed: {e}");
        }
        match self.child.wait() {
            Ok(status) => self.status = Some(status),
            Err(e) => warn!("wait on pid {pid} failed: {e}"),
        }
        self.exit_code()
    }

    fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_exited() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(REAP_POLL);
        }
    }

    fn exit_code(&self) -> Option<i32> {
        let status = self.status?;
        if let Some(signal) = status.signal() {
            debug!("pid {} ended by signal {signal}", self.child.id());
        }
        status.code()
    }
}
