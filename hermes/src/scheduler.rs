//! Frame pacing for the three execution modes.
//!
//! - `afap`: steps back to back.
//! - `realtime`: sleeps so that frame `n` ends no earlier than `n * dt` of
//!   wall time after the loop started.
//! - `single_frame`: steps only on request, read line by line from an
//!   interactive input.

use std::io::BufRead;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use hermes_common::config::{ExecutionConfig, ExecutionMode};
use tracing::{info, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::supervisor::Supervisor;

/// One line of interactive input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    Step(u64),
    Pause,
    Resume,
    Reset,
    Status,
    Quit,
}

impl FromStr for Request {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let request = match words.next() {
            None => Self::Step(1),
            Some("step" | "s") => match words.next() {
                None => Self::Step(1),
                Some(n) => match n.parse::<u64>() {
                    Ok(n) if n > 0 => Self::Step(n),
                    _ => return Err(format!("step count must be a positive integer, got {n:?}")),
                },
            },
            Some("pause") => Self::Pause,
            Some("resume") => Self::Resume,
            Some("reset") => Self::Reset,
            Some("status") => Self::Status,
            Some("quit" | "q" | "exit") => Self::Quit,
            Some(other) => return Err(format!("unknown command {other:?}")),
        };
        if let Some(extra) = words.next() {
            return Err(format!("unexpected argument {extra:?}"));
        }
        Ok(request)
    }
}

/// Drives a staged [`Supervisor`] until the end frame or a stop request.
pub struct Scheduler {
    mode: ExecutionMode,
    dt_ns: u64,
    end_frame: Option<u64>,
    stop: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(execution: &ExecutionConfig) -> Self {
        Self {
            mode: execution.mode,
            dt_ns: execution.dt_ns(),
            end_frame: execution.end_frame(),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Flag that ends the loop before the next frame when set.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn end_reached(&self, supervisor: &Supervisor) -> bool {
        self.end_frame.is_some_and(|end| supervisor.frame() >= end)
    }

    /// Run in `afap` or `realtime` mode. Returns the number of frames
    /// stepped.
    pub fn run(&self, supervisor: &mut Supervisor) -> SupervisorResult<u64> {
        info!(
            "Starting simulation loop: mode={:?}, dt={}ns, end_frame={:?}",
            self.mode, self.dt_ns, self.end_frame
        );
        let start = Instant::now();
        let mut stepped = 0u64;
        while !self.stop.load(Ordering::SeqCst) && !self.end_reached(supervisor) {
            supervisor.step()?;
            stepped += 1;

            if self.mode == ExecutionMode::Realtime {
                let target = start + Duration::from_nanos(self.dt_ns.saturating_mul(stepped));
                if let Some(ahead) = target.checked_duration_since(Instant::now()) {
                    thread::sleep(ahead);
                }
            }
        }
        info!(
            "Simulation loop ended: {stepped} frame(s) in {:?}, t={:.6}s",
            start.elapsed(),
            supervisor.time()
        );
        Ok(stepped)
    }

    /// Serve `single_frame` requests from `input` until `quit` or EOF.
    pub fn run_interactive<R: BufRead>(
        &self,
        supervisor: &mut Supervisor,
        input: R,
    ) -> SupervisorResult<()> {
        info!("Single-frame mode: step [n] | pause | resume | reset | status | quit");
        for line in input.lines() {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            let request = match line?.parse::<Request>() {
                Ok(request) => request,
                Err(e) => {
                    warn!("{e}");
                    continue;
                }
            };
            match request {
                Request::Step(count) => self.step_n(supervisor, count)?,
                Request::Pause => supervisor.pause()?,
                Request::Resume => supervisor.resume()?,
                Request::Reset => supervisor.reset()?,
                Request::Status => {}
                Request::Quit => break,
            }
            info!(
                "frame={} time={:.6}s generation={}{}",
                supervisor.frame(),
                supervisor.time(),
                supervisor.generation(),
                if supervisor.is_paused() { " (paused)" } else { "" }
            );
        }
        Ok(())
    }

    fn step_n(&self, supervisor: &mut Supervisor, count: u64) -> SupervisorResult<()> {
        for _ in 0..count {
            if self.end_reached(supervisor) {
                info!("End time reached at frame {}", supervisor.frame());
                break;
            }
            match supervisor.step() {
                Err(SupervisorError::Paused) => {
                    warn!("Simulation is paused; resume first");
                    break;
                }
                other => {
                    other?;
                }
            }
        }
        Ok(())
    }
}
