//! Command exchange and step synchronization.
//!
//! [`Barrier::exchange`] posts one command to every module for which it is
//! a legal transition, then waits on the completion slots until each of
//! those modules has either settled or faulted. The deadline is shared by
//! all modules of the round. A STEP round is the frame barrier: the caller
//! commits and advances only after `exchange` returns.
//!
//! Each completion is checked against the outstanding command before it
//! counts: more than one post per command, a completion for another
//! command or frame, and a completion nobody asked for all fault the
//! module as protocol violations. Completions tagged with an older
//! generation are dropped.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use hermes_common::consts::LIVENESS_POLL_MS;
use hermes_common::protocol::{
    Command, CompletionMessage, CompletionStatus, ControlMessage, LivenessError, ProtocolError,
};
use hermes_common::shm::Segment;
use hermes_common::signal::ModuleId;
use tracing::debug;

use crate::handle::{ModuleHandle, ModuleState, Pending};
use crate::report::{FaultKind, FaultReport};

/// Outcome of one exchange.
#[derive(Debug, Default)]
pub struct Round {
    /// Modules whose completion was accepted.
    pub settled: Vec<ModuleId>,
    /// Modules that faulted during the round.
    pub faults: Vec<FaultReport>,
}

enum Poll {
    Waiting,
    Settled,
    Faulted(FaultReport),
}

/// Waits on module completion slots.
pub struct Barrier<'a> {
    segment: &'a Segment,
    slice: Duration,
}

impl<'a> Barrier<'a> {
    pub fn new(segment: &'a Segment) -> Self {
        Self {
            segment,
            slice: Duration::from_millis(LIVENESS_POLL_MS),
        }
    }

    /// Wait for every SPAWNING module to announce itself.
    pub fn await_attach(&self, handles: &mut [ModuleHandle], timeout: Duration) -> Round {
        let header = self.segment.header();
        for handle in handles
            .iter_mut()
            .filter(|h| h.state() == ModuleState::Spawning)
        {
            handle.pending = Some(Pending {
                command: Command::None,
                seq: self.segment.block(handle.id()).command.seq(),
                frame: header.frame(),
                generation: header.generation(),
                after: ModuleState::Attached,
            });
        }
        let mut round = Round::default();
        self.gather(handles, timeout, &mut round);
        round
    }

    /// Post `message` to every module that may receive it and wait until
    /// all of them have answered or faulted.
    pub fn exchange(
        &self,
        handles: &mut [ModuleHandle],
        message: ControlMessage,
        timeout: Duration,
    ) -> Round {
        let mut round = Round::default();
        for handle in handles.iter_mut() {
            let Some((during, after)) = handle.state().transition(message.command) else {
                continue;
            };
            if let Some(report) = self.dispatch(handle, message, during, after) {
                round.faults.push(report);
            }
        }
        self.gather(handles, timeout, &mut round);
        round
    }

    fn dispatch(
        &self,
        handle: &mut ModuleHandle,
        message: ControlMessage,
        during: ModuleState,
        after: ModuleState,
    ) -> Option<FaultReport> {
        debug_assert!(handle.pending.is_none(), "one outstanding command per module");
        let slot = &self.segment.block(handle.id()).completion;

        // Anything posted since the last accepted completion was never asked for.
        let count = slot.count();
        if count != handle.seen_count {
            handle.seen_count = count;
            let stray = slot.read();
            return Some(handle.mark_faulted(
                message.frame,
                FaultKind::Protocol,
                ProtocolError::DoubleAck { seq: stray.seq }.to_string(),
            ));
        }

        let seq = self.segment.block(handle.id()).command.post(&message);
        handle.pending = Some(Pending {
            command: message.command,
            seq,
            frame: message.frame,
            generation: message.generation,
            after,
        });
        handle.set_state(during);
        None
    }

    fn gather(&self, handles: &mut [ModuleHandle], timeout: Duration, round: &mut Round) {
        let deadline = Instant::now() + timeout;
        loop {
            let mut waiting_on = None;
            for handle in handles.iter_mut().filter(|h| h.pending.is_some()) {
                match self.poll(handle) {
                    Poll::Waiting => {
                        waiting_on.get_or_insert((handle.id(), handle.seen_count));
                    }
                    Poll::Settled => round.settled.push(handle.id()),
                    Poll::Faulted(report) => round.faults.push(report),
                }
            }

            // Every module must settle before the round ends, so sleeping on
            // any one of the stragglers loses nothing.
            let Some((id, seen)) = waiting_on else {
                return;
            };
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.segment
                .block(id)
                .completion
                .wait_past(seen, deadline.min(now + self.slice), self.slice);
        }

        let cause = LivenessError::Timeout {
            waited_ms: timeout.as_millis() as u64,
        }
        .to_string();
        for handle in handles.iter_mut() {
            if let Some(pending) = handle.pending {
                round
                    .faults
                    .push(handle.mark_faulted(pending.frame, FaultKind::Timeout, cause.clone()));
            }
        }
    }

    fn poll(&self, handle: &mut ModuleHandle) -> Poll {
        let block = self.segment.block(handle.id());
        // Exit status first: a module that answered and then exited must
        // still be seen as answered.
        let exited = handle.poll_exit(block.info.pid.load(Ordering::Acquire));
        let count = block.completion.count();
        if count != handle.seen_count {
            let posts = count.wrapping_sub(handle.seen_count);
            handle.seen_count = count;
            return self.classify(handle, posts, block.completion.read());
        }
        match (exited, handle.pending) {
            (Some(code), Some(pending)) => Poll::Faulted(handle.mark_faulted(
                pending.frame,
                FaultKind::ProcessExit,
                LivenessError::ProcessExit { code }.to_string(),
            )),
            _ => Poll::Waiting,
        }
    }

    fn classify(&self, handle: &mut ModuleHandle, posts: u32, msg: CompletionMessage) -> Poll {
        let Some(pending) = handle.pending else {
            return Poll::Waiting;
        };
        let protocol = |handle: &mut ModuleHandle, err: ProtocolError| {
            Poll::Faulted(handle.mark_faulted(pending.frame, FaultKind::Protocol, err.to_string()))
        };

        if posts > 1 {
            return protocol(handle, ProtocolError::DoubleAck { seq: msg.seq });
        }
        if msg.generation != pending.generation {
            debug!(
                "{}: dropping completion from generation {} (current {})",
                handle.name(),
                msg.generation,
                pending.generation
            );
            return Poll::Waiting;
        }
        if msg.seq != pending.seq {
            // Older sequence: a second answer to an earlier command.
            return if (msg.seq.wrapping_sub(pending.seq) as i32) < 0 {
                protocol(handle, ProtocolError::DoubleAck { seq: msg.seq })
            } else {
                protocol(
                    handle,
                    ProtocolError::UnexpectedCommand {
                        command: pending.command,
                        status: msg.status,
                    },
                )
            };
        }
        if msg.status == CompletionStatus::Fault {
            return Poll::Faulted(handle.mark_faulted(
                pending.frame,
                FaultKind::Reported,
                format!("module gave up on {}", pending.command),
            ));
        }
        if msg.status != expected_status(pending.command) {
            return protocol(
                handle,
                ProtocolError::UnexpectedCommand {
                    command: pending.command,
                    status: msg.status,
                },
            );
        }
        if pending.command == Command::Step && msg.frame != pending.frame {
            return protocol(
                handle,
                ProtocolError::StaleFrame {
                    expected: pending.frame,
                    reported: msg.frame,
                },
            );
        }

        handle.pending = None;
        if pending.command == Command::Step {
            handle.last_ack_frame = Some(pending.frame);
        }
        if pending.after == ModuleState::Attached {
            let pid = self.segment.block(handle.id()).info.pid.load(Ordering::Acquire);
            handle.pid.get_or_insert(pid);
        }
        handle.set_state(pending.after);
        Poll::Settled
    }
}

/// The attach announcement answers the implicit NONE command.
fn expected_status(command: Command) -> CompletionStatus {
    command
        .expected_completion()
        .unwrap_or(CompletionStatus::Attached)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hermes_common::shm::SegmentSpec;
    use std::sync::atomic::AtomicU32;

    fn unique_name(suffix: &str) -> String {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let id = CTR.fetch_add(1, Ordering::Relaxed);
        format!("/hermes_barrier_{}_{id}_{suffix}", std::process::id())
    }

    fn setup(suffix: &str) -> (Segment, Vec<ModuleHandle>) {
        let seg = Segment::create(&SegmentSpec {
            name: &unique_name(suffix),
            modules: &["a", "b"],
            signals_per_module: 4,
            dt: 0.01,
        })
        .expect("create");
        let mut handles: Vec<_> = ["a", "b"]
            .iter()
            .enumerate()
            .map(|(i, n)| ModuleHandle::new(ModuleId(i as u32), *n, None, None))
            .collect();
        for h in &mut handles {
            h.state = ModuleState::Ready;
        }
        (seg, handles)
    }

    fn step(frame: u64) -> ControlMessage {
        ControlMessage {
            command: Command::Step,
            frame,
            dt: 0.01,
            generation: 0,
        }
    }

    /// Answer the current command of `id` the way a module would.
    fn answer(seg: &Segment, id: ModuleId, status: CompletionStatus, frame: u64) {
        let block = seg.block(id);
        block.completion.post(&CompletionMessage {
            status,
            seq: block.command.seq(),
            frame,
            generation: 0,
        });
    }

    #[test]
    fn silent_modules_time_out_together() {
        let (seg, mut handles) = setup("timeout");
        let start = Instant::now();
        let round = Barrier::new(&seg).exchange(&mut handles, step(0), Duration::from_millis(60));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(60));
        assert!(elapsed < Duration::from_millis(1000), "one shared deadline");
        assert!(round.settled.is_empty());
        assert_eq!(round.faults.len(), 2);
        assert!(round.faults.iter().all(|f| f.kind == FaultKind::Timeout));
    }

    #[test]
    fn prior_answers_settle_immediately() {
        let (seg, mut handles) = setup("settle");
        let barrier = Barrier::new(&seg);
        // Post STEP, then answer before gathering, as a fast module would.
        for h in handles.iter_mut() {
            assert!(barrier.dispatch(h, step(0), ModuleState::Running, ModuleState::Ready).is_none());
        }
        answer(&seg, ModuleId(0), CompletionStatus::Done, 0);
        answer(&seg, ModuleId(1), CompletionStatus::Done, 0);
        let mut round = Round::default();
        barrier.gather(&mut handles, Duration::from_millis(500), &mut round);
        assert_eq!(round.settled, vec![ModuleId(0), ModuleId(1)]);
        assert!(handles.iter().all(|h| h.state() == ModuleState::Ready));
        assert!(handles.iter().all(|h| h.last_ack_frame() == Some(0)));
    }

    #[test]
    fn wrong_frame_and_wrong_status_are_protocol_faults() {
        let (seg, mut handles) = setup("classify");
        let barrier = Barrier::new(&seg);
        for h in handles.iter_mut() {
            barrier.dispatch(h, step(7), ModuleState::Running, ModuleState::Ready);
        }
        answer(&seg, ModuleId(0), CompletionStatus::Done, 6);
        answer(&seg, ModuleId(1), CompletionStatus::Ack, 7);
        let mut round = Round::default();
        barrier.gather(&mut handles, Duration::from_millis(500), &mut round);
        assert!(round.settled.is_empty());
        assert!(round.faults.iter().all(|f| f.kind == FaultKind::Protocol));
        assert!(round.faults[0].cause.contains("frame 6"));
        assert!(handles.iter().all(|h| h.state() == ModuleState::Faulted));
    }

    #[test]
    fn unsolicited_completion_faults_on_next_dispatch() {
        let (seg, mut handles) = setup("stray");
        answer(&seg, ModuleId(1), CompletionStatus::Done, 0);
        answer(&seg, ModuleId(0), CompletionStatus::Done, 0);
        let round = Barrier::new(&seg).exchange(&mut handles, step(0), Duration::from_millis(50));
        assert_eq!(round.faults.len(), 2);
        assert!(round.faults.iter().all(|f| f.kind == FaultKind::Protocol));
        assert!(round.faults[0].cause.contains("twice"));
    }

    #[test]
    fn faulted_modules_are_not_sent_commands() {
        let (seg, mut handles) = setup("skip");
        handles[1].state = ModuleState::Faulted;
        let before = seg.block(ModuleId(1)).command.seq();
        let round = Barrier::new(&seg).exchange(&mut handles, step(0), Duration::from_millis(30));
        assert_eq!(seg.block(ModuleId(1)).command.seq(), before);
        assert_eq!(round.faults.len(), 1);
        assert_eq!(round.faults[0].module, "a");
    }
}
