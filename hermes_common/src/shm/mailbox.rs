//! Single-slot command and completion mailboxes.
//!
//! Each slot holds exactly one message and is overwritten by the next
//! post; readers always see the latest one. Publication follows the same
//! pattern in both directions: store the payload fields, then bump the
//! counter word with release ordering and wake waiters on it.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::futex;
use super::layout::{CommandSlot, CompletionSlot};
use crate::protocol::{Command, CompletionMessage, CompletionStatus, ControlMessage};

impl CommandSlot {
    /// Publish a command and return its sequence number. Supervisor only.
    pub fn post(&self, msg: &ControlMessage) -> u32 {
        self.command.store(msg.command as u32, Ordering::Relaxed);
        self.frame.store(msg.frame, Ordering::Relaxed);
        self.dt_bits.store(msg.dt.to_bits(), Ordering::Relaxed);
        self.generation.store(msg.generation, Ordering::Relaxed);
        let seq = self.seq.fetch_add(1, Ordering::Release).wrapping_add(1);
        futex::wake_all(&self.seq);
        seq
    }

    /// Sequence number of the latest posted command.
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Read the latest command. Unknown tags decode as [`Command::None`].
    pub fn read(&self) -> ControlMessage {
        ControlMessage {
            command: Command::from_u32(self.command.load(Ordering::Relaxed))
                .unwrap_or_default(),
            frame: self.frame.load(Ordering::Relaxed),
            dt: f64::from_bits(self.dt_bits.load(Ordering::Relaxed)),
            generation: self.generation.load(Ordering::Relaxed),
        }
    }

    /// Block until a command newer than `last_seq` is posted.
    ///
    /// Returns `None` when `deadline` passes first. Sleeps are capped at
    /// `slice` so the caller can poll peer liveness between them.
    pub fn wait_newer(
        &self,
        last_seq: u32,
        deadline: Option<Instant>,
        slice: Duration,
    ) -> Option<(u32, ControlMessage)> {
        let seq = futex::wait_for_change(&self.seq, last_seq, deadline, slice)?;
        Some((seq, self.read()))
    }
}

impl CompletionSlot {
    /// Publish a completion. Owning module only.
    pub fn post(&self, msg: &CompletionMessage) {
        self.status.store(msg.status as u32, Ordering::Relaxed);
        self.seq.store(msg.seq, Ordering::Relaxed);
        self.frame.store(msg.frame, Ordering::Relaxed);
        self.generation.store(msg.generation, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Release);
        futex::wake_all(&self.count);
    }

    /// Number of completions posted so far.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Read the latest completion. Unknown tags decode as
    /// [`CompletionStatus::None`].
    pub fn read(&self) -> CompletionMessage {
        CompletionMessage {
            status: CompletionStatus::from_u32(self.status.load(Ordering::Relaxed))
                .unwrap_or_default(),
            seq: self.seq.load(Ordering::Relaxed),
            frame: self.frame.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::Relaxed),
        }
    }

    /// Block until the post count moves past `seen`.
    ///
    /// Returns the new count, or `None` at `deadline`. Sleeps are capped at
    /// `slice`.
    pub fn wait_past(&self, seen: u32, deadline: Instant, slice: Duration) -> Option<u32> {
        futex::wait_for_change(&self.count, seen, Some(deadline), slice)
    }
}
