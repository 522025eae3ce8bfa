//! Shared memory subsystem.
//!
//! This module contains:
//! - `layout`: Fixed `#[repr(C)]` header, module block and signal entry.
//! - `segment`: Exclusive create / validated attach / unlink-on-drop.
//! - `registry`: Signal registration, lookup, access and commit.
//! - `mailbox`: Single-slot command and completion mailboxes.
//! - `futex`: Cross-process wake primitive used by the mailboxes.

pub mod futex;
pub mod layout;
pub mod mailbox;
pub mod registry;
pub mod segment;

pub use registry::Accessor;
pub use segment::{Segment, SegmentError, SegmentResult, SegmentSpec};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Generate a unique segment name for test isolation.
    pub(crate) fn unique_name(suffix: &str) -> String {
        static CTR: AtomicU32 = AtomicU32::new(0);
        let id = CTR.fetch_add(1, Ordering::Relaxed);
        format!("/hermes_test_{}_{id}_{suffix}", std::process::id())
    }
}
