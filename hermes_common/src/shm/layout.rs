//! Fixed shared memory layout.
//!
//! ```text
//! +--------------------+  offset 0
//! | SegmentHeader (64) |
//! +--------------------+  modules_offset = 64
//! | ModuleBlock (192)  |  x module_count
//! |  CommandSlot    64 |
//! |  CompletionSlot 64 |
//! |  ModuleInfo     64 |
//! +--------------------+  signals_offset
//! | SignalEntry (128)  |  x module_count * signals_per_module
//! +--------------------+
//! ```
//!
//! Every struct is `#[repr(C, align(64))]` and built only from atomics
//! (plus creator-written constants in the header), so all access from
//! either process goes through shared references. A freshly truncated
//! segment is all zeroes, which is a valid state for every atomic here.

use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::consts::{CACHE_LINE_SIZE, MAX_MODULE_NAME_LEN, MAX_SIGNAL_NAME_LEN};

/// Magic bytes identifying a Hermes segment: `"HERMES\0\0"`.
pub const HERMES_MAGIC: [u8; 8] = *b"HERMES\0\0";

const MODULE_NAME_WORDS: usize = MAX_MODULE_NAME_LEN / 8;
const SIGNAL_NAME_WORDS: usize = MAX_SIGNAL_NAME_LEN / 8;

/// Segment header, written once by the creator and then only through the
/// atomic run-state fields.
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Must equal [`HERMES_MAGIC`].
    pub magic: [u8; 8],
    /// Must equal [`layout_hash()`].
    pub layout_hash: u32,
    pub module_count: u32,
    pub signals_per_module: u32,
    /// PID of the creating supervisor; modules watch it for liveness.
    pub supervisor_pid: u32,
    /// Bumped on every RESET.
    pub generation: AtomicU64,
    pub frame: AtomicU64,
    /// Simulation time in seconds, as `f64` bits.
    pub time_bits: AtomicU64,
    /// Timestep in seconds, as `f64` bits.
    pub dt_bits: AtomicU64,
    pub _reserved: [u8; 8],
}

const_assert_eq!(core::mem::size_of::<SegmentHeader>(), 64);
const_assert_eq!(core::mem::align_of::<SegmentHeader>(), CACHE_LINE_SIZE);

impl SegmentHeader {
    pub fn new(module_count: u32, signals_per_module: u32, supervisor_pid: u32, dt: f64) -> Self {
        Self {
            magic: HERMES_MAGIC,
            layout_hash: layout_hash(),
            module_count,
            signals_per_module,
            supervisor_pid,
            generation: AtomicU64::new(0),
            frame: AtomicU64::new(0),
            time_bits: AtomicU64::new(0f64.to_bits()),
            dt_bits: AtomicU64::new(dt.to_bits()),
            _reserved: [0u8; 8],
        }
    }

    #[inline]
    pub fn is_magic_valid(&self) -> bool {
        self.magic == HERMES_MAGIC
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn time(&self) -> f64 {
        f64::from_bits(self.time_bits.load(Ordering::Acquire))
    }

    pub fn dt(&self) -> f64 {
        f64::from_bits(self.dt_bits.load(Ordering::Acquire))
    }
}

/// Supervisor to module mailbox. Only the supervisor writes it.
///
/// `seq` is both the publication counter and the futex word: fields are
/// stored first, then `seq` is bumped with release ordering.
#[repr(C, align(64))]
pub struct CommandSlot {
    pub seq: AtomicU32,
    pub command: AtomicU32,
    pub frame: AtomicU64,
    pub dt_bits: AtomicU64,
    pub generation: AtomicU64,
    _padding: [u8; 32],
}

const_assert_eq!(core::mem::size_of::<CommandSlot>(), 64);

/// Module to supervisor mailbox. Only the owning module writes it.
///
/// `count` increments on every post and is the futex word; the supervisor
/// compares it with the last count it consumed to detect both new and
/// unsolicited completions.
#[repr(C, align(64))]
pub struct CompletionSlot {
    pub count: AtomicU32,
    pub status: AtomicU32,
    /// `seq` of the command being answered.
    pub seq: AtomicU32,
    _pad0: u32,
    pub frame: AtomicU64,
    pub generation: AtomicU64,
    _padding: [u8; 32],
}

const_assert_eq!(core::mem::size_of::<CompletionSlot>(), 64);

/// Per-module bookkeeping.
#[repr(C, align(64))]
pub struct ModuleInfo {
    /// Zero-padded module name.
    pub name: [AtomicU64; MODULE_NAME_WORDS],
    /// PID of the attached module process, 0 while detached.
    pub pid: AtomicU32,
    /// Number of published entries in this module's table region.
    pub signal_count: AtomicU32,
    /// Non-zero once the module acknowledged STAGE.
    pub registry_closed: AtomicU32,
    /// Non-zero while a runtime client is attached.
    pub attached: AtomicU32,
    _padding: [u8; 16],
}

const_assert_eq!(core::mem::size_of::<ModuleInfo>(), 64);

/// The mailbox pair plus bookkeeping for one module.
#[repr(C, align(64))]
pub struct ModuleBlock {
    pub command: CommandSlot,
    pub completion: CompletionSlot,
    pub info: ModuleInfo,
}

const_assert_eq!(core::mem::size_of::<ModuleBlock>(), 192);
const_assert_eq!(core::mem::align_of::<ModuleBlock>(), CACHE_LINE_SIZE);

/// One signal table entry.
///
/// `pending` holds the owner's latest write; `committed` is what every
/// other party reads and is only advanced by the supervisor once the
/// owner settled the frame. `default` is restored on RESET.
#[repr(C, align(64))]
pub struct SignalEntry {
    pub name: [AtomicU64; SIGNAL_NAME_WORDS],
    pub committed: AtomicU64,
    pub pending: AtomicU64,
    pub default: AtomicU64,
    pub kind: AtomicU8,
    pub flags: AtomicU8,
    _padding: [u8; 38],
}

const_assert_eq!(core::mem::size_of::<SignalEntry>(), 128);
const_assert_eq!(core::mem::align_of::<SignalEntry>(), CACHE_LINE_SIZE);

/// Compile-time hash of every fixed struct in the segment.
///
/// Computed from sizes and alignments; a module built against a
/// different layout refuses to attach.
pub const fn layout_hash() -> u32 {
    struct_hash::<SegmentHeader>()
        ^ struct_hash::<ModuleBlock>().rotate_left(7)
        ^ struct_hash::<SignalEntry>().rotate_left(13)
}

const fn struct_hash<T>() -> u32 {
    let size = core::mem::size_of::<T>() as u32;
    let align = core::mem::align_of::<T>() as u32;
    size.wrapping_mul(0x9E3779B9) ^ align.wrapping_mul(0x517CC1B7)
}

/// Byte offsets of the regions of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLayout {
    pub module_count: u32,
    pub signals_per_module: u32,
    pub modules_offset: usize,
    pub signals_offset: usize,
    pub total_size: usize,
}

impl SegmentLayout {
    pub const fn new(module_count: u32, signals_per_module: u32) -> Self {
        let modules_offset = core::mem::size_of::<SegmentHeader>();
        let signals_offset =
            modules_offset + module_count as usize * core::mem::size_of::<ModuleBlock>();
        let total_size = signals_offset
            + module_count as usize
                * signals_per_module as usize
                * core::mem::size_of::<SignalEntry>();
        Self {
            module_count,
            signals_per_module,
            modules_offset,
            signals_offset,
            total_size,
        }
    }

    #[inline]
    pub const fn module_offset(&self, index: u32) -> usize {
        self.modules_offset + index as usize * core::mem::size_of::<ModuleBlock>()
    }

    #[inline]
    pub const fn signal_offset(&self, module: u32, slot: u32) -> usize {
        let index = module as usize * self.signals_per_module as usize + slot as usize;
        self.signals_offset + index * core::mem::size_of::<SignalEntry>()
    }
}

// ─── Fixed-width names ──────────────────────────────────────────────

/// Store `name` zero-padded into a word array. Caller validated the length.
pub(crate) fn store_name(dst: &[AtomicU64], name: &str) {
    let bytes = name.as_bytes();
    for (i, word) in dst.iter().enumerate() {
        let mut chunk = [0u8; 8];
        let start = i * 8;
        if start < bytes.len() {
            let end = bytes.len().min(start + 8);
            chunk[..end - start].copy_from_slice(&bytes[start..end]);
        }
        word.store(u64::from_le_bytes(chunk), Ordering::Relaxed);
    }
}

/// Compare a stored name with `name` without copying it out.
pub(crate) fn name_eq(src: &[AtomicU64], name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() > src.len() * 8 {
        return false;
    }
    src.iter().enumerate().all(|(i, word)| {
        let mut chunk = [0u8; 8];
        let start = i * 8;
        if start < bytes.len() {
            let end = bytes.len().min(start + 8);
            chunk[..end - start].copy_from_slice(&bytes[start..end]);
        }
        word.load(Ordering::Relaxed) == u64::from_le_bytes(chunk)
    })
}

/// Load a stored name into a fixed-capacity string.
///
/// Bytes that are not valid UTF-8 (a corrupted entry) yield an empty name.
pub(crate) fn load_name<const N: usize>(src: &[AtomicU64]) -> heapless::String<N> {
    let mut buf = [0u8; 256];
    let mut len = 0;
    'words: for word in src {
        for b in word.load(Ordering::Relaxed).to_le_bytes() {
            if b == 0 || len == N {
                break 'words;
            }
            buf[len] = b;
            len += 1;
        }
    }
    let mut out = heapless::String::new();
    if let Ok(s) = core::str::from_utf8(&buf[..len]) {
        let _ = out.push_str(s);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_and_alignment() {
        assert_eq!(core::mem::size_of::<SegmentHeader>(), 64);
        assert_eq!(core::mem::align_of::<SegmentHeader>(), 64);
    }

    #[test]
    fn magic_validation() {
        let mut header = SegmentHeader::new(2, 8, 1, 0.01);
        assert!(header.is_magic_valid());
        header.magic[0] = b'X';
        assert!(!header.is_magic_valid());
    }

    #[test]
    fn layout_offsets_are_cache_aligned() {
        let layout = SegmentLayout::new(3, 5);
        assert_eq!(layout.modules_offset, 64);
        assert_eq!(layout.signals_offset, 64 + 3 * 192);
        assert_eq!(layout.total_size, 64 + 3 * 192 + 15 * 128);
        assert_eq!(layout.module_offset(2) % 64, 0);
        assert_eq!(layout.signal_offset(2, 4) % 64, 0);
        assert_eq!(layout.signal_offset(2, 4) + 128, layout.total_size);
    }

    #[test]
    fn layout_hash_is_stable() {
        assert_eq!(layout_hash(), layout_hash());
        assert_ne!(layout_hash(), 0);
    }

    #[test]
    fn names_store_compare_and_load() {
        let words: [AtomicU64; 4] = Default::default();
        store_name(&words, "thruster.left");
        assert!(name_eq(&words, "thruster.left"));
        assert!(!name_eq(&words, "thruster.lef"));
        assert!(!name_eq(&words, "thruster.leftx"));
        let loaded: heapless::String<32> = load_name(&words);
        assert_eq!(loaded.as_str(), "thruster.left");
    }

    #[test]
    fn full_width_name_has_no_terminator() {
        let words: [AtomicU64; 4] = Default::default();
        let name = "abcdefgh".repeat(4);
        store_name(&words, &name);
        assert!(name_eq(&words, &name));
        let loaded: heapless::String<32> = load_name(&words);
        assert_eq!(loaded.as_str(), name);
    }
}
