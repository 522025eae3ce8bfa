//! Named POSIX shared memory segment holding one simulation run.
//!
//! The supervisor creates the segment exclusively (`O_CREAT | O_EXCL`)
//! before spawning any module and unlinks it on drop. Modules attach by
//! name and validate the header before touching anything else.

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use std::fs::File;
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::layout::{
    ModuleBlock, SegmentHeader, SegmentLayout, SignalEntry, layout_hash, load_name, name_eq,
    store_name,
};
use crate::consts::{
    MAX_MODULE_NAME_LEN, MAX_MODULES, MAX_SIGNALS_PER_MODULE, SHM_MAX_SIZE,
};
use crate::platform;
use crate::signal::{ModuleId, ModuleName, validate_name};

/// Segment lifecycle errors. Fatal to the supervisor; a module that
/// cannot attach cannot take part in the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("failed to create segment {name}: {reason}")]
    CreateFailed { name: String, reason: String },

    #[error("failed to attach segment {name}: {reason}")]
    AttachFailed { name: String, reason: String },

    #[error("segment {name} already exists")]
    AlreadyExists { name: String },
}

/// Result alias for segment operations.
pub type SegmentResult<T> = Result<T, SegmentError>;

/// Parameters for [`Segment::create`].
#[derive(Debug, Clone)]
pub struct SegmentSpec<'a> {
    /// POSIX name, e.g. `/hermes_1234`.
    pub name: &'a str,
    /// Module names in registration order; index becomes the [`ModuleId`].
    pub modules: &'a [&'a str],
    pub signals_per_module: u32,
    /// Initial timestep in seconds.
    pub dt: f64,
}

/// A mapped Hermes segment.
///
/// Every region is reached through shared references to atomics, so a
/// `Segment` may be shared between threads.
pub struct Segment {
    name: String,
    layout: SegmentLayout,
    base: NonNull<u8>,
    owner: bool,
    _mmap: MmapMut,
}

// SAFETY: `base` points into `_mmap`, which lives as long as the segment,
// and all shared state behind it is atomic.
unsafe impl Send for Segment {}
// SAFETY: see above; no method hands out `&mut` into the mapping.
unsafe impl Sync for Segment {}

impl Segment {
    /// Create and initialise a new segment.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if a segment with this name is present.
    /// - `CreateFailed` for invalid names, limits or OS failures.
    pub fn create(spec: &SegmentSpec<'_>) -> SegmentResult<Self> {
        let fail = |reason: String| SegmentError::CreateFailed {
            name: spec.name.to_string(),
            reason,
        };

        validate_segment_name(spec.name).map_err(|r| fail(r.to_string()))?;
        if spec.modules.is_empty() || spec.modules.len() > MAX_MODULES {
            return Err(fail(format!(
                "module count {} outside 1..={MAX_MODULES}",
                spec.modules.len()
            )));
        }
        if spec.signals_per_module == 0 || spec.signals_per_module > MAX_SIGNALS_PER_MODULE {
            return Err(fail(format!(
                "signals_per_module {} outside 1..={MAX_SIGNALS_PER_MODULE}",
                spec.signals_per_module
            )));
        }
        for (i, module) in spec.modules.iter().enumerate() {
            validate_name(module, MAX_MODULE_NAME_LEN)
                .map_err(|r| fail(format!("module {module:?}: {r}")))?;
            if module.contains('.') {
                return Err(fail(format!("module {module:?}: name contains '.'")));
            }
            if spec.modules[..i].contains(module) {
                return Err(fail(format!("module {module:?} listed twice")));
            }
        }

        let layout = SegmentLayout::new(spec.modules.len() as u32, spec.signals_per_module);
        if layout.total_size > SHM_MAX_SIZE {
            return Err(fail(format!(
                "size {} exceeds {SHM_MAX_SIZE} bytes",
                layout.total_size
            )));
        }

        let fd = shm_open(
            spec.name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| match e {
            nix::Error::EEXIST => SegmentError::AlreadyExists {
                name: spec.name.to_string(),
            },
            other => fail(other.to_string()),
        })?;
        let file = File::from(fd);

        let mapped = file
            .set_len(layout.total_size as u64)
            .and_then(|()| {
                // SAFETY: the file was just created by us with the right size.
                unsafe { MmapOptions::new().len(layout.total_size).map_mut(&file) }
            });
        let mut mmap = match mapped {
            Ok(m) => m,
            Err(e) => {
                let _ = shm_unlink(spec.name);
                return Err(fail(e.to_string()));
            }
        };

        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| fail("null mapping".into()))?;
        let header = SegmentHeader::new(
            layout.module_count,
            layout.signals_per_module,
            platform::current_pid(),
            spec.dt,
        );
        // SAFETY: the mapping is page aligned, at least header-sized, and
        // not yet visible to any other party.
        unsafe { std::ptr::write(base.as_ptr().cast::<SegmentHeader>(), header) };

        let segment = Self {
            name: spec.name.to_string(),
            layout,
            base,
            owner: true,
            _mmap: mmap,
        };
        for (i, module) in spec.modules.iter().enumerate() {
            store_name(&segment.block(ModuleId(i as u32)).info.name, module);
        }
        fence(Ordering::Release);

        info!(
            "Created segment {} ({} modules, {} signal slots each, {} bytes)",
            spec.name, layout.module_count, layout.signals_per_module, layout.total_size
        );
        Ok(segment)
    }

    /// Attach to an existing segment by name.
    ///
    /// # Errors
    ///
    /// `AttachFailed` if the segment does not exist, is truncated, or
    /// carries a foreign magic or layout hash.
    pub fn attach(name: &str) -> SegmentResult<Self> {
        let fail = |reason: String| SegmentError::AttachFailed {
            name: name.to_string(),
            reason,
        };

        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| match e {
            nix::Error::ENOENT => fail("segment does not exist".into()),
            other => fail(other.to_string()),
        })?;
        let file = File::from(fd);
        let size = file.metadata().map_err(|e| fail(e.to_string()))?.len() as usize;
        if size < core::mem::size_of::<SegmentHeader>() {
            return Err(fail(format!("segment too small ({size} bytes)")));
        }

        // SAFETY: mapping a shared memory object we just opened read-write.
        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| fail(e.to_string()))?;
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| fail("null mapping".into()))?;
        fence(Ordering::Acquire);

        // SAFETY: size was checked above and the mapping is page aligned.
        let header = unsafe { &*base.as_ptr().cast::<SegmentHeader>() };
        if !header.is_magic_valid() {
            return Err(fail("bad magic".into()));
        }
        if header.layout_hash != layout_hash() {
            return Err(fail(format!(
                "layout hash {:#010x}, expected {:#010x}",
                header.layout_hash,
                layout_hash()
            )));
        }
        let layout = SegmentLayout::new(header.module_count, header.signals_per_module);
        if layout.total_size > size {
            return Err(fail(format!(
                "segment truncated ({size} bytes, layout needs {})",
                layout.total_size
            )));
        }

        debug!("Attached segment {name} ({} modules)", layout.module_count);
        Ok(Self {
            name: name.to_string(),
            layout,
            base,
            owner: false,
            _mmap: mmap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    /// Whether this handle created the segment (and unlinks it on drop).
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn header(&self) -> &SegmentHeader {
        // SAFETY: validated at create/attach; lives as long as `self`.
        unsafe { &*self.base.as_ptr().cast::<SegmentHeader>() }
    }

    pub fn module_count(&self) -> u32 {
        self.layout.module_count
    }

    pub fn module_ids(&self) -> impl Iterator<Item = ModuleId> + use<> {
        (0..self.layout.module_count).map(ModuleId)
    }

    /// Mailboxes and bookkeeping of one module.
    ///
    /// # Panics
    ///
    /// If `id` is out of range; ids only come from this segment.
    pub fn block(&self, id: ModuleId) -> &ModuleBlock {
        assert!(id.0 < self.layout.module_count, "module id {id} out of range");
        let offset = self.layout.module_offset(id.0);
        // SAFETY: in-bounds, 64-byte aligned offset inside the mapping.
        unsafe { &*self.base.as_ptr().add(offset).cast::<ModuleBlock>() }
    }

    /// Signal entry at `slot` of `module`'s table region, if in range.
    pub(crate) fn entry(&self, module: ModuleId, slot: u32) -> Option<&SignalEntry> {
        if module.0 >= self.layout.module_count || slot >= self.layout.signals_per_module {
            return None;
        }
        let offset = self.layout.signal_offset(module.0, slot);
        // SAFETY: in-bounds, 64-byte aligned offset inside the mapping.
        Some(unsafe { &*self.base.as_ptr().add(offset).cast::<SignalEntry>() })
    }

    /// Look up a module by name.
    pub fn module_id(&self, name: &str) -> Option<ModuleId> {
        self.module_ids()
            .find(|id| name_eq(&self.block(*id).info.name, name))
    }

    pub fn module_name(&self, id: ModuleId) -> ModuleName {
        load_name(&self.block(id).info.name)
    }

    // ─── Run state ──────────────────────────────────────────────────

    /// Publish frame and time. Supervisor only.
    pub fn set_clock(&self, frame: u64, time: f64) {
        let header = self.header();
        header.time_bits.store(time.to_bits(), Ordering::Relaxed);
        header.frame.store(frame, Ordering::Release);
    }

    /// Publish the timestep. Supervisor only.
    pub fn set_dt(&self, dt: f64) {
        self.header().dt_bits.store(dt.to_bits(), Ordering::Release);
    }

    /// Bump the generation counter and return the new value. Supervisor only.
    pub fn bump_generation(&self) -> u64 {
        self.header().generation.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if self.owner {
            match shm_unlink(self.name.as_str()) {
                Ok(()) => info!("Unlinked segment {}", self.name),
                Err(e) => warn!("Failed to unlink segment {}: {e}", self.name),
            }
        }
    }
}

/// POSIX shm names: one leading slash, no other slash, bounded length.
fn validate_segment_name(name: &str) -> Result<(), &'static str> {
    let Some(rest) = name.strip_prefix('/') else {
        return Err("name must start with '/'");
    };
    if rest.is_empty() {
        return Err("name is empty");
    }
    if rest.contains('/') {
        return Err("name contains '/' after the prefix");
    }
    if name.len() > 255 {
        return Err("name longer than 255 bytes");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_support::unique_name;

    fn spec<'a>(name: &'a str, modules: &'a [&'a str]) -> SegmentSpec<'a> {
        SegmentSpec {
            name,
            modules,
            signals_per_module: 4,
            dt: 0.01,
        }
    }

    #[test]
    fn create_then_attach_sees_same_header() {
        let name = unique_name("seg_attach");
        let created = Segment::create(&spec(&name, &["a", "b"])).expect("create");
        let attached = Segment::attach(&name).expect("attach");

        assert_eq!(attached.module_count(), 2);
        assert_eq!(attached.layout(), created.layout());
        assert_eq!(attached.header().dt(), 0.01);
        assert_eq!(attached.module_id("b"), Some(ModuleId(1)));
        assert_eq!(attached.module_name(ModuleId(0)).as_str(), "a");
        assert_eq!(attached.module_id("c"), None);
        assert!(created.is_owner());
        assert!(!attached.is_owner());
    }

    #[test]
    fn create_is_exclusive() {
        let name = unique_name("seg_excl");
        let _first = Segment::create(&spec(&name, &["a"])).expect("create");
        let second = Segment::create(&spec(&name, &["a"]));
        assert!(
            matches!(second, Err(SegmentError::AlreadyExists { .. })),
            "second create must fail with AlreadyExists, got {:?}",
            second.as_ref().err()
        );
    }

    #[test]
    fn owner_drop_unlinks() {
        let name = unique_name("seg_unlink");
        drop(Segment::create(&spec(&name, &["a"])).expect("create"));
        assert!(matches!(
            Segment::attach(&name),
            Err(SegmentError::AttachFailed { .. })
        ));
    }

    #[test]
    fn create_rejects_bad_names() {
        let bad_segment = Segment::create(&spec("no_slash", &["a"]));
        assert!(matches!(bad_segment, Err(SegmentError::CreateFailed { .. })));

        let name = unique_name("seg_badmod");
        let dotted = Segment::create(&spec(&name, &["a.b"]));
        assert!(matches!(dotted, Err(SegmentError::CreateFailed { .. })));

        let dup = Segment::create(&spec(&name, &["a", "a"]));
        assert!(matches!(dup, Err(SegmentError::CreateFailed { .. })));
    }

    #[test]
    fn attach_missing_segment_fails() {
        let result = Segment::attach(&unique_name("seg_missing"));
        assert!(matches!(result, Err(SegmentError::AttachFailed { .. })));
    }

    #[test]
    fn clock_and_generation() {
        let name = unique_name("seg_clock");
        let seg = Segment::create(&spec(&name, &["a"])).expect("create");
        seg.set_clock(3, 0.03);
        assert_eq!(seg.header().frame(), 3);
        assert_eq!(seg.header().time(), 0.03);
        assert_eq!(seg.bump_generation(), 1);
        assert_eq!(seg.bump_generation(), 2);
        assert_eq!(seg.header().generation(), 2);
    }
}
