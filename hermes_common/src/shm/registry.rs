//! Signal registry operations on a mapped segment.
//!
//! Each module owns a fixed region of `signals_per_module` entries. Only
//! the owner (or the supervisor, before the module is spawned) registers
//! into a region, so slot allocation needs no cross-process claim: an
//! entry is filled in and then published by bumping the region's
//! `signal_count` with release ordering.
//!
//! Values are double-buffered. The owner writes `pending`; everyone else
//! reads `committed`, which the supervisor advances with [`Segment::commit`]
//! once the owner settled the frame.

use std::sync::atomic::Ordering;

use super::layout::{SignalEntry, load_name, name_eq, store_name};
use super::segment::Segment;
use crate::consts::MAX_SIGNAL_NAME_LEN;
use crate::signal::{
    AccessError, ModuleId, RegistrationError, SignalFlags, SignalInfo, SignalName, SignalRef,
    SignalType, SignalValue, split_qualified, validate_name,
};

/// The party performing a signal access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accessor {
    /// A module runtime client. Reads its own signals from `pending`, may
    /// write only its own signals.
    Module(ModuleId),
    /// The supervisor (wiring, injection, inspection). Writes land in both
    /// copies and require the `WRITABLE` flag.
    Supervisor,
}

impl Segment {
    /// Register a signal in `module`'s namespace.
    ///
    /// # Errors
    ///
    /// - `InvalidName` if the name does not fit the fixed-width field.
    /// - `RegistryClosed` once the module acknowledged STAGE.
    /// - `DuplicateName` if the name exists, whatever its type or flags.
    /// - `TableFull` if the module's region is exhausted.
    pub fn register_signal(
        &self,
        module: ModuleId,
        name: &str,
        default: SignalValue,
        flags: SignalFlags,
    ) -> Result<SignalRef, RegistrationError> {
        validate_name(name, MAX_SIGNAL_NAME_LEN).map_err(|reason| {
            RegistrationError::InvalidName {
                name: name.to_string(),
                reason,
            }
        })?;

        let info = &self.block(module).info;
        if info.registry_closed.load(Ordering::Acquire) != 0 {
            return Err(RegistrationError::RegistryClosed {
                name: name.to_string(),
            });
        }
        if self.find_signal(module, name).is_some() {
            return Err(RegistrationError::DuplicateName {
                name: name.to_string(),
            });
        }

        let slot = info.signal_count.load(Ordering::Acquire);
        let Some(entry) = self.entry(module, slot) else {
            return Err(RegistrationError::TableFull {
                capacity: self.layout().signals_per_module,
            });
        };
        let bits = default.to_bits();
        store_name(&entry.name, name);
        entry.kind.store(default.kind() as u8, Ordering::Relaxed);
        entry.flags.store(flags.bits(), Ordering::Relaxed);
        entry.default.store(bits, Ordering::Relaxed);
        entry.pending.store(bits, Ordering::Relaxed);
        entry.committed.store(bits, Ordering::Relaxed);
        info.signal_count.store(slot + 1, Ordering::Release);

        Ok(SignalRef {
            module,
            slot,
            kind: default.kind(),
        })
    }

    /// Find a signal by its local name inside `module`'s namespace.
    pub fn find_signal(&self, module: ModuleId, name: &str) -> Option<SignalRef> {
        (0..self.signal_count(module)).find_map(|slot| {
            let entry = self.entry(module, slot)?;
            if !name_eq(&entry.name, name) {
                return None;
            }
            let kind = SignalType::from_u8(entry.kind.load(Ordering::Relaxed))?;
            Some(SignalRef { module, slot, kind })
        })
    }

    /// Resolve a qualified `module.signal` name.
    pub fn resolve(&self, qualified: &str) -> Result<SignalRef, AccessError> {
        let not_found = || AccessError::NotFound {
            name: qualified.to_string(),
        };
        let (module, signal) = split_qualified(qualified).ok_or_else(not_found)?;
        let module = self.module_id(module).ok_or_else(not_found)?;
        self.find_signal(module, signal).ok_or_else(not_found)
    }

    /// Read a signal.
    ///
    /// The owning module sees its own latest write; every other party sees
    /// the last committed value.
    pub fn read_signal(
        &self,
        sref: SignalRef,
        accessor: Accessor,
    ) -> Result<SignalValue, AccessError> {
        let entry = self.checked_entry(sref)?;
        let bits = if accessor == Accessor::Module(sref.module) {
            entry.pending.load(Ordering::Acquire)
        } else {
            entry.committed.load(Ordering::Acquire)
        };
        Ok(SignalValue::from_bits(sref.kind, bits))
    }

    /// Write a signal.
    ///
    /// # Errors
    ///
    /// - `NotFound` for a ref that does not name a registered entry.
    /// - `NotWritable` if a module targets another module's signal, or the
    ///   supervisor targets a signal without the `WRITABLE` flag.
    /// - `TypeMismatch` if `value` or the ref is not of the declared type.
    pub fn write_signal(
        &self,
        sref: SignalRef,
        value: SignalValue,
        accessor: Accessor,
    ) -> Result<(), AccessError> {
        let entry = self.checked_entry(sref)?;
        let allowed = match accessor {
            Accessor::Module(id) => id == sref.module,
            Accessor::Supervisor => SignalFlags::from_bits_truncate(
                entry.flags.load(Ordering::Relaxed),
            )
            .contains(SignalFlags::WRITABLE),
        };
        if !allowed {
            return Err(AccessError::NotWritable {
                name: self.qualified_name(sref),
            });
        }
        if value.kind() != sref.kind {
            return Err(AccessError::TypeMismatch {
                name: self.qualified_name(sref),
                expected: sref.kind,
                actual: value.kind(),
            });
        }

        let bits = value.to_bits();
        entry.pending.store(bits, Ordering::Release);
        if accessor == Accessor::Supervisor {
            entry.committed.store(bits, Ordering::Release);
        }
        Ok(())
    }

    /// Make the owner's pending values globally visible. Supervisor only.
    pub fn commit(&self, module: ModuleId) {
        for entry in self.entries(module) {
            let bits = entry.pending.load(Ordering::Acquire);
            entry.committed.store(bits, Ordering::Release);
        }
    }

    /// Restore registration-time defaults in both copies. Supervisor only.
    pub fn reset_to_defaults(&self, module: ModuleId) {
        for entry in self.entries(module) {
            let bits = entry.default.load(Ordering::Relaxed);
            entry.pending.store(bits, Ordering::Release);
            entry.committed.store(bits, Ordering::Release);
        }
    }

    /// Close `module`'s registry. Idempotent.
    pub fn close_registry(&self, module: ModuleId) {
        self.block(module)
            .info
            .registry_closed
            .store(1, Ordering::Release);
    }

    pub fn is_registry_closed(&self, module: ModuleId) -> bool {
        self.block(module).info.registry_closed.load(Ordering::Acquire) != 0
    }

    /// Number of registered signals in `module`'s namespace.
    pub fn signal_count(&self, module: ModuleId) -> u32 {
        self.block(module)
            .info
            .signal_count
            .load(Ordering::Acquire)
            .min(self.layout().signals_per_module)
    }

    /// Snapshot of `module`'s signals with committed values.
    pub fn signals(&self, module: ModuleId) -> Vec<SignalInfo> {
        let module_name = self.module_name(module);
        (0..self.signal_count(module))
            .filter_map(|slot| {
                let entry = self.entry(module, slot)?;
                let kind = SignalType::from_u8(entry.kind.load(Ordering::Relaxed))?;
                let flags = SignalFlags::from_bits_truncate(entry.flags.load(Ordering::Relaxed));
                Some(SignalInfo {
                    module: module_name.clone(),
                    name: load_name::<MAX_SIGNAL_NAME_LEN>(&entry.name),
                    kind,
                    writable: flags.contains(SignalFlags::WRITABLE),
                    published: flags.contains(SignalFlags::PUBLISHED),
                    value: SignalValue::from_bits(kind, entry.committed.load(Ordering::Acquire)),
                    unit: None,
                })
            })
            .collect()
    }

    /// Snapshot of every signal in the segment, in table order.
    pub fn all_signals(&self) -> Vec<SignalInfo> {
        self.module_ids().flat_map(|id| self.signals(id)).collect()
    }

    /// Local name of a registered signal.
    pub fn signal_name(&self, sref: SignalRef) -> Option<SignalName> {
        self.checked_entry(sref).ok().map(|e| load_name(&e.name))
    }

    pub fn signal_flags(&self, sref: SignalRef) -> Option<SignalFlags> {
        self.checked_entry(sref)
            .ok()
            .map(|e| SignalFlags::from_bits_truncate(e.flags.load(Ordering::Relaxed)))
    }

    fn qualified_name(&self, sref: SignalRef) -> String {
        let signal = self.signal_name(sref).unwrap_or_default();
        format!("{}.{}", self.module_name(sref.module), signal)
    }

    fn entries(&self, module: ModuleId) -> impl Iterator<Item = &SignalEntry> {
        (0..self.signal_count(module)).filter_map(move |slot| self.entry(module, slot))
    }

    /// Entry behind a ref, checked against the published count and type.
    ///
    /// A ref to a registered slot with the wrong type is a `TypeMismatch`,
    /// anything else that misses is `NotFound`.
    fn checked_entry(&self, sref: SignalRef) -> Result<&SignalEntry, AccessError> {
        let not_found = || AccessError::NotFound {
            name: format!("{}#{}", sref.module, sref.slot),
        };
        if sref.module.0 >= self.module_count() || sref.slot >= self.signal_count(sref.module) {
            return Err(not_found());
        }
        let entry = self.entry(sref.module, sref.slot).ok_or_else(not_found)?;
        let declared =
            SignalType::from_u8(entry.kind.load(Ordering::Relaxed)).ok_or_else(not_found)?;
        if declared != sref.kind {
            let name: SignalName = load_name(&entry.name);
            return Err(AccessError::TypeMismatch {
                name: format!("{}.{name}", self.module_name(sref.module)),
                expected: declared,
                actual: sref.kind,
            });
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::segment::SegmentSpec;
    use crate::shm::test_support::unique_name;

    const A: ModuleId = ModuleId(0);
    const B: ModuleId = ModuleId(1);

    fn segment(tag: &str, signals_per_module: u32) -> Segment {
        Segment::create(&SegmentSpec {
            name: &unique_name(tag),
            modules: &["a", "b"],
            signals_per_module,
            dt: 0.01,
        })
        .expect("create")
    }

    #[test]
    fn duplicate_name_rejected_regardless_of_arguments() {
        let seg = segment("reg_dup", 4);
        seg.register_signal(A, "x", SignalValue::F64(0.0), SignalFlags::writable(true))
            .unwrap();
        let again = seg.register_signal(A, "x", SignalValue::Bool(true), SignalFlags::empty());
        assert_eq!(
            again,
            Err(RegistrationError::DuplicateName { name: "x".into() })
        );
        // Same local name in another namespace is a different signal.
        assert!(
            seg.register_signal(B, "x", SignalValue::I32(0), SignalFlags::empty())
                .is_ok()
        );
    }

    #[test]
    fn closed_registry_rejects_registration() {
        let seg = segment("reg_closed", 4);
        seg.close_registry(A);
        let result = seg.register_signal(A, "late", SignalValue::F64(0.0), SignalFlags::empty());
        assert!(matches!(result, Err(RegistrationError::RegistryClosed { .. })));
        assert!(seg.is_registry_closed(A));
        assert!(!seg.is_registry_closed(B));
    }

    #[test]
    fn table_full() {
        let seg = segment("reg_full", 1);
        seg.register_signal(A, "one", SignalValue::F64(0.0), SignalFlags::empty())
            .unwrap();
        let result = seg.register_signal(A, "two", SignalValue::F64(0.0), SignalFlags::empty());
        assert_eq!(result, Err(RegistrationError::TableFull { capacity: 1 }));
    }

    #[test]
    fn unset_signal_reads_zero_and_missing_is_not_found() {
        let seg = segment("reg_unset", 4);
        let y = seg
            .register_signal(B, "y", SignalType::I32.zero(), SignalFlags::writable(true))
            .unwrap();
        assert_eq!(
            seg.read_signal(y, Accessor::Supervisor),
            Ok(SignalValue::I32(0))
        );
        assert_eq!(seg.resolve("b.y"), Ok(y));
        assert!(matches!(
            seg.resolve("b.nope"),
            Err(AccessError::NotFound { .. })
        ));
        assert!(matches!(
            seg.resolve("zz.y"),
            Err(AccessError::NotFound { .. })
        ));
    }

    #[test]
    fn owner_writes_are_pending_until_commit() {
        let seg = segment("reg_commit", 4);
        let x = seg
            .register_signal(A, "x", SignalValue::F64(0.0), SignalFlags::writable(true))
            .unwrap();
        seg.write_signal(x, SignalValue::F64(1.5), Accessor::Module(A))
            .unwrap();

        assert_eq!(seg.read_signal(x, Accessor::Module(A)), Ok(SignalValue::F64(1.5)));
        assert_eq!(seg.read_signal(x, Accessor::Module(B)), Ok(SignalValue::F64(0.0)));

        seg.commit(A);
        assert_eq!(seg.read_signal(x, Accessor::Module(B)), Ok(SignalValue::F64(1.5)));
    }

    #[test]
    fn write_permissions() {
        let seg = segment("reg_perm", 4);
        let locked = seg
            .register_signal(A, "locked", SignalValue::F64(0.0), SignalFlags::writable(false))
            .unwrap();
        let open = seg
            .register_signal(A, "open", SignalValue::F64(0.0), SignalFlags::writable(true))
            .unwrap();

        // Owner may always write its own signals.
        assert!(seg.write_signal(locked, SignalValue::F64(1.0), Accessor::Module(A)).is_ok());
        // Other modules never write foreign signals.
        assert!(matches!(
            seg.write_signal(open, SignalValue::F64(1.0), Accessor::Module(B)),
            Err(AccessError::NotWritable { .. })
        ));
        // The supervisor honours the writable flag.
        assert!(matches!(
            seg.write_signal(locked, SignalValue::F64(1.0), Accessor::Supervisor),
            Err(AccessError::NotWritable { .. })
        ));
        seg.write_signal(open, SignalValue::F64(2.0), Accessor::Supervisor)
            .unwrap();
        assert_eq!(seg.read_signal(open, Accessor::Module(B)), Ok(SignalValue::F64(2.0)));
    }

    #[test]
    fn type_is_enforced_without_coercion() {
        let seg = segment("reg_type", 4);
        let x = seg
            .register_signal(A, "x", SignalValue::F64(0.0), SignalFlags::writable(true))
            .unwrap();
        let result = seg.write_signal(x, SignalValue::F32(1.0), Accessor::Module(A));
        assert_eq!(
            result,
            Err(AccessError::TypeMismatch {
                name: "a.x".into(),
                expected: SignalType::F64,
                actual: SignalType::F32,
            })
        );
    }

    #[test]
    fn ref_with_wrong_type_is_a_mismatch() {
        let seg = segment("reg_kind", 4);
        let x = seg
            .register_signal(A, "x", SignalValue::I32(4), SignalFlags::writable(true))
            .unwrap();
        let wrong = SignalRef {
            kind: SignalType::F64,
            ..x
        };
        let mismatch = || AccessError::TypeMismatch {
            name: "a.x".into(),
            expected: SignalType::I32,
            actual: SignalType::F64,
        };
        assert_eq!(seg.read_signal(wrong, Accessor::Supervisor), Err(mismatch()));
        assert_eq!(
            seg.write_signal(wrong, SignalValue::F64(1.0), Accessor::Module(A)),
            Err(mismatch())
        );
        assert_eq!(seg.read_signal(x, Accessor::Supervisor), Ok(SignalValue::I32(4)));
    }

    #[test]
    fn forged_ref_is_not_found() {
        let seg = segment("reg_forged", 4);
        let forged = SignalRef {
            module: A,
            slot: 2,
            kind: SignalType::F64,
        };
        assert!(matches!(
            seg.read_signal(forged, Accessor::Supervisor),
            Err(AccessError::NotFound { .. })
        ));
    }

    #[test]
    fn reset_restores_registration_defaults() {
        let seg = segment("reg_reset", 4);
        let x = seg
            .register_signal(A, "x", SignalValue::I64(42), SignalFlags::writable(true))
            .unwrap();
        seg.write_signal(x, SignalValue::I64(7), Accessor::Module(A))
            .unwrap();
        seg.commit(A);
        seg.reset_to_defaults(A);
        assert_eq!(seg.read_signal(x, Accessor::Module(A)), Ok(SignalValue::I64(42)));
        assert_eq!(seg.read_signal(x, Accessor::Supervisor), Ok(SignalValue::I64(42)));
    }

    #[test]
    fn listing_reports_metadata() {
        let seg = segment("reg_list", 4);
        seg.register_signal(A, "pos.z", SignalValue::F64(0.0), SignalFlags::writable(false))
            .unwrap();
        seg.register_signal(B, "on", SignalValue::Bool(true), SignalFlags::writable(true))
            .unwrap();
        let all = seg.all_signals();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].qualified_name(), "a.pos.z");
        assert!(!all[0].writable);
        assert_eq!(all[1].value, SignalValue::Bool(true));
        assert!(all[1].writable && all[1].published);
    }

    #[test]
    fn flags_are_readable_through_a_ref() {
        let seg = segment("reg_flags", 4);
        let ro = seg
            .register_signal(A, "ro", SignalValue::F32(0.0), SignalFlags::writable(false))
            .unwrap();
        assert_eq!(seg.signal_flags(ro), Some(SignalFlags::PUBLISHED));
        let bogus = SignalRef { slot: 3, ..ro };
        assert_eq!(seg.signal_flags(bogus), None);
    }
}
