//! Property tests for the signal registry.
//!
//! Runs against a real POSIX shared memory segment: every value
//! representable in a declared type survives a write/read by the owner
//! and, after commit, a read by any other party.

use hermes_common::shm::{Accessor, Segment, SegmentSpec};
use hermes_common::signal::{ModuleId, RegistrationError, SignalFlags, SignalType, SignalValue};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

// ─── Helpers ────────────────────────────────────────────────────────

fn test_seg_name(suffix: &str) -> String {
    static CTR: AtomicU32 = AtomicU32::new(0);
    let id = CTR.fetch_add(1, Ordering::Relaxed);
    format!("/hermes_props_{}_{id}_{suffix}", std::process::id())
}

fn two_module_segment(suffix: &str) -> Segment {
    Segment::create(&SegmentSpec {
        name: &test_seg_name(suffix),
        modules: &["a", "b"],
        signals_per_module: 8,
        dt: 0.01,
    })
    .expect("create segment")
}

fn any_value() -> impl Strategy<Value = SignalValue> {
    prop_oneof![
        any::<f64>()
            .prop_filter("NaN never compares equal", |v| !v.is_nan())
            .prop_map(SignalValue::F64),
        any::<f32>()
            .prop_filter("NaN never compares equal", |v| !v.is_nan())
            .prop_map(SignalValue::F32),
        any::<i64>().prop_map(SignalValue::I64),
        any::<i32>().prop_map(SignalValue::I32),
        any::<bool>().prop_map(SignalValue::Bool),
    ]
}

// ─── Properties ─────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn write_then_read_roundtrips(value in any_value()) {
        let seg = two_module_segment("rt");
        let a = ModuleId(0);
        let sref = seg
            .register_signal(a, "v", value.kind().zero(), SignalFlags::writable(true))
            .unwrap();

        seg.write_signal(sref, value, Accessor::Module(a)).unwrap();
        prop_assert_eq!(seg.read_signal(sref, Accessor::Module(a)).unwrap(), value);

        seg.commit(a);
        prop_assert_eq!(seg.read_signal(sref, Accessor::Module(ModuleId(1))).unwrap(), value);

        seg.write_signal(sref, value, Accessor::Supervisor).unwrap();
        prop_assert_eq!(seg.read_signal(sref, Accessor::Supervisor).unwrap(), value);
    }

    #[test]
    fn reregistration_always_fails(first in 0u8..5, second in 0u8..5, writable: bool) {
        let seg = two_module_segment("dup");
        let a = ModuleId(0);
        let first = SignalType::from_u8(first).unwrap();
        let second = SignalType::from_u8(second).unwrap();

        let sref = seg
            .register_signal(a, "s", first.zero(), SignalFlags::writable(true))
            .unwrap();
        let again = seg.register_signal(a, "s", second.zero(), SignalFlags::writable(writable));
        prop_assert_eq!(again, Err(RegistrationError::DuplicateName { name: "s".into() }));

        // The original type and flags are untouched.
        let info = &seg.signals(a)[0];
        prop_assert_eq!(info.kind, first);
        prop_assert!(info.writable);
        prop_assert_eq!(seg.find_signal(a, "s"), Some(sref));
    }
}
