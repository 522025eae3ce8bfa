//! Wire routing between modules.
//!
//! A wire copies `dst = src * gain + offset` from the committed value of
//! `src` into `dst` through the supervisor write path, so the destination
//! owner sees the value in the STEP that follows.

use hermes_common::config::WireConfig;
use hermes_common::shm::{Accessor, Segment};
use hermes_common::signal::{AccessError, SignalFlags, SignalRef, SignalValue};
use tracing::info;

use crate::error::{SupervisorError, SupervisorResult};

#[derive(Debug, Clone, Copy)]
struct CompiledWire {
    src: SignalRef,
    dst: SignalRef,
    gain: f64,
    offset: f64,
}

/// Validated wires, resolved to signal refs.
#[derive(Debug, Default)]
pub struct WireRouter {
    wires: Vec<CompiledWire>,
}

impl WireRouter {
    /// Resolve and check every wire. Call once registries are closed.
    pub fn compile(segment: &Segment, wires: &[WireConfig]) -> SupervisorResult<Self> {
        let mut compiled = Vec::with_capacity(wires.len());
        for wire in wires {
            let fail = |reason: String| SupervisorError::Wiring {
                src: wire.src.clone(),
                dst: wire.dst.clone(),
                reason,
            };
            let src = segment.resolve(&wire.src).map_err(|e| fail(e.to_string()))?;
            let dst = segment.resolve(&wire.dst).map_err(|e| fail(e.to_string()))?;
            let writable = segment
                .signal_flags(dst)
                .is_some_and(|f| f.contains(SignalFlags::WRITABLE));
            if !writable {
                return Err(fail("destination is not writable".into()));
            }
            if src == dst {
                return Err(fail("wire loops onto its source".into()));
            }
            compiled.push(CompiledWire {
                src,
                dst,
                gain: wire.gain,
                offset: wire.offset,
            });
        }
        if !compiled.is_empty() {
            info!("Wire routing configured: {} wire(s)", compiled.len());
        }
        Ok(Self { wires: compiled })
    }

    /// Apply every wire in declaration order.
    pub fn route(&self, segment: &Segment) -> Result<(), AccessError> {
        for wire in &self.wires {
            let value = segment.read_signal(wire.src, Accessor::Supervisor)?.as_f64();
            let routed = SignalValue::from_f64(wire.dst.kind, value * wire.gain + wire.offset);
            segment.write_signal(wire.dst, routed, Accessor::Supervisor)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.wires.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wires.is_empty()
    }
}
