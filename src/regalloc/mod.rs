//! Guest register allocator.
//!
//! Tracks which physical register, if any, currently holds each guest
//! virtual register, whether that copy is dirty with respect to its home
//! slot, and which guest values are known compile-time constants. The
//! allocator emits its own loads, stores and constant materializations
//! through the instruction sink; lowering code never addresses guest slots
//! directly.
//!
//! Bindings survive past their last use as a cache; eviction picks the
//! least-recently-touched unpinned binding with no outstanding references
//! and flushes it first if dirty. `pin` protects a binding from eviction
//! entirely; `delay` is a soft hint that keeps a fully-released binding
//! resident because a nearby instruction will want it again.
//!
//! Control-flow diamonds use the snapshot protocol: `remember_state` at the
//! split, `go_to_state` at the end of the out-of-line path to force its
//! bindings back into the remembered shape, and `transfer_to_state` at the
//! reconvergence point to verify that no divergence survived.

use rustc_hash::FxHashMap;

use crate::backend::x64::{CallingConvention, Gpr};
use crate::backend::x64::registers::ALLOCATABLE;
use crate::bytecode::VReg;
use crate::error::CompileError;
use crate::frame::FrameLayout;
use crate::lir::{ClassedMem, LirOp, LoadKind, MemClass, StoreWidth};
use crate::sched::Sink;

// =============================================================================
// Bindings
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Binding {
    /// Guest vreg this register holds; `None` for a scratch temporary.
    guest: Option<VReg>,
    /// Outstanding references from the current lowering sequence.
    refcount: u8,
    /// Register copy is newer than the home slot.
    dirty: bool,
    /// Never evict.
    pinned: bool,
    /// Keep resident at refcount zero; an upcoming instruction reuses it.
    delayed: bool,
    /// Last-touch tick for eviction ordering.
    touch: u32,
}

/// A remembered binding-table shape for one merge point.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Snapshot {
    /// Guest binding and dirty flag per register encoding.
    bindings: [Option<(VReg, bool)>; 16],
    /// Tracked constants, sorted by vreg.
    constants: Vec<(VReg, i64)>,
}

// =============================================================================
// Allocator
// =============================================================================

pub struct RegAlloc {
    bindings: [Option<Binding>; 16],
    constants: FxHashMap<VReg, i64>,
    snapshots: FxHashMap<u32, Snapshot>,
    frame: FrameLayout,
    tick: u32,
    next_spill: u16,
    max_spill: u16,
}

impl RegAlloc {
    pub fn new(frame: FrameLayout) -> Self {
        RegAlloc {
            bindings: [None; 16],
            constants: FxHashMap::default(),
            snapshots: FxHashMap::default(),
            frame,
            tick: 0,
            next_spill: 0,
            max_spill: 0,
        }
    }

    #[inline]
    pub fn frame(&self) -> &FrameLayout {
        &self.frame
    }

    /// High-water mark of spill slots used, for frame sizing.
    pub fn max_spill_slots(&self) -> u16 {
        self.max_spill
    }

    fn guest_slot(&self, vreg: VReg) -> ClassedMem {
        ClassedMem::new(self.frame.vreg_slot(vreg), MemClass::GuestSlot(vreg))
    }

    fn spill_mem(&self, index: u16) -> ClassedMem {
        ClassedMem::new(self.frame.spill_slot(index), MemClass::Spill(index))
    }

    fn bump(&mut self) -> u32 {
        self.tick += 1;
        self.tick
    }

    /// Physical register currently holding a guest vreg.
    pub fn reg_of(&self, vreg: VReg) -> Option<Gpr> {
        for &r in &ALLOCATABLE {
            if let Some(b) = self.bindings[r.encoding() as usize] {
                if b.guest == Some(vreg) {
                    return Some(r);
                }
            }
        }
        None
    }

    // -------------------------------------------------------------------------
    // Constant tracking
    // -------------------------------------------------------------------------

    /// Known constant value of a guest vreg, if tracked.
    pub fn constant_of(&self, vreg: VReg) -> Option<i64> {
        self.constants.get(&vreg).copied()
    }

    /// Record that a guest vreg holds a known constant.
    pub fn set_constant(&mut self, vreg: VReg, value: i64) {
        self.constants.insert(vreg, value);
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    fn pick_victim(&self) -> Result<Gpr, CompileError> {
        // Free register first.
        for &r in &ALLOCATABLE {
            if self.bindings[r.encoding() as usize].is_none() {
                return Ok(r);
            }
        }
        // Cached, undelayed binding with the oldest touch.
        let mut best: Option<(Gpr, u32)> = None;
        for &r in &ALLOCATABLE {
            if let Some(b) = self.bindings[r.encoding() as usize] {
                if b.refcount == 0 && !b.pinned && !b.delayed {
                    if best.map_or(true, |(_, t)| b.touch < t) {
                        best = Some((r, b.touch));
                    }
                }
            }
        }
        if let Some((r, _)) = best {
            return Ok(r);
        }
        // Delayed bindings are only a hint; give them up under pressure.
        for &r in &ALLOCATABLE {
            if let Some(b) = self.bindings[r.encoding() as usize] {
                if b.refcount == 0 && !b.pinned {
                    if best.map_or(true, |(_, t)| b.touch < t) {
                        best = Some((r, b.touch));
                    }
                }
            }
        }
        best.map(|(r, _)| r)
            .ok_or(CompileError::RegisterPressure(ALLOCATABLE.len()))
    }

    /// Flush (if dirty) and drop the binding in `reg`.
    fn evict(&mut self, sink: &mut Sink, reg: Gpr) -> Result<(), CompileError> {
        if let Some(b) = self.bindings[reg.encoding() as usize].take() {
            if b.dirty {
                if let Some(vreg) = b.guest {
                    sink.push(LirOp::Store {
                        mem: self.guest_slot(vreg),
                        src: reg,
                        width: StoreWidth::W64,
                    })?;
                }
            }
        }
        Ok(())
    }

    fn claim(&mut self, sink: &mut Sink) -> Result<Gpr, CompileError> {
        let reg = self.pick_victim()?;
        self.evict(sink, reg)?;
        Ok(reg)
    }

    /// Allocate a scratch temporary.
    pub fn alloc_temp(&mut self, sink: &mut Sink) -> Result<Gpr, CompileError> {
        let reg = self.claim(sink)?;
        let touch = self.bump();
        self.bindings[reg.encoding() as usize] = Some(Binding {
            guest: None,
            refcount: 1,
            dirty: false,
            pinned: false,
            delayed: false,
            touch,
        });
        Ok(reg)
    }

    /// Bind a guest vreg for reading: reuse the cached copy, materialize a
    /// tracked constant, or load from the home slot.
    pub fn alloc_guest(&mut self, sink: &mut Sink, vreg: VReg) -> Result<Gpr, CompileError> {
        if let Some(reg) = self.reg_of(vreg) {
            let touch = self.bump();
            let b = self.bindings[reg.encoding() as usize]
                .as_mut()
                .ok_or(CompileError::RegisterPressure(0))?;
            b.refcount += 1;
            b.touch = touch;
            return Ok(reg);
        }
        let reg = self.claim(sink)?;
        if let Some(value) = self.constants.get(&vreg).copied() {
            sink.push(LirOp::LoadImm64 { dst: reg, imm: value })?;
        } else {
            sink.push(LirOp::Load {
                dst: reg,
                mem: self.guest_slot(vreg),
                kind: LoadKind::W64,
            })?;
        }
        let touch = self.bump();
        // A binding only disappears after its value reaches the home slot,
        // so a fresh load or materialization starts clean.
        self.bindings[reg.encoding() as usize] = Some(Binding {
            guest: Some(vreg),
            refcount: 1,
            dirty: false,
            pinned: false,
            delayed: false,
            touch,
        });
        Ok(reg)
    }

    /// Bind a guest vreg as a destination: no load, the old value is dead.
    /// The caller computes into the register and then calls [`mark_dirty`].
    ///
    /// [`mark_dirty`]: RegAlloc::mark_dirty
    pub fn alloc_guest_dst(&mut self, sink: &mut Sink, vreg: VReg) -> Result<Gpr, CompileError> {
        self.constants.remove(&vreg);
        if let Some(reg) = self.reg_of(vreg) {
            let touch = self.bump();
            if let Some(b) = self.bindings[reg.encoding() as usize].as_mut() {
                b.refcount += 1;
                b.touch = touch;
            }
            return Ok(reg);
        }
        let reg = self.claim(sink)?;
        let touch = self.bump();
        self.bindings[reg.encoding() as usize] = Some(Binding {
            guest: Some(vreg),
            refcount: 1,
            dirty: false,
            pinned: false,
            delayed: false,
            touch,
        });
        Ok(reg)
    }

    /// Claim a specific register as a temporary (division and shifts have
    /// fixed-register operands). Fails if the register is mid-use.
    pub fn alloc_fixed(&mut self, sink: &mut Sink, reg: Gpr) -> Result<(), CompileError> {
        if let Some(b) = self.bindings[reg.encoding() as usize] {
            if b.refcount > 0 || b.pinned {
                return Err(CompileError::RegisterPressure(1));
            }
        }
        self.evict(sink, reg)?;
        let touch = self.bump();
        self.bindings[reg.encoding() as usize] = Some(Binding {
            guest: None,
            refcount: 1,
            dirty: false,
            pinned: false,
            delayed: false,
            touch,
        });
        Ok(())
    }

    /// Rebind a register to a new guest vreg before its value is destroyed
    /// in place (the common arithmetic pattern: the first source register
    /// becomes the destination). The old binding's value is written back
    /// first if it was the only up-to-date copy.
    pub fn rebind_as(
        &mut self,
        sink: &mut Sink,
        reg: Gpr,
        vreg: VReg,
    ) -> Result<(), CompileError> {
        let old = self.bindings[reg.encoding() as usize];
        if let Some(b) = old {
            if b.dirty && b.guest != Some(vreg) {
                if let Some(old_vreg) = b.guest {
                    sink.push(LirOp::Store {
                        mem: self.guest_slot(old_vreg),
                        src: reg,
                        width: StoreWidth::W64,
                    })?;
                }
            }
        }
        self.constants.remove(&vreg);
        // A stale copy of the destination elsewhere is dead; drop it without
        // a store so it cannot shadow the new binding.
        if let Some(prev) = self.reg_of(vreg) {
            if prev != reg {
                self.bindings[prev.encoding() as usize] = None;
            }
        }
        let refcount = old.map_or(1, |b| b.refcount.max(1));
        let touch = self.bump();
        self.bindings[reg.encoding() as usize] = Some(Binding {
            guest: Some(vreg),
            refcount,
            dirty: true,
            pinned: old.map_or(false, |b| b.pinned),
            delayed: false,
            touch,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Binding state
    // -------------------------------------------------------------------------

    pub fn pin(&mut self, reg: Gpr) {
        if let Some(b) = self.bindings[reg.encoding() as usize].as_mut() {
            b.pinned = true;
        }
    }

    pub fn unpin(&mut self, reg: Gpr) {
        if let Some(b) = self.bindings[reg.encoding() as usize].as_mut() {
            b.pinned = false;
        }
    }

    pub fn delay(&mut self, reg: Gpr) {
        if let Some(b) = self.bindings[reg.encoding() as usize].as_mut() {
            b.delayed = true;
        }
    }

    pub fn cancel_delay(&mut self, reg: Gpr) {
        if let Some(b) = self.bindings[reg.encoding() as usize].as_mut() {
            b.delayed = false;
        }
    }

    /// The register's copy is now newer than the home slot. Any tracked
    /// constant for the bound vreg is stale unless the caller re-records it.
    pub fn mark_dirty(&mut self, reg: Gpr) {
        if let Some(b) = self.bindings[reg.encoding() as usize].as_mut() {
            b.dirty = true;
            if let Some(vreg) = b.guest {
                self.constants.remove(&vreg);
            }
        }
    }

    /// Release one reference. Guest bindings stay resident as a cache;
    /// fully-released temporaries free their register immediately.
    pub fn free(&mut self, reg: Gpr) {
        let slot = &mut self.bindings[reg.encoding() as usize];
        if let Some(b) = slot.as_mut() {
            b.refcount = b.refcount.saturating_sub(1);
            if b.refcount == 0 {
                b.pinned = false;
                if b.guest.is_none() && !b.delayed {
                    *slot = None;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Flushing
    // -------------------------------------------------------------------------

    /// Write every dirty guest binding back to its home slot. Bindings stay
    /// resident and clean.
    pub fn flush_all(&mut self, sink: &mut Sink) -> Result<(), CompileError> {
        for &r in &ALLOCATABLE {
            let (vreg, store) = match self.bindings[r.encoding() as usize].as_mut() {
                Some(b) if b.dirty => {
                    b.dirty = false;
                    match b.guest {
                        Some(v) => (v, true),
                        None => continue,
                    }
                }
                _ => continue,
            };
            if store {
                sink.push(LirOp::Store {
                    mem: self.guest_slot(vreg),
                    src: r,
                    width: StoreWidth::W64,
                })?;
            }
        }
        Ok(())
    }

    /// Write everything back and drop every binding and tracked constant.
    /// Used at guest control-flow boundaries where the incoming state must
    /// be memory-authoritative (trace entry, loop back edges, exits).
    pub fn flush_and_invalidate(&mut self, sink: &mut Sink) -> Result<(), CompileError> {
        self.flush_all(sink)?;
        for &r in &ALLOCATABLE {
            self.bindings[r.encoding() as usize] = None;
        }
        self.constants.clear();
        Ok(())
    }

    /// Prepare for a helper call: dirty caller-saved guest values go to
    /// their home slots and the bindings drop (memory becomes
    /// authoritative); pinned caller-saved registers are spilled and the
    /// spill list is returned for [`reload_spills`] after the call.
    ///
    /// [`reload_spills`]: RegAlloc::reload_spills
    pub fn kill_caller_saved(
        &mut self,
        sink: &mut Sink,
        cc: CallingConvention,
    ) -> Result<Vec<(Gpr, u16)>, CompileError> {
        let volatile = cc.volatile_gprs();
        let mut spills = Vec::new();
        for &r in &ALLOCATABLE {
            if !volatile.contains(r) {
                continue;
            }
            let Some(b) = self.bindings[r.encoding() as usize] else {
                continue;
            };
            if b.pinned {
                let slot = self.next_spill;
                self.next_spill += 1;
                self.max_spill = self.max_spill.max(self.next_spill);
                sink.push(LirOp::Store {
                    mem: self.spill_mem(slot),
                    src: r,
                    width: StoreWidth::W64,
                })?;
                spills.push((r, slot));
            } else {
                if b.dirty {
                    if let Some(vreg) = b.guest {
                        sink.push(LirOp::Store {
                            mem: self.guest_slot(vreg),
                            src: r,
                            width: StoreWidth::W64,
                        })?;
                    }
                }
                self.bindings[r.encoding() as usize] = None;
            }
        }
        Ok(spills)
    }

    /// Reload registers spilled by [`kill_caller_saved`], in reverse order.
    ///
    /// [`kill_caller_saved`]: RegAlloc::kill_caller_saved
    pub fn reload_spills(
        &mut self,
        sink: &mut Sink,
        spills: &[(Gpr, u16)],
    ) -> Result<(), CompileError> {
        for &(reg, slot) in spills.iter().rev() {
            sink.push(LirOp::Load {
                dst: reg,
                mem: self.spill_mem(slot),
                kind: LoadKind::W64,
            })?;
            self.next_spill = self.next_spill.saturating_sub(1);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshot protocol
    // -------------------------------------------------------------------------

    fn current_snapshot(&self) -> Snapshot {
        let mut bindings = [None; 16];
        for &r in &ALLOCATABLE {
            if let Some(b) = self.bindings[r.encoding() as usize] {
                if let Some(vreg) = b.guest {
                    bindings[r.encoding() as usize] = Some((vreg, b.dirty));
                }
            }
        }
        let mut constants: Vec<(VReg, i64)> =
            self.constants.iter().map(|(&v, &c)| (v, c)).collect();
        constants.sort_unstable_by_key(|&(v, _)| v);
        Snapshot { bindings, constants }
    }

    fn adopt(&mut self, snap: &Snapshot) {
        let touch = self.bump();
        for &r in &ALLOCATABLE {
            // Live temporaries span the merge on both sides (the reconverged
            // value rides in them); snapshots never claim their registers.
            if let Some(b) = self.bindings[r.encoding() as usize] {
                if b.guest.is_none() && b.refcount > 0 {
                    debug_assert!(snap.bindings[r.encoding() as usize].is_none());
                    continue;
                }
            }
            self.bindings[r.encoding() as usize] =
                snap.bindings[r.encoding() as usize].map(|(vreg, dirty)| Binding {
                    guest: Some(vreg),
                    refcount: 0,
                    dirty,
                    pinned: false,
                    delayed: false,
                    touch,
                });
        }
        self.constants = snap.constants.iter().copied().collect();
    }

    /// Capture the binding tables at a control-flow split.
    pub fn remember_state(&mut self, id: u32) {
        let snap = self.current_snapshot();
        self.snapshots.insert(id, snap);
    }

    /// Emit the loads and stores that force the current state into the
    /// remembered shape, then adopt it. Used at the end of an out-of-line
    /// path before jumping back.
    pub fn go_to_state(&mut self, sink: &mut Sink, id: u32) -> Result<(), CompileError> {
        let snap = self
            .snapshots
            .get(&id)
            .cloned()
            .ok_or(CompileError::UnknownSnapshot(id))?;

        // The snapshot's constants must hold on this path too; substituting
        // differently on the two sides of a diamond is a compilation defect.
        for &(vreg, value) in &snap.constants {
            match self.constants.get(&vreg) {
                Some(&c) if c == value => {}
                other => {
                    return Err(CompileError::StateMergeMismatch {
                        id,
                        detail: format!(
                            "constant for {vreg}: snapshot {value}, path has {other:?}"
                        ),
                    });
                }
            }
        }

        for &r in &ALLOCATABLE {
            let want = snap.bindings[r.encoding() as usize];
            let cur = self.bindings[r.encoding() as usize];
            if let Some(b) = cur {
                if b.guest.is_none() && b.refcount > 0 {
                    // Live temporary carrying the merged value; leave it be.
                    if want.is_some() {
                        return Err(CompileError::StateMergeMismatch {
                            id,
                            detail: format!("{r}: snapshot wants a guest in a live temporary"),
                        });
                    }
                    continue;
                }
            }
            match (cur, want) {
                (Some(b), Some((wv, wd))) if b.guest == Some(wv) => {
                    // Same value; reconcile dirtiness. Claiming dirty when
                    // clean only costs a redundant store later; the reverse
                    // needs the store now.
                    if b.dirty && !wd {
                        sink.push(LirOp::Store {
                            mem: self.guest_slot(wv),
                            src: r,
                            width: StoreWidth::W64,
                        })?;
                    }
                }
                (cur, want) => {
                    if cur.is_some() {
                        self.evict(sink, r)?;
                    }
                    if let Some((wv, _)) = want {
                        if let Some(value) = self.constants.get(&wv).copied() {
                            sink.push(LirOp::LoadImm64 { dst: r, imm: value })?;
                        } else {
                            sink.push(LirOp::Load {
                                dst: r,
                                mem: self.guest_slot(wv),
                                kind: LoadKind::W64,
                            })?;
                        }
                    }
                }
            }
        }
        self.adopt(&snap);
        Ok(())
    }

    /// Verify the current state already matches the remembered shape and
    /// adopt it, emitting nothing. Used on the path that falls through a
    /// merge point.
    pub fn transfer_to_state(&mut self, id: u32) -> Result<(), CompileError> {
        let snap = self
            .snapshots
            .get(&id)
            .cloned()
            .ok_or(CompileError::UnknownSnapshot(id))?;
        let cur = self.current_snapshot();
        for &r in &ALLOCATABLE {
            let i = r.encoding() as usize;
            if cur.bindings[i] != snap.bindings[i] {
                return Err(CompileError::StateMergeMismatch {
                    id,
                    detail: format!(
                        "{r}: path has {:?}, snapshot has {:?}",
                        cur.bindings[i], snap.bindings[i]
                    ),
                });
            }
        }
        if cur.constants != snap.constants {
            return Err(CompileError::StateMergeMismatch {
                id,
                detail: "constant maps diverge".to_string(),
            });
        }
        self.adopt(&snap);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
