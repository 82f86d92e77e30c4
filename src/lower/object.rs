//! Object lowering: instance and static fields, allocation, type checks,
//! monitors, and the cached-resolution constants.
//!
//! Everything that may miss the resolution cache is a diamond: the fast
//! path keeps going with the cached entry, the slow path calls the resolver
//! and rejoins under the allocator's snapshot protocol. A static field's
//! cache entry is the address of its storage cell; class entries are the
//! class pointer itself.

use crate::backend::x64::encoder::Condition;
use crate::backend::x64::MemOperand;
use crate::bytecode::{DecodedInsn, ElemWidth};
use crate::error::CompileError;
use crate::helpers::{HelperArg, RuntimeHelper};
use crate::lir::{ClassedMem, LirOp, LoadKind, StoreWidth};
use crate::stream::ImmWidth;

use super::{Ctx, OBJ_CLASS_OFFSET};

pub(super) fn lower_const_cache(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    resolver: RuntimeHelper,
) -> Result<(), CompileError> {
    let entry = ctx.load_cache_entry(insn.imm as u32, resolver, insn.pc)?;
    ctx.ra.rebind_as(ctx.sink, entry, insn.dst)?;
    ctx.ra.free(entry);
    Ok(())
}

// =============================================================================
// Instance fields
// =============================================================================

pub(super) fn lower_iget(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    width: ElemWidth,
) -> Result<(), CompileError> {
    let o = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.null_check(o, insn)?;
    let d = ctx.ra.alloc_guest_dst(ctx.sink, insn.dst)?;
    ctx.sink.push(LirOp::Load {
        dst: d,
        mem: ClassedMem::unclassified(MemOperand::base_disp(o, insn.imm as i32)),
        kind: width.load_kind(),
    })?;
    ctx.ra.mark_dirty(d);
    ctx.ra.free(o);
    ctx.ra.free(d);
    Ok(())
}

pub(super) fn lower_iput(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    width: ElemWidth,
) -> Result<(), CompileError> {
    let v = ctx.ra.alloc_guest(ctx.sink, insn.dst)?;
    let o = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.null_check(o, insn)?;
    ctx.sink.push(LirOp::Store {
        mem: ClassedMem::unclassified(MemOperand::base_disp(o, insn.imm as i32)),
        src: v,
        width: width.store_width(),
    })?;
    ctx.ra.free(v);
    ctx.ra.free(o);
    Ok(())
}

// =============================================================================
// Static fields
// =============================================================================

pub(super) fn lower_sget(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    let entry = ctx.load_cache_entry(insn.imm as u32, RuntimeHelper::ResolveField, insn.pc)?;
    let d = ctx.ra.alloc_guest_dst(ctx.sink, insn.dst)?;
    ctx.sink.push(LirOp::Load {
        dst: d,
        mem: ClassedMem::unclassified(MemOperand::base(entry)),
        kind: LoadKind::W64,
    })?;
    ctx.ra.mark_dirty(d);
    ctx.ra.free(entry);
    ctx.ra.free(d);
    Ok(())
}

pub(super) fn lower_sput(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    let entry = ctx.load_cache_entry(insn.imm as u32, RuntimeHelper::ResolveField, insn.pc)?;
    let v = ctx.ra.alloc_guest(ctx.sink, insn.dst)?;
    ctx.sink.push(LirOp::Store {
        mem: ClassedMem::unclassified(MemOperand::base(entry)),
        src: v,
        width: StoreWidth::W64,
    })?;
    ctx.ra.free(v);
    ctx.ra.free(entry);
    Ok(())
}

// =============================================================================
// Allocation and monitors
// =============================================================================

pub(super) fn lower_new_instance(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
) -> Result<(), CompileError> {
    let ret = ctx.call(
        RuntimeHelper::AllocObject,
        &[HelperArg::Frame, HelperArg::Imm(insn.imm)],
        insn.pc,
    )?;
    ctx.commit_result(ret, insn.dst)
}

pub(super) fn lower_monitor(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    helper: RuntimeHelper,
) -> Result<(), CompileError> {
    let o = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.null_check(o, insn)?;
    ctx.call(helper, &[HelperArg::Frame, HelperArg::Reg(o)], insn.pc)?;
    ctx.ra.free(o);
    Ok(())
}

// =============================================================================
// Type checks
// =============================================================================

/// `check-cast`: null passes, an exact class match passes, anything else
/// asks the runtime (which throws on failure). Both skip edges and the
/// slow-path rejoin share one snapshot.
pub(super) fn lower_check_cast(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
) -> Result<(), CompileError> {
    // Bind the object before the cache probe so its binding lands in the
    // probe's snapshot and survives a resolver call.
    let o = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.ra.free(o);
    let entry = ctx.load_cache_entry(insn.imm as u32, RuntimeHelper::ResolveClass, insn.pc)?;
    let o = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    let cls = ctx.ra.alloc_temp(ctx.sink)?;

    let done = ctx.labels.new_local();
    let id = ctx.new_merge_id();
    ctx.sink.push(LirOp::TestRR { a: o, b: o })?;
    ctx.ra.remember_state(id);
    ctx.labels
        .jcc_local(ctx.sink.stream()?, Condition::Equal, done, ImmWidth::B32)?;

    ctx.sink.push(LirOp::Load {
        dst: cls,
        mem: ClassedMem::unclassified(MemOperand::base_disp(o, OBJ_CLASS_OFFSET)),
        kind: LoadKind::W64,
    })?;
    ctx.sink.push(LirOp::CmpRR { a: cls, b: entry })?;
    ctx.labels
        .jcc_local(ctx.sink.stream()?, Condition::Equal, done, ImmWidth::B32)?;

    ctx.call(
        RuntimeHelper::CheckCast,
        &[HelperArg::Frame, HelperArg::Reg(o), HelperArg::Imm(insn.imm)],
        insn.pc,
    )?;
    ctx.ra.go_to_state(ctx.sink, id)?;

    ctx.labels.bind_local(ctx.sink.stream()?, done)?;
    ctx.ra.transfer_to_state(id)?;
    ctx.ra.free(cls);
    ctx.ra.free(entry);
    ctx.ra.free(o);
    Ok(())
}

/// `instance-of`: 0 for null, 1 for an exact class match, otherwise the
/// runtime decides. The result rides in a pinned temporary so the slow
/// path's helper call cannot lose it.
pub(super) fn lower_instance_of(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
) -> Result<(), CompileError> {
    let o = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.ra.free(o);
    let entry = ctx.load_cache_entry(insn.imm as u32, RuntimeHelper::ResolveClass, insn.pc)?;
    let o = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    let d = ctx.ra.alloc_temp(ctx.sink)?;
    ctx.ra.pin(d);
    let cls = ctx.ra.alloc_temp(ctx.sink)?;

    ctx.sink.push(LirOp::Alu {
        op: crate::lir::AluOp::Xor,
        dst: d,
        src: d,
    })?;

    let done = ctx.labels.new_local();
    let slow = ctx.labels.new_local();
    let id = ctx.new_merge_id();
    ctx.sink.push(LirOp::TestRR { a: o, b: o })?;
    ctx.ra.remember_state(id);
    ctx.labels
        .jcc_local(ctx.sink.stream()?, Condition::Equal, done, ImmWidth::B32)?;

    ctx.sink.push(LirOp::Load {
        dst: cls,
        mem: ClassedMem::unclassified(MemOperand::base_disp(o, OBJ_CLASS_OFFSET)),
        kind: LoadKind::W64,
    })?;
    ctx.sink.push(LirOp::CmpRR { a: cls, b: entry })?;
    ctx.labels
        .jcc_local(ctx.sink.stream()?, Condition::NotEqual, slow, ImmWidth::B32)?;
    ctx.sink.push(LirOp::LoadImm32 { dst: d, imm: 1 })?;
    ctx.labels
        .jmp_local(ctx.sink.stream()?, done, ImmWidth::B32)?;

    ctx.labels.bind_local(ctx.sink.stream()?, slow)?;
    let ret = ctx.call(
        RuntimeHelper::InstanceOf,
        &[HelperArg::Frame, HelperArg::Reg(o), HelperArg::Imm(insn.imm)],
        insn.pc,
    )?;
    ctx.sink.push(LirOp::MovRR { dst: d, src: ret })?;
    ctx.ra.go_to_state(ctx.sink, id)?;

    ctx.labels.bind_local(ctx.sink.stream()?, done)?;
    ctx.ra.transfer_to_state(id)?;
    ctx.ra.free(cls);
    ctx.ra.free(entry);
    ctx.ra.free(o);
    ctx.ra.unpin(d);
    ctx.ra.rebind_as(ctx.sink, d, insn.dst)?;
    ctx.ra.free(d);
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::{CallingConvention, Gpr};
    use crate::bytecode::{Opcode, VReg};
    use crate::frame::FrameLayout;
    use crate::helpers::HelperTable;
    use crate::labels::Labels;
    use crate::lir::MemClass;
    use crate::regalloc::RegAlloc;
    use crate::sched::Sink;
    use crate::stream::CodeStream;

    struct Harness {
        sink: Sink,
        ra: RegAlloc,
        labels: Labels,
        helpers: HelperTable,
        next_merge: u32,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                sink: Sink::new(CodeStream::new(), false),
                ra: RegAlloc::new(FrameLayout::new(8)),
                labels: Labels::new(),
                helpers: HelperTable::new(),
                next_merge: 0,
            }
        }

        fn lower(&mut self, insn: &DecodedInsn) {
            let mut ctx = Ctx {
                sink: &mut self.sink,
                ra: &mut self.ra,
                labels: &mut self.labels,
                helpers: &self.helpers,
                cc: CallingConvention::SystemV,
                cache_base: 0x4000,
                switches: &[],
                payloads: &[],
                entry_pc: 0,
                next_merge: &mut self.next_merge,
            };
            super::super::lower_insn(&mut ctx, insn).unwrap();
        }
    }

    #[test]
    fn iget_uses_resolved_offset() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::IGet(ElemWidth::B8), 0)
                .with_regs(VReg(1), VReg(0), VReg(0))
                .with_imm(24)
                .with_flags(crate::bytecode::OptFlags::NULL_CHECK_ELIDED),
        );
        let bytes = h.sink.into_stream().unwrap().into_bytes();
        let mut expected = Vec::new();
        for op in [
            LirOp::Load {
                dst: Gpr::Rax,
                mem: ClassedMem::new(
                    FrameLayout::new(8).vreg_slot(VReg(0)),
                    MemClass::GuestSlot(VReg(0)),
                ),
                kind: LoadKind::W64,
            },
            LirOp::Load {
                dst: Gpr::Rcx,
                mem: ClassedMem::unclassified(MemOperand::base_disp(Gpr::Rax, 24)),
                kind: LoadKind::W64,
            },
        ] {
            expected.extend_from_slice(crate::lir::encode_lir(&op).as_slice());
        }
        assert_eq!(bytes, expected);
    }

    #[test]
    fn sget_resolves_through_cache() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::SGet, 0x10)
                .with_regs(VReg(0), VReg(0), VReg(0))
                .with_imm(3),
        );
        // All local labels from the miss diamond must have closed.
        h.labels.finish().unwrap();
        // The miss path pulled in no throw tails.
        assert!(!h.labels.helper_used(crate::labels::HelperLabel::ThrowNull));
    }

    #[test]
    fn const_string_commits_entry_to_dst() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::ConstString, 0)
                .with_regs(VReg(2), VReg(0), VReg(0))
                .with_imm(5),
        );
        h.labels.finish().unwrap();
        assert!(h.ra.reg_of(VReg(2)).is_some());
    }

    #[test]
    fn check_cast_closes_its_diamond() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::CheckCast, 0x20)
                .with_regs(VReg(0), VReg(0), VReg(0))
                .with_imm(9),
        );
        h.labels.finish().unwrap();
    }

    #[test]
    fn instance_of_closes_and_commits() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::InstanceOf, 0x20)
                .with_regs(VReg(1), VReg(0), VReg(0))
                .with_imm(9),
        );
        h.labels.finish().unwrap();
        assert!(h.ra.reg_of(VReg(1)).is_some());
    }
}
