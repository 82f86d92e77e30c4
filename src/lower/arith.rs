//! Data movement, integer arithmetic and the three-way compare.

use crate::backend::x64::encoder::Condition;
use crate::backend::x64::Gpr;
use crate::bytecode::{BinOp, DecodedInsn, Opcode, OptFlags, VReg};
use crate::error::CompileError;
use crate::labels::HelperLabel;
use crate::lir::{AluOp, LirOp, LoadKind, ShiftKind};

use super::Ctx;

/// Second source of a binary operation: a vreg or a decoded literal.
#[derive(Clone, Copy)]
enum Operand {
    Reg(VReg),
    Imm(i64),
}

fn fits_i32(v: i64) -> bool {
    v >= i32::MIN as i64 && v <= i32::MAX as i64
}

// =============================================================================
// Moves and constants
// =============================================================================

pub(super) fn lower_data(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    match insn.opcode {
        Opcode::Move => {
            let known = ctx.ra.constant_of(insn.src1);
            let s = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
            let d = ctx.ra.alloc_guest_dst(ctx.sink, insn.dst)?;
            if d != s {
                ctx.sink.push(LirOp::MovRR { dst: d, src: s })?;
            }
            ctx.ra.mark_dirty(d);
            if let Some(value) = known {
                ctx.ra.set_constant(insn.dst, value);
            }
            ctx.ra.free(s);
            ctx.ra.free(d);
        }
        _ => {
            // Const and ConstWide: materialize and track. Keeping the value
            // in a dirty binding lets the normal flush discipline reach the
            // home slot, so the constant map never needs its own stores.
            let d = ctx.ra.alloc_guest_dst(ctx.sink, insn.dst)?;
            ctx.sink.push(LirOp::LoadImm64 {
                dst: d,
                imm: insn.imm,
            })?;
            ctx.ra.mark_dirty(d);
            ctx.ra.set_constant(insn.dst, insn.imm);
            ctx.ra.free(d);
        }
    }
    Ok(())
}

// =============================================================================
// Binary operations
// =============================================================================

pub(super) fn lower_binary(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    op: BinOp,
) -> Result<(), CompileError> {
    dispatch_binary(ctx, insn, op, Operand::Reg(insn.src2))
}

pub(super) fn lower_binary_lit(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    op: BinOp,
) -> Result<(), CompileError> {
    dispatch_binary(ctx, insn, op, Operand::Imm(insn.imm))
}

fn dispatch_binary(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    op: BinOp,
    src2: Operand,
) -> Result<(), CompileError> {
    // A register source with a tracked constant degrades to the literal
    // form when the value fits an encodable immediate.
    let src2 = match src2 {
        Operand::Reg(v) => match ctx.ra.constant_of(v) {
            Some(c) if fits_i32(c) => Operand::Imm(c),
            _ => Operand::Reg(v),
        },
        imm => imm,
    };
    match op {
        BinOp::Add => emit_alu(ctx, insn, AluOp::Add, true, src2),
        BinOp::Sub => emit_alu(ctx, insn, AluOp::Sub, false, src2),
        BinOp::And => emit_alu(ctx, insn, AluOp::And, true, src2),
        BinOp::Or => emit_alu(ctx, insn, AluOp::Or, true, src2),
        BinOp::Xor => emit_alu(ctx, insn, AluOp::Xor, true, src2),
        BinOp::Mul => emit_mul(ctx, insn, src2),
        BinOp::Div => emit_div(ctx, insn, src2, false),
        BinOp::Rem => emit_div(ctx, insn, src2, true),
        BinOp::Shl => emit_shift(ctx, insn, ShiftKind::Shl, src2),
        // Guest `shr` is arithmetic, `ushr` is logical.
        BinOp::Shr => emit_shift(ctx, insn, ShiftKind::Sar, src2),
        BinOp::Ushr => emit_shift(ctx, insn, ShiftKind::Shr, src2),
    }
}

/// Two-address ALU form. The destination takes over the first source's
/// register; when the op is commutative and the destination already sits in
/// the second source, the operands swap instead.
fn emit_alu(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    op: AluOp,
    commutative: bool,
    src2: Operand,
) -> Result<(), CompileError> {
    if let Operand::Reg(v2) = src2 {
        if commutative && insn.dst == v2 && insn.dst != insn.src1 {
            let d = ctx.ra.alloc_guest(ctx.sink, v2)?;
            let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
            ctx.sink.push(LirOp::Alu { op, dst: d, src: s1 })?;
            ctx.ra.mark_dirty(d);
            ctx.ra.free(s1);
            ctx.ra.free(d);
            return Ok(());
        }
    }

    let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    match src2 {
        Operand::Reg(v2) => {
            let s2 = ctx.ra.alloc_guest(ctx.sink, v2)?;
            if insn.dst != insn.src1 {
                ctx.ra.rebind_as(ctx.sink, s1, insn.dst)?;
            }
            ctx.sink.push(LirOp::Alu { op, dst: s1, src: s2 })?;
            ctx.ra.mark_dirty(s1);
            ctx.ra.free(s2);
        }
        Operand::Imm(imm) if fits_i32(imm) => {
            if insn.dst != insn.src1 {
                ctx.ra.rebind_as(ctx.sink, s1, insn.dst)?;
            }
            ctx.sink.push(LirOp::AluImm {
                op,
                dst: s1,
                imm: imm as i32,
            })?;
            ctx.ra.mark_dirty(s1);
        }
        Operand::Imm(imm) => {
            let t = ctx.ra.alloc_temp(ctx.sink)?;
            ctx.sink.push(LirOp::LoadImm64 { dst: t, imm })?;
            if insn.dst != insn.src1 {
                ctx.ra.rebind_as(ctx.sink, s1, insn.dst)?;
            }
            ctx.sink.push(LirOp::Alu { op, dst: s1, src: t })?;
            ctx.ra.mark_dirty(s1);
            ctx.ra.free(t);
        }
    }
    ctx.ra.free(s1);
    Ok(())
}

fn emit_mul(ctx: &mut Ctx<'_>, insn: &DecodedInsn, src2: Operand) -> Result<(), CompileError> {
    match src2 {
        Operand::Imm(imm) if fits_i32(imm) => {
            // Three-operand form: read the source, write the destination
            // binding directly.
            let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
            let d = ctx.ra.alloc_guest_dst(ctx.sink, insn.dst)?;
            ctx.sink.push(LirOp::ImulImm {
                dst: d,
                src: s1,
                imm: imm as i32,
            })?;
            ctx.ra.mark_dirty(d);
            ctx.ra.free(s1);
            ctx.ra.free(d);
            Ok(())
        }
        Operand::Imm(imm) => {
            let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
            let t = ctx.ra.alloc_temp(ctx.sink)?;
            ctx.sink.push(LirOp::LoadImm64 { dst: t, imm })?;
            if insn.dst != insn.src1 {
                ctx.ra.rebind_as(ctx.sink, s1, insn.dst)?;
            }
            ctx.sink.push(LirOp::Imul { dst: s1, src: t })?;
            ctx.ra.mark_dirty(s1);
            ctx.ra.free(t);
            ctx.ra.free(s1);
            Ok(())
        }
        Operand::Reg(_) => emit_alu_mul(ctx, insn, src2),
    }
}

fn emit_alu_mul(ctx: &mut Ctx<'_>, insn: &DecodedInsn, src2: Operand) -> Result<(), CompileError> {
    let Operand::Reg(v2) = src2 else {
        return Err(CompileError::UnsupportedOpcode("mul", insn.pc));
    };
    if insn.dst == v2 && insn.dst != insn.src1 {
        let d = ctx.ra.alloc_guest(ctx.sink, v2)?;
        let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
        ctx.sink.push(LirOp::Imul { dst: d, src: s1 })?;
        ctx.ra.mark_dirty(d);
        ctx.ra.free(s1);
        ctx.ra.free(d);
        return Ok(());
    }
    let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    let s2 = ctx.ra.alloc_guest(ctx.sink, v2)?;
    if insn.dst != insn.src1 {
        ctx.ra.rebind_as(ctx.sink, s1, insn.dst)?;
    }
    ctx.sink.push(LirOp::Imul { dst: s1, src: s2 })?;
    ctx.ra.mark_dirty(s1);
    ctx.ra.free(s2);
    ctx.ra.free(s1);
    Ok(())
}

// =============================================================================
// Division
// =============================================================================

/// Signed division through RAX/RDX. The divisor is bound last so it cannot
/// land in either fixed register, and the dividend is materialized into RAX
/// by hand because RAX is claimed as a bare temporary.
fn emit_div(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    src2: Operand,
    want_rem: bool,
) -> Result<(), CompileError> {
    // Zero-divisor guard first, while nothing is committed to the fixed
    // registers.
    match src2 {
        Operand::Imm(0) => {
            // Statically zero: this always throws.
            ctx.ra.flush_all(ctx.sink)?;
            ctx.stage_pc(insn.pc)?;
            let stream = ctx.sink.stream()?;
            return ctx.labels.jmp_helper(stream, HelperLabel::ThrowDivZero);
        }
        Operand::Imm(_) => {}
        Operand::Reg(v2) => {
            if !insn.flags.contains(OptFlags::RANGE_CHECK_ELIDED) {
                let s2 = ctx.ra.alloc_guest(ctx.sink, v2)?;
                ctx.sink.push(LirOp::TestRR { a: s2, b: s2 })?;
                ctx.ra.free(s2);
                ctx.guard(Condition::Equal, HelperLabel::ThrowDivZero, insn.pc)?;
            }
        }
    }

    ctx.ra.alloc_fixed(ctx.sink, Gpr::Rax)?;
    ctx.ra.alloc_fixed(ctx.sink, Gpr::Rdx)?;

    let divisor = match src2 {
        Operand::Reg(v2) => ctx.ra.alloc_guest(ctx.sink, v2)?,
        Operand::Imm(imm) => {
            let t = ctx.ra.alloc_temp(ctx.sink)?;
            ctx.sink.push(LirOp::LoadImm64 { dst: t, imm })?;
            t
        }
    };

    // Dividend into RAX.
    if let Some(r) = ctx.ra.reg_of(insn.src1) {
        ctx.sink.push(LirOp::MovRR {
            dst: Gpr::Rax,
            src: r,
        })?;
    } else if let Some(c) = ctx.ra.constant_of(insn.src1) {
        ctx.sink.push(LirOp::LoadImm64 {
            dst: Gpr::Rax,
            imm: c,
        })?;
    } else {
        let frame = ctx.frame();
        ctx.sink.push(LirOp::Load {
            dst: Gpr::Rax,
            mem: crate::lir::ClassedMem::new(
                frame.vreg_slot(insn.src1),
                crate::lir::MemClass::GuestSlot(insn.src1),
            ),
            kind: LoadKind::W64,
        })?;
    }

    ctx.sink.push(LirOp::Cqo)?;
    ctx.sink.push(LirOp::Idiv { src: divisor })?;

    let (result, other) = if want_rem {
        (Gpr::Rdx, Gpr::Rax)
    } else {
        (Gpr::Rax, Gpr::Rdx)
    };
    ctx.ra.free(other);
    ctx.ra.free(divisor);
    ctx.ra.rebind_as(ctx.sink, result, insn.dst)?;
    ctx.ra.free(result);
    Ok(())
}

// =============================================================================
// Shifts
// =============================================================================

fn emit_shift(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    kind: ShiftKind,
    src2: Operand,
) -> Result<(), CompileError> {
    if let Operand::Imm(imm) = src2 {
        let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
        if insn.dst != insn.src1 {
            ctx.ra.rebind_as(ctx.sink, s1, insn.dst)?;
        }
        ctx.sink.push(LirOp::ShiftImm {
            kind,
            dst: s1,
            imm: (imm & 63) as u8,
        })?;
        ctx.ra.mark_dirty(s1);
        ctx.ra.free(s1);
        return Ok(());
    }
    let Operand::Reg(v2) = src2 else {
        return Err(CompileError::UnsupportedOpcode("shift", insn.pc));
    };

    // Variable count rides in CL.
    ctx.ra.alloc_fixed(ctx.sink, Gpr::Rcx)?;
    if let Some(r) = ctx.ra.reg_of(v2) {
        if r != Gpr::Rcx {
            ctx.sink.push(LirOp::MovRR {
                dst: Gpr::Rcx,
                src: r,
            })?;
        }
    } else if let Some(c) = ctx.ra.constant_of(v2) {
        ctx.sink.push(LirOp::LoadImm64 {
            dst: Gpr::Rcx,
            imm: c,
        })?;
    } else {
        let frame = ctx.frame();
        ctx.sink.push(LirOp::Load {
            dst: Gpr::Rcx,
            mem: crate::lir::ClassedMem::new(
                frame.vreg_slot(v2),
                crate::lir::MemClass::GuestSlot(v2),
            ),
            kind: LoadKind::W64,
        })?;
    }

    let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    if insn.dst != insn.src1 {
        ctx.ra.rebind_as(ctx.sink, s1, insn.dst)?;
    }
    ctx.sink.push(LirOp::ShiftCl { kind, dst: s1 })?;
    ctx.ra.mark_dirty(s1);
    ctx.ra.free(s1);
    ctx.ra.free(Gpr::Rcx);
    Ok(())
}

// =============================================================================
// Unary and three-way compare
// =============================================================================

pub(super) fn lower_unary(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    if insn.dst != insn.src1 {
        ctx.ra.rebind_as(ctx.sink, s1, insn.dst)?;
    }
    match insn.opcode {
        Opcode::Neg => ctx.sink.push(LirOp::Neg { dst: s1 })?,
        _ => ctx.sink.push(LirOp::Not { dst: s1 })?,
    }
    ctx.ra.mark_dirty(s1);
    ctx.ra.free(s1);
    Ok(())
}

/// `dst = sign(src1 - src2)` as -1/0/1 without branches: zero two
/// temporaries, compare, set the greater/less bytes, subtract.
pub(super) fn lower_cmp(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    let t1 = ctx.ra.alloc_temp(ctx.sink)?;
    let t2 = ctx.ra.alloc_temp(ctx.sink)?;
    ctx.sink.push(LirOp::Alu {
        op: AluOp::Xor,
        dst: t1,
        src: t1,
    })?;
    ctx.sink.push(LirOp::Alu {
        op: AluOp::Xor,
        dst: t2,
        src: t2,
    })?;
    let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    let s2 = ctx.ra.alloc_guest(ctx.sink, insn.src2)?;
    ctx.sink.push(LirOp::CmpRR { a: s1, b: s2 })?;
    ctx.sink.push(LirOp::Setcc {
        cond: Condition::Greater,
        dst: t1,
    })?;
    ctx.sink.push(LirOp::Setcc {
        cond: Condition::Less,
        dst: t2,
    })?;
    ctx.sink.push(LirOp::Alu {
        op: AluOp::Sub,
        dst: t1,
        src: t2,
    })?;
    ctx.ra.free(s1);
    ctx.ra.free(s2);
    ctx.ra.free(t2);
    ctx.ra.rebind_as(ctx.sink, t1, insn.dst)?;
    ctx.ra.free(t1);
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::CallingConvention;
    use crate::bytecode::Opcode;
    use crate::frame::FrameLayout;
    use crate::helpers::HelperTable;
    use crate::labels::Labels;
    use crate::lir::{encode_lir, ClassedMem, MemClass, StoreWidth};
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
                cache_base: 0x1000,
                switches: &[],
                payloads: &[],
                entry_pc: 0,
                next_merge: &mut self.next_merge,
            };
            super::super::lower_insn(&mut ctx, insn).unwrap();
        }

        fn bytes(mut self) -> Vec<u8> {
            self.ra.flush_all(&mut self.sink).unwrap();
            self.sink.into_stream().unwrap().into_bytes()
        }
    }

    fn slot(v: u16) -> ClassedMem {
        ClassedMem::new(
            FrameLayout::new(8).vreg_slot(VReg(v)),
            MemClass::GuestSlot(VReg(v)),
        )
    }

    fn concat(ops: &[LirOp]) -> Vec<u8> {
        let mut out = Vec::new();
        for op in ops {
            out.extend_from_slice(encode_lir(op).as_slice());
        }
        out
    }

    #[test]
    fn add_is_load_load_add_store() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::Binary(BinOp::Add), 0)
                .with_regs(VReg(2), VReg(0), VReg(1)),
        );
        let expected = concat(&[
            LirOp::Load { dst: Gpr::Rax, mem: slot(0), kind: LoadKind::W64 },
            LirOp::Load { dst: Gpr::Rcx, mem: slot(1), kind: LoadKind::W64 },
            LirOp::Alu { op: AluOp::Add, dst: Gpr::Rax, src: Gpr::Rcx },
            LirOp::Store { mem: slot(2), src: Gpr::Rax, width: StoreWidth::W64 },
        ]);
        assert_eq!(h.bytes(), expected);
    }

    #[test]
    fn in_place_add_reuses_binding() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::Binary(BinOp::Add), 0)
                .with_regs(VReg(0), VReg(0), VReg(1)),
        );
        let expected = concat(&[
            LirOp::Load { dst: Gpr::Rax, mem: slot(0), kind: LoadKind::W64 },
            LirOp::Load { dst: Gpr::Rcx, mem: slot(1), kind: LoadKind::W64 },
            LirOp::Alu { op: AluOp::Add, dst: Gpr::Rax, src: Gpr::Rcx },
            LirOp::Store { mem: slot(0), src: Gpr::Rax, width: StoreWidth::W64 },
        ]);
        assert_eq!(h.bytes(), expected);
    }

    #[test]
    fn constant_source_degrades_to_immediate_form() {
        let mut h = Harness::new();
        h.lower(&DecodedInsn::new(Opcode::Const, 0).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(7));
        h.lower(
            &DecodedInsn::new(Opcode::Binary(BinOp::Add), 4)
                .with_regs(VReg(2), VReg(0), VReg(1)),
        );
        let expected = concat(&[
            LirOp::LoadImm64 { dst: Gpr::Rax, imm: 7 },
            LirOp::Load { dst: Gpr::Rcx, mem: slot(0), kind: LoadKind::W64 },
            LirOp::AluImm { op: AluOp::Add, dst: Gpr::Rcx, imm: 7 },
            LirOp::Store { mem: slot(1), src: Gpr::Rax, width: StoreWidth::W64 },
            LirOp::Store { mem: slot(2), src: Gpr::Rcx, width: StoreWidth::W64 },
        ]);
        assert_eq!(h.bytes(), expected);
    }

    #[test]
    fn division_uses_fixed_registers() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::Binary(BinOp::Div), 0)
                .with_regs(VReg(2), VReg(0), VReg(1))
                .with_flags(OptFlags::RANGE_CHECK_ELIDED),
        );
        // Divisor lands past rax/rdx, dividend loads into rax, quotient
        // commits from rax.
        let expected = concat(&[
            LirOp::Load { dst: Gpr::Rcx, mem: slot(1), kind: LoadKind::W64 },
            LirOp::Load { dst: Gpr::Rax, mem: slot(0), kind: LoadKind::W64 },
            LirOp::Cqo,
            LirOp::Idiv { src: Gpr::Rcx },
            LirOp::Store { mem: slot(2), src: Gpr::Rax, width: StoreWidth::W64 },
        ]);
        assert_eq!(h.bytes(), expected);
    }

    #[test]
    fn div_by_zero_literal_always_throws() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::BinaryLit(BinOp::Div), 0x20)
                .with_regs(VReg(1), VReg(0), VReg(0)),
        );
        assert!(h.labels.helper_used(HelperLabel::ThrowDivZero));
    }

    #[test]
    fn shift_literal_masks_count() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::BinaryLit(BinOp::Shl), 0)
                .with_regs(VReg(0), VReg(0), VReg(0))
                .with_imm(65),
        );
        let expected = concat(&[
            LirOp::Load { dst: Gpr::Rax, mem: slot(0), kind: LoadKind::W64 },
            LirOp::ShiftImm { kind: ShiftKind::Shl, dst: Gpr::Rax, imm: 1 },
            LirOp::Store { mem: slot(0), src: Gpr::Rax, width: StoreWidth::W64 },
        ]);
        assert_eq!(h.bytes(), expected);
    }

    #[test]
    fn ushr_is_logical_shr_is_arithmetic() {
        for (op, kind) in [(BinOp::Shr, ShiftKind::Sar), (BinOp::Ushr, ShiftKind::Shr)] {
            let mut h = Harness::new();
            h.lower(
                &DecodedInsn::new(Opcode::BinaryLit(op), 0)
                    .with_regs(VReg(0), VReg(0), VReg(0))
                    .with_imm(3),
            );
            let expected = concat(&[
                LirOp::Load { dst: Gpr::Rax, mem: slot(0), kind: LoadKind::W64 },
                LirOp::ShiftImm { kind, dst: Gpr::Rax, imm: 3 },
                LirOp::Store { mem: slot(0), src: Gpr::Rax, width: StoreWidth::W64 },
            ]);
            assert_eq!(h.bytes(), expected);
        }
    }

    #[test]
    fn cmp_produces_branchless_sign() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::Cmp, 0).with_regs(VReg(2), VReg(0), VReg(1)),
        );
        let expected = concat(&[
            LirOp::Alu { op: AluOp::Xor, dst: Gpr::Rax, src: Gpr::Rax },
            LirOp::Alu { op: AluOp::Xor, dst: Gpr::Rcx, src: Gpr::Rcx },
            LirOp::Load { dst: Gpr::Rdx, mem: slot(0), kind: LoadKind::W64 },
            LirOp::Load { dst: Gpr::Rsi, mem: slot(1), kind: LoadKind::W64 },
            LirOp::CmpRR { a: Gpr::Rdx, b: Gpr::Rsi },
            LirOp::Setcc { cond: Condition::Greater, dst: Gpr::Rax },
            LirOp::Setcc { cond: Condition::Less, dst: Gpr::Rcx },
            LirOp::Alu { op: AluOp::Sub, dst: Gpr::Rax, src: Gpr::Rcx },
            LirOp::Store { mem: slot(2), src: Gpr::Rax, width: StoreWidth::W64 },
        ]);
        assert_eq!(h.bytes(), expected);
    }

    #[test]
    fn move_propagates_tracked_constant() {
        let mut h = Harness::new();
        h.lower(&DecodedInsn::new(Opcode::Const, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(9));
        h.lower(&DecodedInsn::new(Opcode::Move, 4).with_regs(VReg(1), VReg(0), VReg(0)));
        assert_eq!(h.ra.constant_of(VReg(1)), Some(9));
    }
}
