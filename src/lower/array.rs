//! Array access lowering: length, element loads and stores, allocation and
//! bulk initialization.
//!
//! Element addresses use scaled index addressing off the array base. The
//! null and bounds guards honor the optimizer's elision flags; the bounds
//! guard is a single unsigned compare, which also rejects negative indexes.

use crate::backend::x64::encoder::Condition;
use crate::backend::x64::{MemOperand, Scale};
use crate::bytecode::{DecodedInsn, ElemWidth, OptFlags};
use crate::error::CompileError;
use crate::helpers::HelperArg;
use crate::helpers::RuntimeHelper;
use crate::labels::{DataPayload, HelperLabel};
use crate::lir::{ClassedMem, LirOp, LoadKind};
use crate::stream::ImmWidth;

use super::{Ctx, ARRAY_DATA_OFFSET, ARRAY_LENGTH_OFFSET};

fn scale_of(width: ElemWidth) -> Scale {
    match width.shift() {
        0 => Scale::X1,
        1 => Scale::X2,
        2 => Scale::X4,
        _ => Scale::X8,
    }
}

/// Bounds guard: unsigned compare of the index against the length dword.
fn bounds_check(
    ctx: &mut Ctx<'_>,
    array: crate::backend::x64::Gpr,
    index: crate::backend::x64::Gpr,
    insn: &DecodedInsn,
) -> Result<(), CompileError> {
    if insn.flags.contains(OptFlags::BOUNDS_CHECK_ELIDED) {
        return Ok(());
    }
    let len = ctx.ra.alloc_temp(ctx.sink)?;
    ctx.sink.push(LirOp::Load {
        dst: len,
        mem: ClassedMem::unclassified(MemOperand::base_disp(array, ARRAY_LENGTH_OFFSET)),
        kind: LoadKind::W32,
    })?;
    ctx.sink.push(LirOp::CmpRR { a: index, b: len })?;
    ctx.ra.free(len);
    ctx.guard(Condition::AboveEqual, HelperLabel::ThrowBounds, insn.pc)
}

pub(super) fn lower_array_length(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
) -> Result<(), CompileError> {
    let a = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.null_check(a, insn)?;
    let d = ctx.ra.alloc_guest_dst(ctx.sink, insn.dst)?;
    ctx.sink.push(LirOp::Load {
        dst: d,
        mem: ClassedMem::unclassified(MemOperand::base_disp(a, ARRAY_LENGTH_OFFSET)),
        kind: LoadKind::W32,
    })?;
    ctx.ra.mark_dirty(d);
    ctx.ra.free(a);
    ctx.ra.free(d);
    Ok(())
}

pub(super) fn lower_aget(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    width: ElemWidth,
) -> Result<(), CompileError> {
    let a = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    let i = ctx.ra.alloc_guest(ctx.sink, insn.src2)?;
    ctx.null_check(a, insn)?;
    bounds_check(ctx, a, i, insn)?;
    let d = ctx.ra.alloc_guest_dst(ctx.sink, insn.dst)?;
    ctx.sink.push(LirOp::Load {
        dst: d,
        mem: ClassedMem::unclassified(MemOperand::base_index_disp(
            a,
            i,
            scale_of(width),
            ARRAY_DATA_OFFSET,
        )),
        kind: width.load_kind(),
    })?;
    ctx.ra.mark_dirty(d);
    ctx.ra.free(a);
    ctx.ra.free(i);
    ctx.ra.free(d);
    Ok(())
}

pub(super) fn lower_aput(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    width: ElemWidth,
) -> Result<(), CompileError> {
    // The stored value rides in the instruction's dst field.
    let v = ctx.ra.alloc_guest(ctx.sink, insn.dst)?;
    let a = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    let i = ctx.ra.alloc_guest(ctx.sink, insn.src2)?;
    ctx.null_check(a, insn)?;
    bounds_check(ctx, a, i, insn)?;
    ctx.sink.push(LirOp::Store {
        mem: ClassedMem::unclassified(MemOperand::base_index_disp(
            a,
            i,
            scale_of(width),
            ARRAY_DATA_OFFSET,
        )),
        src: v,
        width: width.store_width(),
    })?;
    ctx.ra.free(v);
    ctx.ra.free(a);
    ctx.ra.free(i);
    Ok(())
}

pub(super) fn lower_new_array(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    let len = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.sink.push(LirOp::TestRR { a: len, b: len })?;
    ctx.guard(Condition::Sign, HelperLabel::ThrowNegativeSize, insn.pc)?;
    let ret = ctx.call(
        RuntimeHelper::AllocArray,
        &[
            HelperArg::Frame,
            HelperArg::Imm(insn.imm),
            HelperArg::Reg(len),
        ],
        insn.pc,
    )?;
    ctx.ra.free(len);
    ctx.commit_result(ret, insn.dst)
}

pub(super) fn lower_fill_array(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    let payload = ctx
        .payloads
        .get(insn.imm as usize)
        .cloned()
        .ok_or(CompileError::UnsupportedOpcode("fill-array-data", insn.pc))?;
    let a = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.null_check(a, insn)?;

    // Materialize the payload address RIP-relative; the displacement gets
    // patched when the data section lands after the body.
    let t = ctx.ra.alloc_temp(ctx.sink)?;
    let stream = ctx.sink.stream()?;
    let imm = stream.emit_inst_patchable(
        &crate::backend::x64::encoder::encode_lea_rip(t),
        ImmWidth::B32,
    )?;
    ctx.labels.defer_data(DataPayload::Bytes(payload), imm);

    ctx.call(
        RuntimeHelper::FillArray,
        &[HelperArg::Frame, HelperArg::Reg(a), HelperArg::Reg(t)],
        insn.pc,
    )?;
    ctx.ra.free(a);
    ctx.ra.free(t);
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
