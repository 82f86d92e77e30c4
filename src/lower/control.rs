//! Guest control flow: gotos, two-way branches and switches.
//!
//! Every guest branch is a block boundary: dirty values flush and the
//! binding tables drop, so any block entered through the label manager sees
//! memory-authoritative state. Backward branches poll for suspension first,
//! because the poll's slow path clobbers caller-saved registers.

use crate::backend::x64::encoder::{self, Condition};
use crate::backend::x64::Scale;
use crate::bytecode::{CmpKind, DecodedInsn, OptFlags, SwitchTable};
use crate::error::CompileError;
use crate::helpers;
use crate::labels::DataPayload;
use crate::lir::{AluOp, ClassedMem, LirOp, LoadKind};
use crate::stream::ImmWidth;

use super::Ctx;

fn condition_of(kind: CmpKind) -> Condition {
    match kind {
        CmpKind::Eq => Condition::Equal,
        CmpKind::Ne => Condition::NotEqual,
        CmpKind::Lt => Condition::Less,
        CmpKind::Ge => Condition::GreaterEqual,
        CmpKind::Gt => Condition::Greater,
        CmpKind::Le => Condition::LessEqual,
    }
}

/// Suspend poll ahead of a backward branch. Everything live goes back to
/// the frame first; the poll's call path preserves nothing.
fn poll_if_backward(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    backward: bool,
) -> Result<(), CompileError> {
    if !backward || insn.flags.contains(OptFlags::SUSPEND_CHECK_ELIDED) {
        return Ok(());
    }
    ctx.ra.flush_and_invalidate(ctx.sink)?;
    let frame = ctx.frame();
    helpers::emit_safepoint_poll(ctx.sink, ctx.labels, &frame, insn.pc)
}

pub(super) fn lower_goto(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    poll_if_backward(ctx, insn, insn.target <= insn.pc)?;
    ctx.ra.flush_and_invalidate(ctx.sink)?;
    ctx.labels.jmp_guest(ctx.sink.stream()?, insn.target)
}

pub(super) fn lower_if(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    kind: CmpKind,
    zero: bool,
) -> Result<(), CompileError> {
    poll_if_backward(ctx, insn, insn.target <= insn.pc)?;

    let s1 = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    if zero {
        ctx.sink.push(LirOp::CmpRI { a: s1, imm: 0 })?;
    } else {
        let s2 = ctx.ra.alloc_guest(ctx.sink, insn.src2)?;
        ctx.sink.push(LirOp::CmpRR { a: s1, b: s2 })?;
        ctx.ra.free(s2);
    }
    ctx.ra.free(s1);

    // Flush stores leave the flags alone, so the compare survives them.
    ctx.ra.flush_and_invalidate(ctx.sink)?;
    ctx.labels
        .jcc_guest(ctx.sink.stream()?, condition_of(kind), insn.target)
}

fn switch_table<'a>(
    ctx: &Ctx<'a>,
    insn: &DecodedInsn,
    name: &'static str,
) -> Result<&'a SwitchTable, CompileError> {
    ctx.switches
        .get(insn.imm as usize)
        .ok_or(CompileError::UnsupportedOpcode(name, insn.pc))
}

fn switch_branches_backward(table: &SwitchTable, pc: u32) -> bool {
    table.default_target <= pc || table.targets.iter().any(|&t| t <= pc)
}

/// Packed switch: rebase the operand, bounds-branch to the default, then
/// jump through a table of base-relative 32-bit entries emitted in the data
/// section.
pub(super) fn lower_packed_switch(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
) -> Result<(), CompileError> {
    let table = switch_table(ctx, insn, "packed-switch")?;
    let first_key = table.first_key;
    let ncases = table.targets.len() as i32;
    let targets = table.targets.clone();
    let default_target = table.default_target;
    let backward = switch_branches_backward(table, insn.pc);

    poll_if_backward(ctx, insn, backward)?;

    let s = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    let idx = ctx.ra.alloc_temp(ctx.sink)?;
    if idx != s {
        ctx.sink.push(LirOp::MovRR { dst: idx, src: s })?;
    }
    if first_key != 0 {
        ctx.sink.push(LirOp::AluImm {
            op: AluOp::Sub,
            dst: idx,
            imm: first_key,
        })?;
    }
    let base = ctx.ra.alloc_temp(ctx.sink)?;
    ctx.ra.free(s);

    // From here on everything is raw control flow over dead bookkeeping;
    // the register contents stay valid through it.
    ctx.ra.flush_and_invalidate(ctx.sink)?;
    ctx.sink.push(LirOp::CmpRI { a: idx, imm: ncases })?;
    ctx.labels
        .jcc_guest(ctx.sink.stream()?, Condition::AboveEqual, default_target)?;

    let stream = ctx.sink.stream()?;
    let lea = stream.emit_inst_patchable(&encoder::encode_lea_rip(base), ImmWidth::B32)?;
    ctx.labels.defer_data(DataPayload::SwitchTable(targets), lea);

    ctx.sink.push(LirOp::Load {
        dst: idx,
        mem: ClassedMem::unclassified(crate::backend::x64::MemOperand::base_index(
            base,
            idx,
            Scale::X4,
        )),
        kind: LoadKind::S32,
    })?;
    ctx.sink.push(LirOp::Alu {
        op: AluOp::Add,
        dst: idx,
        src: base,
    })?;
    let stream = ctx.sink.stream()?;
    stream.emit_inst(&encoder::encode_jmp_r(idx))?;
    Ok(())
}

/// Sparse switch: a chain of compares. Case tables stay small enough in
/// traces that a linear scan beats the indirection.
pub(super) fn lower_sparse_switch(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
) -> Result<(), CompileError> {
    let table = switch_table(ctx, insn, "sparse-switch")?;
    let cases: Vec<(i32, u32)> = table
        .keys
        .iter()
        .copied()
        .zip(table.targets.iter().copied())
        .collect();
    let default_target = table.default_target;
    let backward = switch_branches_backward(table, insn.pc);

    poll_if_backward(ctx, insn, backward)?;

    let s = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.ra.free(s);
    ctx.ra.flush_and_invalidate(ctx.sink)?;

    for (key, target) in cases {
        ctx.sink.push(LirOp::CmpRI { a: s, imm: key })?;
        ctx.labels
            .jcc_guest(ctx.sink.stream()?, Condition::Equal, target)?;
    }
    ctx.labels.jmp_guest(ctx.sink.stream()?, default_target)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::CallingConvention;
    use crate::bytecode::{Opcode, VReg};
    use crate::frame::FrameLayout;
    use crate::helpers::HelperTable;
    use crate::labels::{HelperLabel, Labels};
    use crate::regalloc::RegAlloc;
    use crate::sched::Sink;
    use crate::stream::CodeStream;

    struct Harness {
        sink: Sink,
        ra: RegAlloc,
        labels: Labels,
        helpers: HelperTable,
        next_merge: u32,
        switches: Vec<SwitchTable>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                sink: Sink::new(CodeStream::new(), false),
                ra: RegAlloc::new(FrameLayout::new(8)),
                labels: Labels::new(),
                helpers: HelperTable::new(),
                next_merge: 0,
                switches: Vec::new(),
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
                switches: &self.switches,
                payloads: &[],
                entry_pc: 0,
                next_merge: &mut self.next_merge,
            };
            super::super::lower_insn(&mut ctx, insn).unwrap();
        }
    }

    #[test]
    fn forward_branch_skips_the_poll() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::If(CmpKind::Lt), 0x10)
                .with_regs(VReg(0), VReg(0), VReg(1))
                .with_target(0x40),
        );
        assert!(!h.labels.helper_used(HelperLabel::SafepointCall));
        assert_eq!(h.labels.pending_guest_pcs(), vec![0x40]);
    }

    #[test]
    fn backward_branch_polls_unless_elided() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::Goto, 0x30).with_target(0x10),
        );
        assert!(h.labels.helper_used(HelperLabel::SafepointCall));

        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::Goto, 0x30)
                .with_target(0x10)
                .with_flags(OptFlags::SUSPEND_CHECK_ELIDED),
        );
        assert!(!h.labels.helper_used(HelperLabel::SafepointCall));
    }

    #[test]
    fn branch_flushes_dirty_values_first() {
        let mut h = Harness::new();
        h.lower(&DecodedInsn::new(Opcode::Const, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(5));
        let before = h.sink.cursor().unwrap();
        h.lower(
            &DecodedInsn::new(Opcode::IfZ(CmpKind::Eq), 4)
                .with_regs(VReg(0), VReg(0), VReg(0))
                .with_target(0x40),
        );
        // cmp + store + jcc: more than just the branch.
        assert!(h.sink.cursor().unwrap() > before + 6);
        assert_eq!(h.ra.reg_of(VReg(0)), None);
        assert_eq!(h.ra.constant_of(VReg(0)), None);
    }

    #[test]
    fn packed_switch_emits_table_and_default() {
        let mut h = Harness::new();
        h.switches.push(SwitchTable {
            first_key: 10,
            keys: Vec::new(),
            targets: vec![0x40, 0x50, 0x60],
            default_target: 0x70,
        });
        h.lower(
            &DecodedInsn::new(Opcode::PackedSwitch, 0x10)
                .with_regs(VReg(0), VReg(0), VReg(0))
                .with_imm(0),
        );
        // Only the default branch is pending until the table lands.
        assert_eq!(h.labels.pending_guest_pcs(), vec![0x70]);

        // Emitting the data section registers the case targets; binding
        // every target closes out.
        h.labels.emit_data(h.sink.stream().unwrap()).unwrap();
        assert_eq!(h.labels.pending_guest_pcs(), vec![0x40, 0x50, 0x60, 0x70]);
        for pc in [0x40, 0x50, 0x60, 0x70] {
            h.labels.bind_guest(h.sink.stream().unwrap(), pc).unwrap();
        }
        h.labels.finish().unwrap();
    }

    #[test]
    fn sparse_switch_compares_each_key() {
        let mut h = Harness::new();
        h.switches.push(SwitchTable {
            first_key: 0,
            keys: vec![-1, 100],
            targets: vec![0x40, 0x50],
            default_target: 0x60,
        });
        h.lower(
            &DecodedInsn::new(Opcode::SparseSwitch, 0x10)
                .with_regs(VReg(0), VReg(0), VReg(0))
                .with_imm(0),
        );
        assert_eq!(h.labels.pending_guest_pcs(), vec![0x40, 0x50, 0x60]);

        for pc in [0x40, 0x50, 0x60] {
            h.labels.bind_guest(h.sink.stream().unwrap(), pc).unwrap();
        }
        h.labels.finish().unwrap();
    }

    #[test]
    fn missing_switch_table_is_an_error() {
        let mut h = Harness::new();
        let mut ctx = Ctx {
            sink: &mut h.sink,
            ra: &mut h.ra,
            labels: &mut h.labels,
            helpers: &h.helpers,
            cc: CallingConvention::SystemV,
            cache_base: 0,
            switches: &[],
            payloads: &[],
            entry_pc: 0,
            next_merge: &mut h.next_merge,
        };
        let err = super::super::lower_insn(
            &mut ctx,
            &DecodedInsn::new(Opcode::PackedSwitch, 4).with_regs(VReg(0), VReg(0), VReg(0)),
        )
        .unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedOpcode("packed-switch", 4)));
    }
}
