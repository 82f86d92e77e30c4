//! Calls, returns and explicit throws.
//!
//! Invokes bridge through the runtime rather than chaining callee traces
//! directly; the helper runs the target method and hands back the return
//! value. Returns funnel through the trace's shared epilogue with the
//! result in RAX.

use crate::backend::x64::Gpr;
use crate::bytecode::{DecodedInsn, OptFlags};
use crate::error::CompileError;
use crate::helpers::{self, HelperArg, RuntimeHelper};
use crate::labels::HelperLabel;
use crate::lir::{ClassedMem, LirOp, LoadKind, MemClass};

use super::Ctx;

pub(super) fn lower_invoke(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    let ret = ctx.call(
        RuntimeHelper::InvokeMethod,
        &[HelperArg::Frame, HelperArg::Imm(insn.imm)],
        insn.pc,
    )?;
    ctx.commit_result(ret, insn.dst)
}

pub(super) fn lower_return(
    ctx: &mut Ctx<'_>,
    insn: &DecodedInsn,
    has_value: bool,
) -> Result<(), CompileError> {
    // Leaving the trace: memory becomes authoritative, the pc slot gets the
    // return site, and the suspend poll runs while no register state is
    // live.
    ctx.ra.flush_and_invalidate(ctx.sink)?;
    let frame = ctx.frame();
    helpers::export_pc(ctx.sink, &frame, insn.pc)?;
    if !insn.flags.contains(OptFlags::SUSPEND_CHECK_ELIDED) {
        helpers::emit_safepoint_poll(ctx.sink, ctx.labels, &frame, insn.pc)?;
    }
    if has_value {
        ctx.sink.push(LirOp::Load {
            dst: Gpr::Rax,
            mem: ClassedMem::new(
                frame.vreg_slot(insn.dst),
                MemClass::GuestSlot(insn.dst),
            ),
            kind: LoadKind::W64,
        })?;
    }
    ctx.labels.jmp_helper(ctx.sink.stream()?, HelperLabel::Epilogue)
}

pub(super) fn lower_throw(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    let o = ctx.ra.alloc_guest(ctx.sink, insn.src1)?;
    ctx.null_check(o, insn)?;
    ctx.call(
        RuntimeHelper::ThrowObject,
        &[
            HelperArg::Frame,
            HelperArg::Reg(o),
            HelperArg::Imm(insn.pc as i64),
        ],
        insn.pc,
    )?;
    ctx.ra.free(o);
    ctx.ra.flush_and_invalidate(ctx.sink)?;
    ctx.labels
        .jmp_helper(ctx.sink.stream()?, HelperLabel::ExceptionDispatch)
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
    use crate::labels::Labels;
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
    }

    #[test]
    fn return_jumps_to_shared_epilogue() {
        let mut h = Harness::new();
        h.lower(&DecodedInsn::new(Opcode::Return, 0x30).with_regs(VReg(0), VReg(0), VReg(0)));
        assert!(h.labels.helper_used(HelperLabel::Epilogue));
        assert!(h.labels.helper_used(HelperLabel::SafepointCall));
    }

    #[test]
    fn return_void_skips_the_value_load() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::ReturnVoid, 0x30)
                .with_flags(OptFlags::SUSPEND_CHECK_ELIDED),
        );
        let with_poll = {
            let mut h2 = Harness::new();
            h2.lower(&DecodedInsn::new(Opcode::ReturnVoid, 0x30));
            h2.sink.cursor().unwrap()
        };
        assert!(h.sink.cursor().unwrap() < with_poll);
        assert!(h.labels.helper_used(HelperLabel::Epilogue));
    }

    #[test]
    fn invoke_commits_the_return_value() {
        let mut h = Harness::new();
        h.lower(
            &DecodedInsn::new(Opcode::Invoke, 0x10)
                .with_regs(VReg(3), VReg(0), VReg(0))
                .with_imm(7),
        );
        assert_eq!(h.ra.reg_of(VReg(3)), Some(Gpr::Rax));
    }

    #[test]
    fn throw_reaches_exception_dispatch() {
        let mut h = Harness::new();
        h.lower(&DecodedInsn::new(Opcode::Throw, 0x10).with_regs(VReg(0), VReg(0), VReg(0)));
        assert!(h.labels.helper_used(HelperLabel::ThrowNull));
        assert!(h.labels.helper_used(HelperLabel::ExceptionDispatch));
    }
}
