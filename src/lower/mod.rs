//! Lowering engine: one routine per guest opcode family.
//!
//! Every routine follows the same contract: bind sources through the
//! allocator (or substitute tracked constants), emit the guards the
//! optimizer did not elide, perform the operation, commit the destination,
//! release temporaries. Guards are a compare plus a conditional branch to a
//! shared helper tail, with the faulting guest pc staged in the scratch
//! register by a `mov` that can legally sit between the compare and the
//! branch.
//!
//! Instructions that can reach a helper flush dirty guest values first, so
//! the frame is current whenever control leaves the trace.

use crate::backend::x64::encoder::Condition;
use crate::backend::x64::{CallingConvention, Gpr, SCRATCH};
use crate::bytecode::{DecodedInsn, ElemWidth, Opcode, OptFlags, SwitchTable};
use crate::error::CompileError;
use crate::frame::FrameLayout;
use crate::helpers::{self, HelperArg, HelperTable, RuntimeHelper};
use crate::labels::{HelperLabel, Labels};
use crate::lir::{LirOp, LoadKind, StoreWidth};
use crate::regalloc::RegAlloc;
use crate::sched::Sink;
use crate::stream::ImmWidth;

mod arith;
mod array;
mod control;
mod invoke;
mod object;

// =============================================================================
// Guest object layout
// =============================================================================

/// Offset of the class pointer in every object header.
pub const OBJ_CLASS_OFFSET: i32 = 0;
/// Offset of an array's length dword.
pub const ARRAY_LENGTH_OFFSET: i32 = 8;
/// Offset of an array's first element.
pub const ARRAY_DATA_OFFSET: i32 = 16;

impl ElemWidth {
    pub(crate) fn load_kind(self) -> LoadKind {
        match self {
            ElemWidth::B1 => LoadKind::S8,
            ElemWidth::B2 { signed: true } => LoadKind::S16,
            ElemWidth::B2 { signed: false } => LoadKind::U16,
            ElemWidth::B4 => LoadKind::S32,
            ElemWidth::B8 => LoadKind::W64,
        }
    }

    pub(crate) fn store_width(self) -> StoreWidth {
        match self {
            ElemWidth::B1 => StoreWidth::W8,
            ElemWidth::B2 { .. } => StoreWidth::W16,
            ElemWidth::B4 => StoreWidth::W32,
            ElemWidth::B8 => StoreWidth::W64,
        }
    }
}

// =============================================================================
// Context
// =============================================================================

/// Everything a lowering routine needs, borrowed from the driver for the
/// duration of one instruction.
pub struct Ctx<'a> {
    pub sink: &'a mut Sink,
    pub ra: &'a mut RegAlloc,
    pub labels: &'a mut Labels,
    pub helpers: &'a HelperTable,
    pub cc: CallingConvention,
    /// Base address of the runtime's resolution cache; slot `i` is an
    /// 8-byte entry at `cache_base + i * 8`, null until resolved.
    pub cache_base: u64,
    pub switches: &'a [SwitchTable],
    pub payloads: &'a [Vec<u8>],
    pub entry_pc: u32,
    pub next_merge: &'a mut u32,
}

impl Ctx<'_> {
    pub fn frame(&self) -> FrameLayout {
        *self.ra.frame()
    }

    fn new_merge_id(&mut self) -> u32 {
        let id = *self.next_merge;
        *self.next_merge += 1;
        id
    }

    /// Stage the faulting guest pc in the scratch register. A plain `mov`,
    /// so it preserves the flags of a preceding compare.
    fn stage_pc(&mut self, pc: u32) -> Result<(), CompileError> {
        self.sink.push(LirOp::LoadImm32 {
            dst: SCRATCH,
            imm: pc,
        })
    }

    /// Conditional branch to a shared helper tail with the pc staged. Dirty
    /// guest values flush first; the stores and the staging `mov` are
    /// flags-safe, so a guard can sit directly after its compare.
    fn guard(
        &mut self,
        cond: Condition,
        label: HelperLabel,
        pc: u32,
    ) -> Result<(), CompileError> {
        self.ra.flush_all(self.sink)?;
        self.stage_pc(pc)?;
        self.labels.jcc_helper(self.sink.stream()?, cond, label)
    }

    /// Move a raw result register (typically a helper return) into a fresh
    /// binding for the destination vreg.
    fn commit_result(&mut self, reg: Gpr, dst: crate::bytecode::VReg) -> Result<(), CompileError> {
        self.ra.alloc_fixed(self.sink, reg)?;
        self.ra.rebind_as(self.sink, reg, dst)?;
        self.ra.free(reg);
        Ok(())
    }

    /// Null check on an object register, unless elided.
    fn null_check(&mut self, obj: Gpr, insn: &DecodedInsn) -> Result<(), CompileError> {
        if insn.flags.contains(OptFlags::NULL_CHECK_ELIDED) {
            return Ok(());
        }
        self.sink.push(LirOp::TestRR { a: obj, b: obj })?;
        self.guard(Condition::Equal, HelperLabel::ThrowNull, insn.pc)
    }

    /// Flush dirty guest values ahead of anything that can throw or call.
    fn flush(&mut self) -> Result<(), CompileError> {
        self.ra.flush_all(self.sink)
    }

    /// Full helper call under the calling convention.
    fn call(
        &mut self,
        helper: RuntimeHelper,
        args: &[HelperArg],
        pc: u32,
    ) -> Result<Gpr, CompileError> {
        helpers::call_helper(self.sink, self.ra, self.helpers, helper, args, pc, self.cc)
    }

    /// The resolution-cache fast path: load the cache slot, and on a null
    /// entry call the resolver under the snapshot protocol so both paths
    /// reconverge with identical bindings. Returns a temporary holding the
    /// resolved entry; the caller frees it.
    fn load_cache_entry(
        &mut self,
        index: u32,
        resolver: RuntimeHelper,
        pc: u32,
    ) -> Result<Gpr, CompileError> {
        let slot_addr = self.cache_base.wrapping_add(index as u64 * 8) as i64;
        let entry = self.ra.alloc_temp(self.sink)?;
        self.sink.push(LirOp::LoadImm64 {
            dst: entry,
            imm: slot_addr,
        })?;
        self.sink.push(LirOp::Load {
            dst: entry,
            mem: crate::lir::ClassedMem::unclassified(
                crate::backend::x64::MemOperand::base(entry),
            ),
            kind: LoadKind::W64,
        })?;
        self.sink.push(LirOp::TestRR { a: entry, b: entry })?;

        let id = self.new_merge_id();
        self.ra.remember_state(id);
        let done = self.labels.new_local();
        self.labels
            .jcc_local(self.sink.stream()?, Condition::NotEqual, done, ImmWidth::B32)?;

        // Miss: resolve, leaving the entry in the same temporary.
        self.ra.pin(entry);
        let ret = self.call(resolver, &[HelperArg::Frame, HelperArg::Imm(index as i64)], pc)?;
        self.ra.unpin(entry);
        self.sink.push(LirOp::MovRR {
            dst: entry,
            src: ret,
        })?;
        self.ra.go_to_state(self.sink, id)?;

        self.labels.bind_local(self.sink.stream()?, done)?;
        self.ra.transfer_to_state(id)?;
        Ok(entry)
    }
}

// =============================================================================
// Dispatch
// =============================================================================

/// Lower one decoded guest instruction.
pub fn lower_insn(ctx: &mut Ctx<'_>, insn: &DecodedInsn) -> Result<(), CompileError> {
    match insn.opcode {
        Opcode::Move | Opcode::Const | Opcode::ConstWide => arith::lower_data(ctx, insn),
        Opcode::Binary(op) => arith::lower_binary(ctx, insn, op),
        Opcode::BinaryLit(op) => arith::lower_binary_lit(ctx, insn, op),
        Opcode::Neg | Opcode::Not => arith::lower_unary(ctx, insn),
        Opcode::Cmp => arith::lower_cmp(ctx, insn),

        Opcode::ArrayLength => array::lower_array_length(ctx, insn),
        Opcode::AGet(width) => array::lower_aget(ctx, insn, width),
        Opcode::APut(width) => array::lower_aput(ctx, insn, width),
        Opcode::NewArray => array::lower_new_array(ctx, insn),
        Opcode::FillArrayData => array::lower_fill_array(ctx, insn),

        Opcode::ConstString => object::lower_const_cache(ctx, insn, RuntimeHelper::ResolveString),
        Opcode::ConstClass => object::lower_const_cache(ctx, insn, RuntimeHelper::ResolveClass),
        Opcode::IGet(width) => object::lower_iget(ctx, insn, width),
        Opcode::IPut(width) => object::lower_iput(ctx, insn, width),
        Opcode::SGet => object::lower_sget(ctx, insn),
        Opcode::SPut => object::lower_sput(ctx, insn),
        Opcode::NewInstance => object::lower_new_instance(ctx, insn),
        Opcode::CheckCast => object::lower_check_cast(ctx, insn),
        Opcode::InstanceOf => object::lower_instance_of(ctx, insn),
        Opcode::MonitorEnter => object::lower_monitor(ctx, insn, RuntimeHelper::Lock),
        Opcode::MonitorExit => object::lower_monitor(ctx, insn, RuntimeHelper::Unlock),

        Opcode::Invoke => invoke::lower_invoke(ctx, insn),
        Opcode::Return => invoke::lower_return(ctx, insn, true),
        Opcode::ReturnVoid => invoke::lower_return(ctx, insn, false),
        Opcode::Throw => invoke::lower_throw(ctx, insn),

        Opcode::Goto => control::lower_goto(ctx, insn),
        Opcode::If(kind) => control::lower_if(ctx, insn, kind, false),
        Opcode::IfZ(kind) => control::lower_if(ctx, insn, kind, true),
        Opcode::PackedSwitch => control::lower_packed_switch(ctx, insn),
        Opcode::SparseSwitch => control::lower_sparse_switch(ctx, insn),
    }
}
