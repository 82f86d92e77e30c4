//! Runtime-helper calling, exception and safepoint conventions.
//!
//! Every escape from generated code goes through a helper with a fixed,
//! narrow C signature. The conventions are:
//!
//! - before any call, the guest pc is exported to its frame slot, dirty
//!   guest values are flushed, and caller-saved bindings die; pinned
//!   caller-saved registers ride out the call in spill slots
//! - throw sequences are shared per-trace tails reached by `jmp`, with the
//!   faulting guest pc staged in the scratch register by the guard site
//!   (a plain `mov`, so it can sit between a compare and its branch)
//! - the safepoint poll compares the frame's suspend-count dword against
//!   zero and `call`s a shared tail only when it is nonzero

use crate::backend::x64::encoder;
use crate::backend::x64::{CallingConvention, Gpr, GUEST_FRAME, SCRATCH};
use crate::error::CompileError;
use crate::frame::FrameLayout;
use crate::labels::{HelperLabel, Labels};
use crate::lir::{ClassedMem, LirOp, MemClass, StoreWidth};
use crate::regalloc::RegAlloc;
use crate::sched::Sink;

// =============================================================================
// Helper table
// =============================================================================

/// Runtime entry points the backend can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeHelper {
    /// `(frame, string_idx) -> obj`
    ResolveString = 0,
    /// `(frame, class_idx) -> class`
    ResolveClass = 1,
    /// `(frame, field_idx) -> field`
    ResolveField = 2,
    /// `(frame, method_idx) -> method`
    ResolveMethod = 3,
    /// `(frame, class_idx) -> obj`
    AllocObject = 4,
    /// `(frame, class_idx, length) -> array`
    AllocArray = 5,
    /// `(frame, array, payload) -> ()`
    FillArray = 6,
    /// `(frame, obj) -> ()`
    Lock = 7,
    /// `(frame, obj) -> ()`
    Unlock = 8,
    /// `(frame, obj, class_idx) -> ()` (throws on failure)
    CheckCast = 9,
    /// `(frame, obj, class_idx) -> 0|1`
    InstanceOf = 10,
    /// `(frame, method_idx) -> ret` (bridges back through the runtime)
    InvokeMethod = 11,
    /// `(frame, pc) -> ()`
    Suspend = 12,
    /// `(frame, pc) -> ()` throwers, one per fault kind
    ThrowNull = 13,
    ThrowBounds = 14,
    ThrowDivZero = 15,
    ThrowNegativeSize = 16,
    ThrowCast = 17,
    ThrowNoMethod = 18,
    ThrowVerify = 19,
    /// `(frame) -> !` unwinds to the interpreter
    ExceptionDispatch = 20,
    /// `(frame, obj, pc) -> ()` guest `throw` of an exception object
    ThrowObject = 21,
}

impl RuntimeHelper {
    pub const COUNT: usize = 22;

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

/// Addresses of the runtime entry points, supplied by the embedder.
#[derive(Debug, Clone)]
pub struct HelperTable {
    addrs: [u64; RuntimeHelper::COUNT],
}

impl HelperTable {
    pub fn new() -> Self {
        HelperTable {
            addrs: [0; RuntimeHelper::COUNT],
        }
    }

    pub fn set(&mut self, helper: RuntimeHelper, addr: u64) -> &mut Self {
        self.addrs[helper.index()] = addr;
        self
    }

    #[inline]
    pub fn get(&self, helper: RuntimeHelper) -> u64 {
        self.addrs[helper.index()]
    }
}

impl Default for HelperTable {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Call marshaling
// =============================================================================

/// An argument to a runtime helper.
#[derive(Debug, Clone, Copy)]
pub enum HelperArg {
    /// Value already in a register. Must not be the scratch register.
    Reg(Gpr),
    Imm(i64),
    /// The guest frame base; every helper takes it first.
    Frame,
}

/// Emit a full helper call: export the guest pc, flush and kill
/// caller-saved state, marshal arguments, call through the scratch
/// register, and restore spills. Returns the register holding the result;
/// when the convention's return register was itself spilled for a pinned
/// binding, the result is parked in the scratch register so the reload
/// cannot overwrite it.
pub fn call_helper(
    sink: &mut Sink,
    ra: &mut RegAlloc,
    table: &HelperTable,
    helper: RuntimeHelper,
    args: &[HelperArg],
    pc: u32,
    cc: CallingConvention,
) -> Result<Gpr, CompileError> {
    let frame = *ra.frame();
    export_pc(sink, &frame, pc)?;
    ra.flush_all(sink)?;
    let spills = ra.kill_caller_saved(sink, cc)?;

    marshal_args(sink, args, cc)?;

    let stream = sink.stream()?;
    let shadow = cc.shadow_space();
    if shadow != 0 {
        stream.emit_inst(&encoder::encode_sub_ri(Gpr::Rsp, shadow as i32))?;
    }
    stream.emit_inst(&encoder::encode_mov_ri64(SCRATCH, table.get(helper) as i64))?;
    stream.emit_inst(&encoder::encode_call_r(SCRATCH))?;
    if shadow != 0 {
        stream.emit_inst(&encoder::encode_add_ri(Gpr::Rsp, shadow as i32))?;
    }

    // The reloads below restore pinned registers; if one of them is the
    // return register, the result has to move aside first. The scratch
    // register is dead once the call lands.
    let ret = cc.int_return_reg();
    if spills.iter().any(|&(r, _)| r == ret) {
        sink.push(LirOp::MovRR {
            dst: SCRATCH,
            src: ret,
        })?;
        ra.reload_spills(sink, &spills)?;
        return Ok(SCRATCH);
    }
    ra.reload_spills(sink, &spills)?;
    Ok(ret)
}

/// Store the current guest pc into its frame slot through the scratch
/// register.
pub fn export_pc(sink: &mut Sink, frame: &FrameLayout, pc: u32) -> Result<(), CompileError> {
    sink.push(LirOp::LoadImm32 {
        dst: SCRATCH,
        imm: pc,
    })?;
    sink.push(LirOp::Store {
        mem: ClassedMem::new(frame.guest_pc_slot(), MemClass::Header),
        src: SCRATCH,
        width: StoreWidth::W32,
    })
}

/// Move arguments into the convention's registers. Register-to-register
/// moves run as a parallel move (cycles broken through the scratch
/// register); immediates and the frame base load last, once nothing reads
/// their targets anymore.
fn marshal_args(
    sink: &mut Sink,
    args: &[HelperArg],
    cc: CallingConvention,
) -> Result<(), CompileError> {
    let targets = cc.int_arg_regs();
    debug_assert!(args.len() <= targets.len());

    let mut reg_moves: Vec<(Gpr, Gpr)> = Vec::new();
    for (i, arg) in args.iter().enumerate() {
        if let HelperArg::Reg(src) = *arg {
            debug_assert!(src != SCRATCH);
            reg_moves.push((targets[i], src));
        }
    }

    while !reg_moves.is_empty() {
        if let Some(i) = reg_moves
            .iter()
            .position(|&(dst, _)| !reg_moves.iter().any(|&(_, src)| src == dst))
        {
            let (dst, src) = reg_moves.swap_remove(i);
            if dst != src {
                sink.push(LirOp::MovRR { dst, src })?;
            }
        } else {
            // Cycle: park one blocked target in the scratch register so the
            // move into it can proceed.
            let blocked = reg_moves[0].0;
            sink.push(LirOp::MovRR {
                dst: SCRATCH,
                src: blocked,
            })?;
            for mv in reg_moves.iter_mut() {
                if mv.1 == blocked {
                    mv.1 = SCRATCH;
                }
            }
        }
    }

    for (i, arg) in args.iter().enumerate() {
        match *arg {
            HelperArg::Reg(_) => {}
            HelperArg::Imm(imm) => {
                sink.push(LirOp::LoadImm64 {
                    dst: targets[i],
                    imm,
                })?;
            }
            HelperArg::Frame => {
                sink.push(LirOp::MovRR {
                    dst: targets[i],
                    src: GUEST_FRAME,
                })?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// Safepoint poll
// =============================================================================

/// Emit the suspend poll for a backward branch or return: compare the
/// frame's suspend-count dword to zero and call the shared safepoint tail
/// when it is set.
pub fn emit_safepoint_poll(
    sink: &mut Sink,
    labels: &mut Labels,
    frame: &FrameLayout,
    pc: u32,
) -> Result<(), CompileError> {
    sink.push(LirOp::LoadImm32 {
        dst: SCRATCH,
        imm: pc,
    })?;
    sink.push(LirOp::CmpMI8 {
        mem: ClassedMem::new(frame.suspend_count_slot(), MemClass::Header),
        imm: 0,
    })?;
    let skip = labels.new_local();
    labels.jcc_local(
        sink.stream()?,
        encoder::Condition::Equal,
        skip,
        crate::stream::ImmWidth::B8,
    )?;
    labels.call_helper_label(sink.stream()?, HelperLabel::SafepointCall)?;
    labels.bind_local(sink.stream()?, skip)?;
    Ok(())
}

// =============================================================================
// Shared tails
// =============================================================================

const THROW_TAILS: [(HelperLabel, RuntimeHelper); 7] = [
    (HelperLabel::ThrowNull, RuntimeHelper::ThrowNull),
    (HelperLabel::ThrowBounds, RuntimeHelper::ThrowBounds),
    (HelperLabel::ThrowDivZero, RuntimeHelper::ThrowDivZero),
    (HelperLabel::ThrowNegativeSize, RuntimeHelper::ThrowNegativeSize),
    (HelperLabel::ThrowCast, RuntimeHelper::ThrowCast),
    (HelperLabel::ThrowNoMethod, RuntimeHelper::ThrowNoMethod),
    (HelperLabel::ThrowVerify, RuntimeHelper::ThrowVerify),
];

/// Emit the shared tails for every helper label that was branched to.
/// Throw tails build the exception and fall into exception dispatch; the
/// safepoint tail returns to its caller.
///
/// Guard sites stage the faulting guest pc in the scratch register before
/// branching here, so each tail starts by exporting it.
pub fn emit_helper_tails(
    sink: &mut Sink,
    labels: &mut Labels,
    table: &HelperTable,
    frame: &FrameLayout,
    cc: CallingConvention,
) -> Result<(), CompileError> {
    let args = cc.int_arg_regs();

    for (label, helper) in THROW_TAILS {
        if !labels.helper_used(label) {
            continue;
        }
        labels.bind_helper(sink.stream()?, label)?;
        emit_pc_slot_store(sink)?;
        // (frame, pc)
        sink.push(LirOp::MovRR32 {
            dst: args[1],
            src: SCRATCH,
        })?;
        sink.push(LirOp::MovRR {
            dst: args[0],
            src: GUEST_FRAME,
        })?;
        emit_raw_call(sink, table.get(helper), cc)?;
        labels.jmp_helper(sink.stream()?, HelperLabel::ExceptionDispatch)?;
    }

    if labels.helper_used(HelperLabel::SafepointCall) {
        labels.bind_helper(sink.stream()?, HelperLabel::SafepointCall)?;
        emit_pc_slot_store(sink)?;
        sink.push(LirOp::MovRR32 {
            dst: args[1],
            src: SCRATCH,
        })?;
        sink.push(LirOp::MovRR {
            dst: args[0],
            src: GUEST_FRAME,
        })?;
        // This tail is entered by `call`, so the stack sits 8 bytes off the
        // alignment the body maintains; rebalance around the inner call.
        sink.stream()?
            .emit_inst(&encoder::encode_sub_ri(Gpr::Rsp, 8))?;
        emit_raw_call(sink, table.get(RuntimeHelper::Suspend), cc)?;
        sink.stream()?
            .emit_inst(&encoder::encode_add_ri(Gpr::Rsp, 8))?;
        sink.stream()?.emit_inst(&encoder::encode_ret())?;
    }

    if labels.helper_used(HelperLabel::ExceptionDispatch) {
        labels.bind_helper(sink.stream()?, HelperLabel::ExceptionDispatch)?;
        sink.push(LirOp::MovRR {
            dst: args[0],
            src: GUEST_FRAME,
        })?;
        emit_raw_call(sink, table.get(RuntimeHelper::ExceptionDispatch), cc)?;
        // Dispatch unwinds; execution never falls through.
        sink.stream()?.emit_inst(&encoder::encode_ud2())?;
    }

    Ok(())
}

/// Store the staged pc (in the scratch register) to the frame's pc slot.
fn emit_pc_slot_store(sink: &mut Sink) -> Result<(), CompileError> {
    sink.push(LirOp::Store {
        mem: ClassedMem::new(
            crate::backend::x64::MemOperand::base_disp(GUEST_FRAME, crate::frame::GUEST_PC_OFFSET),
            MemClass::Header,
        ),
        src: SCRATCH,
        width: StoreWidth::W32,
    })
}

/// Call a fixed address through the scratch register, honoring shadow
/// space. Binding state is the caller's problem; tails run with everything
/// already flushed.
fn emit_raw_call(sink: &mut Sink, addr: u64, cc: CallingConvention) -> Result<(), CompileError> {
    let stream = sink.stream()?;
    let shadow = cc.shadow_space();
    if shadow != 0 {
        stream.emit_inst(&encoder::encode_sub_ri(Gpr::Rsp, shadow as i32))?;
    }
    stream.emit_inst(&encoder::encode_mov_ri64(SCRATCH, addr as i64))?;
    stream.emit_inst(&encoder::encode_call_r(SCRATCH))?;
    if shadow != 0 {
        stream.emit_inst(&encoder::encode_add_ri(Gpr::Rsp, shadow as i32))?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
