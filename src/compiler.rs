//! Trace compilation driver.
//!
//! Turns a decoded [`Trace`] into position-independent machine code plus the
//! side tables the runtime needs to install it: the data-section offset, the
//! chaining cells left for the external patcher, and the guest-pc map.
//!
//! Layout of a compiled trace, front to back:
//!
//! ```text
//!   prologue            save callee-saved registers, load the frame pointer
//!   body                lowered instructions, guest labels bound at branch
//!                       targets inside the trace
//!   helper tails        shared throw/safepoint/dispatch/epilogue stubs
//!   data section        switch tables and fill-array payloads
//!   exit stubs          one per unresolved guest pc: export pc, chain cell
//! ```
//!
//! The data section must precede the exit stubs: switch-table slots that name
//! a pc outside the trace resolve against the pc's exit stub, so the stub has
//! to be bound after the table reserves its slots.

use log::debug;
use rustc_hash::FxHashSet;

use crate::backend::x64::{encoder, CallingConvention, Gpr, GUEST_FRAME};
use crate::bytecode::{Opcode, Trace};
use crate::error::CompileError;
use crate::frame::FrameLayout;
use crate::helpers::{self, HelperTable};
use crate::labels::{ChainCell, ChainKind, HelperLabel, Labels};
use crate::lower::{self, Ctx};
use crate::regalloc::RegAlloc;
use crate::sched::Sink;
use crate::stream::CodeStream;

// =============================================================================
// Configuration
// =============================================================================

/// Knobs shared by every compilation a [`TraceCompiler`] runs.
pub struct CompilerConfig {
    /// Host calling convention for helper calls and the trace entry itself.
    pub cc: CallingConvention,
    /// Run the list scheduler over straight-line runs.
    pub scheduling: bool,
    /// Runtime helper entry points.
    pub helpers: HelperTable,
    /// Base address of the per-method resolution cache.
    pub cache_base: u64,
    /// Upper bound on emitted code size per trace.
    pub code_limit: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            cc: CallingConvention::host(),
            scheduling: true,
            helpers: HelperTable::new(),
            cache_base: 0,
            code_limit: CodeStream::DEFAULT_LIMIT,
        }
    }
}

// =============================================================================
// Output
// =============================================================================

/// A finished compilation, not yet mapped executable.
pub struct CompiledTrace {
    /// Machine code, position-independent except for the chain cells.
    pub code: Vec<u8>,
    /// Offset of the data section within `code`.
    pub data_offset: usize,
    /// Exit jumps the runtime rewrites to chain traces together.
    pub chain_cells: Vec<ChainCell>,
    /// Bound guest pcs and their code offsets, sorted by pc.
    pub guest_pc_map: Vec<(u32, usize)>,
    /// Spill slots the trace uses past the vreg area of the guest frame.
    pub spill_slots: u16,
}

impl CompiledTrace {
    /// Code offset a guest pc was bound at, if it was bound.
    pub fn code_offset_of(&self, pc: u32) -> Option<usize> {
        self.guest_pc_map
            .binary_search_by_key(&pc, |&(p, _)| p)
            .ok()
            .map(|i| self.guest_pc_map[i].1)
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Compiles traces one at a time against a fixed configuration.
pub struct TraceCompiler {
    config: CompilerConfig,
}

impl TraceCompiler {
    pub fn new(config: CompilerConfig) -> Self {
        TraceCompiler { config }
    }

    pub fn compile(&self, trace: &Trace) -> Result<CompiledTrace, CompileError> {
        debug!(
            "compiling trace at {:#x}: {} insns, {} vregs",
            trace.entry_pc,
            trace.insns.len(),
            trace.num_vregs
        );

        let cc = self.config.cc;
        let frame = FrameLayout::new(trace.num_vregs);
        let mut ra = RegAlloc::new(frame);
        let mut labels = Labels::new();
        let mut sink = Sink::new(
            CodeStream::with_limit(self.config.code_limit),
            self.config.scheduling,
        );
        let mut next_merge = 0u32;

        let saved = saved_regs(cc);
        emit_prologue(&mut sink, cc, &saved)?;

        // Guest labels can only be bound with clean register state, so the
        // target set has to be known before lowering starts.
        let targets = branch_targets(trace);
        for insn in &trace.insns {
            if targets.contains(&insn.pc) && labels.guest_offset(insn.pc).is_none() {
                ra.flush_and_invalidate(&mut sink)?;
                labels.bind_guest(sink.stream()?, insn.pc)?;
            }
            let mut ctx = Ctx {
                sink: &mut sink,
                ra: &mut ra,
                labels: &mut labels,
                helpers: &self.config.helpers,
                cc,
                cache_base: self.config.cache_base,
                switches: &trace.switches,
                payloads: &trace.payloads,
                entry_pc: trace.entry_pc,
                next_merge: &mut next_merge,
            };
            lower::lower_insn(&mut ctx, insn)?;
        }
        if let Some(pc) = trace.fallthrough {
            ra.flush_and_invalidate(&mut sink)?;
            labels.jmp_guest(sink.stream()?, pc)?;
        }

        helpers::emit_helper_tails(&mut sink, &mut labels, &self.config.helpers, &frame, cc)?;
        if labels.helper_used(HelperLabel::Epilogue) {
            labels.bind_helper(sink.stream()?, HelperLabel::Epilogue)?;
            emit_epilogue(&mut sink, &saved)?;
        }

        let data_offset = labels.emit_data(sink.stream()?)?;

        // Every guest pc still pending leaves the trace: give it a stub that
        // publishes the pc and jumps through a rewritable chain cell.
        for pc in labels.pending_guest_pcs() {
            labels.bind_guest(sink.stream()?, pc)?;
            helpers::export_pc(&mut sink, &frame, pc)?;
            let kind = if pc <= trace.entry_pc {
                ChainKind::BackEdge
            } else {
                ChainKind::Normal
            };
            labels.emit_chain_cell(sink.stream()?, kind, pc)?;
        }

        labels.finish()?;

        let guest_pc_map = labels.guest_pc_map();
        let chain_cells = labels.take_chain_cells();
        let spill_slots = ra.max_spill_slots();
        let stream = sink.into_stream()?;
        debug!(
            "trace at {:#x}: {} bytes, {} chain cells, {} spill slots",
            trace.entry_pc,
            stream.cursor(),
            chain_cells.len(),
            spill_slots
        );
        Ok(CompiledTrace {
            code: stream.into_bytes(),
            data_offset,
            chain_cells,
            guest_pc_map,
            spill_slots,
        })
    }
}

// =============================================================================
// Prologue and epilogue
// =============================================================================

fn saved_regs(cc: CallingConvention) -> Vec<Gpr> {
    cc.callee_saved_gprs()
        .iter()
        .filter(|&r| r != Gpr::Rsp)
        .collect()
}

/// Entry sequence. The trace is called with the guest frame pointer in the
/// first argument register; after the pushes RSP is realigned so every call
/// site in the body sees a 16-byte-aligned stack.
fn emit_prologue(
    sink: &mut Sink,
    cc: CallingConvention,
    saved: &[Gpr],
) -> Result<(), CompileError> {
    let stream = sink.stream()?;
    for &reg in saved {
        stream.emit_inst(&encoder::encode_push(reg))?;
    }
    if saved.len() % 2 == 0 {
        stream.emit_inst(&encoder::encode_sub_ri(Gpr::Rsp, 8))?;
    }
    stream.emit_inst(&encoder::encode_mov_rr(GUEST_FRAME, cc.int_arg_regs()[0]))?;
    Ok(())
}

/// Shared exit, bound at [`HelperLabel::Epilogue`]. RAX carries the guest
/// return value and is not among the saved registers, so the pops leave it
/// intact.
fn emit_epilogue(sink: &mut Sink, saved: &[Gpr]) -> Result<(), CompileError> {
    let stream = sink.stream()?;
    if saved.len() % 2 == 0 {
        stream.emit_inst(&encoder::encode_add_ri(Gpr::Rsp, 8))?;
    }
    for &reg in saved.iter().rev() {
        stream.emit_inst(&encoder::encode_pop(reg))?;
    }
    stream.emit_inst(&encoder::encode_ret())?;
    Ok(())
}

// =============================================================================
// Branch targets
// =============================================================================

/// Every guest pc the trace may branch to, including the entry (back edges
/// re-enter there, past the prologue).
fn branch_targets(trace: &Trace) -> FxHashSet<u32> {
    let mut set = FxHashSet::default();
    set.insert(trace.entry_pc);
    for insn in &trace.insns {
        match insn.opcode {
            Opcode::Goto | Opcode::If(_) | Opcode::IfZ(_) => {
                set.insert(insn.target);
            }
            Opcode::PackedSwitch | Opcode::SparseSwitch => {
                if let Some(table) = trace.switches.get(insn.imm as usize) {
                    set.extend(table.targets.iter().copied());
                    set.insert(table.default_target);
                }
            }
            _ => {}
        }
    }
    set
}

// =============================================================================
// Tests
// =============================================================================
