//! Instruction sink with an optional list scheduler.
//!
//! All straight-line emission funnels through [`Sink`]. With scheduling off
//! (the default) every record is encoded into the stream the moment it is
//! pushed, preserving emission order exactly. With scheduling on, records
//! buffer in a pending window; a flush builds the dependency graph over the
//! window and re-emits in priority order.
//!
//! Flush points are control-flow events: binding a label, emitting a branch
//! or call, or closing a block. The scheduler never moves an instruction
//! across a flush, and within a window it never reorders two accesses to
//! conflicting resources when either one writes.

use smallvec::SmallVec;

use crate::error::CompileError;
use crate::lir::{encode_lir, Lir, LirOp};
use crate::stream::CodeStream;

/// The emission funnel: code stream plus the pending scheduling window.
pub struct Sink {
    stream: CodeStream,
    pending: Vec<Lir>,
    scheduling: bool,
    next_slot: u32,
}

impl Sink {
    pub fn new(stream: CodeStream, scheduling: bool) -> Self {
        Sink {
            stream,
            pending: Vec::new(),
            scheduling,
            next_slot: 0,
        }
    }

    /// Emit one straight-line operation.
    pub fn push(&mut self, op: LirOp) -> Result<(), CompileError> {
        if self.scheduling {
            let slot = self.next_slot;
            self.next_slot += 1;
            self.pending.push(Lir::new(op, slot));
            Ok(())
        } else {
            self.stream.emit_inst(&encode_lir(&op))
        }
    }

    /// Drain the pending window into the stream. A no-op when nothing is
    /// buffered.
    pub fn flush(&mut self) -> Result<(), CompileError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let window = std::mem::take(&mut self.pending);
        let order = schedule(&window);
        for idx in order {
            self.stream.emit_inst(&encode_lir(&window[idx].op))?;
        }
        Ok(())
    }

    /// Flush and hand out the stream for control flow, label binds, or data
    /// emission. Going through here is what makes those events flush points.
    pub fn stream(&mut self) -> Result<&mut CodeStream, CompileError> {
        self.flush()?;
        Ok(&mut self.stream)
    }

    /// Current cursor. Only meaningful at a flush point.
    pub fn cursor(&mut self) -> Result<usize, CompileError> {
        self.flush()?;
        Ok(self.stream.cursor())
    }

    pub fn into_stream(mut self) -> Result<CodeStream, CompileError> {
        self.flush()?;
        Ok(self.stream)
    }
}

// =============================================================================
// List scheduling
// =============================================================================

/// Whether `later` must stay after `earlier`.
fn depends(earlier: &LirOp, later: &LirOp) -> bool {
    let ew = earlier.writes();
    let lw = later.writes();
    let lr = later.reads();
    // RAW and WAW against the earlier instruction's writes.
    for w in &ew {
        if lr.iter().chain(lw.iter()).any(|r| w.conflicts(*r)) {
            return true;
        }
    }
    // WAR: the later write must not overtake the earlier read.
    let er = earlier.reads();
    for r in &er {
        if lw.iter().any(|w| r.conflicts(*w)) {
            return true;
        }
    }
    false
}

/// Order a window: longest-path-to-exit priority, ready-list selection,
/// creation slot as the tiebreaker. Returns indices into the window.
fn schedule(window: &[Lir]) -> Vec<usize> {
    let n = window.len();
    let mut succs: Vec<SmallVec<[u32; 4]>> = vec![SmallVec::new(); n];
    let mut npreds = vec![0u32; n];
    for i in 0..n {
        for j in (i + 1)..n {
            if depends(&window[i].op, &window[j].op) {
                succs[i].push(j as u32);
                npreds[j] += 1;
            }
        }
    }

    // Longest path to the window exit; edges only point forward, so a single
    // reverse sweep suffices.
    let mut priority = vec![1u32; n];
    for i in (0..n).rev() {
        for &s in &succs[i] {
            priority[i] = priority[i].max(1 + priority[s as usize]);
        }
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| npreds[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(pos) = pick(&ready, &priority, window) {
        let i = ready.swap_remove(pos);
        order.push(i);
        for &s in &succs[i] {
            npreds[s as usize] -= 1;
            if npreds[s as usize] == 0 {
                ready.push(s as usize);
            }
        }
    }
    debug_assert_eq!(order.len(), n);
    order
}

/// Highest priority wins; earlier creation slot breaks ties.
fn pick(ready: &[usize], priority: &[u32], window: &[Lir]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (pos, &i) in ready.iter().enumerate() {
        match best {
            None => best = Some(pos),
            Some(b) => {
                let bi = ready[b];
                let better = priority[i] > priority[bi]
                    || (priority[i] == priority[bi] && window[i].slot < window[bi].slot);
                if better {
                    best = Some(pos);
                }
            }
        }
    }
    best
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::{Gpr, MemOperand, GUEST_FRAME};
    use crate::bytecode::VReg;
    use crate::lir::{AluOp, ClassedMem, LoadKind, MemClass, StoreWidth};

    fn slot(v: u16) -> ClassedMem {
        ClassedMem::new(
            MemOperand::base_disp(GUEST_FRAME, 32 + v as i32 * 8),
            MemClass::GuestSlot(VReg(v)),
        )
    }

    fn emit_all(scheduling: bool, ops: &[LirOp]) -> Vec<u8> {
        let mut sink = Sink::new(CodeStream::new(), scheduling);
        for op in ops {
            sink.push(*op).unwrap();
        }
        sink.into_stream().unwrap().into_bytes()
    }

    #[test]
    fn disabled_preserves_order() {
        let ops = [
            LirOp::LoadImm32 { dst: Gpr::Rax, imm: 1 },
            LirOp::LoadImm32 { dst: Gpr::Rcx, imm: 2 },
            LirOp::Alu { op: AluOp::Add, dst: Gpr::Rax, src: Gpr::Rcx },
        ];
        let mut expected = Vec::new();
        for op in &ops {
            expected.extend_from_slice(encode_lir(op).as_slice());
        }
        assert_eq!(emit_all(false, &ops), expected);
    }

    #[test]
    fn dependent_chain_keeps_order_when_scheduled() {
        let ops = [
            LirOp::Load { dst: Gpr::Rax, mem: slot(0), kind: LoadKind::W64 },
            LirOp::Alu { op: AluOp::Add, dst: Gpr::Rax, src: Gpr::Rax },
            LirOp::Store { mem: slot(0), src: Gpr::Rax, width: StoreWidth::W64 },
        ];
        assert_eq!(emit_all(true, &ops), emit_all(false, &ops));
    }

    #[test]
    fn store_load_same_slot_never_reorders() {
        let ops = [
            LirOp::Store { mem: slot(1), src: Gpr::Rax, width: StoreWidth::W64 },
            LirOp::Load { dst: Gpr::Rcx, mem: slot(1), kind: LoadKind::W64 },
        ];
        assert_eq!(emit_all(true, &ops), emit_all(false, &ops));
    }

    #[test]
    fn disjoint_slots_may_reorder_by_priority() {
        // The rdx chain is three deep, so its head schedules before the
        // independent add even though the add was created first.
        let ops = [
            LirOp::Alu { op: AluOp::Add, dst: Gpr::Rax, src: Gpr::Rcx },
            LirOp::LoadImm32 { dst: Gpr::Rdx, imm: 7 },
            LirOp::Alu { op: AluOp::Add, dst: Gpr::Rdx, src: Gpr::Rbx },
            LirOp::Alu { op: AluOp::Add, dst: Gpr::Rdx, src: Gpr::Rax },
        ];
        let scheduled = emit_all(true, &ops);
        let reordered = [ops[1], ops[0], ops[2], ops[3]];
        let mut expected = Vec::new();
        for op in &reordered {
            expected.extend_from_slice(encode_lir(op).as_slice());
        }
        assert_eq!(scheduled, expected);
    }

    #[test]
    fn unclassified_store_blocks_slot_load() {
        // A store through an arbitrary pointer may alias any slot.
        let arb = ClassedMem::unclassified(MemOperand::base(Gpr::Rdi));
        let ops = [
            LirOp::Store { mem: arb, src: Gpr::Rax, width: StoreWidth::W32 },
            LirOp::Load { dst: Gpr::Rcx, mem: slot(4), kind: LoadKind::W64 },
        ];
        assert_eq!(emit_all(true, &ops), emit_all(false, &ops));
    }

    #[test]
    fn flush_is_a_barrier() {
        let mut sink = Sink::new(CodeStream::new(), true);
        // Deep chain after the flush must not migrate before it.
        sink.push(LirOp::LoadImm32 { dst: Gpr::Rax, imm: 1 }).unwrap();
        let cursor = sink.cursor().unwrap();
        assert!(cursor > 0);
        sink.push(LirOp::LoadImm32 { dst: Gpr::Rcx, imm: 2 }).unwrap();
        let bytes = sink.into_stream().unwrap().into_bytes();
        assert_eq!(&bytes[..cursor], encode_lir(&LirOp::LoadImm32 { dst: Gpr::Rax, imm: 1 }).as_slice());
    }

    #[test]
    fn flags_writers_keep_relative_order() {
        let ops = [
            LirOp::Alu { op: AluOp::Add, dst: Gpr::Rax, src: Gpr::Rcx },
            LirOp::CmpRI { a: Gpr::Rdx, imm: 0 },
        ];
        // WAW on flags: the compare must stay last so a following branch
        // sees its result.
        assert_eq!(emit_all(true, &ops), emit_all(false, &ops));
    }
}
