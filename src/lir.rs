//! Abstract instruction records.
//!
//! The lowering engine does not write straight-line instructions into the
//! code stream directly; it produces [`Lir`] records so the scheduler can
//! buffer and reorder them. Each record knows how to encode itself and can
//! summarize the resources it reads and writes, which is all the dependency
//! analysis needs. Control flow is never represented here: branches, calls
//! and label binds are scheduler flush points and go straight to the stream.
//!
//! Memory operands carry a classification so the scheduler can tell disjoint
//! guest slots apart instead of treating all of memory as one resource.

use smallvec::SmallVec;

use crate::backend::x64::encoder::{self, Condition, EncodedInst};
use crate::backend::x64::{Gpr, MemOperand};
use crate::bytecode::VReg;

// =============================================================================
// Memory classification
// =============================================================================

/// What a memory operand is known to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemClass {
    /// Home slot of a guest virtual register.
    GuestSlot(VReg),
    /// Compiler-owned spill slot.
    Spill(u16),
    /// Fixed frame header field (guest pc, suspend count, ...).
    Header,
    /// Anything else: object fields, array elements, cache slots. Aliases
    /// every other memory class.
    Unclassified,
}

impl MemClass {
    /// Whether two classified accesses may touch the same bytes.
    #[inline]
    pub fn may_alias(self, other: MemClass) -> bool {
        match (self, other) {
            (MemClass::Unclassified, _) | (_, MemClass::Unclassified) => true,
            (MemClass::GuestSlot(a), MemClass::GuestSlot(b)) => a == b,
            (MemClass::Spill(a), MemClass::Spill(b)) => a == b,
            (MemClass::Header, MemClass::Header) => true,
            _ => false,
        }
    }
}

/// A memory operand together with its classification.
#[derive(Debug, Clone, Copy)]
pub struct ClassedMem {
    pub mem: MemOperand,
    pub class: MemClass,
}

impl ClassedMem {
    #[inline]
    pub const fn new(mem: MemOperand, class: MemClass) -> Self {
        ClassedMem { mem, class }
    }

    #[inline]
    pub const fn unclassified(mem: MemOperand) -> Self {
        ClassedMem {
            mem,
            class: MemClass::Unclassified,
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

/// ALU operations sharing the OP r,r / OP r,imm encoding shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftKind {
    Shl,
    Shr,
    Sar,
}

/// Load shape: destination width and extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    U8,
    S8,
    U16,
    S16,
    /// 32-bit load, zero-extending.
    W32,
    /// 32-bit load, sign-extending (switch-table entries).
    S32,
    W64,
}

/// Store width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreWidth {
    W8,
    W16,
    W32,
    W64,
}

/// A straight-line operation. One variant per encoding shape the lowering
/// engine emits.
#[derive(Debug, Clone, Copy)]
pub enum LirOp {
    MovRR { dst: Gpr, src: Gpr },
    MovRR32 { dst: Gpr, src: Gpr },
    Load { dst: Gpr, mem: ClassedMem, kind: LoadKind },
    Store { mem: ClassedMem, src: Gpr, width: StoreWidth },
    LoadImm64 { dst: Gpr, imm: i64 },
    LoadImm32 { dst: Gpr, imm: u32 },
    Lea { dst: Gpr, mem: ClassedMem },
    Alu { op: AluOp, dst: Gpr, src: Gpr },
    AluImm { op: AluOp, dst: Gpr, imm: i32 },
    Imul { dst: Gpr, src: Gpr },
    ImulImm { dst: Gpr, src: Gpr, imm: i32 },
    Cqo,
    Idiv { src: Gpr },
    Neg { dst: Gpr },
    Not { dst: Gpr },
    Movsxd { dst: Gpr, src: Gpr },
    ShiftImm { kind: ShiftKind, dst: Gpr, imm: u8 },
    ShiftCl { kind: ShiftKind, dst: Gpr },
    CmpRR { a: Gpr, b: Gpr },
    CmpRI { a: Gpr, imm: i32 },
    CmpRM { a: Gpr, mem: ClassedMem },
    CmpMI8 { mem: ClassedMem, imm: i8 },
    TestRR { a: Gpr, b: Gpr },
    Setcc { cond: Condition, dst: Gpr },
    MovzxByte { dst: Gpr, src: Gpr },
    Nop,
}

// =============================================================================
// Resource summaries
// =============================================================================

/// A schedulable resource: a physical register, the flags, or a classified
/// memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Reg(Gpr),
    Flags,
    Mem(MemClass),
}

impl Resource {
    /// Conflict test. Register and flags resources conflict on equality;
    /// memory resources defer to [`MemClass::may_alias`].
    #[inline]
    pub fn conflicts(self, other: Resource) -> bool {
        match (self, other) {
            (Resource::Reg(a), Resource::Reg(b)) => a == b,
            (Resource::Flags, Resource::Flags) => true,
            (Resource::Mem(a), Resource::Mem(b)) => a.may_alias(b),
            _ => false,
        }
    }
}

pub type ResourceList = SmallVec<[Resource; 4]>;

fn push_mem_reads(out: &mut ResourceList, mem: &ClassedMem) {
    if let Some(base) = mem.mem.base {
        out.push(Resource::Reg(base));
    }
    if let Some(index) = mem.mem.index {
        out.push(Resource::Reg(index));
    }
}

impl LirOp {
    /// Resources this operation reads.
    pub fn reads(&self) -> ResourceList {
        let mut out = ResourceList::new();
        match *self {
            LirOp::MovRR { src, .. } | LirOp::MovRR32 { src, .. } => {
                out.push(Resource::Reg(src));
            }
            LirOp::Load { ref mem, .. } => {
                push_mem_reads(&mut out, mem);
                out.push(Resource::Mem(mem.class));
            }
            LirOp::Store { ref mem, src, .. } => {
                out.push(Resource::Reg(src));
                push_mem_reads(&mut out, mem);
            }
            LirOp::LoadImm64 { .. } | LirOp::LoadImm32 { .. } | LirOp::Nop => {}
            LirOp::Lea { ref mem, .. } => push_mem_reads(&mut out, mem),
            LirOp::Alu { dst, src, .. } | LirOp::Imul { dst, src } => {
                out.push(Resource::Reg(dst));
                out.push(Resource::Reg(src));
            }
            LirOp::AluImm { dst, .. }
            | LirOp::Neg { dst }
            | LirOp::Not { dst }
            | LirOp::ShiftImm { dst, .. } => {
                out.push(Resource::Reg(dst));
            }
            LirOp::ImulImm { src, .. } => out.push(Resource::Reg(src)),
            LirOp::Cqo => out.push(Resource::Reg(Gpr::Rax)),
            LirOp::Idiv { src } => {
                out.push(Resource::Reg(Gpr::Rax));
                out.push(Resource::Reg(Gpr::Rdx));
                out.push(Resource::Reg(src));
            }
            LirOp::Movsxd { src, .. } | LirOp::MovzxByte { src, .. } => {
                out.push(Resource::Reg(src));
            }
            LirOp::ShiftCl { dst, .. } => {
                out.push(Resource::Reg(dst));
                out.push(Resource::Reg(Gpr::Rcx));
            }
            LirOp::CmpRR { a, b } | LirOp::TestRR { a, b } => {
                out.push(Resource::Reg(a));
                out.push(Resource::Reg(b));
            }
            LirOp::CmpRI { a, .. } => out.push(Resource::Reg(a)),
            LirOp::CmpRM { a, ref mem } => {
                out.push(Resource::Reg(a));
                push_mem_reads(&mut out, mem);
                out.push(Resource::Mem(mem.class));
            }
            LirOp::CmpMI8 { ref mem, .. } => {
                push_mem_reads(&mut out, mem);
                out.push(Resource::Mem(mem.class));
            }
            LirOp::Setcc { .. } => out.push(Resource::Flags),
        }
        out
    }

    /// Resources this operation writes.
    pub fn writes(&self) -> ResourceList {
        let mut out = ResourceList::new();
        match *self {
            LirOp::MovRR { dst, .. }
            | LirOp::MovRR32 { dst, .. }
            | LirOp::Load { dst, .. }
            | LirOp::LoadImm64 { dst, .. }
            | LirOp::LoadImm32 { dst, .. }
            | LirOp::Lea { dst, .. }
            | LirOp::Movsxd { dst, .. }
            | LirOp::MovzxByte { dst, .. }
            | LirOp::Not { dst } => {
                out.push(Resource::Reg(dst));
            }
            LirOp::Store { ref mem, .. } => out.push(Resource::Mem(mem.class)),
            LirOp::Alu { dst, .. }
            | LirOp::AluImm { dst, .. }
            | LirOp::Imul { dst, .. }
            | LirOp::ImulImm { dst, .. }
            | LirOp::Neg { dst }
            | LirOp::ShiftImm { dst, .. }
            | LirOp::ShiftCl { dst, .. } => {
                out.push(Resource::Reg(dst));
                out.push(Resource::Flags);
            }
            LirOp::Cqo => out.push(Resource::Reg(Gpr::Rdx)),
            LirOp::Idiv { .. } => {
                out.push(Resource::Reg(Gpr::Rax));
                out.push(Resource::Reg(Gpr::Rdx));
                out.push(Resource::Flags);
            }
            LirOp::CmpRR { .. }
            | LirOp::CmpRI { .. }
            | LirOp::CmpRM { .. }
            | LirOp::CmpMI8 { .. }
            | LirOp::TestRR { .. } => out.push(Resource::Flags),
            LirOp::Setcc { dst, .. } => out.push(Resource::Reg(dst)),
            LirOp::Nop => {}
        }
        out
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encode one straight-line operation.
pub fn encode_lir(op: &LirOp) -> EncodedInst {
    match *op {
        LirOp::MovRR { dst, src } => encoder::encode_mov_rr(dst, src),
        LirOp::MovRR32 { dst, src } => encoder::encode_mov_rr32(dst, src),
        LirOp::Load { dst, ref mem, kind } => match kind {
            LoadKind::U8 => encoder::encode_movzx_rm8(dst, &mem.mem),
            LoadKind::S8 => encoder::encode_movsx_rm8(dst, &mem.mem),
            LoadKind::U16 => encoder::encode_movzx_rm16(dst, &mem.mem),
            LoadKind::S16 => encoder::encode_movsx_rm16(dst, &mem.mem),
            LoadKind::W32 => encoder::encode_mov_rm32(dst, &mem.mem),
            LoadKind::S32 => encoder::encode_movsxd_rm(dst, &mem.mem),
            LoadKind::W64 => encoder::encode_mov_rm(dst, &mem.mem),
        },
        LirOp::Store { ref mem, src, width } => match width {
            StoreWidth::W8 => encoder::encode_mov_mr8(&mem.mem, src),
            StoreWidth::W16 => encoder::encode_mov_mr16(&mem.mem, src),
            StoreWidth::W32 => encoder::encode_mov_mr32(&mem.mem, src),
            StoreWidth::W64 => encoder::encode_mov_mr(&mem.mem, src),
        },
        LirOp::LoadImm64 { dst, imm } => encoder::encode_mov_ri64(dst, imm),
        LirOp::LoadImm32 { dst, imm } => encoder::encode_mov_ri32(dst, imm),
        LirOp::Lea { dst, ref mem } => encoder::encode_lea(dst, &mem.mem),
        LirOp::Alu { op, dst, src } => match op {
            AluOp::Add => encoder::encode_add_rr(dst, src),
            AluOp::Sub => encoder::encode_sub_rr(dst, src),
            AluOp::And => encoder::encode_and_rr(dst, src),
            AluOp::Or => encoder::encode_or_rr(dst, src),
            AluOp::Xor => encoder::encode_xor_rr(dst, src),
        },
        LirOp::AluImm { op, dst, imm } => match op {
            AluOp::Add => encoder::encode_add_ri(dst, imm),
            AluOp::Sub => encoder::encode_sub_ri(dst, imm),
            AluOp::And => encoder::encode_and_ri(dst, imm),
            AluOp::Or => encoder::encode_or_ri(dst, imm),
            AluOp::Xor => encoder::encode_xor_ri(dst, imm),
        },
        LirOp::Imul { dst, src } => encoder::encode_imul_rr(dst, src),
        LirOp::ImulImm { dst, src, imm } => encoder::encode_imul_rri(dst, src, imm),
        LirOp::Cqo => encoder::encode_cqo(),
        LirOp::Idiv { src } => encoder::encode_idiv(src),
        LirOp::Neg { dst } => encoder::encode_neg(dst),
        LirOp::Not { dst } => encoder::encode_not(dst),
        LirOp::Movsxd { dst, src } => encoder::encode_movsxd(dst, src),
        LirOp::ShiftImm { kind, dst, imm } => match kind {
            ShiftKind::Shl => encoder::encode_shl_ri(dst, imm),
            ShiftKind::Shr => encoder::encode_shr_ri(dst, imm),
            ShiftKind::Sar => encoder::encode_sar_ri(dst, imm),
        },
        LirOp::ShiftCl { kind, dst } => match kind {
            ShiftKind::Shl => encoder::encode_shl_cl(dst),
            ShiftKind::Shr => encoder::encode_shr_cl(dst),
            ShiftKind::Sar => encoder::encode_sar_cl(dst),
        },
        LirOp::CmpRR { a, b } => encoder::encode_cmp_rr(a, b),
        LirOp::CmpRI { a, imm } => encoder::encode_cmp_ri(a, imm),
        LirOp::CmpRM { a, ref mem } => encoder::encode_cmp_rm(a, &mem.mem),
        LirOp::CmpMI8 { ref mem, imm } => encoder::encode_cmp_mi8(&mem.mem, imm),
        LirOp::TestRR { a, b } => encoder::encode_test_rr(a, b),
        LirOp::Setcc { cond, dst } => encoder::encode_setcc(cond, dst),
        LirOp::MovzxByte { dst, src } => encoder::encode_movzx_rb(dst, src),
        LirOp::Nop => encoder::encode_nop(),
    }
}

/// A buffered instruction record with the scheduler's bookkeeping fields.
#[derive(Debug, Clone, Copy)]
pub struct Lir {
    pub op: LirOp,
    /// Creation order within the current pending window; the tiebreaker.
    pub slot: u32,
    /// Longest path to the window exit, filled in by the scheduler.
    pub priority: u32,
    /// Unscheduled predecessor count during list scheduling.
    pub ready: u32,
}

impl Lir {
    pub const fn new(op: LirOp, slot: u32) -> Self {
        Lir {
            op,
            slot,
            priority: 0,
            ready: 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::x64::GUEST_FRAME;

    fn slot(vreg: u16, disp: i32) -> ClassedMem {
        ClassedMem::new(
            MemOperand::base_disp(GUEST_FRAME, disp),
            MemClass::GuestSlot(VReg(vreg)),
        )
    }

    #[test]
    fn mem_class_aliasing() {
        let a = MemClass::GuestSlot(VReg(1));
        let b = MemClass::GuestSlot(VReg(2));
        assert!(!a.may_alias(b));
        assert!(a.may_alias(a));
        assert!(MemClass::Unclassified.may_alias(a));
        assert!(a.may_alias(MemClass::Unclassified));
        assert!(!MemClass::Spill(0).may_alias(MemClass::Spill(1)));
        assert!(!a.may_alias(MemClass::Header));
    }

    #[test]
    fn load_reads_slot_and_base() {
        let op = LirOp::Load {
            dst: Gpr::Rax,
            mem: slot(3, 56),
            kind: LoadKind::W64,
        };
        let reads = op.reads();
        assert!(reads.contains(&Resource::Reg(GUEST_FRAME)));
        assert!(reads.contains(&Resource::Mem(MemClass::GuestSlot(VReg(3)))));
        assert_eq!(op.writes().as_slice(), &[Resource::Reg(Gpr::Rax)]);
    }

    #[test]
    fn store_writes_slot_only() {
        let op = LirOp::Store {
            mem: slot(1, 40),
            src: Gpr::Rcx,
            width: StoreWidth::W64,
        };
        assert_eq!(
            op.writes().as_slice(),
            &[Resource::Mem(MemClass::GuestSlot(VReg(1)))]
        );
        assert!(op.reads().contains(&Resource::Reg(Gpr::Rcx)));
    }

    #[test]
    fn alu_touches_flags() {
        let op = LirOp::Alu {
            op: AluOp::Add,
            dst: Gpr::Rax,
            src: Gpr::Rcx,
        };
        assert!(op.writes().contains(&Resource::Flags));
        let cmp = LirOp::CmpRR {
            a: Gpr::Rax,
            b: Gpr::Rcx,
        };
        assert_eq!(cmp.writes().as_slice(), &[Resource::Flags]);
    }

    #[test]
    fn idiv_implicit_operands() {
        let op = LirOp::Idiv { src: Gpr::Rcx };
        let reads = op.reads();
        assert!(reads.contains(&Resource::Reg(Gpr::Rax)));
        assert!(reads.contains(&Resource::Reg(Gpr::Rdx)));
        let writes = op.writes();
        assert!(writes.contains(&Resource::Reg(Gpr::Rax)));
        assert!(writes.contains(&Resource::Reg(Gpr::Rdx)));
    }

    #[test]
    fn encode_matches_encoder() {
        let op = LirOp::Alu {
            op: AluOp::Add,
            dst: Gpr::Rax,
            src: Gpr::Rcx,
        };
        assert_eq!(encode_lir(&op).as_slice(), &[0x48, 0x01, 0xC8]);

        let op = LirOp::Load {
            dst: Gpr::Rax,
            mem: slot(0, -16),
            kind: LoadKind::W64,
        };
        assert_eq!(encode_lir(&op).as_slice(), &[0x48, 0x8B, 0x45, 0xF0]);
    }
}
